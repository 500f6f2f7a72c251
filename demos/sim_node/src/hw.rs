//! Host stand-ins for the board peripherals and the fieldbus module
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fieldlink_node::common::{
    adi::{update_write_pd, write_pd_size, AdiEntry, DefaultMap},
    gray::binary_to_gray,
    traits::{CountdownTimer, Monotonic, OutputPin, SsiMaster},
    AppStatus, CommReadiness,
};
use fieldlink_node::link::{DriverError, FieldbusDriver};

pub struct StdClock {
    epoch: Instant,
}

impl StdClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for StdClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Monotonic for StdClock {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }
}

struct EncoderState {
    frame_width: u8,
    position: u32,
    step: u32,
    glitch_every: Option<u32>,
    reads: u32,
    in_flight: Option<u16>,
}

/// An encoder on a shaft turning at constant speed
///
/// The position advances by `step` counts on every read.
#[derive(Clone)]
pub struct RotatingEncoder(Arc<Mutex<EncoderState>>);

impl RotatingEncoder {
    pub fn new(start: u32, step: u32, glitch_every: Option<u32>) -> Self {
        Self(Arc::new(Mutex::new(EncoderState {
            frame_width: 15,
            position: start,
            step,
            glitch_every,
            reads: 0,
            in_flight: None,
        })))
    }

    pub fn reads(&self) -> u32 {
        self.0.lock().unwrap().reads
    }

    fn clock_frame(&self) -> u16 {
        let mut s = self.0.lock().unwrap();
        s.reads += 1;
        let payload_mask = (1u32 << (s.frame_width - 2)) - 1;
        s.position = s.position.wrapping_add(s.step) & payload_mask;
        let leading = 1u32 << (s.frame_width - 1);
        let mut frame = (leading | (binary_to_gray(s.position) << 1)) as u16;
        if let Some(n) = s.glitch_every {
            if n > 0 && s.reads % n == 0 {
                frame |= 1;
            }
        }
        frame
    }
}

impl SsiMaster for RotatingEncoder {
    fn configure(&mut self, bit_rate: u32, frame_width: u8) {
        log::debug!("SSI configured: {} Hz, {} bit frames", bit_rate, frame_width);
        self.0.lock().unwrap().frame_width = frame_width;
    }

    fn is_busy(&self) -> bool {
        false
    }

    fn transfer_one(&mut self, _word: u16) -> u16 {
        self.clock_frame()
    }

    fn start_transfer(&mut self, _word: u16) {
        let frame = self.clock_frame();
        self.0.lock().unwrap().in_flight = Some(frame);
    }

    fn finish_transfer(&mut self) -> Option<u16> {
        self.0.lock().unwrap().in_flight.take()
    }

    fn abort_transfer(&mut self) -> bool {
        self.0.lock().unwrap().in_flight.take().is_some()
    }
}

/// A countdown whose expiry is polled by a background task
#[derive(Clone, Default)]
pub struct SimTimer {
    deadline: Arc<Mutex<Option<Instant>>>,
}

impl SimTimer {
    /// Returns true if the countdown has run out and its interrupt is pending
    pub fn expired(&self) -> bool {
        matches!(*self.deadline.lock().unwrap(), Some(at) if Instant::now() >= at)
    }
}

impl CountdownTimer for SimTimer {
    fn start(&mut self, duration: Duration) {
        *self.deadline.lock().unwrap() = Some(Instant::now() + duration);
    }

    fn stop(&mut self) {
        *self.deadline.lock().unwrap() = None;
    }

    fn is_running(&self) -> bool {
        self.deadline.lock().unwrap().is_some()
    }

    fn remaining(&self) -> Duration {
        match *self.deadline.lock().unwrap() {
            Some(at) => at.saturating_duration_since(Instant::now()),
            None => Duration::ZERO,
        }
    }

    fn clear_interrupt(&mut self) {
        self.stop();
    }
}

#[derive(Default)]
pub struct ConsoleLed {
    on: bool,
}

impl OutputPin for ConsoleLed {
    fn set(&mut self, high: bool) {
        if high != self.on {
            log::debug!("LED {}", if high { "on" } else { "off" });
        }
        self.on = high;
    }

    fn is_set_high(&self) -> bool {
        self.on
    }
}

/// A fieldbus module which becomes ready a fixed time after the driver starts
pub struct SimModule {
    present: bool,
    ready_delay: Duration,
    started: Option<Instant>,
    app_status: AppStatus,
    map: Vec<DefaultMap>,
    image: Vec<u8>,
    updates: u64,
    events: u64,
}

impl SimModule {
    pub fn new(present: bool, ready_delay: Duration) -> Self {
        Self {
            present,
            ready_delay,
            started: None,
            app_status: AppStatus::NotSynced,
            map: Vec::new(),
            image: Vec::new(),
            updates: 0,
            events: 0,
        }
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }

    pub fn events(&self) -> u64 {
        self.events
    }

    pub fn image(&self) -> &[u8] {
        &self.image
    }
}

impl FieldbusDriver for SimModule {
    fn setup_hardware(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    fn module_detect(&mut self) -> bool {
        self.present
    }

    fn init_data_objects(
        &mut self,
        adis: &[AdiEntry],
        default_map: &[DefaultMap],
    ) -> Result<(), DriverError> {
        for adi in adis {
            log::info!(
                "ADI {} '{}': {:?} x{}",
                adi.index,
                adi.name,
                adi.data_type,
                adi.num_elements
            );
        }
        self.map = default_map.to_vec();
        self.image = vec![0; write_pd_size(adis, default_map)];
        Ok(())
    }

    fn start_driver(&mut self, startup_timeout: Duration) -> Result<(), DriverError> {
        if self.ready_delay > startup_timeout {
            log::warn!(
                "Module ready delay {:?} exceeds the startup timeout {:?}",
                self.ready_delay,
                startup_timeout
            );
        }
        self.started = Some(Instant::now());
        Ok(())
    }

    fn poll_communication_ready(&mut self) -> CommReadiness {
        match self.started {
            Some(at) if at.elapsed() >= self.ready_delay => CommReadiness::Ready,
            _ => CommReadiness::NotReady,
        }
    }

    fn run_driver_once(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    fn trigger_write_process_data_update(&mut self, adis: &[AdiEntry]) {
        if update_write_pd(adis, &self.map, &mut self.image).is_none() {
            log::warn!("Write process data image does not fit the default map");
            return;
        }
        self.updates += 1;
        if self.updates % 1000 == 0 {
            log::info!("Write PD #{}: {:02x?}", self.updates, self.image);
        }
    }

    fn set_app_status(&mut self, status: AppStatus) {
        log::info!("Application status {:?} -> {:?}", self.app_status, status);
        self.app_status = status;
    }

    fn handle_events(&mut self, events: u16) -> Result<(), DriverError> {
        log::trace!("Module events {:#04x}", events);
        self.events += 1;
        Ok(())
    }
}
