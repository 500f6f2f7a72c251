//! Simulated peripherals and fieldbus module
//!
//! Every simulator is a cheap handle around shared state, so a test can keep a clone for
//! inspection and fault injection after moving the original into the code under test.
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use fieldlink_common::{
    adi::{update_write_pd, write_pd_size, AdiEntry, DefaultMap},
    gray::binary_to_gray,
    traits::{CountdownTimer, Monotonic, OutputPin, SsiMaster},
    AppStatus, CommReadiness,
};
use fieldlink_node::link::{DriverError, FieldbusDriver};

#[derive(Debug, Default)]
pub struct EncoderState {
    /// Current shaft position
    pub position: u32,
    /// Number of upcoming frames delivered with the trailing guard bit set
    pub glitches: usize,
    /// A disconnected encoder leaves the data line low
    pub disconnected: bool,
    pub bit_rate: u32,
    pub frame_width: u8,
    pub transfers: usize,
    in_flight: Option<u16>,
    completed: bool,
}

impl EncoderState {
    fn next_frame(&mut self) -> u16 {
        self.transfers += 1;
        if self.disconnected || self.frame_width < 3 {
            return 0;
        }
        let payload_bits = self.frame_width - 2;
        let position = self.position & ((1 << payload_bits) - 1);
        let leading = 1u32 << (self.frame_width - 1);
        let mut frame = (leading | (binary_to_gray(position) << 1)) as u16;
        if self.glitches > 0 {
            self.glitches -= 1;
            frame |= 1;
        }
        frame
    }
}

/// An SSI peripheral with an absolute encoder attached
#[derive(Debug, Clone, Default)]
pub struct SimSsiBus(Arc<Mutex<EncoderState>>);

impl SimSsiBus {
    pub fn new(position: u32) -> Self {
        let bus = Self::default();
        bus.state().position = position;
        bus
    }

    pub fn state(&self) -> MutexGuard<'_, EncoderState> {
        self.0.lock().unwrap()
    }

    pub fn set_position(&self, position: u32) {
        self.state().position = position;
    }

    /// Corrupt the next `count` frames
    pub fn inject_glitches(&self, count: usize) {
        self.state().glitches = count;
    }

    pub fn set_disconnected(&self, disconnected: bool) {
        self.state().disconnected = disconnected;
    }

    pub fn transfers(&self) -> usize {
        self.state().transfers
    }

    /// Finish clocking an asynchronous transfer, as if the last bit had just been received
    ///
    /// Returns false if no transfer was in flight.
    pub fn complete_transfer(&self) -> bool {
        let mut state = self.state();
        if state.in_flight.is_some() && !state.completed {
            state.completed = true;
            true
        } else {
            false
        }
    }
}

impl SsiMaster for SimSsiBus {
    fn configure(&mut self, bit_rate: u32, frame_width: u8) {
        let mut state = self.state();
        state.bit_rate = bit_rate;
        state.frame_width = frame_width;
    }

    fn is_busy(&self) -> bool {
        let state = self.state();
        state.in_flight.is_some() && !state.completed
    }

    fn transfer_one(&mut self, _word: u16) -> u16 {
        self.state().next_frame()
    }

    fn start_transfer(&mut self, _word: u16) {
        let mut state = self.state();
        let frame = state.next_frame();
        state.in_flight = Some(frame);
        state.completed = false;
    }

    fn finish_transfer(&mut self) -> Option<u16> {
        let mut state = self.state();
        if !state.completed {
            return None;
        }
        state.completed = false;
        state.in_flight.take()
    }

    fn abort_transfer(&mut self) -> bool {
        let mut state = self.state();
        let stopped = state.in_flight.take().is_some() && !state.completed;
        state.completed = false;
        stopped
    }
}

#[derive(Debug, Default)]
pub struct CountdownState {
    pub running: bool,
    pub loaded: Duration,
    pub starts: usize,
    pub stops: usize,
}

/// A one-shot countdown timer which only expires when told to
#[derive(Debug, Clone, Default)]
pub struct SimCountdown(Arc<Mutex<CountdownState>>);

impl SimCountdown {
    pub fn state(&self) -> MutexGuard<'_, CountdownState> {
        self.0.lock().unwrap()
    }

    pub fn is_armed(&self) -> bool {
        self.state().running
    }
}

impl CountdownTimer for SimCountdown {
    fn start(&mut self, duration: Duration) {
        let mut state = self.state();
        state.running = true;
        state.loaded = duration;
        state.starts += 1;
    }

    fn stop(&mut self) {
        let mut state = self.state();
        state.running = false;
        state.stops += 1;
    }

    fn is_running(&self) -> bool {
        self.state().running
    }

    fn remaining(&self) -> Duration {
        let state = self.state();
        if state.running {
            state.loaded
        } else {
            Duration::ZERO
        }
    }

    fn clear_interrupt(&mut self) {
        self.state().running = false;
    }
}

#[derive(Debug, Default)]
pub struct PinState {
    pub high: bool,
    pub toggles: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SimPin(Arc<Mutex<PinState>>);

impl SimPin {
    pub fn state(&self) -> MutexGuard<'_, PinState> {
        self.0.lock().unwrap()
    }

    pub fn is_high(&self) -> bool {
        self.state().high
    }
}

impl OutputPin for SimPin {
    fn set(&mut self, high: bool) {
        let mut state = self.state();
        if state.high != high {
            state.toggles += 1;
        }
        state.high = high;
    }

    fn is_set_high(&self) -> bool {
        self.state().high
    }
}

/// A clock which only moves when advanced
#[derive(Debug, Default)]
pub struct SimClock(Mutex<Duration>);

impl SimClock {
    pub fn advance(&self, by: Duration) {
        *self.0.lock().unwrap() += by;
    }
}

impl Monotonic for SimClock {
    fn now(&self) -> Duration {
        *self.0.lock().unwrap()
    }
}

/// Work done by the simulated stack while it runs, e.g. waiting on its own interrupt
#[derive(Clone)]
pub struct RunHook(Arc<dyn Fn() + Send + Sync>);

impl std::fmt::Debug for RunHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RunHook")
    }
}

#[derive(Debug)]
pub struct DriverState {
    // Behavior
    pub setup_error: bool,
    pub module_present: bool,
    pub init_error: bool,
    pub start_error: bool,
    pub run_error: bool,
    pub events_error: bool,
    /// Report ready on this poll (1-based). None never becomes ready.
    pub ready_after_polls: Option<usize>,
    pub comm_error: bool,
    pub app_status: AppStatus,
    /// Called on every protocol step, outside the state lock
    pub run_hook: Option<RunHook>,

    // Observations
    pub setup_calls: usize,
    pub detect_calls: usize,
    pub init_calls: usize,
    pub start_calls: usize,
    pub polls: usize,
    pub run_calls: usize,
    pub trigger_calls: usize,
    pub startup_timeout: Option<Duration>,
    pub adi_count: usize,
    pub map: Vec<DefaultMap>,
    pub events: Vec<u16>,
    /// The write process data image built on the last trigger
    pub write_pd: Vec<u8>,
}

impl Default for DriverState {
    fn default() -> Self {
        Self {
            setup_error: false,
            module_present: true,
            init_error: false,
            start_error: false,
            run_error: false,
            events_error: false,
            ready_after_polls: Some(1),
            comm_error: false,
            app_status: AppStatus::NotSynced,
            run_hook: None,
            setup_calls: 0,
            detect_calls: 0,
            init_calls: 0,
            start_calls: 0,
            polls: 0,
            run_calls: 0,
            trigger_calls: 0,
            startup_timeout: None,
            adi_count: 0,
            map: Vec::new(),
            events: Vec::new(),
            write_pd: Vec::new(),
        }
    }
}

/// A fieldbus module and protocol stack
#[derive(Debug, Clone, Default)]
pub struct SimDriver(Arc<Mutex<DriverState>>);

impl SimDriver {
    pub fn state(&self) -> MutexGuard<'_, DriverState> {
        self.0.lock().unwrap()
    }

    pub fn set_run_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.state().run_hook = Some(RunHook(Arc::new(hook)));
    }
}

impl FieldbusDriver for SimDriver {
    fn setup_hardware(&mut self) -> Result<(), DriverError> {
        let mut state = self.state();
        state.setup_calls += 1;
        if state.setup_error {
            return Err(DriverError::HardwareSetup);
        }
        Ok(())
    }

    fn module_detect(&mut self) -> bool {
        let mut state = self.state();
        state.detect_calls += 1;
        state.module_present
    }

    fn init_data_objects(
        &mut self,
        adis: &[AdiEntry],
        default_map: &[DefaultMap],
    ) -> Result<(), DriverError> {
        let mut state = self.state();
        state.init_calls += 1;
        if state.init_error {
            return Err(DriverError::Timeout);
        }
        state.adi_count = adis.len();
        state.map = default_map.to_vec();
        Ok(())
    }

    fn start_driver(&mut self, startup_timeout: Duration) -> Result<(), DriverError> {
        let mut state = self.state();
        state.start_calls += 1;
        state.startup_timeout = Some(startup_timeout);
        if state.start_error {
            return Err(DriverError::Driver { code: 0x0b });
        }
        Ok(())
    }

    fn poll_communication_ready(&mut self) -> CommReadiness {
        let mut state = self.state();
        state.polls += 1;
        if state.comm_error {
            return CommReadiness::CommError;
        }
        match state.ready_after_polls {
            Some(n) if state.polls >= n => CommReadiness::Ready,
            _ => CommReadiness::NotReady,
        }
    }

    fn run_driver_once(&mut self) -> Result<(), DriverError> {
        let hook = {
            let mut state = self.state();
            state.run_calls += 1;
            if state.run_error {
                return Err(DriverError::Driver { code: 0x10 });
            }
            state.run_hook.clone()
        };
        if let Some(hook) = hook {
            (hook.0)();
        }
        Ok(())
    }

    fn trigger_write_process_data_update(&mut self, adis: &[AdiEntry]) {
        let mut state = self.state();
        state.trigger_calls += 1;
        let mut image = vec![0; write_pd_size(adis, &state.map)];
        let len = update_write_pd(adis, &state.map, &mut image).unwrap_or(0);
        image.truncate(len);
        state.write_pd = image;
    }

    fn set_app_status(&mut self, status: AppStatus) {
        self.state().app_status = status;
    }

    fn handle_events(&mut self, events: u16) -> Result<(), DriverError> {
        let mut state = self.state();
        state.events.push(events);
        if state.events_error {
            return Err(DriverError::Driver { code: events });
        }
        Ok(())
    }
}
