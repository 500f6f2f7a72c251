//! The fieldbus link state machine
//!
//! [`FieldbusLink`] brings up the fieldbus module and then keeps the protocol stack running,
//! publishing encoder positions on every SYNC pulse.
//!
//! ```text
//! Idle --start--> Init --detect, init, start driver--> WaitForComm --ready--> Run
//!   \               |                                      |                  |
//!    `--------------+--------------------------------------+------------------+--> Error
//! ```
//!
//! Once started, one [`Task::BusyWait`] drives the link. Its predicate is the single transition
//! function of the state machine: it polls for communication readiness in `WaitForComm`, steps
//! the driver in `Run`, and returns true only once the link is in `Error`. The completion then
//! reports the final [`Status`] through the [`Callbacks`].
//!
//! SYNC pulses arrive in interrupt context through [`FieldbusLink::on_sync_pulse`], which only
//! checks the application status and posts a capture cycle. The cycle reads the inputs and
//! publishes them from main-loop context, with interrupts enabled. The driver and the input
//! sources are never touched from interrupt context, and state only changes in main-loop context.
use core::cell::RefCell;
use core::sync::atomic::Ordering;
use core::time::Duration;

use critical_section::Mutex;
use defmt_or_log::{debug, error, info, warn};
use fieldlink_common::{
    adi::{find_adi, AdiEntry, AdiValue, DefaultMap},
    traits::Monotonic,
    AppStatus, AtomicCell, CommReadiness, ErrorCode, LinkState, Status,
};
use heapless::Vec;
use portable_atomic::{AtomicBool, AtomicU16, AtomicU32};
use snafu::Snafu;

use crate::encoder::InputSource;
use crate::event_loop::{fatal, EventLoop, Predicate, Task, Work};
use crate::irq::InterruptHandler;

pub use fieldlink_common::config::{LinkConfig, PublishMode};

/// Errors reported by a [`FieldbusDriver`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DriverError {
    /// Bring-up of the host interface to the module failed
    #[snafu(display("Fieldbus hardware setup failed"))]
    HardwareSetup,
    /// The module did not respond within the allowed time
    #[snafu(display("Fieldbus module timed out"))]
    Timeout,
    /// The protocol stack returned an error code
    #[snafu(display("Fieldbus driver error {code}"))]
    Driver {
        /// Driver specific error code
        code: u16,
    },
}

/// The fieldbus module and its vendor protocol stack
///
/// The link calls all methods from main-loop context, with interrupts enabled. Calls are never
/// nested.
pub trait FieldbusDriver: Send {
    /// Bring up the host side hardware interface to the module
    fn setup_hardware(&mut self) -> Result<(), DriverError>;

    /// Returns true if a module is present
    fn module_detect(&mut self) -> bool;

    /// Register the ADI table and its default process data map with the stack
    fn init_data_objects(
        &mut self,
        adis: &[AdiEntry],
        default_map: &[DefaultMap],
    ) -> Result<(), DriverError>;

    /// Start the protocol stack
    fn start_driver(&mut self, startup_timeout: Duration) -> Result<(), DriverError>;

    /// Poll the communication handshake
    fn poll_communication_ready(&mut self) -> CommReadiness;

    /// Advance the protocol stack one step
    fn run_driver_once(&mut self) -> Result<(), DriverError>;

    /// Publish the current ADI values as write process data
    fn trigger_write_process_data_update(&mut self, adis: &[AdiEntry]);

    /// Set the application status reported to the module
    fn set_app_status(&mut self, status: AppStatus);

    /// Service the events signalled by the module interrupt
    ///
    /// `events` is a mask of [`fieldlink_common::constants::events`] bits.
    fn handle_events(&mut self, events: u16) -> Result<(), DriverError> {
        let _ = events;
        Ok(())
    }
}

/// Error returned by [`FieldbusLink::add_channel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum ChannelError {
    /// No ADI with this index exists
    #[snafu(display("ADI {index} does not exist"))]
    UnknownAdi {
        /// The requested ADI
        index: u16,
    },
    /// The ADI has no backing storage
    #[snafu(display("ADI {index} has no storage"))]
    NoStorage {
        /// The requested ADI
        index: u16,
    },
    /// All channel slots are in use
    #[snafu(display("At most {capacity} channels are supported"))]
    TooManyChannels {
        /// Number of channel slots
        capacity: usize,
    },
    /// Channels can only be added before the link is started
    #[snafu(display("The link is already started"))]
    AlreadyStarted,
}

/// Callback for link state changes
pub type StateChangedFn = dyn Fn(LinkState) + Sync;
/// Callback for the final status of a link
pub type StoppedFn = dyn Fn(Status) + Sync;

/// Optional event callbacks of a [`FieldbusLink`]
///
/// Both are called from main-loop context.
#[allow(missing_debug_implementations)]
#[derive(Default, Clone, Copy)]
pub struct Callbacks<'a> {
    /// The link entered a new state
    pub state_changed: Option<&'a StateChangedFn>,

    /// The link entered `Error` and stopped
    ///
    /// Called once, with the reason. The application should show a visible error indication.
    pub stopped: Option<&'a StoppedFn>,
}

impl Callbacks<'_> {
    /// Create a Callbacks struct with no callbacks set
    pub const fn new() -> Self {
        Self {
            state_changed: None,
            stopped: None,
        }
    }
}

struct Channel<'a, S> {
    source: S,
    value: &'a AdiValue,
}

/// State used only from main-loop context
struct Core<'a, D, S, const C: usize> {
    driver: D,
    hardware_ready: bool,
    channels: Vec<Channel<'a, S>, C>,
    deadline: Duration,
    published_app_status: Option<AppStatus>,
}

impl<D: FieldbusDriver, S: InputSource, const C: usize> Core<'_, D, S, C> {
    fn publish_app_status(&mut self, status: AppStatus) {
        if self.published_app_status != Some(status) {
            self.driver.set_app_status(status);
            self.published_app_status = Some(status);
        }
    }

    fn capture_and_publish(&mut self, adis: &[AdiEntry]) -> Result<(), ErrorCode> {
        for channel in self.channels.iter_mut() {
            if channel.source.is_active() {
                let value = channel.source.capture_inputs()?;
                channel.value.set(value);
            }
        }
        self.driver.trigger_write_process_data_update(adis);
        Ok(())
    }
}

/// The fieldbus link
///
/// `N` is the capacity of the event loop, and `C` the maximum number of input channels.
pub struct FieldbusLink<'a, D, S, const N: usize, const C: usize>
where
    D: FieldbusDriver,
    S: InputSource,
{
    event_loop: &'a EventLoop<'a, N>,
    clock: &'a dyn Monotonic,
    config: LinkConfig,
    adis: &'a [AdiEntry<'a>],
    default_map: &'a [DefaultMap],
    callbacks: Callbacks<'a>,
    state: AtomicCell<LinkState>,
    status: AtomicCell<Status>,
    app_status: AtomicCell<AppStatus>,
    reported: AtomicBool,
    sync_pending: AtomicBool,
    pending_events: AtomicU16,
    posted: AtomicBool,
    sync_count: AtomicU32,
    ignored_sync_count: AtomicU32,
    // Leased out while in use, see `with_core`
    core: Mutex<RefCell<Option<Core<'a, D, S, C>>>>,
}

impl<D, S, const N: usize, const C: usize> core::fmt::Debug for FieldbusLink<'_, D, S, N, C>
where
    D: FieldbusDriver,
    S: InputSource,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FieldbusLink")
            .field("state", &self.state())
            .field("status", &self.status())
            .field("app_status", &self.app_status())
            .field("sync_count", &self.sync_count())
            .finish()
    }
}

impl<'a, D, S, const N: usize, const C: usize> FieldbusLink<'a, D, S, N, C>
where
    D: FieldbusDriver,
    S: InputSource,
{
    /// Create an idle link
    ///
    /// # Arguments
    /// - `event_loop`: The loop which runs the link
    /// - `clock`: Time source for the startup timeout
    /// - `driver`: The fieldbus module driver
    /// - `adis`: The ADI table exposed to the network
    /// - `default_map`: The default process data map of the ADI table
    /// - `config`: Startup timeout and publish mode
    /// - `callbacks`: Optional event callbacks
    pub fn new(
        event_loop: &'a EventLoop<'a, N>,
        clock: &'a dyn Monotonic,
        driver: D,
        adis: &'a [AdiEntry<'a>],
        default_map: &'a [DefaultMap],
        config: LinkConfig,
        callbacks: Callbacks<'a>,
    ) -> Self {
        Self {
            event_loop,
            clock,
            config,
            adis,
            default_map,
            callbacks,
            state: AtomicCell::new(LinkState::Idle),
            status: AtomicCell::new(Status::Success),
            app_status: AtomicCell::new(AppStatus::NotSynced),
            reported: AtomicBool::new(false),
            sync_pending: AtomicBool::new(false),
            pending_events: AtomicU16::new(0),
            posted: AtomicBool::new(false),
            sync_count: AtomicU32::new(0),
            ignored_sync_count: AtomicU32::new(0),
            core: Mutex::new(RefCell::new(Some(Core {
                driver,
                hardware_ready: false,
                channels: Vec::new(),
                deadline: Duration::ZERO,
                published_app_status: None,
            }))),
        }
    }

    /// Bring up the hardware interface to the module
    ///
    /// Failure means a wiring or configuration defect, and is fatal. Called by
    /// [`FieldbusLink::start`] if the application has not called it already.
    pub fn setup_hardware(&self) {
        let result: Result<(), DriverError> = self.with_core(|core| {
            if core.hardware_ready {
                return Ok(());
            }
            core.driver.setup_hardware()?;
            core.hardware_ready = true;
            Ok(())
        });
        if let Err(e) = result {
            error!("Fieldbus hardware setup error: {:?}", e);
            fatal("fieldbus hardware setup failed");
        }
        info!("Fieldbus hardware ready");
    }

    /// Add an input source which publishes into ADI `adi_index`
    ///
    /// A source which has not been through detection yet is detected here. The source is
    /// captured on every SYNC pulse while it is active, and its value stored in the first
    /// element of the ADI.
    pub fn add_channel(&self, mut source: S, adi_index: u16) -> Result<(), ChannelError> {
        if self.state() != LinkState::Idle {
            return AlreadyStartedSnafu.fail();
        }
        let adi = find_adi(self.adis, adi_index).ok_or(ChannelError::UnknownAdi {
            index: adi_index,
        })?;
        let value = adi
            .values
            .first()
            .ok_or(ChannelError::NoStorage { index: adi_index })?;
        if self.with_core(|core| core.channels.is_full()) {
            return TooManyChannelsSnafu { capacity: C }.fail();
        }

        if !source.is_detected() {
            debug!("Detecting input for ADI {}", adi_index);
            source.detect();
        }
        if !source.is_active() {
            warn!("Input for ADI {} is not active and will not be captured", adi_index);
        }

        self.with_core(|core| {
            core.channels
                .push(Channel { source, value })
                .map_err(|_| ChannelError::TooManyChannels { capacity: C })
        })
    }

    /// Start the link
    ///
    /// Detection, data object init and driver start run synchronously. On success the link is in
    /// `WaitForComm`, and the rest of the startup runs from the event loop. On failure the link is
    /// in `Error` and the status has been reported.
    pub fn start(&'a self) {
        if self.state() != LinkState::Idle {
            fatal("fieldbus link started twice");
        }
        self.setup_hardware();
        info!("Starting fieldbus link");
        self.enter(LinkState::Init);

        if !self.with_driver(|d| d.module_detect()) {
            warn!("Fieldbus module not detected");
            self.fail(Status::ModuleNotDetected);
            self.report();
            return;
        }

        if let Err(e) = self.with_driver(|d| d.init_data_objects(self.adis, self.default_map)) {
            warn!("Data object init failed: {:?}", e);
            self.fail(Status::ModuleNotAnswering);
            self.report();
            return;
        }

        let timeout = self.config.startup_timeout;
        if let Err(e) = self.with_driver(|d| d.start_driver(timeout)) {
            warn!("Driver start failed: {:?}", e);
            self.fail(Status::UnexpectedError);
            self.report();
            return;
        }

        let deadline = self.clock.now().saturating_add(timeout);
        self.with_core(|core| core.deadline = deadline);
        self.enter(LinkState::WaitForComm);
        self.event_loop.post_or_halt(Task::BusyWait(self, self));
    }

    /// Handle a SYNC pulse. Called from interrupt context.
    ///
    /// While the application status is `NotSynced`, the first pulse sets it to `NoError` and then
    /// proceeds. Any other application error causes the pulse to be ignored. Otherwise a capture
    /// cycle is posted to the event loop, which reads every active channel into its ADI and
    /// publishes the write process data. A pulse arriving before the previous cycle ran is
    /// counted as ignored.
    pub fn on_sync_pulse(&'a self) {
        if !self.is_running() {
            self.ignored_sync_count.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match self.app_status.load() {
            AppStatus::NoError => {}
            AppStatus::NotSynced => self.app_status.store(AppStatus::NoError),
            _ => {
                debug!("SYNC ignored, application error latched");
                self.ignored_sync_count.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        if self.sync_pending.swap(true, Ordering::AcqRel) {
            warn!("SYNC overrun, previous capture still pending");
            self.ignored_sync_count.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.schedule();
    }

    /// Forward module events to the driver. Called from interrupt context.
    ///
    /// Events are accumulated, and handed to [`FieldbusDriver::handle_events`] from a task posted
    /// to the event loop. At most one such task is queued at a time.
    pub fn on_async_event(&'a self, events: u16) {
        self.pending_events.fetch_or(events, Ordering::AcqRel);
        self.schedule();
    }

    /// Get the current state
    pub fn state(&self) -> LinkState {
        self.state.load()
    }

    /// Get the link status. [`Status::Success`] unless the link is in `Error`.
    pub fn status(&self) -> Status {
        self.status.load()
    }

    /// Get the application status
    pub fn app_status(&self) -> AppStatus {
        self.app_status.load()
    }

    /// Set the application status
    ///
    /// Any status other than `NoError` or `NotSynced` causes SYNC pulses to be ignored. The
    /// status is passed on to the module by the next run of the link.
    pub fn set_app_status(&self, status: AppStatus) {
        info!("Application status {:?}", status);
        self.app_status.store(status);
    }

    /// Number of SYNC pulses which captured and published inputs
    pub fn sync_count(&self) -> u32 {
        self.sync_count.load(Ordering::Relaxed)
    }

    /// Number of SYNC pulses ignored
    pub fn ignored_sync_count(&self) -> u32 {
        self.ignored_sync_count.load(Ordering::Relaxed)
    }

    /// Number of input channels
    pub fn channel_count(&self) -> usize {
        self.with_core(|core| core.channels.len())
    }

    /// Run `f` with exclusive access to the driver. Main-loop context only.
    pub fn with_driver<R>(&self, f: impl FnOnce(&mut D) -> R) -> R {
        self.with_core(|core| f(&mut core.driver))
    }

    /// Take the core out of its cell, run `f`, and put it back
    ///
    /// Interrupts are masked only for the take and the return.
    fn with_core<R>(&self, f: impl FnOnce(&mut Core<'a, D, S, C>) -> R) -> R {
        let Some(mut core) = critical_section::with(|cs| self.core.borrow_ref_mut(cs).take())
        else {
            fatal("fieldbus link core accessed reentrantly");
        };
        let result = f(&mut core);
        critical_section::with(|cs| *self.core.borrow_ref_mut(cs) = Some(core));
        result
    }

    fn is_running(&self) -> bool {
        matches!(self.state(), LinkState::WaitForComm | LinkState::Run)
    }

    fn schedule(&'a self) {
        if !self.posted.swap(true, Ordering::AcqRel) {
            self.event_loop.post_or_halt(Task::Call(self));
        }
    }

    fn enter(&self, next: LinkState) {
        let prev = self.state();
        if !prev.can_transition_to(next) {
            fatal("invalid fieldbus link transition");
        }
        self.state.store(next);
        info!("Fieldbus link {:?} -> {:?}", prev, next);
        if let Some(cb) = self.callbacks.state_changed {
            cb(next);
        }
    }

    fn fail(&self, status: Status) {
        if self.state() == LinkState::Error {
            return;
        }
        error!("Fieldbus link failed: {:?}", status);
        self.status.store(status);
        self.enter(LinkState::Error);
    }

    fn report(&self) {
        if self.state() != LinkState::Error || self.reported.swap(true, Ordering::AcqRel) {
            return;
        }
        let status = self.status();
        info!("Fieldbus link stopped, status {:?}", status);
        if let Some(cb) = self.callbacks.stopped {
            cb(status);
        }
    }

    fn capture_cycle(&self) {
        if !self.is_running() {
            self.ignored_sync_count.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let app_status = self.app_status.load();
        let result = self.with_core(|core| {
            core.publish_app_status(app_status);
            core.capture_and_publish(self.adis)
        });
        match result {
            Ok(()) => {
                self.sync_count.fetch_add(1, Ordering::Relaxed);
            }
            Err(code) => {
                error!("Could not capture inputs: {:?}", code);
                self.fail(Status::UnexpectedError);
            }
        }
    }

    fn wait_for_comm(&self) {
        let app_status = self.app_status.load();
        let (readiness, deadline) = self.with_core(|core| {
            core.publish_app_status(app_status);
            (core.driver.poll_communication_ready(), core.deadline)
        });
        match readiness {
            CommReadiness::Ready => self.enter(LinkState::Run),
            CommReadiness::CommError => {
                warn!("Fieldbus module reported a communication error");
                self.fail(Status::ModuleNotAnswering);
            }
            CommReadiness::NotReady => {
                if self.clock.now() >= deadline {
                    warn!("Fieldbus module not ready within startup timeout");
                    self.fail(Status::ModuleNotAnswering);
                }
            }
        }
    }

    fn run_once(&self) {
        let app_status = self.app_status.load();
        let result = self.with_core(|core| {
            core.publish_app_status(app_status);
            core.driver.run_driver_once()
        });
        if let Err(e) = result {
            warn!("Driver error while running: {:?}", e);
            self.fail(Status::UnexpectedError);
            return;
        }
        if self.config.publish_mode == PublishMode::FreeRun {
            if let Err(code) = self.with_core(|core| core.capture_and_publish(self.adis)) {
                error!("Could not capture inputs: {:?}", code);
                self.fail(Status::UnexpectedError);
            }
        }
    }
}

impl<'a, D, S, const N: usize, const C: usize> Predicate<'a> for FieldbusLink<'a, D, S, N, C>
where
    D: FieldbusDriver,
    S: InputSource,
{
    /// The transition function. Returns true once the link is in `Error`.
    fn poll(&'a self) -> bool {
        match self.state() {
            LinkState::WaitForComm => self.wait_for_comm(),
            LinkState::Run => self.run_once(),
            LinkState::Error => {}
            LinkState::Idle | LinkState::Init => fatal("fieldbus link polled before start"),
        }
        self.state() == LinkState::Error
    }
}

impl<'a, D, S, const N: usize, const C: usize> Work<'a> for FieldbusLink<'a, D, S, N, C>
where
    D: FieldbusDriver,
    S: InputSource,
{
    /// Run a pending capture cycle, service pending module events, and report the final status
    /// once the link has failed
    fn run(&'a self) {
        self.posted.store(false, Ordering::Release);
        if self.sync_pending.swap(false, Ordering::AcqRel) {
            self.capture_cycle();
        }
        let events = self.pending_events.swap(0, Ordering::AcqRel);
        if events != 0 && self.is_running() {
            if let Err(e) = self.with_driver(|d| d.handle_events(events)) {
                warn!("Driver error handling events {}: {:?}", events, e);
                self.fail(Status::UnexpectedError);
            }
        }
        self.report();
    }
}

impl<'a, D, S, const N: usize, const C: usize> InterruptHandler<'a>
    for FieldbusLink<'a, D, S, N, C>
where
    D: FieldbusDriver,
    S: InputSource,
{
    /// The SYNC interrupt
    fn on_interrupt(&'a self) {
        self.on_sync_pulse();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    struct NullDriver;

    impl FieldbusDriver for NullDriver {
        fn setup_hardware(&mut self) -> Result<(), DriverError> {
            Ok(())
        }

        fn module_detect(&mut self) -> bool {
            true
        }

        fn init_data_objects(
            &mut self,
            _adis: &[AdiEntry],
            _default_map: &[DefaultMap],
        ) -> Result<(), DriverError> {
            Ok(())
        }

        fn start_driver(&mut self, _startup_timeout: Duration) -> Result<(), DriverError> {
            Ok(())
        }

        fn poll_communication_ready(&mut self) -> CommReadiness {
            CommReadiness::NotReady
        }

        fn run_driver_once(&mut self) -> Result<(), DriverError> {
            Ok(())
        }

        fn trigger_write_process_data_update(&mut self, _adis: &[AdiEntry]) {}

        fn set_app_status(&mut self, _status: AppStatus) {}
    }

    struct Constant(u32);

    impl InputSource for Constant {
        fn is_active(&self) -> bool {
            true
        }

        fn capture_inputs(&mut self) -> Result<u32, ErrorCode> {
            Ok(self.0)
        }
    }

    struct ZeroClock;

    impl Monotonic for ZeroClock {
        fn now(&self) -> Duration {
            Duration::ZERO
        }
    }

    type TestLink = FieldbusLink<'static, NullDriver, Constant, 4, 1>;

    fn new_link() -> &'static TestLink {
        let event_loop: &'static EventLoop<'static, 4> = Box::leak(Box::new(EventLoop::new()));
        Box::leak(Box::new(FieldbusLink::new(
            event_loop,
            &ZeroClock,
            NullDriver,
            &[],
            &[],
            LinkConfig::new(),
            Callbacks::new(),
        )))
    }

    #[test]
    fn test_invalid_transition_keeps_state() {
        let link = new_link();
        let result = catch_unwind(AssertUnwindSafe(|| link.enter(LinkState::Run)));
        assert!(result.is_err());
        assert_eq!(LinkState::Idle, link.state());
    }

    #[test]
    fn test_core_returned_after_use() {
        let link = new_link();
        link.with_driver(|d| d.set_app_status(AppStatus::NoError));
        assert_eq!(0, link.channel_count());
        link.setup_hardware();
        link.setup_hardware();
    }

    #[test]
    #[should_panic]
    fn test_reentrant_driver_access_is_fatal() {
        let link = new_link();
        link.with_driver(|_| link.with_driver(|_| ()));
    }

    #[test]
    fn test_pulses_ignored_while_idle() {
        let link = new_link();
        link.on_sync_pulse();
        assert_eq!(1, link.ignored_sync_count());
        assert_eq!(AppStatus::NotSynced, link.app_status());
        assert!(link.event_loop.is_empty());
    }
}
