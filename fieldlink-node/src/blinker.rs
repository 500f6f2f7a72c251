//! Activity LED
use core::cell::RefCell;
use core::time::Duration;

use critical_section::Mutex;
use defmt_or_log::info;
use fieldlink_common::{
    traits::{CountdownTimer, OutputPin},
    AtomicCell, ErrorCode,
};

use crate::deadline_timer::DeadlineTimer;
use crate::event_loop::{fatal, Completion, EventLoop};

/// State of a [`Blinker`]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BlinkerState {
    /// Not blinking, LED off
    #[default]
    Idle,
    /// Toggling the LED every period
    Active,
    /// Stop requested, waiting for the last timer completion
    Stopping,
}

/// Toggles an LED on a fixed period using a [`DeadlineTimer`]
pub struct Blinker<'a, T: CountdownTimer, P: OutputPin, const N: usize> {
    timer: DeadlineTimer<'a, T, N>,
    led: Mutex<RefCell<P>>,
    state: AtomicCell<BlinkerState>,
    period: Duration,
}

impl<T: CountdownTimer, P: OutputPin, const N: usize> core::fmt::Debug for Blinker<'_, T, P, N> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Blinker")
            .field("state", &self.state())
            .field("period", &self.period)
            .finish()
    }
}

impl<T: CountdownTimer, P: OutputPin, const N: usize> Blinker<'_, T, P, N> {
    /// Get the current state
    pub fn state(&self) -> BlinkerState {
        self.state.load()
    }

    /// Returns true if the LED is lit
    pub fn is_led_on(&self) -> bool {
        critical_section::with(|cs| self.led.borrow_ref(cs).is_set_high())
    }
}

impl<'a, T, P, const N: usize> Blinker<'a, T, P, N>
where
    T: CountdownTimer + Send,
    P: OutputPin + Send,
{
    /// Create an idle blinker toggling `led` every `period`
    ///
    /// The LED is driven low.
    pub fn new(event_loop: &'a EventLoop<'a, N>, timer: T, mut led: P, period: Duration) -> Self {
        led.set(false);
        Self {
            timer: DeadlineTimer::new(event_loop, timer),
            led: Mutex::new(RefCell::new(led)),
            state: AtomicCell::new(BlinkerState::Idle),
            period,
        }
    }

    /// The deadline timer, to be registered as the owner of the timer interrupt
    pub fn timer(&self) -> &DeadlineTimer<'a, T, N> {
        &self.timer
    }

    /// Start blinking. The blinker must be idle.
    pub fn start(&'a self) {
        if self.state.load() != BlinkerState::Idle {
            fatal("Blinker started while not idle");
        }
        self.state.store(BlinkerState::Active);
        self.timer.async_wait(self.period, self);
        info!("Blinker started");
    }

    /// Request blinking to stop. The blinker must be active.
    ///
    /// The LED is turned off, and the blinker becomes idle, when the pending timer completion is
    /// delivered.
    pub fn stop(&self) {
        if self.state.load() != BlinkerState::Active {
            fatal("Blinker stopped while not active");
        }
        self.timer.cancel();
        self.state.store(BlinkerState::Stopping);
    }

    fn set_led(&self, on: bool) {
        critical_section::with(|cs| self.led.borrow_ref_mut(cs).set(on));
    }
}

impl<'a, T, P, const N: usize> Completion<'a> for Blinker<'a, T, P, N>
where
    T: CountdownTimer + Send,
    P: OutputPin + Send,
{
    fn complete(&'a self, code: ErrorCode) {
        match self.state.load() {
            BlinkerState::Stopping => {
                // Success when the stop came after expiry was posted, Aborted otherwise
                self.set_led(false);
                self.state.store(BlinkerState::Idle);
                info!("Blinker stopped");
            }
            BlinkerState::Active => {
                if !code.is_success() {
                    fatal("Blinker timer aborted while active");
                }
                self.set_led(!self.is_led_on());
                self.timer.async_wait(self.period, self);
            }
            BlinkerState::Idle => fatal("Blinker completion while idle"),
        }
    }
}
