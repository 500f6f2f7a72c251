//! Deadline timer layered over a countdown peripheral
//!
//! A [`DeadlineTimer`] owns one [`CountdownTimer`] and holds at most one pending completion
//! handler. The handler is never called from the timeout interrupt itself: the interrupt posts it
//! to the [`EventLoop`], and it runs in main-loop context with either [`ErrorCode::Success`] on
//! expiry or [`ErrorCode::Aborted`] on cancellation.
//!
//! A cancel which races with expiry is resolved by the timer state: whichever of the two runs
//! first moves the timer to [`TimerState::Stopped`] and posts the handler, and the other becomes a
//! no-op. The handler is called exactly once per wait.
use core::cell::RefCell;
use core::time::Duration;

use critical_section::Mutex;
use fieldlink_common::{traits::CountdownTimer, ErrorCode};

use crate::event_loop::{fatal, Completion, EventLoop, Task};
use crate::irq::InterruptHandler;

/// State of a [`DeadlineTimer`]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimerState {
    /// No wait in progress
    #[default]
    Stopped,
    /// Counting down, with a handler pending
    Waiting,
    /// Countdown paused with a handler pending, see [`DeadlineTimer::suspend`]
    Suspended,
}

struct Inner<'a, T> {
    hw: T,
    state: TimerState,
    handler: Option<&'a dyn Completion<'a>>,
    remaining: Duration,
}

/// A one-shot timer which delivers its completion through the event loop
pub struct DeadlineTimer<'a, T: CountdownTimer, const N: usize> {
    event_loop: &'a EventLoop<'a, N>,
    inner: Mutex<RefCell<Inner<'a, T>>>,
}

impl<T: CountdownTimer, const N: usize> core::fmt::Debug for DeadlineTimer<'_, T, N> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeadlineTimer")
            .field("state", &self.state())
            .finish()
    }
}

impl<'a, T: CountdownTimer, const N: usize> DeadlineTimer<'a, T, N> {
    /// Create a timer driving `hw`, posting completions to `event_loop`
    pub const fn new(event_loop: &'a EventLoop<'a, N>, hw: T) -> Self {
        Self {
            event_loop,
            inner: Mutex::new(RefCell::new(Inner {
                hw,
                state: TimerState::Stopped,
                handler: None,
                remaining: Duration::ZERO,
            })),
        }
    }

    /// Start a wait of `duration`, calling `handler` when it ends
    ///
    /// The timer must be stopped. Starting a wait while another is pending is a fatal defect.
    pub fn async_wait(&self, duration: Duration, handler: &'a dyn Completion<'a>) {
        let started = critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            if inner.state != TimerState::Stopped {
                return false;
            }
            inner.handler = Some(handler);
            inner.state = TimerState::Waiting;
            inner.hw.start(duration);
            true
        });
        if !started {
            fatal("async_wait on a busy deadline timer");
        }
    }

    /// Cancel a pending wait
    ///
    /// Returns true if a wait was pending, in which case its handler is posted with
    /// [`ErrorCode::Aborted`]. Returns false if the timer already expired or was never started;
    /// no handler is posted.
    pub fn cancel(&self) -> bool {
        let handler = critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            match inner.state {
                TimerState::Waiting | TimerState::Suspended => {
                    inner.hw.stop();
                    inner.state = TimerState::Stopped;
                    inner.handler.take()
                }
                TimerState::Stopped => None,
            }
        });

        match handler {
            Some(handler) => {
                self.event_loop
                    .post_or_halt(Task::Complete(handler, ErrorCode::Aborted));
                true
            }
            None => false,
        }
    }

    /// Pause a pending wait, keeping its handler and the time left
    ///
    /// Returns false if the timer was not waiting.
    pub fn suspend(&self) -> bool {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            if inner.state != TimerState::Waiting {
                return false;
            }
            inner.remaining = inner.hw.remaining();
            inner.hw.stop();
            inner.state = TimerState::Suspended;
            true
        })
    }

    /// Continue a suspended wait for the time it had left
    ///
    /// Returns false if the timer was not suspended.
    pub fn resume(&self) -> bool {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            if inner.state != TimerState::Suspended {
                return false;
            }
            let remaining = inner.remaining;
            inner.hw.start(remaining);
            inner.state = TimerState::Waiting;
            true
        })
    }

    /// Returns true while a wait is pending, including a suspended one
    pub fn is_busy(&self) -> bool {
        self.state() != TimerState::Stopped
    }

    /// Get the current state
    pub fn state(&self) -> TimerState {
        critical_section::with(|cs| self.inner.borrow_ref(cs).state)
    }
}

impl<'a, T: CountdownTimer + Send, const N: usize> InterruptHandler<'a>
    for DeadlineTimer<'a, T, N>
{
    /// Timeout interrupt. Posts the pending handler with [`ErrorCode::Success`].
    fn on_interrupt(&'a self) {
        let handler = critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            inner.hw.clear_interrupt();
            if inner.state != TimerState::Waiting {
                return None;
            }
            inner.state = TimerState::Stopped;
            inner.handler.take()
        });

        if let Some(handler) = handler {
            self.event_loop
                .post_or_halt(Task::Complete(handler, ErrorCode::Success));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::vec::Vec;

    #[derive(Default)]
    struct FakeCountdown {
        running: bool,
        loaded: Duration,
        elapsed: Duration,
    }

    impl CountdownTimer for FakeCountdown {
        fn start(&mut self, duration: Duration) {
            self.loaded = duration;
            self.elapsed = Duration::ZERO;
            self.running = true;
        }

        fn stop(&mut self) {
            self.running = false;
        }

        fn is_running(&self) -> bool {
            self.running
        }

        fn remaining(&self) -> Duration {
            self.loaded.saturating_sub(self.elapsed)
        }

        fn clear_interrupt(&mut self) {
            self.running = false;
        }
    }

    fn leak<T>(value: T) -> &'static T {
        Box::leak(Box::new(value))
    }

    type Log = StdMutex<Vec<ErrorCode>>;

    fn setup() -> (
        &'static EventLoop<'static, 4>,
        &'static DeadlineTimer<'static, FakeCountdown, 4>,
        &'static Log,
        &'static dyn Completion<'static>,
    ) {
        let event_loop = leak(EventLoop::new());
        let timer = leak(DeadlineTimer::new(event_loop, FakeCountdown::default()));
        let log: &'static Log = leak(StdMutex::new(Vec::new()));
        let handler: &'static dyn Completion<'static> =
            leak(move |code: ErrorCode| log.lock().unwrap().push(code));
        (event_loop, timer, log, handler)
    }

    #[test]
    fn test_expiry() {
        let (event_loop, timer, log, handler) = setup();
        timer.async_wait(Duration::from_millis(500), handler);
        assert_eq!(TimerState::Waiting, timer.state());
        assert!(event_loop.is_empty());

        timer.on_interrupt();
        assert!(!timer.is_busy());
        // Handler runs from the loop, not from the interrupt
        assert!(log.lock().unwrap().is_empty());
        assert!(event_loop.poll());
        assert_eq!(vec![ErrorCode::Success], *log.lock().unwrap());
    }

    #[test]
    fn test_cancel_pending() {
        let (event_loop, timer, log, handler) = setup();
        timer.async_wait(Duration::from_millis(500), handler);
        assert!(timer.cancel());
        assert!(!timer.is_busy());

        // A late interrupt after cancel is ignored
        timer.on_interrupt();
        while event_loop.poll() {}
        assert_eq!(vec![ErrorCode::Aborted], *log.lock().unwrap());
    }

    #[test]
    fn test_cancel_after_expiry_posted() {
        let (event_loop, timer, log, handler) = setup();
        timer.async_wait(Duration::from_millis(500), handler);
        timer.on_interrupt();

        // Completion is posted but has not run yet
        assert_eq!(1, event_loop.len());
        assert!(!timer.cancel());
        assert_eq!(1, event_loop.len());

        while event_loop.poll() {}
        assert_eq!(vec![ErrorCode::Success], *log.lock().unwrap());
    }

    #[test]
    fn test_cancel_idle() {
        let (event_loop, timer, log, _handler) = setup();
        assert!(!timer.cancel());
        assert!(event_loop.is_empty());
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_suspend_resume() {
        let (event_loop, timer, log, handler) = setup();
        assert!(!timer.suspend());
        timer.async_wait(Duration::from_millis(500), handler);
        assert!(timer.suspend());
        assert_eq!(TimerState::Suspended, timer.state());
        assert!(timer.is_busy());

        // Interrupts while suspended are ignored
        timer.on_interrupt();
        assert!(event_loop.is_empty());

        assert!(timer.resume());
        assert!(!timer.resume());
        assert_eq!(TimerState::Waiting, timer.state());
        timer.on_interrupt();
        while event_loop.poll() {}
        assert_eq!(vec![ErrorCode::Success], *log.lock().unwrap());
    }

    #[test]
    fn test_cancel_suspended() {
        let (event_loop, timer, log, handler) = setup();
        timer.async_wait(Duration::from_millis(500), handler);
        timer.suspend();
        assert!(timer.cancel());
        while event_loop.poll() {}
        assert_eq!(vec![ErrorCode::Aborted], *log.lock().unwrap());
    }

    #[test]
    #[should_panic]
    fn test_double_wait_is_fatal() {
        let (_event_loop, timer, _log, handler) = setup();
        timer.async_wait(Duration::from_millis(500), handler);
        timer.async_wait(Duration::from_millis(500), handler);
    }
}
