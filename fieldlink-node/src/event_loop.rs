//! A single-queue cooperative event loop
//!
//! All deferred work in the firmware runs as a [`Task`] pulled from one bounded FIFO. Interrupt
//! handlers do the minimum and hand the rest to the loop with
//! [`EventLoop::post_interrupt_ctx`], so completion handlers always run in ordinary main-loop
//! context, where they may re-arm timers or touch non-atomic state.
//!
//! Tasks are references to objects implementing one of [`Work`], [`Completion`] or [`Predicate`].
//! Closures implement these traits, as do the components which need to schedule their own
//! continuations (e.g. the [`FieldbusLink`](crate::FieldbusLink)).
//!
//! The queue has a fixed capacity. Overflowing it is a defect of the static sizing of the system,
//! and is treated as fatal by every component in this crate.
use core::cell::RefCell;
use core::sync::atomic::Ordering;

use critical_section::Mutex;
use defmt_or_log::error;
use fieldlink_common::ErrorCode;
use heapless::Deque;
use portable_atomic::AtomicBool;
use snafu::Snafu;

/// A unit of deferred work with no arguments
///
/// The lifetime lets an implementor schedule itself again from within `run`.
pub trait Work<'a>: Sync {
    /// Execute the work
    fn run(&'a self);
}

impl<'a, F: Fn() + Sync> Work<'a> for F {
    fn run(&'a self) {
        self()
    }
}

/// A handler for the completion of an asynchronous operation
pub trait Completion<'a>: Sync {
    /// Called in main-loop context with the outcome of the operation
    fn complete(&'a self, code: ErrorCode);
}

impl<'a, F: Fn(ErrorCode) + Sync> Completion<'a> for F {
    fn complete(&'a self, code: ErrorCode) {
        self(code)
    }
}

/// A condition polled by [`EventLoop::busy_wait`]
pub trait Predicate<'a>: Sync {
    /// Returns true once the condition is met
    fn poll(&'a self) -> bool;
}

impl<'a, F: Fn() -> bool + Sync> Predicate<'a> for F {
    fn poll(&'a self) -> bool {
        self()
    }
}

/// An entry in the event loop queue
#[derive(Clone, Copy)]
pub enum Task<'a> {
    /// Run a piece of work
    Call(&'a dyn Work<'a>),
    /// Deliver a completion code to a handler
    Complete(&'a dyn Completion<'a>, ErrorCode),
    /// Evaluate the predicate once. If it is true, run the work, otherwise re-queue.
    BusyWait(&'a dyn Predicate<'a>, &'a dyn Work<'a>),
}

impl core::fmt::Debug for Task<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Task::Call(_) => write!(f, "Call"),
            Task::Complete(_, code) => write!(f, "Complete({code:?})"),
            Task::BusyWait(_, _) => write!(f, "BusyWait"),
        }
    }
}

/// Error returned when posting to a full event loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
#[snafu(display("Event loop queue is full ({capacity} tasks)"))]
pub struct QueueFullError {
    capacity: usize,
}

impl QueueFullError {
    /// Capacity of the queue which overflowed
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Report an unrecoverable defect and halt
///
/// On a host this panics. On target, the panic handler is expected to halt the core.
#[track_caller]
pub fn fatal(msg: &str) -> ! {
    error!("Fatal: {}", msg);
    panic!("{}", msg);
}

/// A bounded FIFO event loop with capacity `N`
pub struct EventLoop<'a, const N: usize> {
    queue: Mutex<RefCell<Deque<Task<'a>, N>>>,
    stopped: AtomicBool,
}

impl<const N: usize> core::fmt::Debug for EventLoop<'_, N> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventLoop")
            .field("len", &self.len())
            .field("capacity", &N)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl<const N: usize> Default for EventLoop<'_, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, const N: usize> EventLoop<'a, N> {
    /// Create an empty event loop
    pub const fn new() -> Self {
        Self {
            queue: Mutex::new(RefCell::new(Deque::new())),
            stopped: AtomicBool::new(false),
        }
    }

    /// Queue a task from main-loop context
    pub fn post(&self, task: Task<'a>) -> Result<(), QueueFullError> {
        self.push(task)
    }

    /// Queue a task from an interrupt handler
    ///
    /// The enqueue runs inside a critical section, so it is safe to call from any interrupt
    /// priority, and against a concurrent [`EventLoop::post`] from main-loop context.
    pub fn post_interrupt_ctx(&self, task: Task<'a>) -> Result<(), QueueFullError> {
        self.push(task)
    }

    /// Queue a task, treating overflow as a fatal defect
    pub(crate) fn post_or_halt(&self, task: Task<'a>) {
        if self.push(task).is_err() {
            fatal("event loop overflow");
        }
    }

    fn push(&self, task: Task<'a>) -> Result<(), QueueFullError> {
        critical_section::with(|cs| {
            self.queue
                .borrow_ref_mut(cs)
                .push_back(task)
                .map_err(|_| QueueFullError { capacity: N })
        })
    }

    fn pop(&self) -> Option<Task<'a>> {
        critical_section::with(|cs| self.queue.borrow_ref_mut(cs).pop_front())
    }

    /// Evaluate `predicate` once per loop iteration until it returns true, then run `on_done` once
    ///
    /// The predicate is checked for the first time when the posted task reaches the front of the
    /// queue, and is re-queued behind any other pending work after each false result.
    pub fn busy_wait(
        &self,
        predicate: &'a dyn Predicate<'a>,
        on_done: &'a dyn Work<'a>,
    ) -> Result<(), QueueFullError> {
        self.post(Task::BusyWait(predicate, on_done))
    }

    fn execute(&self, task: Task<'a>) {
        match task {
            Task::Call(work) => work.run(),
            Task::Complete(handler, code) => handler.complete(code),
            Task::BusyWait(predicate, on_done) => {
                if predicate.poll() {
                    on_done.run();
                } else {
                    self.post_or_halt(task);
                }
            }
        }
    }

    /// Execute at most one task
    ///
    /// Returns true if a task was executed.
    pub fn poll(&self) -> bool {
        match self.pop() {
            Some(task) => {
                self.execute(task);
                true
            }
            None => false,
        }
    }

    /// Run tasks until [`EventLoop::stop`] is called, spinning while the queue is empty
    pub fn run(&self) {
        self.run_with_idle(core::hint::spin_loop)
    }

    /// Run tasks until [`EventLoop::stop`] is called
    ///
    /// `idle` is called whenever the queue is empty. On target it should put the core to sleep
    /// until the next interrupt.
    pub fn run_with_idle(&self, mut idle: impl FnMut()) {
        while !self.is_stopped() {
            if !self.poll() {
                idle();
            }
        }
    }

    /// Make the current [`EventLoop::run`] return once the executing task finishes
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    /// Make the loop runnable again after a stop
    ///
    /// Tasks still in the queue are kept, and will execute on the next run.
    pub fn reset(&self) {
        self.stopped.store(false, Ordering::Release);
    }

    /// Returns true if the loop has been stopped and not reset
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Number of queued tasks
    pub fn len(&self) -> usize {
        critical_section::with(|cs| self.queue.borrow_ref(cs).len())
    }

    /// Returns true if no tasks are queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity of the queue
    pub const fn capacity(&self) -> usize {
        N
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assertables::assert_contains;
    use std::sync::Mutex as StdMutex;
    use std::vec::Vec;

    use portable_atomic::AtomicUsize;

    #[test]
    fn test_fifo_order() {
        let order = StdMutex::new(Vec::new());
        let a = || order.lock().unwrap().push('A');
        let b = || order.lock().unwrap().push('B');
        let c = || order.lock().unwrap().push('C');
        let event_loop: EventLoop<'_, 4> = EventLoop::new();

        event_loop.post(Task::Call(&a)).unwrap();
        event_loop.post(Task::Call(&b)).unwrap();
        event_loop.post(Task::Call(&c)).unwrap();
        assert_eq!(3, event_loop.len());

        while event_loop.poll() {}
        assert_eq!(vec!['A', 'B', 'C'], *order.lock().unwrap());
        assert!(event_loop.is_empty());
    }

    #[test]
    fn test_overflow() {
        let noop = || {};
        let event_loop: EventLoop<'_, 2> = EventLoop::new();
        event_loop.post(Task::Call(&noop)).unwrap();
        event_loop.post_interrupt_ctx(Task::Call(&noop)).unwrap();

        let err = event_loop.post(Task::Call(&noop)).unwrap_err();
        assert_eq!(2, err.capacity());
        assert_contains!(err.to_string(), "queue is full");
        assert_eq!(2, event_loop.len());
    }

    #[test]
    #[should_panic]
    fn test_overflow_from_busy_wait_is_fatal() {
        let noop = || {};
        let never = || false;
        let event_loop: EventLoop<'_, 1> = EventLoop::new();
        event_loop.busy_wait(&never, &noop).unwrap();
        // Steal the slot the busy wait needs to re-queue itself
        let task = event_loop.pop().unwrap();
        event_loop.post(Task::Call(&noop)).unwrap();
        event_loop.execute(task);
    }

    #[test]
    fn test_busy_wait_evaluations() {
        const K: usize = 5;
        let evaluations = AtomicUsize::new(0);
        let done = AtomicUsize::new(0);
        let predicate = || evaluations.fetch_add(1, Ordering::Relaxed) + 1 >= K;
        let on_done = || {
            assert_eq!(K, evaluations.load(Ordering::Relaxed));
            done.fetch_add(1, Ordering::Relaxed);
        };
        let event_loop: EventLoop<'_, 4> = EventLoop::new();

        event_loop.busy_wait(&predicate, &on_done).unwrap();
        for i in 1..K {
            assert!(event_loop.poll());
            assert_eq!(i, evaluations.load(Ordering::Relaxed));
            assert_eq!(0, done.load(Ordering::Relaxed));
        }
        assert!(event_loop.poll());
        assert_eq!(K, evaluations.load(Ordering::Relaxed));
        assert_eq!(1, done.load(Ordering::Relaxed));
        assert!(!event_loop.poll());
    }

    #[test]
    fn test_busy_wait_interleaves_with_other_work() {
        let order = StdMutex::new(Vec::new());
        let checks = AtomicUsize::new(0);
        let predicate = || {
            order.lock().unwrap().push('P');
            checks.fetch_add(1, Ordering::Relaxed) == 1
        };
        let on_done = || order.lock().unwrap().push('D');
        let other = || order.lock().unwrap().push('X');
        let event_loop: EventLoop<'_, 4> = EventLoop::new();

        event_loop.busy_wait(&predicate, &on_done).unwrap();
        event_loop.post(Task::Call(&other)).unwrap();
        while event_loop.poll() {}
        assert_eq!(vec!['P', 'X', 'P', 'D'], *order.lock().unwrap());
    }

    #[test]
    fn test_completion_task() {
        let received = StdMutex::new(None);
        let handler = |code: ErrorCode| *received.lock().unwrap() = Some(code);
        let event_loop: EventLoop<'_, 4> = EventLoop::new();
        event_loop
            .post_interrupt_ctx(Task::Complete(&handler, ErrorCode::Aborted))
            .unwrap();
        assert!(event_loop.poll());
        assert_eq!(Some(ErrorCode::Aborted), *received.lock().unwrap());
    }

    #[test]
    fn test_stop_and_reset() {
        static EVENT_LOOP: EventLoop<'static, 8> = EventLoop::new();
        static RUNS: AtomicUsize = AtomicUsize::new(0);

        let count: &'static dyn Work<'static> = Box::leak(Box::new(|| {
            RUNS.fetch_add(1, Ordering::Relaxed);
        }));
        let stop: &'static dyn Work<'static> = Box::leak(Box::new(|| EVENT_LOOP.stop()));

        EVENT_LOOP.post(Task::Call(count)).unwrap();
        EVENT_LOOP.post(Task::Call(stop)).unwrap();
        EVENT_LOOP.post(Task::Call(count)).unwrap();
        EVENT_LOOP.run();

        // The task after the stop is still queued
        assert!(EVENT_LOOP.is_stopped());
        assert_eq!(1, RUNS.load(Ordering::Relaxed));
        assert_eq!(1, EVENT_LOOP.len());

        EVENT_LOOP.reset();
        EVENT_LOOP.post(Task::Call(stop)).unwrap();
        EVENT_LOOP.run();
        assert_eq!(2, RUNS.load(Ordering::Relaxed));
        assert!(EVENT_LOOP.is_empty());
    }
}
