//! Routing of interrupt vectors to handler objects
//!
//! An interrupt vector is a free function with no context. The [`IrqTable`] gives it one: each
//! interrupt line has a single slot, filled when a component registers as the owner of that line
//! and cleared when it unregisters. The vector then calls [`IrqTable::dispatch`] with its line
//! number.
//!
//! ```ignore
//! static IRQS: IrqTable<'static, 4> = IrqTable::new();
//!
//! #[interrupt]
//! fn TIMER0A() {
//!     IRQS.dispatch(lines::TIMER0);
//! }
//! ```
use core::cell::RefCell;

use critical_section::Mutex;
use snafu::Snafu;

/// An object which handles an interrupt line
///
/// The lifetime lets an implementor post itself to the event loop from interrupt context.
pub trait InterruptHandler<'a>: Sync {
    /// Called from interrupt context
    ///
    /// Implementations must do bounded work, and defer anything else to the event loop.
    fn on_interrupt(&'a self);
}

/// Error returned by [`IrqTable`] registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum IrqError {
    /// The line number is beyond the size of the table
    #[snafu(display("Interrupt line {line} out of range"))]
    LineOutOfRange {
        /// The requested line
        line: usize,
    },
    /// Another handler already owns the line
    #[snafu(display("Interrupt line {line} already has an owner"))]
    AlreadyRegistered {
        /// The requested line
        line: usize,
    },
    /// No handler owns the line
    #[snafu(display("Interrupt line {line} has no owner"))]
    NotRegistered {
        /// The requested line
        line: usize,
    },
}

/// A registration table with one slot per interrupt line
pub struct IrqTable<'a, const N: usize> {
    handlers: Mutex<RefCell<[Option<&'a dyn InterruptHandler<'a>>; N]>>,
}

impl<const N: usize> core::fmt::Debug for IrqTable<'_, N> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let registered = (0..N).filter(|&line| self.is_registered(line)).count();
        f.debug_struct("IrqTable")
            .field("lines", &N)
            .field("registered", &registered)
            .finish()
    }
}

impl<const N: usize> Default for IrqTable<'_, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, const N: usize> IrqTable<'a, N> {
    /// Create a table with all lines unowned
    pub const fn new() -> Self {
        Self {
            handlers: Mutex::new(RefCell::new([None; N])),
        }
    }

    /// Make `handler` the owner of `line`
    pub fn register(
        &self,
        line: usize,
        handler: &'a dyn InterruptHandler<'a>,
    ) -> Result<(), IrqError> {
        critical_section::with(|cs| {
            let mut handlers = self.handlers.borrow_ref_mut(cs);
            let slot = handlers
                .get_mut(line)
                .ok_or(IrqError::LineOutOfRange { line })?;
            if slot.is_some() {
                return AlreadyRegisteredSnafu { line }.fail();
            }
            *slot = Some(handler);
            Ok(())
        })
    }

    /// Release ownership of `line`
    pub fn unregister(&self, line: usize) -> Result<(), IrqError> {
        critical_section::with(|cs| {
            let mut handlers = self.handlers.borrow_ref_mut(cs);
            let slot = handlers
                .get_mut(line)
                .ok_or(IrqError::LineOutOfRange { line })?;
            match slot.take() {
                Some(_) => Ok(()),
                None => NotRegisteredSnafu { line }.fail(),
            }
        })
    }

    /// Returns true if `line` has an owner
    pub fn is_registered(&self, line: usize) -> bool {
        critical_section::with(|cs| {
            self.handlers
                .borrow_ref(cs)
                .get(line)
                .is_some_and(|slot| slot.is_some())
        })
    }

    /// Call the owner of `line`
    ///
    /// Returns false if the line has no owner, in which case the interrupt is dropped.
    pub fn dispatch(&self, line: usize) -> bool {
        let handler =
            critical_section::with(|cs| self.handlers.borrow_ref(cs).get(line).copied().flatten());
        match handler {
            Some(handler) => {
                handler.on_interrupt();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use core::sync::atomic::Ordering;
    use portable_atomic::AtomicUsize;

    struct Counter(AtomicUsize);

    impl<'a> InterruptHandler<'a> for Counter {
        fn on_interrupt(&'a self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_single_owner_per_line() {
        let a = Counter(AtomicUsize::new(0));
        let b = Counter(AtomicUsize::new(0));
        let table: IrqTable<'_, 2> = IrqTable::new();

        table.register(0, &a).unwrap();
        assert_eq!(
            Err(IrqError::AlreadyRegistered { line: 0 }),
            table.register(0, &b)
        );
        assert_eq!(
            Err(IrqError::LineOutOfRange { line: 2 }),
            table.register(2, &b)
        );
        table.register(1, &b).unwrap();

        assert!(table.dispatch(0));
        assert!(table.dispatch(0));
        assert!(table.dispatch(1));
        assert_eq!(2, a.0.load(Ordering::Relaxed));
        assert_eq!(1, b.0.load(Ordering::Relaxed));
    }

    #[test]
    fn test_unregister_clears_line() {
        let a = Counter(AtomicUsize::new(0));
        let table: IrqTable<'_, 1> = IrqTable::new();

        table.register(0, &a).unwrap();
        assert!(table.is_registered(0));
        table.unregister(0).unwrap();
        assert!(!table.is_registered(0));
        assert!(!table.dispatch(0));
        assert_eq!(0, a.0.load(Ordering::Relaxed));
        assert_eq!(Err(IrqError::NotRegistered { line: 0 }), table.unregister(0));

        // The line can be taken by a new owner
        table.register(0, &a).unwrap();
    }
}
