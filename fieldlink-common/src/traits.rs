//! Hardware resource traits
//!
//! Each trait wraps exactly one on-chip peripheral. Register-level programming stays behind these
//! interfaces, so the event loop, timers and encoder logic can run unchanged on a microcontroller
//! or against simulated hardware.

use core::time::Duration;

/// A synchronous serial master used to clock frames out of an SSI slave
pub trait SsiMaster {
    /// Configure clock rate and frame width. The peripheral must be idle.
    fn configure(&mut self, bit_rate: u32, frame_width: u8);

    /// Returns true while a frame is being clocked
    fn is_busy(&self) -> bool;

    /// Write one word and block until the response word has been clocked in
    fn transfer_one(&mut self, word: u16) -> u16;

    /// Write one word and arm the transfer-complete interrupt
    fn start_transfer(&mut self, word: u16);

    /// Collect the received word after the transfer-complete interrupt and disarm it
    ///
    /// Returns None if no transfer has completed.
    fn finish_transfer(&mut self) -> Option<u16>;

    /// Stop an in-flight transfer started with [`SsiMaster::start_transfer`]
    ///
    /// Returns true if a transfer was stopped before completing.
    fn abort_transfer(&mut self) -> bool;
}

/// A one-shot countdown timer
pub trait CountdownTimer {
    /// Load `duration` and start counting down with the timeout interrupt armed
    fn start(&mut self, duration: Duration);

    /// Stop counting and disarm the interrupt. Any pending timeout interrupt is cleared.
    fn stop(&mut self);

    /// Returns true if the timer is counting, or has expired with its interrupt still pending
    fn is_running(&self) -> bool;

    /// Time left before expiry
    fn remaining(&self) -> Duration;

    /// Acknowledge the timeout interrupt
    fn clear_interrupt(&mut self);
}

/// A digital output, e.g. driving an LED
pub trait OutputPin {
    /// Drive the output
    fn set(&mut self, high: bool);

    /// Read back the driven level
    fn is_set_high(&self) -> bool;
}

/// A free running monotonic time source
pub trait Monotonic: Sync {
    /// Time since an arbitrary fixed epoch
    fn now(&self) -> Duration;
}
