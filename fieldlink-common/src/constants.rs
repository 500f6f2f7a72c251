//! Constants defining default configuration and hardware limits
//!
//!

/// Limits of the synchronous serial peripheral and the encoder framing
pub mod ssi {
    /// Smallest frame the serial peripheral can clock, in bits
    pub const MIN_FRAME_WIDTH: u8 = 4;
    /// Largest frame the serial peripheral can clock, in bits
    pub const MAX_FRAME_WIDTH: u8 = 16;
    /// Number of guard bits framing the payload (one leading, one trailing)
    pub const GUARD_BITS: u8 = 2;
    /// Word written to the transmit FIFO to generate the clock burst
    pub const DUMMY_WORD: u16 = 0;
}

/// Default values used when no explicit configuration is given
pub mod defaults {
    use core::time::Duration;

    /// Default capacity of the event loop task queue
    pub const EVENT_LOOP_CAPACITY: usize = 64;
    /// Default number of consecutive failed reads before an encoder is declared failed
    pub const MAX_READ_RETRIES: u8 = 16;
    /// Default SSI clock rate. The encoders are limited to 1.5 MHz.
    pub const SSI_BIT_RATE: u32 = 1_500_000;
    /// Default encoder resolution in bits
    pub const RESOLUTION_BITS: u8 = 13;
    /// Overall time allowed for the module to become ready for communication
    pub const STARTUP_TIMEOUT: Duration = Duration::from_millis(1500);
    /// Default blink period for the activity LED
    pub const BLINK_PERIOD: Duration = Duration::from_millis(500);
    /// Maximum number of encoder channels a link can capture
    pub const MAX_CHANNELS: usize = 4;
}

/// Bits of the event mask passed from the fieldbus interrupt
pub mod events {
    /// New read process data is available
    pub const RDPD: u16 = 0x01;
    /// A message was received from the module
    pub const RDMSG: u16 = 0x02;
    /// The module is ready to accept a new message
    pub const WRMSG: u16 = 0x04;
    /// The module's anybus state changed
    pub const STATUS: u16 = 0x08;
    /// SYNC event
    pub const SYNC: u16 = 0x20;
}
