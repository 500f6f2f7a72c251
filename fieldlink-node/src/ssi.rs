//! SSI master transactions with absolute encoders
//!
//! Each transaction clocks one frame out of the encoder. The frame carries the Gray coded position
//! between two guard bits:
//!
//! ```text
//!  MSB                              LSB
//! +---+------------------------------+---+
//! | 1 |  position (Gray, N bits)     | 0 |
//! +---+------------------------------+---+
//! ```
//!
//! The leading guard bit is the idle level of the data line, sampled before the encoder starts
//! shifting, and must be high. The trailing guard bit must be low. A frame with either guard wrong
//! is rejected as a protocol error, and its payload is never returned as a position.
use core::cell::RefCell;

use critical_section::Mutex;
use fieldlink_common::{
    config::EncoderConfig, constants::ssi::DUMMY_WORD, gray::gray_to_binary,
    traits::SsiMaster, AtomicCell, ErrorCode, Resolution,
};
use snafu::Snafu;

use crate::event_loop::{fatal, Completion, EventLoop, Task};
use crate::irq::InterruptHandler;

/// Framing errors detected in a received SSI frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SsiError {
    /// The leading guard bit was not set
    #[snafu(display("Leading guard bit clear in frame {frame:#06x}"))]
    LeadingGuard {
        /// The received frame
        frame: u16,
    },
    /// The trailing guard bit was set
    #[snafu(display("Trailing guard bit set in frame {frame:#06x}"))]
    TrailingGuard {
        /// The received frame
        frame: u16,
    },
}

impl From<SsiError> for ErrorCode {
    fn from(_: SsiError) -> Self {
        ErrorCode::HwProtocolError
    }
}

/// Validate a raw SSI frame and decode its position
///
/// Bits above the frame width are ignored.
pub fn decode_frame(raw: u16, resolution: Resolution) -> Result<u32, SsiError> {
    let width = resolution.frame_width() as u32;
    let frame = raw as u32 & ((1 << width) - 1);
    let leading = 1 << (width - 1);

    if frame & leading == 0 {
        return LeadingGuardSnafu { frame: raw }.fail();
    }
    if frame & 1 != 0 {
        return TrailingGuardSnafu { frame: raw }.fail();
    }

    Ok(gray_to_binary((frame & !leading) >> 1))
}

/// The result of one SSI transaction
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EncoderSample {
    /// The frame as received, guard bits included
    pub raw_frame: u16,
    /// Decoded position. Zero when the frame is invalid.
    pub position: u32,
    /// True if the frame passed the guard bit checks
    pub frame_valid: bool,
}

impl EncoderSample {
    /// Build a sample from a received frame
    pub fn from_frame(raw_frame: u16, resolution: Resolution) -> Self {
        match decode_frame(raw_frame, resolution) {
            Ok(position) => Self {
                raw_frame,
                position,
                frame_valid: true,
            },
            Err(_) => Self {
                raw_frame,
                position: 0,
                frame_valid: false,
            },
        }
    }

    /// Convert to the position, or the error reported to a completion handler
    pub fn result(&self) -> Result<u32, ErrorCode> {
        if self.frame_valid {
            Ok(self.position)
        } else {
            Err(ErrorCode::HwProtocolError)
        }
    }
}

/// Blocking SSI transactions on one serial peripheral
#[derive(Debug)]
pub struct SsiTransactor<B: SsiMaster> {
    bus: B,
    resolution: Resolution,
}

impl<B: SsiMaster> SsiTransactor<B> {
    /// Take ownership of `bus`, configuring it for the given encoder
    pub fn new(mut bus: B, config: &EncoderConfig) -> Self {
        bus.configure(config.bit_rate, config.resolution.frame_width());
        Self {
            bus,
            resolution: config.resolution,
        }
    }

    /// Payload resolution
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Access the underlying peripheral
    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Clock one frame and decode it
    ///
    /// The peripheral must be idle.
    pub fn read_one(&mut self) -> Result<u32, SsiError> {
        let raw = self.transfer();
        decode_frame(raw, self.resolution)
    }

    /// Clock one frame, returning the raw frame with its decoded position
    pub fn read_sample(&mut self) -> EncoderSample {
        let raw = self.transfer();
        EncoderSample::from_frame(raw, self.resolution)
    }

    fn transfer(&mut self) -> u16 {
        if self.bus.is_busy() {
            fatal("SSI transaction started on a busy peripheral");
        }
        self.bus.transfer_one(DUMMY_WORD)
    }
}

struct Pending<'a> {
    dest: &'a AtomicCell<EncoderSample>,
    handler: &'a dyn Completion<'a>,
}

struct AsyncInner<'a, B> {
    bus: B,
    pending: Option<Pending<'a>>,
}

/// Interrupt driven SSI transactions
///
/// The transfer complete interrupt stores the sample at the destination given to
/// [`AsyncSsiTransactor::async_read_one`] and posts the completion handler to the event loop.
pub struct AsyncSsiTransactor<'a, B: SsiMaster, const N: usize> {
    event_loop: &'a EventLoop<'a, N>,
    resolution: Resolution,
    inner: Mutex<RefCell<AsyncInner<'a, B>>>,
}

impl<B: SsiMaster, const N: usize> core::fmt::Debug for AsyncSsiTransactor<'_, B, N> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AsyncSsiTransactor")
            .field("resolution", &self.resolution)
            .field("busy", &self.is_busy())
            .finish()
    }
}

impl<'a, B: SsiMaster, const N: usize> AsyncSsiTransactor<'a, B, N> {
    /// Take ownership of `bus`, configuring it for the given encoder
    pub fn new(event_loop: &'a EventLoop<'a, N>, mut bus: B, config: &EncoderConfig) -> Self {
        bus.configure(config.bit_rate, config.resolution.frame_width());
        Self {
            event_loop,
            resolution: config.resolution,
            inner: Mutex::new(RefCell::new(AsyncInner { bus, pending: None })),
        }
    }

    /// Start a transaction
    ///
    /// On completion the sample is stored to `dest` and `handler` is posted with
    /// [`ErrorCode::Success`], or [`ErrorCode::HwProtocolError`] if the frame failed validation.
    /// Starting a transaction while another is in flight is a fatal defect.
    pub fn async_read_one(
        &self,
        dest: &'a AtomicCell<EncoderSample>,
        handler: &'a dyn Completion<'a>,
    ) {
        let started = critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            if inner.pending.is_some() || inner.bus.is_busy() {
                return false;
            }
            inner.pending = Some(Pending { dest, handler });
            inner.bus.start_transfer(DUMMY_WORD);
            true
        });
        if !started {
            fatal("SSI transaction started on a busy peripheral");
        }
    }

    /// Cancel an in-flight transaction
    ///
    /// Returns true if a transaction was pending, in which case its handler is posted with
    /// [`ErrorCode::Aborted`] and its destination is left untouched. Returns false if the
    /// transaction already completed; nothing is posted.
    pub fn cancel(&self) -> bool {
        let pending = critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            let pending = inner.pending.take();
            if pending.is_some() {
                inner.bus.abort_transfer();
            }
            pending
        });

        match pending {
            Some(pending) => {
                self.event_loop
                    .post_or_halt(Task::Complete(pending.handler, ErrorCode::Aborted));
                true
            }
            None => false,
        }
    }

    /// Returns true while a transaction is in flight
    pub fn is_busy(&self) -> bool {
        critical_section::with(|cs| self.inner.borrow_ref(cs).pending.is_some())
    }
}

impl<'a, B: SsiMaster + Send, const N: usize> InterruptHandler<'a>
    for AsyncSsiTransactor<'a, B, N>
{
    fn on_interrupt(&'a self) {
        let completed = critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            let raw = inner.bus.finish_transfer()?;
            let pending = inner.pending.take()?;
            Some((pending, raw))
        });

        if let Some((pending, raw)) = completed {
            let sample = EncoderSample::from_frame(raw, self.resolution);
            pending.dest.store(sample);
            let code = match sample.result() {
                Ok(_) => ErrorCode::Success,
                Err(code) => code,
            };
            self.event_loop
                .post_or_halt(Task::Complete(pending.handler, code));
        }
    }
}
