//! Types for representing the payload width of an SSI frame
//!

use crate::constants::ssi::{GUARD_BITS, MAX_FRAME_WIDTH, MIN_FRAME_WIDTH};

/// Smallest supported payload width, in bits
pub const MIN_RESOLUTION: u8 = MIN_FRAME_WIDTH - GUARD_BITS;
/// Largest supported payload width, in bits
pub const MAX_RESOLUTION: u8 = MAX_FRAME_WIDTH - GUARD_BITS;

/// A newtype on u8 to enforce a valid encoder resolution
///
/// The resolution is the number of position bits carried in one SSI frame, excluding the leading
/// and trailing guard bits. The serial peripheral supports frames of 4 to 16 bits, so the
/// resolution must lie between [`MIN_RESOLUTION`] and [`MAX_RESOLUTION`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Resolution(u8);

impl Resolution {
    /// Try to create a new Resolution
    ///
    /// It will fail if value is outside of the supported range
    pub const fn new(bits: u8) -> Result<Self, InvalidResolutionError> {
        if bits >= MIN_RESOLUTION && bits <= MAX_RESOLUTION {
            Ok(Resolution(bits))
        } else {
            Err(InvalidResolutionError(bits))
        }
    }

    /// Get the number of payload bits
    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// Get the full frame width clocked on the wire, including both guard bits
    pub const fn frame_width(&self) -> u8 {
        self.0 + GUARD_BITS
    }

    /// Get a mask covering the payload bits
    pub const fn payload_mask(&self) -> u32 {
        (1u32 << self.0) - 1
    }

    /// Number of distinct positions which can be represented
    pub const fn positions(&self) -> u32 {
        1u32 << self.0
    }
}

impl core::fmt::Display for Resolution {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} bits", self.0)
    }
}

impl From<Resolution> for u8 {
    fn from(value: Resolution) -> Self {
        value.bits()
    }
}

impl TryFrom<u8> for Resolution {
    type Error = InvalidResolutionError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Resolution::new(value)
    }
}

/// Error for converting u8 to a Resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidResolutionError(pub u8);

impl core::fmt::Display for InvalidResolutionError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "Invalid resolution {} (supported {}..={})",
            self.0, MIN_RESOLUTION, MAX_RESOLUTION
        )
    }
}
impl core::error::Error for InvalidResolutionError {}
