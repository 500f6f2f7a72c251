//! Run-time configuration of the link and its encoder channels

use core::time::Duration;

use crate::constants::defaults;
use crate::resolution::{InvalidResolutionError, Resolution};

/// When the link publishes captured inputs to the module
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(serde::Deserialize), serde(rename_all = "snake_case"))]
pub enum PublishMode {
    /// Capture and publish only on SYNC pulses
    #[default]
    Sync,
    /// Additionally capture and publish once per run loop iteration
    FreeRun,
}

/// Configuration for the fieldbus link
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LinkConfig {
    /// Overall time allowed for the module to come up and become ready for communication
    pub startup_timeout: Duration,
    /// Publish strategy
    pub publish_mode: PublishMode,
}

impl LinkConfig {
    /// Create the default link configuration
    pub const fn new() -> Self {
        Self {
            startup_timeout: defaults::STARTUP_TIMEOUT,
            publish_mode: PublishMode::Sync,
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for one SSI encoder channel
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EncoderConfig {
    /// SSI clock rate in Hz
    pub bit_rate: u32,
    /// Encoder resolution
    pub resolution: Resolution,
    /// Number of consecutive failed reads masked before the encoder is declared failed
    pub max_read_retries: u8,
}

impl EncoderConfig {
    /// Create the default encoder configuration
    pub const fn new() -> Self {
        Self {
            bit_rate: defaults::SSI_BIT_RATE,
            resolution: match Resolution::new(defaults::RESOLUTION_BITS) {
                Ok(r) => r,
                Err(_) => panic!("Default resolution out of range"),
            },
            max_read_retries: defaults::MAX_READ_RETRIES,
        }
    }

    /// Create a configuration with the given resolution and default clock and retry settings
    pub const fn with_resolution(bits: u8) -> Result<Self, InvalidResolutionError> {
        match Resolution::new(bits) {
            Ok(resolution) => {
                let mut cfg = Self::new();
                cfg.resolution = resolution;
                Ok(cfg)
            }
            Err(e) => Err(e),
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self::new()
    }
}
