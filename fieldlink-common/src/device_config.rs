//! Device configuration file support
//!
//! A device config describes one firmware build: the link settings, the encoder channels, and the
//! ADI table the channels publish into. It is loaded from a TOML file.
//!
//! ```toml
//! device_name = "encoder-bridge"
//!
//! [link]
//! startup_timeout_ms = 1500
//! publish_mode = "sync"
//!
//! [[adis]]
//! index = 1
//! name = "encoder0Position"
//! data_type = "UInt32"
//!
//! [[encoders]]
//! adi = 1
//! resolution = 13
//! bit_rate = 1500000
//! max_read_retries = 16
//! ```
use std::collections::HashSet;
use std::path::Path;

use defmt_or_log::debug;
use serde::Deserialize;
use snafu::{ResultExt, Snafu};

use crate::adi::{AdiType, Direction};
use crate::config::{EncoderConfig, LinkConfig, PublishMode};
use crate::constants::defaults;
use crate::resolution::Resolution;

/// Error returned when loading a device config fails
#[derive(Debug, Snafu)]
pub enum LoadError {
    /// The file could not be read
    #[snafu(display("IO error reading device config: {source}"))]
    Io {
        /// The underlying IO error
        source: std::io::Error,
    },
    /// The TOML could not be parsed into a device config
    #[snafu(display("Error parsing device config: {source}"))]
    Parse {
        /// The underlying parse error
        source: toml::de::Error,
    },
    /// The config parsed, but is inconsistent
    #[snafu(display("Invalid device config: {message}"))]
    Invalid {
        /// Description of the problem
        message: String,
    },
}

fn default_startup_timeout_ms() -> u64 {
    defaults::STARTUP_TIMEOUT.as_millis() as u64
}

fn default_bit_rate() -> u32 {
    defaults::SSI_BIT_RATE
}

fn default_resolution() -> u8 {
    defaults::RESOLUTION_BITS
}

fn default_max_read_retries() -> u8 {
    defaults::MAX_READ_RETRIES
}

fn default_num_elements() -> u8 {
    1
}

fn default_true() -> bool {
    true
}

/// Link section of the device config
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LinkSection {
    /// Startup timeout in milliseconds
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    /// Publish strategy
    #[serde(default)]
    pub publish_mode: PublishMode,
}

impl Default for LinkSection {
    fn default() -> Self {
        Self {
            startup_timeout_ms: default_startup_timeout_ms(),
            publish_mode: PublishMode::default(),
        }
    }
}

/// An ADI definition
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AdiDefinition {
    /// ADI instance number
    pub index: u16,
    /// Name shown to the network master
    pub name: String,
    /// Element data type
    pub data_type: AdiType,
    /// Number of elements
    #[serde(default = "default_num_elements")]
    pub num_elements: u8,
    /// Whether the ADI is in the default write process data map
    #[serde(default = "default_true")]
    pub map_write: bool,
}

/// An encoder channel definition
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EncoderDefinition {
    /// Instance number of the ADI which receives this encoder's position
    pub adi: u16,
    /// Resolution in bits
    #[serde(default = "default_resolution")]
    pub resolution: u8,
    /// SSI clock rate in Hz
    #[serde(default = "default_bit_rate")]
    pub bit_rate: u32,
    /// Number of consecutive failed reads which are masked
    #[serde(default = "default_max_read_retries")]
    pub max_read_retries: u8,
}

impl EncoderDefinition {
    /// Convert to an [`EncoderConfig`]
    ///
    /// The resolution has already been validated by [`DeviceConfig::load_from_str`].
    pub fn encoder_config(&self) -> EncoderConfig {
        EncoderConfig {
            bit_rate: self.bit_rate,
            resolution: Resolution::new(self.resolution).unwrap_or(EncoderConfig::new().resolution),
            max_read_retries: self.max_read_retries,
        }
    }
}

/// Top level device configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    /// Name of the device
    pub device_name: String,
    /// Link settings
    #[serde(default)]
    pub link: LinkSection,
    /// ADI table
    #[serde(default)]
    pub adis: Vec<AdiDefinition>,
    /// Encoder channels, in channel order
    #[serde(default)]
    pub encoders: Vec<EncoderDefinition>,
}

impl DeviceConfig {
    /// Read a device config from a file
    pub fn load(config_path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let config_str = std::fs::read_to_string(&config_path).context(IoSnafu)?;
        Self::load_from_str(&config_str)
    }

    /// Read a device config from a string
    pub fn load_from_str(config_str: &str) -> Result<Self, LoadError> {
        let config: DeviceConfig = toml::from_str(config_str).context(ParseSnafu)?;
        config.validate()?;
        debug!(
            "Loaded device config '{}': {} ADIs, {} encoders",
            config.device_name.as_str(),
            config.adis.len(),
            config.encoders.len()
        );
        Ok(config)
    }

    fn validate(&self) -> Result<(), LoadError> {
        let mut indices = HashSet::new();
        for adi in &self.adis {
            if adi.index == 0 {
                return InvalidSnafu {
                    message: format!("ADI '{}' uses reserved instance 0", adi.name),
                }
                .fail();
            }
            if !indices.insert(adi.index) {
                return InvalidSnafu {
                    message: format!("Duplicate ADI instance {}", adi.index),
                }
                .fail();
            }
        }

        if self.encoders.len() > defaults::MAX_CHANNELS {
            return InvalidSnafu {
                message: format!(
                    "{} encoders configured, at most {} supported",
                    self.encoders.len(),
                    defaults::MAX_CHANNELS
                ),
            }
            .fail();
        }

        for (i, enc) in self.encoders.iter().enumerate() {
            if let Err(e) = Resolution::new(enc.resolution) {
                return InvalidSnafu {
                    message: format!("Encoder {i}: {e}"),
                }
                .fail();
            }
            if !indices.contains(&enc.adi) {
                return InvalidSnafu {
                    message: format!("Encoder {i} targets undefined ADI {}", enc.adi),
                }
                .fail();
            }
        }
        Ok(())
    }

    /// Get the link configuration
    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            startup_timeout: core::time::Duration::from_millis(self.link.startup_timeout_ms),
            publish_mode: self.link.publish_mode,
        }
    }

    /// Iterate over the default process data map
    pub fn default_map(&self) -> impl Iterator<Item = (u16, Direction)> + '_ {
        self.adis
            .iter()
            .filter(|adi| adi.map_write)
            .map(|adi| (adi.index, Direction::Write))
    }
}
