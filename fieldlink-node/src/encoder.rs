//! Encoder channel with transient fault masking
//!
//! SSI encoders glitch now and then, e.g. on cable noise. An [`EncoderReader`] hides isolated bad
//! frames from the fieldbus by reporting the last good position in their place. Only a run of
//! `max_read_retries` consecutive bad frames is reported, after which the reader is
//! [`EncoderStatus::Failed`] until it is reset.
use defmt_or_log::{error, info, warn};
use fieldlink_common::{config::EncoderConfig, traits::SsiMaster, ErrorCode};

use crate::ssi::SsiTransactor;

/// A source of process input values, captured once per SYNC cycle
pub trait InputSource: Send {
    /// Returns true once detection has run, whatever its outcome
    fn is_detected(&self) -> bool {
        true
    }

    /// Probe for the input. Returns true if the source is active afterwards.
    fn detect(&mut self) -> bool {
        self.is_active()
    }

    /// Returns true if the source should be captured
    fn is_active(&self) -> bool;

    /// Capture the current value
    fn capture_inputs(&mut self) -> Result<u32, ErrorCode>;
}

/// Status of an [`EncoderReader`]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EncoderStatus {
    /// Not yet detected
    #[default]
    Init,
    /// Detected and delivering positions
    Active,
    /// Not connected, or exceeded the retry limit
    Failed,
}

/// Reads one SSI encoder
#[derive(Debug)]
pub struct EncoderReader<B: SsiMaster> {
    transactor: SsiTransactor<B>,
    status: EncoderStatus,
    max_read_retries: u8,
    retries: u8,
    last_position: u32,
}

impl<B: SsiMaster> EncoderReader<B> {
    /// Create a reader on `bus`
    pub fn new(bus: B, config: EncoderConfig) -> Self {
        Self {
            transactor: SsiTransactor::new(bus, &config),
            status: EncoderStatus::Init,
            max_read_retries: config.max_read_retries,
            retries: 0,
            last_position: 0,
        }
    }

    /// Check for a connected encoder with a single read
    ///
    /// A valid frame makes the reader active. Otherwise the encoder is considered not connected,
    /// and the reader fails. Returns true if the reader is active.
    pub fn detect(&mut self) -> bool {
        if self.status == EncoderStatus::Init {
            match self.transactor.read_one() {
                Ok(position) => {
                    info!("Encoder detected at position {}", position);
                    self.last_position = position;
                    self.status = EncoderStatus::Active;
                }
                Err(e) => {
                    warn!("Encoder not detected: {:?}", e);
                    self.status = EncoderStatus::Failed;
                }
            }
        }
        self.is_active()
    }

    /// Read the position, masking transient failures
    ///
    /// A failed read reports the last good position while the count of consecutive failures is
    /// below the retry limit. The read which reaches the limit fails the reader and returns
    /// [`ErrorCode::HwProtocolError`], as does every capture after that.
    pub fn capture_inputs(&mut self) -> Result<u32, ErrorCode> {
        if self.status == EncoderStatus::Failed {
            return Err(ErrorCode::HwProtocolError);
        }

        match self.transactor.read_one() {
            Ok(position) => {
                self.retries = 0;
                self.last_position = position;
                self.status = EncoderStatus::Active;
                Ok(position)
            }
            Err(e) => {
                self.retries = self.retries.saturating_add(1);
                if self.retries >= self.max_read_retries {
                    error!(
                        "Encoder failed after {} consecutive bad frames: {:?}",
                        self.retries, e
                    );
                    self.status = EncoderStatus::Failed;
                    Err(e.into())
                } else {
                    Ok(self.last_position)
                }
            }
        }
    }

    /// Returns true if the encoder was detected and has not failed
    pub fn is_active(&self) -> bool {
        self.status == EncoderStatus::Active
    }

    /// Returns true if the encoder is not connected or exceeded the retry limit
    pub fn is_failed(&self) -> bool {
        self.status == EncoderStatus::Failed
    }

    /// Get the current status
    pub fn status(&self) -> EncoderStatus {
        self.status
    }

    /// Number of consecutive failed reads
    pub fn retries(&self) -> u8 {
        self.retries
    }

    /// The last good position read
    pub fn last_position(&self) -> u32 {
        self.last_position
    }

    /// Return to [`EncoderStatus::Init`], clearing the retry count and last position
    pub fn reset(&mut self) {
        self.status = EncoderStatus::Init;
        self.retries = 0;
        self.last_position = 0;
    }
}

impl<B: SsiMaster + Send> InputSource for EncoderReader<B> {
    fn is_detected(&self) -> bool {
        self.status != EncoderStatus::Init
    }

    fn detect(&mut self) -> bool {
        EncoderReader::detect(self)
    }

    fn is_active(&self) -> bool {
        EncoderReader::is_active(self)
    }

    fn capture_inputs(&mut self) -> Result<u32, ErrorCode> {
        EncoderReader::capture_inputs(self)
    }
}
