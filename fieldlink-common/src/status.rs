//! State and status types for the fieldbus link

/// Possible states of the fieldbus link state machine
///
/// Transitions only move forward, `Idle -> Init -> WaitForComm -> Run`, except that any state may
/// move to `Error`, which is absorbing.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum LinkState {
    /// Constructed, hardware possibly set up, not yet started
    #[default]
    Idle = 0,
    /// Module detected, data objects and driver are being started
    Init = 1,
    /// Driver running, waiting for the module to report communication readiness
    WaitForComm = 2,
    /// Exchanging process data
    Run = 3,
    /// The link failed, see [`Status`] for the reason
    Error = 4,
}

impl LinkState {
    /// Returns true if the state machine may transition from `self` to `next`
    pub fn can_transition_to(&self, next: LinkState) -> bool {
        use LinkState::*;
        matches!(
            (*self, next),
            (Idle, Init)
                | (Init, WaitForComm)
                | (WaitForComm, Run)
                | (Idle | Init | WaitForComm | Run, Error)
        )
    }
}

impl core::fmt::Display for LinkState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            LinkState::Idle => write!(f, "Idle"),
            LinkState::Init => write!(f, "Init"),
            LinkState::WaitForComm => write!(f, "WaitForComm"),
            LinkState::Run => write!(f, "Run"),
            LinkState::Error => write!(f, "Error"),
        }
    }
}

#[derive(Clone, Copy, Debug)]
/// An error for [`LinkState::try_from()`]
pub struct InvalidLinkStateError(pub u8);

impl TryFrom<u8> for LinkState {
    type Error = InvalidLinkStateError;

    /// Attempt to convert a u8 to a LinkState enum
    fn try_from(value: u8) -> Result<Self, InvalidLinkStateError> {
        use LinkState::*;
        match value {
            x if x == Idle as u8 => Ok(Idle),
            x if x == Init as u8 => Ok(Init),
            x if x == WaitForComm as u8 => Ok(WaitForComm),
            x if x == Run as u8 => Ok(Run),
            x if x == Error as u8 => Ok(Error),
            _ => Err(InvalidLinkStateError(value)),
        }
    }
}

/// Status reported upward by the link when it stops or fails
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Status {
    /// No failure
    Success,
    /// The module did not answer the presence detection
    ModuleNotDetected,
    /// The module was detected but did not come up, or reported a communication error
    ModuleNotAnswering,
    /// The driver or an input source failed while running
    UnexpectedError,
}

impl core::fmt::Display for Status {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Status::Success => write!(f, "Success"),
            Status::ModuleNotDetected => write!(f, "ModuleNotDetected"),
            Status::ModuleNotAnswering => write!(f, "ModuleNotAnswering"),
            Status::UnexpectedError => write!(f, "UnexpectedError"),
        }
    }
}

/// Result of polling the driver for communication readiness
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommReadiness {
    /// The handshake is still in progress
    NotReady,
    /// The module is ready to exchange process data
    Ready,
    /// The module reported an error during the handshake
    CommError,
}

/// Application status as reported to the fieldbus module
///
/// Values match the application status codes of the module's application object. Only
/// `NoError` allows the module to enter the process-active state.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum AppStatus {
    /// Application running without error
    NoError = 0x00,
    /// Application has not yet synchronized to the SYNC signal
    #[default]
    NotSynced = 0x01,
    /// Invalid SYNC configuration
    SyncCfgError = 0x02,
    /// Invalid read process data configuration
    ReadPdCfgError = 0x03,
    /// Invalid write process data configuration
    WritePdCfgError = 0x04,
    /// Synchronization was lost
    SyncLoss = 0x05,
    /// Too much process data was lost
    ExcessiveDataLoss = 0x06,
    /// Output error
    OutputError = 0x07,
}

#[derive(Clone, Copy, Debug)]
/// An error for [`AppStatus::try_from()`]
pub struct InvalidAppStatusError(pub u8);

impl TryFrom<u8> for AppStatus {
    type Error = InvalidAppStatusError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use AppStatus::*;
        match value {
            0x00 => Ok(NoError),
            0x01 => Ok(NotSynced),
            0x02 => Ok(SyncCfgError),
            0x03 => Ok(ReadPdCfgError),
            0x04 => Ok(WritePdCfgError),
            0x05 => Ok(SyncLoss),
            0x06 => Ok(ExcessiveDataLoss),
            0x07 => Ok(OutputError),
            _ => Err(InvalidAppStatusError(value)),
        }
    }
}
