/// Outcome of an asynchronous operation, as delivered to a completion handler
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ErrorCode {
    /// The operation completed normally
    #[default]
    Success,
    /// The operation was cancelled before the hardware completed it
    Aborted,
    /// The peripheral answered with a frame which violates the wire protocol
    HwProtocolError,
}

impl ErrorCode {
    /// Returns true for [`ErrorCode::Success`]
    pub fn is_success(&self) -> bool {
        *self == ErrorCode::Success
    }
}

impl core::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ErrorCode::Success => write!(f, "Success"),
            ErrorCode::Aborted => write!(f, "Aborted"),
            ErrorCode::HwProtocolError => write!(f, "HwProtocolError"),
        }
    }
}
