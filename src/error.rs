use thiserror::Error;

/// Error codes surfaced by the protocol layer. Applications see these as return values and on
///  the event channels of connections and acceptors; nothing in here is fatal to the process.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BdtError {
    /// A requested vport or session id is already taken
    #[error("conflict")]
    Conflict,

    /// The operation is not valid in the current state of the connection / acceptor / stack
    #[error("invalid state")]
    InvalidState,

    /// Handshake never confirmed, or the peer went silent
    #[error("timeout")]
    Timeout,

    /// A buffer or package exceeds its size limit
    #[error("out of size")]
    OutOfSize,

    /// Declared lengths are inconsistent or the body is malformed
    #[error("invalid package")]
    InvalidPackage,

    /// Bad magic or unknown command type
    #[error("unmatched package")]
    UnmatchPackage,

    #[error("invalid arguments")]
    InvalidArgs,

    /// No free vport or session id left
    #[error("too many connections")]
    TooMuchConnection,

    #[error("protocol version not supported")]
    NotSupportVersion,
}

pub type BdtResult<T> = Result<T, BdtError>;

impl BdtError {
    pub const SUCCESS: u32 = 0;

    /// the integer code of this error, with [BdtError::SUCCESS] reserved for success
    pub fn code(&self) -> u32 {
        match self {
            BdtError::Conflict => 1,
            BdtError::InvalidState => 2,
            BdtError::Timeout => 3,
            BdtError::OutOfSize => 4,
            BdtError::InvalidPackage => 5,
            BdtError::UnmatchPackage => 6,
            BdtError::InvalidArgs => 7,
            BdtError::TooMuchConnection => 8,
            BdtError::NotSupportVersion => 9,
        }
    }

    /// Framing errors cause the offending packet to be dropped, never the connection
    pub fn is_framing(&self) -> bool {
        matches!(self,
            BdtError::OutOfSize | BdtError::InvalidPackage | BdtError::UnmatchPackage | BdtError::NotSupportVersion
        )
    }
}

pub fn result_code<T>(result: &BdtResult<T>) -> u32 {
    match result {
        Ok(_) => BdtError::SUCCESS,
        Err(e) => e.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::conflict(BdtError::Conflict, 1, false)]
    #[case::invalid_state(BdtError::InvalidState, 2, false)]
    #[case::timeout(BdtError::Timeout, 3, false)]
    #[case::out_of_size(BdtError::OutOfSize, 4, true)]
    #[case::invalid_package(BdtError::InvalidPackage, 5, true)]
    #[case::unmatch_package(BdtError::UnmatchPackage, 6, true)]
    #[case::invalid_args(BdtError::InvalidArgs, 7, false)]
    #[case::too_much_connection(BdtError::TooMuchConnection, 8, false)]
    #[case::not_support_version(BdtError::NotSupportVersion, 9, true)]
    fn test_code(#[case] error: BdtError, #[case] expected_code: u32, #[case] expected_framing: bool) {
        assert_eq!(error.code(), expected_code);
        assert_eq!(error.is_framing(), expected_framing);
        assert_eq!(result_code::<()>(&Err(error)), expected_code);
    }

    #[test]
    fn test_success_code() {
        assert_eq!(result_code(&Ok(5)), BdtError::SUCCESS);
    }
}
