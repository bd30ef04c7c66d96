//! FCOM error taxonomy.
//!
//! Every public operation returns one of these kinds; there is no
//! exceptional control flow anywhere in the library. System errors keep
//! the raw errno so callers can distinguish, say, a refused multicast
//! join from an exhausted descriptor table.

/// Errors reported by FCOM operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FcomError {
    #[error("invalid FCOM ID")]
    InvalidId,

    #[error("no space (FCOM)")]
    NoSpace,

    #[error("invalid FCOM element type")]
    InvalidType,

    #[error("invalid element count (FCOM)")]
    InvalidCount,

    #[error("internal FCOM error")]
    Internal,

    #[error("ID not subscribed to FCOM")]
    NotSubscribed,

    #[error("FCOM ID not found")]
    IdNotFound,

    #[error("invalid/unsupported FCOM version")]
    BadVersion,

    #[error("no memory or buffer (FCOM)")]
    NoMemory,

    #[error("invalid argument (FCOM)")]
    InvalidArg,

    #[error("no data received (FCOM)")]
    NoData,

    #[error("trying to use unsupported FCOM feature")]
    Unsupp,

    #[error("FCOM timeout")]
    TimedOut,

    #[error("ID still in use")]
    IdInUse,

    /// A system call failed; carries the errno value.
    #[error("system error (FCOM): errno {0}")]
    Sys(i32),
}

impl From<std::io::Error> for FcomError {
    fn from(e: std::io::Error) -> Self {
        FcomError::Sys(e.raw_os_error().unwrap_or(0))
    }
}

/// Shorthand used throughout the workspace.
pub type FcomResult<T> = Result<T, FcomError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sys_error_keeps_errno() {
        let io = std::io::Error::from_raw_os_error(13);
        assert_eq!(FcomError::from(io), FcomError::Sys(13));
    }

    #[test]
    fn display_names_the_kind() {
        assert!(FcomError::TimedOut.to_string().contains("timeout"));
        assert!(FcomError::Sys(13).to_string().contains("13"));
    }
}
