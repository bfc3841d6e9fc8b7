//! Error types for DMS Core.
//!
//! Every operation returns a [`DmsResult`]. Errors that cross the wire (the
//! result of a remote start request) travel as the numeric codes in
//! [`codes`] and are turned back into a [`DmsError`] with
//! [`DmsError::from_code`].

use thiserror::Error;

use dms_proto::TlvError;
use dms_transport::TransportError;

/// Stable numeric result codes.
pub mod codes {
    pub const SUCCESS: u16 = 0;
    pub const FAILURE: u16 = 1;
    pub const INVALID_PARAMETER: u16 = 2;
    pub const BUSY: u16 = 3;
    pub const BUNDLE_LOOKUP_FAILURE: u16 = 4;
    pub const REGISTRY_UNAVAILABLE: u16 = 5;
    pub const PERMISSION_MISMATCH: u16 = 6;
    pub const UNAUTHORIZED_CALLER: u16 = 7;
}

/// Unified error type for DMS Core operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DmsError {
    /// Caller-supplied argument is unusable
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Generic transport or registry failure
    #[error("operation failed: {0}")]
    Failure(String),

    /// Bundle registry has no usable record for the bundle
    #[error("bundle lookup failed: {0}")]
    BundleLookupFailure(String),

    /// In-process registry interface could not be obtained
    #[error("bundle registry unavailable")]
    RegistryUnavailable,

    /// Claimed and real signing identities differ
    #[error("signature mismatch")]
    PermissionMismatch,

    /// The verifying process may not query the registry
    #[error("caller is not authorized to query the bundle registry")]
    UnauthorizedCaller,

    /// The single session slot is occupied
    #[error("session busy")]
    Busy,
}

/// Result alias used across the crate.
pub type DmsResult<T> = Result<T, DmsError>;

impl DmsError {
    pub fn failure(msg: impl Into<String>) -> Self {
        DmsError::Failure(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        DmsError::InvalidParameter(msg.into())
    }

    /// Numeric code for this error.
    pub fn code(&self) -> u16 {
        match self {
            DmsError::Failure(_) => codes::FAILURE,
            DmsError::InvalidParameter(_) => codes::INVALID_PARAMETER,
            DmsError::Busy => codes::BUSY,
            DmsError::BundleLookupFailure(_) => codes::BUNDLE_LOOKUP_FAILURE,
            DmsError::RegistryUnavailable => codes::REGISTRY_UNAVAILABLE,
            DmsError::PermissionMismatch => codes::PERMISSION_MISMATCH,
            DmsError::UnauthorizedCaller => codes::UNAUTHORIZED_CALLER,
        }
    }

    /// Map a code received from a peer back to a result.
    pub fn from_code(code: u16) -> DmsResult<()> {
        match code {
            codes::SUCCESS => Ok(()),
            codes::INVALID_PARAMETER => Err(DmsError::invalid("rejected by peer")),
            codes::BUSY => Err(DmsError::Busy),
            codes::BUNDLE_LOOKUP_FAILURE => {
                Err(DmsError::BundleLookupFailure("reported by peer".into()))
            }
            codes::REGISTRY_UNAVAILABLE => Err(DmsError::RegistryUnavailable),
            codes::PERMISSION_MISMATCH => Err(DmsError::PermissionMismatch),
            codes::UNAUTHORIZED_CALLER => Err(DmsError::UnauthorizedCaller),
            codes::FAILURE => Err(DmsError::failure("reported by peer")),
            other => Err(DmsError::failure(format!("unknown peer result code {other}"))),
        }
    }
}

impl From<TransportError> for DmsError {
    fn from(e: TransportError) -> Self {
        DmsError::Failure(e.to_string())
    }
}

impl From<TlvError> for DmsError {
    fn from(e: TlvError) -> Self {
        match e {
            TlvError::PacketTooLarge(..) | TlvError::ValueTooLong { .. } => {
                DmsError::InvalidParameter(e.to_string())
            }
            other => DmsError::Failure(other.to_string()),
        }
    }
}
