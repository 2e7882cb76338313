use thiserror::Error;

use crate::store::StoreError;

/// Well-known CNI error codes. Codes from 100 upward are plugin specific.
pub const ERR_INCOMPATIBLE_CNI_VERSION: u32 = 1;
pub const ERR_INVALID_ENVIRONMENT_VARIABLES: u32 = 4;
pub const ERR_IO_FAILURE: u32 = 5;
pub const ERR_DECODING_FAILURE: u32 = 6;
pub const ERR_INVALID_NETWORK_CONFIG: u32 = 7;
pub const ERR_NETWORK_RESOLUTION: u32 = 100;
pub const ERR_ALLOCATION: u32 = 101;
pub const ERR_NAMESPACE: u32 = 102;
pub const ERR_INTERNAL: u32 = 999;

pub type Result<T, E = CniError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum CniError {
    #[error("{0}")]
    Environment(String),
    #[error("{0}")]
    Io(String),
    #[error("{0}")]
    Decoding(String),
    #[error("{0}")]
    Config(String),
    #[error("{msg}")]
    Version { msg: String, details: String },
    #[error("{0}")]
    NetworkResolution(String),
    #[error("{0}")]
    Allocation(String),
    #[error("{0}")]
    Namespace(String),
    #[error("shared store failure: {0}")]
    Store(#[from] StoreError),
    #[error("{0}")]
    Internal(String),
}

impl CniError {
    /// CNI error code reported in the error document
    pub fn code(&self) -> u32 {
        match self {
            CniError::Environment(_) => ERR_INVALID_ENVIRONMENT_VARIABLES,
            CniError::Io(_) => ERR_IO_FAILURE,
            CniError::Decoding(_) => ERR_DECODING_FAILURE,
            CniError::Config(_) => ERR_INVALID_NETWORK_CONFIG,
            CniError::Version { .. } => ERR_INCOMPATIBLE_CNI_VERSION,
            CniError::NetworkResolution(_) => ERR_NETWORK_RESOLUTION,
            CniError::Allocation(_) => ERR_ALLOCATION,
            CniError::Namespace(_) => ERR_NAMESPACE,
            CniError::Store(_) | CniError::Internal(_) => ERR_INTERNAL,
        }
    }

    pub fn details(&self) -> String {
        match self {
            CniError::Version { details, .. } => details.clone(),
            _ => String::new(),
        }
    }

    pub fn version(msg: impl Into<String>, details: impl Into<String>) -> Self {
        CniError::Version {
            msg: msg.into(),
            details: details.into(),
        }
    }
}

impl From<std::io::Error> for CniError {
    fn from(err: std::io::Error) -> Self {
        CniError::Io(err.to_string())
    }
}
