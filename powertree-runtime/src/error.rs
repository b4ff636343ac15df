//! Error types for the powertree runtime

use powertree_common::{DecodeError, Domain, InvalidTransition};
use std::time::Duration;
use thiserror::Error;

/// Alias for `Result<T, Error>`
pub type Result<T> = std::result::Result<T, Error>;

/// powertree runtime errors
#[derive(Error, Debug)]
pub enum Error {
    /// No hardware generation claims the running platform
    #[error("unsupported platform id {0:#x}")]
    UnsupportedPlatform(i32),

    /// Register files or topology could not be set up
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Register name or offset not in the offset table
    #[error("unknown register: {0}")]
    UnknownRegister(String),

    /// Domain index past the topology count
    #[error("invalid {domain} index {index} (count {count})")]
    InvalidDomain {
        domain: Domain,
        index: usize,
        count: usize,
    },

    /// Write would alter bits outside the register's write mask
    #[error("value {value:#x} for {register} sets bits outside write mask {mask:#x}")]
    WriteMask {
        register: String,
        value: u64,
        mask: u64,
    },

    /// Read or write syscall on a register file failed
    #[error("register I/O failed on {domain} {index} ({register}): {source}")]
    RegisterIo {
        domain: Domain,
        index: usize,
        register: String,
        #[source]
        source: std::io::Error,
    },

    /// Policy requires finer control than the platform offers
    #[error("policy requires {requested} control, platform controls at {supported}")]
    UnsupportedGranularity { requested: Domain, supported: Domain },

    /// Shared-memory lock was not acquired in time
    #[error("timed out after {0:?} waiting for shared-memory lock")]
    LockTimeout(Duration),

    /// Caller's sample buffer cannot hold one batch
    #[error("sample buffer holds {actual} entries, platform needs {required}")]
    BufferTooSmall { required: usize, actual: usize },

    /// Handshake has not reached a state that allows sampling
    #[error("sampling refused: handshake not active")]
    NotActive,

    /// Status word refused the transition
    #[error("{0}")]
    InvalidTransition(InvalidTransition),

    /// Child samples describe different regions
    #[error("region mismatch: expected {expected:#x}, found {found:#x}")]
    RegionMismatch { expected: u64, found: u64 },

    /// Shared-memory object could not be created, opened, or mapped
    #[error("shared memory error: {0}")]
    Shmem(#[from] std::io::Error),

    /// Malformed control-plane message
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Failures worth retrying next cycle rather than aborting
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::RegisterIo { .. } | Error::LockTimeout(_))
    }
}

impl From<InvalidTransition> for Error {
    fn from(err: InvalidTransition) -> Self {
        Error::InvalidTransition(err)
    }
}

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Self {
        Error::Protocol(err.to_string())
    }
}
