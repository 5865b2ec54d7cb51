//! Crate-wide error type.
//!
//! Every fallible operation in the core returns [`Result<T>`]. Some variants
//! are terminal for the operation that raised them (`OutOfCapacity`,
//! `TransportError`); others are recovered inline by the caller
//! (`ContentionBackoff`, `StaleLookup`, `Timeout`, `MappingFailure`) and only
//! surface here so call sites can log and retry.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("pool out of capacity: {0}")]
    OutOfCapacity(String),

    #[error("ghost mapping failed for slot {slot_idx}: {reason}")]
    MappingFailure { slot_idx: u32, reason: String },

    #[error("block transport error for chunk {chunk_id}: {reason}")]
    TransportError { chunk_id: u64, reason: String },

    #[error("channel {channel_id} derailed at monotonic id {monotonic_id}")]
    Derailment { channel_id: u64, monotonic_id: u64 },

    #[error("contention backoff on {0}")]
    ContentionBackoff(&'static str),

    #[error("stale lookup for chunk {0}")]
    StaleLookup(u64),

    #[error("timeout waiting for work")]
    Timeout,

    #[error("no channel with id {0}")]
    NoChannel(u64),

    #[error("no pool with key {0}")]
    NoPool(u64),

    #[error("argument copy failed: {0}")]
    ArgCopy(String),

    #[error("user VM setup failed: {0}")]
    VmSetup(String),

    #[error("CPU affinity pin failed: {0}")]
    CpuAffinity(String),
}

impl CoreError {
    /// Maps onto the historical negative-integer return-code contract
    /// (0 success; -1 arg copy; -2 VM setup; -3 CPU affinity; other negative
    /// = ENOMEM/EBADF) for callers that still speak that ABI.
    pub fn as_legacy_code(&self) -> i32 {
        match self {
            CoreError::ArgCopy(_) => -1,
            CoreError::VmSetup(_) => -2,
            CoreError::CpuAffinity(_) => -3,
            CoreError::NoChannel(_) | CoreError::NoPool(_) => -(libc::EBADF),
            _ => -(libc::ENOMEM),
        }
    }
}

impl From<crate::transport::TransportError> for CoreError {
    fn from(e: crate::transport::TransportError) -> Self {
        CoreError::TransportError {
            chunk_id: e.chunk_id,
            reason: e.reason,
        }
    }
}

impl From<crate::mapper::MapperError> for CoreError {
    fn from(e: crate::mapper::MapperError) -> Self {
        CoreError::MappingFailure {
            slot_idx: e.slot_idx,
            reason: e.reason,
        }
    }
}
