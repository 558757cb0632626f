//! Error types.
//!
//! Adapter failures surface verbatim as [`FtlError::Io`]; the FTL never
//! retries them. Running out of free sectors is reported as
//! [`FtlError::CorruptFormat`], since the reserved overhead rules it out on a
//! consistent medium.

use thiserror::Error;

use crate::config::SectorNbr;

/// Errors raised by a [`crate::flash::NorFlash`] adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlashError {
    #[error("access at {offset:#x}+{len} outside device of {size} bytes")]
    OutOfBounds { offset: u64, len: usize, size: u64 },

    #[error("block {0} does not exist")]
    BadBlock(u32),

    /// Program tried to turn a 0 bit back into 1 without an erase.
    #[error("program at {offset:#x} would set cleared bits")]
    BitSet { offset: u64 },

    #[error("power lost")]
    PowerLoss,
}

#[derive(Debug, Error)]
pub enum FtlError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("corrupt format: {0}")]
    CorruptFormat(String),

    #[error("I/O error: {0}")]
    Io(#[from] FlashError),

    #[error("device not mounted")]
    NotMounted,

    #[error("sectors {start}+{count} beyond capacity of {capacity}")]
    OutOfRange {
        start: SectorNbr,
        count: SectorNbr,
        capacity: SectorNbr,
    },

    #[error("buffer holds {actual} bytes, {expected} expected")]
    BufferSize { expected: usize, actual: usize },
}

pub type Result<T> = core::result::Result<T, FtlError>;
