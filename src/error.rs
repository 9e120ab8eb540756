//! Typed error taxonomy (`spec.md` §7), realized with `thiserror` the way
//! `onuse-moses/core/src/error.rs` realizes its own domain error enum.

use block_device::DeviceError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EssError {
    // --- Format/mount ---
    #[error("block {idx} is not a valid section system info block")]
    BadInfoBlock { idx: u16 },
    #[error("section system version mismatch: on-media {found:#06x}, expected {expected:#06x}")]
    InvalidVersion { found: u16, expected: u16 },
    #[error("storage geometry mismatch: {reason}")]
    StorageSizeMismatch { reason: String },
    #[error("engine is not in a state that permits this operation (current: {current})")]
    InsufficientState { current: String },
    #[error("invalid block size/geometry configuration: {reason}")]
    ConfigError { reason: String },

    // --- Media integrity ---
    #[error("CRC mismatch on block {idx}")]
    CrcError { idx: u16 },
    #[error("invalid header on block {idx}: {reason}")]
    InvalidHeader { reason: String, idx: u16 },
    #[error("block linkage error at block {idx}: {reason}")]
    BlockLinkage { reason: String, idx: u16 },
    #[error("read-back verification failed after writing block {idx}")]
    VolatileStorage { idx: u16 },
    #[error("in-memory block failed validation before being stored: {reason}")]
    LogicError { reason: String },

    // --- Logical ---
    #[error("invalid section name: {reason}")]
    InvalidName { reason: String },
    #[error("no section named {name:?}")]
    NoSuchFile { name: String },
    #[error("section {name:?} already exists")]
    FileAlreadyExisting { name: String },
    #[error("section {name:?} is already locked by another stream")]
    FileAlreadyAccessed { name: String },
    #[error("insufficient free space to complete the operation")]
    InsufficientSpace,
    #[error("cannot unmount: {count} section stream(s) are still open")]
    NotAllSectionsClosed { count: usize },

    // --- I/O ---
    #[error("device error: {0}")]
    Io(#[from] DeviceError),

    // --- Stream ---
    #[error("unexpected end of section data")]
    EmptyStream,
    #[error("stream is already closed")]
    ClosedStream,
    #[error("stream is in the error state and cannot be used")]
    ErrorState,
    #[error("remaining bits did not match the expected count: {reason}")]
    RemainingBits { reason: String },
}

pub type EssResult<T> = Result<T, EssError>;
