//! Crate-wide error taxonomy for `radvault-core`.
//!
//! Record-scoped failures (`Range`, `Integrity`, `Conflict`) are recoverable
//! by quarantine or retry; structural failures (`Halted`, `InvalidCatalog`)
//! stop further mutation until the store is reopened and re-validated.

use std::path::PathBuf;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// The requested byte range falls outside the sidecar file. Also raised
    /// for a torn final append, which shortens the readable range without
    /// touching earlier blobs.
    #[error("payload range {offset}+{length} exceeds sidecar length {file_len}")]
    Range {
        offset: u64,
        length: u64,
        file_len: u64,
    },

    #[error("payload hash mismatch at offset {offset}: expected {expected}, got {actual}")]
    Integrity {
        offset: u64,
        expected: String,
        actual: String,
    },

    #[error("{entity} references missing {missing}")]
    ForeignKey { entity: String, missing: String },

    /// Optimistic-concurrency failure: the stored version advanced past the
    /// one the caller read. Re-read and retry.
    #[error(
        "stale commit for instance {instance_uid}: expected version {expected}, stored {actual}"
    )]
    Conflict {
        instance_uid: String,
        expected: u64,
        actual: u64,
    },

    #[error("metadata file names sidecar {path} but it does not exist")]
    MissingSidecar { path: PathBuf },

    #[error("sidecar {path} belongs to a different store")]
    StoreMismatch { path: PathBuf },

    #[error("machine rule for serial {serial_number} already registered with different content")]
    DuplicateRule { serial_number: String },

    #[error("unknown instance {uid}")]
    UnknownInstance { uid: String },

    #[error("instance {uid} carries no payload")]
    NoPayload { uid: String },

    #[error("instance {uid} is quarantined: {reason}")]
    Quarantined { uid: String, reason: String },

    #[error("tag {tag} has the wrong group parity for this attribute table")]
    WrongParity { tag: String },

    #[error("store is read-only; reopen with write access")]
    ReadOnly,

    #[error("store halted after a failed structural operation; reopen to re-validate")]
    Halted,

    #[error("embedded wal region full")]
    WalFull,

    #[error("wal corruption at offset {offset}: {reason}")]
    WalCorruption { offset: u64, reason: String },

    #[error("invalid header: {reason}")]
    InvalidHeader { reason: String },

    #[error("invalid catalog: {reason}")]
    InvalidCatalog { reason: String },

    #[error("decode failure: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("encode failure: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("lock: {0}")]
    Lock(String),

    #[error("audit queue unavailable: {0}")]
    AuditQueue(String),
}
