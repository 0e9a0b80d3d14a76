//! Session store facade composing the catalog, payload sidecar, embedded
//! WAL, mutation tracker and audit queue into load/save/compact/resume
//! operations.

pub mod audit;
pub mod compact;
pub mod lifecycle;
pub mod mutation;
pub mod query;

pub use audit::AuditQueue;
pub use lifecycle::Store;
