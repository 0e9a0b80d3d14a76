//! Low-level file plumbing: the fixed header codec and the embedded WAL.

pub mod header;
pub mod wal;
