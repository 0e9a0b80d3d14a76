//! File-format magic numbers and operational defaults.

/// Magic prefix of the metadata (`.rvm`) file.
pub const META_MAGIC: [u8; 4] = *b"RVM\0";
/// Magic prefix of the payload sidecar (`.rvs`) file.
pub const SIDECAR_MAGIC: [u8; 4] = *b"RVS\0";

/// On-disk format version, bumped on incompatible layout changes.
pub const FORMAT_VERSION: u16 = 0x0102;

/// Fixed size of the metadata file header.
pub const HEADER_SIZE: u64 = 96;
/// Fixed size of the sidecar header; payload offsets start past it.
pub const SIDECAR_HEADER_SIZE: u64 = 64;

/// Byte offset of the embedded WAL region inside the metadata file.
pub const WAL_OFFSET: u64 = 4096;
/// Default WAL region size.
pub const WAL_SIZE_DEFAULT: u64 = 4 * 1024 * 1024;
/// Occupancy ratio past which a checkpoint is recommended.
pub const WAL_CHECKPOINT_THRESHOLD: f64 = 0.6;
/// Appends since the last checkpoint past which a checkpoint is recommended.
pub const WAL_CHECKPOINT_PERIOD: u64 = 4096;

/// Upper bound on a catalog snapshot we are willing to read back.
pub const MAX_CATALOG_BYTES: u64 = 512 * 1024 * 1024;

/// Default bounded capacity of the audit queue; `enqueue` blocks past this.
pub const AUDIT_QUEUE_CAPACITY: usize = 1024;
/// Maximum number of audit entries the consumer sequences per batch.
pub const AUDIT_BATCH_LIMIT: usize = 128;

/// zstd level applied to payloads appended with the compressed encoding.
pub const ZSTD_LEVEL: i32 = 3;

/// Extension of the sidecar file paired with a metadata file.
pub const SIDECAR_EXTENSION: &str = "rvs";
/// Suffix of the staging file a sidecar compaction writes before the swap.
pub const COMPACT_SUFFIX: &str = "compact";
