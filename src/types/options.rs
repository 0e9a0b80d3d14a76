//! Store configuration and the structured reports returned by lifecycle
//! operations.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::attrs::{AttrValue, Tag};
use super::entities::PayloadEncoding;
use crate::constants::{AUDIT_BATCH_LIMIT, AUDIT_QUEUE_CAPACITY, WAL_SIZE_DEFAULT};

/// Tunables for one store handle. Operational policy lives here rather than
/// in the engine: the right worker count is deployment-specific.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Size of the embedded WAL region, fixed at creation.
    pub wal_size: u64,
    /// Bounded audit queue capacity; `enqueue` blocks past it.
    pub audit_queue_capacity: usize,
    /// Entries the audit consumer sequences per wakeup.
    pub audit_batch_limit: usize,
    /// Encoding applied to payload appends.
    pub payload_encoding: PayloadEncoding,
    /// Suggested parallelism for external redaction/export workers.
    pub worker_threads: usize,
    /// Defer fsync on WAL and sidecar writes until the next save. Only for
    /// bulk ingestion where the source data can be re-read after a crash.
    pub defer_sync: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            wal_size: WAL_SIZE_DEFAULT,
            audit_queue_capacity: AUDIT_QUEUE_CAPACITY,
            audit_batch_limit: AUDIT_BATCH_LIMIT,
            payload_encoding: PayloadEncoding::Zstd,
            worker_threads: num_cpus::get(),
            defer_sync: false,
        }
    }
}

impl StoreOptions {
    #[must_use]
    pub fn wal_size(mut self, bytes: u64) -> Self {
        self.wal_size = bytes;
        self
    }

    #[must_use]
    pub fn audit_queue_capacity(mut self, capacity: usize) -> Self {
        self.audit_queue_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn audit_batch_limit(mut self, limit: usize) -> Self {
        self.audit_batch_limit = limit.max(1);
        self
    }

    #[must_use]
    pub fn payload_encoding(mut self, encoding: PayloadEncoding) -> Self {
        self.payload_encoding = encoding;
        self
    }

    #[must_use]
    pub fn worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = count.max(1);
        self
    }

    #[must_use]
    pub fn defer_sync(mut self, defer: bool) -> Self {
        self.defer_sync = defer;
        self
    }
}

/// Filters for streaming instance queries. All present fields must match;
/// device and date filters resolve through the owning series and study.
#[derive(Debug, Clone, Default)]
pub struct InstanceQuery {
    pub patient_id: Option<String>,
    pub study_uid: Option<String>,
    pub series_uid: Option<String>,
    pub modality: Option<String>,
    pub device_serial_number: Option<String>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub tag_equals: Option<(Tag, AttrValue)>,
}

impl InstanceQuery {
    #[must_use]
    pub fn patient(mut self, patient_id: impl Into<String>) -> Self {
        self.patient_id = Some(patient_id.into());
        self
    }

    #[must_use]
    pub fn study(mut self, study_uid: impl Into<String>) -> Self {
        self.study_uid = Some(study_uid.into());
        self
    }

    #[must_use]
    pub fn series(mut self, series_uid: impl Into<String>) -> Self {
        self.series_uid = Some(series_uid.into());
        self
    }

    #[must_use]
    pub fn modality(mut self, modality: impl Into<String>) -> Self {
        self.modality = Some(modality.into());
        self
    }

    #[must_use]
    pub fn device_serial(mut self, serial: impl Into<String>) -> Self {
        self.device_serial_number = Some(serial.into());
        self
    }

    #[must_use]
    pub fn date_range(mut self, from: Option<NaiveDate>, to: Option<NaiveDate>) -> Self {
        self.date_from = from;
        self.date_to = to;
        self
    }

    #[must_use]
    pub fn where_tag(mut self, tag: Tag, value: AttrValue) -> Self {
        self.tag_equals = Some((tag, value));
        self
    }
}

/// Why a record was excluded from normal iteration at load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuarantineReason {
    /// The payload reference points outside the current sidecar.
    DanglingPayload {
        offset: u64,
        length: u64,
        sidecar_len: u64,
    },
    /// The payload bytes failed their content-hash check on read.
    PayloadHashMismatch { expected: String, actual: String },
}

impl fmt::Display for QuarantineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DanglingPayload {
                offset,
                length,
                sidecar_len,
            } => write!(
                f,
                "payload range {offset}+{length} dangles past sidecar length {sidecar_len}"
            ),
            Self::PayloadHashMismatch { expected, actual } => {
                write!(f, "payload hash mismatch: expected {expected}, got {actual}")
            }
        }
    }
}

/// Non-fatal conditions surfaced by `open`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreWarning {
    /// Audit entries were accepted before an interrupted shutdown but never
    /// reached the table. The data mutations they describe are intact.
    IncompleteAudit { issued: u64, recorded: u64 },
    /// Sidecar bytes no live record references; reclaimable by `compact`.
    OrphanPayload { bytes: u64 },
    /// A crashed compaction swap was found and completed.
    CompactionResumed,
}

/// Outcome of `open`/`resume`: per-record problems instead of a failed load.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub quarantined: Vec<(String, QuarantineReason)>,
    pub warnings: Vec<StoreWarning>,
    /// WAL records applied on top of the last snapshot.
    pub replayed_ops: u64,
}

/// Outcome of `save`. A clean save on a store with nothing pending is a
/// no-op and reports itself as such.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveReport {
    pub clean: bool,
    pub flushed_instances: usize,
    pub audit_entries_written: usize,
    pub catalog_bytes: u64,
}

/// Outcome of `compact`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactReport {
    pub reclaimed_bytes: u64,
    pub live_bytes: u64,
    pub remapped_instances: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub patients: usize,
    pub studies: usize,
    pub series: usize,
    pub instances: usize,
    pub quarantined: usize,
    pub audit_entries: u64,
    pub phi_findings: usize,
    pub machine_rules: usize,
    pub sidecar_bytes: u64,
}
