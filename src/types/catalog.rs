//! The catalog: every entity table of one session store, serialized as a
//! single bincode snapshot at save time, plus the metadata file header that
//! anchors it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::attrs::{AttrValue, AttributeKey};
use super::audit::AuditLogEntry;
use super::entities::{
    InstanceRecord, MachineRule, PatientRecord, PhiFinding, SeriesRecord, StudyRecord,
};

/// In-memory mirror of the metadata file's fixed header block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: [u8; 4],
    pub version: u16,
    /// Identity of this store; also stamped into the sidecar at creation.
    pub store_uid: [u8; 16],
    /// Offset of the current catalog snapshot; flipping this commits a save.
    pub footer_offset: u64,
    pub wal_offset: u64,
    pub wal_size: u64,
    pub wal_checkpoint_pos: u64,
    pub wal_sequence: u64,
    pub catalog_checksum: [u8; 32],
}

/// All entity tables of one store. Keys are the domain identifiers, so every
/// upsert is idempotent by construction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    /// Filename (not path) of the paired sidecar, resolved next to the
    /// metadata file.
    pub sidecar_file: String,
    /// Identity the paired sidecar must carry; replaced by compaction.
    pub sidecar_uid: [u8; 16],
    pub created_at: i64,

    pub patients: BTreeMap<String, PatientRecord>,
    pub studies: BTreeMap<String, StudyRecord>,
    pub series: BTreeMap<String, SeriesRecord>,
    pub instances: BTreeMap<String, InstanceRecord>,
    /// Sparse attribute rows; one instance's rows form a contiguous range.
    pub vertical: BTreeMap<AttributeKey, AttrValue>,

    pub audit_log: Vec<AuditLogEntry>,
    /// Producer-side count of audit enqueues accepted by the last save; used
    /// to detect log entries lost to an interrupted shutdown.
    pub audit_accepted: u64,
    pub phi_findings: Vec<PhiFinding>,
    pub machine_rules: BTreeMap<String, MachineRule>,
}

impl Catalog {
    #[must_use]
    pub fn max_audit_sequence(&self) -> u64 {
        self.audit_log.last().map_or(0, |entry| entry.sequence)
    }

    /// Sparse attributes of one instance, in tag order.
    pub fn vertical_range(
        &self,
        instance_uid: &str,
    ) -> impl Iterator<Item = (&AttributeKey, &AttrValue)> {
        self.vertical.range(
            AttributeKey::range_start(instance_uid)..=AttributeKey::range_end(instance_uid),
        )
    }
}
