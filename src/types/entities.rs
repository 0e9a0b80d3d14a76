//! Entity records of the patient/study/series/instance hierarchy, plus the
//! privacy-analysis and redaction-rule records persisted alongside them.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::attrs::{AttrValue, Tag};

/// Root identity. Created on first-seen identifier during ingestion; updated
/// in place, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientRecord {
    pub patient_id: String,
    pub display_name: String,
}

/// One clinical visit under a patient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyRecord {
    pub study_uid: String,
    pub date: Option<NaiveDate>,
    pub patient_id: String,
}

/// One acquisition run. The device fields drive machine-based redaction-rule
/// matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesRecord {
    pub series_uid: String,
    pub modality: String,
    pub manufacturer: String,
    pub model_name: String,
    pub device_serial_number: String,
    pub study_uid: String,
}

/// How a payload's bytes are stored in the sidecar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadEncoding {
    Raw,
    Zstd,
}

/// Address of one opaque payload blob inside the sidecar.
///
/// `length` and `content_hash` describe the stored bytes, so integrity is
/// checked before any decoding happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadRef {
    pub offset: u64,
    pub length: u64,
    pub content_hash: [u8; 32],
    pub encoding: PayloadEncoding,
}

impl PayloadRef {
    #[must_use]
    pub fn hash_hex(&self) -> String {
        hex::encode(self.content_hash)
    }
}

/// One payload-bearing record. Dense (even-group) attributes live in `core`;
/// sparse attributes live in the catalog's vertical table keyed by
/// [`super::AttributeKey`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_uid: String,
    pub series_uid: String,
    pub core: BTreeMap<Tag, AttrValue>,
    pub payload: Option<PayloadRef>,
    pub version: u64,
}

/// Everything a caller supplies to ingest one instance; the store fills in
/// the payload reference and version.
#[derive(Debug, Clone, Default)]
pub struct InstanceDraft {
    pub instance_uid: String,
    pub series_uid: String,
    pub core: BTreeMap<Tag, AttrValue>,
}

impl InstanceDraft {
    #[must_use]
    pub fn new(instance_uid: impl Into<String>, series_uid: impl Into<String>) -> Self {
        Self {
            instance_uid: instance_uid.into(),
            series_uid: series_uid.into(),
            core: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn attribute(mut self, tag: Tag, value: AttrValue) -> Self {
        self.core.insert(tag, value);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationAction {
    Remove,
    Replace,
    Hash,
    Encrypt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhiRemediation {
    pub action: RemediationAction,
    pub new_value: Option<String>,
}

/// A privacy finding produced by the analysis collaborator and persisted by
/// this core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhiFinding {
    pub entity_uid: String,
    pub entity_type: String,
    pub field_name: String,
    pub value: String,
    pub reason: String,
    pub patient_id: String,
    pub remediation: Option<PhiRemediation>,
}

/// A pixel region to black out, in row/column coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedactionZone {
    pub row_start: u32,
    pub row_end: u32,
    pub col_start: u32,
    pub col_end: u32,
}

/// Device-keyed redaction configuration. Matched against a series' device
/// serial number; never mutated by the core itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineRule {
    pub serial_number: String,
    pub manufacturer: String,
    pub model: String,
    pub zones: Vec<RedactionZone>,
}
