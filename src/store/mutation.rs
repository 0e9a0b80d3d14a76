//! Catalog mutation: ingestion upserts, attribute routing, and the
//! compare-and-swap commit path for concurrent workers.
//!
//! Every mutation follows the same discipline: validate, apply to the
//! in-memory catalog, append one WAL record, then enqueue audit. The WAL
//! record is fsynced before the caller observes success, so an interrupted
//! session replays exactly the acknowledged mutations. Replay is idempotent:
//! upserts are keyed, version sets are absolute, and audit batches dedupe by
//! sequence.

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::store::lifecycle::Store;
use crate::types::{
    AttrValue, AttributeKey, AuditAction, AuditLogEntry, Catalog, InstanceDraft, InstanceRecord,
    MachineRule, PatientRecord, PayloadRef, PhiFinding, SeriesRecord, StudyRecord, Tag,
};

/// One logged catalog mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum WalOp {
    UpsertPatient(PatientRecord),
    UpsertStudy(StudyRecord),
    UpsertSeries(SeriesRecord),
    UpsertInstance(InstanceRecord),
    SetCoreAttribute {
        instance_uid: String,
        tag: Tag,
        value: AttrValue,
    },
    SetVerticalAttribute {
        instance_uid: String,
        tag: Tag,
        value: AttrValue,
    },
    CommitAttributes {
        instance_uid: String,
        changes: Vec<(Tag, AttrValue)>,
        version: u64,
    },
    SetPayloadRef {
        instance_uid: String,
        payload: PayloadRef,
        version: u64,
    },
    AppendPhiFinding(PhiFinding),
    UpsertMachineRule(MachineRule),
    AuditBatch(Vec<AuditLogEntry>),
}

/// Wire form of one WAL record. The audit watermark rides along so entries
/// lost to an interrupted shutdown are detectable on the next open.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct WalEnvelope {
    pub accepted_audit: u64,
    pub op: WalOp,
}

/// Apply one op to the catalog. Used for live mutation and WAL replay alike,
/// so both paths cannot drift apart.
pub(crate) fn apply_op(catalog: &mut Catalog, op: WalOp) {
    match op {
        WalOp::UpsertPatient(patient) => {
            catalog.patients.insert(patient.patient_id.clone(), patient);
        }
        WalOp::UpsertStudy(study) => {
            catalog.studies.insert(study.study_uid.clone(), study);
        }
        WalOp::UpsertSeries(series) => {
            catalog.series.insert(series.series_uid.clone(), series);
        }
        WalOp::UpsertInstance(instance) => {
            catalog
                .instances
                .insert(instance.instance_uid.clone(), instance);
        }
        WalOp::SetCoreAttribute {
            instance_uid,
            tag,
            value,
        } => {
            if let Some(instance) = catalog.instances.get_mut(&instance_uid) {
                instance.core.insert(tag, value);
            }
        }
        WalOp::SetVerticalAttribute {
            instance_uid,
            tag,
            value,
        } => {
            catalog
                .vertical
                .insert(AttributeKey::new(instance_uid, tag), value);
        }
        WalOp::CommitAttributes {
            instance_uid,
            changes,
            version,
        } => {
            for (tag, value) in changes {
                if tag.is_core() {
                    if let Some(instance) = catalog.instances.get_mut(&instance_uid) {
                        instance.core.insert(tag, value);
                    }
                } else {
                    catalog
                        .vertical
                        .insert(AttributeKey::new(instance_uid.clone(), tag), value);
                }
            }
            if let Some(instance) = catalog.instances.get_mut(&instance_uid) {
                instance.version = version;
            }
        }
        WalOp::SetPayloadRef {
            instance_uid,
            payload,
            version,
        } => {
            if let Some(instance) = catalog.instances.get_mut(&instance_uid) {
                instance.payload = Some(payload);
                instance.version = version;
            }
        }
        WalOp::AppendPhiFinding(finding) => {
            catalog.phi_findings.push(finding);
        }
        WalOp::UpsertMachineRule(rule) => {
            catalog
                .machine_rules
                .insert(rule.serial_number.clone(), rule);
        }
        WalOp::AuditBatch(entries) => {
            let mut max = catalog.max_audit_sequence();
            for entry in entries {
                if entry.sequence > max {
                    max = entry.sequence;
                    catalog.audit_log.push(entry);
                }
            }
        }
    }
}

impl Store {
    fn apply_and_log(&mut self, op: WalOp) -> Result<()> {
        apply_op(&mut self.catalog, op.clone());
        let envelope = WalEnvelope {
            accepted_audit: self.audit.accepted(),
            op,
        };
        self.log_op_bytes(&envelope)?;
        self.dirty = true;
        if self.wal.should_checkpoint() {
            self.snapshot_commit()?;
        }
        Ok(())
    }

    fn ensure_instance_known(&self, uid: &str) -> Result<()> {
        if !self.catalog.instances.contains_key(uid) {
            return Err(StoreError::UnknownInstance { uid: uid.into() });
        }
        if let Some(reason) = self.quarantine.read().get(uid) {
            return Err(StoreError::Quarantined {
                uid: uid.into(),
                reason: reason.to_string(),
            });
        }
        Ok(())
    }

    /// Idempotent insert-or-update of a patient, keyed by `patient_id`.
    pub fn upsert_patient(&mut self, patient: PatientRecord) -> Result<()> {
        self.assert_mutable()?;
        self.apply_and_log(WalOp::UpsertPatient(patient))
    }

    /// Idempotent insert-or-update of a study. The owning patient must
    /// already exist; referential integrity is enforced at write time.
    pub fn upsert_study(&mut self, study: StudyRecord) -> Result<()> {
        self.assert_mutable()?;
        if !self.catalog.patients.contains_key(&study.patient_id) {
            return Err(StoreError::ForeignKey {
                entity: format!("study {}", study.study_uid),
                missing: format!("patient {}", study.patient_id),
            });
        }
        self.apply_and_log(WalOp::UpsertStudy(study))
    }

    pub fn upsert_series(&mut self, series: SeriesRecord) -> Result<()> {
        self.assert_mutable()?;
        if !self.catalog.studies.contains_key(&series.study_uid) {
            return Err(StoreError::ForeignKey {
                entity: format!("series {}", series.series_uid),
                missing: format!("study {}", series.study_uid),
            });
        }
        self.apply_and_log(WalOp::UpsertSeries(series))
    }

    /// Insert-or-update a full instance row. Prefer
    /// [`ingest_instance`](Self::ingest_instance) for payload-bearing
    /// ingestion; this is the metadata-only upsert.
    pub fn upsert_instance(&mut self, instance: InstanceRecord) -> Result<()> {
        self.assert_mutable()?;
        if !self.catalog.series.contains_key(&instance.series_uid) {
            return Err(StoreError::ForeignKey {
                entity: format!("instance {}", instance.instance_uid),
                missing: format!("series {}", instance.series_uid),
            });
        }
        validate_core_parity(instance.core.keys())?;

        let uid = instance.instance_uid.clone();
        let version = instance.version;
        self.apply_and_log(WalOp::UpsertInstance(instance))?;
        self.tracker.register(&uid, version);
        self.tracker.mark_dirty(&uid)?;
        Ok(())
    }

    /// Ingest one payload-bearing record: sidecar append first, then the
    /// metadata row referencing it, then the audit entry.
    pub fn ingest_instance(&mut self, draft: InstanceDraft, payload: &[u8]) -> Result<PayloadRef> {
        self.assert_mutable()?;
        if !self.catalog.series.contains_key(&draft.series_uid) {
            return Err(StoreError::ForeignKey {
                entity: format!("instance {}", draft.instance_uid),
                missing: format!("series {}", draft.series_uid),
            });
        }
        validate_core_parity(draft.core.keys())?;

        let payload_ref = self
            .sidecar
            .append(payload, self.options.payload_encoding)?;
        let uid = draft.instance_uid.clone();
        let version = self
            .catalog
            .instances
            .get(&uid)
            .map_or(0, |existing| existing.version);
        let record = InstanceRecord {
            instance_uid: draft.instance_uid,
            series_uid: draft.series_uid,
            core: draft.core,
            payload: Some(payload_ref),
            version,
        };
        // Enqueue before the WAL envelope is written so the envelope's
        // watermark covers this entry; a crash that loses the entry is then
        // detectable on the next open.
        self.audit.enqueue(
            AuditAction::Ingest,
            &uid,
            format!(
                "payload {} bytes at offset {}",
                payload_ref.length, payload_ref.offset
            ),
        )?;
        self.apply_and_log(WalOp::UpsertInstance(record))?;
        self.tracker.register(&uid, version);
        self.tracker.mark_dirty(&uid)?;
        Ok(payload_ref)
    }

    /// Set one attribute, routed by group parity: even groups land in the
    /// dense per-instance map, odd groups in the vertical table.
    pub fn set_attribute(&mut self, uid: &str, tag: Tag, value: AttrValue) -> Result<()> {
        self.assert_mutable()?;
        self.ensure_instance_known(uid)?;
        let op = if tag.is_core() {
            WalOp::SetCoreAttribute {
                instance_uid: uid.to_string(),
                tag,
                value,
            }
        } else {
            WalOp::SetVerticalAttribute {
                instance_uid: uid.to_string(),
                tag,
                value,
            }
        };
        self.apply_and_log(op)?;
        self.tracker.mark_dirty(uid)?;
        Ok(())
    }

    /// Set a dense (standard) attribute. Rejects odd-group tags.
    pub fn set_core_attribute(&mut self, uid: &str, tag: Tag, value: AttrValue) -> Result<()> {
        if !tag.is_core() {
            return Err(StoreError::WrongParity {
                tag: tag.to_string(),
            });
        }
        self.set_attribute(uid, tag, value)
    }

    /// Set a sparse (private/vendor) attribute. Rejects even-group tags.
    pub fn set_vertical_attribute(
        &mut self,
        uid: &str,
        group: u16,
        element: u16,
        value: AttrValue,
    ) -> Result<()> {
        let tag = Tag::new(group, element);
        if tag.is_core() {
            return Err(StoreError::WrongParity {
                tag: tag.to_string(),
            });
        }
        self.set_attribute(uid, tag, value)
    }

    /// Commit an attribute batch under optimistic concurrency. Fails with
    /// `Conflict` when the stored version advanced past `expected_version`;
    /// the caller re-reads and retries. Returns the new version.
    pub fn commit_attributes(
        &mut self,
        uid: &str,
        expected_version: u64,
        changes: Vec<(Tag, AttrValue)>,
    ) -> Result<u64> {
        self.assert_mutable()?;
        self.ensure_instance_known(uid)?;
        let change_count = changes.len();
        let version = self.tracker.try_commit(uid, expected_version)?;
        self.audit.enqueue(
            AuditAction::AttributeUpdate,
            uid,
            format!("{change_count} attributes, version {version}"),
        )?;
        self.apply_and_log(WalOp::CommitAttributes {
            instance_uid: uid.to_string(),
            changes,
            version,
        })?;
        Ok(version)
    }

    /// Commit a replacement payload under optimistic concurrency: the
    /// redaction path. The new bytes are appended before the version claim,
    /// so a losing worker leaves only orphan bytes for the next `compact`;
    /// the old payload stays valid for whoever holds the current version.
    pub fn commit_payload(&mut self, uid: &str, expected_version: u64, payload: &[u8]) -> Result<u64> {
        self.assert_mutable()?;
        self.ensure_instance_known(uid)?;

        let payload_ref = self
            .sidecar
            .append(payload, self.options.payload_encoding)?;
        let version = self.tracker.try_commit(uid, expected_version)?;
        self.audit.enqueue(
            AuditAction::Redact,
            uid,
            format!(
                "payload replaced: {} bytes at offset {}, version {version}",
                payload_ref.length, payload_ref.offset
            ),
        )?;
        self.apply_and_log(WalOp::SetPayloadRef {
            instance_uid: uid.to_string(),
            payload: payload_ref,
            version,
        })?;
        Ok(version)
    }

    /// Version a worker should base its next commit on.
    pub fn instance_version(&self, uid: &str) -> Result<u64> {
        self.tracker.begin(uid)
    }

    /// Persist one privacy finding produced by the analysis collaborator.
    pub fn append_phi_finding(&mut self, finding: PhiFinding) -> Result<()> {
        self.assert_mutable()?;
        let entity_uid = finding.entity_uid.clone();
        let field = finding.field_name.clone();
        self.audit
            .enqueue(AuditAction::Finding, entity_uid, format!("field {field}"))?;
        self.apply_and_log(WalOp::AppendPhiFinding(finding))?;
        Ok(())
    }

    /// Register a device redaction rule. Serial numbers are unique:
    /// re-registering identical content is a no-op, different content is
    /// rejected.
    pub fn append_machine_rule(&mut self, rule: MachineRule) -> Result<()> {
        self.assert_mutable()?;
        if let Some(existing) = self.catalog.machine_rules.get(&rule.serial_number) {
            if *existing == rule {
                return Ok(());
            }
            return Err(StoreError::DuplicateRule {
                serial_number: rule.serial_number,
            });
        }
        let serial = rule.serial_number.clone();
        self.audit
            .enqueue(AuditAction::RuleRegistered, serial, "")?;
        self.apply_and_log(WalOp::UpsertMachineRule(rule))?;
        Ok(())
    }

    /// Read, verify, and decode an instance's payload bytes.
    pub fn read_payload(&self, uid: &str) -> Result<Vec<u8>> {
        self.ensure_instance_known(uid)?;
        let instance = self
            .catalog
            .instances
            .get(uid)
            .ok_or_else(|| StoreError::UnknownInstance { uid: uid.into() })?;
        let payload_ref = instance
            .payload
            .ok_or_else(|| StoreError::NoPayload { uid: uid.into() })?;

        match self.sidecar.read_payload(&payload_ref) {
            Ok(bytes) => Ok(bytes),
            Err(err @ StoreError::Integrity { .. }) => {
                // Hash mismatch means this one record is corrupt, not the
                // store; quarantine it and keep serving the rest.
                if let StoreError::Integrity {
                    expected, actual, ..
                } = &err
                {
                    self.quarantine.write().insert(
                        uid.to_string(),
                        crate::types::QuarantineReason::PayloadHashMismatch {
                            expected: expected.clone(),
                            actual: actual.clone(),
                        },
                    );
                }
                Err(err)
            }
            Err(err) => Err(err),
        }
    }
}

fn validate_core_parity<'a>(tags: impl Iterator<Item = &'a Tag>) -> Result<()> {
    for tag in tags {
        if !tag.is_core() {
            return Err(StoreError::WrongParity {
                tag: tag.to_string(),
            });
        }
    }
    Ok(())
}
