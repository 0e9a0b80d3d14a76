//! Streaming queries over the record graph.
//!
//! Queries iterate the dense instance table lazily and resolve context
//! (series, study, patient) through keyed lookups, so memory stays bounded
//! by one row regardless of corpus size. Sparse attributes are fetched by
//! keyed range lookup only for rows the caller actually touches, never the
//! inverse.

use crate::error::{Result, StoreError};
use crate::store::lifecycle::Store;
use crate::types::{
    AttrValue, AttributeKey, InstanceQuery, InstanceRecord, MachineRule, PatientRecord,
    QuarantineReason, SeriesRecord, StudyRecord, Tag,
};

impl Store {
    /// Stream instances matching `query`, excluding quarantined records.
    pub fn query<'a>(
        &'a self,
        query: &'a InstanceQuery,
    ) -> impl Iterator<Item = &'a InstanceRecord> + 'a {
        self.catalog.instances.values().filter(move |record| {
            !self.is_quarantined(&record.instance_uid) && self.query_matches(query, record)
        })
    }

    fn query_matches(&self, query: &InstanceQuery, record: &InstanceRecord) -> bool {
        if let Some(series_uid) = &query.series_uid {
            if record.series_uid != *series_uid {
                return false;
            }
        }
        let series = self.catalog.series.get(&record.series_uid);
        if let Some(modality) = &query.modality {
            if series.is_none_or(|series| series.modality != *modality) {
                return false;
            }
        }
        if let Some(serial) = &query.device_serial_number {
            if series.is_none_or(|series| series.device_serial_number != *serial) {
                return false;
            }
        }

        let study = series.and_then(|series| self.catalog.studies.get(&series.study_uid));
        if let Some(study_uid) = &query.study_uid {
            if study.is_none_or(|study| study.study_uid != *study_uid) {
                return false;
            }
        }
        if let Some(patient_id) = &query.patient_id {
            if study.is_none_or(|study| study.patient_id != *patient_id) {
                return false;
            }
        }
        if query.date_from.is_some() || query.date_to.is_some() {
            let Some(date) = study.and_then(|study| study.date) else {
                return false;
            };
            if query.date_from.is_some_and(|from| date < from) {
                return false;
            }
            if query.date_to.is_some_and(|to| date > to) {
                return false;
            }
        }

        if let Some((tag, value)) = &query.tag_equals {
            let found = if tag.is_core() {
                record.core.get(tag)
            } else {
                self.catalog
                    .vertical
                    .get(&AttributeKey::new(record.instance_uid.clone(), *tag))
            };
            if found != Some(value) {
                return false;
            }
        }
        true
    }

    /// One instance by uid. Quarantined records are rejected here; use
    /// [`quarantined_instance`](Self::quarantined_instance) to inspect them.
    pub fn instance(&self, uid: &str) -> Result<&InstanceRecord> {
        if let Some(reason) = self.quarantine.read().get(uid) {
            return Err(StoreError::Quarantined {
                uid: uid.into(),
                reason: reason.to_string(),
            });
        }
        self.catalog
            .instances
            .get(uid)
            .ok_or_else(|| StoreError::UnknownInstance { uid: uid.into() })
    }

    /// Explicit access to a quarantined record and the reason it was pulled
    /// from normal iteration.
    #[must_use]
    pub fn quarantined_instance(&self, uid: &str) -> Option<(&InstanceRecord, QuarantineReason)> {
        let reason = self.quarantine.read().get(uid).cloned()?;
        let record = self.catalog.instances.get(uid)?;
        Some((record, reason))
    }

    #[must_use]
    pub fn is_quarantined(&self, uid: &str) -> bool {
        self.quarantine.read().contains_key(uid)
    }

    /// Sparse attributes of one instance, in tag order.
    pub fn vertical_attributes(&self, uid: &str) -> impl Iterator<Item = (Tag, &AttrValue)> {
        self.catalog
            .vertical_range(uid)
            .map(|(key, value)| (key.tag(), value))
    }

    /// Dense attribute map rendered as JSON, for export consumers.
    pub fn core_attributes_json(&self, uid: &str) -> Result<serde_json::Value> {
        let instance = self.instance(uid)?;
        serde_json::to_value(&instance.core).map_err(|err| StoreError::InvalidCatalog {
            reason: format!("core attributes not JSON-representable: {err}"),
        })
    }

    pub fn patients(&self) -> impl Iterator<Item = &PatientRecord> {
        self.catalog.patients.values()
    }

    pub fn studies(&self) -> impl Iterator<Item = &StudyRecord> {
        self.catalog.studies.values()
    }

    pub fn series(&self) -> impl Iterator<Item = &SeriesRecord> {
        self.catalog.series.values()
    }

    /// Unique devices seen across all series, keyed by serial number.
    #[must_use]
    pub fn devices(&self) -> Vec<(&str, &str, &str)> {
        let mut seen = std::collections::BTreeMap::new();
        for series in self.catalog.series.values() {
            if series.device_serial_number.is_empty() {
                continue;
            }
            seen.entry(series.device_serial_number.as_str()).or_insert((
                series.manufacturer.as_str(),
                series.model_name.as_str(),
                series.device_serial_number.as_str(),
            ));
        }
        seen.into_values().collect()
    }

    #[must_use]
    pub fn machine_rule_for_serial(&self, serial: &str) -> Option<&MachineRule> {
        self.catalog.machine_rules.get(serial)
    }

    /// Rule matching a series' device, the lookup the redaction collaborator
    /// performs per acquisition run.
    #[must_use]
    pub fn machine_rule_for_series(&self, series_uid: &str) -> Option<&MachineRule> {
        let series = self.catalog.series.get(series_uid)?;
        self.catalog
            .machine_rules
            .get(&series.device_serial_number)
    }

    pub fn machine_rules(&self) -> impl Iterator<Item = &MachineRule> {
        self.catalog.machine_rules.values()
    }

    #[must_use]
    pub fn phi_findings(&self) -> &[crate::types::PhiFinding] {
        &self.catalog.phi_findings
    }

    /// Audit entries already merged into the table, in sequence order.
    #[must_use]
    pub fn audit_log(&self) -> &[crate::types::AuditLogEntry] {
        &self.catalog.audit_log
    }

    /// Audit entries sequenced by the consumer but not yet saved.
    #[must_use]
    pub fn pending_audit(&self) -> Vec<crate::types::AuditLogEntry> {
        self.audit.pending_snapshot()
    }
}
