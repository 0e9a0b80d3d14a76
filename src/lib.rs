#![deny(clippy::all, clippy::pedantic)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
#![allow(clippy::module_name_repetitions)]
//
// Strategic lint exceptions, allowed project-wide:
//
// Documentation lints: internal/self-documenting functions don't need
// extensive docs; public APIs should still carry proper documentation.
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
//
// Cast safety: casts in this codebase are bounded by real-world constraints
// (file sizes, record counts); try_into everywhere would add noise without
// a safety benefit here.
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_lossless)]
//
// Store-like operations naturally need long functions; breaking them up
// would hurt readability.
#![allow(clippy::too_many_lines)]
#![allow(clippy::similar_names)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::len_without_is_empty)]
#![allow(clippy::unreadable_literal)]

/// The radvault-core crate version (matches `Cargo.toml`).
pub const RADVAULT_CORE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod constants;
pub mod error;
pub mod footer;
pub mod io;
mod lock;
pub mod sidecar;
pub mod store;
pub mod tracker;
pub mod types;

pub use constants::*;
pub use error::{Result, StoreError};
pub use footer::{CommitFooter, FooterSlice, find_last_valid_footer};
pub use io::wal::{MetaWal, WalRecord, WalStats};
pub use lock::{FileLock, LockMode};
pub use sidecar::{Sidecar, SidecarRemap};
pub use store::{AuditQueue, Store};
pub use tracker::MutationTracker;
pub use types::{
    AttrValue, AttributeKey, AuditAction, AuditLogEntry, Catalog, CompactReport, Header,
    InstanceDraft, InstanceQuery, InstanceRecord, LoadReport, MachineRule, ParseTagError,
    PatientRecord, PayloadEncoding, PayloadRef, PhiFinding, PhiRemediation, QuarantineReason,
    RedactionZone, RemediationAction, SaveReport, SeriesRecord, StoreOptions, StoreStats,
    StoreWarning, StudyRecord, Tag,
};

use bincode::config::{self, Config};

/// Encoding for catalog snapshots.
pub(crate) fn catalog_config() -> impl Config {
    config::standard()
}

/// Encoding for WAL record payloads: fixed-width little-endian so record
/// sizes are stable across values.
pub(crate) fn wal_config() -> impl Config {
    config::standard()
        .with_fixed_int_encoding()
        .with_little_endian()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn seed_hierarchy(store: &mut Store) {
        store
            .upsert_patient(PatientRecord {
                patient_id: "P1".into(),
                display_name: "DOE^JANE".into(),
            })
            .expect("patient");
        store
            .upsert_study(StudyRecord {
                study_uid: "1.2.840.1".into(),
                date: chrono::NaiveDate::from_ymd_opt(2023, 1, 15),
                patient_id: "P1".into(),
            })
            .expect("study");
        store
            .upsert_series(SeriesRecord {
                series_uid: "1.2.840.1.1".into(),
                modality: "CT".into(),
                manufacturer: "Vendor".into(),
                model_name: "Scanner X".into(),
                device_serial_number: "SN-001".into(),
                study_uid: "1.2.840.1".into(),
            })
            .expect("series");
    }

    #[test]
    fn create_ingest_save_reopen() {
        let dir = tempdir().expect("tmp");
        let path = dir.path().join("session.rvm");

        {
            let mut store = Store::create(&path).expect("create");
            seed_hierarchy(&mut store);
            store
                .ingest_instance(
                    InstanceDraft::new("1.2.840.1.1.1", "1.2.840.1.1")
                        .attribute(Tag::new(0x0008, 0x0060), AttrValue::from("CT")),
                    &[0x42; 2048],
                )
                .expect("ingest");
            let report = store.save().expect("save");
            assert!(!report.clean);
            assert_eq!(report.flushed_instances, 1);
        }

        let store = Store::open(&path).expect("reopen");
        assert!(store.load_report().quarantined.is_empty());
        assert_eq!(store.stats().instances, 1);
        let bytes = store.read_payload("1.2.840.1.1.1").expect("payload");
        assert_eq!(bytes, vec![0x42; 2048]);
    }

    #[test]
    fn save_is_idempotent_on_clean_store() {
        let dir = tempdir().expect("tmp");
        let path = dir.path().join("clean.rvm");

        let mut store = Store::create(&path).expect("create");
        seed_hierarchy(&mut store);
        assert!(!store.save().expect("first save").clean);
        assert!(store.save().expect("second save").clean);
        assert!(store.save().expect("third save").clean);
    }

    #[test]
    fn foreign_key_rejected_at_write_time() {
        let dir = tempdir().expect("tmp");
        let path = dir.path().join("fk.rvm");

        let mut store = Store::create(&path).expect("create");
        let err = store
            .upsert_study(StudyRecord {
                study_uid: "1.2.3".into(),
                date: None,
                patient_id: "nobody".into(),
            })
            .expect_err("must fail");
        assert!(matches!(err, StoreError::ForeignKey { .. }));
    }

    #[test]
    fn read_only_open_rejects_mutation() {
        let dir = tempdir().expect("tmp");
        let path = dir.path().join("ro.rvm");
        {
            let mut store = Store::create(&path).expect("create");
            seed_hierarchy(&mut store);
            store.save().expect("save");
        }

        let mut store = Store::open_read_only(&path).expect("open ro");
        assert!(store.is_read_only());
        let err = store
            .upsert_patient(PatientRecord {
                patient_id: "P2".into(),
                display_name: "X".into(),
            })
            .expect_err("must fail");
        assert!(matches!(err, StoreError::ReadOnly));
        assert_eq!(store.stats().patients, 1);
    }

    #[test]
    fn missing_sidecar_is_a_hard_error() {
        let dir = tempdir().expect("tmp");
        let path = dir.path().join("lost.rvm");
        {
            let mut store = Store::create(&path).expect("create");
            seed_hierarchy(&mut store);
            store.save().expect("save");
        }
        std::fs::remove_file(dir.path().join("lost.rvs")).expect("remove sidecar");

        let err = Store::open(&path).expect_err("must fail");
        assert!(matches!(err, StoreError::MissingSidecar { .. }));
    }
}
