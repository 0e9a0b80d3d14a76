//! Sidecar compaction: space reclamation, reference remapping, and recovery
//! of an interrupted swap.

use radvault_core::{
    AttrValue, InstanceDraft, PatientRecord, PayloadEncoding, SeriesRecord, Store, StoreOptions,
    StoreWarning, StudyRecord, Tag, SIDECAR_HEADER_SIZE,
};
use tempfile::tempdir;

fn raw_options() -> StoreOptions {
    StoreOptions::default().payload_encoding(PayloadEncoding::Raw)
}

fn seed_hierarchy(store: &mut Store) {
    store
        .upsert_patient(PatientRecord {
            patient_id: "P1".into(),
            display_name: "DOE^JANE".into(),
        })
        .expect("patient");
    store
        .upsert_study(StudyRecord {
            study_uid: "st-1".into(),
            date: None,
            patient_id: "P1".into(),
        })
        .expect("study");
    store
        .upsert_series(SeriesRecord {
            series_uid: "se-1".into(),
            modality: "CT".into(),
            manufacturer: "Vendor".into(),
            model_name: "Scanner X".into(),
            device_serial_number: "SN-001".into(),
            study_uid: "st-1".into(),
        })
        .expect("series");
}

fn random_payload(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    for byte in &mut bytes {
        *byte = fastrand::u8(..);
    }
    bytes
}

#[test]
fn redaction_then_compact_reclaims_replaced_payload() {
    let dir = tempdir().expect("tmp");
    let path = dir.path().join("redact.rvm");

    let originals: Vec<Vec<u8>> = (0..3).map(|_| random_payload(1024)).collect();
    let replacement = random_payload(900);

    {
        let mut store = Store::create_with_options(&path, raw_options()).expect("create");
        seed_hierarchy(&mut store);
        for (i, payload) in originals.iter().enumerate() {
            store
                .ingest_instance(InstanceDraft::new(format!("i{i}"), "se-1"), payload)
                .expect("ingest");
        }
        store.save().expect("save");

        let version = store.instance_version("i1").expect("version");
        store
            .commit_payload("i1", version, &replacement)
            .expect("redact");
        store.save().expect("save after redact");
    }

    let mut store = Store::open_with_options(&path, raw_options()).expect("reopen");
    let redacted = store.instance("i1").expect("i1");
    assert_eq!(redacted.payload.expect("payload").length, 900);
    assert_eq!(redacted.version, 1);
    assert_eq!(
        store.instance("i0").expect("i0").payload.expect("ref").length,
        1024
    );
    assert_eq!(
        store.instance("i2").expect("i2").payload.expect("ref").length,
        1024
    );
    // Old 1024-byte blob for i1 is still on disk, now orphaned.
    assert_eq!(
        store.stats().sidecar_bytes,
        SIDECAR_HEADER_SIZE + 3 * 1024 + 900
    );
    assert!(
        store
            .load_report()
            .warnings
            .iter()
            .any(|warning| matches!(warning, StoreWarning::OrphanPayload { bytes: 1024 }))
    );

    let report = store.compact().expect("compact");
    assert_eq!(report.reclaimed_bytes, 1024);
    assert_eq!(report.live_bytes, 1024 + 900 + 1024);
    assert_eq!(report.remapped_instances, 3);
    assert_eq!(
        store.stats().sidecar_bytes,
        SIDECAR_HEADER_SIZE + 1024 + 900 + 1024
    );

    // Content is byte-identical through the remapped references.
    assert_eq!(store.read_payload("i0").expect("i0"), originals[0]);
    assert_eq!(store.read_payload("i1").expect("i1"), replacement);
    assert_eq!(store.read_payload("i2").expect("i2"), originals[2]);
    store.save().expect("save after compact");

    // And still identical after a full reopen.
    let store = Store::open_with_options(&path, raw_options()).expect("final open");
    assert!(store.load_report().warnings.is_empty());
    assert_eq!(store.read_payload("i1").expect("i1"), replacement);
    assert_eq!(
        store.stats().sidecar_bytes,
        SIDECAR_HEADER_SIZE + 1024 + 900 + 1024
    );
}

#[test]
fn repeated_saves_and_compacts_converge() {
    let dir = tempdir().expect("tmp");
    let path = dir.path().join("converge.rvm");

    let mut store = Store::create_with_options(&path, raw_options()).expect("create");
    seed_hierarchy(&mut store);
    store
        .ingest_instance(InstanceDraft::new("i0", "se-1"), &random_payload(256))
        .expect("ingest");
    store.save().expect("save");

    // Several redaction passes leave several orphan generations.
    for pass in 0..4 {
        let version = store.instance_version("i0").expect("version");
        store
            .commit_payload("i0", version, &random_payload(257 + pass))
            .expect("redact");
    }
    store.save().expect("save passes");
    assert_eq!(
        store.stats().sidecar_bytes,
        SIDECAR_HEADER_SIZE + 256 + 257 + 258 + 259 + 260
    );

    let report = store.compact().expect("compact");
    assert_eq!(report.live_bytes, 260);
    assert_eq!(store.stats().sidecar_bytes, SIDECAR_HEADER_SIZE + 260);

    // A second compact with nothing to reclaim is a no-op on size.
    let report = store.compact().expect("compact again");
    assert_eq!(report.reclaimed_bytes, 0);
    assert_eq!(store.stats().sidecar_bytes, SIDECAR_HEADER_SIZE + 260);
    store.save().expect("final save");
}

/// Hand-write a sidecar header, as `Sidecar::create` would.
fn write_fake_sidecar(path: &std::path::Path, uid: [u8; 16]) {
    use std::io::Write;
    let mut buf = vec![0u8; SIDECAR_HEADER_SIZE as usize];
    buf[..4].copy_from_slice(b"RVS\0");
    buf[4..6].copy_from_slice(&0x0102u16.to_le_bytes());
    buf[8..24].copy_from_slice(&uid);
    let mut file = std::fs::File::create(path).expect("create fake sidecar");
    file.write_all(&buf).expect("write header");
    file.sync_all().expect("sync");
}

#[test]
fn interrupted_swap_is_completed_on_open() {
    let dir = tempdir().expect("tmp");
    let path = dir.path().join("swap.rvm");
    let payload = random_payload(512);

    {
        let mut store = Store::create_with_options(&path, raw_options()).expect("create");
        seed_hierarchy(&mut store);
        store
            .ingest_instance(InstanceDraft::new("i0", "se-1"), &payload)
            .expect("ingest");
        store.save().expect("save");
    }

    // Reconstruct the moment a compaction crashed after its metadata commit
    // but before the rename: the catalog-expected bytes sit in the staging
    // file, while the sidecar name is occupied by a stale generation.
    let sidecar_path = dir.path().join("swap.rvs");
    let staging_path = dir.path().join("swap.rvs.compact");
    std::fs::rename(&sidecar_path, &staging_path).expect("stage");
    write_fake_sidecar(&sidecar_path, [0xEE; 16]);

    let store = Store::open_with_options(&path, raw_options()).expect("open completes swap");
    assert!(
        store
            .load_report()
            .warnings
            .iter()
            .any(|warning| matches!(warning, StoreWarning::CompactionResumed))
    );
    assert_eq!(store.read_payload("i0").expect("payload"), payload);
    assert!(!staging_path.exists());
}

#[test]
fn missing_sidecar_with_staged_file_is_adopted() {
    let dir = tempdir().expect("tmp");
    let path = dir.path().join("adopt.rvm");
    let payload = random_payload(512);

    {
        let mut store = Store::create_with_options(&path, raw_options()).expect("create");
        seed_hierarchy(&mut store);
        store
            .ingest_instance(InstanceDraft::new("i0", "se-1"), &payload)
            .expect("ingest");
        store.save().expect("save");
    }

    let sidecar_path = dir.path().join("adopt.rvs");
    let staging_path = dir.path().join("adopt.rvs.compact");
    std::fs::rename(&sidecar_path, &staging_path).expect("stage");

    let store = Store::open_with_options(&path, raw_options()).expect("open adopts staging");
    assert_eq!(store.read_payload("i0").expect("payload"), payload);
    assert!(sidecar_path.exists());
    assert!(!staging_path.exists());
}

#[test]
fn stale_staging_file_is_removed() {
    let dir = tempdir().expect("tmp");
    let path = dir.path().join("stale.rvm");

    {
        let mut store = Store::create_with_options(&path, raw_options()).expect("create");
        seed_hierarchy(&mut store);
        store
            .ingest_instance(InstanceDraft::new("i0", "se-1"), &random_payload(64))
            .expect("ingest");
        store.save().expect("save");
    }

    // A compaction that staged a file but crashed before its metadata commit
    // leaves a staging file the catalog knows nothing about.
    let staging_path = dir.path().join("stale.rvs.compact");
    write_fake_sidecar(&staging_path, [0xAB; 16]);

    let store = Store::open_with_options(&path, raw_options()).expect("open");
    assert!(
        !store
            .load_report()
            .warnings
            .iter()
            .any(|warning| matches!(warning, StoreWarning::CompactionResumed))
    );
    assert!(!staging_path.exists());
}

#[test]
fn quarantined_record_is_not_carried_by_compaction() {
    let dir = tempdir().expect("tmp");
    let path = dir.path().join("drop.rvm");
    let intact = random_payload(800);

    {
        let mut store = Store::create_with_options(&path, raw_options()).expect("create");
        seed_hierarchy(&mut store);
        store
            .ingest_instance(InstanceDraft::new("keep", "se-1"), &intact)
            .expect("ingest keep");
        store
            .ingest_instance(InstanceDraft::new("torn", "se-1"), &random_payload(400))
            .expect("ingest torn");
        store.save().expect("save");
    }

    let sidecar_path = dir.path().join("drop.rvs");
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(&sidecar_path)
        .expect("open sidecar");
    file.set_len(SIDECAR_HEADER_SIZE + 800 + 10).expect("truncate");
    file.sync_all().expect("sync");
    drop(file);

    let mut store = Store::open_with_options(&path, raw_options()).expect("open");
    assert_eq!(store.load_report().quarantined.len(), 1);

    let report = store.compact().expect("compact");
    assert_eq!(report.live_bytes, 800);
    assert_eq!(store.stats().sidecar_bytes, SIDECAR_HEADER_SIZE + 800);
    assert_eq!(store.read_payload("keep").expect("keep"), intact);
    // The torn record stays quarantined; its reference still dangles.
    assert!(store.is_quarantined("torn"));
    store.save().expect("save");
}

#[test]
fn core_attribute_filter_survives_compaction() {
    let dir = tempdir().expect("tmp");
    let path = dir.path().join("attrs.rvm");

    let mut store = Store::create_with_options(&path, raw_options()).expect("create");
    seed_hierarchy(&mut store);
    store
        .ingest_instance(
            InstanceDraft::new("i0", "se-1")
                .attribute(Tag::new(0x0008, 0x0060), AttrValue::from("CT")),
            &random_payload(128),
        )
        .expect("ingest");
    let version = store.instance_version("i0").expect("version");
    store
        .commit_payload("i0", version, &random_payload(128))
        .expect("redact");
    store.save().expect("save");
    store.compact().expect("compact");

    let query = radvault_core::InstanceQuery::default()
        .where_tag(Tag::new(0x0008, 0x0060), AttrValue::from("CT"));
    assert_eq!(store.query(&query).count(), 1);
    store.save().expect("final save");
}
