//! Round-trip and recovery behavior of the session store: every attribute
//! (including raw bytes) must survive save/reopen bit-identically, and every
//! acknowledged mutation must survive a crash via WAL replay.

use chrono::NaiveDate;
use radvault_core::{
    AttrValue, InstanceDraft, MachineRule, PatientRecord, PayloadEncoding, PhiFinding,
    PhiRemediation, RedactionZone, RemediationAction, SeriesRecord, Store, StoreError,
    StoreOptions, StoreWarning, StudyRecord, Tag,
};
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
            study_uid: "1.2.840.100".into(),
            date: NaiveDate::from_ymd_opt(2023, 6, 1),
            patient_id: "P1".into(),
        })
        .expect("study");
    store
        .upsert_series(SeriesRecord {
            series_uid: "1.2.840.100.1".into(),
            modality: "CT".into(),
            manufacturer: "Vendor".into(),
            model_name: "Scanner X".into(),
            device_serial_number: "SN-001".into(),
            study_uid: "1.2.840.100".into(),
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
fn mixed_attributes_roundtrip_bit_identical() {
    let dir = tempdir().expect("tmp");
    let path = dir.path().join("roundtrip.rvm");

    let dense_bytes = vec![0u8, 159, 1, 255, 42, 0, 7];
    let sparse_bytes = random_payload(513);
    let payload = random_payload(4096);

    {
        let mut store = Store::create(&path).expect("create");
        seed_hierarchy(&mut store);

        let draft = InstanceDraft::new("1.2.840.100.1.1", "1.2.840.100.1")
            .attribute(Tag::new(0x0008, 0x0060), AttrValue::from("CT"))
            .attribute(Tag::new(0x0028, 0x0010), AttrValue::Integer(512))
            .attribute(
                Tag::new(0x0010, 0x0030),
                AttrValue::Date(NaiveDate::from_ymd_opt(1980, 2, 29).expect("date")),
            )
            .attribute(Tag::new(0x7fe0, 0x0000), AttrValue::Bytes(dense_bytes.clone()));
        store.ingest_instance(draft, &payload).expect("ingest");

        store
            .set_vertical_attribute(
                "1.2.840.100.1.1",
                0x0009,
                0x1001,
                AttrValue::from("PRIVATE-CREATOR"),
            )
            .expect("vertical text");
        store
            .set_vertical_attribute(
                "1.2.840.100.1.1",
                0x0009,
                0x1002,
                AttrValue::Bytes(sparse_bytes.clone()),
            )
            .expect("vertical bytes");
        store
            .set_vertical_attribute("1.2.840.100.1.1", 0x0011, 0x0010, AttrValue::Float(1.25))
            .expect("vertical float");

        store.save().expect("save");
    }

    let store = Store::open(&path).expect("reopen");
    assert!(store.load_report().quarantined.is_empty());

    let instance = store.instance("1.2.840.100.1.1").expect("instance");
    assert_eq!(
        instance.core.get(&Tag::new(0x0008, 0x0060)),
        Some(&AttrValue::from("CT"))
    );
    assert_eq!(
        instance.core.get(&Tag::new(0x0028, 0x0010)),
        Some(&AttrValue::Integer(512))
    );
    assert_eq!(
        instance.core.get(&Tag::new(0x7fe0, 0x0000)),
        Some(&AttrValue::Bytes(dense_bytes))
    );

    let sparse: Vec<_> = store.vertical_attributes("1.2.840.100.1.1").collect();
    assert_eq!(sparse.len(), 3);
    assert_eq!(sparse[0].0, Tag::new(0x0009, 0x1001));
    assert_eq!(sparse[1].1, &AttrValue::Bytes(sparse_bytes));
    assert_eq!(sparse[2].0, Tag::new(0x0011, 0x0010));

    assert_eq!(store.read_payload("1.2.840.100.1.1").expect("payload"), payload);

    // Dense map is JSON-exportable with tagged values.
    let json = store
        .core_attributes_json("1.2.840.100.1.1")
        .expect("json export");
    assert_eq!(json["0008,0060"]["kind"], "text");
    assert_eq!(json["0028,0010"]["value"], 512);
}

#[test]
fn attribute_parity_is_routed_and_enforced() {
    let dir = tempdir().expect("tmp");
    let path = dir.path().join("parity.rvm");

    let mut store = Store::create(&path).expect("create");
    seed_hierarchy(&mut store);
    store
        .ingest_instance(
            InstanceDraft::new("i1", "1.2.840.100.1"),
            &random_payload(64),
        )
        .expect("ingest");

    // Automatic routing: even group lands dense, odd group lands sparse.
    store
        .set_attribute("i1", Tag::new(0x0028, 0x0100), AttrValue::Integer(16))
        .expect("even set");
    store
        .set_attribute("i1", Tag::new(0x0009, 0x0010), AttrValue::from("odd"))
        .expect("odd set");

    let instance = store.instance("i1").expect("instance");
    assert!(instance.core.contains_key(&Tag::new(0x0028, 0x0100)));
    assert!(!instance.core.contains_key(&Tag::new(0x0009, 0x0010)));
    let sparse: Vec<_> = store.vertical_attributes("i1").collect();
    assert_eq!(sparse.len(), 1);
    assert_eq!(sparse[0].0, Tag::new(0x0009, 0x0010));

    // The explicitly named setters reject wrong-parity tags.
    assert!(matches!(
        store.set_core_attribute("i1", Tag::new(0x0009, 0x0010), AttrValue::from("x")),
        Err(StoreError::WrongParity { .. })
    ));
    assert!(matches!(
        store.set_vertical_attribute("i1", 0x0028, 0x0100, AttrValue::from("x")),
        Err(StoreError::WrongParity { .. })
    ));

    // An ingest draft carrying an odd-group tag in the dense map is rejected.
    let bad = InstanceDraft::new("i2", "1.2.840.100.1")
        .attribute(Tag::new(0x0009, 0x0001), AttrValue::from("private"));
    assert!(matches!(
        store.ingest_instance(bad, &[0u8; 8]),
        Err(StoreError::WrongParity { .. })
    ));
}

#[test]
fn wal_replay_recovers_unsaved_mutations() {
    let dir = tempdir().expect("tmp");
    let path = dir.path().join("replay.rvm");
    let replacement = random_payload(700);

    {
        let mut store = Store::create(&path).expect("create");
        seed_hierarchy(&mut store);
        store
            .ingest_instance(
                InstanceDraft::new("i1", "1.2.840.100.1"),
                &random_payload(1024),
            )
            .expect("ingest");
        store.save().expect("save");

        // Mutations after the save are WAL-durable but not snapshotted.
        store
            .set_core_attribute("i1", Tag::new(0x0010, 0x0010), AttrValue::from("ANON"))
            .expect("set attr");
        let version = store.instance_version("i1").expect("version");
        store
            .commit_payload("i1", version, &replacement)
            .expect("redact");
        // Dropped without save: simulates an interrupted session.
    }

    let store = Store::open(&path).expect("resume");
    assert!(store.load_report().replayed_ops > 0);
    let instance = store.instance("i1").expect("instance");
    assert_eq!(instance.version, 1);
    assert_eq!(
        instance.core.get(&Tag::new(0x0010, 0x0010)),
        Some(&AttrValue::from("ANON"))
    );
    assert_eq!(store.read_payload("i1").expect("payload"), replacement);
}

#[test]
fn query_streams_matching_instances() {
    let dir = tempdir().expect("tmp");
    let path = dir.path().join("query.rvm");

    let mut store = Store::create(&path).expect("create");
    seed_hierarchy(&mut store);
    store
        .upsert_series(SeriesRecord {
            series_uid: "1.2.840.100.2".into(),
            modality: "MR".into(),
            manufacturer: "Vendor".into(),
            model_name: "Scanner Y".into(),
            device_serial_number: "SN-002".into(),
            study_uid: "1.2.840.100".into(),
        })
        .expect("mr series");

    for (uid, series) in [
        ("ct-1", "1.2.840.100.1"),
        ("ct-2", "1.2.840.100.1"),
        ("mr-1", "1.2.840.100.2"),
    ] {
        store
            .ingest_instance(InstanceDraft::new(uid, series), &random_payload(128))
            .expect("ingest");
    }
    store
        .set_vertical_attribute("ct-2", 0x0009, 0x0001, AttrValue::from("flagged"))
        .expect("flag");

    let query = radvault_core::InstanceQuery::default().modality("CT");
    let hits: Vec<_> = store.query(&query).map(|r| r.instance_uid.clone()).collect();
    assert_eq!(hits, vec!["ct-1", "ct-2"]);

    let query = radvault_core::InstanceQuery::default().device_serial("SN-002");
    assert_eq!(store.query(&query).count(), 1);

    let query = radvault_core::InstanceQuery::default().patient("P1").date_range(
        NaiveDate::from_ymd_opt(2023, 1, 1),
        NaiveDate::from_ymd_opt(2023, 12, 31),
    );
    assert_eq!(store.query(&query).count(), 3);

    // Sparse filter: dense scan first, keyed sparse lookup per candidate row.
    let query = radvault_core::InstanceQuery::default()
        .where_tag(Tag::new(0x0009, 0x0001), AttrValue::from("flagged"));
    let hits: Vec<_> = store.query(&query).map(|r| r.instance_uid.clone()).collect();
    assert_eq!(hits, vec!["ct-2"]);

    assert_eq!(store.devices().len(), 2);
}

#[test]
fn truncated_sidecar_quarantines_one_record_not_the_load() {
    let dir = tempdir().expect("tmp");
    let path = dir.path().join("quarantine.rvm");
    let options = StoreOptions::default().payload_encoding(PayloadEncoding::Raw);
    let intact = random_payload(1000);

    {
        let mut store = Store::create_with_options(&path, options.clone()).expect("create");
        seed_hierarchy(&mut store);
        store
            .ingest_instance(InstanceDraft::new("keep", "1.2.840.100.1"), &intact)
            .expect("ingest keep");
        store
            .ingest_instance(
                InstanceDraft::new("torn", "1.2.840.100.1"),
                &random_payload(500),
            )
            .expect("ingest torn");
        store.save().expect("save");
    }

    // Cut the second payload short, as a torn append would.
    let sidecar_path = dir.path().join("quarantine.rvs");
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(&sidecar_path)
        .expect("open sidecar");
    file.set_len(radvault_core::SIDECAR_HEADER_SIZE + 1000 + 100)
        .expect("truncate");
    file.sync_all().expect("sync");
    drop(file);

    let store = Store::open_with_options(&path, options).expect("open");
    let report = store.load_report();
    assert_eq!(report.quarantined.len(), 1);
    assert_eq!(report.quarantined[0].0, "torn");
    assert!(
        report
            .warnings
            .iter()
            .any(|warning| matches!(warning, StoreWarning::OrphanPayload { bytes: 100 }))
    );

    // The intact record still reads; the torn one is explicit-access only.
    assert_eq!(store.read_payload("keep").expect("keep"), intact);
    assert!(matches!(
        store.read_payload("torn"),
        Err(StoreError::Quarantined { .. })
    ));
    assert!(matches!(
        store.instance("torn"),
        Err(StoreError::Quarantined { .. })
    ));
    let (record, reason) = store.quarantined_instance("torn").expect("explicit access");
    assert_eq!(record.instance_uid, "torn");
    assert!(reason.to_string().contains("dangles"));
    assert_eq!(store.query(&radvault_core::InstanceQuery::default()).count(), 1);
    assert_eq!(store.stats().quarantined, 1);
}

#[test]
fn findings_and_machine_rules_persist() {
    let dir = tempdir().expect("tmp");
    let path = dir.path().join("rules.rvm");

    {
        let mut store = Store::create(&path).expect("create");
        seed_hierarchy(&mut store);
        store
            .append_phi_finding(PhiFinding {
                entity_uid: "1.2.840.100.1.1".into(),
                entity_type: "instance".into(),
                field_name: "PatientName".into(),
                value: "DOE^JANE".into(),
                reason: "name burned into header".into(),
                patient_id: "P1".into(),
                remediation: Some(PhiRemediation {
                    action: RemediationAction::Replace,
                    new_value: Some("ANON".into()),
                }),
            })
            .expect("finding");
        store
            .append_machine_rule(MachineRule {
                serial_number: "SN-001".into(),
                manufacturer: "Vendor".into(),
                model: "Scanner X".into(),
                zones: vec![RedactionZone {
                    row_start: 0,
                    row_end: 64,
                    col_start: 0,
                    col_end: 480,
                }],
            })
            .expect("rule");
        store.save().expect("save");
    }

    let mut store = Store::open(&path).expect("reopen");
    assert_eq!(store.phi_findings().len(), 1);
    assert_eq!(store.phi_findings()[0].field_name, "PatientName");
    let rule = store.machine_rule_for_serial("SN-001").expect("rule");
    assert_eq!(rule.zones.len(), 1);
    assert!(store.machine_rule_for_series("1.2.840.100.1").is_some());

    // Identical re-registration is a no-op; different content is rejected.
    let same = rule.clone();
    store.append_machine_rule(same).expect("idempotent");
    let err = store
        .append_machine_rule(MachineRule {
            serial_number: "SN-001".into(),
            manufacturer: "Vendor".into(),
            model: "Scanner X".into(),
            zones: vec![],
        })
        .expect_err("conflicting rule");
    assert!(matches!(err, StoreError::DuplicateRule { .. }));
}
