//! Lifecycle management for session stores.
//!
//! Responsibilities:
//! - Bootstrap the metadata file (header, WAL region, catalog snapshot) and
//!   the paired sidecar on create, and recover all of them on open.
//! - Replay WAL records past the last checkpoint, so an interrupted session
//!   resumes with every acknowledged mutation intact.
//! - Validate payload liveness per record: a dangling reference quarantines
//!   one instance instead of failing the whole load.
//! - Finish a compaction swap that crashed between its metadata commit and
//!   the file rename.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bincode::serde::{decode_from_slice, encode_to_vec};
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::constants::{
    FORMAT_VERSION, MAX_CATALOG_BYTES, META_MAGIC, SIDECAR_EXTENSION, SIDECAR_HEADER_SIZE,
    WAL_OFFSET,
};
use crate::error::{Result, StoreError};
use crate::footer::{CommitFooter, FOOTER_SIZE, find_last_valid_footer};
use crate::io::header::HeaderCodec;
use crate::io::wal::MetaWal;
use crate::lock::{FileLock, LockMode};
use crate::sidecar::{Sidecar, compact_staging_path};
use crate::store::audit::AuditQueue;
use crate::store::mutation::{WalEnvelope, apply_op};
use crate::tracker::MutationTracker;
use crate::types::{
    Catalog, Header, LoadReport, PayloadRef, QuarantineReason, SaveReport, StoreOptions,
    StoreStats, StoreWarning,
};
use crate::{catalog_config, wal_config};

/// Minimum embedded WAL region; smaller requests are clamped up.
const WAL_SIZE_MIN: u64 = 64 * 1024;

/// Primary handle for one session store: a metadata file plus its payload
/// sidecar.
///
/// Mutations apply to the in-memory catalog and append to the embedded WAL
/// before the caller observes success; `save` materializes a checksummed
/// snapshot and checkpoints the WAL in one header flip.
#[derive(Debug)]
pub struct Store {
    pub(crate) file: File,
    pub(crate) path: PathBuf,
    #[allow(dead_code)]
    pub(crate) lock: FileLock,
    pub(crate) read_only: bool,
    pub(crate) header: Header,
    pub(crate) catalog: Catalog,
    pub(crate) wal: MetaWal,
    pub(crate) sidecar: Sidecar,
    pub(crate) tracker: Arc<MutationTracker>,
    pub(crate) audit: AuditQueue,
    pub(crate) quarantine: RwLock<BTreeMap<String, QuarantineReason>>,
    pub(crate) load_report: LoadReport,
    pub(crate) options: StoreOptions,
    pub(crate) dirty: bool,
    pub(crate) halted: bool,
    pub(crate) commit_sequence: u64,
}

impl Store {
    /// Create a new, empty store. Truncates both files if they exist and
    /// holds an exclusive lock for the lifetime of the handle.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::create_with_options(path, StoreOptions::default())
    }

    pub fn create_with_options<P: AsRef<Path>>(path: P, options: StoreOptions) -> Result<Self> {
        let path_ref = path.as_ref();
        let sidecar_path = sidecar_path_for(path_ref);
        let sidecar_file = sidecar_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| StoreError::InvalidHeader {
                reason: "store path has no file name".into(),
            })?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path_ref)?;
        let lock = FileLock::acquire(&file, LockMode::Exclusive)?;

        let store_uid = *Uuid::new_v4().as_bytes();
        let wal_size = options.wal_size.max(WAL_SIZE_MIN);
        let header = Header {
            magic: META_MAGIC,
            version: FORMAT_VERSION,
            store_uid,
            footer_offset: WAL_OFFSET + wal_size,
            wal_offset: WAL_OFFSET,
            wal_size,
            wal_checkpoint_pos: 0,
            wal_sequence: 0,
            catalog_checksum: [0u8; 32],
        };
        file.set_len(header.footer_offset)?;
        HeaderCodec::write(&mut file, &header)?;

        let mut wal = MetaWal::open(&file, &header)?;
        wal.set_defer_sync(options.defer_sync);
        let mut sidecar = Sidecar::create(&sidecar_path, store_uid)?;
        sidecar.set_defer_sync(options.defer_sync);

        let catalog = Catalog {
            sidecar_file,
            sidecar_uid: store_uid,
            created_at: Utc::now().timestamp(),
            ..Catalog::default()
        };
        let audit = AuditQueue::start(
            1,
            0,
            options.audit_queue_capacity,
            options.audit_batch_limit,
        )?;

        let mut store = Self {
            file,
            path: path_ref.to_path_buf(),
            lock,
            read_only: false,
            header,
            catalog,
            wal,
            sidecar,
            tracker: Arc::new(MutationTracker::new()),
            audit,
            quarantine: RwLock::new(BTreeMap::new()),
            load_report: LoadReport::default(),
            options,
            dirty: false,
            halted: false,
            commit_sequence: 0,
        };
        store.snapshot_commit()?;
        tracing::info!(store.path = %store.path.display(), "store created");
        Ok(store)
    }

    /// Open an existing store with exclusive access, performing WAL replay
    /// and per-record validation. Problems scoped to one record quarantine
    /// that record; the load itself only fails on structural damage.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_options(path, StoreOptions::default())
    }

    pub fn open_with_options<P: AsRef<Path>>(path: P, options: StoreOptions) -> Result<Self> {
        Self::open_internal(path.as_ref(), options, false)
    }

    /// Resume an interrupted session. Identical to [`open`](Self::open):
    /// recovery is the normal open path, not a special mode.
    pub fn resume<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open(path)
    }

    /// Alias of [`open`](Self::open) under the name external collaborators
    /// use for the facade operation.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open(path)
    }

    /// Open with a shared lock for concurrent read access. Every mutation
    /// fails with `ReadOnly`; nothing is written, not even recovery state.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_internal(path.as_ref(), StoreOptions::default(), true)
    }

    fn open_internal(path_ref: &Path, options: StoreOptions, read_only: bool) -> Result<Self> {
        let mut file = if read_only {
            OpenOptions::new().read(true).open(path_ref)?
        } else {
            OpenOptions::new().read(true).write(true).open(path_ref)?
        };
        let mode = if read_only {
            LockMode::Shared
        } else {
            LockMode::Exclusive
        };
        let lock = FileLock::acquire(&file, mode)?;

        let mut header = HeaderCodec::read(&mut file)?;
        let (mut catalog, commit_sequence, recovered) = read_catalog(&mut file, &mut header)?;
        if recovered && !read_only {
            HeaderCodec::write(&mut file, &header)?;
            file.sync_all()?;
        }

        let mut wal = if read_only {
            MetaWal::open_read_only(&file, &header)?
        } else {
            MetaWal::open(&file, &header)?
        };
        wal.set_defer_sync(options.defer_sync);

        let mut warnings = Vec::new();
        let mut sidecar = resolve_sidecar(path_ref, &catalog, !read_only, &mut warnings)?;
        sidecar.set_defer_sync(options.defer_sync);

        // Replay every mutation acknowledged after the last snapshot.
        let mut replayed = 0u64;
        let mut issued = catalog.audit_accepted;
        for record in wal.records_after(header.wal_sequence)? {
            let (envelope, _): (WalEnvelope, usize) =
                decode_from_slice(&record.payload, wal_config())?;
            issued = issued.max(envelope.accepted_audit);
            apply_op(&mut catalog, envelope.op);
            replayed += 1;
        }
        if replayed > 0 {
            tracing::info!(wal.replayed = replayed, "recovered mutations from wal");
        }

        let recorded = catalog.max_audit_sequence();
        if issued > recorded {
            warnings.push(StoreWarning::IncompleteAudit { issued, recorded });
            // Acknowledge the loss so later opens do not re-report it.
            catalog.audit_accepted = recorded;
        }
        let audit = AuditQueue::start(
            recorded + 1,
            catalog.audit_accepted,
            options.audit_queue_capacity,
            options.audit_batch_limit,
        )?;

        // Per-record liveness validation against the sidecar.
        let tracker = MutationTracker::new();
        let mut quarantine = BTreeMap::new();
        let sidecar_len = sidecar.len();
        for (uid, record) in &catalog.instances {
            tracker.register(uid, record.version);
            if let Some(payload) = &record.payload {
                let end = payload.offset.checked_add(payload.length);
                let valid = payload.offset >= SIDECAR_HEADER_SIZE
                    && end.is_some_and(|end| end <= sidecar_len);
                if !valid {
                    tracing::warn!(
                        instance.uid = %uid,
                        payload.offset = payload.offset,
                        payload.length = payload.length,
                        "quarantining instance with dangling payload"
                    );
                    quarantine.insert(
                        uid.clone(),
                        QuarantineReason::DanglingPayload {
                            offset: payload.offset,
                            length: payload.length,
                            sidecar_len,
                        },
                    );
                }
            }
        }

        let live: Vec<PayloadRef> = catalog
            .instances
            .values()
            .filter(|record| !quarantine.contains_key(&record.instance_uid))
            .filter_map(|record| record.payload)
            .collect();
        let orphan_bytes = sidecar.orphan_bytes(&live);
        if orphan_bytes > 0 {
            warnings.push(StoreWarning::OrphanPayload {
                bytes: orphan_bytes,
            });
        }

        let load_report = LoadReport {
            quarantined: quarantine
                .iter()
                .map(|(uid, reason)| (uid.clone(), reason.clone()))
                .collect(),
            warnings,
            replayed_ops: replayed,
        };

        let mut store = Self {
            file,
            path: path_ref.to_path_buf(),
            lock,
            read_only,
            header,
            catalog,
            wal,
            sidecar,
            tracker: Arc::new(tracker),
            audit,
            quarantine: RwLock::new(quarantine),
            load_report,
            options,
            dirty: false,
            halted: false,
            commit_sequence,
        };

        if !store.read_only && store.load_report.replayed_ops > 0 {
            // Fold the replayed tail into a fresh snapshot so the WAL frees
            // up and the next open starts clean.
            store.snapshot_commit()?;
        }
        tracing::info!(
            store.path = %store.path.display(),
            store.instances = store.catalog.instances.len(),
            store.quarantined = store.load_report.quarantined.len(),
            "store opened"
        );
        Ok(store)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn store_uid(&self) -> [u8; 16] {
        self.header.store_uid
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Outcome of the open that produced this handle: quarantined records,
    /// warnings, and how much WAL was replayed.
    #[must_use]
    pub fn load_report(&self) -> &LoadReport {
        &self.load_report
    }

    #[must_use]
    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Shared handle to the mutation tracker, for worker threads that race
    /// on versions while the store serializes the row writes.
    #[must_use]
    pub fn tracker(&self) -> Arc<MutationTracker> {
        Arc::clone(&self.tracker)
    }

    #[must_use]
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            patients: self.catalog.patients.len(),
            studies: self.catalog.studies.len(),
            series: self.catalog.series.len(),
            instances: self.catalog.instances.len(),
            quarantined: self.quarantine.read().len(),
            audit_entries: self.catalog.max_audit_sequence(),
            phi_findings: self.catalog.phi_findings.len(),
            machine_rules: self.catalog.machine_rules.len(),
            sidecar_bytes: self.sidecar.len(),
        }
    }

    pub(crate) fn assert_mutable(&self) -> Result<()> {
        if self.halted {
            return Err(StoreError::Halted);
        }
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        Ok(())
    }

    /// Flush all pending state: drain the audit queue into the table, then
    /// commit one catalog snapshot and checkpoint the WAL. Idempotent: with
    /// nothing pending this is a no-op reported as `clean`.
    pub fn save(&mut self) -> Result<SaveReport> {
        self.assert_mutable()?;

        let drained = self.audit.drain()?;
        let dirty_records = self.tracker.dirty_records();
        if !self.dirty && drained.is_empty() && dirty_records.is_empty() {
            return Ok(SaveReport {
                clean: true,
                ..SaveReport::default()
            });
        }

        if !drained.is_empty() {
            self.catalog.audit_log.extend(drained.iter().cloned());
            self.log_op_bytes(&WalEnvelope {
                accepted_audit: self.audit.accepted(),
                op: crate::store::mutation::WalOp::AuditBatch(drained.clone()),
            })?;
        }

        if self.options.defer_sync {
            self.sidecar.sync()?;
            self.wal.sync()?;
        }

        let catalog_bytes = self.snapshot_commit()?;
        for (uid, version) in &dirty_records {
            self.tracker.mark_flushed(uid, *version);
        }
        self.dirty = false;

        tracing::info!(
            save.flushed_instances = dirty_records.len(),
            save.audit_entries = drained.len(),
            save.catalog_bytes = catalog_bytes,
            "save complete"
        );
        Ok(SaveReport {
            clean: false,
            flushed_instances: dirty_records.len(),
            audit_entries_written: drained.len(),
            catalog_bytes,
        })
    }

    /// Save and release the store.
    pub fn close(mut self) -> Result<SaveReport> {
        if self.read_only {
            return Ok(SaveReport {
                clean: true,
                ..SaveReport::default()
            });
        }
        self.save()
    }

    /// Serialize the catalog, write it with a trailing commit footer, flip
    /// the header, and checkpoint the WAL. The header write is the commit
    /// point; the previous snapshot stays intact until it lands.
    pub(crate) fn snapshot_commit(&mut self) -> Result<u64> {
        self.catalog.audit_accepted = self.audit.accepted();
        let bytes = encode_to_vec(&self.catalog, catalog_config())?;
        if bytes.len() as u64 > MAX_CATALOG_BYTES {
            return Err(StoreError::InvalidCatalog {
                reason: "catalog snapshot exceeds safety limit".into(),
            });
        }
        let digest: [u8; 32] = blake3::hash(&bytes).into();
        let need = bytes.len() as u64 + FOOTER_SIZE as u64;
        let base = self.header.wal_offset + self.header.wal_size;
        let file_len = self.file.metadata()?.len();

        // Never overwrite the live snapshot: reuse the dead region below it
        // when the new snapshot fits, otherwise append past end of file.
        let target = if self.commit_sequence == 0 || base + need <= self.header.footer_offset {
            base
        } else {
            file_len.max(base)
        };

        self.commit_sequence += 1;
        let footer = CommitFooter {
            catalog_offset: target,
            catalog_len: bytes.len() as u64,
            catalog_checksum: digest,
            commit_sequence: self.commit_sequence,
        };
        self.file.seek(SeekFrom::Start(target))?;
        self.file.write_all(&bytes)?;
        self.file.write_all(&footer.encode())?;
        self.file.sync_all()?;

        self.header.footer_offset = target;
        self.header.catalog_checksum = digest;
        self.wal.record_checkpoint(&mut self.header)?;
        HeaderCodec::write(&mut self.file, &self.header)?;
        self.file.sync_all()?;
        self.file.set_len(target + need)?;

        tracing::debug!(
            snapshot.offset = target,
            snapshot.bytes = bytes.len(),
            snapshot.commit_sequence = self.commit_sequence,
            "catalog snapshot committed"
        );
        Ok(bytes.len() as u64)
    }

    pub(crate) fn log_op_bytes(&mut self, envelope: &WalEnvelope) -> Result<()> {
        let bytes = encode_to_vec(envelope, wal_config())?;
        match self.wal.append_record(&bytes) {
            Ok(_) => Ok(()),
            Err(StoreError::WalFull) => {
                // The mutation is already applied to the catalog; a snapshot
                // makes it durable and frees the region, so the record no
                // longer needs to be logged.
                tracing::debug!("wal full; folding pending state into a snapshot");
                self.snapshot_commit()?;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if !self.read_only && (self.dirty || self.tracker.has_dirty()) {
            // Acknowledged mutations are WAL-durable; the next open replays
            // them. Only unflushed audit entries are lost.
            tracing::warn!(
                store.path = %self.path.display(),
                "store dropped with unsaved changes; they will be recovered from the wal"
            );
        }
    }
}

/// Sidecar path co-located with a metadata file.
#[must_use]
pub(crate) fn sidecar_path_for(meta_path: &Path) -> PathBuf {
    meta_path.with_extension(SIDECAR_EXTENSION)
}

fn read_catalog(file: &mut File, header: &mut Header) -> Result<(Catalog, u64, bool)> {
    match read_catalog_primary(file, header) {
        Ok((catalog, commit_sequence)) => Ok((catalog, commit_sequence, false)),
        Err(err) => {
            tracing::info!(error = %err, "catalog read failed; scanning for last valid commit");
            let (catalog, commit_sequence) = recover_catalog(file, header)?;
            Ok((catalog, commit_sequence, true))
        }
    }
}

/// Fast path: the footer is the last block of the file and the header points
/// at the catalog in front of it.
fn read_catalog_primary(file: &mut File, header: &Header) -> Result<(Catalog, u64)> {
    let file_len = file.metadata()?.len();
    let footer_block = FOOTER_SIZE as u64;
    if file_len < header.footer_offset + footer_block {
        return Err(StoreError::InvalidCatalog {
            reason: "footer offset beyond file length".into(),
        });
    }

    file.seek(SeekFrom::Start(file_len - footer_block))?;
    let mut footer_buf = vec![0u8; FOOTER_SIZE];
    file.read_exact(&mut footer_buf)?;
    let footer = CommitFooter::decode(&footer_buf)?;
    if footer.catalog_offset != header.footer_offset
        || footer.catalog_checksum != header.catalog_checksum
        || footer.catalog_offset + footer.catalog_len + footer_block != file_len
    {
        return Err(StoreError::InvalidCatalog {
            reason: "footer disagrees with header".into(),
        });
    }

    decode_catalog_at(file, &footer)
}

/// Slow path: scan the whole file backwards for the newest intact commit.
fn recover_catalog(file: &mut File, header: &mut Header) -> Result<(Catalog, u64)> {
    let file_len = file.metadata()?.len();
    if file_len > MAX_CATALOG_BYTES.saturating_mul(4) {
        return Err(StoreError::InvalidCatalog {
            reason: "metadata file too large to scan".into(),
        });
    }
    file.seek(SeekFrom::Start(0))?;
    let mut bytes = Vec::with_capacity(file_len as usize);
    file.read_to_end(&mut bytes)?;

    let slice = find_last_valid_footer(&bytes).ok_or_else(|| StoreError::InvalidCatalog {
        reason: "no intact commit footer found".into(),
    })?;
    let wal_end = header.wal_offset + header.wal_size;
    if slice.footer.catalog_offset < wal_end {
        return Err(StoreError::InvalidCatalog {
            reason: "recovered footer points inside the wal region".into(),
        });
    }

    let (catalog, commit_sequence) = decode_catalog_at(file, &slice.footer)?;
    header.footer_offset = slice.footer.catalog_offset;
    header.catalog_checksum = slice.footer.catalog_checksum;
    tracing::warn!(
        recovery.footer_offset = slice.footer_offset,
        recovery.commit_sequence = commit_sequence,
        "recovered catalog from footer scan"
    );
    Ok((catalog, commit_sequence))
}

fn decode_catalog_at(file: &mut File, footer: &CommitFooter) -> Result<(Catalog, u64)> {
    if footer.catalog_len > MAX_CATALOG_BYTES {
        return Err(StoreError::InvalidCatalog {
            reason: "catalog snapshot exceeds safety limit".into(),
        });
    }
    file.seek(SeekFrom::Start(footer.catalog_offset))?;
    let mut bytes = vec![0u8; footer.catalog_len as usize];
    file.read_exact(&mut bytes)?;

    let actual: [u8; 32] = blake3::hash(&bytes).into();
    if actual != footer.catalog_checksum {
        return Err(StoreError::InvalidCatalog {
            reason: "catalog checksum mismatch".into(),
        });
    }
    let (catalog, consumed): (Catalog, usize) = decode_from_slice(&bytes, catalog_config())?;
    if consumed != bytes.len() {
        return Err(StoreError::InvalidCatalog {
            reason: "catalog snapshot has trailing bytes".into(),
        });
    }
    Ok((catalog, footer.commit_sequence))
}

/// Locate and open the paired sidecar, completing a crashed compaction swap
/// when the catalog already expects the staged file.
fn resolve_sidecar(
    meta_path: &Path,
    catalog: &Catalog,
    writable: bool,
    warnings: &mut Vec<StoreWarning>,
) -> Result<Sidecar> {
    let dir = meta_path.parent().unwrap_or_else(|| Path::new("."));
    let sidecar_path = dir.join(&catalog.sidecar_file);
    let staging_path = compact_staging_path(&sidecar_path);

    let staging_matches = staging_path.exists()
        && Sidecar::peek_uid(&staging_path).is_ok_and(|uid| uid == catalog.sidecar_uid);

    let open = |path: &Path| {
        if writable {
            Sidecar::open(path, catalog.sidecar_uid)
        } else {
            Sidecar::open_read_only(path, catalog.sidecar_uid)
        }
    };

    if sidecar_path.exists() {
        match open(&sidecar_path) {
            Ok(sidecar) => {
                if staging_path.exists() && writable {
                    // A compaction staged a file but never committed it.
                    tracing::warn!(
                        sidecar.staging = %staging_path.display(),
                        "removing stale compaction staging file"
                    );
                    let _ = std::fs::remove_file(&staging_path);
                }
                Ok(sidecar)
            }
            Err(StoreError::StoreMismatch { .. }) if staging_matches => {
                warnings.push(StoreWarning::CompactionResumed);
                if writable {
                    tracing::warn!("completing interrupted compaction swap");
                    std::fs::rename(&staging_path, &sidecar_path)?;
                    sync_parent_dir(&sidecar_path);
                    open(&sidecar_path)
                } else {
                    open(&staging_path)
                }
            }
            Err(err) => Err(err),
        }
    } else if staging_matches {
        warnings.push(StoreWarning::CompactionResumed);
        if writable {
            tracing::warn!("completing interrupted compaction swap");
            std::fs::rename(&staging_path, &sidecar_path)?;
            sync_parent_dir(&sidecar_path);
            open(&sidecar_path)
        } else {
            open(&staging_path)
        }
    } else {
        Err(StoreError::MissingSidecar { path: sidecar_path })
    }
}

pub(crate) fn sync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}
