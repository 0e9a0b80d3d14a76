//! Sidecar compaction orchestration.
//!
//! The sidecar stages a compacted copy under a fresh identity; the store then
//! remaps every live payload reference and the expected sidecar identity in
//! one catalog commit, and only then swaps the staged file in. A crash on
//! either side of the commit leaves a fully consistent pairing: before it the
//! old mapping and old file, after it the new mapping and a staged file the
//! next open adopts.

use crate::constants::SIDECAR_HEADER_SIZE;
use crate::error::Result;
use crate::sidecar::Sidecar;
use crate::store::lifecycle::{Store, sync_parent_dir};
use crate::types::{AuditAction, CompactReport, PayloadRef};

impl Store {
    /// Rewrite the sidecar to drop every byte range no live record
    /// references, and remap all live references atomically.
    ///
    /// Serialized against appends by construction: both run under `&mut
    /// self`. A rename failure after the metadata commit halts the store;
    /// reopening completes the swap.
    pub fn compact(&mut self) -> Result<CompactReport> {
        self.assert_mutable()?;

        let old_bytes = self.sidecar.len() - SIDECAR_HEADER_SIZE;
        let live: Vec<PayloadRef> = {
            let quarantine = self.quarantine.read();
            self.catalog
                .instances
                .values()
                .filter(|record| !quarantine.contains_key(&record.instance_uid))
                .filter_map(|record| record.payload)
                .collect()
        };

        let remap = self.sidecar.compact(&live)?;

        let mut remapped = 0usize;
        {
            let quarantine = self.quarantine.read();
            for record in self.catalog.instances.values_mut() {
                if quarantine.contains_key(&record.instance_uid) {
                    continue;
                }
                if let Some(payload) = record.payload.as_mut() {
                    if let Some(&new_offset) = remap.offsets.get(&payload.offset) {
                        payload.offset = new_offset;
                        remapped += 1;
                    }
                }
            }
        }
        self.catalog.sidecar_uid = remap.uid;

        // One metadata transaction: the remapped references and the new
        // sidecar identity become durable together.
        self.snapshot_commit()?;

        let sidecar_path = self.sidecar.path().to_path_buf();
        if let Err(err) = std::fs::rename(&remap.staging_path, &sidecar_path) {
            // The catalog now expects the staged file; until the swap lands
            // the pairing is unknown, so no further mutation is safe.
            self.halted = true;
            tracing::error!(error = %err, "compaction swap failed; store halted");
            return Err(err.into());
        }
        sync_parent_dir(&sidecar_path);

        self.sidecar = match Sidecar::open(&sidecar_path, remap.uid) {
            Ok(sidecar) => sidecar,
            Err(err) => {
                self.halted = true;
                return Err(err);
            }
        };

        let reclaimed = old_bytes - remap.live_bytes;
        self.audit.enqueue(
            AuditAction::Compact,
            hex::encode(self.header.store_uid),
            format!(
                "reclaimed {reclaimed} bytes, {} live bytes, {remapped} instances remapped",
                remap.live_bytes
            ),
        )?;
        tracing::info!(
            compact.reclaimed_bytes = reclaimed,
            compact.live_bytes = remap.live_bytes,
            compact.remapped_instances = remapped,
            "sidecar compacted"
        );
        Ok(CompactReport {
            reclaimed_bytes: reclaimed,
            live_bytes: remap.live_bytes,
            remapped_instances: remapped,
        })
    }
}
