//! Append-only payload sidecar.
//!
//! Large opaque blobs live here, addressed by absolute offset and length and
//! referenced from instance rows in the catalog. Appends never overwrite
//! existing bytes, so concurrent readers need no coordination with the single
//! appender; a torn final append only shortens the readable range and is
//! caught by the range check on the next access. Compaction is the one
//! operation that rewrites blobs, and it writes a brand-new file.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::constants::{
    COMPACT_SUFFIX, FORMAT_VERSION, SIDECAR_HEADER_SIZE, SIDECAR_MAGIC, ZSTD_LEVEL,
};
use crate::error::{Result, StoreError};
use crate::types::{PayloadEncoding, PayloadRef};

#[derive(Debug)]
pub struct Sidecar {
    file: File,
    path: PathBuf,
    uid: [u8; 16],
    end: u64,
    defer_sync: bool,
}

/// Result of writing a compacted sidecar: where it was staged, its fresh
/// identity, and the offset remapping the owner must apply to every live
/// payload reference before swapping the file in.
#[derive(Debug)]
pub struct SidecarRemap {
    pub staging_path: PathBuf,
    pub uid: [u8; 16],
    pub offsets: BTreeMap<u64, u64>,
    pub live_bytes: u64,
}

impl Sidecar {
    /// Create an empty sidecar stamped with the owning store's identity.
    pub fn create(path: &Path, uid: [u8; 16]) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        write_sidecar_header(&mut file, uid)?;
        file.sync_all()?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            uid,
            end: SIDECAR_HEADER_SIZE,
            defer_sync: false,
        })
    }

    /// Open an existing sidecar and verify it belongs to `expected_uid`.
    pub fn open(path: &Path, expected_uid: [u8; 16]) -> Result<Self> {
        Self::open_with(path, expected_uid, true)
    }

    /// Open without write access, for shared-reader stores.
    pub fn open_read_only(path: &Path, expected_uid: [u8; 16]) -> Result<Self> {
        Self::open_with(path, expected_uid, false)
    }

    fn open_with(path: &Path, expected_uid: [u8; 16], writable: bool) -> Result<Self> {
        if !path.exists() {
            return Err(StoreError::MissingSidecar {
                path: path.to_path_buf(),
            });
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)?;
        let uid = read_sidecar_header(&mut file)?;
        if uid != expected_uid {
            return Err(StoreError::StoreMismatch {
                path: path.to_path_buf(),
            });
        }
        let end = file.metadata()?.len().max(SIDECAR_HEADER_SIZE);
        Ok(Self {
            file,
            path: path.to_path_buf(),
            uid,
            end,
            defer_sync: false,
        })
    }

    /// Read just the identity of a sidecar file, without adopting it.
    pub fn peek_uid(path: &Path) -> Result<[u8; 16]> {
        let mut file = File::open(path)?;
        read_sidecar_header(&mut file)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn uid(&self) -> [u8; 16] {
        self.uid
    }

    /// Current end of file; every valid payload range lies below it.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end
    }

    pub fn set_defer_sync(&mut self, defer: bool) {
        self.defer_sync = defer;
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all().map_err(Into::into)
    }

    /// Append one payload at end of file and return its reference. Pure
    /// append: existing byte ranges are immutable once this returns.
    pub fn append(&mut self, payload: &[u8], encoding: PayloadEncoding) -> Result<PayloadRef> {
        let blob = match encoding {
            PayloadEncoding::Raw => std::borrow::Cow::Borrowed(payload),
            PayloadEncoding::Zstd => std::borrow::Cow::Owned(zstd::encode_all(payload, ZSTD_LEVEL)?),
        };
        let content_hash: [u8; 32] = blake3::hash(&blob).into();

        let offset = self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&blob)?;
        if !self.defer_sync {
            self.file.sync_all()?;
        }
        self.end = offset + blob.len() as u64;

        tracing::debug!(
            sidecar.offset = offset,
            sidecar.length = blob.len(),
            "sidecar append"
        );
        Ok(PayloadRef {
            offset,
            length: blob.len() as u64,
            content_hash,
            encoding,
        })
    }

    /// Random-access read of the stored bytes, unverified and undecoded.
    ///
    /// Positioned reads leave the appender's cursor untouched, so any number
    /// of readers proceed without coordinating with the writer.
    pub fn read(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        let file_len = self.file.metadata()?.len();
        let end = offset.checked_add(length);
        if offset < SIDECAR_HEADER_SIZE || end.is_none_or(|end| end > file_len) {
            return Err(StoreError::Range {
                offset,
                length,
                file_len,
            });
        }

        let mut blob = vec![0u8; length as usize];
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            self.file.read_exact_at(&mut blob, offset)?;
        }
        #[cfg(not(unix))]
        {
            // No pread here; a private handle gives an independent cursor.
            let mut handle = File::open(&self.path)?;
            handle.seek(SeekFrom::Start(offset))?;
            handle.read_exact(&mut blob)?;
        }
        Ok(blob)
    }

    /// Read and verify against the caller-supplied content hash.
    pub fn read_verified(&self, offset: u64, length: u64, expected: &[u8; 32]) -> Result<Vec<u8>> {
        let blob = self.read(offset, length)?;
        let actual: [u8; 32] = blake3::hash(&blob).into();
        if &actual != expected {
            return Err(StoreError::Integrity {
                offset,
                expected: hex::encode(expected),
                actual: hex::encode(actual),
            });
        }
        Ok(blob)
    }

    /// Verified read plus decode back to the caller's original bytes.
    pub fn read_payload(&self, payload_ref: &PayloadRef) -> Result<Vec<u8>> {
        let blob = self.read_verified(
            payload_ref.offset,
            payload_ref.length,
            &payload_ref.content_hash,
        )?;
        match payload_ref.encoding {
            PayloadEncoding::Raw => Ok(blob),
            PayloadEncoding::Zstd => zstd::decode_all(Cursor::new(blob)).map_err(Into::into),
        }
    }

    /// Sum of bytes not covered by any of `live`, i.e. reclaimable space.
    #[must_use]
    pub fn orphan_bytes(&self, live: &[PayloadRef]) -> u64 {
        let mut covered = 0u64;
        let mut seen = BTreeMap::new();
        for payload_ref in live {
            seen.entry(payload_ref.offset)
                .or_insert(payload_ref.length);
        }
        for length in seen.values() {
            covered += length;
        }
        self.end.saturating_sub(SIDECAR_HEADER_SIZE + covered)
    }

    /// Write a compacted copy containing only `live` blobs, in ascending old
    /// offset order, to a staging file next to this one. The current file is
    /// untouched; the owner applies the returned remap to every payload
    /// reference and then swaps the staging file in.
    ///
    /// Must be externally serialized against `append`; taking `&mut self`
    /// enforces that within one handle.
    pub fn compact(&mut self, live: &[PayloadRef]) -> Result<SidecarRemap> {
        let staging_path = compact_staging_path(&self.path);
        let uid = *uuid::Uuid::new_v4().as_bytes();
        let mut staging = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&staging_path)?;
        write_sidecar_header(&mut staging, uid)?;

        // Duplicate references to one range are copied once.
        let mut ranges: BTreeMap<u64, u64> = BTreeMap::new();
        for payload_ref in live {
            ranges
                .entry(payload_ref.offset)
                .or_insert(payload_ref.length);
        }

        let mut offsets = BTreeMap::new();
        let mut cursor = SIDECAR_HEADER_SIZE;
        for (&old_offset, &length) in &ranges {
            let blob = self.read(old_offset, length)?;
            staging.write_all(&blob)?;
            offsets.insert(old_offset, cursor);
            cursor += length;
        }
        staging.sync_all()?;

        tracing::info!(
            sidecar.live_ranges = ranges.len(),
            sidecar.live_bytes = cursor - SIDECAR_HEADER_SIZE,
            sidecar.old_bytes = self.end - SIDECAR_HEADER_SIZE,
            "sidecar compaction staged"
        );
        Ok(SidecarRemap {
            staging_path,
            uid,
            offsets,
            live_bytes: cursor - SIDECAR_HEADER_SIZE,
        })
    }
}

/// Staging path of a compaction for a given sidecar path.
#[must_use]
pub fn compact_staging_path(sidecar_path: &Path) -> PathBuf {
    let mut name = sidecar_path.as_os_str().to_os_string();
    name.push(".");
    name.push(COMPACT_SUFFIX);
    PathBuf::from(name)
}

fn write_sidecar_header(file: &mut File, uid: [u8; 16]) -> Result<()> {
    let mut buf = [0u8; SIDECAR_HEADER_SIZE as usize];
    buf[..4].copy_from_slice(&SIDECAR_MAGIC);
    buf[4..6].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    buf[8..24].copy_from_slice(&uid);
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&buf)?;
    Ok(())
}

fn read_sidecar_header(file: &mut File) -> Result<[u8; 16]> {
    let mut buf = [0u8; SIDECAR_HEADER_SIZE as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut buf)
        .map_err(|_| StoreError::InvalidHeader {
            reason: "file too short for a sidecar header".into(),
        })?;
    if buf[..4] != SIDECAR_MAGIC {
        return Err(StoreError::InvalidHeader {
            reason: "not a radvault sidecar file".into(),
        });
    }
    let version = u16::from_le_bytes([buf[4], buf[5]]);
    if version != FORMAT_VERSION {
        return Err(StoreError::InvalidHeader {
            reason: format!("unsupported sidecar version {version:#06x}"),
        });
    }
    let mut uid = [0u8; 16];
    uid.copy_from_slice(&buf[8..24]);
    Ok(uid)
}
