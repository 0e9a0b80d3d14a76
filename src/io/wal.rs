//! Embedded write-ahead log for metadata mutations.
//!
//! The WAL is a ring buffer inside the metadata file. Every catalog mutation
//! appends one checksummed record before the caller observes success; a
//! snapshot commit records a checkpoint and frees the region. Replay after a
//! crash applies every record past the last checkpointed sequence.
//!
//! A zeroed record header acts as the end-of-chain sentinel. Scanning stops at
//! the sentinel, at an implausible length, or at a checksum mismatch: a record
//! that fails its checksum was never acknowledged (records are fsynced before
//! `append_record` returns), so dropping it and everything after it is safe.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::constants::{WAL_CHECKPOINT_PERIOD, WAL_CHECKPOINT_THRESHOLD};
use crate::error::{Result, StoreError};
use crate::types::Header;

// Record header: [sequence: u64][len: u32][reserved: 4][blake3: 32]
const RECORD_HEADER_SIZE: usize = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalStats {
    pub region_size: u64,
    pub pending_bytes: u64,
    pub appends_since_checkpoint: u64,
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    pub sequence: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
pub struct MetaWal {
    file: File,
    region_offset: u64,
    region_size: u64,
    write_head: u64,
    pending_bytes: u64,
    sequence: u64,
    checkpoint_sequence: u64,
    appends_since_checkpoint: u64,
    read_only: bool,
    defer_sync: bool,
}

impl MetaWal {
    pub fn open(file: &File, header: &Header) -> Result<Self> {
        Self::open_internal(file, header, false)
    }

    pub fn open_read_only(file: &File, header: &Header) -> Result<Self> {
        Self::open_internal(file, header, true)
    }

    fn open_internal(file: &File, header: &Header, read_only: bool) -> Result<Self> {
        if header.wal_size == 0 {
            return Err(StoreError::InvalidHeader {
                reason: "wal_size must be non-zero".into(),
            });
        }
        let mut clone = file.try_clone()?;
        let region_offset = header.wal_offset;
        let region_size = header.wal_size;
        let checkpoint_sequence = header.wal_sequence;

        let (records, next_head) = scan_chain(&mut clone, region_offset, region_size)?;

        let pending_bytes = records
            .iter()
            .filter(|record| record.sequence > checkpoint_sequence)
            .map(|record| record.total_size)
            .sum();
        let sequence = records
            .iter()
            .map(|record| record.sequence)
            .max()
            .unwrap_or(checkpoint_sequence)
            .max(checkpoint_sequence);

        let mut wal = Self {
            file: clone,
            region_offset,
            region_size,
            write_head: next_head % region_size,
            pending_bytes,
            sequence,
            checkpoint_sequence,
            appends_since_checkpoint: 0,
            read_only,
            defer_sync: false,
        };
        if !wal.read_only {
            wal.write_sentinel()?;
            wal.sync()?;
        }
        Ok(wal)
    }

    fn assert_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        Ok(())
    }

    /// Append one record and make it durable. Returns the assigned sequence.
    ///
    /// Fails with `WalFull` when the region cannot take the record without
    /// overwriting un-checkpointed data; the caller checkpoints and retries.
    pub fn append_record(&mut self, payload: &[u8]) -> Result<u64> {
        self.assert_writable()?;
        if payload.is_empty() || payload.len() > u32::MAX as usize {
            return Err(StoreError::WalCorruption {
                offset: self.write_head,
                reason: "record payload length out of range".into(),
            });
        }

        let record_size = RECORD_HEADER_SIZE as u64 + payload.len() as u64;
        // One sentinel header must always fit after the record.
        if record_size + RECORD_HEADER_SIZE as u64 > self.region_size {
            return Err(StoreError::WalFull);
        }
        if self.pending_bytes + record_size + RECORD_HEADER_SIZE as u64 > self.region_size {
            return Err(StoreError::WalFull);
        }

        if self.write_head + record_size + RECORD_HEADER_SIZE as u64 > self.region_size {
            // Wrapping over pending records would lose them.
            if self.pending_bytes > 0 {
                return Err(StoreError::WalFull);
            }
            self.write_head = 0;
        }

        let sequence = self.sequence + 1;
        tracing::debug!(
            wal.write_head = self.write_head,
            wal.sequence = sequence,
            wal.payload_len = payload.len(),
            "wal append"
        );

        let digest = blake3::hash(payload);
        let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len());
        buf.extend_from_slice(&sequence.to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&[0u8; 4]);
        buf.extend_from_slice(digest.as_bytes());
        buf.extend_from_slice(payload);

        self.write_at(self.write_head, &buf)?;
        self.write_head += record_size;
        self.pending_bytes += record_size;
        self.sequence = sequence;
        self.appends_since_checkpoint += 1;

        self.write_sentinel()?;
        if !self.defer_sync {
            self.sync()?;
        }
        Ok(sequence)
    }

    /// Whether enough has accumulated that the owner should snapshot soon.
    #[must_use]
    pub fn should_checkpoint(&self) -> bool {
        if self.read_only || self.region_size == 0 {
            return false;
        }
        let occupancy = self.pending_bytes as f64 / self.region_size as f64;
        occupancy >= WAL_CHECKPOINT_THRESHOLD
            || self.appends_since_checkpoint >= WAL_CHECKPOINT_PERIOD
    }

    /// Mark everything up to the current sequence as captured by a snapshot.
    /// The caller persists `header` as part of the same commit.
    pub fn record_checkpoint(&mut self, header: &mut Header) -> Result<()> {
        self.assert_writable()?;
        self.pending_bytes = 0;
        self.appends_since_checkpoint = 0;
        self.checkpoint_sequence = self.sequence;
        header.wal_checkpoint_pos = self.write_head;
        header.wal_sequence = self.checkpoint_sequence;
        Ok(())
    }

    /// Records not yet covered by a checkpoint, in append order.
    pub fn pending_records(&mut self) -> Result<Vec<WalRecord>> {
        self.records_after(self.checkpoint_sequence)
    }

    pub fn records_after(&mut self, sequence: u64) -> Result<Vec<WalRecord>> {
        let (records, _) = scan_chain(&mut self.file, self.region_offset, self.region_size)?;
        Ok(records
            .into_iter()
            .filter(|record| record.sequence > sequence)
            .map(|record| WalRecord {
                sequence: record.sequence,
                payload: record.payload,
            })
            .collect())
    }

    #[must_use]
    pub fn stats(&self) -> WalStats {
        WalStats {
            region_size: self.region_size,
            pending_bytes: self.pending_bytes,
            appends_since_checkpoint: self.appends_since_checkpoint,
            sequence: self.sequence,
        }
    }

    /// Defer per-record fsync; the owner must call [`sync`](Self::sync) after
    /// the batch to restore durability.
    pub fn set_defer_sync(&mut self, defer: bool) {
        self.defer_sync = defer;
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all().map_err(Into::into)
    }

    fn write_at(&mut self, position: u64, bytes: &[u8]) -> Result<()> {
        let absolute = self.region_offset + (position % self.region_size);
        self.file.seek(SeekFrom::Start(absolute))?;
        self.file.write_all(bytes)?;
        Ok(())
    }

    /// Keep a zeroed header at the write head so scans terminate there.
    fn write_sentinel(&mut self) -> Result<()> {
        if self.region_size - self.write_head < RECORD_HEADER_SIZE as u64 {
            // Tail too short for a header; the chain implicitly ends here and
            // the next append wraps.
            return Ok(());
        }
        let zero = [0u8; RECORD_HEADER_SIZE];
        self.write_at(self.write_head, &zero)
    }
}

#[derive(Debug)]
struct ScannedRecord {
    sequence: u64,
    payload: Vec<u8>,
    total_size: u64,
}

fn scan_chain(file: &mut File, offset: u64, size: u64) -> Result<(Vec<ScannedRecord>, u64)> {
    let mut records = Vec::new();
    let mut cursor = 0u64;
    while cursor + RECORD_HEADER_SIZE as u64 <= size {
        file.seek(SeekFrom::Start(offset + cursor))?;
        let mut header = [0u8; RECORD_HEADER_SIZE];
        file.read_exact(&mut header)?;

        let sequence = u64::from_le_bytes(header[..8].try_into().map_err(|_| {
            StoreError::WalCorruption {
                offset: cursor,
                reason: "record header short".into(),
            }
        })?);
        let length = u64::from(u32::from_le_bytes(header[8..12].try_into().map_err(
            |_| StoreError::WalCorruption {
                offset: cursor,
                reason: "record header short".into(),
            },
        )?));
        let checksum = &header[16..48];

        if sequence == 0 && length == 0 {
            break;
        }
        if length == 0 || cursor + RECORD_HEADER_SIZE as u64 + length > size {
            // A torn header from an unacknowledged write; the chain ends here.
            tracing::warn!(
                wal.scan_offset = cursor,
                wal.length = length,
                "wal chain ends at implausible record length"
            );
            break;
        }

        let mut payload = vec![0u8; length as usize];
        file.read_exact(&mut payload)?;
        if blake3::hash(&payload).as_bytes() != checksum {
            tracing::warn!(
                wal.scan_offset = cursor,
                wal.sequence = sequence,
                "wal chain ends at checksum mismatch (torn record)"
            );
            break;
        }

        records.push(ScannedRecord {
            sequence,
            payload,
            total_size: RECORD_HEADER_SIZE as u64 + length,
        });
        cursor += RECORD_HEADER_SIZE as u64 + length;
    }
    Ok((records, cursor))
}
