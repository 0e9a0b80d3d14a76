//! Fixed-layout codec for the metadata file header.
//!
//! The header is a single 96-byte block at offset 0. Rewriting it is the
//! commit point of every snapshot: it flips `footer_offset`, the catalog
//! checksum and the WAL checkpoint in one small write.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::constants::{FORMAT_VERSION, HEADER_SIZE, META_MAGIC};
use crate::error::{Result, StoreError};
use crate::types::Header;

pub struct HeaderCodec;

impl HeaderCodec {
    pub fn write(file: &mut File, header: &Header) -> Result<()> {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[..4].copy_from_slice(&header.magic);
        buf[4..6].copy_from_slice(&header.version.to_le_bytes());
        buf[8..24].copy_from_slice(&header.store_uid);
        buf[24..32].copy_from_slice(&header.footer_offset.to_le_bytes());
        buf[32..40].copy_from_slice(&header.wal_offset.to_le_bytes());
        buf[40..48].copy_from_slice(&header.wal_size.to_le_bytes());
        buf[48..56].copy_from_slice(&header.wal_checkpoint_pos.to_le_bytes());
        buf[56..64].copy_from_slice(&header.wal_sequence.to_le_bytes());
        buf[64..96].copy_from_slice(&header.catalog_checksum);

        file.seek(SeekFrom::Start(0))?;
        file.write_all(&buf)?;
        Ok(())
    }

    pub fn read(file: &mut File) -> Result<Header> {
        let mut buf = [0u8; HEADER_SIZE as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut buf)
            .map_err(|_| StoreError::InvalidHeader {
                reason: "file too short for a metadata header".into(),
            })?;

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&buf[..4]);
        if magic != META_MAGIC {
            return Err(StoreError::InvalidHeader {
                reason: "not a radvault metadata file".into(),
            });
        }
        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version != FORMAT_VERSION {
            return Err(StoreError::InvalidHeader {
                reason: format!("unsupported format version {version:#06x}"),
            });
        }

        let mut store_uid = [0u8; 16];
        store_uid.copy_from_slice(&buf[8..24]);
        let mut catalog_checksum = [0u8; 32];
        catalog_checksum.copy_from_slice(&buf[64..96]);

        let read_u64 = |range: std::ops::Range<usize>| -> u64 {
            let mut field = [0u8; 8];
            field.copy_from_slice(&buf[range]);
            u64::from_le_bytes(field)
        };

        Ok(Header {
            magic,
            version,
            store_uid,
            footer_offset: read_u64(24..32),
            wal_offset: read_u64(32..40),
            wal_size: read_u64(40..48),
            wal_checkpoint_pos: read_u64(48..56),
            wal_sequence: read_u64(56..64),
            catalog_checksum,
        })
    }
}
