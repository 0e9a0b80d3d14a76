//! Commit footers: the durable pointer to the last fully-written catalog.
//!
//! A footer trails every catalog snapshot. It is self-checksummed, so a
//! backward scan can locate the newest intact commit even when the header was
//! not updated before a crash or the file carries garbage past the footer.

use crate::constants::FORMAT_VERSION;
use crate::error::{Result, StoreError};

pub const FOOTER_MAGIC: [u8; 4] = *b"RVFT";
pub const FOOTER_SIZE: usize = 96;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitFooter {
    pub catalog_offset: u64,
    pub catalog_len: u64,
    pub catalog_checksum: [u8; 32],
    pub commit_sequence: u64,
}

impl CommitFooter {
    #[must_use]
    pub fn encode(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = [0u8; FOOTER_SIZE];
        buf[..4].copy_from_slice(&FOOTER_MAGIC);
        buf[4..6].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf[8..16].copy_from_slice(&self.catalog_offset.to_le_bytes());
        buf[16..24].copy_from_slice(&self.catalog_len.to_le_bytes());
        buf[24..56].copy_from_slice(&self.catalog_checksum);
        buf[56..64].copy_from_slice(&self.commit_sequence.to_le_bytes());
        let digest = blake3::hash(&buf[..64]);
        buf[64..96].copy_from_slice(digest.as_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FOOTER_SIZE {
            return Err(StoreError::InvalidCatalog {
                reason: "footer truncated".into(),
            });
        }
        let buf = &buf[..FOOTER_SIZE];
        if buf[..4] != FOOTER_MAGIC {
            return Err(StoreError::InvalidCatalog {
                reason: "footer magic mismatch".into(),
            });
        }
        let digest = blake3::hash(&buf[..64]);
        if digest.as_bytes() != &buf[64..96] {
            return Err(StoreError::InvalidCatalog {
                reason: "footer checksum mismatch".into(),
            });
        }

        let read_u64 = |range: std::ops::Range<usize>| {
            buf[range]
                .try_into()
                .map(u64::from_le_bytes)
                .map_err(|_| StoreError::InvalidCatalog {
                    reason: "footer field out of bounds".into(),
                })
        };
        let mut catalog_checksum = [0u8; 32];
        catalog_checksum.copy_from_slice(&buf[24..56]);

        Ok(Self {
            catalog_offset: read_u64(8..16)?,
            catalog_len: read_u64(16..24)?,
            catalog_checksum,
            commit_sequence: read_u64(56..64)?,
        })
    }
}

#[derive(Debug)]
pub struct FooterSlice {
    pub footer_offset: u64,
    pub footer: CommitFooter,
}

/// Scan `bytes` backwards for the newest footer whose self-checksum passes and
/// whose catalog range lies entirely before it.
#[must_use]
pub fn find_last_valid_footer(bytes: &[u8]) -> Option<FooterSlice> {
    if bytes.len() < FOOTER_SIZE {
        return None;
    }
    let mut pos = bytes.len() - FOOTER_SIZE;
    loop {
        if bytes[pos..pos + 4] == FOOTER_MAGIC {
            if let Ok(footer) = CommitFooter::decode(&bytes[pos..]) {
                let end = footer.catalog_offset.checked_add(footer.catalog_len);
                if end == Some(pos as u64) {
                    return Some(FooterSlice {
                        footer_offset: pos as u64,
                        footer,
                    });
                }
            }
        }
        if pos == 0 {
            return None;
        }
        pos -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CommitFooter {
        CommitFooter {
            catalog_offset: 8192,
            catalog_len: 512,
            catalog_checksum: [7u8; 32],
            commit_sequence: 3,
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        let footer = sample();
        let decoded = CommitFooter::decode(&footer.encode()).expect("decode");
        assert_eq!(decoded, footer);
    }

    #[test]
    fn decode_rejects_flipped_bit() {
        let mut buf = sample().encode();
        buf[17] ^= 0x01;
        assert!(CommitFooter::decode(&buf).is_err());
    }

    #[test]
    fn scan_finds_newest_footer_before_garbage() {
        let mut bytes = vec![0u8; 8192 + 512];
        let footer = sample();
        bytes.extend_from_slice(&footer.encode());
        // Torn trailing write from a crashed commit.
        bytes.extend_from_slice(&[0xAB; 100]);

        let slice = find_last_valid_footer(&bytes).expect("footer found");
        assert_eq!(slice.footer_offset, 8192 + 512);
        assert_eq!(slice.footer, footer);
    }

    #[test]
    fn scan_rejects_footer_overlapping_its_catalog() {
        let footer = CommitFooter {
            catalog_offset: 0,
            catalog_len: 64,
            ..sample()
        };
        // Footer claims the catalog ends past the footer position.
        let mut bytes = vec![0u8; 32];
        bytes.extend_from_slice(&footer.encode());
        assert!(find_last_valid_footer(&bytes).is_none());
    }
}
