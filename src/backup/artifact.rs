//! Backup artifact encoding
//!
//! An artifact is a bincode record holding the restore point it was taken
//! at, the page size, a crc32 of the raw pages and the lz4-compressed pages
//! themselves.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::snapshot::RestorePoint;

const MAGIC: [u8; 8] = *b"LBBACKUP";
const VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Artifact {
    magic: [u8; 8],
    version: u32,
    restore_point: RestorePoint,
    page_size: u32,
    checksum: u32,
    body: Vec<u8>,
}

/// Decoded artifact contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupPages {
    pub restore_point: RestorePoint,
    pub page_size: u32,
    /// `page_count * page_size` bytes, page 1 first
    pub pages: Vec<u8>,
}

impl BackupPages {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let artifact = Artifact {
            magic: MAGIC,
            version: VERSION,
            restore_point: self.restore_point,
            page_size: self.page_size,
            checksum: crc32fast::hash(&self.pages),
            body: lz4_flex::compress_prepend_size(&self.pages),
        };
        Ok(bincode::serialize(&artifact)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let artifact: Artifact = bincode::deserialize(data)
            .map_err(|e| Error::BackupCorrupted(format!("undecodable artifact: {}", e)))?;

        if artifact.magic != MAGIC {
            return Err(Error::BackupCorrupted("bad magic".into()));
        }
        if artifact.version != VERSION {
            return Err(Error::BackupCorrupted(format!(
                "unsupported artifact version {}",
                artifact.version
            )));
        }

        let pages = lz4_flex::decompress_size_prepended(&artifact.body)
            .map_err(|e| Error::BackupCorrupted(format!("decompression failed: {}", e)))?;
        if crc32fast::hash(&pages) != artifact.checksum {
            return Err(Error::BackupCorrupted("checksum mismatch".into()));
        }

        let expected = artifact.restore_point.page_count * artifact.page_size as u64;
        if pages.len() as u64 != expected {
            return Err(Error::BackupCorrupted(format!(
                "expected {} bytes of pages, found {}",
                expected,
                pages.len()
            )));
        }

        Ok(Self {
            restore_point: artifact.restore_point,
            page_size: artifact.page_size,
            pages,
        })
    }
}
