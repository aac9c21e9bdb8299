//! Content-addressed page storage
//!
//! Page images are stored once per distinct content, named by the hex
//! SHA-256 of the uncompressed page, optionally LZ4 compressed.

use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use tracing::debug;

use crate::error::{Error, Result};

const RAW: u8 = 0;
const LZ4: u8 = 1;

/// Shared page blob store
pub struct PageStore {
    /// Base directory for blobs
    base_dir: PathBuf,
    /// Compress new blobs
    compression: bool,
}

impl PageStore {
    /// Create a new page store
    pub fn new(base_dir: PathBuf, compression: bool) -> Result<Self> {
        fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir,
            compression,
        })
    }

    /// Content hash of a page image
    pub fn hash(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    /// Get the path for a blob by its hash
    fn blob_path(&self, hash: &str) -> Result<PathBuf> {
        if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::Storage(format!("invalid page hash {:?}", hash)));
        }
        // First 2 characters as subdirectory
        Ok(self.base_dir.join(&hash[0..2]).join(&hash[2..]))
    }

    /// Store a page image and return its hash
    pub fn put(&self, data: &[u8]) -> Result<String> {
        let hash = Self::hash(data);
        if self.contains(&hash) {
            return Ok(hash);
        }
        let path = self.blob_path(&hash)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let (flag, body) = if self.compression {
            (LZ4, lz4_flex::compress_prepend_size(data))
        } else {
            (RAW, data.to_vec())
        };

        // Write to a temp name first so readers never see a partial blob
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&[flag])?;
            file.write_all(&body)?;
        }
        fs::rename(&tmp, &path)?;

        debug!("Stored page {} ({} bytes)", hash, data.len());
        Ok(hash)
    }

    /// Read a page image
    pub fn get(&self, hash: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(hash)?;
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::Storage(format!("page {} not found", hash)));
            }
            Err(e) => return Err(e.into()),
        };

        let data = match raw.split_first() {
            Some((&RAW, body)) => body.to_vec(),
            Some((&LZ4, body)) => lz4_flex::decompress_size_prepended(body)
                .map_err(|e| Error::Storage(format!("page {} is corrupt: {}", hash, e)))?,
            _ => return Err(Error::Storage(format!("page {} has an unknown format", hash))),
        };

        if Self::hash(&data) != hash {
            return Err(Error::Storage(format!("page {} failed verification", hash)));
        }
        Ok(data)
    }

    /// Check if a page image exists
    pub fn contains(&self, hash: &str) -> bool {
        self.blob_path(hash).map(|p| p.exists()).unwrap_or(false)
    }
}
