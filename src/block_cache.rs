//! On-disk cache of raw blocks, keyed by block hash.
//!
//! One hex file per block under `<data_dir>/<network>/rawblock/`. Writes go
//! through a temp file and a rename so readers never observe a partial block.
//! The engine is the single writer for its data directory.

use crate::types::IndexerError;
use bitcoin::BlockHash;
use log::debug;
use std::fs;
use std::io;
use std::path::PathBuf;

pub struct BlockCache {
    root: PathBuf,
}

impl BlockCache {
    pub fn new(root: PathBuf) -> Result<Self, IndexerError> {
        retry_once(|| fs::create_dir_all(&root)).map_err(IndexerError::CacheIo)?;
        Ok(Self { root })
    }

    pub fn has(&self, hash: &BlockHash) -> bool {
        self.path_of(hash).exists()
    }

    /// Returns the cached raw block, or `None` on a miss.
    pub fn get(&self, hash: &BlockHash) -> Result<Option<Vec<u8>>, IndexerError> {
        let path = self.path_of(hash);
        if !path.exists() {
            return Ok(None);
        }
        let hex_bytes = retry_once(|| fs::read_to_string(&path)).map_err(IndexerError::CacheIo)?;
        let bytes = hex::decode(hex_bytes.trim()).map_err(|err| {
            IndexerError::CacheIo(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("corrupt cached block {}: {}", hash, err),
            ))
        })?;
        Ok(Some(bytes))
    }

    pub fn put(&self, hash: &BlockHash, bytes: &[u8]) -> Result<(), IndexerError> {
        let path = self.path_of(hash);
        let tmp = path.with_extension("tmp");
        let encoded = hex::encode(bytes);
        retry_once(|| {
            fs::write(&tmp, &encoded)?;
            fs::rename(&tmp, &path)
        })
        .map_err(IndexerError::CacheIo)?;
        debug!("cached block {} ({} bytes)", hash, bytes.len());
        Ok(())
    }

    fn path_of(&self, hash: &BlockHash) -> PathBuf {
        self.root.join(hash.to_string())
    }
}

// Filesystem hiccups get one retry before turning fatal.
fn retry_once<T>(mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    op().or_else(|_| op())
}
