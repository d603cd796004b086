//! Persistence of snapshots, plot images and the tip pointer.
//!
//! Layout under `<data_dir>/<network>/v1/<genesis_hash>/`:
//!
//! ```text
//! states/<block_hash>   one JSON snapshot per indexed block
//! images/<txid>.bmp     raw BMP bytes, keyed by the CLAIM txid
//! state_at_tip          pointer file naming the tip snapshot's block hash
//! ```
//!
//! Snapshots and the tip pointer are written via temp file + fsync + rename,
//! so concurrent readers (the viewer) only ever see committed state.

use crate::state::Snapshot;
use crate::types::IndexerError;
use bitcoin::{BlockHash, Txid};
use log::debug;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const TIP_FILE: &str = "state_at_tip";

pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: PathBuf) -> Result<Self, IndexerError> {
        fs::create_dir_all(root.join("states")).map_err(IndexerError::StoreIo)?;
        fs::create_dir_all(root.join("images")).map_err(IndexerError::StoreIo)?;
        Ok(Self { root })
    }

    pub fn has(&self, hash: &BlockHash) -> bool {
        self.state_path(hash).exists()
    }

    pub fn load(&self, hash: &BlockHash) -> Result<Snapshot, IndexerError> {
        let bytes = fs::read(self.state_path(hash)).map_err(IndexerError::StoreIo)?;
        serde_json::from_slice(&bytes).map_err(|err| {
            IndexerError::StoreIo(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("corrupt snapshot {}: {}", hash, err),
            ))
        })
    }

    /// Atomically persists a snapshot under its block hash. Snapshots are
    /// never rewritten afterwards.
    pub fn save(&self, snapshot: &Snapshot) -> Result<(), IndexerError> {
        let bytes = serde_json::to_vec_pretty(snapshot)
            .expect("a snapshot always serializes");
        self.write_atomic(&self.state_path(&snapshot.block_hash), &bytes)?;
        debug!(
            "saved snapshot {} at height {}",
            snapshot.block_hash, snapshot.block_height
        );
        Ok(())
    }

    pub fn save_image(&self, txid: &Txid, bytes: &[u8]) -> Result<(), IndexerError> {
        self.write_atomic(&self.image_path(txid), bytes)
    }

    pub fn image_path(&self, txid: &Txid) -> PathBuf {
        self.root.join("images").join(format!("{}.bmp", txid))
    }

    /// Atomically repoints `state_at_tip` at the given block hash.
    pub fn set_tip(&self, hash: &BlockHash) -> Result<(), IndexerError> {
        self.write_atomic(&self.root.join(TIP_FILE), format!("{}\n", hash).as_bytes())
    }

    /// The block hash the tip pointer currently names, if set.
    pub fn tip(&self) -> Result<Option<BlockHash>, IndexerError> {
        let path = self.root.join(TIP_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(path).map_err(IndexerError::StoreIo)?;
        contents
            .trim()
            .parse()
            .map(Some)
            .map_err(|err| {
                IndexerError::StoreIo(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("corrupt tip pointer: {}", err),
                ))
            })
    }

    fn state_path(&self, hash: &BlockHash) -> PathBuf {
        self.root.join("states").join(hash.to_string())
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), IndexerError> {
        let tmp = path.with_extension("tmp");
        let write = || -> io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            fs::rename(&tmp, path)
        };
        write().map_err(IndexerError::StoreIo)
    }
}
