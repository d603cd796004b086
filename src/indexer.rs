//! The two-phase indexing engine.
//!
//! Phase 1 walks parent pointers down from the caller-supplied tip until it
//! finds a block with a persisted snapshot (or the protocol genesis),
//! building the parent → child map. Phase 2 replays the missing suffix
//! forward, persisting one snapshot per block and finally repointing the tip.
//!
//! The engine is a single-threaded cooperative sequence: the only suspension
//! points are node RPC calls and disk I/O, and cancellation takes effect at
//! block boundaries, where the last applied snapshot is already durable.

use crate::block_cache::BlockCache;
use crate::rpc::{BlockSource, SourceError};
use crate::snapshot_store::SnapshotStore;
use crate::state::Snapshot;
use crate::store;
use crate::types::{BlockInfo, IndexerError, Network, RunSummary};
use bitcoin::block::Header;
use bitcoin::consensus::encode::{deserialize, deserialize_partial};
use bitcoin::hashes::Hash;
use bitcoin::{Block, BlockHash};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

// Backoff never sleeps longer than this between attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct IndexerConfig {
    pub data_dir: PathBuf,
    pub network: Network,
    /// Additional attempts after the first failed RPC call.
    pub max_retries: u32,
    /// Base delay of the exponential backoff between attempts.
    pub retry_delay: Duration,
}

/// How the caller names the protocol genesis.
#[derive(Clone, Copy, Debug)]
pub enum GenesisRef {
    Hash(BlockHash),
    /// Resolve via `getblockhash(0)`.
    Height0,
}

pub struct Indexer<S> {
    source: S,
    config: IndexerConfig,
    cancel: Arc<AtomicBool>,
}

impl<S: BlockSource> Indexer<S> {
    pub fn new(source: S, config: IndexerConfig) -> Self {
        Self {
            source,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The flag a signal handler sets to stop the run after the current
    /// block.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Indexes from `genesis` up to `tip` (the node's best block when
    /// `None`), resuming from the newest snapshot already on disk.
    pub async fn run(
        &self,
        tip: Option<BlockHash>,
        genesis: GenesisRef,
    ) -> Result<RunSummary, IndexerError> {
        let network = self.config.network;

        let chain = self.with_retry("getblockchaininfo", || self.source.chain_name()).await?;
        if !network.matches_chain(&chain) {
            return Err(IndexerError::NetworkMismatch {
                configured: network,
                actual: chain,
            });
        }

        let genesis = match genesis {
            GenesisRef::Hash(hash) => hash,
            GenesisRef::Height0 => {
                self.with_retry("getblockhash", || self.source.get_hash_at_height(0))
                    .await?
            }
        };
        let tip = match tip {
            Some(hash) => hash,
            None => self.with_retry("getbestblockhash", || self.source.get_tip()).await?,
        };
        info!("indexing {} from genesis {} to tip {}", network, genesis, tip);

        let network_dir = self.config.data_dir.join(network.dir_name());
        let cache = BlockCache::new(network_dir.join("rawblock"))?;
        let store = SnapshotStore::new(
            network_dir.join("v1").join(genesis.to_string()),
        )?;

        let mut summary = RunSummary::default();

        // Phase 1: walk down from the tip to a resumable snapshot or the
        // genesis, remembering each block's child.
        let mut child_of: BTreeMap<BlockHash, BlockHash> = BTreeMap::new();
        let mut cursor = tip;
        let resume = loop {
            if store.has(&cursor) {
                break Some(cursor);
            }
            if cursor == genesis {
                break None;
            }
            let bytes = self.fetch_block(&cache, &cursor).await?;
            let (header, _) = deserialize_partial::<Header>(&bytes).map_err(|err| {
                IndexerError::BlockParse {
                    hash: cursor,
                    reason: err.to_string(),
                }
            })?;
            let parent = header.prev_blockhash;
            if parent == BlockHash::all_zeros() {
                // Ran past the chain's own genesis without meeting ours.
                return Err(IndexerError::GenesisUnreachable(genesis));
            }
            child_of.insert(parent, cursor);
            cursor = parent;
        };
        debug!("phase 1 complete: {} blocks to apply", child_of.len());

        // No snapshot on disk: the genesis block itself is the first block
        // applied, onto an empty state.
        let (mut snapshot, mut current) = match resume {
            Some(hash) => {
                info!("resuming from snapshot {}", hash);
                (store.load(&hash)?, hash)
            }
            None => {
                let bytes = self.fetch_block(&cache, &genesis).await?;
                let block = decode_block(&genesis, &bytes)?;
                let height = self
                    .with_retry("getblock", || self.source.get_height_of(&genesis))
                    .await?;
                info!("initializing state at genesis {} (height {})", genesis, height);
                let mut snapshot = Snapshot::empty();
                self.apply_and_persist(&store, &mut snapshot, &block, height, &mut summary)?;
                (snapshot, genesis)
            }
        };

        // Phase 2: replay the suffix in parent-to-child order.
        while current != tip {
            if self.cancel.load(Ordering::Relaxed) {
                info!(
                    "cancellation requested; stopping after block {} (height {})",
                    current, snapshot.block_height
                );
                summary.success = true;
                return Ok(summary);
            }
            let next = *child_of
                .get(&current)
                .expect("phase 1 linked every ancestor of the tip to its child");
            let bytes = self.fetch_block(&cache, &next).await?;
            let block = decode_block(&next, &bytes)?;
            let height = snapshot.block_height + 1;
            self.apply_and_persist(&store, &mut snapshot, &block, height, &mut summary)?;
            current = next;
        }

        store.set_tip(&tip)?;
        summary.success = true;
        info!(
            "indexing complete: {} blocks, {} transactions, {} plots created, {} updated, {} bricked, {} warnings",
            summary.blocks_processed,
            summary.transactions_processed,
            summary.plots_created,
            summary.plots_updated,
            summary.plots_bricked,
            summary.warnings.len(),
        );
        Ok(summary)
    }

    // Applies one block to the working snapshot and makes the result durable:
    // images first, then the snapshot itself.
    fn apply_and_persist(
        &self,
        store: &SnapshotStore,
        snapshot: &mut Snapshot,
        block: &Block,
        height: u32,
        summary: &mut RunSummary,
    ) -> Result<(), IndexerError> {
        let info = BlockInfo::from_block(block, height);
        let outcome = store::apply_block(snapshot, &info, block, self.config.network);
        for (txid, bmp) in &outcome.images {
            store.save_image(txid, bmp)?;
        }
        for warning in &outcome.warnings {
            warn!("{}", warning);
        }
        store.save(snapshot)?;

        debug!(
            "applied block {} at height {}: {} of {} transactions relevant",
            info.hash, height, outcome.relevant_txs, info.tx_count
        );
        summary.blocks_processed += 1;
        summary.transactions_processed += u64::from(info.tx_count);
        summary.plots_created += outcome.plots_created;
        summary.plots_updated += outcome.plots_updated;
        summary.plots_bricked += outcome.plots_bricked;
        summary.warnings.extend(outcome.warnings);
        Ok(())
    }

    // Serves a block from the cache, downloading and caching it on a miss.
    async fn fetch_block(
        &self,
        cache: &BlockCache,
        hash: &BlockHash,
    ) -> Result<Vec<u8>, IndexerError> {
        if let Some(bytes) = cache.get(hash)? {
            return Ok(bytes);
        }
        let bytes = self
            .with_retry("getblock", || self.source.get_block_bytes(hash))
            .await?;
        cache.put(hash, &bytes)?;
        Ok(bytes)
    }

    // Runs one RPC call with bounded exponential backoff.
    async fn with_retry<T, Fut>(
        &self,
        what: &str,
        mut call: impl FnMut() -> Fut,
    ) -> Result<T, IndexerError>
    where
        Fut: Future<Output = Result<T, SourceError>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= self.config.max_retries => {
                    return Err(IndexerError::Transport(err));
                }
                Err(err) => {
                    let backoff = self
                        .config
                        .retry_delay
                        .saturating_mul(1 << attempt.min(6))
                        .min(MAX_BACKOFF);
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        what,
                        attempt + 1,
                        self.config.max_retries + 1,
                        err,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}

fn decode_block(hash: &BlockHash, bytes: &[u8]) -> Result<Block, IndexerError> {
    deserialize::<Block>(bytes).map_err(|err| IndexerError::BlockParse {
        hash: *hash,
        reason: err.to_string(),
    })
}
