//! Indexer for the UBB on-chain billboard protocol.
//!
//! UBB claims rectangular plots on a 65536×65536 pixel canvas through Bitcoin
//! transactions carrying an OP_RETURN payload (coordinates plus a raw BMP) and
//! a 600-satoshi "deed" output whose spending transfers plot ownership. This
//! crate reconstructs, for every block hash, a deterministic snapshot of all
//! plots, their status and their owners, by replaying blocks from a chosen
//! genesis up to a caller-supplied tip.

mod block_cache;
pub mod bmp;
pub mod classify;
pub mod indexer;
pub mod payload;
pub mod plot;
pub mod rpc;
mod snapshot_store;
pub mod state;
pub mod store;
pub mod test_utils;
pub mod types;

use bitcoin::BlockHash;
use lazy_static::lazy_static;

pub use block_cache::BlockCache;
pub use indexer::{GenesisRef, Indexer, IndexerConfig};
pub use snapshot_store::SnapshotStore;
pub use state::Snapshot;
pub use types::{IndexerError, Network, RunSummary, Warning};

/// Width and height of the billboard canvas, in pixels.
pub const CANVAS_SIZE: u32 = 65536;

/// The exact output value that marks a deed, in satoshis.
pub const DEED_VALUE: u64 = 600;

/// The dust threshold relevant to callers building deed outputs, in satoshis.
/// The indexer itself only ever matches on [`DEED_VALUE`].
pub const DUST_THRESHOLD: u64 = 546;

lazy_static! {
    /// The mainnet block at which the billboard protocol begins. Used when the
    /// caller passes no genesis hash and no `--genesis-from-height-0`.
    pub static ref MAINNET_GENESIS: BlockHash =
        "00000000000000000002c0cc73626b56fb3ee1ce605b0ce125cc4fb58775a0a9"
            .parse()
            .unwrap();
}
