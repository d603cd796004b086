//! The per-block snapshot of the billboard state.

use crate::plot::{Plot, PlotStatus};
use crate::types::{outpoint_set, BlockInfo};
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, OutPoint, Txid};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A pure value describing the full billboard state at one block.
///
/// Snapshots are immutable once persisted; the engine derives each snapshot
/// from its parent's by cloning and applying the block's transactions in
/// block-serialization order. `BTreeMap`/`BTreeSet` keep iteration (and
/// therefore serialization) deterministic.
// NOTE: `PartialEq` is used by the determinism and resume tests.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub block_hash: BlockHash,
    pub parent_hash: BlockHash,
    pub block_height: u32,
    pub timestamp: u32,
    pub tx_count: u32,
    /// Every plot ever claimed, keyed by its CLAIM txid.
    pub plots: BTreeMap<Txid, Plot>,
    /// The live deed outpoints, as `txid:vout` strings on disk.
    #[serde(with = "outpoint_set")]
    pub deed_utxo_set: BTreeSet<OutPoint>,
}

impl Snapshot {
    /// The state before any block has been applied.
    pub fn empty() -> Self {
        Self {
            block_hash: BlockHash::all_zeros(),
            parent_hash: BlockHash::all_zeros(),
            block_height: 0,
            timestamp: 0,
            tx_count: 0,
            plots: BTreeMap::new(),
            deed_utxo_set: BTreeSet::new(),
        }
    }

    /// Re-stamps the snapshot with the identifiers of the block about to be
    /// applied.
    pub fn stamp(&mut self, info: &BlockInfo) {
        self.block_hash = info.hash;
        self.parent_hash = info.parent;
        self.block_height = info.height;
        self.timestamp = info.timestamp;
        self.tx_count = info.tx_count;
    }

    /// The plot whose live deed is `outpoint`, if any.
    pub fn plot_by_deed(&self, outpoint: &OutPoint) -> Option<Txid> {
        // Linear scan; fine for the plot counts UBB sees in practice.
        self.plots
            .values()
            .find(|plot| plot.status != PlotStatus::Bricked && plot.deed_utxo == *outpoint)
            .map(|plot| plot.txid)
    }

    /// Validates the global state invariants. Returns a description of the
    /// first violation found.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut live_deeds = BTreeSet::new();
        for (key, plot) in &self.plots {
            if *key != plot.txid {
                return Err(format!("plot {} stored under key {}", plot.txid, key));
            }
            if plot.width == 0 || plot.height == 0 {
                return Err(format!("plot {} has a degenerate rectangle", plot.txid));
            }
            match plot.status {
                PlotStatus::Placed | PlotStatus::Unplaced => {
                    if !self.deed_utxo_set.contains(&plot.deed_utxo) {
                        return Err(format!(
                            "live plot {} deed {} is not in the deed set",
                            plot.txid, plot.deed_utxo
                        ));
                    }
                    if !live_deeds.insert(plot.deed_utxo) {
                        return Err(format!(
                            "deed {} is referenced by more than one live plot",
                            plot.deed_utxo
                        ));
                    }
                }
                PlotStatus::Bricked => {
                    if self.deed_utxo_set.contains(&plot.deed_utxo) {
                        return Err(format!(
                            "bricked plot {} deed {} is still in the deed set",
                            plot.txid, plot.deed_utxo
                        ));
                    }
                    if !plot.owner.is_empty() {
                        return Err(format!("bricked plot {} still has an owner", plot.txid));
                    }
                }
            }
            if plot.occupies_space() && !plot.rect().fits_canvas() {
                return Err(format!(
                    "occupying plot {} does not fit the canvas",
                    plot.txid
                ));
            }
        }
        if live_deeds.len() != self.deed_utxo_set.len() {
            return Err(format!(
                "deed set has {} entries but {} live plots reference one",
                self.deed_utxo_set.len(),
                live_deeds.len()
            ));
        }

        let occupying: Vec<&Plot> = self.plots.values().filter(|p| p.occupies_space()).collect();
        for (i, a) in occupying.iter().enumerate() {
            for b in &occupying[i + 1..] {
                if a.rect().overlaps(&b.rect()) {
                    return Err(format!(
                        "occupying plots {} and {} overlap",
                        a.txid, b.txid
                    ));
                }
            }
        }
        Ok(())
    }
}
