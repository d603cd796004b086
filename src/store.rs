//! Applying blocks and transactions to the billboard state.
//!
//! This is the deterministic heart of the indexer: given a snapshot and a
//! block, produce the successor snapshot. Transactions are applied strictly
//! in block-serialization order, which is what resolves same-block conflicts.

use crate::bmp;
use crate::classify::{self, DeedOutput, TxClass};
use crate::payload::{self, Payload};
use crate::plot::{self, Plot, PlotStatus, Rect};
use crate::state::Snapshot;
use crate::types::{BlockInfo, Network, Warning};
use bitcoin::hashes::{sha256, Hash};
use bitcoin::{Block, OutPoint, Transaction, Txid};
use log::debug;

/// Everything a block application produced besides the mutated snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockOutcome {
    /// UBB-relevant transactions seen.
    pub relevant_txs: u64,
    pub plots_created: u64,
    pub plots_updated: u64,
    pub plots_bricked: u64,
    pub warnings: Vec<Warning>,
    /// BMPs to persist, keyed by the owning plot's CLAIM txid.
    pub images: Vec<(Txid, Vec<u8>)>,
}

/// Stamps `snapshot` with the block identifiers and applies every transaction
/// of `block` in order.
pub fn apply_block(
    snapshot: &mut Snapshot,
    info: &BlockInfo,
    block: &Block,
    network: Network,
) -> BlockOutcome {
    snapshot.stamp(info);
    let mut outcome = BlockOutcome::default();
    for tx in &block.txdata {
        apply_transaction(snapshot, tx, network, info.timestamp, &mut outcome);
    }
    debug_assert_eq!(snapshot.check_invariants(), Ok(()));
    outcome
}

/// The per-transaction state-transition function.
pub fn apply_transaction(
    snapshot: &mut Snapshot,
    tx: &Transaction,
    network: Network,
    now: u32,
    out: &mut BlockOutcome,
) {
    let class = classify::classify(tx, &snapshot.deed_utxo_set, network);
    if !class.is_relevant() {
        return;
    }
    out.relevant_txs += 1;
    let txid = tx.compute_txid();

    match effective_payload(&class, txid, out) {
        Some(Payload::Claim { x0, y0, uri, bmp }) => {
            if class.spent_deed.is_some() {
                // A CLAIM never spends a deed. The claim is dropped and the
                // transaction falls through to pure deed-flow semantics.
                out.warnings.push(Warning::InvalidDeedFlow {
                    txid,
                    reason: "CLAIM spends a deed; claim dropped".to_string(),
                });
                deed_flow(snapshot, &class, txid, now, out);
            } else {
                apply_claim(snapshot, &class, txid, x0, y0, uri, bmp, now, out);
            }
        }
        Some(Payload::RetryClaim { x0, y0 }) => {
            apply_retry_claim(snapshot, &class, txid, x0, y0, now, out)
        }
        Some(Payload::Update { x0, y0, uri, bmp }) => {
            apply_update(snapshot, &class, txid, x0, y0, uri, bmp, now, out)
        }
        Some(Payload::Transfer) | None => deed_flow(snapshot, &class, txid, now, out),
    }
}

// Demotes the raw payload to "no payload" when the transaction carries more
// than one UBB OP_RETURN or the payload does not parse. Deed flow still runs
// in both cases.
fn effective_payload(class: &TxClass, txid: Txid, out: &mut BlockOutcome) -> Option<Payload> {
    if class.ubb_op_returns >= 2 {
        debug!(
            "tx {}: {} UBB OP_RETURNs; payload discarded",
            txid, class.ubb_op_returns
        );
        return None;
    }
    let bytes = class.first_payload.as_ref()?;
    match payload::parse(bytes) {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            out.warnings.push(Warning::ParsePayload {
                txid,
                reason: err.to_string(),
            });
            None
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn apply_claim(
    snapshot: &mut Snapshot,
    class: &TxClass,
    txid: Txid,
    x0: u16,
    y0: u16,
    uri: String,
    bmp: Vec<u8>,
    now: u32,
    out: &mut BlockOutcome,
) {
    if !class.single_deed() {
        out.warnings.push(Warning::InvalidDeedFlow {
            txid,
            reason: format!(
                "CLAIM requires exactly one 600-satoshi deed output, found {}",
                class.deed_outputs.len()
            ),
        });
        return;
    }
    let info = match bmp::validate(&bmp) {
        Ok(info) => info,
        Err(err) => {
            out.warnings.push(Warning::InvalidBmp {
                txid,
                reason: err.to_string(),
            });
            return;
        }
    };
    if info.width > u32::from(u16::MAX) || info.height > u32::from(u16::MAX) {
        // Wider than the canvas itself; such a plot could never be placed or
        // rescued.
        out.warnings.push(Warning::InvalidBmp {
            txid,
            reason: format!("dimensions {}x{} exceed the canvas", info.width, info.height),
        });
        return;
    }

    let (width, height) = (info.width as u16, info.height as u16);
    let status = plot::determine_status(Rect::new(x0, y0, width, height), snapshot.plots.values());
    let deed = &class.deed_outputs[0];
    let plot = Plot {
        txid,
        x0,
        y0,
        width,
        height,
        status,
        deed_utxo: deed.outpoint,
        image_hash: image_hash(&bmp),
        owner: deed.address.clone(),
        uri: normalize_uri(uri),
        was_placed_before_bricking: false,
        created_at: now,
        last_updated: now,
    };
    snapshot.deed_utxo_set.insert(deed.outpoint);
    snapshot.plots.insert(txid, plot);
    out.images.push((txid, bmp));
    out.plots_created += 1;
}

fn apply_retry_claim(
    snapshot: &mut Snapshot,
    class: &TxClass,
    txid: Txid,
    x0: u16,
    y0: u16,
    now: u32,
    out: &mut BlockOutcome,
) {
    let spent = match class.spent_deed {
        Some(spent) => spent,
        None => {
            out.warnings.push(Warning::PlotNotFound {
                txid,
                reason: "RETRY-CLAIM spends no deed; dropped".to_string(),
            });
            return;
        }
    };
    let plot_txid = plot_of_deed(snapshot, &spent);
    if !class.single_deed() {
        brick_on_bad_deed_flow(snapshot, class, txid, plot_txid, spent, now, out);
        return;
    }

    let target = &snapshot.plots[&plot_txid];
    if target.status == PlotStatus::Unplaced {
        let rect = Rect::new(x0, y0, target.width, target.height);
        // The target takes no space while UNPLACED, so it cannot collide
        // with itself at the new coordinates.
        let status = plot::determine_status(rect, snapshot.plots.values());
        let plot = snapshot.plots.get_mut(&plot_txid).expect("looked up above");
        plot.x0 = x0;
        plot.y0 = y0;
        plot.status = status;
        out.plots_updated += 1;
    } else {
        // Anything other than UNPLACED cannot be retried; the deed spend is
        // still honored below.
        out.warnings.push(Warning::PlotNotFound {
            txid,
            reason: format!("RETRY-CLAIM target {} is not UNPLACED; deed rotated", plot_txid),
        });
    }
    rotate_deed(snapshot, plot_txid, spent, &class.deed_outputs[0], now);
}

#[allow(clippy::too_many_arguments)]
fn apply_update(
    snapshot: &mut Snapshot,
    class: &TxClass,
    txid: Txid,
    x0: u16,
    y0: u16,
    uri: String,
    bmp: Vec<u8>,
    now: u32,
    out: &mut BlockOutcome,
) {
    let spent = match class.spent_deed {
        Some(spent) => spent,
        None => {
            out.warnings.push(Warning::PlotNotFound {
                txid,
                reason: "UPDATE spends no deed; dropped".to_string(),
            });
            return;
        }
    };
    let plot_txid = plot_of_deed(snapshot, &spent);
    if !class.single_deed() {
        brick_on_bad_deed_flow(snapshot, class, txid, plot_txid, spent, now, out);
        return;
    }

    let target = &snapshot.plots[&plot_txid];
    if target.status == PlotStatus::Placed {
        match bmp::validate(&bmp) {
            Err(err) => out.warnings.push(Warning::InvalidBmp {
                txid,
                reason: err.to_string(),
            }),
            Ok(info) => {
                let matches = x0 == target.x0
                    && y0 == target.y0
                    && info.width == u32::from(target.width)
                    && info.height == u32::from(target.height);
                if matches {
                    let plot = snapshot.plots.get_mut(&plot_txid).expect("looked up above");
                    plot.image_hash = image_hash(&bmp);
                    plot.uri = normalize_uri(uri);
                    out.images.push((plot_txid, bmp));
                    out.plots_updated += 1;
                } else {
                    debug!(
                        "tx {}: UPDATE geometry does not match plot {}; image unchanged",
                        txid, plot_txid
                    );
                }
            }
        }
    } else {
        out.warnings.push(Warning::PlotNotFound {
            txid,
            reason: format!("UPDATE target {} is not PLACED; deed rotated", plot_txid),
        });
    }
    rotate_deed(snapshot, plot_txid, spent, &class.deed_outputs[0], now);
}

// Pure deed movement with no (usable) payload: a single 600-satoshi output
// transfers ownership, anything else breaks the deed chain.
fn deed_flow(
    snapshot: &mut Snapshot,
    class: &TxClass,
    txid: Txid,
    now: u32,
    out: &mut BlockOutcome,
) {
    let spent = match class.spent_deed {
        Some(spent) => spent,
        None => return,
    };
    let plot_txid = plot_of_deed(snapshot, &spent);
    if class.single_deed() {
        rotate_deed(snapshot, plot_txid, spent, &class.deed_outputs[0], now);
    } else {
        brick_on_bad_deed_flow(snapshot, class, txid, plot_txid, spent, now, out);
    }
}

// A live deed always belongs to exactly one non-bricked plot; anything else
// is state corruption.
fn plot_of_deed(snapshot: &Snapshot, spent: &OutPoint) -> Txid {
    match snapshot.plot_by_deed(spent) {
        Some(txid) => txid,
        None => panic!("deed outpoint {} is live but no plot references it", spent),
    }
}

fn rotate_deed(
    snapshot: &mut Snapshot,
    plot_txid: Txid,
    spent: OutPoint,
    new_deed: &DeedOutput,
    now: u32,
) {
    snapshot.deed_utxo_set.remove(&spent);
    snapshot.deed_utxo_set.insert(new_deed.outpoint);
    let plot = snapshot.plots.get_mut(&plot_txid).expect("plot exists");
    plot.deed_utxo = new_deed.outpoint;
    plot.owner = new_deed.address.clone();
    plot.last_updated = now;
}

fn brick_on_bad_deed_flow(
    snapshot: &mut Snapshot,
    class: &TxClass,
    txid: Txid,
    plot_txid: Txid,
    spent: OutPoint,
    now: u32,
    out: &mut BlockOutcome,
) {
    out.warnings.push(Warning::InvalidDeedFlow {
        txid,
        reason: format!(
            "deed spend with {} 600-satoshi outputs bricks plot {}",
            class.deed_outputs.len(),
            plot_txid
        ),
    });
    snapshot.deed_utxo_set.remove(&spent);
    let plot = snapshot.plots.get_mut(&plot_txid).expect("plot exists");
    plot.brick();
    plot.last_updated = now;
    out.plots_bricked += 1;
}

fn image_hash(bmp: &[u8]) -> String {
    sha256::Hash::hash(bmp).to_string()
}

fn normalize_uri(uri: String) -> Option<String> {
    if uri.is_empty() {
        None
    } else {
        Some(uri)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::payload::{PROTOCOL_VERSION, UBB_MAGIC};
    use crate::test_utils::{
        build_bmp, build_claim_payload, build_retry_payload, build_update_payload, outpoint,
        p2pkh_address, TransactionBuilder,
    };
    use proptest::prelude::*;

    fn apply(snapshot: &mut Snapshot, tx: &Transaction) -> BlockOutcome {
        let mut out = BlockOutcome::default();
        apply_transaction(snapshot, tx, Network::Regtest, 1_600_000_000, &mut out);
        assert_eq!(snapshot.check_invariants(), Ok(()));
        out
    }

    fn claim_tx(n: u8, x0: u16, y0: u16, bmp: &[u8]) -> Transaction {
        TransactionBuilder::new()
            .with_input(outpoint(n))
            .with_op_return(build_claim_payload(x0, y0, "ubb://plot", bmp))
            .with_output(&p2pkh_address(n), 600)
            .build()
    }

    fn deed_of(tx: &Transaction, vout: u32) -> OutPoint {
        OutPoint::new(tx.compute_txid(), vout)
    }

    #[test]
    fn claim_creates_a_placed_plot() {
        let mut snapshot = Snapshot::empty();
        let bmp = build_bmp(2, 2, 24);
        let tx = claim_tx(1, 100, 100, &bmp);
        let out = apply(&mut snapshot, &tx);

        assert_eq!(out.plots_created, 1);
        assert_eq!(out.relevant_txs, 1);
        assert!(out.warnings.is_empty());

        let plot = &snapshot.plots[&tx.compute_txid()];
        assert_eq!((plot.x0, plot.y0), (100, 100));
        assert_eq!((plot.width, plot.height), (2, 2));
        assert_eq!(plot.status, PlotStatus::Placed);
        assert_eq!(plot.owner, p2pkh_address(1).to_string());
        assert_eq!(plot.uri.as_deref(), Some("ubb://plot"));
        assert_eq!(plot.deed_utxo, deed_of(&tx, 1));
        assert!(snapshot.deed_utxo_set.contains(&deed_of(&tx, 1)));
        assert_eq!(out.images, vec![(tx.compute_txid(), bmp)]);
    }

    #[test]
    fn claim_with_wrong_deed_count_is_dropped() {
        let mut snapshot = Snapshot::empty();
        let bmp = build_bmp(2, 2, 24);

        // No deed output at all.
        let tx = TransactionBuilder::new()
            .with_input(outpoint(1))
            .with_op_return(build_claim_payload(0, 0, "", &bmp))
            .build();
        let out = apply(&mut snapshot, &tx);
        assert!(snapshot.plots.is_empty());
        assert!(matches!(
            out.warnings.as_slice(),
            [Warning::InvalidDeedFlow { .. }]
        ));

        // Two deed outputs.
        let tx = TransactionBuilder::new()
            .with_input(outpoint(2))
            .with_op_return(build_claim_payload(0, 0, "", &bmp))
            .with_output(&p2pkh_address(1), 600)
            .with_output(&p2pkh_address(2), 600)
            .build();
        let out = apply(&mut snapshot, &tx);
        assert!(snapshot.plots.is_empty());
        assert!(matches!(
            out.warnings.as_slice(),
            [Warning::InvalidDeedFlow { .. }]
        ));
    }

    #[test]
    fn claim_with_invalid_bmp_is_dropped() {
        let mut snapshot = Snapshot::empty();
        let mut bmp = build_bmp(2, 2, 24);
        bmp[30] = 1; // compressed
        let tx = claim_tx(1, 0, 0, &bmp);
        let out = apply(&mut snapshot, &tx);
        assert!(snapshot.plots.is_empty());
        assert!(snapshot.deed_utxo_set.is_empty());
        assert!(matches!(
            out.warnings.as_slice(),
            [Warning::InvalidBmp { .. }]
        ));
    }

    #[test]
    fn overlapping_claim_is_unplaced() {
        let mut snapshot = Snapshot::empty();
        let bmp = build_bmp(128, 127, 24);
        let first = claim_tx(1, 100, 100, &bmp);
        apply(&mut snapshot, &first);
        let second = claim_tx(2, 150, 150, &bmp);
        apply(&mut snapshot, &second);

        assert_eq!(
            snapshot.plots[&first.compute_txid()].status,
            PlotStatus::Placed
        );
        assert_eq!(
            snapshot.plots[&second.compute_txid()].status,
            PlotStatus::Unplaced
        );
    }

    #[test]
    fn same_block_conflicts_resolve_by_transaction_order() {
        let mut snapshot = Snapshot::empty();
        let bmp = build_bmp(16, 16, 24);
        let first = claim_tx(1, 10, 10, &bmp);
        let second = claim_tx(2, 20, 20, &bmp);

        // Both in one block: the earlier transaction wins.
        for tx in [&first, &second] {
            apply(&mut snapshot, tx);
        }
        assert_eq!(
            snapshot.plots[&first.compute_txid()].status,
            PlotStatus::Placed
        );
        assert_eq!(
            snapshot.plots[&second.compute_txid()].status,
            PlotStatus::Unplaced
        );
    }

    #[test]
    fn claims_at_the_canvas_corner() {
        let mut snapshot = Snapshot::empty();

        // A 1x1 plot in the very last pixel fits.
        let corner = claim_tx(1, 65535, 65535, &build_bmp(1, 1, 24));
        apply(&mut snapshot, &corner);
        assert_eq!(
            snapshot.plots[&corner.compute_txid()].status,
            PlotStatus::Placed
        );

        // A 2x2 plot at (65534, 65534) fits the canvas but collides with the
        // corner pixel.
        let blocked = claim_tx(2, 65534, 65534, &build_bmp(2, 2, 24));
        apply(&mut snapshot, &blocked);
        assert_eq!(
            snapshot.plots[&blocked.compute_txid()].status,
            PlotStatus::Unplaced
        );

        // One pixel further it would fall off the canvas entirely.
        let outside = claim_tx(3, 65535, 65535, &build_bmp(2, 2, 24));
        apply(&mut snapshot, &outside);
        assert_eq!(
            snapshot.plots[&outside.compute_txid()].status,
            PlotStatus::Unplaced
        );
    }

    #[test]
    fn transfer_rotates_the_deed() {
        let mut snapshot = Snapshot::empty();
        let bmp = build_bmp(2, 2, 24);
        let claim = claim_tx(1, 100, 100, &bmp);
        apply(&mut snapshot, &claim);

        let transfer = TransactionBuilder::new()
            .with_input(deed_of(&claim, 1))
            .with_output(&p2pkh_address(7), 600)
            .build();
        let out = apply(&mut snapshot, &transfer);
        assert!(out.warnings.is_empty());

        let plot = &snapshot.plots[&claim.compute_txid()];
        assert_eq!(plot.status, PlotStatus::Placed);
        assert_eq!(plot.owner, p2pkh_address(7).to_string());
        assert_eq!(plot.deed_utxo, deed_of(&transfer, 0));
        assert!(snapshot.deed_utxo_set.contains(&deed_of(&transfer, 0)));
        assert!(!snapshot.deed_utxo_set.contains(&deed_of(&claim, 1)));
    }

    #[test]
    fn transfer_without_single_deed_bricks() {
        let mut snapshot = Snapshot::empty();
        let bmp = build_bmp(2, 2, 24);
        let claim = claim_tx(1, 100, 100, &bmp);
        apply(&mut snapshot, &claim);

        // Zero 600-sat outputs: the deed chain breaks.
        let spend = TransactionBuilder::new()
            .with_input(deed_of(&claim, 1))
            .with_output(&p2pkh_address(7), 5000)
            .build();
        let out = apply(&mut snapshot, &spend);
        assert_eq!(out.plots_bricked, 1);

        let plot = &snapshot.plots[&claim.compute_txid()];
        assert_eq!(plot.status, PlotStatus::Bricked);
        assert!(plot.was_placed_before_bricking);
        assert!(plot.owner.is_empty());
        assert!(snapshot.deed_utxo_set.is_empty());

        // Bricked-but-placed space stays reserved.
        let late = claim_tx(2, 101, 101, &bmp);
        apply(&mut snapshot, &late);
        assert_eq!(
            snapshot.plots[&late.compute_txid()].status,
            PlotStatus::Unplaced
        );
    }

    #[test]
    fn retry_claim_rescues_an_unplaced_plot() {
        let mut snapshot = Snapshot::empty();
        let bmp = build_bmp(128, 127, 24);
        let blocker = claim_tx(1, 100, 100, &bmp);
        apply(&mut snapshot, &blocker);
        let claim = claim_tx(2, 120, 120, &bmp);
        apply(&mut snapshot, &claim);
        assert_eq!(
            snapshot.plots[&claim.compute_txid()].status,
            PlotStatus::Unplaced
        );

        let retry = TransactionBuilder::new()
            .with_input(deed_of(&claim, 1))
            .with_op_return(build_retry_payload(2000, 2000))
            .with_output(&p2pkh_address(3), 600)
            .build();
        let out = apply(&mut snapshot, &retry);
        assert_eq!(out.plots_updated, 1);
        assert!(out.warnings.is_empty());

        let plot = &snapshot.plots[&claim.compute_txid()];
        assert_eq!((plot.x0, plot.y0), (2000, 2000));
        assert_eq!(plot.status, PlotStatus::Placed);
        assert_eq!(plot.deed_utxo, deed_of(&retry, 1));
    }

    #[test]
    fn retry_claim_on_a_placed_plot_only_rotates_the_deed() {
        let mut snapshot = Snapshot::empty();
        let bmp = build_bmp(2, 2, 24);
        let claim = claim_tx(1, 100, 100, &bmp);
        apply(&mut snapshot, &claim);

        let retry = TransactionBuilder::new()
            .with_input(deed_of(&claim, 1))
            .with_op_return(build_retry_payload(2000, 2000))
            .with_output(&p2pkh_address(3), 600)
            .build();
        let out = apply(&mut snapshot, &retry);
        assert!(matches!(
            out.warnings.as_slice(),
            [Warning::PlotNotFound { .. }]
        ));

        let plot = &snapshot.plots[&claim.compute_txid()];
        assert_eq!((plot.x0, plot.y0), (100, 100));
        assert_eq!(plot.status, PlotStatus::Placed);
        assert_eq!(plot.deed_utxo, deed_of(&retry, 1));
        assert_eq!(plot.owner, p2pkh_address(3).to_string());
    }

    #[test]
    fn retry_claim_without_a_deed_spend_is_dropped() {
        let mut snapshot = Snapshot::empty();
        let retry = TransactionBuilder::new()
            .with_input(outpoint(9))
            .with_op_return(build_retry_payload(5, 5))
            .with_output(&p2pkh_address(3), 600)
            .build();
        let out = apply(&mut snapshot, &retry);
        assert!(matches!(
            out.warnings.as_slice(),
            [Warning::PlotNotFound { .. }]
        ));
        assert!(snapshot.deed_utxo_set.is_empty());
    }

    #[test]
    fn retry_claim_with_bad_deed_flow_bricks() {
        let mut snapshot = Snapshot::empty();
        let bmp = build_bmp(128, 127, 24);
        let blocker = claim_tx(1, 100, 100, &bmp);
        apply(&mut snapshot, &blocker);
        let claim = claim_tx(2, 120, 120, &bmp);
        apply(&mut snapshot, &claim);

        let retry = TransactionBuilder::new()
            .with_input(deed_of(&claim, 1))
            .with_op_return(build_retry_payload(2000, 2000))
            .build();
        let out = apply(&mut snapshot, &retry);
        assert_eq!(out.plots_bricked, 1);

        let plot = &snapshot.plots[&claim.compute_txid()];
        assert_eq!(plot.status, PlotStatus::Bricked);
        // It was UNPLACED when bricked, so its space is free.
        assert!(!plot.was_placed_before_bricking);
    }

    #[test]
    fn update_replaces_the_image_on_full_match() {
        let mut snapshot = Snapshot::empty();
        let bmp = build_bmp(2, 2, 24);
        let claim = claim_tx(1, 100, 100, &bmp);
        apply(&mut snapshot, &claim);
        let old_hash = snapshot.plots[&claim.compute_txid()].image_hash.clone();

        let mut new_bmp = build_bmp(2, 2, 24);
        let len = new_bmp.len();
        new_bmp[len - 1] = 0xff;
        let update = TransactionBuilder::new()
            .with_input(deed_of(&claim, 1))
            .with_op_return(build_update_payload(100, 100, "ubb://v2", &new_bmp))
            .with_output(&p2pkh_address(4), 600)
            .build();
        let out = apply(&mut snapshot, &update);
        assert_eq!(out.plots_updated, 1);
        assert_eq!(out.images, vec![(claim.compute_txid(), new_bmp)]);

        let plot = &snapshot.plots[&claim.compute_txid()];
        assert_ne!(plot.image_hash, old_hash);
        assert_eq!(plot.uri.as_deref(), Some("ubb://v2"));
        assert_eq!(plot.deed_utxo, deed_of(&update, 1));
    }

    #[test]
    fn update_with_mismatched_geometry_only_rotates() {
        let mut snapshot = Snapshot::empty();
        let bmp = build_bmp(2, 2, 24);
        let claim = claim_tx(1, 100, 100, &bmp);
        apply(&mut snapshot, &claim);
        let old_hash = snapshot.plots[&claim.compute_txid()].image_hash.clone();

        // Wrong coordinates.
        let update = TransactionBuilder::new()
            .with_input(deed_of(&claim, 1))
            .with_op_return(build_update_payload(101, 100, "ubb://v2", &bmp))
            .with_output(&p2pkh_address(4), 600)
            .build();
        let out = apply(&mut snapshot, &update);
        assert!(out.images.is_empty());
        assert_eq!(out.plots_updated, 0);

        // Wrong dimensions.
        let wrong_bmp = build_bmp(3, 3, 24);
        let update2 = TransactionBuilder::new()
            .with_input(deed_of(&update, 1))
            .with_op_return(build_update_payload(100, 100, "ubb://v2", &wrong_bmp))
            .with_output(&p2pkh_address(5), 600)
            .build();
        apply(&mut snapshot, &update2);

        let plot = &snapshot.plots[&claim.compute_txid()];
        assert_eq!(plot.image_hash, old_hash);
        assert_eq!(plot.uri.as_deref(), Some("ubb://plot"));
        assert_eq!(plot.deed_utxo, deed_of(&update2, 1));
    }

    #[test]
    fn update_on_an_unplaced_plot_only_rotates() {
        let mut snapshot = Snapshot::empty();
        let bmp = build_bmp(128, 127, 24);
        let blocker = claim_tx(1, 100, 100, &bmp);
        apply(&mut snapshot, &blocker);
        let claim = claim_tx(2, 120, 120, &bmp);
        apply(&mut snapshot, &claim);

        let update = TransactionBuilder::new()
            .with_input(deed_of(&claim, 1))
            .with_op_return(build_update_payload(120, 120, "ubb://v2", &bmp))
            .with_output(&p2pkh_address(4), 600)
            .build();
        let out = apply(&mut snapshot, &update);
        assert!(matches!(
            out.warnings.as_slice(),
            [Warning::PlotNotFound { .. }]
        ));
        let plot = &snapshot.plots[&claim.compute_txid()];
        assert_eq!(plot.status, PlotStatus::Unplaced);
        assert_eq!(plot.uri.as_deref(), Some("ubb://plot"));
        assert_eq!(plot.deed_utxo, deed_of(&update, 1));
    }

    #[test]
    fn claim_that_spends_a_deed_falls_through_to_deed_flow() {
        let mut snapshot = Snapshot::empty();
        let bmp = build_bmp(2, 2, 24);
        let claim = claim_tx(1, 100, 100, &bmp);
        apply(&mut snapshot, &claim);

        // A CLAIM payload spending the existing deed: no new plot; the deed
        // rotates because there is exactly one 600-sat output.
        let bad_claim = TransactionBuilder::new()
            .with_input(deed_of(&claim, 1))
            .with_op_return(build_claim_payload(500, 500, "", &bmp))
            .with_output(&p2pkh_address(9), 600)
            .build();
        let out = apply(&mut snapshot, &bad_claim);
        assert_eq!(out.plots_created, 0);
        assert_eq!(snapshot.plots.len(), 1);
        assert!(matches!(
            out.warnings.as_slice(),
            [Warning::InvalidDeedFlow { .. }]
        ));

        let plot = &snapshot.plots[&claim.compute_txid()];
        assert_eq!(plot.deed_utxo, deed_of(&bad_claim, 1));
        assert_eq!(plot.owner, p2pkh_address(9).to_string());
    }

    #[test]
    fn malformed_payload_is_transfer_only() {
        let mut snapshot = Snapshot::empty();
        let bmp = build_bmp(2, 2, 24);
        let claim = claim_tx(1, 100, 100, &bmp);
        apply(&mut snapshot, &claim);

        // Magic is right but the version is not: parse fails, the deed still
        // rotates through the single 600-sat output.
        let mut bad = vec![UBB_MAGIC[0], UBB_MAGIC[1], 0x02, 0x01];
        bad.extend_from_slice(&[0u8; 4]);
        let spend = TransactionBuilder::new()
            .with_input(deed_of(&claim, 1))
            .with_op_return(bad)
            .with_output(&p2pkh_address(6), 600)
            .build();
        let out = apply(&mut snapshot, &spend);
        assert!(matches!(
            out.warnings.as_slice(),
            [Warning::ParsePayload { .. }]
        ));
        let plot = &snapshot.plots[&claim.compute_txid()];
        assert_eq!(plot.status, PlotStatus::Placed);
        assert_eq!(plot.deed_utxo, deed_of(&spend, 1));
    }

    #[test]
    fn multiple_ubb_op_returns_demote_to_deed_flow() {
        let mut snapshot = Snapshot::empty();
        let bmp = build_bmp(2, 2, 24);
        let claim = claim_tx(1, 100, 100, &bmp);
        apply(&mut snapshot, &claim);

        let payload = build_claim_payload(500, 500, "", &bmp);
        let spend = TransactionBuilder::new()
            .with_input(deed_of(&claim, 1))
            .with_op_return(payload.clone())
            .with_op_return(payload)
            .with_output(&p2pkh_address(6), 600)
            .build();
        let out = apply(&mut snapshot, &spend);
        assert_eq!(out.plots_created, 0);
        assert_eq!(snapshot.plots.len(), 1);
        assert_eq!(
            snapshot.plots[&claim.compute_txid()].deed_utxo,
            deed_of(&spend, 2)
        );
    }

    #[test]
    fn transfer_payload_behaves_like_a_bare_spend() {
        let mut snapshot = Snapshot::empty();
        let bmp = build_bmp(2, 2, 24);
        let claim = claim_tx(1, 100, 100, &bmp);
        apply(&mut snapshot, &claim);

        let transfer = TransactionBuilder::new()
            .with_input(deed_of(&claim, 1))
            .with_op_return(crate::test_utils::build_transfer_payload())
            .with_output(&p2pkh_address(8), 600)
            .build();
        let out = apply(&mut snapshot, &transfer);
        assert!(out.warnings.is_empty());

        let plot = &snapshot.plots[&claim.compute_txid()];
        assert_eq!(plot.status, PlotStatus::Placed);
        assert_eq!(plot.owner, p2pkh_address(8).to_string());
        assert_eq!(plot.deed_utxo, deed_of(&transfer, 1));
    }

    #[test]
    fn unknown_payload_type_is_transfer_only() {
        let mut snapshot = Snapshot::empty();
        let bmp = build_bmp(2, 2, 24);
        let claim = claim_tx(1, 100, 100, &bmp);
        apply(&mut snapshot, &claim);

        let mut bad = vec![UBB_MAGIC[0], UBB_MAGIC[1], PROTOCOL_VERSION, 0x09];
        bad.extend_from_slice(&[0u8; 4]);
        let spend = TransactionBuilder::new()
            .with_input(deed_of(&claim, 1))
            .with_op_return(bad)
            .with_output(&p2pkh_address(6), 600)
            .build();
        let out = apply(&mut snapshot, &spend);
        assert!(matches!(
            out.warnings.as_slice(),
            [Warning::ParsePayload { .. }]
        ));
        assert_eq!(
            snapshot.plots[&claim.compute_txid()].deed_utxo,
            deed_of(&spend, 1)
        );
    }

    #[test]
    #[should_panic(expected = "is live but no plot references it")]
    fn spending_an_orphaned_deed_panics() {
        let mut snapshot = Snapshot::empty();
        // A deed with no owning plot is state corruption, not a protocol
        // violation.
        snapshot.deed_utxo_set.insert(outpoint(1));
        let tx = TransactionBuilder::new()
            .with_input(outpoint(1))
            .with_output(&p2pkh_address(2), 600)
            .build();
        let mut out = BlockOutcome::default();
        apply_transaction(&mut snapshot, &tx, Network::Regtest, 0, &mut out);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        // Random histories of claims, transfers, bad spends and retries must
        // never violate the global invariants, and PLACED plots must never
        // overlap.
        #[test]
        fn invariants_hold_over_random_histories(
            ops in prop::collection::vec(
                (0u16..400, 0u16..400, 1u16..80, 1u16..80, 0u8..8),
                1..40,
            )
        ) {
            let mut snapshot = Snapshot::empty();
            let mut seed = 0u8;
            for (x0, y0, w, h, action) in ops {
                seed = seed.wrapping_add(1);
                let tx = match action {
                    // Claims dominate so histories grow.
                    0..=4 => TransactionBuilder::new()
                        .with_input(outpoint(seed))
                        .with_op_return(build_claim_payload(x0, y0, "", &build_bmp(i32::from(w), i32::from(h), 24)))
                        .with_output(&p2pkh_address(seed), 600)
                        .build(),
                    other => {
                        let deed = match snapshot
                            .deed_utxo_set
                            .iter()
                            .nth(usize::from(seed) % snapshot.deed_utxo_set.len().max(1))
                        {
                            Some(deed) => *deed,
                            None => continue,
                        };
                        match other {
                            5 => TransactionBuilder::new()
                                .with_input(deed)
                                .with_output(&p2pkh_address(seed), 600)
                                .build(),
                            6 => TransactionBuilder::new()
                                .with_input(deed)
                                .with_output(&p2pkh_address(seed), 5000)
                                .build(),
                            _ => TransactionBuilder::new()
                                .with_input(deed)
                                .with_op_return(build_retry_payload(x0, y0))
                                .with_output(&p2pkh_address(seed), 600)
                                .build(),
                        }
                    }
                };
                let mut out = BlockOutcome::default();
                apply_transaction(&mut snapshot, &tx, Network::Regtest, 0, &mut out);
                prop_assert_eq!(snapshot.check_invariants(), Ok(()));
            }
        }
    }
}
