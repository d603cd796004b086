//! Classification of Bitcoin transactions against the billboard protocol.
//!
//! A transaction is relevant iff its first OP_RETURN carries the UBB magic or
//! one of its inputs spends a live deed outpoint. Everything else is skipped
//! without further inspection.

use crate::payload::UBB_MAGIC;
use crate::types::Network;
use crate::DEED_VALUE;
use bitcoin::script::Instruction;
use bitcoin::{Address, OutPoint, Script, Transaction};
use std::collections::BTreeSet;
use std::str::FromStr;

/// Owner string used when a deed output's script has no address form.
pub const UNKNOWN_OWNER: &str = "unknown";

/// A 600-satoshi output of the transaction under classification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeedOutput {
    pub outpoint: OutPoint,
    pub address: String,
}

/// What the classifier extracted from a transaction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxClass {
    /// Bytes pushed by the first OP_RETURN, kept only when they carry the UBB
    /// magic.
    pub first_payload: Option<Vec<u8>>,
    /// Number of OP_RETURN outputs carrying the UBB magic. Two or more demote
    /// the transaction to pure deed flow.
    pub ubb_op_returns: usize,
    /// All non-OP_RETURN outputs of exactly 600 satoshis, in output order.
    pub deed_outputs: Vec<DeedOutput>,
    /// The first input spending a live deed, if any.
    pub spent_deed: Option<OutPoint>,
}

impl TxClass {
    pub fn is_relevant(&self) -> bool {
        self.first_payload.is_some() || self.spent_deed.is_some()
    }

    pub fn single_deed(&self) -> bool {
        self.deed_outputs.len() == 1
    }
}

/// Classifies `tx` against the current deed set.
pub fn classify(tx: &Transaction, deed_set: &BTreeSet<OutPoint>, network: Network) -> TxClass {
    let txid = tx.compute_txid();

    let mut class = TxClass::default();
    let mut saw_op_return = false;
    for (vout, output) in tx.output.iter().enumerate() {
        if output.script_pubkey.is_op_return() {
            let data = op_return_data(&output.script_pubkey);
            let is_ubb = matches!(&data, Some(d) if d.starts_with(&UBB_MAGIC));
            if is_ubb {
                class.ubb_op_returns += 1;
            }
            if !saw_op_return {
                saw_op_return = true;
                if is_ubb {
                    class.first_payload = data;
                }
            }
        } else if output.value.to_sat() == DEED_VALUE {
            class.deed_outputs.push(DeedOutput {
                outpoint: OutPoint::new(txid, vout as u32),
                address: address_of(&output.script_pubkey, network),
            });
        }
    }

    class.spent_deed = tx
        .input
        .iter()
        .map(|input| input.previous_output)
        .find(|outpoint| deed_set.contains(outpoint));

    class
}

/// The bytes of the first data push following the OP_RETURN opcode, if any.
fn op_return_data(script: &Script) -> Option<Vec<u8>> {
    let mut instructions = script.instructions();
    match instructions.next() {
        Some(Ok(Instruction::Op(op))) if op == bitcoin::opcodes::all::OP_RETURN => {}
        _ => return None,
    }
    for instruction in instructions {
        if let Ok(Instruction::PushBytes(data)) = instruction {
            return Some(data.as_bytes().to_vec());
        }
    }
    None
}

// Derives the owner string for a deed output's script.
fn address_of(script: &Script, network: Network) -> String {
    match Address::from_script(script, bitcoin::Network::from(network)) {
        Ok(address) => {
            let address = address.to_string();
            // In some rare cases `Address::from_script` succeeds on scripts
            // that don't round-trip as addresses.
            // See https://github.com/rust-bitcoin/rust-bitcoin/issues/995.
            if Address::from_str(&address).is_ok() {
                address
            } else {
                UNKNOWN_OWNER.to_string()
            }
        }
        Err(_) => UNKNOWN_OWNER.to_string(),
    }
}
