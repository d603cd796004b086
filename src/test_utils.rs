//! Utilities for constructing test chains and protocol payloads.

use crate::payload::{PROTOCOL_VERSION, UBB_MAGIC};
use crate::rpc::{BlockSource, SourceError};
use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::block::{Header, Version};
use bitcoin::consensus::encode::serialize;
use bitcoin::hashes::{hash160, Hash};
use bitcoin::script::PushBytesBuf;
use bitcoin::{
    Address, Amount, Block, BlockHash, Network, OutPoint, PubkeyHash, ScriptBuf, Sequence,
    Target, Transaction, TxIn, TxMerkleNode, TxOut, Txid, Witness,
};
use std::collections::BTreeMap;

/// A deterministic P2PKH address derived from a one-byte seed.
pub fn p2pkh_address(seed: u8) -> Address {
    let hash = hash160::Hash::from_byte_array([seed; 20]);
    Address::p2pkh(PubkeyHash::from_raw_hash(hash), Network::Regtest)
}

/// A deterministic txid derived from a one-byte seed.
pub fn txid(seed: u8) -> Txid {
    Txid::from_byte_array([seed; 32])
}

/// A deterministic outpoint derived from a one-byte seed.
pub fn outpoint(seed: u8) -> OutPoint {
    OutPoint::new(txid(seed), 0)
}

fn coinbase_input() -> TxIn {
    TxIn {
        previous_output: OutPoint::null(),
        script_sig: ScriptBuf::new(),
        sequence: Sequence(0xffffffff),
        witness: Witness::new(),
    }
}

pub struct TransactionBuilder {
    input: Vec<TxIn>,
    output: Vec<TxOut>,
    lock_time: u32,
}

impl TransactionBuilder {
    pub fn new() -> Self {
        Self {
            input: vec![],
            output: vec![],
            lock_time: 0,
        }
    }

    pub fn coinbase() -> Self {
        Self {
            input: vec![coinbase_input()],
            output: vec![],
            lock_time: 0,
        }
    }

    pub fn with_input(mut self, previous_output: OutPoint) -> Self {
        if self.input == vec![coinbase_input()] {
            panic!("A call `with_input` should not be possible if `coinbase` was called");
        }
        self.input.push(TxIn {
            previous_output,
            script_sig: ScriptBuf::new(),
            sequence: Sequence(0xffffffff),
            witness: Witness::new(),
        });
        self
    }

    pub fn with_output(mut self, address: &Address, satoshi: u64) -> Self {
        self.output.push(TxOut {
            value: Amount::from_sat(satoshi),
            script_pubkey: address.script_pubkey(),
        });
        self
    }

    /// A zero-value OP_RETURN output pushing `data`.
    pub fn with_op_return(self, data: Vec<u8>) -> Self {
        self.with_op_return_value(data, 0)
    }

    pub fn with_op_return_value(mut self, data: Vec<u8>, satoshi: u64) -> Self {
        let push = PushBytesBuf::try_from(data).expect("payload fits a push");
        self.output.push(TxOut {
            value: Amount::from_sat(satoshi),
            script_pubkey: ScriptBuf::new_op_return(push),
        });
        self
    }

    pub fn with_lock_time(mut self, time: u32) -> Self {
        self.lock_time = time;
        self
    }

    pub fn build(self) -> Transaction {
        let input = if self.input.is_empty() {
            // Default to coinbase if no inputs provided.
            vec![coinbase_input()]
        } else {
            self.input
        };
        let output = if self.output.is_empty() {
            // Use default of 50 BTC.
            vec![TxOut {
                value: Amount::from_sat(50_0000_0000),
                script_pubkey: p2pkh_address(0).script_pubkey(),
            }]
        } else {
            self.output
        };

        Transaction {
            version: bitcoin::transaction::Version(1),
            lock_time: LockTime::from_consensus(self.lock_time),
            input,
            output,
        }
    }
}

impl Default for TransactionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct BlockBuilder {
    prev_header: Option<Header>,
    transactions: Vec<Transaction>,
}

impl BlockBuilder {
    pub fn genesis() -> Self {
        Self {
            prev_header: None,
            transactions: vec![],
        }
    }

    pub fn with_prev_header(prev_header: Header) -> Self {
        Self {
            prev_header: Some(prev_header),
            transactions: vec![],
        }
    }

    pub fn with_transaction(mut self, transaction: Transaction) -> Self {
        self.transactions.push(transaction);
        self
    }

    pub fn build(self) -> Block {
        let txdata = if self.transactions.is_empty() {
            // A block must carry at least one transaction.
            vec![TransactionBuilder::coinbase().build()]
        } else {
            self.transactions
        };

        let merkle_root = bitcoin::merkle_tree::calculate_root(
            txdata.iter().map(|tx| *tx.compute_txid().as_raw_hash()),
        )
        .unwrap();
        let merkle_root = TxMerkleNode::from_raw_hash(merkle_root);

        let header = match self.prev_header {
            None => genesis_header(merkle_root),
            Some(prev_header) => next_header(&prev_header, merkle_root),
        };

        Block { header, txdata }
    }
}

fn genesis_header(merkle_root: TxMerkleNode) -> Header {
    let target = Target::MAX_ATTAINABLE_REGTEST;
    let mut header = Header {
        version: Version::from_consensus(1),
        prev_blockhash: BlockHash::all_zeros(),
        merkle_root,
        time: 1_600_000_000,
        bits: target.to_compact_lossy(),
        nonce: 0,
    };
    solve(&mut header);
    header
}

fn next_header(prev_header: &Header, merkle_root: TxMerkleNode) -> Header {
    let mut header = Header {
        version: Version::from_consensus(1),
        prev_blockhash: prev_header.block_hash(),
        merkle_root,
        time: prev_header.time + 60 * 10, // 10 minutes.
        bits: prev_header.target().to_compact_lossy(),
        nonce: 0,
    };
    solve(&mut header);
    header
}

fn solve(header: &mut Header) {
    let target = header.target();
    while header.validate_pow(target).is_err() {
        header.nonce += 1;
    }
}

/// Encodes a definite-length CBOR text string, picking the shortest length
/// form.
pub fn cbor_text_string(text: &str) -> Vec<u8> {
    let bytes = text.as_bytes();
    let mut encoded = Vec::with_capacity(bytes.len() + 5);
    match bytes.len() {
        len @ 0..=23 => encoded.push(0x60 | len as u8),
        len @ 24..=255 => {
            encoded.push(0x78);
            encoded.push(len as u8);
        }
        len @ 256..=65535 => {
            encoded.push(0x79);
            encoded.extend_from_slice(&(len as u16).to_be_bytes());
        }
        len => {
            encoded.push(0x7a);
            encoded.extend_from_slice(&(len as u32).to_be_bytes());
        }
    }
    encoded.extend_from_slice(bytes);
    encoded
}

fn payload_header(ty: u8, x0: u16, y0: u16) -> Vec<u8> {
    let mut bytes = vec![UBB_MAGIC[0], UBB_MAGIC[1], PROTOCOL_VERSION, ty];
    bytes.extend_from_slice(&x0.to_le_bytes());
    bytes.extend_from_slice(&y0.to_le_bytes());
    bytes
}

pub fn build_claim_payload(x0: u16, y0: u16, uri: &str, bmp: &[u8]) -> Vec<u8> {
    let mut bytes = payload_header(0x01, x0, y0);
    bytes.extend_from_slice(&cbor_text_string(uri));
    bytes.extend_from_slice(bmp);
    bytes
}

pub fn build_retry_payload(x0: u16, y0: u16) -> Vec<u8> {
    payload_header(0x02, x0, y0)
}

pub fn build_update_payload(x0: u16, y0: u16, uri: &str, bmp: &[u8]) -> Vec<u8> {
    let mut bytes = payload_header(0x03, x0, y0);
    bytes.extend_from_slice(&cbor_text_string(uri));
    bytes.extend_from_slice(bmp);
    bytes
}

pub fn build_transfer_payload() -> Vec<u8> {
    payload_header(0x04, 0, 0)
}

/// A valid uncompressed BMP of the given dimensions; a negative height marks
/// a top-down file.
pub fn build_bmp(width: i32, height: i32, bits_per_pixel: u16) -> Vec<u8> {
    let stride = ((width.unsigned_abs() as u64 * u64::from(bits_per_pixel / 8)).div_ceil(4)) * 4;
    let size = 54 + stride * u64::from(height.unsigned_abs());

    let mut bmp = vec![0u8; size as usize];
    bmp[0] = b'B';
    bmp[1] = b'M';
    bmp[2..6].copy_from_slice(&(size as u32).to_le_bytes());
    bmp[10..14].copy_from_slice(&54u32.to_le_bytes());
    bmp[14..18].copy_from_slice(&40u32.to_le_bytes());
    bmp[18..22].copy_from_slice(&width.to_le_bytes());
    bmp[22..26].copy_from_slice(&height.to_le_bytes());
    bmp[26..28].copy_from_slice(&1u16.to_le_bytes());
    bmp[28..30].copy_from_slice(&bits_per_pixel.to_le_bytes());
    // compression (bytes 30..34) stays 0 (BI_RGB)
    for (i, byte) in bmp[54..].iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }
    bmp
}

/// An in-memory chain serving the [`BlockSource`] trait for engine tests.
pub struct FakeBlockSource {
    chain: String,
    blocks: BTreeMap<BlockHash, (u32, Vec<u8>)>,
    tip: BlockHash,
}

impl FakeBlockSource {
    /// Serves `blocks` as one chain, heights assigned in order.
    pub fn new(chain: &str, blocks: &[Block]) -> Self {
        let tip = blocks.last().expect("at least one block").block_hash();
        let blocks = blocks
            .iter()
            .enumerate()
            .map(|(height, block)| (block.block_hash(), (height as u32, serialize(block))))
            .collect();
        Self {
            chain: chain.to_string(),
            blocks,
            tip,
        }
    }
}

#[async_trait]
impl BlockSource for FakeBlockSource {
    async fn chain_name(&self) -> Result<String, SourceError> {
        Ok(self.chain.clone())
    }

    async fn get_tip(&self) -> Result<BlockHash, SourceError> {
        Ok(self.tip)
    }

    async fn get_hash_at_height(&self, height: u32) -> Result<BlockHash, SourceError> {
        self.blocks
            .iter()
            .find(|(_, (h, _))| *h == height)
            .map(|(hash, _)| *hash)
            .ok_or_else(|| SourceError::BadResponse(format!("no block at height {}", height)))
    }

    async fn get_height_of(&self, hash: &BlockHash) -> Result<u32, SourceError> {
        self.blocks
            .get(hash)
            .map(|(height, _)| *height)
            .ok_or_else(|| SourceError::BadResponse(format!("unknown block {}", hash)))
    }

    async fn get_block_bytes(&self, hash: &BlockHash) -> Result<Vec<u8>, SourceError> {
        self.blocks
            .get(hash)
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| SourceError::BadResponse(format!("unknown block {}", hash)))
    }
}
