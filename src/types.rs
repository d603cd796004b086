//! Types shared across the indexer.

use crate::rpc::SourceError;
use bitcoin::{Block, BlockHash, Network as BitcoinNetwork, Txid};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::str::FromStr;
use thiserror::Error;

/// The Bitcoin network a node and a data directory belong to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Network {
    #[serde(rename = "mainnet")]
    Mainnet,
    #[serde(rename = "testnet")]
    Testnet,
    #[serde(rename = "regtest")]
    Regtest,
}

impl Network {
    /// The directory name this network's data lives under.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }

    /// Whether the chain name reported by `getblockchaininfo` belongs to this
    /// network. Mainnet only matches "main"; testnet accepts the whole test
    /// family so a node on testnet4 or signet is not rejected.
    pub fn matches_chain(&self, chain: &str) -> bool {
        match self {
            Network::Mainnet => chain == "main",
            Network::Testnet => matches!(chain, "test" | "testnet4" | "signet"),
            Network::Regtest => chain == "regtest",
        }
    }
}

impl From<Network> for BitcoinNetwork {
    fn from(network: Network) -> Self {
        match network {
            Network::Mainnet => BitcoinNetwork::Bitcoin,
            Network::Testnet => BitcoinNetwork::Testnet,
            Network::Regtest => BitcoinNetwork::Regtest,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" => Ok(Network::Mainnet),
            "testnet" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            other => Err(format!(
                "unknown network '{}' (expected mainnet, testnet or regtest)",
                other
            )),
        }
    }
}

/// The block header fields a snapshot is stamped with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    pub hash: BlockHash,
    pub parent: BlockHash,
    pub height: u32,
    pub timestamp: u32,
    pub tx_count: u32,
}

impl BlockInfo {
    pub fn from_block(block: &Block, height: u32) -> Self {
        Self {
            hash: block.block_hash(),
            parent: block.header.prev_blockhash,
            height,
            timestamp: block.header.time,
            tx_count: block.txdata.len() as u32,
        }
    }
}

/// A protocol-level anomaly observed while applying a transaction.
///
/// Warnings are recorded on the run summary and logged, but never fail a run;
/// only infrastructural errors do.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    /// The first OP_RETURN carried the UBB magic but did not parse.
    ParsePayload { txid: Txid, reason: String },
    /// A CLAIM or UPDATE carried a BMP that fails the protocol's rules.
    InvalidBmp { txid: Txid, reason: String },
    /// A deed spend or claim with the wrong count of 600-satoshi outputs.
    InvalidDeedFlow { txid: Txid, reason: String },
    /// A RETRY-CLAIM or UPDATE whose target plot is absent or in the wrong
    /// status.
    PlotNotFound { txid: Txid, reason: String },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::ParsePayload { txid, reason } => {
                write!(f, "tx {}: unparseable payload: {}", txid, reason)
            }
            Warning::InvalidBmp { txid, reason } => {
                write!(f, "tx {}: invalid BMP: {}", txid, reason)
            }
            Warning::InvalidDeedFlow { txid, reason } => {
                write!(f, "tx {}: invalid deed flow: {}", txid, reason)
            }
            Warning::PlotNotFound { txid, reason } => {
                write!(f, "tx {}: {}", txid, reason)
            }
        }
    }
}

/// The outcome of an indexing run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub success: bool,
    pub blocks_processed: u64,
    pub transactions_processed: u64,
    pub plots_created: u64,
    pub plots_updated: u64,
    pub plots_bricked: u64,
    pub warnings: Vec<Warning>,
}

/// A fatal indexing error. Protocol violations never show up here; they are
/// demoted to [`Warning`]s.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("block source error: {0}")]
    Transport(#[from] SourceError),

    #[error("node is on chain '{actual}' but the indexer is configured for {configured}")]
    NetworkMismatch { configured: Network, actual: String },

    #[error("block cache I/O error: {0}")]
    CacheIo(#[source] io::Error),

    #[error("state store I/O error: {0}")]
    StoreIo(#[source] io::Error),

    #[error("genesis block {0} is not an ancestor of the requested tip")]
    GenesisUnreachable(BlockHash),

    #[error("failed to parse block {hash}: {reason}")]
    BlockParse { hash: BlockHash, reason: String },
}

/// Serde adapter storing a [`bitcoin::OutPoint`] as its `txid:vout` display
/// form.
pub mod outpoint_string {
    use bitcoin::OutPoint;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(outpoint: &OutPoint, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(outpoint)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<OutPoint, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Serde adapter storing a deed-outpoint set as a sorted list of `txid:vout`
/// strings.
pub mod outpoint_set {
    use bitcoin::OutPoint;
    use serde::{de, ser::SerializeSeq, Deserialize, Deserializer, Serializer};
    use std::collections::BTreeSet;

    pub fn serialize<S: Serializer>(
        set: &BTreeSet<OutPoint>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(set.len()))?;
        for outpoint in set {
            seq.serialize_element(&outpoint.to_string())?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeSet<OutPoint>, D::Error> {
        let strings = Vec::<String>::deserialize(deserializer)?;
        strings
            .into_iter()
            .map(|s| s.parse().map_err(de::Error::custom))
            .collect()
    }
}
