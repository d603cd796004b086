//! The block source seam and its JSON-RPC implementation.
//!
//! The engine only ever needs four node calls (the best block hash, the hash
//! at a height, the height of a hash, and raw block bytes) plus the chain
//! name for the network sanity check. They map onto `getbestblockhash`,
//! `getblockhash`, `getblock(hash, 1)` and `getblock(hash, 0)` over plain
//! JSON-RPC POSTs.

use async_trait::async_trait;
use base64::Engine;
use bitcoin::BlockHash;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

// Per-call timeout; slow calls surface as transport errors and go through the
// engine's retry policy.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors raised by a block source. All of them are transport-level; the
/// engine retries them with bounded backoff.
#[derive(Debug, Error)]
pub enum SourceError {
    /// HTTP failure, with the status code when one was received (0 for
    /// connection-level errors).
    #[error("HTTP error (status {0}): {1}")]
    Http(u16, #[source] reqwest::Error),

    /// The JSON-RPC response carried an error object.
    #[error("RPC error: {0}")]
    Rpc(Value),

    /// The response was not the shape the call promises.
    #[error("malformed response: {0}")]
    BadResponse(String),
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        let status = err.status().map(|s| s.as_u16()).unwrap_or(0);
        SourceError::Http(status, err)
    }
}

/// Where blocks come from. The indexer engine is generic over this so tests
/// drive it from an in-memory chain.
#[async_trait]
pub trait BlockSource {
    /// The chain name the node reports (`main`, `test`, `testnet4`,
    /// `regtest`, `signet`).
    async fn chain_name(&self) -> Result<String, SourceError>;

    async fn get_tip(&self) -> Result<BlockHash, SourceError>;

    async fn get_hash_at_height(&self, height: u32) -> Result<BlockHash, SourceError>;

    async fn get_height_of(&self, hash: &BlockHash) -> Result<u32, SourceError>;

    /// The raw consensus-encoded block bytes.
    async fn get_block_bytes(&self, hash: &BlockHash) -> Result<Vec<u8>, SourceError>;
}

/// A JSON-RPC client for a Bitcoin Core style node.
#[derive(Clone)]
pub struct BitcoinRpc {
    client: Client,
    url: String,
}

impl std::fmt::Debug for BitcoinRpc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitcoinRpc").field("url", &self.url).finish()
    }
}

impl BitcoinRpc {
    pub fn new<U: Into<String>>(url: U) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("client construction cannot fail with static options");
        Self {
            client,
            url: url.into(),
        }
    }

    /// A client sending HTTP basic authentication on every request.
    pub fn new_with_auth<U: Into<String>>(url: U, user: &str, pass: &str) -> Self {
        let mut headers = HeaderMap::new();
        let auth = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, pass));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {}", auth))
                .expect("base64 is always a valid header value"),
        );
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .default_headers(headers)
            .build()
            .expect("client construction cannot fail with static options");
        Self {
            client,
            url: url.into(),
        }
    }

    /// Sends one JSON-RPC request and returns the raw `result` field.
    async fn send_request(&self, method: &str, params: Vec<Value>) -> Result<Value, SourceError> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1,
        });

        let response: Value = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        if let Some(err) = response.get("error").filter(|e| !e.is_null()) {
            return Err(SourceError::Rpc(err.clone()));
        }
        match response.get("result") {
            Some(result) if !result.is_null() => Ok(result.clone()),
            _ => Err(SourceError::BadResponse(format!(
                "{} response has no result field",
                method
            ))),
        }
    }

    fn parse_hash(method: &str, result: Value) -> Result<BlockHash, SourceError> {
        result
            .as_str()
            .ok_or_else(|| SourceError::BadResponse(format!("{} result is not a string", method)))?
            .parse()
            .map_err(|err| SourceError::BadResponse(format!("{}: {}", method, err)))
    }
}

#[async_trait]
impl BlockSource for BitcoinRpc {
    async fn chain_name(&self) -> Result<String, SourceError> {
        let info = self.send_request("getblockchaininfo", vec![]).await?;
        info.get("chain")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                SourceError::BadResponse("getblockchaininfo result has no chain field".to_string())
            })
    }

    async fn get_tip(&self) -> Result<BlockHash, SourceError> {
        let result = self.send_request("getbestblockhash", vec![]).await?;
        Self::parse_hash("getbestblockhash", result)
    }

    async fn get_hash_at_height(&self, height: u32) -> Result<BlockHash, SourceError> {
        let result = self
            .send_request("getblockhash", vec![json!(height)])
            .await?;
        Self::parse_hash("getblockhash", result)
    }

    async fn get_height_of(&self, hash: &BlockHash) -> Result<u32, SourceError> {
        let result = self
            .send_request("getblock", vec![json!(hash.to_string()), json!(1)])
            .await?;
        result
            .get("height")
            .and_then(Value::as_u64)
            .map(|height| height as u32)
            .ok_or_else(|| {
                SourceError::BadResponse("getblock result has no height field".to_string())
            })
    }

    async fn get_block_bytes(&self, hash: &BlockHash) -> Result<Vec<u8>, SourceError> {
        let result = self
            .send_request("getblock", vec![json!(hash.to_string()), json!(0)])
            .await?;
        let hex_str = result.as_str().ok_or_else(|| {
            SourceError::BadResponse("getblock verbosity 0 result is not a string".to_string())
        })?;
        hex::decode(hex_str)
            .map_err(|err| SourceError::BadResponse(format!("getblock returned bad hex: {}", err)))
    }
}
