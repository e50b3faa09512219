//! EVM JSON-RPC chain client and the polling live subscription.
//!
//! ## Resilience
//!
//! * Transport errors, HTTP 429 and soft JSON-RPC errors are retried with
//!   exponential back-off, at most [`MAX_ATTEMPTS`] times per call.
//! * Hard JSON-RPC errors (malformed request, unknown method, revert) fail at once.
//! * A failed poll leaves the subscription registered; the same block range is
//!   retried on the next tick.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use alloy::primitives::U256;
use alloy::sol_types::SolCall;

use crate::abi::{self, to_ether};
use crate::errors::{IndexerError, Result};
use crate::events::EventKind;

const MAX_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF_MS: u64 = 500;
const MAX_BACKOFF_MS: u64 = 8_000;

/// Largest block span requested from `eth_getLogs` in one live poll.
pub const MAX_BLOCK_RANGE: u64 = 2_000;

/// Floor for the live poll period; `tokio::time::interval` rejects zero.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// JSON-RPC error codes that retrying cannot fix.
const HARD_ERROR_CODES: [i64; 4] = [-32600, -32601, -32602, 3];

// ─────────────────────────────────────────────────────────
// JSON-RPC response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RpcResponse<T> {
    pub result: Option<T>,
    pub error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

/// A log entry exactly as returned by `eth_getLogs`.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[allow(dead_code)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
    pub address: Option<String>,
    pub topics: Vec<String>,
    pub data: String,
    pub block_number: Option<String>,
    pub transaction_hash: Option<String>,
    pub log_index: Option<String>,
    #[serde(default)]
    pub removed: bool,
}

impl RawLog {
    pub fn block(&self) -> u64 {
        self.block_number
            .as_deref()
            .and_then(|b| parse_quantity(b).ok())
            .unwrap_or(0)
    }

    pub fn index(&self) -> u64 {
        self.log_index
            .as_deref()
            .and_then(|i| parse_quantity(i).ok())
            .unwrap_or(0)
    }
}

/// Order logs as the chain emitted them: by block, then by position in block.
pub fn sort_logs(logs: &mut [RawLog]) {
    logs.sort_by_key(|log| (log.block(), log.index()));
}

pub fn parse_quantity(raw: &str) -> Result<u64> {
    u64::from_str_radix(raw.trim_start_matches("0x"), 16)
        .map_err(|_| IndexerError::malformed(format!("invalid hex quantity {raw:?}")))
}

fn to_quantity(value: u64) -> String {
    format!("{value:#x}")
}

// ─────────────────────────────────────────────────────────
// Chain client
// ─────────────────────────────────────────────────────────

/// Everything the mirror needs from the chain.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Current head block height.
    async fn block_number(&self) -> Result<u64>;

    /// Logs of one event kind in `[from_block, to_block]`, as returned by the node.
    async fn query_logs(&self, kind: EventKind, from_block: u64, to_block: u64)
        -> Result<Vec<RawLog>>;

    /// Read-only contract call against the state at `block`.
    async fn call(&self, calldata: Vec<u8>, block: u64) -> Result<Vec<u8>>;
}

pub struct RpcChainClient {
    client: Client,
    rpc_url: String,
    contract_address: String,
}

impl RpcChainClient {
    pub fn new(client: Client, rpc_url: &str, contract_address: &str) -> Self {
        Self {
            client,
            rpc_url: rpc_url.to_string(),
            contract_address: contract_address.to_lowercase(),
        }
    }

    async fn request<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let mut backoff = INITIAL_BACKOFF_MS;
        let mut attempt = 1;

        loop {
            match self.send_once(method, &params).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < MAX_ATTEMPTS && is_retryable(&e) => {
                    warn!("{method} failed (attempt {attempt}/{MAX_ATTEMPTS}, retry in {backoff}ms): {e}");
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF_MS);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once<T: DeserializeOwned>(&self, method: &str, params: &Value) -> Result<T> {
        let resp = self
            .client
            .post(&self.rpc_url)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": method,
                "params": params,
            }))
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(IndexerError::Rpc {
                code: 429,
                message: "rate limited".to_string(),
            });
        }

        let body: RpcResponse<T> = resp.error_for_status()?.json().await?;

        if let Some(err) = body.error {
            return Err(IndexerError::Rpc {
                code: err.code,
                message: err.message,
            });
        }

        body.result
            .ok_or_else(|| IndexerError::malformed(format!("empty result from {method}")))
    }
}

fn is_retryable(err: &IndexerError) -> bool {
    match err {
        IndexerError::Http(_) => true,
        IndexerError::Rpc { code, .. } => !HARD_ERROR_CODES.contains(code),
        _ => false,
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn block_number(&self) -> Result<u64> {
        let raw: String = self.request("eth_blockNumber", json!([])).await?;
        parse_quantity(&raw)
    }

    async fn query_logs(
        &self,
        kind: EventKind,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawLog>> {
        let filter = json!({
            "address": self.contract_address,
            "fromBlock": to_quantity(from_block),
            "toBlock": to_quantity(to_block),
            "topics": [abi::word_hex(kind.topic())],
        });
        let logs: Vec<RawLog> = self.request("eth_getLogs", json!([filter])).await?;
        debug!(
            "Fetched {} {} logs in [{from_block}, {to_block}]",
            logs.len(),
            kind.as_str()
        );
        Ok(logs)
    }

    async fn call(&self, calldata: Vec<u8>, block: u64) -> Result<Vec<u8>> {
        let tx = json!({
            "to": self.contract_address,
            "data": format!("0x{}", hex::encode(calldata)),
        });
        let raw: String = self
            .request("eth_call", json!([tx, to_quantity(block)]))
            .await?;
        hex::decode(raw.trim_start_matches("0x"))
            .map_err(|e| IndexerError::malformed(format!("invalid eth_call result: {e}")))
    }
}

// ─────────────────────────────────────────────────────────
// Contract reads
// ─────────────────────────────────────────────────────────

/// Chain-authoritative campaign figures from the `campaigns(uint256)` accessor,
/// read at `block`.
#[derive(Debug, Clone, PartialEq)]
pub struct CampaignChainState {
    pub block: u64,
    pub target: f64,
    pub deadline: u64,
    pub amount_collected: f64,
    pub withdrawn: bool,
    pub verified: bool,
}

/// Read the campaign at the current head, so the result can be ordered
/// against logs.
pub async fn read_campaign_state(
    chain: &dyn ChainClient,
    campaign_chain_id: &str,
) -> Result<CampaignChainState> {
    let id = U256::from_str_radix(campaign_chain_id.trim(), 10).map_err(|_| {
        IndexerError::InvalidInput(format!("campaign id {campaign_chain_id:?} is not an integer"))
    })?;

    let block = chain.block_number().await?;
    let calldata = abi::campaignsCall { id }.abi_encode();
    let output = chain.call(calldata, block).await?;

    let campaign = abi::campaignsCall::abi_decode_returns(&output, true)
        .map_err(|e| IndexerError::malformed(format!("campaigns({id}) returned {e}")))?;
    Ok(CampaignChainState {
        block,
        target: to_ether(campaign.target)?,
        deadline: u64::try_from(campaign.deadline).unwrap_or(u64::MAX),
        amount_collected: to_ether(campaign.amountCollected)?,
        withdrawn: campaign.withdrawn,
        verified: campaign.verified,
    })
}

// ─────────────────────────────────────────────────────────
// Live subscription
// ─────────────────────────────────────────────────────────

/// Logs for every tracked kind in one contiguous block range, in chain order.
#[derive(Debug, Clone)]
pub struct LogBatch {
    pub from_block: u64,
    pub to_block: u64,
    pub logs: Vec<RawLog>,
}

/// Register a live subscription starting at `from_block`.
///
/// The poller runs until `cancel` fires or the receiver is dropped.
pub fn subscribe(
    chain: Arc<dyn ChainClient>,
    from_block: u64,
    interval: Duration,
    cancel: CancellationToken,
) -> mpsc::Receiver<LogBatch> {
    let (tx, rx) = mpsc::channel(64);
    let interval = interval.max(MIN_POLL_INTERVAL);

    tokio::spawn(async move {
        info!("Live subscription registered from block {from_block}");
        let mut next_block = from_block;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match poll_range(chain.as_ref(), next_block).await {
                Ok(Some(batch)) => {
                    next_block = batch.to_block + 1;
                    if tx.send(batch).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("Live poll from block {next_block} failed: {e}"),
            }
        }
        debug!("Live subscription stopped");
    });

    rx
}

/// Fetch every tracked kind from `from_block` up to the head (capped at
/// [`MAX_BLOCK_RANGE`] blocks). `None` when the head has not advanced.
pub async fn poll_range(chain: &dyn ChainClient, from_block: u64) -> Result<Option<LogBatch>> {
    let head = chain.block_number().await?;
    if head < from_block {
        return Ok(None);
    }
    let to_block = head.min(from_block + MAX_BLOCK_RANGE - 1);

    let mut logs = Vec::new();
    for kind in EventKind::ALL {
        logs.extend(chain.query_logs(kind, from_block, to_block).await?);
    }
    sort_logs(&mut logs);

    Ok(Some(LogBatch {
        from_block,
        to_block,
        logs,
    }))
}

// ─────────────────────────────────────────────────────────
// Test support
// ─────────────────────────────────────────────────────────


// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
