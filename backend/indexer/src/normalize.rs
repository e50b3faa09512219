//! Raw log → [`ChainEvent`] normalization.
//!
//! Every field crossing this boundary is typed: addresses are lower-cased,
//! amounts converted to display units, milestone ids checked for range.
//! Logs that cannot be ordered (pending, no block), deduplicated (no
//! transaction hash) or decoded are rejected as [`IndexerError::MalformedLog`].

use alloy::primitives::{B256, U256};
use alloy::sol_types::SolEvent;
use tracing::warn;

use crate::abi::{self, to_ether, to_i64};
use crate::errors::{IndexerError, Result};
use crate::events::{ChainEvent, EventKind, MilestoneRef, NormalizedLog};
use crate::rpc::{self, RawLog};

/// Canonical form of a wallet address or hash.
pub fn normalize_address(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Normalize a batch, dropping (and logging) any malformed entry.
pub fn normalize_logs(raw: &[RawLog]) -> Vec<NormalizedLog> {
    raw.iter()
        .filter_map(|log| match normalize(log) {
            Ok(normalized) => Some(normalized),
            Err(e) => {
                warn!(
                    "Dropping log at block {:?} (tx {:?}): {e}",
                    log.block_number, log.transaction_hash
                );
                None
            }
        })
        .collect()
}

pub fn normalize(raw: &RawLog) -> Result<NormalizedLog> {
    if raw.removed {
        return Err(IndexerError::malformed("log was removed by a reorg"));
    }

    let block_number = quantity(raw.block_number.as_deref(), "block number")?;
    let log_index = quantity(raw.log_index.as_deref(), "log index")?;

    let tx_hash = raw
        .transaction_hash
        .as_deref()
        .filter(|h| !h.trim().is_empty())
        .map(normalize_address)
        .ok_or_else(|| IndexerError::malformed("missing transaction hash"))?;

    let topics = raw
        .topics
        .iter()
        .map(|t| {
            t.parse::<B256>()
                .map_err(|_| IndexerError::malformed(format!("invalid topic {t:?}")))
        })
        .collect::<Result<Vec<_>>>()?;
    let topic0 = topics
        .first()
        .ok_or_else(|| IndexerError::malformed("log has no topics"))?;
    let kind = EventKind::from_topic(topic0)
        .ok_or_else(|| IndexerError::malformed(format!("unrecognised topic {topic0}")))?;

    let data = hex::decode(raw.data.trim_start_matches("0x"))
        .map_err(|e| IndexerError::malformed(format!("invalid log data: {e}")))?;

    let event = match kind {
        EventKind::DonationReceived => {
            let e: abi::DonationReceived = decode(&topics, &data)?;
            ChainEvent::DonationReceived {
                campaign_chain_id: e.campaignId.to_string(),
                donor: abi::address_key(e.donor),
                amount: to_ether(e.amount)?,
                total_collected: to_ether(e.totalCollected)?,
                tx_hash: tx_hash.clone(),
            }
        }
        EventKind::MilestoneAdded => {
            let e: abi::MilestoneAdded = decode(&topics, &data)?;
            ChainEvent::MilestoneAdded {
                campaign_chain_id: e.campaignId.to_string(),
                milestone_index: to_i64(e.milestoneId, "milestoneId")?,
                title: e.title,
                amount: to_ether(e.amount)?,
                required_approvals: to_i64(e.requiredApprovals, "requiredApprovals")?,
            }
        }
        EventKind::MilestoneApproved => {
            let e: abi::MilestoneApproved = decode(&topics, &data)?;
            ChainEvent::MilestoneApproved {
                campaign_chain_id: e.campaignId.to_string(),
                milestone_index: to_i64(e.milestoneId, "milestoneId")?,
                approver: abi::address_key(e.approver),
            }
        }
        EventKind::ProofUploaded => {
            let e: abi::MilestoneProofUploaded = decode(&topics, &data)?;
            ChainEvent::ProofUploaded {
                campaign_chain_id: e.campaignId.to_string(),
                milestone_index: to_i64(e.milestoneId, "milestoneId")?,
                proof_hash: e.ipfsHash,
            }
        }
        EventKind::FundsWithdrawn => {
            let e: abi::FundsWithdrawn = decode(&topics, &data)?;
            let milestone = if e.milestoneId == U256::MAX {
                MilestoneRef::MultiSig
            } else {
                MilestoneRef::Index(to_i64(e.milestoneId, "milestoneId")?)
            };
            ChainEvent::FundsWithdrawn {
                campaign_chain_id: e.campaignId.to_string(),
                milestone,
                amount: to_ether(e.amount)?,
            }
        }
    };

    Ok(NormalizedLog {
        event,
        block_number,
        log_index,
        tx_hash,
    })
}

fn decode<E: SolEvent>(topics: &[B256], data: &[u8]) -> Result<E> {
    E::decode_raw_log(topics.iter().copied(), data, true)
        .map_err(|e| IndexerError::malformed(format!("{}: {e}", E::SIGNATURE)))
}

/// Pending logs carry no block number or index and cannot be ordered.
fn quantity(raw: Option<&str>, field: &str) -> Result<u64> {
    let raw = raw.ok_or_else(|| IndexerError::malformed(format!("missing {field}")))?;
    rpc::parse_quantity(raw)
}
