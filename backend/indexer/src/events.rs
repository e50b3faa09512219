//! Canonical event types emitted by the FundChain crowdfunding contract.
//!
//! Raw logs never reach the reconciliation engine: they are decoded into one
//! [`ChainEvent`] variant per event kind by [`crate::normalize`].

use alloy::primitives::B256;
use alloy::sol_types::SolEvent;

use crate::abi;

/// All event kinds tracked by the mirror, in catch-up scan order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    DonationReceived,
    MilestoneAdded,
    MilestoneApproved,
    ProofUploaded,
    FundsWithdrawn,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        Self::DonationReceived,
        Self::MilestoneAdded,
        Self::MilestoneApproved,
        Self::ProofUploaded,
        Self::FundsWithdrawn,
    ];

    /// Keccak hash of the event signature, as found in `topics[0]`.
    pub fn topic(&self) -> B256 {
        match self {
            Self::DonationReceived => abi::DonationReceived::SIGNATURE_HASH,
            Self::MilestoneAdded => abi::MilestoneAdded::SIGNATURE_HASH,
            Self::MilestoneApproved => abi::MilestoneApproved::SIGNATURE_HASH,
            Self::ProofUploaded => abi::MilestoneProofUploaded::SIGNATURE_HASH,
            Self::FundsWithdrawn => abi::FundsWithdrawn::SIGNATURE_HASH,
        }
    }

    /// Resolve a `topics[0]` hash back to its kind.
    pub fn from_topic(topic: &B256) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.topic() == *topic)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DonationReceived => "donation_received",
            Self::MilestoneAdded => "milestone_added",
            Self::MilestoneApproved => "milestone_approved",
            Self::ProofUploaded => "proof_uploaded",
            Self::FundsWithdrawn => "funds_withdrawn",
        }
    }
}

/// Target of a withdrawal: one milestone, or the aggregate multisig
/// withdrawal encoded on-chain as the all-bits-set milestone id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MilestoneRef {
    Index(i64),
    MultiSig,
}

/// A decoded, typed chain fact. Addresses are lower-cased and amounts are in
/// display units.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainEvent {
    DonationReceived {
        campaign_chain_id: String,
        donor: String,
        amount: f64,
        total_collected: f64,
        tx_hash: String,
    },
    MilestoneAdded {
        campaign_chain_id: String,
        milestone_index: i64,
        title: String,
        amount: f64,
        required_approvals: i64,
    },
    MilestoneApproved {
        campaign_chain_id: String,
        milestone_index: i64,
        approver: String,
    },
    ProofUploaded {
        campaign_chain_id: String,
        milestone_index: i64,
        proof_hash: String,
    },
    FundsWithdrawn {
        campaign_chain_id: String,
        milestone: MilestoneRef,
        amount: f64,
    },
}

impl ChainEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::DonationReceived { .. } => EventKind::DonationReceived,
            Self::MilestoneAdded { .. } => EventKind::MilestoneAdded,
            Self::MilestoneApproved { .. } => EventKind::MilestoneApproved,
            Self::ProofUploaded { .. } => EventKind::ProofUploaded,
            Self::FundsWithdrawn { .. } => EventKind::FundsWithdrawn,
        }
    }

    pub fn campaign_chain_id(&self) -> &str {
        match self {
            Self::DonationReceived {
                campaign_chain_id, ..
            }
            | Self::MilestoneAdded {
                campaign_chain_id, ..
            }
            | Self::MilestoneApproved {
                campaign_chain_id, ..
            }
            | Self::ProofUploaded {
                campaign_chain_id, ..
            }
            | Self::FundsWithdrawn {
                campaign_chain_id, ..
            } => campaign_chain_id,
        }
    }
}

/// Where a fact sits in chain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChainPosition {
    pub block: u64,
    pub log_index: u64,
}

impl ChainPosition {
    /// Log index that sorts after every real log.
    pub const END_OF_BLOCK: u64 = i64::MAX as u64;

    pub fn new(block: u64, log_index: u64) -> Self {
        Self { block, log_index }
    }

    /// Position of state read from the contract at `block`: after every log
    /// in that block.
    pub fn end_of_block(block: u64) -> Self {
        Self::new(block, Self::END_OF_BLOCK)
    }
}

/// A [`ChainEvent`] together with the position of the log that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedLog {
    pub event: ChainEvent,
    pub block_number: u64,
    pub log_index: u64,
    pub tx_hash: String,
}

impl NormalizedLog {
    pub fn position(&self) -> ChainPosition {
        ChainPosition::new(self.block_number, self.log_index)
    }
}
