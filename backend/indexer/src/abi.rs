//! Contract interface of the FundChain crowdfunding contract.
//!
//! Event and accessor layouts are declared once with `sol!`; decoding goes
//! through the generated `SolEvent` / `SolCall` impls.

use alloy::primitives::utils::format_ether;
use alloy::primitives::{Address, B256, U256};
use alloy::sol;

use crate::errors::{IndexerError, Result};

sol! {
    event DonationReceived(uint256 indexed campaignId, address donor, uint256 amount, uint256 totalCollected);
    event MilestoneAdded(uint256 indexed campaignId, uint256 milestoneId, string title, uint256 amount, uint256 requiredApprovals);
    event MilestoneApproved(uint256 indexed campaignId, uint256 milestoneId, address approver);
    event MilestoneProofUploaded(uint256 indexed campaignId, uint256 milestoneId, string ipfsHash);
    event FundsWithdrawn(uint256 indexed campaignId, uint256 milestoneId, uint256 amount);

    function campaigns(uint256 id) external view returns (
        address owner,
        string memory title,
        string memory description,
        string memory category,
        string memory ipfsImageHash,
        uint256 target,
        uint256 deadline,
        uint256 amountCollected,
        bool withdrawn,
        bool verified,
        bool refundsEnabled,
        uint256 milestoneCount,
        uint256 donorCount,
        uint256 confirmationCount
    );
}

/// Lossy conversion of a wei amount into ether for display.
///
/// Never feed the result back into chain arithmetic.
pub fn to_ether(wei: U256) -> Result<f64> {
    let formatted = format_ether(wei);
    formatted
        .parse()
        .map_err(|_| IndexerError::malformed(format!("amount {wei} is not representable")))
}

/// A small on-chain integer (milestone id, approval threshold) as `i64`.
pub fn to_i64(value: U256, field: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| IndexerError::malformed(format!("{field} {value} out of range")))
}

/// Lower-cased `0x` form, the canonical wallet key in the mirror.
pub fn address_key(address: Address) -> String {
    format!("0x{}", hex::encode(address.as_slice()))
}

/// `0x`-prefixed hex of a 32-byte word, as JSON-RPC expects topics.
pub fn word_hex(word: B256) -> String {
    format!("0x{}", hex::encode(word.as_slice()))
}
