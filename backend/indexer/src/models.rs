//! Rows of the off-chain mirror and the aggregate pushed to live clients.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Campaign {
    pub id: i64,
    /// On-chain campaign id; `None` while the row is pending its chain link.
    pub blockchain_id: Option<String>,
    pub title: String,
    pub description: String,
    pub target_amount: f64,
    pub deadline: Option<i64>,
    pub amount_collected: f64,
    pub verified: bool,
    pub withdrawn: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Milestone {
    pub id: i64,
    pub campaign_id: i64,
    pub milestone_index: i64,
    pub title: String,
    pub amount: f64,
    pub required_approvals: i64,
    pub approval_count: i64,
    pub approved: bool,
    pub funds_released: bool,
    pub proof_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Donation {
    pub id: i64,
    pub campaign_id: i64,
    pub user_id: Option<i64>,
    pub donor: String,
    pub amount: f64,
    pub tx_hash: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub wallet: String,
    pub created_at: i64,
}

/// A campaign with its milestones (ascending index) and newest donations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignAggregate {
    #[serde(flatten)]
    pub campaign: Campaign,
    pub milestones: Vec<Milestone>,
    pub donations: Vec<Donation>,
}

/// Off-chain provisioning request for a campaign row.
#[derive(Debug, Clone, Deserialize)]
pub struct NewCampaign {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub target_amount: f64,
    pub deadline: Option<i64>,
    pub blockchain_id: Option<String>,
}
