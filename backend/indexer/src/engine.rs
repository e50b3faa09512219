//! Reconciliation of normalized chain events into the mirror store.
//!
//! Each event is applied inside its own SQLite transaction. Lookup misses and
//! re-deliveries are soft skips ([`SkipReason`]); the transaction is rolled
//! back and nothing is published. Totals are overwritten with the chain's
//! reported values rather than accumulated, and only by facts at or after
//! the chain position that last wrote them, so replays in any order are
//! harmless.
//!
//! Transactions start with `BEGIN IMMEDIATE`: the API and the event stream
//! reconcile concurrently, and a deferred read-then-write transaction would
//! fail with `SQLITE_BUSY` instead of waiting for the other writer.

use sqlx::{SqliteConnection, SqlitePool};
use tracing::{error, info, warn};

use crate::db;
use crate::errors::{IndexerError, Result};
use crate::events::{ChainEvent, ChainPosition, MilestoneRef, NormalizedLog};
use crate::models::{CampaignAggregate, Donation, Milestone};
use crate::notifier::ChangeNotifier;
use crate::rpc::CampaignChainState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No mirror row carries the event's `blockchainId` yet.
    UnknownCampaign,
    /// The campaign is known but the milestone index is not.
    UnknownMilestone,
    /// The fact was already applied (same tx hash, index or approver).
    DuplicateEvent,
    /// Aggregate multisig withdrawal; intentionally not reconciled.
    MultiSigWithdrawal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Applied {
        aggregate: CampaignAggregate,
        donation: Option<Donation>,
    },
    Skipped(SkipReason),
}

pub struct Reconciler {
    pool: SqlitePool,
    notifier: ChangeNotifier,
    recent_donations: i64,
}

impl Reconciler {
    pub fn new(pool: SqlitePool, notifier: ChangeNotifier, recent_donations: i64) -> Self {
        Self {
            pool,
            notifier,
            recent_donations,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn recent_donations(&self) -> i64 {
        self.recent_donations
    }

    /// Apply one event, positioned at `at` in chain order, atomically.
    /// Skips roll back; nothing is published.
    pub async fn apply(&self, event: &ChainEvent, at: ChainPosition) -> Result<Outcome> {
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        let conn = &mut *tx;
        let recent = self.recent_donations;

        let outcome = match event {
            ChainEvent::DonationReceived {
                campaign_chain_id,
                donor,
                amount,
                total_collected,
                tx_hash,
            } => {
                apply_donation(
                    conn,
                    recent,
                    at,
                    campaign_chain_id,
                    donor,
                    *amount,
                    *total_collected,
                    tx_hash,
                )
                .await?
            }
            ChainEvent::MilestoneAdded {
                campaign_chain_id,
                milestone_index,
                title,
                amount,
                required_approvals,
            } => {
                apply_milestone_added(
                    conn,
                    recent,
                    campaign_chain_id,
                    *milestone_index,
                    title,
                    *amount,
                    *required_approvals,
                )
                .await?
            }
            ChainEvent::MilestoneApproved {
                campaign_chain_id,
                milestone_index,
                approver,
            } => {
                apply_approval(conn, recent, campaign_chain_id, *milestone_index, approver).await?
            }
            ChainEvent::ProofUploaded {
                campaign_chain_id,
                milestone_index,
                proof_hash,
            } => apply_proof(conn, recent, campaign_chain_id, *milestone_index, proof_hash).await?,
            ChainEvent::FundsWithdrawn {
                campaign_chain_id,
                milestone,
                ..
            } => apply_withdrawal(conn, recent, campaign_chain_id, *milestone).await?,
        };

        if let Outcome::Applied { .. } = outcome {
            tx.commit().await?;
        }
        Ok(outcome)
    }

    /// Apply, then publish the updated aggregate to live subscribers.
    pub async fn process(&self, event: &ChainEvent, at: ChainPosition) -> Result<Outcome> {
        let outcome = self.apply(event, at).await?;
        if let Outcome::Applied {
            aggregate,
            donation,
        } = &outcome
        {
            self.notifier.publish(aggregate, donation.as_ref());
        }
        Ok(outcome)
    }

    /// Fault-isolated entry point for the event stream: every failure is
    /// logged here and never propagates to the caller.
    pub async fn handle(&self, log: &NormalizedLog) -> Option<Outcome> {
        let kind = log.event.kind().as_str();
        let campaign = log.event.campaign_chain_id();

        match self.process(&log.event, log.position()).await {
            Ok(outcome) => {
                match &outcome {
                    Outcome::Applied { .. } => info!(
                        "Reconciled {kind} for campaign {campaign} (block {}, log {}, tx {})",
                        log.block_number, log.log_index, log.tx_hash
                    ),
                    Outcome::Skipped(SkipReason::UnknownCampaign) => warn!(
                        "Campaign with blockchainId {campaign} not found; skipping {kind} (tx {})",
                        log.tx_hash
                    ),
                    Outcome::Skipped(SkipReason::UnknownMilestone) => warn!(
                        "Milestone not found for campaign {campaign}; skipping {kind} (tx {})",
                        log.tx_hash
                    ),
                    Outcome::Skipped(SkipReason::DuplicateEvent) => info!(
                        "Already applied {kind} for campaign {campaign} (tx {})",
                        log.tx_hash
                    ),
                    Outcome::Skipped(SkipReason::MultiSigWithdrawal) => info!(
                        "Multisig withdrawal for campaign {campaign} is not reconciled (tx {})",
                        log.tx_hash
                    ),
                }
                Some(outcome)
            }
            Err(e) => {
                error!(
                    "Failed to reconcile {kind} for campaign {campaign} (tx {}): {e}",
                    log.tx_hash
                );
                None
            }
        }
    }

    /// Overwrite a campaign's figures with values read from the contract.
    /// `None` if the campaign is not mirrored.
    pub async fn resync_campaign(
        &self,
        campaign_chain_id: &str,
        state: &CampaignChainState,
    ) -> Result<Option<CampaignAggregate>> {
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        let Some(campaign) = db::find_campaign_by_chain_id(&mut tx, campaign_chain_id).await? else {
            return Ok(None);
        };

        db::set_campaign_chain_state(&mut tx, campaign.id, state).await?;
        let aggregate = reload(&mut tx, campaign.id, self.recent_donations).await?;
        tx.commit().await?;

        self.notifier.publish(&aggregate, None);
        Ok(Some(aggregate))
    }
}

// ─────────────────────────────────────────────────────────
// Transitions (run inside the caller's transaction)
// ─────────────────────────────────────────────────────────

async fn apply_donation(
    conn: &mut SqliteConnection,
    recent: i64,
    at: ChainPosition,
    campaign_chain_id: &str,
    donor: &str,
    amount: f64,
    total_collected: f64,
    tx_hash: &str,
) -> Result<Outcome> {
    let Some(campaign) = db::find_campaign_by_chain_id(&mut *conn, campaign_chain_id).await? else {
        return Ok(Outcome::Skipped(SkipReason::UnknownCampaign));
    };

    if db::find_donation_by_tx(&mut *conn, tx_hash).await?.is_some() {
        return Ok(Outcome::Skipped(SkipReason::DuplicateEvent));
    }

    let user_id = db::upsert_user(&mut *conn, donor).await?;
    let donation =
        match db::insert_donation(&mut *conn, campaign.id, user_id, donor, amount, tx_hash).await {
            Ok(donation) => donation,
            Err(e) if e.is_unique_violation() => {
                return Ok(Outcome::Skipped(SkipReason::DuplicateEvent))
            }
            Err(e) => return Err(e),
        };

    // Overwrite with the chain's running total; never increment.
    if !db::set_amount_collected(&mut *conn, campaign.id, total_collected, at).await? {
        info!(
            "Campaign {campaign_chain_id} total already synced past block {}, keeping it",
            at.block
        );
    }

    Ok(Outcome::Applied {
        aggregate: reload(conn, campaign.id, recent).await?,
        donation: Some(donation),
    })
}

async fn apply_milestone_added(
    conn: &mut SqliteConnection,
    recent: i64,
    campaign_chain_id: &str,
    milestone_index: i64,
    title: &str,
    amount: f64,
    required_approvals: i64,
) -> Result<Outcome> {
    let Some(campaign) = db::find_campaign_by_chain_id(&mut *conn, campaign_chain_id).await? else {
        return Ok(Outcome::Skipped(SkipReason::UnknownCampaign));
    };

    if db::find_milestone(&mut *conn, campaign.id, milestone_index)
        .await?
        .is_some()
    {
        return Ok(Outcome::Skipped(SkipReason::DuplicateEvent));
    }

    match db::insert_milestone(
        &mut *conn,
        campaign.id,
        milestone_index,
        title,
        amount,
        required_approvals,
    )
    .await
    {
        Ok(_) => {}
        Err(e) if e.is_unique_violation() => {
            return Ok(Outcome::Skipped(SkipReason::DuplicateEvent))
        }
        Err(e) => return Err(e),
    }

    applied(conn, campaign.id, recent).await
}

async fn apply_approval(
    conn: &mut SqliteConnection,
    recent: i64,
    campaign_chain_id: &str,
    milestone_index: i64,
    approver: &str,
) -> Result<Outcome> {
    let milestone = match find_milestone(conn, campaign_chain_id, milestone_index).await? {
        Ok(milestone) => milestone,
        Err(reason) => return Ok(Outcome::Skipped(reason)),
    };

    if !db::record_approval(&mut *conn, milestone.id, approver).await? {
        return Ok(Outcome::Skipped(SkipReason::DuplicateEvent));
    }
    db::increment_approval(&mut *conn, milestone.id).await?;

    applied(conn, milestone.campaign_id, recent).await
}

async fn apply_proof(
    conn: &mut SqliteConnection,
    recent: i64,
    campaign_chain_id: &str,
    milestone_index: i64,
    proof_hash: &str,
) -> Result<Outcome> {
    let milestone = match find_milestone(conn, campaign_chain_id, milestone_index).await? {
        Ok(milestone) => milestone,
        Err(reason) => return Ok(Outcome::Skipped(reason)),
    };

    // Last write wins.
    db::set_proof(&mut *conn, milestone.id, proof_hash).await?;

    applied(conn, milestone.campaign_id, recent).await
}

async fn apply_withdrawal(
    conn: &mut SqliteConnection,
    recent: i64,
    campaign_chain_id: &str,
    milestone: MilestoneRef,
) -> Result<Outcome> {
    let milestone_index = match milestone {
        MilestoneRef::Index(index) => index,
        MilestoneRef::MultiSig => return Ok(Outcome::Skipped(SkipReason::MultiSigWithdrawal)),
    };

    let milestone = match find_milestone(conn, campaign_chain_id, milestone_index).await? {
        Ok(milestone) => milestone,
        Err(reason) => return Ok(Outcome::Skipped(reason)),
    };

    db::mark_funds_released(&mut *conn, milestone.id).await?;

    applied(conn, milestone.campaign_id, recent).await
}

/// Resolve `(blockchainId, index)` to a milestone row, or the reason it is missing.
async fn find_milestone(
    conn: &mut SqliteConnection,
    campaign_chain_id: &str,
    milestone_index: i64,
) -> Result<std::result::Result<Milestone, SkipReason>> {
    let Some(campaign) = db::find_campaign_by_chain_id(&mut *conn, campaign_chain_id).await? else {
        return Ok(Err(SkipReason::UnknownCampaign));
    };
    Ok(db::find_milestone(&mut *conn, campaign.id, milestone_index)
        .await?
        .ok_or(SkipReason::UnknownMilestone))
}

async fn applied(conn: &mut SqliteConnection, campaign_id: i64, recent: i64) -> Result<Outcome> {
    Ok(Outcome::Applied {
        aggregate: reload(conn, campaign_id, recent).await?,
        donation: None,
    })
}

async fn reload(
    conn: &mut SqliteConnection,
    campaign_id: i64,
    recent: i64,
) -> Result<CampaignAggregate> {
    db::load_aggregate(conn, campaign_id, recent)
        .await?
        .ok_or(IndexerError::Database(sqlx::Error::RowNotFound))
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewCampaign;
    use crate::notifier::Notification;

    const DONOR: &str = "0x00000000000000000000000000000000000abc12";

    fn at(block: u64) -> ChainPosition {
        ChainPosition::new(block, 0)
    }

    async fn setup() -> (Reconciler, ChangeNotifier) {
        let pool = db::test_pool().await;
        let notifier = ChangeNotifier::new();
        (Reconciler::new(pool, notifier.clone(), 10), notifier)
    }

    async fn campaign(reconciler: &Reconciler, chain_id: &str) -> i64 {
        let mut conn = reconciler.pool().acquire().await.unwrap();
        db::create_campaign(
            &mut conn,
            &NewCampaign {
                title: format!("Campaign {chain_id}"),
                description: String::new(),
                target_amount: 10.0,
                deadline: None,
                blockchain_id: Some(chain_id.to_string()),
            },
        )
        .await
        .unwrap()
        .id
    }

    async fn donation_count(reconciler: &Reconciler) -> i64 {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM donations")
            .fetch_one(reconciler.pool())
            .await
            .unwrap();
        count
    }

    async fn milestone(reconciler: &Reconciler, campaign_id: i64, index: i64) -> Milestone {
        let mut conn = reconciler.pool().acquire().await.unwrap();
        db::find_milestone(&mut conn, campaign_id, index)
            .await
            .unwrap()
            .unwrap()
    }

    fn donation(chain_id: &str, amount: f64, total: f64, tx_hash: &str) -> ChainEvent {
        ChainEvent::DonationReceived {
            campaign_chain_id: chain_id.to_string(),
            donor: DONOR.to_string(),
            amount,
            total_collected: total,
            tx_hash: tx_hash.to_string(),
        }
    }

    fn milestone_added(index: i64, required: i64) -> ChainEvent {
        ChainEvent::MilestoneAdded {
            campaign_chain_id: "7".to_string(),
            milestone_index: index,
            title: "Phase 1".to_string(),
            amount: 0.5,
            required_approvals: required,
        }
    }

    fn approval(index: i64, approver: &str) -> ChainEvent {
        ChainEvent::MilestoneApproved {
            campaign_chain_id: "7".to_string(),
            milestone_index: index,
            approver: approver.to_string(),
        }
    }

    fn proof_uploaded(index: i64, proof: &str) -> ChainEvent {
        ChainEvent::ProofUploaded {
            campaign_chain_id: "7".to_string(),
            milestone_index: index,
            proof_hash: proof.to_string(),
        }
    }

    fn withdrawal(milestone: MilestoneRef) -> ChainEvent {
        ChainEvent::FundsWithdrawn {
            campaign_chain_id: "7".to_string(),
            milestone,
            amount: 0.5,
        }
    }

    #[tokio::test]
    async fn donation_is_idempotent() {
        let (reconciler, _) = setup().await;
        campaign(&reconciler, "7").await;
        let event = donation("7", 1.0, 1.0, "0xaaa");

        match reconciler.apply(&event, at(1)).await.unwrap() {
            Outcome::Applied {
                aggregate,
                donation,
            } => {
                assert_eq!(aggregate.campaign.amount_collected, 1.0);
                assert_eq!(aggregate.donations.len(), 1);
                let donation = donation.unwrap();
                assert_eq!(donation.tx_hash, "0xaaa");
                assert_eq!(donation.amount, 1.0);
                assert!(donation.user_id.is_some());
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        assert_eq!(
            reconciler.apply(&event, at(1)).await.unwrap(),
            Outcome::Skipped(SkipReason::DuplicateEvent)
        );
        assert_eq!(donation_count(&reconciler).await, 1);

        let mut conn = reconciler.pool().acquire().await.unwrap();
        let stored = db::find_campaign_by_chain_id(&mut conn, "7")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.amount_collected, 1.0);
    }

    #[tokio::test]
    async fn total_is_overwritten_not_accumulated() {
        let (reconciler, _) = setup().await;
        campaign(&reconciler, "7").await;

        reconciler.apply(&donation("7", 1.0, 1.0, "0xaaa"), at(1)).await.unwrap();
        let outcome = reconciler
            .apply(&donation("7", 2.0, 3.0, "0xbbb"), at(2))
            .await
            .unwrap();

        match outcome {
            Outcome::Applied { aggregate, .. } => {
                assert_eq!(aggregate.campaign.amount_collected, 3.0);
                assert_eq!(aggregate.donations[0].tx_hash, "0xbbb");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_campaign_changes_nothing() {
        let (reconciler, _) = setup().await;
        let existing = campaign(&reconciler, "7").await;

        assert_eq!(
            reconciler
                .apply(&donation("8", 1.0, 1.0, "0xaaa"), at(1))
                .await
                .unwrap(),
            Outcome::Skipped(SkipReason::UnknownCampaign)
        );
        assert_eq!(donation_count(&reconciler).await, 0);

        let mut conn = reconciler.pool().acquire().await.unwrap();
        let untouched = db::find_campaign(&mut conn, existing).await.unwrap().unwrap();
        assert_eq!(untouched.amount_collected, 0.0);
        assert!(db::find_user(&mut conn, DONOR).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn two_distinct_approvals_meet_threshold() {
        let (reconciler, _) = setup().await;
        let id = campaign(&reconciler, "7").await;

        reconciler.apply(&milestone_added(0, 2), at(1)).await.unwrap();
        reconciler.apply(&approval(0, "0x01"), at(1)).await.unwrap();
        reconciler.apply(&approval(0, "0x02"), at(1)).await.unwrap();

        let ms = milestone(&reconciler, id, 0).await;
        assert_eq!(ms.title, "Phase 1");
        assert_eq!(ms.approval_count, 2);
        assert!(ms.approved);
        assert!(!ms.funds_released);
    }

    #[tokio::test]
    async fn approval_is_monotonic() {
        let (reconciler, _) = setup().await;
        let id = campaign(&reconciler, "7").await;
        reconciler.apply(&milestone_added(0, 2), at(1)).await.unwrap();

        let mut seen = Vec::new();
        for approver in ["0x01", "0x01", "0x02", "0x03"] {
            reconciler.apply(&approval(0, approver), at(1)).await.unwrap();
            let ms = milestone(&reconciler, id, 0).await;
            seen.push((ms.approval_count, ms.approved));
        }

        assert_eq!(seen, vec![(1, false), (1, false), (2, true), (3, true)]);
    }

    #[tokio::test]
    async fn redelivered_approval_is_duplicate() {
        let (reconciler, _) = setup().await;
        campaign(&reconciler, "7").await;
        reconciler.apply(&milestone_added(0, 2), at(1)).await.unwrap();

        reconciler.apply(&approval(0, "0x01"), at(1)).await.unwrap();
        assert_eq!(
            reconciler.apply(&approval(0, "0x01"), at(1)).await.unwrap(),
            Outcome::Skipped(SkipReason::DuplicateEvent)
        );
    }

    #[tokio::test]
    async fn approval_for_missing_milestone_is_skipped() {
        let (reconciler, _) = setup().await;
        campaign(&reconciler, "7").await;
        assert_eq!(
            reconciler.apply(&approval(3, "0x01"), at(1)).await.unwrap(),
            Outcome::Skipped(SkipReason::UnknownMilestone)
        );
    }

    #[tokio::test]
    async fn lookup_misses_are_soft_skips() {
        let (reconciler, notifier) = setup().await;
        let id = campaign(&reconciler, "7").await;
        reconciler.apply(&milestone_added(0, 2), at(1)).await.unwrap();
        let mut rx = notifier.subscribe();

        let on_campaign_8 = |event: ChainEvent| match event {
            ChainEvent::MilestoneAdded {
                milestone_index,
                title,
                amount,
                required_approvals,
                ..
            } => ChainEvent::MilestoneAdded {
                campaign_chain_id: "8".to_string(),
                milestone_index,
                title,
                amount,
                required_approvals,
            },
            ChainEvent::MilestoneApproved {
                milestone_index,
                approver,
                ..
            } => ChainEvent::MilestoneApproved {
                campaign_chain_id: "8".to_string(),
                milestone_index,
                approver,
            },
            ChainEvent::ProofUploaded {
                milestone_index,
                proof_hash,
                ..
            } => ChainEvent::ProofUploaded {
                campaign_chain_id: "8".to_string(),
                milestone_index,
                proof_hash,
            },
            ChainEvent::FundsWithdrawn {
                milestone, amount, ..
            } => ChainEvent::FundsWithdrawn {
                campaign_chain_id: "8".to_string(),
                milestone,
                amount,
            },
            other => other,
        };

        let cases = [
            (on_campaign_8(milestone_added(1, 2)), SkipReason::UnknownCampaign),
            (on_campaign_8(approval(0, "0x01")), SkipReason::UnknownCampaign),
            (on_campaign_8(proof_uploaded(0, "QmProof")), SkipReason::UnknownCampaign),
            (
                on_campaign_8(withdrawal(MilestoneRef::Index(0))),
                SkipReason::UnknownCampaign,
            ),
            (approval(5, "0x01"), SkipReason::UnknownMilestone),
            (proof_uploaded(5, "QmProof"), SkipReason::UnknownMilestone),
            (
                withdrawal(MilestoneRef::Index(5)),
                SkipReason::UnknownMilestone,
            ),
        ];

        for (event, expected) in cases {
            assert_eq!(
                reconciler.process(&event, at(2)).await.unwrap(),
                Outcome::Skipped(expected),
                "{event:?}"
            );
        }

        assert!(rx.try_recv().is_err());
        let ms = milestone(&reconciler, id, 0).await;
        assert_eq!(ms.approval_count, 0);
        assert!(ms.proof_hash.is_none());
        assert!(!ms.funds_released);
        let mut conn = reconciler.pool().acquire().await.unwrap();
        assert!(db::find_campaign_by_chain_id(&mut conn, "8")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn older_donation_does_not_rewind_total() {
        let (reconciler, _) = setup().await;
        campaign(&reconciler, "7").await;

        reconciler
            .apply(&donation("7", 2.0, 3.0, "0xbbb"), at(20))
            .await
            .unwrap();
        let outcome = reconciler
            .apply(&donation("7", 1.0, 1.0, "0xaaa"), at(10))
            .await
            .unwrap();

        match outcome {
            Outcome::Applied { aggregate, .. } => {
                assert_eq!(aggregate.campaign.amount_collected, 3.0);
                assert_eq!(aggregate.donations.len(), 2);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_writers_do_not_lose_events() {
        let path = std::env::temp_dir().join(format!(
            "fundchain-concurrent-{}-{}.db",
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        let pool = db::init_pool(path.to_str().unwrap()).await.unwrap();
        let reconciler = std::sync::Arc::new(Reconciler::new(pool, ChangeNotifier::new(), 10));
        campaign(&reconciler, "7").await;

        let tasks: Vec<_> = (0..16u64)
            .map(|i| {
                let reconciler = reconciler.clone();
                tokio::spawn(async move {
                    let event = donation("7", 1.0, (i + 1) as f64, &format!("0x{i:x}"));
                    reconciler.apply(&event, at(i)).await
                })
            })
            .collect();
        for task in tasks {
            assert!(matches!(
                task.await.unwrap().unwrap(),
                Outcome::Applied { .. }
            ));
        }

        assert_eq!(donation_count(&reconciler).await, 16);
        let mut conn = reconciler.pool().acquire().await.unwrap();
        let stored = db::find_campaign_by_chain_id(&mut conn, "7")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.amount_collected, 16.0);
        drop(conn);
        reconciler.pool().close().await;
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn duplicate_milestone_add_is_tolerated() {
        let (reconciler, _) = setup().await;
        campaign(&reconciler, "7").await;
        assert!(matches!(
            reconciler.apply(&milestone_added(0, 2), at(1)).await.unwrap(),
            Outcome::Applied { .. }
        ));
        assert_eq!(
            reconciler.apply(&milestone_added(0, 2), at(1)).await.unwrap(),
            Outcome::Skipped(SkipReason::DuplicateEvent)
        );
    }

    #[tokio::test]
    async fn withdrawal_before_approval_heals_flags() {
        let (reconciler, _) = setup().await;
        let id = campaign(&reconciler, "7").await;
        reconciler.apply(&milestone_added(0, 3), at(1)).await.unwrap();

        reconciler
            .apply(&withdrawal(MilestoneRef::Index(0)), at(1))
            .await
            .unwrap();

        let ms = milestone(&reconciler, id, 0).await;
        assert!(ms.approved);
        assert!(ms.funds_released);
        assert_eq!(ms.approval_count, 0);
    }

    #[tokio::test]
    async fn multisig_withdrawal_is_a_no_op() {
        let (reconciler, notifier) = setup().await;
        campaign(&reconciler, "7").await;
        let mut rx = notifier.subscribe();

        assert_eq!(
            reconciler
                .process(&withdrawal(MilestoneRef::MultiSig), at(1))
                .await
                .unwrap(),
            Outcome::Skipped(SkipReason::MultiSigWithdrawal)
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn proof_is_last_write_wins() {
        let (reconciler, _) = setup().await;
        let id = campaign(&reconciler, "7").await;
        reconciler.apply(&milestone_added(0, 1), at(1)).await.unwrap();

        for proof in ["QmFirst", "QmSecond"] {
            reconciler
                .apply(&proof_uploaded(0, proof), at(1))
                .await
                .unwrap();
        }

        assert_eq!(
            milestone(&reconciler, id, 0).await.proof_hash.as_deref(),
            Some("QmSecond")
        );
    }

    #[tokio::test]
    async fn process_publishes_donation_notifications() {
        let (reconciler, notifier) = setup().await;
        campaign(&reconciler, "7").await;
        let mut rx = notifier.subscribe();

        reconciler
            .process(&donation("7", 1.0, 1.0, "0xaaa"), at(1))
            .await
            .unwrap();

        assert!(matches!(
            rx.recv().await.unwrap(),
            Notification::CampaignUpdated(_)
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            Notification::NewDonation(_)
        ));
    }

    #[tokio::test]
    async fn handle_contains_store_failures() {
        let (reconciler, _) = setup().await;
        campaign(&reconciler, "7").await;
        reconciler.pool().close().await;

        let log = NormalizedLog {
            event: donation("7", 1.0, 1.0, "0xaaa"),
            block_number: 1,
            log_index: 0,
            tx_hash: "0xaaa".to_string(),
        };
        assert_eq!(reconciler.handle(&log).await, None);
    }

    #[tokio::test]
    async fn resync_overwrites_from_chain_state() {
        let (reconciler, _) = setup().await;
        campaign(&reconciler, "7").await;

        let state = CampaignChainState {
            block: 50,
            target: 10.0,
            deadline: 1_900_000_000,
            amount_collected: 4.25,
            withdrawn: true,
            verified: true,
        };
        let aggregate = reconciler
            .resync_campaign("7", &state)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(aggregate.campaign.amount_collected, 4.25);
        assert!(aggregate.campaign.verified);
        assert!(aggregate.campaign.withdrawn);
        assert_eq!(aggregate.campaign.deadline, Some(1_900_000_000));

        // A donation from an earlier block than the read leaves the total alone.
        reconciler
            .apply(&donation("7", 1.0, 1.0, "0xaaa"), at(49))
            .await
            .unwrap();
        let mut conn = reconciler.pool().acquire().await.unwrap();
        let stored = db::find_campaign_by_chain_id(&mut conn, "7")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.amount_collected, 4.25);
        drop(conn);

        assert!(reconciler.resync_campaign("99", &state).await.unwrap().is_none());
    }
}
