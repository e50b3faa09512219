//! Database layer: migrations, mirror queries and cursor management.
//!
//! Query helpers take a `&mut SqliteConnection` so the reconciliation engine
//! can run several of them inside one transaction (`&mut *tx`), while API
//! handlers pass a pooled connection.

use std::str::FromStr;

use chrono::Utc;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::info;

use crate::errors::Result;
use crate::models::{Campaign, CampaignAggregate, Donation, Milestone, NewCampaign, User};
use crate::events::ChainPosition;
use crate::rpc::CampaignChainState;

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const CAMPAIGN_COLUMNS: &str = "id, blockchain_id, title, description, target_amount, deadline, \
     amount_collected, verified, withdrawn, created_at";

const MILESTONE_COLUMNS: &str = "id, campaign_id, milestone_index, title, amount, \
     required_approvals, approval_count, approved, funds_released, proof_hash";

const DONATION_COLUMNS: &str = "id, campaign_id, user_id, donor, amount, tx_hash, timestamp";

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    let options = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    MIGRATOR.run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

// ─────────────────────────────────────────────────────────
// Cursor helpers
// ─────────────────────────────────────────────────────────

/// Last block fully processed by the live subscription (`0` if none yet).
pub async fn get_last_block(conn: &mut SqliteConnection) -> Result<i64> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT last_block FROM sync_cursor WHERE id = 1")
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.map(|(v,)| v).unwrap_or(0))
}

pub async fn save_last_block(conn: &mut SqliteConnection, last_block: i64) -> Result<()> {
    sqlx::query("UPDATE sync_cursor SET last_block = ?1 WHERE id = 1")
        .bind(last_block)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Campaigns
// ─────────────────────────────────────────────────────────

pub async fn find_campaign_by_chain_id(
    conn: &mut SqliteConnection,
    blockchain_id: &str,
) -> Result<Option<Campaign>> {
    let sql = format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE blockchain_id = ?1");
    Ok(sqlx::query_as::<_, Campaign>(&sql)
        .bind(blockchain_id)
        .fetch_optional(&mut *conn)
        .await?)
}

pub async fn find_campaign(conn: &mut SqliteConnection, id: i64) -> Result<Option<Campaign>> {
    let sql = format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = ?1");
    Ok(sqlx::query_as::<_, Campaign>(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?)
}

pub async fn list_campaigns(conn: &mut SqliteConnection) -> Result<Vec<Campaign>> {
    let sql = format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns ORDER BY id DESC");
    Ok(sqlx::query_as::<_, Campaign>(&sql)
        .fetch_all(&mut *conn)
        .await?)
}

/// Provision a campaign row ahead of (or without) its chain link.
pub async fn create_campaign(conn: &mut SqliteConnection, new: &NewCampaign) -> Result<Campaign> {
    let sql = format!(
        r#"
        INSERT INTO campaigns (blockchain_id, title, description, target_amount, deadline)
        VALUES (?1, ?2, ?3, ?4, ?5)
        RETURNING {CAMPAIGN_COLUMNS}
        "#
    );
    Ok(sqlx::query_as::<_, Campaign>(&sql)
        .bind(&new.blockchain_id)
        .bind(&new.title)
        .bind(&new.description)
        .bind(new.target_amount)
        .bind(new.deadline)
        .fetch_one(&mut *conn)
        .await?)
}

/// Attach an on-chain id to an existing row. `None` if the row does not exist.
pub async fn link_campaign(
    conn: &mut SqliteConnection,
    id: i64,
    blockchain_id: &str,
) -> Result<Option<Campaign>> {
    let sql = format!(
        "UPDATE campaigns SET blockchain_id = ?2 WHERE id = ?1 RETURNING {CAMPAIGN_COLUMNS}"
    );
    Ok(sqlx::query_as::<_, Campaign>(&sql)
        .bind(id)
        .bind(blockchain_id)
        .fetch_optional(&mut *conn)
        .await?)
}

/// Overwrite the running total with the chain-reported value, unless a fact
/// later in chain order already wrote it. Returns whether the row changed.
pub async fn set_amount_collected(
    conn: &mut SqliteConnection,
    campaign_id: i64,
    amount_collected: f64,
    at: ChainPosition,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE campaigns
        SET amount_collected = ?2, amount_synced_block = ?3, amount_synced_log = ?4
        WHERE id = ?1
          AND (amount_synced_block IS NULL
               OR ?3 > amount_synced_block
               OR (?3 = amount_synced_block AND ?4 >= amount_synced_log))
        "#,
    )
    .bind(campaign_id)
    .bind(amount_collected)
    .bind(i64::try_from(at.block).unwrap_or(i64::MAX))
    .bind(i64::try_from(at.log_index).unwrap_or(i64::MAX))
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Overwrite the contract-derived campaign fields. The total goes through
/// the same ordering guard as donation events.
pub async fn set_campaign_chain_state(
    conn: &mut SqliteConnection,
    campaign_id: i64,
    state: &CampaignChainState,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE campaigns
        SET target_amount = ?2, deadline = ?3, verified = ?4, withdrawn = ?5
        WHERE id = ?1
        "#,
    )
    .bind(campaign_id)
    .bind(state.target)
    .bind(i64::try_from(state.deadline).unwrap_or(i64::MAX))
    .bind(state.verified)
    .bind(state.withdrawn)
    .execute(&mut *conn)
    .await?;

    set_amount_collected(
        conn,
        campaign_id,
        state.amount_collected,
        ChainPosition::end_of_block(state.block),
    )
    .await?;
    Ok(())
}

/// Campaign plus milestones (ascending index) and the `recent` newest donations.
pub async fn load_aggregate(
    conn: &mut SqliteConnection,
    campaign_id: i64,
    recent: i64,
) -> Result<Option<CampaignAggregate>> {
    let Some(campaign) = find_campaign(&mut *conn, campaign_id).await? else {
        return Ok(None);
    };

    let sql = format!(
        "SELECT {MILESTONE_COLUMNS} FROM milestones WHERE campaign_id = ?1 ORDER BY milestone_index ASC"
    );
    let milestones = sqlx::query_as::<_, Milestone>(&sql)
        .bind(campaign_id)
        .fetch_all(&mut *conn)
        .await?;

    let sql = format!(
        "SELECT {DONATION_COLUMNS} FROM donations WHERE campaign_id = ?1 \
         ORDER BY timestamp DESC, id DESC LIMIT ?2"
    );
    let donations = sqlx::query_as::<_, Donation>(&sql)
        .bind(campaign_id)
        .bind(recent)
        .fetch_all(&mut *conn)
        .await?;

    Ok(Some(CampaignAggregate {
        campaign,
        milestones,
        donations,
    }))
}

// ─────────────────────────────────────────────────────────
// Users and donations
// ─────────────────────────────────────────────────────────

/// Create the user for `wallet` if absent; returns its id either way.
pub async fn upsert_user(conn: &mut SqliteConnection, wallet: &str) -> Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO users (wallet) VALUES (?1)
        ON CONFLICT (wallet) DO UPDATE SET wallet = excluded.wallet
        RETURNING id
        "#,
    )
    .bind(wallet)
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

pub async fn find_user(conn: &mut SqliteConnection, wallet: &str) -> Result<Option<User>> {
    Ok(
        sqlx::query_as::<_, User>("SELECT id, wallet, created_at FROM users WHERE wallet = ?1")
            .bind(wallet)
            .fetch_optional(&mut *conn)
            .await?,
    )
}

pub async fn find_donation_by_tx(
    conn: &mut SqliteConnection,
    tx_hash: &str,
) -> Result<Option<Donation>> {
    let sql = format!("SELECT {DONATION_COLUMNS} FROM donations WHERE tx_hash = ?1");
    Ok(sqlx::query_as::<_, Donation>(&sql)
        .bind(tx_hash)
        .fetch_optional(&mut *conn)
        .await?)
}

/// Insert a donation stamped with the current time. A repeated `tx_hash`
/// surfaces as a unique violation.
pub async fn insert_donation(
    conn: &mut SqliteConnection,
    campaign_id: i64,
    user_id: i64,
    donor: &str,
    amount: f64,
    tx_hash: &str,
) -> Result<Donation> {
    let sql = format!(
        r#"
        INSERT INTO donations (campaign_id, user_id, donor, amount, tx_hash, timestamp)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        RETURNING {DONATION_COLUMNS}
        "#
    );
    Ok(sqlx::query_as::<_, Donation>(&sql)
        .bind(campaign_id)
        .bind(user_id)
        .bind(donor)
        .bind(amount)
        .bind(tx_hash)
        .bind(Utc::now().timestamp())
        .fetch_one(&mut *conn)
        .await?)
}

pub async fn donations_by_donor(conn: &mut SqliteConnection, donor: &str) -> Result<Vec<Donation>> {
    let sql = format!(
        "SELECT {DONATION_COLUMNS} FROM donations WHERE donor = ?1 ORDER BY timestamp DESC, id DESC"
    );
    Ok(sqlx::query_as::<_, Donation>(&sql)
        .bind(donor)
        .fetch_all(&mut *conn)
        .await?)
}

// ─────────────────────────────────────────────────────────
// Milestones
// ─────────────────────────────────────────────────────────

pub async fn find_milestone(
    conn: &mut SqliteConnection,
    campaign_id: i64,
    milestone_index: i64,
) -> Result<Option<Milestone>> {
    let sql = format!(
        "SELECT {MILESTONE_COLUMNS} FROM milestones WHERE campaign_id = ?1 AND milestone_index = ?2"
    );
    Ok(sqlx::query_as::<_, Milestone>(&sql)
        .bind(campaign_id)
        .bind(milestone_index)
        .fetch_optional(&mut *conn)
        .await?)
}

/// A repeated `(campaign_id, milestone_index)` surfaces as a unique violation.
pub async fn insert_milestone(
    conn: &mut SqliteConnection,
    campaign_id: i64,
    milestone_index: i64,
    title: &str,
    amount: f64,
    required_approvals: i64,
) -> Result<Milestone> {
    let sql = format!(
        r#"
        INSERT INTO milestones (campaign_id, milestone_index, title, amount, required_approvals)
        VALUES (?1, ?2, ?3, ?4, ?5)
        RETURNING {MILESTONE_COLUMNS}
        "#
    );
    Ok(sqlx::query_as::<_, Milestone>(&sql)
        .bind(campaign_id)
        .bind(milestone_index)
        .bind(title)
        .bind(amount)
        .bind(required_approvals)
        .fetch_one(&mut *conn)
        .await?)
}

/// Record one approver's vote. Returns `false` if that approver was already counted.
pub async fn record_approval(
    conn: &mut SqliteConnection,
    milestone_id: i64,
    approver: &str,
) -> Result<bool> {
    let rows = sqlx::query(
        "INSERT OR IGNORE INTO milestone_approvals (milestone_id, approver) VALUES (?1, ?2)",
    )
    .bind(milestone_id)
    .bind(approver)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

/// Bump the approval count and latch `approved` once the threshold is met.
/// `approved` never goes back to false.
pub async fn increment_approval(conn: &mut SqliteConnection, milestone_id: i64) -> Result<Milestone> {
    let sql = format!(
        r#"
        UPDATE milestones
        SET approval_count = approval_count + 1,
            approved = CASE WHEN approval_count + 1 >= required_approvals THEN 1 ELSE approved END
        WHERE id = ?1
        RETURNING {MILESTONE_COLUMNS}
        "#
    );
    Ok(sqlx::query_as::<_, Milestone>(&sql)
        .bind(milestone_id)
        .fetch_one(&mut *conn)
        .await?)
}

pub async fn set_proof(conn: &mut SqliteConnection, milestone_id: i64, proof_hash: &str) -> Result<()> {
    sqlx::query("UPDATE milestones SET proof_hash = ?2 WHERE id = ?1")
        .bind(milestone_id)
        .bind(proof_hash)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// A withdrawal implies the milestone was approved, whether or not the
/// approval events were seen.
pub async fn mark_funds_released(conn: &mut SqliteConnection, milestone_id: i64) -> Result<()> {
    sqlx::query("UPDATE milestones SET approved = 1, funds_released = 1 WHERE id = ?1")
        .bind(milestone_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Test support
// ─────────────────────────────────────────────────────────

/// Single-connection in-memory database with migrations applied.
#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:").unwrap();
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .unwrap();
    MIGRATOR.run(&pool).await.unwrap();
    pool
}
