//! Long-running background task that keeps the mirror in sync with the chain.
//!
//! Startup order matters: the live subscription is registered from
//! `head + 1` *before* the catch-up scan covers the window ending at `head`,
//! so no block falls between the two. Both feed the same reconciler, one
//! event at a time.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db;
use crate::engine::Reconciler;
use crate::errors::Result;
use crate::normalize;
use crate::rpc::{self, ChainClient, LogBatch};
use crate::scanner;

pub struct IndexerState {
    pub chain: Arc<dyn ChainClient>,
    pub reconciler: Arc<Reconciler>,
    pub poll_interval: Duration,
    pub catch_up_window: u64,
}

/// Run the sync loop until `cancel` fires.
///
/// If the chain head cannot be read at startup the task logs and returns:
/// blockchain sync is optional and the API keeps serving.
pub async fn run(state: Arc<IndexerState>, cancel: CancellationToken) {
    info!("Indexer starting");

    let head = match state.chain.block_number().await {
        Ok(head) => head,
        Err(e) => {
            error!("Could not read chain head, blockchain sync disabled: {e}");
            return;
        }
    };

    let mut live = rpc::subscribe(
        state.chain.clone(),
        head + 1,
        state.poll_interval,
        cancel.clone(),
    );

    let report = scanner::catch_up(
        state.chain.as_ref(),
        &state.reconciler,
        head,
        state.catch_up_window,
    )
    .await;
    if !report.failed_kinds.is_empty() {
        warn!(
            "Catch-up incomplete for {:?}; continuing with live events only",
            report.failed_kinds
        );
    }
    save_cursor(&state.reconciler, head).await;

    info!("Blockchain event listener active from block {}", head + 1);

    loop {
        let batch = tokio::select! {
            _ = cancel.cancelled() => break,
            batch = live.recv() => match batch {
                Some(batch) => batch,
                None => break,
            },
        };
        process_batch(&state.reconciler, &batch).await;
    }

    info!("Indexer stopped");
}

/// Reconcile one live batch in order, then advance the persisted cursor.
pub async fn process_batch(reconciler: &Reconciler, batch: &LogBatch) {
    let normalized = normalize::normalize_logs(&batch.logs);
    for log in &normalized {
        reconciler.handle(log).await;
    }

    if !batch.logs.is_empty() {
        info!(
            "Blocks {}..={}: {} raw logs, {} reconciled",
            batch.from_block,
            batch.to_block,
            batch.logs.len(),
            normalized.len()
        );
    } else {
        debug!("Blocks {}..={}: no logs", batch.from_block, batch.to_block);
    }

    save_cursor(reconciler, batch.to_block).await;
}

async fn save_cursor(reconciler: &Reconciler, block: u64) {
    if let Err(e) = persist_cursor(reconciler, block).await {
        error!("Failed to persist sync cursor at block {block}: {e}");
    }
}

async fn persist_cursor(reconciler: &Reconciler, block: u64) -> Result<()> {
    let mut conn = reconciler.pool().acquire().await?;
    db::save_last_block(&mut conn, block as i64).await
}
