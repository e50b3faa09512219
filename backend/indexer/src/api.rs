//! Axum REST + WebSocket API over the mirror.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::broadcast::{self, error::RecvError};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::db;
use crate::engine::{Outcome, Reconciler, SkipReason};
use crate::errors::IndexerError;
use crate::events::{ChainEvent, ChainPosition};
use crate::models::{Campaign, CampaignAggregate, Donation, NewCampaign, User};
use crate::normalize::normalize_address;
use crate::notifier::{ChangeNotifier, Notification};
use crate::rpc::{self, ChainClient};

#[derive(Clone)]
pub struct ApiState {
    pub pool: SqlitePool,
    pub reconciler: Arc<Reconciler>,
    pub chain: Arc<dyn ChainClient>,
    pub notifier: ChangeNotifier,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/campaigns", get(list_campaigns).post(create_campaign))
        .route("/campaigns/:chain_id", get(get_campaign))
        .route("/campaigns/:chain_id/resync", post(resync_campaign))
        .route("/campaigns/by-id/:id/chain-id", put(link_campaign))
        .route("/donations", post(record_donation))
        .route("/users/:wallet", get(get_user))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub last_synced_block: i64,
}

#[derive(Serialize)]
pub struct CampaignsResponse {
    pub count: usize,
    pub campaigns: Vec<Campaign>,
}

#[derive(Serialize)]
pub struct UserResponse {
    pub user: User,
    pub donations: Vec<Donation>,
}

#[derive(Serialize)]
pub struct DonationResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub donation: Option<Donation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign: Option<CampaignAggregate>,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Deserialize)]
pub struct LinkRequest {
    pub blockchain_id: String,
}

#[derive(Debug, Deserialize)]
pub struct DonationRequest {
    /// On-chain campaign id.
    pub campaign_id: String,
    pub wallet: String,
    pub amount: f64,
    pub tx_hash: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

fn internal_error(e: IndexerError) -> Response {
    error!("API request failed: {e}");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

/// Chain reads fail as 502 (upstream) unless the input itself was bad.
fn chain_error(e: IndexerError) -> Response {
    match e {
        IndexerError::InvalidInput(msg) => error_response(StatusCode::BAD_REQUEST, msg),
        e => {
            warn!("Chain read failed: {e}");
            error_response(StatusCode::BAD_GATEWAY, format!("chain read failed: {e}"))
        }
    }
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `GET /status`
pub async fn status(State(state): State<Arc<ApiState>>) -> Response {
    let mut conn = match state.pool.acquire().await {
        Ok(conn) => conn,
        Err(e) => return internal_error(e.into()),
    };
    match db::get_last_block(&mut conn).await {
        Ok(last_synced_block) => Json(StatusResponse { last_synced_block }).into_response(),
        Err(e) => internal_error(e),
    }
}

/// `GET /campaigns`
pub async fn list_campaigns(State(state): State<Arc<ApiState>>) -> Response {
    let mut conn = match state.pool.acquire().await {
        Ok(conn) => conn,
        Err(e) => return internal_error(e.into()),
    };
    match db::list_campaigns(&mut conn).await {
        Ok(campaigns) => Json(CampaignsResponse {
            count: campaigns.len(),
            campaigns,
        })
        .into_response(),
        Err(e) => internal_error(e),
    }
}

/// `GET /campaigns/:chain_id`
///
/// The campaign aggregate, as pushed to live subscribers.
pub async fn get_campaign(
    State(state): State<Arc<ApiState>>,
    Path(chain_id): Path<String>,
) -> Response {
    let mut conn = match state.pool.acquire().await {
        Ok(conn) => conn,
        Err(e) => return internal_error(e.into()),
    };
    let campaign = match db::find_campaign_by_chain_id(&mut conn, &chain_id).await {
        Ok(Some(campaign)) => campaign,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "campaign not found"),
        Err(e) => return internal_error(e),
    };
    match db::load_aggregate(&mut conn, campaign.id, state.reconciler.recent_donations()).await {
        Ok(Some(aggregate)) => Json(aggregate).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "campaign not found"),
        Err(e) => internal_error(e),
    }
}

/// `POST /campaigns`
///
/// Provision a campaign row; `blockchain_id` may be omitted and linked later.
pub async fn create_campaign(
    State(state): State<Arc<ApiState>>,
    Json(mut body): Json<NewCampaign>,
) -> Response {
    if body.title.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "title is required");
    }
    body.blockchain_id = body
        .blockchain_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty());

    let mut conn = match state.pool.acquire().await {
        Ok(conn) => conn,
        Err(e) => return internal_error(e.into()),
    };
    match db::create_campaign(&mut conn, &body).await {
        Ok(campaign) => (StatusCode::CREATED, Json(campaign)).into_response(),
        Err(e) if e.is_unique_violation() => {
            error_response(StatusCode::CONFLICT, "blockchain_id already linked")
        }
        Err(e) => internal_error(e),
    }
}

/// `PUT /campaigns/by-id/:id/chain-id`
///
/// Link a pending row (created without `blockchain_id`) to its on-chain id.
pub async fn link_campaign(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
    Json(body): Json<LinkRequest>,
) -> Response {
    let blockchain_id = body.blockchain_id.trim();
    if blockchain_id.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "blockchain_id is required");
    }

    let mut conn = match state.pool.acquire().await {
        Ok(conn) => conn,
        Err(e) => return internal_error(e.into()),
    };
    match db::link_campaign(&mut conn, id, blockchain_id).await {
        Ok(Some(campaign)) => Json(campaign).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "campaign not found"),
        Err(e) if e.is_unique_violation() => {
            error_response(StatusCode::CONFLICT, "blockchain_id already linked")
        }
        Err(e) => internal_error(e),
    }
}

/// `POST /campaigns/:chain_id/resync`
///
/// Re-read the campaign from the contract and overwrite the mirror.
pub async fn resync_campaign(
    State(state): State<Arc<ApiState>>,
    Path(chain_id): Path<String>,
) -> Response {
    let chain_state = match rpc::read_campaign_state(state.chain.as_ref(), &chain_id).await {
        Ok(chain_state) => chain_state,
        Err(e) => return chain_error(e),
    };
    match state.reconciler.resync_campaign(&chain_id, &chain_state).await {
        Ok(Some(aggregate)) => Json(aggregate).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "campaign not found"),
        Err(e) => internal_error(e),
    }
}

/// `POST /donations`
///
/// Record a donation reported by the client right after its transaction was
/// mined. It goes through the same transition as the chain event, keyed by
/// the same transaction hash, with the running total read from the contract.
pub async fn record_donation(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<DonationRequest>,
) -> Response {
    let campaign_chain_id = body.campaign_id.trim().to_string();
    let donor = normalize_address(&body.wallet);
    let tx_hash = normalize_address(&body.tx_hash);
    if campaign_chain_id.is_empty() || donor.is_empty() || tx_hash.is_empty() || body.amount <= 0.0
    {
        return error_response(StatusCode::BAD_REQUEST, "Missing donation details");
    }

    let chain_state = match rpc::read_campaign_state(state.chain.as_ref(), &campaign_chain_id).await
    {
        Ok(chain_state) => chain_state,
        Err(e) => return chain_error(e),
    };

    let event = ChainEvent::DonationReceived {
        campaign_chain_id,
        donor,
        amount: body.amount,
        total_collected: chain_state.amount_collected,
        tx_hash,
    };

    // The total was read at `chain_state.block`, after every log in it.
    let at = ChainPosition::end_of_block(chain_state.block);
    match state.reconciler.process(&event, at).await {
        Ok(Outcome::Applied {
            aggregate,
            donation,
        }) => (
            StatusCode::CREATED,
            Json(DonationResponse {
                status: "recorded",
                donation,
                campaign: Some(aggregate),
            }),
        )
            .into_response(),
        Ok(Outcome::Skipped(SkipReason::DuplicateEvent)) => Json(DonationResponse {
            status: "duplicate",
            donation: None,
            campaign: None,
        })
        .into_response(),
        Ok(Outcome::Skipped(_)) => error_response(StatusCode::NOT_FOUND, "campaign not found"),
        Err(e) => internal_error(e),
    }
}

/// `GET /users/:wallet`
pub async fn get_user(State(state): State<Arc<ApiState>>, Path(wallet): Path<String>) -> Response {
    let wallet = normalize_address(&wallet);
    let mut conn = match state.pool.acquire().await {
        Ok(conn) => conn,
        Err(e) => return internal_error(e.into()),
    };
    let user = match db::find_user(&mut conn, &wallet).await {
        Ok(Some(user)) => user,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "user not found"),
        Err(e) => return internal_error(e),
    };
    match db::donations_by_donor(&mut conn, &wallet).await {
        Ok(donations) => Json(UserResponse { user, donations }).into_response(),
        Err(e) => internal_error(e),
    }
}

// ─────────────────────────────────────────────────────────
// WebSocket
// ─────────────────────────────────────────────────────────

/// `GET /ws`
///
/// Streams every notification as JSON text. No replay: a client that
/// reconnects should re-fetch the campaigns it displays.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ApiState>>,
) -> impl IntoResponse {
    let rx = state.notifier.subscribe();
    ws.on_upgrade(move |socket| stream_notifications(socket, rx))
}

async fn stream_notifications(socket: WebSocket, mut rx: broadcast::Receiver<Notification>) {
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            notification = rx.recv() => match notification {
                Ok(notification) => {
                    let encoded = serde_json::to_string(&notification).map_err(IndexerError::from);
                    let json = match encoded {
                        Ok(json) => json,
                        Err(e) => {
                            error!("Failed to encode notification: {e}");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("WebSocket client lagged, {skipped} notifications dropped");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}
