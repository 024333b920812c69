use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};
use rusqlite::Connection;
use crate::config::{parse_address, Config};
use crate::db::{self, RecordFilter};
use crate::aggregator;
use crate::models::{AggregateSnapshot, InitiatorCount, InitiatorRank, MovingAveragePoint, TransferView};
use chrono::Utc;
use eyre::eyre;
use tracing::{error, info};
use tower_http::cors::{CorsLayer, Any};
use tokio::task;

const DEFAULT_LIMIT: u32 = 10;
const MAX_LIMIT: u32 = 500;

#[derive(Deserialize)]
pub struct TransferQuery {
    pub limit: Option<u32>, // defaults to 10
}

#[derive(Deserialize)]
pub struct MovingAverageQuery {
    pub days: Option<u32>,
}

#[derive(Clone)]
pub struct AppState {
    conn: Arc<Mutex<Connection>>,
    filter: RecordFilter,
    top_initiators: usize,
    moving_average_max_days: u32,
}

impl AppState {
    pub fn new(cfg: &Config, conn: Arc<Mutex<Connection>>) -> Self {
        Self {
            conn,
            filter: RecordFilter::for_pair(&cfg.token_address, &cfg.recipient_address),
            top_initiators: cfg.top_initiators,
            moving_average_max_days: cfg.moving_average_max_days.max(1),
        }
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(eyre::Report),
}

impl From<eyre::Report> for ApiError {
    fn from(e: eyre::Report) -> Self {
        ApiError::Internal(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Internal(e) => {
                error!("API request failed: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(|| async { "Transfer watch API running" }))
        .route("/transfers", get(transfers))
        .route("/transfers/:tx_id", get(transfer))
        .route("/stats", get(stats))
        .route("/stats/initiators", get(top_initiators))
        .route("/stats/initiators/:address", get(initiator))
        .route("/stats/moving-average", get(moving_average))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(cfg: Config, conn: Arc<Mutex<Connection>>) -> eyre::Result<()> {
    let app = router(AppState::new(&cfg, conn));

    let addr = SocketAddr::from(([127, 0, 0, 1], cfg.port));
    info!("API listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

// ---------- DB wrapper (spawn_blocking) ----------

async fn with_db<T, F>(conn: Arc<Mutex<Connection>>, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> eyre::Result<T> + Send + 'static,
{
    let result = task::spawn_blocking(move || {
        let db = conn.lock().map_err(|_| eyre!("database mutex poisoned"))?;
        f(&db)
    })
    .await
    .map_err(|e| eyre!("database task failed: {e}"))?;
    Ok(result?)
}

// ---------- handlers ----------

async fn transfers(
    State(state): State<AppState>,
    Query(q): Query<TransferQuery>,
) -> Result<Json<Vec<TransferView>>, ApiError> {
    let limit = q.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let records = with_db(state.conn, move |db| db::latest_transfers(db, limit)).await?;
    Ok(Json(records.iter().map(TransferView::from).collect()))
}

async fn transfer(
    State(state): State<AppState>,
    Path(tx_id): Path<String>,
) -> Result<Json<TransferView>, ApiError> {
    let lookup = tx_id.to_lowercase();
    let record = with_db(state.conn, move |db| db::get_transfer(db, &lookup)).await?;
    record
        .map(|r| Json(TransferView::from(&r)))
        .ok_or_else(|| ApiError::NotFound(format!("transfer {tx_id} not stored")))
}

async fn stats(State(state): State<AppState>) -> Result<Json<AggregateSnapshot>, ApiError> {
    let snapshot = with_db(state.conn, move |db| {
        aggregator::snapshot(
            db,
            &state.filter,
            state.top_initiators,
            Utc::now().date_naive(),
            None,
        )
    })
    .await?;
    Ok(Json(snapshot))
}

async fn top_initiators(
    State(state): State<AppState>,
    Query(q): Query<TransferQuery>,
) -> Result<Json<Vec<InitiatorCount>>, ApiError> {
    let limit = q
        .limit
        .map(|l| l.clamp(1, MAX_LIMIT) as usize)
        .unwrap_or(state.top_initiators);
    let top = with_db(state.conn, move |db| {
        aggregator::top_initiators(db, &state.filter, limit)
    })
    .await?;
    Ok(Json(top))
}

async fn initiator(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<InitiatorRank>, ApiError> {
    let address = parse_address(&address).map_err(|e| ApiError::BadRequest(format!("{e:#}")))?;
    let lookup = address.clone();
    let rank = with_db(state.conn, move |db| {
        aggregator::initiator_rank(db, &state.filter, &lookup)
    })
    .await?;
    rank.map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no transfers initiated by {address}")))
}

async fn moving_average(
    State(state): State<AppState>,
    Query(q): Query<MovingAverageQuery>,
) -> Result<Json<Vec<MovingAveragePoint>>, ApiError> {
    let days = q
        .days
        .unwrap_or(state.moving_average_max_days)
        .clamp(1, state.moving_average_max_days);
    let series = with_db(state.conn, move |db| {
        let records = db::transfers_in_order(db, &state.filter)?;
        Ok(aggregator::moving_average_series(
            &records,
            Utc::now().date_naive(),
            days,
        ))
    })
    .await?;
    Ok(Json(series))
}
