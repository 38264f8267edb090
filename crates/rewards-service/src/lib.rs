#![deny(unsafe_code)]

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use rewards_adapters::{HttpPartnerAdapter, MockPartnerAdapter};
use rewards_core::{
    Account, BalanceAudit, Caller, ErrorKind, LedgerStorageConfig, Mission, MissionAward,
    MissionDraft, MissionStatus, MutatorConfig, PointsGrant, PointsTransaction, Redemption,
    RedemptionReceipt, RewardsEngine, RewardsEngineConfig, RewardsError, Role, Voucher,
    VoucherDraft,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Header carrying the upstream-authenticated account id.
pub const CALLER_HEADER: &str = "x-account-id";

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub ledger_storage: LedgerStorageConfig,
    pub redemption_window_days: i64,
    pub mutator_attempts: u32,
    /// HTTP fulfilment endpoint; the mock partner is used when unset.
    pub partner_endpoint: Option<String>,
    pub partner_timeout_ms: u64,
    /// Account provisioned with the admin role at startup.
    pub bootstrap_admin: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            ledger_storage: LedgerStorageConfig::Memory,
            redemption_window_days: 30,
            mutator_attempts: MutatorConfig::default().max_attempts,
            partner_endpoint: None,
            partner_timeout_ms: 5_000,
            bootstrap_admin: None,
        }
    }
}

#[derive(Clone)]
pub struct ServiceState {
    pub engine: Arc<RewardsEngine>,
}

impl ServiceState {
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, ServiceError> {
        let ServiceConfig {
            ledger_storage,
            redemption_window_days,
            mutator_attempts,
            partner_endpoint,
            partner_timeout_ms,
            bootstrap_admin,
        } = config;

        let mut engine_config = RewardsEngineConfig {
            ledger_storage,
            redemption_window_days,
            ..RewardsEngineConfig::default()
        };
        engine_config.mutator.max_attempts = mutator_attempts.max(1);
        engine_config.partner.call_timeout_ms = partner_timeout_ms;

        let engine = RewardsEngine::bootstrap(engine_config).await?;

        match partner_endpoint {
            Some(endpoint) => {
                let adapter = HttpPartnerAdapter::new(
                    "http",
                    endpoint,
                    Duration::from_millis(partner_timeout_ms),
                )?;
                tracing::info!(endpoint = adapter.endpoint(), "using http partner adapter");
                engine.set_fallback_partner(Arc::new(adapter))?;
            }
            None => {
                engine.set_fallback_partner(Arc::new(MockPartnerAdapter::default()))?;
            }
        }

        if let Some(admin_id) = bootstrap_admin {
            let admin = engine.bootstrap_account(&admin_id, Role::Admin).await?;
            if admin.role != Role::Admin {
                tracing::warn!(
                    account_id = %admin.account_id,
                    role = ?admin.role,
                    "bootstrap admin already exists with a different role"
                );
            }
        }

        Ok(Self {
            engine: Arc::new(engine),
        })
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/accounts", post(register_account))
        .route("/v1/accounts/:account_id", get(get_account))
        .route(
            "/v1/accounts/:account_id/transactions",
            get(list_transactions),
        )
        .route("/v1/accounts/:account_id/redemptions", get(list_redemptions))
        .route("/v1/accounts/:account_id/audit", get(audit_account))
        .route("/v1/missions", post(create_mission))
        .route("/v1/missions/:mission_id", get(get_mission))
        .route("/v1/missions/:mission_id/status", post(transition_mission))
        .route("/v1/missions/:mission_id/join", post(join_mission))
        .route("/v1/missions/:mission_id/complete", post(complete_mission))
        .route("/v1/vouchers", post(create_voucher).get(list_vouchers))
        .route("/v1/vouchers/:voucher_id/redeem", post(redeem_voucher))
        .route("/v1/vouchers/:voucher_id/restock", post(restock_voucher))
        .route("/v1/vouchers/:voucher_id/active", post(set_voucher_active))
        .route("/v1/redemptions/:redemption_id", get(get_redemption))
        .route("/v1/redemptions/:redemption_id/use", post(mark_redemption_used))
        .route("/v1/admin/points/award", post(award_points))
        .route("/v1/admin/points/adjust", post(adjust_points))
        .route("/v1/admin/redemptions/sweep", post(sweep_redemptions))
        .route("/v1/admin/redemptions/requeue", post(requeue_redemptions))
        .with_state(state)
}

/// Resolve the caller from the identity header.
pub fn caller_from_headers(headers: &HeaderMap) -> Result<Caller, ApiError> {
    let identity = headers
        .get(CALLER_HEADER)
        .and_then(|value| value.to_str().ok());
    Ok(Caller::from_identity(identity)?)
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("core engine error: {0}")]
    Core(#[from] RewardsError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Core(#[from] RewardsError),
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
        ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
        ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::FailedPrecondition => StatusCode::PRECONDITION_FAILED,
        ErrorKind::AlreadyExists | ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Core(err) => {
                let kind = err.kind();
                if kind == ErrorKind::Internal {
                    tracing::error!(error = %err, "request failed");
                }
                let mut body = serde_json::json!({
                    "error": err.to_string(),
                    "kind": kind.as_str(),
                });
                if let RewardsError::InsufficientPoints {
                    required,
                    available,
                } = err
                {
                    body["required"] = serde_json::json!(required);
                    body["available"] = serde_json::json!(available);
                }
                (status_for(kind), Json(body)).into_response()
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    ledger_backend: &'static str,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "rewards-service",
        ledger_backend: state.engine.backend_label(),
    })
}

#[derive(Debug, Clone, Serialize)]
struct ItemsResponse<T> {
    items: Vec<T>,
}

async fn register_account(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<Account>), ApiError> {
    let caller = caller_from_headers(&headers)?;
    let account = state.engine.register_account(&caller).await?;
    Ok((StatusCode::CREATED, Json(account)))
}

async fn get_account(
    Path(account_id): Path<String>,
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<Account>, ApiError> {
    let caller = caller_from_headers(&headers)?;
    Ok(Json(state.engine.get_account(&caller, &account_id).await?))
}

async fn list_transactions(
    Path(account_id): Path<String>,
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<ItemsResponse<PointsTransaction>>, ApiError> {
    let caller = caller_from_headers(&headers)?;
    Ok(Json(ItemsResponse {
        items: state.engine.list_transactions(&caller, &account_id).await?,
    }))
}

async fn list_redemptions(
    Path(account_id): Path<String>,
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<ItemsResponse<Redemption>>, ApiError> {
    let caller = caller_from_headers(&headers)?;
    Ok(Json(ItemsResponse {
        items: state.engine.list_redemptions(&caller, &account_id).await?,
    }))
}

async fn audit_account(
    Path(account_id): Path<String>,
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<BalanceAudit>, ApiError> {
    let caller = caller_from_headers(&headers)?;
    Ok(Json(state.engine.audit_balance(&caller, &account_id).await?))
}

async fn create_mission(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(draft): Json<MissionDraft>,
) -> Result<(StatusCode, Json<Mission>), ApiError> {
    let caller = caller_from_headers(&headers)?;
    let mission = state.engine.create_mission(&caller, draft).await?;
    Ok((StatusCode::CREATED, Json(mission)))
}

async fn get_mission(
    Path(mission_id): Path<String>,
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<Mission>, ApiError> {
    caller_from_headers(&headers)?;
    Ok(Json(state.engine.get_mission(&mission_id).await?))
}

#[derive(Debug, Clone, Deserialize)]
struct StatusChange {
    status: MissionStatus,
}

async fn transition_mission(
    Path(mission_id): Path<String>,
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(change): Json<StatusChange>,
) -> Result<Json<Mission>, ApiError> {
    let caller = caller_from_headers(&headers)?;
    Ok(Json(
        state
            .engine
            .transition_mission(&caller, &mission_id, change.status)
            .await?,
    ))
}

async fn join_mission(
    Path(mission_id): Path<String>,
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<Mission>, ApiError> {
    let caller = caller_from_headers(&headers)?;
    Ok(Json(state.engine.join_mission(&caller, &mission_id).await?))
}

#[derive(Debug, Clone, Default, Deserialize)]
struct CompletionRequest {
    #[serde(default)]
    verification: Option<serde_json::Value>,
}

async fn complete_mission(
    Path(mission_id): Path<String>,
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<CompletionRequest>,
) -> Result<Json<MissionAward>, ApiError> {
    let caller = caller_from_headers(&headers)?;
    Ok(Json(
        state
            .engine
            .complete_mission(&caller, &mission_id, request.verification)
            .await?,
    ))
}

async fn create_voucher(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(draft): Json<VoucherDraft>,
) -> Result<(StatusCode, Json<Voucher>), ApiError> {
    let caller = caller_from_headers(&headers)?;
    let voucher = state.engine.create_voucher(&caller, draft).await?;
    Ok((StatusCode::CREATED, Json(voucher)))
}

async fn list_vouchers(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<ItemsResponse<Voucher>>, ApiError> {
    caller_from_headers(&headers)?;
    Ok(Json(ItemsResponse {
        items: state.engine.list_vouchers().await?,
    }))
}

async fn redeem_voucher(
    Path(voucher_id): Path<String>,
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<RedemptionReceipt>, ApiError> {
    let caller = caller_from_headers(&headers)?;
    Ok(Json(state.engine.redeem_voucher(&caller, &voucher_id).await?))
}

#[derive(Debug, Clone, Deserialize)]
struct RestockRequest {
    amount: u32,
}

async fn restock_voucher(
    Path(voucher_id): Path<String>,
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<RestockRequest>,
) -> Result<Json<Voucher>, ApiError> {
    let caller = caller_from_headers(&headers)?;
    Ok(Json(
        state
            .engine
            .restock_voucher(&caller, &voucher_id, request.amount)
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
struct ActiveRequest {
    active: bool,
}

async fn set_voucher_active(
    Path(voucher_id): Path<String>,
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<ActiveRequest>,
) -> Result<Json<Voucher>, ApiError> {
    let caller = caller_from_headers(&headers)?;
    Ok(Json(
        state
            .engine
            .set_voucher_active(&caller, &voucher_id, request.active)
            .await?,
    ))
}

async fn get_redemption(
    Path(redemption_id): Path<String>,
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<Redemption>, ApiError> {
    let caller = caller_from_headers(&headers)?;
    Ok(Json(
        state.engine.get_redemption(&caller, &redemption_id).await?,
    ))
}

async fn mark_redemption_used(
    Path(redemption_id): Path<String>,
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<Redemption>, ApiError> {
    let caller = caller_from_headers(&headers)?;
    Ok(Json(
        state
            .engine
            .mark_voucher_used(&caller, &redemption_id)
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
struct AwardRequest {
    account_id: String,
    amount: i64,
    description: String,
}

async fn award_points(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<AwardRequest>,
) -> Result<Json<PointsGrant>, ApiError> {
    let caller = caller_from_headers(&headers)?;
    Ok(Json(
        state
            .engine
            .award_points_manually(
                &caller,
                &request.account_id,
                request.amount,
                &request.description,
            )
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
struct AdjustRequest {
    account_id: String,
    delta: i64,
    reason: String,
}

async fn adjust_points(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<AdjustRequest>,
) -> Result<Json<PointsGrant>, ApiError> {
    let caller = caller_from_headers(&headers)?;
    Ok(Json(
        state
            .engine
            .adjust_points(&caller, &request.account_id, request.delta, &request.reason)
            .await?,
    ))
}

#[derive(Debug, Clone, Serialize)]
struct SweepResponse {
    expired: usize,
}

async fn sweep_redemptions(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<SweepResponse>, ApiError> {
    let caller = caller_from_headers(&headers)?;
    state.engine.require_admin(&caller).await?;
    Ok(Json(SweepResponse {
        expired: state.engine.sweep_expired_redemptions().await?,
    }))
}

#[derive(Debug, Clone, Serialize)]
struct RequeueResponse {
    queued: usize,
}

async fn requeue_redemptions(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<RequeueResponse>, ApiError> {
    let caller = caller_from_headers(&headers)?;
    state.engine.require_admin(&caller).await?;
    Ok(Json(RequeueResponse {
        queued: state.engine.requeue_pending_redemptions().await?,
    }))
}
