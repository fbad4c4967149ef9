//! Axum REST API handlers.
//!
//! Public routes (`/health`, `/products`, `/overview`) need no identity.
//! Investor routes take an [`Identity`]; `/admin/*` routes take [`Admin`].
//! Every failure, including undecodable input, is rendered as
//! `{ "error": ..., "code": ..., "retryable": ... }`.

use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        FromRequest, FromRequestParts, Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::auth::{Admin, Identity};
use crate::errors::EngineError;
use crate::types::{
    Batch, BatchStatus, BatchTerms, EarlyExitRequest, Investment, Money, Overview, Payout,
    PayoutPlan, PayoutSummary, ProductKind, Transaction, Wallet,
};
use crate::{allocator, audit, capacity, exit, ledger, payout};

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

pub struct ApiState {
    pub pool: SqlitePool,
    pub gateway_token: String,
}

/// Build the full router with CORS and request tracing applied.
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/products", get(list_products))
        .route("/overview", get(get_overview))
        .route("/wallet", get(get_wallet))
        .route("/wallet/transactions", get(list_transactions))
        .route("/wallet/deposit", post(deposit))
        .route("/wallet/withdraw", post(withdraw))
        .route("/investments", get(list_investments).post(invest))
        .route("/investments/:id/payouts", get(investment_payouts))
        .route("/investments/:id/exit", post(request_exit))
        .route("/exits", get(list_exits))
        .route("/exits/:id/cancel", post(cancel_exit))
        .route("/admin/batches", get(admin_list_batches).post(admin_create_batch))
        .route("/admin/batches/:id", get(admin_get_batch))
        .route("/admin/batches/:id/terms", put(admin_update_terms))
        .route("/admin/batches/:id/transition", post(admin_transition))
        .route(
            "/admin/batches/:id/cycles/:cycle/simulate",
            get(admin_simulate),
        )
        .route("/admin/batches/:id/cycles/:cycle/execute", post(admin_execute))
        .route("/admin/audit", get(admin_audit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Error mapping
// ─────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
    /// Set when the same request may succeed if sent again.
    pub retryable: bool,
}

/// A request the router could not decode (body, path or query string).
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status: rejection.status(),
            code: "invalid_body",
            message: rejection.body_text(),
        }
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self {
            status: rejection.status(),
            code: "invalid_path",
            message: rejection.body_text(),
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self {
            status: rejection.status(),
            code: "invalid_query",
            message: rejection.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
                code: self.code,
                retryable: false,
            }),
        )
            .into_response()
    }
}

/// `Json` whose rejection renders as [`ErrorResponse`].
#[derive(FromRequest)]
#[from_request(via(Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

/// `Path` whose rejection renders as [`ErrorResponse`].
#[derive(FromRequestParts)]
#[from_request(via(Path), rejection(ApiError))]
pub struct ApiPath<T>(pub T);

/// `Query` whose rejection renders as [`ErrorResponse`].
#[derive(FromRequestParts)]
#[from_request(via(Query), rejection(ApiError))]
pub struct ApiQuery<T>(pub T);

impl EngineError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidUnits(_)
            | Self::InvalidAmount(_)
            | Self::InvalidTerms(_)
            | Self::InvalidCycle(_)
            | Self::InvalidIdempotencyKey(_) => StatusCode::BAD_REQUEST,

            Self::BatchNotFound(_) | Self::InvestmentNotFound(_) | Self::ExitNotFound(_) => {
                StatusCode::NOT_FOUND
            }

            Self::BatchNotOpen { .. }
            | Self::InvalidTransition { .. }
            | Self::InvestmentNotActive(_)
            | Self::BatchNotHarvestable { .. }
            | Self::TermsLocked(_)
            | Self::ExitNotPending(_)
            | Self::CapacityExceeded { .. }
            | Self::CapacityUnderflow { .. }
            | Self::IdempotencyConflict(_) => StatusCode::CONFLICT,

            Self::InsufficientBalance { .. } | Self::UnitsExceedHolding { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }

            Self::Database(_) if self.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,

            Self::Overflow(_)
            | Self::Database(_)
            | Self::Migrate(_)
            | Self::Config(_)
            | Self::Corrupt(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(
                code = self.code(),
                retryable = self.is_retryable(),
                "Request failed: {self}"
            );
        }
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
                code: self.code(),
                retryable: self.is_retryable(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, EngineError>;

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ListResponse<T> {
    pub count: usize,
    pub items: Vec<T>,
}

impl<T> From<Vec<T>> for ListResponse<T> {
    fn from(items: Vec<T>) -> Self {
        ListResponse {
            count: items.len(),
            items,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AmountRequest {
    pub amount: Money,
}

#[derive(Debug, Deserialize)]
pub struct InvestRequest {
    pub batch_id: i64,
    pub units: i64,
}

#[derive(Debug, Deserialize)]
pub struct ExitRequestBody {
    pub units: i64,
}

#[derive(Debug, Deserialize)]
pub struct CreateBatchRequest {
    pub product_kind: ProductKind,
    pub unit_price: Money,
    pub target_units: i64,
    #[serde(default)]
    pub feed_price: Money,
    pub mortality_rate: Decimal,
    pub expected_roi: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct TransitionRequest {
    pub status: BatchStatus,
}

#[derive(Debug, Default, Deserialize)]
pub struct RoiQuery {
    pub roi_override: Option<Decimal>,
}

fn idempotency_key(headers: &HeaderMap) -> ApiResult<Option<String>> {
    headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .map(|v| {
            v.to_str()
                .map(str::to_string)
                .map_err(|_| EngineError::InvalidIdempotencyKey("not valid ASCII".into()))
        })
        .transpose()
}

// ─────────────────────────────────────────────────────────
// Public handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `GET /products`
///
/// Batches currently accepting investments.
pub async fn list_products(
    State(state): State<Arc<ApiState>>,
) -> ApiResult<Json<ListResponse<Batch>>> {
    Ok(Json(capacity::list_open_batches(&state.pool).await?.into()))
}

/// `GET /overview`
pub async fn get_overview(State(state): State<Arc<ApiState>>) -> ApiResult<Json<Overview>> {
    Ok(Json(capacity::overview(&state.pool).await?))
}

// ─────────────────────────────────────────────────────────
// Wallet
// ─────────────────────────────────────────────────────────

/// `GET /wallet`
pub async fn get_wallet(
    State(state): State<Arc<ApiState>>,
    who: Identity,
) -> ApiResult<Json<Wallet>> {
    Ok(Json(ledger::wallet(&state.pool, who.owner_id).await?))
}

/// `GET /wallet/transactions`
pub async fn list_transactions(
    State(state): State<Arc<ApiState>>,
    who: Identity,
) -> ApiResult<Json<ListResponse<Transaction>>> {
    Ok(Json(ledger::transactions(&state.pool, who.owner_id).await?.into()))
}

/// `POST /wallet/deposit`
pub async fn deposit(
    State(state): State<Arc<ApiState>>,
    who: Identity,
    headers: HeaderMap,
    ApiJson(body): ApiJson<AmountRequest>,
) -> ApiResult<Json<Transaction>> {
    let key = idempotency_key(&headers)?;
    let entry = ledger::deposit(&state.pool, who.owner_id, body.amount, key.as_deref()).await?;
    Ok(Json(entry))
}

/// `POST /wallet/withdraw`
pub async fn withdraw(
    State(state): State<Arc<ApiState>>,
    who: Identity,
    headers: HeaderMap,
    ApiJson(body): ApiJson<AmountRequest>,
) -> ApiResult<Json<Transaction>> {
    let key = idempotency_key(&headers)?;
    let entry = ledger::withdraw(&state.pool, who.owner_id, body.amount, key.as_deref()).await?;
    Ok(Json(entry))
}

// ─────────────────────────────────────────────────────────
// Investments and exits
// ─────────────────────────────────────────────────────────

/// `POST /investments`
pub async fn invest(
    State(state): State<Arc<ApiState>>,
    who: Identity,
    ApiJson(body): ApiJson<InvestRequest>,
) -> ApiResult<(StatusCode, Json<Investment>)> {
    let investment = allocator::invest(&state.pool, who.owner_id, body.batch_id, body.units).await?;
    Ok((StatusCode::CREATED, Json(investment)))
}

/// `GET /investments`
pub async fn list_investments(
    State(state): State<Arc<ApiState>>,
    who: Identity,
) -> ApiResult<Json<ListResponse<Investment>>> {
    Ok(Json(
        allocator::list_investments(&state.pool, who.owner_id)
            .await?
            .into(),
    ))
}

/// `GET /investments/:id/payouts`
pub async fn investment_payouts(
    State(state): State<Arc<ApiState>>,
    who: Identity,
    ApiPath(investment_id): ApiPath<i64>,
) -> ApiResult<Json<ListResponse<Payout>>> {
    Ok(Json(
        allocator::investment_payouts(&state.pool, who.owner_id, investment_id)
            .await?
            .into(),
    ))
}

/// `POST /investments/:id/exit`
pub async fn request_exit(
    State(state): State<Arc<ApiState>>,
    who: Identity,
    ApiPath(investment_id): ApiPath<i64>,
    ApiJson(body): ApiJson<ExitRequestBody>,
) -> ApiResult<(StatusCode, Json<EarlyExitRequest>)> {
    let request = exit::request_exit(&state.pool, who.owner_id, investment_id, body.units).await?;
    Ok((StatusCode::CREATED, Json(request)))
}

/// `GET /exits`
pub async fn list_exits(
    State(state): State<Arc<ApiState>>,
    who: Identity,
) -> ApiResult<Json<ListResponse<EarlyExitRequest>>> {
    Ok(Json(exit::list_exits(&state.pool, who.owner_id).await?.into()))
}

/// `POST /exits/:id/cancel`
pub async fn cancel_exit(
    State(state): State<Arc<ApiState>>,
    who: Identity,
    ApiPath(request_id): ApiPath<i64>,
) -> ApiResult<Json<EarlyExitRequest>> {
    Ok(Json(
        exit::cancel_exit(&state.pool, who.owner_id, request_id).await?,
    ))
}

// ─────────────────────────────────────────────────────────
// Admin
// ─────────────────────────────────────────────────────────

/// `POST /admin/batches`
pub async fn admin_create_batch(
    State(state): State<Arc<ApiState>>,
    Admin(admin): Admin,
    ApiJson(body): ApiJson<CreateBatchRequest>,
) -> ApiResult<(StatusCode, Json<Batch>)> {
    let terms = BatchTerms {
        unit_price: body.unit_price,
        target_units: body.target_units,
        feed_price: body.feed_price,
        mortality_rate: body.mortality_rate,
        expected_roi: body.expected_roi,
    };
    let batch = capacity::create_batch(&state.pool, body.product_kind, &terms).await?;
    info!(admin = admin.owner_id, batch_id = batch.id, "Batch created via API");
    Ok((StatusCode::CREATED, Json(batch)))
}

/// `GET /admin/batches`
pub async fn admin_list_batches(
    State(state): State<Arc<ApiState>>,
    _admin: Admin,
) -> ApiResult<Json<ListResponse<Batch>>> {
    Ok(Json(capacity::list_batches(&state.pool).await?.into()))
}

/// `GET /admin/batches/:id`
pub async fn admin_get_batch(
    State(state): State<Arc<ApiState>>,
    _admin: Admin,
    ApiPath(batch_id): ApiPath<i64>,
) -> ApiResult<Json<Batch>> {
    Ok(Json(capacity::get_batch(&state.pool, batch_id).await?))
}

/// `PUT /admin/batches/:id/terms`
pub async fn admin_update_terms(
    State(state): State<Arc<ApiState>>,
    _admin: Admin,
    ApiPath(batch_id): ApiPath<i64>,
    ApiJson(terms): ApiJson<BatchTerms>,
) -> ApiResult<Json<Batch>> {
    Ok(Json(
        capacity::update_terms(&state.pool, batch_id, &terms).await?,
    ))
}

/// `POST /admin/batches/:id/transition`
pub async fn admin_transition(
    State(state): State<Arc<ApiState>>,
    _admin: Admin,
    ApiPath(batch_id): ApiPath<i64>,
    ApiJson(body): ApiJson<TransitionRequest>,
) -> ApiResult<Json<Batch>> {
    Ok(Json(
        capacity::transition(&state.pool, batch_id, body.status).await?,
    ))
}

/// `GET /admin/batches/:id/cycles/:cycle/simulate`
pub async fn admin_simulate(
    State(state): State<Arc<ApiState>>,
    _admin: Admin,
    ApiPath((batch_id, cycle_id)): ApiPath<(i64, String)>,
    ApiQuery(query): ApiQuery<RoiQuery>,
) -> ApiResult<Json<PayoutPlan>> {
    Ok(Json(
        payout::simulate(&state.pool, batch_id, &cycle_id, query.roi_override).await?,
    ))
}

/// `POST /admin/batches/:id/cycles/:cycle/execute`
pub async fn admin_execute(
    State(state): State<Arc<ApiState>>,
    Admin(admin): Admin,
    ApiPath((batch_id, cycle_id)): ApiPath<(i64, String)>,
    ApiQuery(query): ApiQuery<RoiQuery>,
) -> ApiResult<Json<PayoutSummary>> {
    let summary = payout::execute(&state.pool, batch_id, &cycle_id, query.roi_override).await?;
    info!(
        admin = admin.owner_id,
        batch_id,
        cycle_id,
        count = summary.count,
        "Payout executed via API"
    );
    Ok(Json(summary))
}

/// `GET /admin/audit`
///
/// Runs the invariant checks immediately and returns the report.
pub async fn admin_audit(
    State(state): State<Arc<ApiState>>,
    _admin: Admin,
) -> ApiResult<Json<audit::AuditReport>> {
    Ok(Json(audit::audit_once(&state.pool).await?))
}
