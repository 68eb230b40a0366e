// Carbon Ledger - Web Server
// JSON API over the ledger, catalog and optimizer

use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use carbon_ledger::{
    optimizer::new_settlement_reference, plan_neutralization, settle_plan,
    AllocationPlan, BalanceStatus, Catalog, Ledger, LedgerConfig, LedgerError, NewEmission,
    ProviderOffering,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Shared application state
#[derive(Clone)]
struct AppState {
    ledger: Arc<Ledger>,
    catalog: Arc<Catalog>,
    default_budget_usd: f64,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<&'static str>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            kind: None,
        }
    }
}

/// Every error kind gets its own status so clients can show a specific message
fn error_response(err: LedgerError) -> Response {
    let status = match &err {
        LedgerError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        LedgerError::CatalogUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        LedgerError::CommitFailure { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let data = match &err {
        LedgerError::Validation(errors) => Some(serde_json::json!({ "errors": errors })),
        LedgerError::CommitFailure { failures, plan } => {
            Some(serde_json::json!({ "failures": failures, "plan": plan }))
        }
        _ => None,
    };

    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("request failed: {}", err);
    }

    let body = ApiResponse {
        success: false,
        data,
        error: Some(err.to_string()),
        kind: Some(err.kind()),
    };
    (status, Json(body)).into_response()
}

fn respond<T: Serialize>(result: Result<T, LedgerError>) -> Response {
    match result {
        Ok(data) => (StatusCode::OK, Json(ApiResponse::ok(data))).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BalanceResponse {
    balance_kg: f64,
    debt_kg: f64,
    status: BalanceStatus,
}

#[derive(Deserialize)]
struct ActivityQuery {
    limit: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AllocateRequest {
    /// Defaults to the current debt
    target_kg: Option<f64>,
    budget_usd: Option<f64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckoutRequest {
    plan: AllocationPlan,
    settlement_reference: Option<String>,
    certificate_ref: Option<String>,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// GET /api/balance
async fn get_balance(State(state): State<AppState>) -> Response {
    let balance_kg = state.ledger.balance();
    respond(Ok(BalanceResponse {
        balance_kg,
        debt_kg: balance_kg.max(0.0),
        status: BalanceStatus::from_balance(balance_kg),
    }))
}

/// GET /api/summary
async fn get_summary(State(state): State<AppState>) -> Response {
    respond(Ok(state.ledger.summary()))
}

/// GET /api/activity?limit=N
async fn get_activity(State(state): State<AppState>, Query(query): Query<ActivityQuery>) -> Response {
    respond(Ok(state.ledger.activity(query.limit)))
}

/// GET /api/catalog - offerings in allocation order
async fn get_catalog(State(state): State<AppState>) -> Response {
    respond(Ok(state.catalog.offerings()))
}

/// POST /api/catalog - swap in a pricing-feed refresh
async fn replace_catalog(
    State(state): State<AppState>,
    Json(offerings): Json<Vec<ProviderOffering>>,
) -> Response {
    respond(state.catalog.replace(offerings).map(|_| state.catalog.offerings()))
}

/// POST /api/emissions
async fn post_emission(State(state): State<AppState>, Json(draft): Json<NewEmission>) -> Response {
    respond(state.ledger.add_emission(draft))
}

/// POST /api/allocate - preview a plan, nothing is bought
async fn post_allocate(State(state): State<AppState>, Json(req): Json<AllocateRequest>) -> Response {
    let target = req.target_kg.unwrap_or_else(|| state.ledger.debt_kg());
    let budget = req.budget_usd.unwrap_or(state.default_budget_usd);
    respond(plan_neutralization(&state.catalog, target, budget))
}

/// POST /api/checkout - commit a reviewed plan at current catalog prices
async fn post_checkout(State(state): State<AppState>, Json(req): Json<CheckoutRequest>) -> Response {
    let reference = req.settlement_reference.unwrap_or_else(new_settlement_reference);
    respond(settle_plan(
        &state.ledger,
        &state.catalog,
        &req.plan,
        &reference,
        req.certificate_ref.as_deref(),
    ))
}

// ============================================================================
// Main Server
// ============================================================================

fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "carbon_ledger=info,carbon_server=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = LedgerConfig::load();
    let db_path = config.database_path();
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let ledger = Ledger::open(&db_path)
        .with_context(|| format!("Failed to open ledger at {}", db_path.display()))?;
    let catalog = config.catalog().context("Failed to load catalog")?;
    tracing::info!(path = %db_path.display(), records = ledger.len(), offerings = catalog.len(), "ledger opened");

    let state = AppState {
        ledger: Arc::new(ledger),
        catalog: Arc::new(catalog),
        default_budget_usd: config.default_budget_usd(),
    };

    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/balance", get(get_balance))
        .route("/summary", get(get_summary))
        .route("/activity", get(get_activity))
        .route("/catalog", get(get_catalog).post(replace_catalog))
        .route("/emissions", axum::routing::post(post_emission))
        .route("/allocate", axum::routing::post(post_allocate))
        .route("/checkout", axum::routing::post(post_checkout))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive());

    let addr = config.server_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    tracing::info!("server running on http://{}", addr);

    axum::serve(listener, app).await.context("Server stopped")?;
    Ok(())
}
