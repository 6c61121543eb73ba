use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use clap::Parser;
use medbox_api::{
    parse_calendar_date, ApiError, CompleteFromDeviceRequest, CompleteFromDeviceResult,
    DeleteReminderResult, DeviceEvent, DeviceEventResult, GetDayRequest, MarkTakenRequest,
    MarkTakenResult, MedboxApi, MigrateResult, Operation, OperationOutcome, PutReminderRequest,
    PutReminderResult, RangeRequest, ReconcileFutureRequest, ReconcileFutureResult, SweepResult,
    API_CONTRACT_VERSION,
};
use medbox_core::{DoseRecord, EngineError, Reminder};
use medbox_store_sqlite::SchemaStatus;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

mod config;
mod scheduler;

use config::{ConfigLayer, ServiceConfig};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Debug, Clone)]
struct ServiceState {
    api: MedboxApi,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error_code: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReminderListQuery {
    #[serde(default)]
    medicine_box_id: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "medbox-service")]
#[command(about = "Local HTTP service and scheduler for the dose record lifecycle")]
struct Args {
    /// YAML file with the same keys as the flags below (snake_case).
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    db: Option<PathBuf>,
    #[arg(long)]
    bind: Option<std::net::SocketAddr>,
    #[arg(long)]
    sweep_interval_secs: Option<u64>,
    #[arg(long)]
    horizon_hours: Option<i64>,
    #[arg(long)]
    utc_offset: Option<String>,
    #[arg(long)]
    missed_grace_minutes: Option<i64>,
}

impl Args {
    fn layer(&self) -> ConfigLayer {
        ConfigLayer {
            db: self.db.clone(),
            bind: self.bind,
            sweep_interval_secs: self.sweep_interval_secs,
            horizon_hours: self.horizon_hours,
            utc_offset: self.utc_offset.clone(),
            missed_grace_minutes: self.missed_grace_minutes,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl From<ApiError> for ServiceError {
    fn from(err: ApiError) -> Self {
        let (status, error_code) = match &err {
            ApiError::Engine(EngineError::InvalidRange { .. }) => {
                (StatusCode::BAD_REQUEST, "invalid_range")
            }
            ApiError::Engine(EngineError::MissingParameter(_)) => {
                (StatusCode::BAD_REQUEST, "missing_parameter")
            }
            ApiError::Engine(EngineError::Validation(_)) => {
                (StatusCode::BAD_REQUEST, "validation_failed")
            }
            ApiError::Engine(EngineError::UnknownReminder(_) | EngineError::UnknownRecord(_)) => {
                (StatusCode::NOT_FOUND, "not_found")
            }
            ApiError::Engine(EngineError::StoreUnavailable { .. }) | ApiError::Store(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable")
            }
        };
        if status == StatusCode::SERVICE_UNAVAILABLE {
            tracing::warn!(error = %err, "request failed on store access");
        }
        ServiceError {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error_code,
            error: err.to_string(),
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

type Reply<T> = Result<Json<ServiceEnvelope<T>>, ServiceError>;

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/doses/today", get(doses_today))
        .route("/v1/doses/day/:date", get(doses_day))
        .route("/v1/records/range", post(records_range))
        .route("/v1/records/reconcile-future", post(records_reconcile_future))
        .route("/v1/records/sweep-missed", post(records_sweep_missed))
        .route("/v1/records/:record_id/mark-taken", post(records_mark_taken))
        .route("/v1/device/complete", post(device_complete))
        .route("/v1/device/events", post(device_events))
        .route("/v1/reminders", put(reminders_put).get(reminders_list))
        .route("/v1/reminders/:reminder_id", delete(reminders_delete))
        .route("/v1/ops", post(ops))
        .with_state(state)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let file_layer = match args.config.as_deref() {
        Some(path) => ConfigLayer::from_yaml_file(path)?,
        None => ConfigLayer::default(),
    };
    let config = ServiceConfig::resolve(file_layer.overlay(args.layer()))?;

    let api = MedboxApi::new(config.db.clone()).with_config(config.engine);
    let migrated = api.migrate(false)?;
    tracing::info!(schema_version = ?migrated.after_version, db = %config.db.display(), "dose store ready");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler =
        tokio::spawn(scheduler::run(api.clone(), config.sweep_interval, shutdown_rx.clone()));
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for ctrl-c");
        }
        let _ = shutdown_tx.send(true);
    });

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    tracing::info!(bind = %config.bind, "medbox service listening");
    let mut server_shutdown = shutdown_rx;
    axum::serve(listener, app(ServiceState { api }))
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.wait_for(|stop| *stop).await;
        })
        .await?;

    scheduler.await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn db_schema_version(State(state): State<ServiceState>) -> Reply<SchemaStatus> {
    Ok(Json(envelope(state.api.schema_status()?)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Reply<MigrateResult> {
    Ok(Json(envelope(state.api.migrate(request.dry_run)?)))
}

async fn doses_today(State(state): State<ServiceState>) -> Reply<Vec<DoseRecord>> {
    Ok(Json(envelope(state.api.today()?)))
}

async fn doses_day(
    State(state): State<ServiceState>,
    Path(date): Path<String>,
) -> Reply<Vec<DoseRecord>> {
    let date = parse_calendar_date(&date).map_err(ApiError::from)?;
    Ok(Json(envelope(state.api.get_day(&GetDayRequest { date })?)))
}

async fn records_range(
    State(state): State<ServiceState>,
    Json(request): Json<RangeRequest>,
) -> Reply<Vec<DoseRecord>> {
    Ok(Json(envelope(state.api.get_range(&request)?)))
}

async fn records_reconcile_future(
    State(state): State<ServiceState>,
    Json(request): Json<ReconcileFutureRequest>,
) -> Reply<ReconcileFutureResult> {
    Ok(Json(envelope(state.api.reconcile_future(&request)?)))
}

async fn records_sweep_missed(State(state): State<ServiceState>) -> Reply<SweepResult> {
    Ok(Json(envelope(state.api.sweep_missed()?)))
}

async fn records_mark_taken(
    State(state): State<ServiceState>,
    Path(record_id): Path<String>,
) -> Reply<MarkTakenResult> {
    Ok(Json(envelope(state.api.mark_taken(&MarkTakenRequest { record_id })?)))
}

async fn device_complete(
    State(state): State<ServiceState>,
    Json(request): Json<CompleteFromDeviceRequest>,
) -> Reply<CompleteFromDeviceResult> {
    Ok(Json(envelope(state.api.complete_from_device(&request)?)))
}

async fn device_events(
    State(state): State<ServiceState>,
    Json(event): Json<DeviceEvent>,
) -> Reply<DeviceEventResult> {
    Ok(Json(envelope(state.api.handle_device_event(&event)?)))
}

async fn reminders_put(
    State(state): State<ServiceState>,
    Json(request): Json<PutReminderRequest>,
) -> Reply<PutReminderResult> {
    Ok(Json(envelope(state.api.put_reminder(request)?)))
}

async fn reminders_list(
    State(state): State<ServiceState>,
    Query(query): Query<ReminderListQuery>,
) -> Reply<Vec<Reminder>> {
    Ok(Json(envelope(state.api.list_reminders(&query.medicine_box_id)?)))
}

async fn reminders_delete(
    State(state): State<ServiceState>,
    Path(reminder_id): Path<String>,
) -> Reply<DeleteReminderResult> {
    Ok(Json(envelope(state.api.delete_reminder(&reminder_id)?)))
}

async fn ops(
    State(state): State<ServiceState>,
    Json(operation): Json<Operation>,
) -> Reply<OperationOutcome> {
    Ok(Json(envelope(state.api.dispatch(&operation)?)))
}
