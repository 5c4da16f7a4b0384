//! Axum JSON API: provider webhook, snapshot trigger, hourly diff and today's schedule.

use std::sync::Arc;

use apptsync_core::{Appointment, BusinessHours, HourlyDiff, ProviderAppointment};
use apptsync_provider::{ProviderClient, ProviderError};
use apptsync_sync::{
    AppConfig, ClassifyError, ClassifyOutcome, Classifier, DiffProjector, ReconcileError,
    Reconciler, Schedule, SyncContext, WebhookNotification,
};
use axum::{
    extract::{rejection::FormRejection, Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "apptsync-web";

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone)]
pub struct AppState {
    pub classifier: Classifier,
    pub reconciler: Arc<Reconciler>,
    pub projector: DiffProjector,
    pub schedule: Schedule,
    pub provider: Arc<dyn ProviderClient>,
    pub api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AppointmentQuery {
    pub id: i64,
}

impl AppState {
    pub fn new(ctx: SyncContext, config: &AppConfig, hours: BusinessHours) -> Self {
        Self {
            classifier: Classifier::new(ctx.clone(), config.acuity_calendar_id),
            reconciler: Arc::new(Reconciler::new(
                ctx.clone(),
                config.listing_limit,
                config.listing_today_only,
            )),
            projector: DiffProjector::new(ctx.clone(), hours, config.snapshot_lead()),
            provider: ctx.provider.clone(),
            schedule: Schedule::new(ctx),
            api_key: config.api_key.clone(),
        }
    }
}

pub fn app(state: AppState) -> Router {
    let state = Arc::new(state);
    let protected = Router::new()
        .route("/webhook/appt-changed", post(webhook_handler))
        .route("/webhook/appt_changed", post(webhook_handler))
        .route("/acuity/appointment", get(appointment_handler))
        .route("/acuity/snapshot", get(snapshot_handler).post(snapshot_handler))
        .route("/schedule/diff", get(diff_handler))
        .route("/schedule", get(schedule_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/health", get(health_handler))
        .merge(protected)
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "failed to listen for shutdown signal");
            }
        })
        .await?;
    Ok(())
}

async fn require_api_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    if let Some(expected) = &state.api_key {
        let provided = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok());
        if provided != Some(expected.as_str()) {
            return error_response(StatusCode::UNAUTHORIZED, "Invalid or missing API key");
        }
    }
    next.run(request).await
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    form: Result<Form<WebhookNotification>, FormRejection>,
) -> Response {
    let notification = match form {
        Ok(Form(notification)) => notification,
        Err(rejection) => {
            warn!(error = %rejection, "rejected webhook body");
            return error_response(rejection.status(), &rejection.body_text());
        }
    };
    info!(
        action = %notification.action,
        provider_id = notification.id,
        calendar_id = ?notification.calendar_id,
        "webhook received"
    );
    match state.classifier.handle_notification(&notification).await {
        Ok(ClassifyOutcome::Applied(event)) => {
            Json(json!({"status": "success", "data": event})).into_response()
        }
        Ok(ClassifyOutcome::Passed(reason)) => Json(json!({
            "status": "passed",
            "message": reason.message(),
            "detail": reason,
        }))
        .into_response(),
        Err(err) => {
            let status = match &err {
                ClassifyError::Provider(_) => StatusCode::BAD_GATEWAY,
                ClassifyError::Store(_) | ClassifyError::UnexpectedState(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            };
            error!(provider_id = notification.id, error = %err, "webhook handling failed");
            error_response(status, &err.to_string())
        }
    }
}

async fn snapshot_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.reconciler.reconcile_snapshot().await {
        Ok(summary) => Json(json!({
            "message": "Snapshot saved and appointments reconciled",
            "snapshot_id": summary.snapshot_id,
            "count": summary.total,
            "deleted_count": summary.deleted,
            "created_count": summary.created,
            "updated_count": summary.updated,
            "skipped_count": summary.skipped,
        }))
        .into_response(),
        Err(err) => {
            let status = match &err {
                ReconcileError::Provider(_) => StatusCode::BAD_GATEWAY,
                ReconcileError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            error!(error = %err, "snapshot reconciliation failed");
            error_response(status, &err.to_string())
        }
    }
}

async fn appointment_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AppointmentQuery>,
) -> Result<Json<ProviderAppointment>, Response> {
    state
        .provider
        .fetch_appointment(query.id)
        .await
        .map(Json)
        .map_err(|err| {
            let status = match &err {
                ProviderError::HttpStatus { status: 404, .. } => StatusCode::NOT_FOUND,
                _ => StatusCode::BAD_GATEWAY,
            };
            error!(provider_id = query.id, error = %err, "provider appointment lookup failed");
            error_response(status, &err.to_string())
        })
}

async fn diff_handler(State(state): State<Arc<AppState>>) -> Result<Json<Vec<HourlyDiff>>, Response> {
    state.projector.project_daily_diff().await.map(Json).map_err(|err| {
        error!(error = %err, "diff projection failed");
        error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
    })
}

async fn schedule_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Appointment>>, Response> {
    state.schedule.today().await.map(Json).map_err(|err| {
        error!(error = %err, "loading today's schedule failed");
        error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
    })
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"status": "error", "message": message}))).into_response()
}
