//! Admin HTTP surface.
//!
//! Thin wrappers over the engine: trigger a sweep, inspect pools,
//! reconcile, manage failed jobs. Paid-fee events are ingested on
//! `/events/paid` by the order collaborator.

use crate::accumulator::PaidFeeEvent;
use crate::error::EngineError;
use crate::service::DividendEngine;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::NaiveDate;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

pub fn router(engine: Arc<DividendEngine>) -> Router {
    Router::new()
        .route("/events/paid", post(post_paid_event))
        .route("/admin/sweep", post(post_sweep))
        .route("/admin/pools", get(get_pools))
        .route("/admin/pools/:region/status", get(get_pool_status))
        .route("/admin/reconcile/:pool", get(get_reconcile))
        .route("/admin/failed-jobs", get(get_failed_jobs))
        .route("/admin/failed-jobs/:id/retry", post(post_retry_failed_job))
        .route("/admin/alerts", get(get_alerts))
        .route("/metrics", get(get_metrics))
        .route("/healthz", get(get_healthz))
        .with_state(engine)
}

async fn post_paid_event(
    State(engine): State<Arc<DividendEngine>>,
    Json(event): Json<PaidFeeEvent>,
) -> impl IntoResponse {
    match engine.credit(&event) {
        Ok(Some(pool_id)) => (
            StatusCode::OK,
            Json(json!({"ok": true, "credited": true, "pool_id": pool_id})),
        ),
        Ok(None) => (
            StatusCode::OK,
            Json(json!({"ok": true, "credited": false})),
        ),
        Err(err) => error_response(err),
    }
}

async fn post_sweep(State(engine): State<Arc<DividendEngine>>) -> impl IntoResponse {
    match engine.sweep().await {
        Ok(report) => (StatusCode::OK, Json(json!({"ok": true, "report": report}))),
        Err(err) => error_response(err),
    }
}

async fn get_pools(State(engine): State<Arc<DividendEngine>>) -> impl IntoResponse {
    match engine.store().pools.all() {
        Ok(pools) => (StatusCode::OK, Json(json!({"ok": true, "pools": pools}))),
        Err(err) => error_response(err),
    }
}

async fn get_pool_status(
    State(engine): State<Arc<DividendEngine>>,
    Path(region): Path<String>,
) -> impl IntoResponse {
    match engine.pool_status(&region) {
        Ok(Some(status)) => (StatusCode::OK, Json(json!({"ok": true, "status": status}))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"ok": false, "error": format!("no pool for region {}", region)})),
        ),
        Err(err) => error_response(err),
    }
}

async fn get_reconcile(
    State(engine): State<Arc<DividendEngine>>,
    Path(pool_id): Path<u64>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let date = match params.get("date") {
        Some(raw) => match raw.parse::<NaiveDate>() {
            Ok(date) => Some(date),
            Err(_) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"ok": false, "error": "date must be YYYY-MM-DD"})),
                )
            }
        },
        None => None,
    };
    match engine.monitor.reconcile(pool_id, date) {
        Ok(result) => (StatusCode::OK, Json(json!({"ok": true, "reconciliation": result}))),
        Err(err) => error_response(err),
    }
}

async fn get_failed_jobs(State(engine): State<Arc<DividendEngine>>) -> impl IntoResponse {
    match engine.store().failed_jobs.pending() {
        Ok(jobs) => {
            let jobs: Vec<_> = jobs
                .iter()
                .map(|j| {
                    json!({
                        "id": j.id,
                        "job_type": j.job_type,
                        "error_message": j.error_message,
                        "retry_count": j.retry_count,
                        "created_at": j.created_at,
                    })
                })
                .collect();
            (StatusCode::OK, Json(json!({"ok": true, "failed_jobs": jobs})))
        }
        Err(err) => error_response(err),
    }
}

async fn post_retry_failed_job(
    State(engine): State<Arc<DividendEngine>>,
    Path(job_id): Path<u64>,
) -> impl IntoResponse {
    match engine.retry_failed_job(job_id) {
        Ok(outcome) => (StatusCode::OK, Json(json!({"ok": true, "outcome": outcome}))),
        Err(err) => error_response(err),
    }
}

async fn get_alerts(State(engine): State<Arc<DividendEngine>>) -> impl IntoResponse {
    match engine.monitor.monitor() {
        Ok(alerts) => (StatusCode::OK, Json(json!({"ok": true, "alerts": alerts}))),
        Err(err) => error_response(err),
    }
}

async fn get_metrics() -> impl IntoResponse {
    (
        [(
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderValue::from_static("text/plain; version=0.0.4"),
        )],
        crate::metrics::render(),
    )
}

async fn get_healthz(State(engine): State<Arc<DividendEngine>>) -> impl IntoResponse {
    match engine.store().pools.all() {
        Ok(_) => (StatusCode::OK, Json(json!({"ok": true}))),
        Err(err) => error_response(err),
    }
}

fn error_response(err: EngineError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &err {
        EngineError::Validation(_) => StatusCode::BAD_REQUEST,
        EngineError::AlreadyRunning => StatusCode::CONFLICT,
        EngineError::AlreadyExecuted => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"ok": false, "error": err.to_string()})))
}
