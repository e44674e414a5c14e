// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of plunder

//! The operational HTTP surface: collector statistics, a force-flush
//! trigger and the endpoint operators use to push a new shared
//! configuration.

use crate::collector::{CollectorError, CollectorStats, FlagCollector};
use crate::processing::ProcessingManager;
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use color_eyre::eyre::{Context, Result};
use plunder_common::models::SharedConfig;
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

struct AppState {
    collector: Arc<FlagCollector>,
    manager: Arc<ProcessingManager>,
}

pub async fn serve(
    listener: TcpListener,
    collector: Arc<FlagCollector>,
    manager: Arc<ProcessingManager>,
    cancellation_token: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr().context("listener has no address")?;
    info!("operational surface listening on {addr:?}");

    let state = AppState { collector, manager };
    let app = Router::new()
        .route("/stats", get(stats))
        .route("/flush", post(flush))
        .route("/config", post(apply_config))
        .with_state(Arc::new(state));

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            cancellation_token.cancelled().await;
        })
        .await
        .context("http server error")?;

    Ok(())
}

#[derive(Serialize)]
struct StatsResponse {
    running: bool,
    buffer_size: usize,
    efficiency: f64,
    #[serde(flatten)]
    stats: CollectorStats,
}

async fn stats(state: State<Arc<AppState>>) -> Json<StatsResponse> {
    let stats = state.collector.stats();
    Json(StatsResponse {
        running: state.collector.is_running(),
        buffer_size: state.collector.buffer_size(),
        efficiency: stats.efficiency(),
        stats,
    })
}

#[derive(Serialize)]
struct FlushResponse {
    buffer_before: usize,
    buffer_after: usize,
    flushed: usize,
}

async fn flush(state: State<Arc<AppState>>) -> Result<Json<FlushResponse>, AppError> {
    let buffer_before = state.collector.buffer_size();
    let flushed = state.collector.flush().await?;
    Ok(Json(FlushResponse {
        buffer_before,
        buffer_after: state.collector.buffer_size(),
        flushed,
    }))
}

async fn apply_config(
    state: State<Arc<AppState>>,
    AppJson(config): AppJson<SharedConfig>,
) -> StatusCode {
    info!("applying new shared configuration");
    state.manager.apply(config);
    StatusCode::NO_CONTENT
}

#[derive(thiserror::Error, Debug)]
enum AppError {
    #[error("flush failed")]
    Collector(#[from] CollectorError),
    #[error("{0}")]
    JsonRejection(#[from] JsonRejection),
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Collector(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::JsonRejection(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorBody {
            error: String,
        }
        let mut res = Json(ErrorBody {
            error: self.to_string(),
        })
        .into_response();
        *res.status_mut() = self.status_code();
        res
    }
}

// Wraps `axum::Json` so rejections are reported in the same error format
// as everything else instead of axum's plain-text default.
#[derive(FromRequest)]
#[from_request(via(Json), rejection(AppError))]
struct AppJson<T>(T);
