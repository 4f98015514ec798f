use axum::{
    Json,
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;

use crate::api::{ApiError, AppState};
use crate::engine::{
    AddObservationsRequest, AddObservationsResponse, CreateRelationshipRequest,
    CreateRelationshipResponse, EngineStats, StoreRequest, StoreResponse,
};
use crate::error::EideticError;
use crate::memory::consolidation::{ConsolidationReport, CycleKind};
use crate::memory::patterns::{PatternRequest, PatternResponse};
use crate::memory::recall::{RecallRequest, RecallResponse};

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// Health check endpoint - returns JSON status
pub async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

pub async fn store_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StoreRequest>,
) -> ApiResult<StoreResponse> {
    Ok(Json(state.engine.store(request).await?))
}

pub async fn recall_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RecallRequest>,
) -> ApiResult<RecallResponse> {
    Ok(Json(state.engine.recall(request).await?))
}

pub async fn observations_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AddObservationsRequest>,
) -> ApiResult<AddObservationsResponse> {
    Ok(Json(state.engine.add_observations(request).await?))
}

pub async fn relationships_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateRelationshipRequest>,
) -> ApiResult<CreateRelationshipResponse> {
    Ok(Json(state.engine.create_relationship(request).await?))
}

pub async fn patterns_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PatternRequest>,
) -> ApiResult<PatternResponse> {
    Ok(Json(state.engine.find_patterns(request).await?))
}

pub async fn stats_handler(State(state): State<Arc<AppState>>) -> ApiResult<EngineStats> {
    Ok(Json(state.engine.get_stats().await?))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConsolidateResponse {
    /// A cycle of this kind was already running; nothing was done
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<ConsolidationReport>,
}

pub async fn consolidate_handler(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
) -> ApiResult<ConsolidateResponse> {
    let kind: CycleKind = kind.parse()?;
    let report = state.engine.consolidate(kind).await?;
    Ok(Json(ConsolidateResponse {
        skipped: report.is_none(),
        report,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RebuildResponse {
    pub indexed: usize,
}

pub async fn rebuild_index_handler(
    State(state): State<Arc<AppState>>,
) -> ApiResult<RebuildResponse> {
    let indexed = state.engine.rebuild_vector_index().await?;
    Ok(Json(RebuildResponse { indexed }))
}

pub async fn events_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Sse<impl futures::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let events = state
        .engine
        .events()
        .ok_or_else(|| EideticError::NotFound("event log is disabled".to_string()))?;

    let rx = events.subscribe();
    // Ends when the engine shuts down
    let mut shutdown = state.engine.shutdown_signal();
    let stopped = async move {
        loop {
            let stop = *shutdown.borrow_and_update();
            if stop || shutdown.changed().await.is_err() {
                break;
            }
        }
    };

    let stream = BroadcastStream::new(rx)
        .filter_map(|result| async move {
            match result {
                Ok(event) => {
                    let json = serde_json::to_string(&event).ok()?;
                    Some(Ok(Event::default().event(event.type_name()).data(json)))
                }
                Err(_) => None,
            }
        })
        .take_until(stopped);

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
