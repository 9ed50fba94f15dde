//! Axum Handlers for the REST API
//!
//! This module contains the `/realtime` handler, which forwards a text message
//! to the realtime middle tier and returns the grounded answer.
//! It uses `utoipa` doc comments to generate OpenAPI documentation.

use axum::{
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use std::sync::Arc;
use tracing::{error, info, instrument};

use crate::{
    models::{ErrorResponse, RealtimeRequest, RealtimeResponse},
    state::AppState,
};

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(error) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { error })).into_response()
            }
            ApiError::InternalServerError(err) => {
                error!("Processing error: {:?}", err);
                let error = "Internal server error".to_string();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse { error }),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::InternalServerError(err.into())
    }
}

/// Answer a text message through the realtime model, grounded in the search index.
#[utoipa::path(
    post,
    path = "/realtime",
    request_body = RealtimeRequest,
    responses(
        (status = 200, description = "Answer with its grounding sources", body = RealtimeResponse),
        (status = 400, description = "Empty or malformed message", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
#[instrument(name = "realtime", skip_all)]
pub async fn handle_realtime(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RealtimeRequest>, JsonRejection>,
) -> Result<Json<RealtimeResponse>, ApiError> {
    let Json(payload) = payload.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    let message = payload
        .message
        .filter(|message| !message.is_empty())
        .ok_or_else(|| ApiError::BadRequest("Empty message".to_string()))?;

    let answer = state.processor.process_query(&message).await?;
    info!(sources = answer.sources.len(), "Realtime query answered.");

    Ok(Json(RealtimeResponse {
        response: answer.text,
        sources: answer.sources,
        voice: state.processor.voice_choice().to_string(),
    }))
}
