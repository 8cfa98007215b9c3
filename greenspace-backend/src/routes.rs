use axum::{
    extract::{rejection::JsonRejection, State},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{AnalysisError, ApiError};
use crate::pipeline::RunOptions;
use crate::types::AnalysisResult;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CoordinateInput {
    #[serde(alias = "latitude")]
    pub lat: Option<f64>,
    #[serde(alias = "long", alias = "longitude")]
    pub lng: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeRequest {
    pub coordinate: Option<CoordinateInput>,
    pub include_narrative: Option<bool>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

pub async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub async fn analyze_handler(
    State(state): State<AppState>,
    payload: Result<Json<AnalyzeRequest>, JsonRejection>,
) -> Result<Json<AnalysisResult>, ApiError> {
    let reject = |error: AnalysisError| {
        warn!(
            kind = error.kind(),
            stage = %error.stage(),
            "Analysis request failed: {}",
            error
        );
        ApiError {
            error,
            diagnostics: state.diagnostics,
        }
    };

    let Json(request) = payload.map_err(|e| {
        reject(AnalysisError::Validation(format!(
            "malformed request body: {}",
            e.body_text()
        )))
    })?;

    let (lat, lng) = match request.coordinate {
        Some(CoordinateInput {
            lat: Some(lat),
            lng: Some(lng),
        }) => (lat, lng),
        _ => {
            return Err(reject(AnalysisError::Validation(
                "coordinate with lat and lng is required".to_string(),
            )))
        }
    };

    let options = RunOptions {
        include_narrative: request.include_narrative.unwrap_or(true),
    };

    info!(
        lat,
        lng,
        include_narrative = options.include_narrative,
        "Received analysis request"
    );

    // Cancelled on deadline, or when this handler is dropped (client gone)
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();
    let deadline = {
        let cancel = cancel.clone();
        let timeout = state.request_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    warn!(timeout_secs = timeout.as_secs(), "Analysis deadline reached");
                    cancel.cancel();
                }
                _ = cancel.cancelled() => {}
            }
        })
    };

    let result = state.pipeline.run(lat, lng, options, &cancel).await;
    deadline.abort();

    result.map(Json).map_err(reject)
}
