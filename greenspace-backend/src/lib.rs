use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use vision_narrator::NarrativeClient;

pub mod archive;
pub mod config;
pub mod detection;
pub mod error;
pub mod image_fetcher;
pub mod narrative;
pub mod pipeline;
pub mod result_extractor;
pub mod routes;
pub mod types;

pub use config::AppConfig;
pub use error::{AnalysisError, MalformedReason, Stage};
pub use pipeline::{AnalysisPipeline, RunOptions};
pub use types::{AnalysisResult, Coordinate, DetectionOutcome, ImageEncoding, ImagePayload};

use archive::DirectoryArchive;
use detection::{DetectionInvoker, ProcessBackend};
use image_fetcher::MapboxImageFetcher;
use narrative::{NarrativeGenerator, NarrativeStrategy};

/// Shared, read-only state handed to every request
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<AnalysisPipeline>,
    pub request_timeout: Duration,
    pub diagnostics: bool,
}

/// Wire the production collaborators from configuration
pub fn build_state(config: &AppConfig) -> anyhow::Result<AppState> {
    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()?;

    let fetcher = MapboxImageFetcher::new(
        http.clone(),
        config.imagery.base_url.clone(),
        config.imagery.access_token.clone(),
    );

    let mut backend = ProcessBackend::new(config.detector.program.clone())
        .with_args(config.detector.args.clone())
        .with_transport(config.detector.transport)
        .with_kill_grace(config.detector.kill_grace);
    if let Some(dir) = &config.detector.working_dir {
        backend = backend.with_working_dir(dir.clone());
    }

    let narrator = match (config.narrative.strategy, &config.narrative.api_key) {
        (NarrativeStrategy::LanguageModel, Some(api_key)) => {
            let client = NarrativeClient::new(api_key.clone(), Some(config.narrative.model.clone()))
                .with_max_tokens(config.narrative.max_tokens)
                .with_http_client(http);
            NarrativeGenerator::language_model(Arc::new(client), config.narrative.on_failure)
                .with_image(config.narrative.include_image)
        }
        _ => NarrativeGenerator::rule_based(),
    };

    info!(
        detector = %config.detector.program,
        narrative = ?narrator.strategy(),
        on_failure = ?config.narrative.on_failure,
        archive = config.archive_dir.is_some(),
        "Analysis pipeline configured"
    );

    let mut pipeline = AnalysisPipeline::new(
        Arc::new(fetcher),
        DetectionInvoker::new(Arc::new(backend)),
        narrator,
    )
    .with_view(config.imagery.view);
    if let Some(dir) = &config.archive_dir {
        pipeline = pipeline.with_archive(Arc::new(DirectoryArchive::new(dir.clone())));
    }

    Ok(AppState {
        pipeline: Arc::new(pipeline),
        request_timeout: config.request_timeout,
        diagnostics: config.diagnostics,
    })
}

/// Create the Axum app with all routes and middleware
pub fn create_app(state: AppState, allowed_origins: &[String]) -> Router {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();

    let cors = if origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::CONTENT_TYPE])
    } else {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::CONTENT_TYPE])
    };

    Router::new()
        .route("/health", get(routes::health_check))
        .route("/analyze", post(routes::analyze_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(DefaultBodyLimit::max(64 * 1024))
                .layer(cors),
        )
        .with_state(state)
}
