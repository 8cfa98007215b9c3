use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use greenspace_backend::{
    create_app,
    detection::{DetectionBackend, DetectionInvoker, DetectionRequest, RawRun},
    image_fetcher::{ImageFetcher, ViewSpec},
    narrative::NarrativeGenerator,
    AnalysisError, AnalysisPipeline, AppState, Coordinate, ImageEncoding, ImagePayload, Stage,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

const PNG_MAGIC: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

#[derive(Default)]
struct StubFetcher {
    calls: AtomicUsize,
    fail_with: Option<u16>,
}

#[async_trait]
impl ImageFetcher for StubFetcher {
    async fn fetch(
        &self,
        coordinate: Coordinate,
        view: ViewSpec,
    ) -> Result<ImagePayload, AnalysisError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = self.fail_with {
            return Err(AnalysisError::RemoteFetch {
                status: Some(status),
                body: "Not Authorized - Invalid Token".to_string(),
            });
        }
        Ok(ImagePayload {
            bytes: PNG_MAGIC.to_vec(),
            encoding: ImageEncoding::Png,
            source_url: format!(
                "stub://{},{},{}",
                coordinate.longitude(),
                coordinate.latitude(),
                view.zoom
            ),
        })
    }
}

struct CannedBackend(RawRun);

#[async_trait]
impl DetectionBackend for CannedBackend {
    async fn run(
        &self,
        _request: &DetectionRequest,
        _cancel: &CancellationToken,
    ) -> Result<RawRun, AnalysisError> {
        Ok(self.0.clone())
    }

    fn name(&self) -> &str {
        "canned"
    }
}

/// Runs until the request is cancelled
struct StalledBackend;

#[async_trait]
impl DetectionBackend for StalledBackend {
    async fn run(
        &self,
        _request: &DetectionRequest,
        cancel: &CancellationToken,
    ) -> Result<RawRun, AnalysisError> {
        cancel.cancelled().await;
        Err(AnalysisError::Cancelled {
            stage: Stage::Detection,
        })
    }

    fn name(&self) -> &str {
        "stalled"
    }
}

fn canned(stdout: &str, stderr: &str, exit_code: i32) -> RawRun {
    RawRun {
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        exit_code,
    }
}

fn app_with(fetcher: Arc<StubFetcher>, run: RawRun, diagnostics: bool) -> Router {
    let pipeline = AnalysisPipeline::new(
        fetcher,
        DetectionInvoker::new(Arc::new(CannedBackend(run))),
        NarrativeGenerator::rule_based(),
    );
    let state = AppState {
        pipeline: Arc::new(pipeline),
        request_timeout: Duration::from_secs(10),
        diagnostics,
    };
    create_app(state, &[])
}

fn app(run: RawRun) -> Router {
    app_with(Arc::new(StubFetcher::default()), run, false)
}

async fn post_json(app: Router, body: Value) -> (StatusCode, Value) {
    post_raw(app, body.to_string()).await
}

async fn post_raw(app: Router, body: String) -> (StatusCode, Value) {
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/analyze")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

const GOOD_OUTPUT: &str =
    "Loading weights...\n{\"tree_cover_percent\": 42.5, \"num_trees\": 7, \"error\": null}\n";

#[tokio::test]
async fn health_check_reports_healthy() {
    let response = app(canned(GOOD_OUTPUT, "", 0))
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn analyze_returns_exact_metrics_and_narrative() {
    let (status, body) = post_json(
        app(canned(GOOD_OUTPUT, "", 0)),
        json!({ "coordinate": { "lat": 42.36, "lng": -71.05 } }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["coordinate"], json!({ "lat": 42.36, "lng": -71.05 }));
    assert_eq!(body["treeCoverPercent"], 42.5);
    assert_eq!(body["treeCount"], 7);
    assert_eq!(body["imageReference"], "stub://-71.05,42.36,18");
    assert_eq!(body["narrative"]["source"], "RULE_BASED");

    let text = body["narrative"]["text"].as_str().unwrap();
    assert!(text.starts_with("Based on the detected tree coverage"));
    // 7 trees: two tier lines plus the density line
    assert_eq!(text.lines().filter(|l| l.starts_with("- ")).count(), 3);
}

#[tokio::test]
async fn analyze_accepts_long_coordinate_names() {
    let (status, body) = post_json(
        app(canned(GOOD_OUTPUT, "", 0)),
        json!({
            "coordinate": { "latitude": 10.0, "longitude": 20.0 },
            "includeNarrative": false
        }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["coordinate"]["lng"], 20.0);
}

#[tokio::test]
async fn out_of_range_latitude_is_rejected_before_fetching() {
    let fetcher = Arc::new(StubFetcher::default());
    let (status, body) = post_json(
        app_with(fetcher.clone(), canned(GOOD_OUTPUT, "", 0), false),
        json!({ "coordinate": { "lat": 200.0, "lng": 0.0 } }),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "VALIDATION_ERROR");
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn missing_coordinate_is_rejected() {
    let (status, body) = post_json(app(canned(GOOD_OUTPUT, "", 0)), json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "VALIDATION_ERROR");

    let (status, _) = post_json(
        app(canned(GOOD_OUTPUT, "", 0)),
        json!({ "coordinate": { "lat": 10.0 } }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unparsable_request_body_is_rejected() {
    let (status, body) =
        post_raw(app(canned(GOOD_OUTPUT, "", 0)), "{\"coordinate\": ".to_string()).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn imagery_failure_maps_to_bad_gateway() {
    let fetcher = Arc::new(StubFetcher {
        fail_with: Some(401),
        ..Default::default()
    });
    let (status, body) = post_json(
        app_with(fetcher, canned(GOOD_OUTPUT, "", 0), false),
        json!({ "coordinate": { "lat": 1.0, "lng": 1.0 } }),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["kind"], "REMOTE_FETCH_ERROR");
    assert!(body["error"].as_str().unwrap().contains("401"));
}

#[tokio::test]
async fn failed_detection_hides_stderr_by_default() {
    let (status, body) = post_json(
        app(canned("", "Traceback: secret path /srv/models", 1)),
        json!({ "coordinate": { "lat": 1.0, "lng": 1.0 } }),
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["kind"], "PROCESS_EXECUTION_ERROR");
    assert!(body.get("detail").is_none());
    assert!(!body.to_string().contains("secret path"));
}

#[tokio::test]
async fn failed_detection_exposes_stderr_with_diagnostics() {
    let (status, body) = post_json(
        app_with(
            Arc::new(StubFetcher::default()),
            canned("", "Traceback: model missing", 2),
            true,
        ),
        json!({ "coordinate": { "lat": 1.0, "lng": 1.0 } }),
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["detail"].as_str().unwrap().contains("model missing"));
}

#[tokio::test]
async fn malformed_and_upstream_outputs_are_server_errors() {
    let cases = [
        ("   \n", "MALFORMED_OUTPUT_ERROR"),
        ("no json here", "MALFORMED_OUTPUT_ERROR"),
        ("{\"tree_cover_percent\": 140, \"num_trees\": 3}", "MALFORMED_OUTPUT_ERROR"),
        ("{\"error\": \"Image decode failed\"}", "UPSTREAM_TOOL_ERROR"),
    ];

    for (stdout, kind) in cases {
        let (status, body) = post_json(
            app(canned(stdout, "", 0)),
            json!({ "coordinate": { "lat": 1.0, "lng": 1.0 } }),
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR, "stdout: {:?}", stdout);
        assert_eq!(body["kind"], kind, "stdout: {:?}", stdout);
    }
}

#[tokio::test]
async fn request_deadline_maps_to_gateway_timeout() {
    let pipeline = AnalysisPipeline::new(
        Arc::new(StubFetcher::default()),
        DetectionInvoker::new(Arc::new(StalledBackend)),
        NarrativeGenerator::rule_based(),
    );
    let app = create_app(
        AppState {
            pipeline: Arc::new(pipeline),
            request_timeout: Duration::from_millis(100),
            diagnostics: true,
        },
        &[],
    );

    let (status, body) = tokio::time::timeout(
        Duration::from_secs(5),
        post_json(app, json!({ "coordinate": { "lat": 1.0, "lng": 1.0 } })),
    )
    .await
    .expect("deadline never fired");

    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body["kind"], "CANCELLED");
    assert_eq!(body["error"], "Analysis cancelled during detection");
    assert!(body.get("detail").is_none());
}
