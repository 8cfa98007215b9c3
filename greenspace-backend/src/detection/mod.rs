use async_trait::async_trait;
use base64::Engine;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{excerpt, AnalysisError, DIAGNOSTIC_EXCERPT_BYTES};
use crate::types::{Coordinate, ImagePayload};

mod process;

pub use process::{ImageTransport, ProcessBackend};

/// Input handed to a detection routine
#[derive(Debug, Clone)]
pub struct DetectionRequest {
    /// Base64 (standard alphabet) image bytes
    pub encoded_image: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl DetectionRequest {
    pub fn new(image: &ImagePayload, coordinate: Coordinate) -> Self {
        Self {
            encoded_image: base64::engine::general_purpose::STANDARD.encode(&image.bytes),
            latitude: coordinate.latitude(),
            longitude: coordinate.longitude(),
        }
    }
}

/// Captured streams and exit status of one detection run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRun {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// A run that exited with status 0. Its stdout still has to be extracted.
///
/// Only [`DetectionInvoker::invoke`] builds one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedRun(RawRun);

impl CompletedRun {
    pub fn stdout(&self) -> &str {
        &self.0.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.0.stderr
    }

    pub fn into_raw(self) -> RawRun {
        self.0
    }
}

/// Something that can run the tree detection routine
///
/// Implementations report what the routine printed and how it exited; they
/// only fail when the routine could not run at all or was cancelled.
#[async_trait]
pub trait DetectionBackend: Send + Sync {
    async fn run(
        &self,
        request: &DetectionRequest,
        cancel: &CancellationToken,
    ) -> Result<RawRun, AnalysisError>;

    /// Name for logging
    fn name(&self) -> &str;
}

/// Runs the detection backend and classifies its exit status
#[derive(Clone)]
pub struct DetectionInvoker {
    backend: Arc<dyn DetectionBackend>,
}

impl DetectionInvoker {
    pub fn new(backend: Arc<dyn DetectionBackend>) -> Self {
        Self { backend }
    }

    pub async fn invoke(
        &self,
        image: &ImagePayload,
        coordinate: Coordinate,
        cancel: &CancellationToken,
    ) -> Result<CompletedRun, AnalysisError> {
        let request = DetectionRequest::new(image, coordinate);
        let start = Instant::now();

        info!(
            backend = self.backend.name(),
            encoded_bytes = request.encoded_image.len(),
            "Invoking detection routine"
        );

        let run = self.backend.run(&request, cancel).await?;

        info!(
            backend = self.backend.name(),
            exit_code = run.exit_code,
            stdout_bytes = run.stdout.len(),
            stderr_bytes = run.stderr.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Detection routine finished"
        );

        if run.exit_code != 0 {
            warn!(
                exit_code = run.exit_code,
                "Detection routine failed: {}",
                excerpt(run.stderr.trim(), 512)
            );
            return Err(AnalysisError::ProcessExecution {
                exit_code: run.exit_code,
                stderr: excerpt(&run.stderr, DIAGNOSTIC_EXCERPT_BYTES),
                stdout: excerpt(&run.stdout, DIAGNOSTIC_EXCERPT_BYTES),
            });
        }

        Ok(CompletedRun(run))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ImageEncoding;

    struct ScriptedBackend {
        run: RawRun,
    }

    #[async_trait]
    impl DetectionBackend for ScriptedBackend {
        async fn run(
            &self,
            request: &DetectionRequest,
            _cancel: &CancellationToken,
        ) -> Result<RawRun, AnalysisError> {
            assert_eq!(request.encoded_image, "AQID");
            Ok(self.run.clone())
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn image() -> ImagePayload {
        ImagePayload {
            bytes: vec![1, 2, 3],
            encoding: ImageEncoding::Png,
            source_url: "test://image".to_string(),
        }
    }

    fn invoker(run: RawRun) -> DetectionInvoker {
        DetectionInvoker::new(Arc::new(ScriptedBackend { run }))
    }

    #[tokio::test]
    async fn test_zero_exit_passes_stdout_through() {
        let run = RawRun {
            stdout: "{}".to_string(),
            stderr: "warming up".to_string(),
            exit_code: 0,
        };
        let coordinate = Coordinate::new(10.0, 20.0).unwrap();

        let completed = invoker(run)
            .invoke(&image(), coordinate, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(completed.stdout(), "{}");
        assert_eq!(completed.stderr(), "warming up");
        assert_eq!(completed.into_raw().exit_code, 0);
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_execution_error() {
        let run = RawRun {
            stdout: "{\"tree_cover_percent\": 10, \"num_trees\": 2}".to_string(),
            stderr: "CUDA out of memory".to_string(),
            exit_code: 3,
        };
        let coordinate = Coordinate::new(10.0, 20.0).unwrap();

        match invoker(run)
            .invoke(&image(), coordinate, &CancellationToken::new())
            .await
        {
            Err(AnalysisError::ProcessExecution {
                exit_code,
                stderr,
                stdout,
            }) => {
                assert_eq!(exit_code, 3);
                assert_eq!(stderr, "CUDA out of memory");
                assert!(stdout.contains("tree_cover_percent"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
