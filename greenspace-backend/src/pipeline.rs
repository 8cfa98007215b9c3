use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::archive::{AnalysisArchive, ArchiveRecord};
use crate::detection::DetectionInvoker;
use crate::error::{AnalysisError, Stage};
use crate::image_fetcher::{ImageFetcher, ViewSpec};
use crate::narrative::NarrativeGenerator;
use crate::result_extractor;
use crate::types::{AnalysisResult, Coordinate, DetectionOutcome};

/// Per-request switches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Allow the language model narrative for this request
    pub include_narrative: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            include_narrative: true,
        }
    }
}

/// Runs fetch → detect → extract → narrate for one coordinate
pub struct AnalysisPipeline {
    fetcher: Arc<dyn ImageFetcher>,
    view: ViewSpec,
    invoker: DetectionInvoker,
    narrator: NarrativeGenerator,
    archive: Option<Arc<dyn AnalysisArchive>>,
}

impl AnalysisPipeline {
    pub fn new(
        fetcher: Arc<dyn ImageFetcher>,
        invoker: DetectionInvoker,
        narrator: NarrativeGenerator,
    ) -> Self {
        Self {
            fetcher,
            view: ViewSpec::default(),
            invoker,
            narrator,
            archive: None,
        }
    }

    pub fn with_view(mut self, view: ViewSpec) -> Self {
        self.view = view;
        self
    }

    pub fn with_archive(mut self, archive: Arc<dyn AnalysisArchive>) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Analyze one location. Either every stage succeeds or the first
    /// failure is returned unchanged; the only recovery is the narrative
    /// fallback configured on the [`NarrativeGenerator`].
    pub async fn run(
        &self,
        latitude: f64,
        longitude: f64,
        options: RunOptions,
        cancel: &CancellationToken,
    ) -> Result<AnalysisResult, AnalysisError> {
        let coordinate = Coordinate::new(latitude, longitude)?;
        let start = Instant::now();

        info!(
            lat = coordinate.latitude(),
            lng = coordinate.longitude(),
            "Starting analysis"
        );

        let image = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(AnalysisError::Cancelled { stage: Stage::ImageFetch });
            }
            fetched = self.fetcher.fetch(coordinate, self.view) => fetched?,
        };

        let run = self.invoker.invoke(&image, coordinate, cancel).await?;

        let payload = result_extractor::extract(run.stdout()).map_err(|e| {
            warn!(kind = e.kind(), "Rejected detection output: {}", e);
            e
        })?;
        let outcome = DetectionOutcome::new(payload, run);

        info!(
            tree_cover_percent = outcome.tree_cover_percent,
            tree_count = outcome.tree_count,
            "Detection result extracted"
        );

        let narrative = self
            .narrator
            .narrate(&outcome, &image, options.include_narrative, cancel)
            .await?;

        let result = AnalysisResult {
            coordinate,
            tree_cover_percent: outcome.tree_cover_percent,
            tree_count: outcome.tree_count,
            narrative,
            image_reference: image.source_url,
            air_quality: outcome.air_quality,
        };

        info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            narrative_source = ?result.narrative.source,
            "Analysis complete"
        );

        if let Some(archive) = &self.archive {
            let archive = Arc::clone(archive);
            let record = ArchiveRecord::new(result.clone(), image.encoding);
            let bytes = image.bytes;
            tokio::spawn(async move {
                let id = record.id;
                match archive.store(record, bytes).await {
                    Ok(()) => info!(%id, "Analysis archived"),
                    Err(e) => warn!(%id, "Failed to archive analysis: {:#}", e),
                }
            });
        }

        Ok(result)
    }
}
