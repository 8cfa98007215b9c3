use async_trait::async_trait;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vision_narrator::{
    rule_based_narrative, ImageAttachment, Narrative, NarrativeClient, NarrativeSource,
    TreeMetrics,
};

use crate::error::{AnalysisError, Stage};
use crate::types::{DetectionOutcome, ImagePayload};

/// External text generation used by the language-model strategy
#[async_trait]
pub trait NarrativeService: Send + Sync {
    async fn describe(
        &self,
        metrics: &TreeMetrics,
        image: Option<ImageAttachment<'_>>,
    ) -> Result<String, AnalysisError>;
}

#[async_trait]
impl NarrativeService for NarrativeClient {
    async fn describe(
        &self,
        metrics: &TreeMetrics,
        image: Option<ImageAttachment<'_>>,
    ) -> Result<String, AnalysisError> {
        NarrativeClient::describe(self, metrics, image)
            .await
            .map_err(|e| AnalysisError::NarrativeService {
                status: e.status(),
                message: e.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NarrativeStrategy {
    LanguageModel,
    RuleBased,
}

impl FromStr for NarrativeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "language_model" | "llm" => Ok(Self::LanguageModel),
            "rule_based" | "rules" => Ok(Self::RuleBased),
            other => Err(format!("unknown narrative strategy `{}`", other)),
        }
    }
}

/// What to do when the narrative service fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Answer with the rule-based narrative instead
    #[default]
    Degrade,
    /// Fail the whole request
    Fail,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "degrade" => Ok(Self::Degrade),
            "fail" => Ok(Self::Fail),
            other => Err(format!("unknown narrative failure policy `{}`", other)),
        }
    }
}

pub struct NarrativeGenerator {
    strategy: NarrativeStrategy,
    on_failure: FailurePolicy,
    include_image: bool,
    service: Option<Arc<dyn NarrativeService>>,
}

impl NarrativeGenerator {
    pub fn rule_based() -> Self {
        Self {
            strategy: NarrativeStrategy::RuleBased,
            on_failure: FailurePolicy::Degrade,
            include_image: false,
            service: None,
        }
    }

    pub fn language_model(service: Arc<dyn NarrativeService>, on_failure: FailurePolicy) -> Self {
        Self {
            strategy: NarrativeStrategy::LanguageModel,
            on_failure,
            include_image: true,
            service: Some(service),
        }
    }

    /// Send the satellite image along with the numbers
    pub fn with_image(mut self, include_image: bool) -> Self {
        self.include_image = include_image;
        self
    }

    pub fn strategy(&self) -> NarrativeStrategy {
        self.strategy
    }

    /// Narrative for a detection result.
    ///
    /// `use_language_model` lets a single request opt out of the service.
    pub async fn narrate(
        &self,
        outcome: &DetectionOutcome,
        image: &ImagePayload,
        use_language_model: bool,
        cancel: &CancellationToken,
    ) -> Result<Narrative, AnalysisError> {
        let metrics = outcome.metrics();

        let service = match (&self.service, self.strategy, use_language_model) {
            (Some(service), NarrativeStrategy::LanguageModel, true) => service,
            _ => return Ok(rule_based_narrative(&metrics)),
        };

        let attachment = self.include_image.then(|| ImageAttachment {
            bytes: &image.bytes,
            mime: image.encoding.mime(),
        });

        let start = Instant::now();
        let described = tokio::select! {
            described = service.describe(&metrics, attachment) => described,
            _ = cancel.cancelled() => {
                return Err(AnalysisError::Cancelled { stage: Stage::Narrative });
            }
        };

        match described {
            Ok(text) => {
                info!(
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Language model narrative generated"
                );
                Ok(Narrative {
                    text,
                    source: NarrativeSource::LanguageModel,
                })
            }
            Err(e) if self.on_failure == FailurePolicy::Degrade => {
                warn!("Narrative service failed, using rule-based narrative: {}", e);
                Ok(rule_based_narrative(&metrics))
            }
            Err(e) => Err(e),
        }
    }
}
