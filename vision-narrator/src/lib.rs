use base64::{engine::general_purpose, Engine as _};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub mod rules;

pub use rules::rule_based_narrative;

const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_MODEL: &str = "gpt-4o";
const DEFAULT_MAX_TOKENS: u32 = 600;

/// Fixed instruction sent ahead of every narrative request
pub const SYSTEM_PROMPT: &str =
    "Analyze this satellite image and provide insights about the green space and tree coverage.";

/// Numeric detection result a narrative is written about
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TreeMetrics {
    pub tree_cover_percent: f64,
    pub tree_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NarrativeSource {
    LanguageModel,
    RuleBased,
}

/// Human-readable summary of a detection result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Narrative {
    pub text: String,
    pub source: NarrativeSource,
}

/// Image sent alongside the numeric summary
#[derive(Debug, Clone, Copy)]
pub struct ImageAttachment<'a> {
    pub bytes: &'a [u8],
    /// MIME type, e.g. `image/png`
    pub mime: &'a str,
}

impl ImageAttachment<'_> {
    pub fn to_data_url(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.mime,
            general_purpose::STANDARD.encode(self.bytes)
        )
    }
}

#[derive(Debug, Error)]
pub enum NarratorError {
    #[error("narrative service returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("narrative service request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("narrative service returned no content")]
    EmptyResponse,
}

impl NarratorError {
    /// HTTP status reported by the service, if it answered at all
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::Transport(e) => e.status().map(|s| s.as_u16()),
            Self::EmptyResponse => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// Narrative writer backed by the OpenAI chat completions API
pub struct NarrativeClient {
    client: Client,
    api_key: String,
    model: String,
    endpoint: String,
    max_tokens: u32,
}

impl NarrativeClient {
    /// Create a new narrative client
    ///
    /// # Arguments
    /// * `api_key` - OpenAI API key (from OPENAI_API_KEY environment variable)
    /// * `model` - Model to use (default: "gpt-4o")
    pub fn new(api_key: String, model: Option<String>) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    /// Create from environment variable
    pub fn from_env() -> anyhow::Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self::new(api_key, None))
    }

    /// Point the client at a different chat completions endpoint
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_http_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Build the chat completions request body
    pub fn build_request_body(
        &self,
        metrics: &TreeMetrics,
        image: Option<ImageAttachment<'_>>,
    ) -> serde_json::Value {
        let summary = format!(
            "Detected tree cover: {:.1}% of the image area. Individual trees detected: {}. \
             Assess the green space and tree coverage of this area and suggest improvements.",
            metrics.tree_cover_percent, metrics.tree_count
        );

        let mut user_content = vec![serde_json::json!({
            "type": "text",
            "text": summary
        })];
        if let Some(image) = image {
            user_content.push(serde_json::json!({
                "type": "image_url",
                "image_url": { "url": image.to_data_url() }
            }));
        }

        let mut request_body = serde_json::json!({
            "model": self.model.clone(),
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": user_content }
            ]
        });

        // Use max_completion_tokens for newer models, max_tokens for older ones
        if self.model.starts_with("gpt-5") || self.model.starts_with("o1") {
            request_body["max_completion_tokens"] = serde_json::json!(self.max_tokens);
        } else {
            request_body["max_tokens"] = serde_json::json!(self.max_tokens);
        }

        request_body
    }

    /// Ask the model for a narrative about the detection result. Never retries.
    pub async fn describe(
        &self,
        metrics: &TreeMetrics,
        image: Option<ImageAttachment<'_>>,
    ) -> Result<String, NarratorError> {
        let request_body = self.build_request_body(metrics, image);

        info!(
            model = %self.model,
            with_image = image.is_some(),
            "Sending narrative request"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request_body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            warn!("Narrative service error: {} - {}", status, error_text);
            return Err(NarratorError::Http {
                status: status.as_u16(),
                body: error_text,
            });
        }

        let api_response: OpenAIResponse = response.json().await?;

        let content = api_response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or(NarratorError::EmptyResponse)?;

        info!("Received narrative ({} chars)", content.len());

        Ok(content)
    }
}
