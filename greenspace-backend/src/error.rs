use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Raw tool output kept inside errors is cut to this many bytes
pub const DIAGNOSTIC_EXCERPT_BYTES: usize = 4096;

/// Pipeline stage an error was raised in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validation,
    ImageFetch,
    Detection,
    Extraction,
    Narrative,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::ImageFetch => "image_fetch",
            Self::Detection => "detection",
            Self::Extraction => "extraction",
            Self::Narrative => "narrative",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why detection output could not be trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedReason {
    EmptyOutput,
    NoPayload,
    UnparsablePayload,
    InvalidFields,
}

impl fmt::Display for MalformedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::EmptyOutput => "empty output",
            Self::NoPayload => "no payload found",
            Self::UnparsablePayload => "unparsable payload",
            Self::InvalidFields => "invalid fields",
        })
    }
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("invalid coordinate: {0}")]
    Validation(String),

    #[error("imagery provider request failed{}: {body}", status_suffix(.status))]
    RemoteFetch { status: Option<u16>, body: String },

    #[error("failed to launch detection process `{program}`: {source}")]
    ProcessLaunch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("detection process exited with code {exit_code}")]
    ProcessExecution {
        exit_code: i32,
        stderr: String,
        stdout: String,
    },

    #[error("malformed detection output: {reason}")]
    MalformedOutput { reason: MalformedReason, raw: String },

    #[error("detection routine reported an error: {message}")]
    UpstreamTool { message: String },

    #[error("narrative service failed{}: {message}", status_suffix(.status))]
    NarrativeService { status: Option<u16>, message: String },

    #[error("analysis cancelled during {stage}")]
    Cancelled { stage: Stage },
}

fn status_suffix(status: &Option<u16>) -> String {
    status
        .map(|s| format!(" with status {}", s))
        .unwrap_or_default()
}

impl AnalysisError {
    pub fn malformed(reason: MalformedReason, raw: &str) -> Self {
        Self::MalformedOutput {
            reason,
            raw: excerpt(raw, DIAGNOSTIC_EXCERPT_BYTES),
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            Self::Validation(_) => Stage::Validation,
            Self::RemoteFetch { .. } => Stage::ImageFetch,
            Self::ProcessLaunch { .. } | Self::ProcessExecution { .. } => Stage::Detection,
            Self::MalformedOutput { .. } | Self::UpstreamTool { .. } => Stage::Extraction,
            Self::NarrativeService { .. } => Stage::Narrative,
            Self::Cancelled { stage } => *stage,
        }
    }

    /// Stable machine-readable code
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::RemoteFetch { .. } => "REMOTE_FETCH_ERROR",
            Self::ProcessLaunch { .. } => "PROCESS_LAUNCH_ERROR",
            Self::ProcessExecution { .. } => "PROCESS_EXECUTION_ERROR",
            Self::MalformedOutput { .. } => "MALFORMED_OUTPUT_ERROR",
            Self::UpstreamTool { .. } => "UPSTREAM_TOOL_ERROR",
            Self::NarrativeService { .. } => "NARRATIVE_SERVICE_ERROR",
            Self::Cancelled { .. } => "CANCELLED",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::RemoteFetch { .. } | Self::NarrativeService { .. } => StatusCode::BAD_GATEWAY,
            Self::ProcessLaunch { .. }
            | Self::ProcessExecution { .. }
            | Self::MalformedOutput { .. }
            | Self::UpstreamTool { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Cancelled { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Message safe to show end users. Never contains tool output.
    pub fn public_message(&self) -> String {
        match self {
            Self::Validation(reason) => format!("Invalid coordinate: {}", reason),
            Self::RemoteFetch { status, .. } => {
                format!("Imagery provider request failed{}", status_suffix(status))
            }
            Self::ProcessLaunch { .. } => "Detection routine could not be started".to_string(),
            Self::ProcessExecution { exit_code, .. } => {
                format!("Detection routine failed with exit code {}", exit_code)
            }
            Self::MalformedOutput { reason, .. } => {
                format!("Detection routine produced malformed output: {}", reason)
            }
            Self::UpstreamTool { .. } => "Detection routine reported an error".to_string(),
            Self::NarrativeService { status, .. } => {
                format!("Narrative service failed{}", status_suffix(status))
            }
            Self::Cancelled { stage } => format!("Analysis cancelled during {}", stage),
        }
    }

    /// Internal detail (raw stderr, unparsable text, upstream messages)
    pub fn diagnostics(&self) -> Option<String> {
        match self {
            Self::Validation(_) | Self::Cancelled { .. } => None,
            Self::RemoteFetch { body, .. } => Some(body.clone()),
            Self::ProcessLaunch { source, .. } => Some(source.to_string()),
            Self::ProcessExecution { stderr, stdout, .. } => {
                Some(format!("stderr:\n{}\nstdout:\n{}", stderr, stdout))
            }
            Self::MalformedOutput { raw, .. } => Some(raw.clone()),
            Self::UpstreamTool { message } => Some(message.clone()),
            Self::NarrativeService { message, .. } => Some(message.clone()),
        }
    }
}

/// Cut `text` to at most `max_bytes`, respecting char boundaries
pub fn excerpt(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated {} bytes]", &text[..end], text.len() - end)
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// HTTP rendering of an [`AnalysisError`]
#[derive(Debug)]
pub struct ApiError {
    pub error: AnalysisError,
    pub diagnostics: bool,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.error.public_message(),
            kind: self.error.kind(),
            detail: if self.diagnostics {
                self.error.diagnostics()
            } else {
                None
            },
        };
        (self.error.status_code(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            AnalysisError::Validation("lat".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AnalysisError::RemoteFetch { status: Some(401), body: String::new() }.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            AnalysisError::NarrativeService { status: None, message: String::new() }.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            AnalysisError::malformed(MalformedReason::NoPayload, "x").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            AnalysisError::UpstreamTool { message: "boom".into() }.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_malformed_reason_messages() {
        let err = AnalysisError::malformed(MalformedReason::EmptyOutput, "");
        assert_eq!(err.to_string(), "malformed detection output: empty output");
        assert_eq!(MalformedReason::NoPayload.to_string(), "no payload found");
        assert_eq!(MalformedReason::UnparsablePayload.to_string(), "unparsable payload");
        assert_eq!(MalformedReason::InvalidFields.to_string(), "invalid fields");
    }

    #[test]
    fn test_public_message_hides_tool_output() {
        let err = AnalysisError::ProcessExecution {
            exit_code: 2,
            stderr: "Traceback: secret path /srv/model".into(),
            stdout: String::new(),
        };
        assert!(!err.public_message().contains("Traceback"));
        assert!(err.diagnostics().unwrap().contains("Traceback"));
    }

    #[test]
    fn test_excerpt_respects_char_boundaries() {
        let text = "ééééé";
        let cut = excerpt(text, 3);
        assert!(cut.starts_with("é"));
        assert!(cut.contains("truncated"));
        assert_eq!(excerpt("short", 10), "short");
    }
}
