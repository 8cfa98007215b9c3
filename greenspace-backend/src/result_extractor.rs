//! Pulls the JSON payload out of the detection routine's stdout.
//!
//! The routine may print log lines before its payload, so parsing starts at
//! the first `{` and runs to the end of the text. A `{` inside a log line
//! ahead of the payload breaks this rule; a sentinel line would remove that
//! ambiguity but the routine does not emit one.

use serde_json::Value;
use tracing::debug;

use crate::error::{AnalysisError, MalformedReason};

/// Numeric fields read from a well-formed payload
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionPayload {
    pub tree_cover_percent: f64,
    pub tree_count: u64,
    pub air_quality: Option<Value>,
}

pub fn extract(raw_stdout: &str) -> Result<DetectionPayload, AnalysisError> {
    if raw_stdout.trim().is_empty() {
        return Err(AnalysisError::malformed(
            MalformedReason::EmptyOutput,
            raw_stdout,
        ));
    }

    let start = raw_stdout
        .find('{')
        .ok_or_else(|| AnalysisError::malformed(MalformedReason::NoPayload, raw_stdout))?;

    if start > 0 {
        debug!("Skipping {} bytes of output before payload", start);
    }

    let value: Value = serde_json::from_str(&raw_stdout[start..]).map_err(|e| {
        debug!("Payload parse error: {}", e);
        AnalysisError::malformed(MalformedReason::UnparsablePayload, raw_stdout)
    })?;

    let object = value
        .as_object()
        .ok_or_else(|| AnalysisError::malformed(MalformedReason::UnparsablePayload, raw_stdout))?;

    if let Some(error) = object.get("error").filter(|v| !v.is_null()) {
        let message = match error {
            Value::String(message) => message.clone(),
            other => other.to_string(),
        };
        return Err(AnalysisError::UpstreamTool { message });
    }

    let invalid = || AnalysisError::malformed(MalformedReason::InvalidFields, raw_stdout);

    let tree_cover_percent = object
        .get("tree_cover_percent")
        .and_then(Value::as_f64)
        .filter(|p| p.is_finite() && (0.0..=100.0).contains(p))
        .ok_or_else(invalid)?;

    let tree_count = object
        .get("num_trees")
        .and_then(Value::as_u64)
        .ok_or_else(invalid)?;

    let air_quality = object
        .get("air_quality")
        .filter(|v| !v.is_null())
        .cloned();

    Ok(DetectionPayload {
        tree_cover_percent,
        tree_count,
        air_quality,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reason(result: Result<DetectionPayload, AnalysisError>) -> MalformedReason {
        match result {
            Err(AnalysisError::MalformedOutput { reason, .. }) => reason,
            other => panic!("expected malformed output, got {:?}", other),
        }
    }

    #[test]
    fn test_leading_noise_is_skipped() {
        let stdout = "INFO: loading model\n{\"tree_cover_percent\": 42.5, \"num_trees\": 7}";
        let payload = extract(stdout).unwrap();

        assert_eq!(payload.tree_cover_percent, 42.5);
        assert_eq!(payload.tree_count, 7);
        assert_eq!(payload.air_quality, None);
    }

    #[test]
    fn test_progress_lines_and_trailing_newline() {
        let stdout = "Starting image analysis...\nDecoding image...\nAnalysis complete\n\
                      {\"tree_cover_percent\": 0, \"num_trees\": 0, \"air_quality\": null}\n";
        let payload = extract(stdout).unwrap();

        assert_eq!(payload.tree_cover_percent, 0.0);
        assert_eq!(payload.tree_count, 0);
    }

    #[test]
    fn test_air_quality_passthrough() {
        let stdout = concat!(
            r#"{"tree_cover_percent": 12.0, "num_trees": 30, "#,
            r#""air_quality": {"city": "Boston"}}"#
        );
        let payload = extract(stdout).unwrap();

        assert_eq!(payload.air_quality.unwrap()["city"], "Boston");
    }

    #[test]
    fn test_empty_output() {
        assert_eq!(reason(extract("")), MalformedReason::EmptyOutput);
        assert_eq!(reason(extract("  \n\t")), MalformedReason::EmptyOutput);
    }

    #[test]
    fn test_no_payload() {
        assert_eq!(
            reason(extract("Found 12 trees\nAnalysis complete")),
            MalformedReason::NoPayload
        );
    }

    #[test]
    fn test_unparsable_payload_keeps_raw_text() {
        let stdout = "INFO\n{\"tree_cover_percent\": 42.5,";
        match extract(stdout) {
            Err(AnalysisError::MalformedOutput { reason, raw }) => {
                assert_eq!(reason, MalformedReason::UnparsablePayload);
                assert_eq!(raw, stdout);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_trailing_log_line_is_unparsable() {
        let stdout = "{\"tree_cover_percent\": 1.0, \"num_trees\": 1}\nDone.";
        assert_eq!(reason(extract(stdout)), MalformedReason::UnparsablePayload);
    }

    #[test]
    fn test_error_field_becomes_upstream_error() {
        let stdout = "Decoding image...\n{\"error\": \"Failed to decode image\"}";
        match extract(stdout) {
            Err(AnalysisError::UpstreamTool { message }) => {
                assert_eq!(message, "Failed to decode image")
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_null_error_field_is_ignored() {
        let stdout = r#"{"error": null, "tree_cover_percent": 5.5, "num_trees": 3}"#;
        assert_eq!(extract(stdout).unwrap().tree_count, 3);
    }

    #[test]
    fn test_invalid_fields() {
        let cases = [
            r#"{"num_trees": 7}"#,
            r#"{"tree_cover_percent": 42.5}"#,
            r#"{"tree_cover_percent": 100.5, "num_trees": 7}"#,
            r#"{"tree_cover_percent": -1, "num_trees": 7}"#,
            r#"{"tree_cover_percent": "42", "num_trees": 7}"#,
            r#"{"tree_cover_percent": 42.5, "num_trees": -3}"#,
            r#"{"tree_cover_percent": 42.5, "num_trees": 7.5}"#,
        ];
        for case in cases {
            assert_eq!(reason(extract(case)), MalformedReason::InvalidFields, "{}", case);
        }
    }

    #[test]
    fn test_integer_percent_accepted() {
        let payload = extract(r#"{"tree_cover_percent": 100, "num_trees": 250}"#).unwrap();
        assert_eq!(payload.tree_cover_percent, 100.0);
    }
}
