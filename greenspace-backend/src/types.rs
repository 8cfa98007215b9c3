use serde::Serialize;
use vision_narrator::{Narrative, TreeMetrics};

use crate::detection::CompletedRun;
use crate::error::AnalysisError;
use crate::result_extractor::DetectionPayload;

/// Validated latitude/longitude pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Coordinate {
    #[serde(rename = "lat")]
    latitude: f64,
    #[serde(rename = "lng")]
    longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, AnalysisError> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(AnalysisError::Validation(format!(
                "latitude must be within [-90, 90], got {}",
                latitude
            )));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(AnalysisError::Validation(format!(
                "longitude must be within [-180, 180], got {}",
                longitude
            )));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ImageEncoding {
    Png,
    Jpeg,
}

impl ImageEncoding {
    pub fn mime(&self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
        }
    }
}

/// Image fetched for one analysis
#[derive(Debug, Clone)]
pub struct ImagePayload {
    pub bytes: Vec<u8>,
    pub encoding: ImageEncoding,
    /// Request URL with credentials removed
    pub source_url: String,
}

/// Parsed detection result plus the raw run it came from
#[derive(Debug, Clone)]
pub struct DetectionOutcome {
    pub tree_cover_percent: f64,
    pub tree_count: u64,
    pub air_quality: Option<serde_json::Value>,
    pub raw_stdout: String,
    pub raw_stderr: String,
    pub exit_code: i32,
}

impl DetectionOutcome {
    pub fn new(payload: DetectionPayload, run: CompletedRun) -> Self {
        let run = run.into_raw();
        Self {
            tree_cover_percent: payload.tree_cover_percent,
            tree_count: payload.tree_count,
            air_quality: payload.air_quality,
            raw_stdout: run.stdout,
            raw_stderr: run.stderr,
            exit_code: run.exit_code,
        }
    }

    pub fn metrics(&self) -> TreeMetrics {
        TreeMetrics {
            tree_cover_percent: self.tree_cover_percent,
            tree_count: self.tree_count,
        }
    }
}

/// Final response of a successful analysis
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub coordinate: Coordinate,
    pub tree_cover_percent: f64,
    pub tree_count: u64,
    pub narrative: Narrative,
    pub image_reference: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub air_quality: Option<serde_json::Value>,
}
