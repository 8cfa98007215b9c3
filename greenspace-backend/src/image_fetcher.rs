use async_trait::async_trait;
use image::ImageFormat;
use reqwest::Client;
use std::time::Instant;
use tracing::{info, warn};

use crate::error::{excerpt, AnalysisError};
use crate::types::{Coordinate, ImageEncoding, ImagePayload};

pub const MAPBOX_SATELLITE_STATIC: &str =
    "https://api.mapbox.com/styles/v1/mapbox/satellite-v9/static";

/// Error bodies from the provider are cut to this length
const ERROR_BODY_BYTES: usize = 1024;

/// Zoom and size of the requested image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewSpec {
    pub zoom: u8,
    pub width: u32,
    pub height: u32,
}

impl Default for ViewSpec {
    /// Close-range, block-scale imagery
    fn default() -> Self {
        Self {
            zoom: 18,
            width: 800,
            height: 600,
        }
    }
}

#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// One request to the imagery provider. Never retries.
    async fn fetch(
        &self,
        coordinate: Coordinate,
        view: ViewSpec,
    ) -> Result<ImagePayload, AnalysisError>;
}

/// Static satellite imagery from Mapbox
pub struct MapboxImageFetcher {
    client: Client,
    base_url: String,
    access_token: String,
}

impl MapboxImageFetcher {
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token: access_token.into(),
        }
    }

    /// URL without the access token
    pub fn public_url(&self, coordinate: Coordinate, view: ViewSpec) -> String {
        format!(
            "{}/{},{},{}/{}x{}",
            self.base_url,
            coordinate.longitude(),
            coordinate.latitude(),
            view.zoom,
            view.width,
            view.height
        )
    }
}

/// PNG or JPEG, sniffed from the leading bytes
pub fn detect_encoding(bytes: &[u8]) -> Option<ImageEncoding> {
    match image::guess_format(bytes).ok()? {
        ImageFormat::Png => Some(ImageEncoding::Png),
        ImageFormat::Jpeg => Some(ImageEncoding::Jpeg),
        _ => None,
    }
}

#[async_trait]
impl ImageFetcher for MapboxImageFetcher {
    async fn fetch(
        &self,
        coordinate: Coordinate,
        view: ViewSpec,
    ) -> Result<ImagePayload, AnalysisError> {
        let source_url = self.public_url(coordinate, view);
        let start = Instant::now();

        info!(url = %source_url, "Fetching satellite image");

        let response = self
            .client
            .get(&source_url)
            .query(&[("access_token", self.access_token.as_str())])
            .send()
            .await
            .map_err(|e| {
                warn!("Imagery request failed: {}", e);
                AnalysisError::RemoteFetch {
                    status: e.status().map(|s| s.as_u16()),
                    body: e.without_url().to_string(),
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Imagery provider error: {} - {}", status, excerpt(&body, 256));
            return Err(AnalysisError::RemoteFetch {
                status: Some(status.as_u16()),
                body: excerpt(&body, ERROR_BODY_BYTES),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| AnalysisError::RemoteFetch {
                status: Some(status.as_u16()),
                body: format!("failed to read image body: {}", e.without_url()),
            })?
            .to_vec();

        if bytes.is_empty() {
            return Err(AnalysisError::RemoteFetch {
                status: Some(status.as_u16()),
                body: "empty image body".to_string(),
            });
        }

        let encoding = detect_encoding(&bytes).ok_or_else(|| AnalysisError::RemoteFetch {
            status: Some(status.as_u16()),
            body: "response is not a PNG or JPEG image".to_string(),
        })?;

        info!(
            bytes = bytes.len(),
            encoding = encoding.mime(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Satellite image fetched"
        );

        Ok(ImagePayload {
            bytes,
            encoding,
            source_url,
        })
    }
}
