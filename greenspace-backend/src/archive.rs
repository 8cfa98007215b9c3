use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use uuid::Uuid;

use crate::types::{AnalysisResult, Coordinate, ImageEncoding};

/// One stored analysis
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveRecord {
    pub id: Uuid,
    pub coordinate: Coordinate,
    pub image_encoding: ImageEncoding,
    pub result: AnalysisResult,
    pub timestamp: DateTime<Utc>,
}

impl ArchiveRecord {
    pub fn new(result: AnalysisResult, image_encoding: ImageEncoding) -> Self {
        Self {
            id: Uuid::new_v4(),
            coordinate: result.coordinate,
            image_encoding,
            result,
            timestamp: Utc::now(),
        }
    }
}

/// Optional store for finished analyses. The pipeline never waits on it.
#[async_trait]
pub trait AnalysisArchive: Send + Sync {
    async fn store(&self, record: ArchiveRecord, image: Vec<u8>) -> anyhow::Result<()>;
}

/// Writes `<id>.<png|jpg>` and `<id>.json` into a directory
pub struct DirectoryArchive {
    root: PathBuf,
}

impl DirectoryArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl AnalysisArchive for DirectoryArchive {
    async fn store(&self, record: ArchiveRecord, image: Vec<u8>) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating archive directory {}", self.root.display()))?;

        let image_path = self
            .root
            .join(format!("{}.{}", record.id, record.image_encoding.extension()));
        tokio::fs::write(&image_path, &image)
            .await
            .with_context(|| format!("writing {}", image_path.display()))?;

        let record_path = self.root.join(format!("{}.json", record.id));
        let json = serde_json::to_vec_pretty(&record).context("serializing archive record")?;
        tokio::fs::write(&record_path, json)
            .await
            .with_context(|| format!("writing {}", record_path.display()))?;

        Ok(())
    }
}
