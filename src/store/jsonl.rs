use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::error::StoreError;

use super::{UsageRecord, UsageSink};

/// Usage sink appending one JSON object per line to a local file. The
/// default sink for single-node deployments; billing pipelines tail the
/// file.
pub struct JsonlUsageSink {
    path: PathBuf,
}

impl JsonlUsageSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl UsageSink for JsonlUsageSink {
    async fn append(&self, record: &UsageRecord) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(record)
            .map_err(|err| StoreError::Unavailable(format!("serialize usage record: {err}")))?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|err| StoreError::Unavailable(format!("open usage log: {err}")))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|err| StoreError::Unavailable(format!("write usage log: {err}")))?;
        Ok(())
    }
}
