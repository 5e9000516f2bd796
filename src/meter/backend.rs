//! Seam to the external document processing service.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingJob {
    pub inputs: Vec<PathBuf>,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingOutput {
    pub outputs: Vec<PathBuf>,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend rejected job: {0}")]
    Rejected(String),
    #[error("backend failed: {0}")]
    Failed(String),
    #[error("backend io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Runs an operation after it has been paid for. The meter never inspects
/// the output beyond success or failure.
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    async fn process(
        &self,
        operation: &str,
        job: &ProcessingJob,
    ) -> Result<ProcessingOutput, BackendError>;
}
