//! Remote generation backend: submit a job graph, poll its history, fetch artifacts.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::template::JobTemplate;

pub mod http;

pub use http::HttpBackend;

/// Body of a job submission.
#[derive(Debug, Clone, Serialize)]
pub struct JobRequest {
    pub prompt: JobTemplate,
    pub client_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    pub prompt_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Output,
    Temp,
    #[serde(other)]
    Other,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Output => "output",
            Self::Temp => "temp",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub filename: String,
    pub subfolder: String,
    #[serde(rename = "type")]
    pub kind: ArtifactKind,
}

/// History record of one job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobHistory {
    #[serde(default)]
    pub outputs: BTreeMap<String, NodeOutput>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeOutput {
    #[serde(default)]
    pub images: Vec<Value>,
}

impl NodeOutput {
    /// Image entries that carry filename, subfolder and type; anything else is skipped.
    pub fn artifacts(&self) -> Vec<ArtifactRef> {
        self.images
            .iter()
            .filter_map(|v| serde_json::from_value(v.clone()).ok())
            .collect()
    }
}

/// Pick the artifact to fetch for one node: `output` first, `temp` only with `allow_preview`.
pub fn select_artifact(artifacts: &[ArtifactRef], allow_preview: bool) -> Option<&ArtifactRef> {
    artifacts
        .iter()
        .find(|a| a.kind == ArtifactKind::Output)
        .or_else(|| {
            allow_preview
                .then(|| artifacts.iter().find(|a| a.kind == ArtifactKind::Temp))
                .flatten()
        })
}

#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Submit a job; returns its id.
    async fn submit(&self, request: &JobRequest) -> anyhow::Result<String>;

    /// History for `job_id`; `None` while the backend has no record of it.
    async fn history(&self, job_id: &str) -> anyhow::Result<Option<JobHistory>>;

    async fn fetch_artifact(&self, artifact: &ArtifactRef) -> anyhow::Result<Vec<u8>>;
}
