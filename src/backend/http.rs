use std::{collections::HashMap, time::Duration};

use anyhow::Context;
use async_trait::async_trait;

use super::{ArtifactRef, GenerationBackend, JobHistory, JobRequest, SubmitResponse};
use crate::error::{UpliftError, UpliftResult};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for a node-graph generation server (`/prompt`, `/history`, `/view`).
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    /// `address` is `host:port` or a full base URL.
    pub fn new(address: &str) -> UpliftResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| UpliftError::config(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url(address),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

fn base_url(address: &str) -> String {
    let address = address.trim().trim_end_matches('/');
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{address}")
    }
}

#[async_trait]
impl GenerationBackend for HttpBackend {
    async fn submit(&self, request: &JobRequest) -> anyhow::Result<String> {
        let resp = self
            .client
            .post(format!("{}/prompt", self.base_url))
            .json(request)
            .send()
            .await
            .context("failed to submit job")?
            .error_for_status()
            .context("backend rejected job")?;
        let body: SubmitResponse = resp.json().await.context("invalid submit response")?;
        Ok(body.prompt_id)
    }

    async fn history(&self, job_id: &str) -> anyhow::Result<Option<JobHistory>> {
        let resp = self
            .client
            .get(format!("{}/history/{job_id}", self.base_url))
            .send()
            .await
            .context("failed to fetch history")?
            .error_for_status()
            .context("history request failed")?;
        let mut all: HashMap<String, JobHistory> =
            resp.json().await.context("invalid history response")?;
        Ok(all.remove(job_id))
    }

    async fn fetch_artifact(&self, artifact: &ArtifactRef) -> anyhow::Result<Vec<u8>> {
        let resp = self
            .client
            .get(format!("{}/view", self.base_url))
            .query(&[
                ("filename", artifact.filename.as_str()),
                ("subfolder", artifact.subfolder.as_str()),
                ("type", artifact.kind.as_str()),
            ])
            .send()
            .await
            .with_context(|| format!("failed to fetch {}", artifact.filename))?
            .error_for_status()
            .with_context(|| format!("artifact {} unavailable", artifact.filename))?;
        Ok(resp.bytes().await.context("failed to read artifact body")?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_forms_normalize_to_base_url() {
        assert_eq!(base_url("127.0.0.1:8188"), "http://127.0.0.1:8188");
        assert_eq!(base_url("https://gen.example.com/"), "https://gen.example.com");
        assert_eq!(base_url(" localhost:8188 "), "http://localhost:8188");
    }
}
