//! REST surface of the local workflow server.
//!
//! [`ComfyApi`] is the seam the engine and listener talk through;
//! [`ComfyHttp`] is the real implementation over the shared transport.
//! Tests substitute their own implementation to script server behavior.

use std::time::Duration;

use async_trait::async_trait;
use bridge_transport::{RequestManager, TransportError};

/// Timeout for the connect-time health probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP operations the local engine needs from the server.
#[async_trait]
pub trait ComfyApi: Send + Sync {
    /// `GET /system_stats` health probe, bounded by [`PROBE_TIMEOUT`].
    async fn system_stats(&self) -> Result<serde_json::Value, TransportError>;

    /// `POST /prompt` -- submit a compiled workflow under an explicit,
    /// locally generated prompt id, correlated by client id.
    async fn submit_prompt(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
        prompt_id: &str,
    ) -> Result<(), TransportError>;

    /// `POST /queue` with `{delete: [prompt_id]}` -- remove a job from
    /// the remote queue.
    async fn delete_queued(&self, prompt_id: &str) -> Result<(), TransportError>;

    /// `GET /view?filename&subfolder&type` -- fetch a result image.
    async fn view_image(
        &self,
        filename: &str,
        subfolder: &str,
        image_type: &str,
    ) -> Result<Vec<u8>, TransportError>;

    /// Alternate-protocol image fetch by opaque id.
    async fn image_by_id(&self, image_id: &str) -> Result<Vec<u8>, TransportError>;

    /// Release underlying connections. Default is a no-op.
    async fn close(&self) {}
}

/// Real HTTP implementation over [`RequestManager`].
pub struct ComfyHttp {
    requests: RequestManager,
    url: String,
    auth_token: Option<String>,
}

impl ComfyHttp {
    /// * `url` - base HTTP URL, e.g. `http://host:8188` (trailing
    ///   slashes are stripped).
    pub fn new(url: &str, auth_token: Option<String>) -> Self {
        Self {
            requests: RequestManager::new(),
            url: url.trim_end_matches('/').to_string(),
            auth_token,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn bearer(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }
}

#[async_trait]
impl ComfyApi for ComfyHttp {
    async fn system_stats(&self) -> Result<serde_json::Value, TransportError> {
        let url = format!("{}/system_stats", self.url);
        let payload = self
            .requests
            .get(&url, Some(PROBE_TIMEOUT), self.bearer())
            .await?;
        payload.into_json(&url)
    }

    async fn submit_prompt(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
        prompt_id: &str,
    ) -> Result<(), TransportError> {
        let url = format!("{}/prompt", self.url);
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
            "prompt_id": prompt_id,
        });
        self.requests
            .post_json(&url, &body, self.bearer())
            .await?;
        Ok(())
    }

    async fn delete_queued(&self, prompt_id: &str) -> Result<(), TransportError> {
        let url = format!("{}/queue", self.url);
        let body = serde_json::json!({ "delete": [prompt_id] });
        self.requests
            .post_json(&url, &body, self.bearer())
            .await?;
        Ok(())
    }

    async fn view_image(
        &self,
        filename: &str,
        subfolder: &str,
        image_type: &str,
    ) -> Result<Vec<u8>, TransportError> {
        let base = format!("{}/view", self.url);
        let url = reqwest::Url::parse_with_params(
            &base,
            &[
                ("filename", filename),
                ("subfolder", subfolder),
                ("type", image_type),
            ],
        )
        .map_err(|e| TransportError::network(&base, e.to_string()))?;
        self.requests.download(url.as_str(), None).await
    }

    async fn image_by_id(&self, image_id: &str) -> Result<Vec<u8>, TransportError> {
        let url = format!("{}/api/etn/image/{image_id}", self.url);
        self.requests.download(&url, None).await
    }

    async fn close(&self) {
        self.requests.close().await;
    }
}
