//! REST surface of the cloud service.
//!
//! [`CloudApi`] is the seam the engine and per-job pipeline talk
//! through; [`CloudHttp`] is the real implementation over the shared
//! transport. Tests substitute their own implementation to script
//! server behavior.

use async_trait::async_trait;
use bridge_transport::{RequestManager, TransportError};
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;

use crate::types::{AuthConfirm, AuthInitiate, ImageUploadSlot, LoraUploadSlot, RemoteJob};

/// Operations the cloud engine needs from the service.
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// Install (or clear) the bearer token used by subsequent calls.
    /// Default is a no-op for implementations without auth state.
    async fn set_token(&self, _token: Option<String>) {}

    /// `POST auth/initiate` -- begin the browser sign-in handshake.
    async fn auth_initiate(
        &self,
        client_id: &str,
        client_info: &str,
    ) -> Result<AuthInitiate, TransportError>;

    /// `POST auth/confirm` -- poll the sign-in handshake.
    async fn auth_confirm(&self, client_id: &str) -> Result<AuthConfirm, TransportError>;

    /// `GET user?plugin_version=..` -- fetch the signed-in account.
    async fn user_info(&self, plugin_version: &str) -> Result<serde_json::Value, TransportError>;

    /// `GET plugin/resources` -- fetch the available model catalog.
    async fn plugin_resources(&self) -> Result<serde_json::Value, TransportError>;

    /// `POST generate` -- enqueue a job.
    async fn generate(&self, body: &serde_json::Value) -> Result<RemoteJob, TransportError>;

    /// `POST status/{remote_id}` -- poll a remote job.
    async fn job_status(&self, remote_id: &str) -> Result<RemoteJob, TransportError>;

    /// `POST cancel/{worker_id}/{remote_id}` -- cancel a remote job.
    async fn cancel_job(&self, worker_id: &str, remote_id: &str) -> Result<(), TransportError>;

    /// `POST upload/image` -- request a pre-signed image upload slot.
    async fn image_upload_slot(&self) -> Result<ImageUploadSlot, TransportError>;

    /// `POST upload/lora` with the content hash and size -- request a
    /// pre-signed LoRA upload slot, or learn the blob is already cached.
    async fn lora_upload_slot(
        &self,
        hash: &str,
        size: u64,
    ) -> Result<LoraUploadSlot, TransportError>;

    /// PUT raw bytes to a pre-signed URL.
    async fn put_object(&self, url: &str, data: Vec<u8>) -> Result<(), TransportError>;

    /// PUT raw bytes to a pre-signed URL with the S3 checksum header.
    async fn upload_object(
        &self,
        url: &str,
        data: Vec<u8>,
        sha256_b64: &str,
    ) -> Result<(), TransportError>;

    /// Download a result blob from a (possibly external) URL.
    async fn download(&self, url: &str) -> Result<Vec<u8>, TransportError>;

    /// Release underlying connections. Default is a no-op.
    async fn close(&self) {}
}

/// Real HTTP implementation over [`RequestManager`].
pub struct CloudHttp {
    requests: RequestManager,
    api_url: String,
    token: RwLock<Option<String>>,
}

impl CloudHttp {
    pub fn new(api_url: &str) -> Self {
        Self {
            requests: RequestManager::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            token: RwLock::new(None),
        }
    }

    async fn get(&self, op: &str) -> Result<serde_json::Value, TransportError> {
        let url = format!("{}/{op}", self.api_url);
        let bearer = self.token.read().await.clone();
        self.requests
            .get(&url, None, bearer.as_deref())
            .await?
            .into_json(&url)
    }

    async fn post(
        &self,
        op: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, TransportError> {
        let url = format!("{}/{op}", self.api_url);
        let bearer = self.token.read().await.clone();
        self.requests
            .post_json(&url, &body, bearer.as_deref())
            .await?
            .into_json(&url)
    }

    fn parse<T: DeserializeOwned>(
        value: serde_json::Value,
        op: &str,
    ) -> Result<T, TransportError> {
        serde_json::from_value(value)
            .map_err(|e| TransportError::network(op, format!("Unexpected server response: {e}")))
    }
}

#[async_trait]
impl CloudApi for CloudHttp {
    async fn set_token(&self, token: Option<String>) {
        *self.token.write().await = token;
    }

    async fn auth_initiate(
        &self,
        client_id: &str,
        client_info: &str,
    ) -> Result<AuthInitiate, TransportError> {
        let body = serde_json::json!({ "client_id": client_id, "client_info": client_info });
        let value = self.post("auth/initiate", body).await?;
        Self::parse(value, "auth/initiate")
    }

    async fn auth_confirm(&self, client_id: &str) -> Result<AuthConfirm, TransportError> {
        let body = serde_json::json!({ "client_id": client_id });
        let value = self.post("auth/confirm", body).await?;
        Self::parse(value, "auth/confirm")
    }

    async fn user_info(&self, plugin_version: &str) -> Result<serde_json::Value, TransportError> {
        self.get(&format!("user?plugin_version={plugin_version}"))
            .await
    }

    async fn plugin_resources(&self) -> Result<serde_json::Value, TransportError> {
        self.get("plugin/resources").await
    }

    async fn generate(&self, body: &serde_json::Value) -> Result<RemoteJob, TransportError> {
        let value = self.post("generate", body.clone()).await?;
        Self::parse(value, "generate")
    }

    async fn job_status(&self, remote_id: &str) -> Result<RemoteJob, TransportError> {
        let value = self
            .post(&format!("status/{remote_id}"), serde_json::json!({}))
            .await?;
        Self::parse(value, "status")
    }

    async fn cancel_job(&self, worker_id: &str, remote_id: &str) -> Result<(), TransportError> {
        self.post(
            &format!("cancel/{worker_id}/{remote_id}"),
            serde_json::json!({}),
        )
        .await?;
        Ok(())
    }

    async fn image_upload_slot(&self) -> Result<ImageUploadSlot, TransportError> {
        let value = self.post("upload/image", serde_json::json!({})).await?;
        Self::parse(value, "upload/image")
    }

    async fn lora_upload_slot(
        &self,
        hash: &str,
        size: u64,
    ) -> Result<LoraUploadSlot, TransportError> {
        let body = serde_json::json!({ "hash": hash, "size": size });
        let value = self.post("upload/lora", body).await?;
        Self::parse(value, "upload/lora")
    }

    async fn put_object(&self, url: &str, data: Vec<u8>) -> Result<(), TransportError> {
        self.requests.put(url, data).await
    }

    async fn upload_object(
        &self,
        url: &str,
        data: Vec<u8>,
        sha256_b64: &str,
    ) -> Result<(), TransportError> {
        self.requests
            .upload(url, data, Some(sha256_b64), None)
            .await
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, TransportError> {
        self.requests.download(url, None).await
    }

    async fn close(&self) {
        self.requests.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slash_is_stripped() {
        let api = CloudHttp::new("https://api.example.cloud/");
        assert_eq!(api.api_url, "https://api.example.cloud");
    }

    #[test]
    fn parse_rejects_shape_mismatch() {
        let value = serde_json::json!({ "object": "key-only" });
        let result: Result<ImageUploadSlot, _> = CloudHttp::parse(value, "upload/image");
        assert!(result.is_err());
    }
}
