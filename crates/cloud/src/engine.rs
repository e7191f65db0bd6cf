//! Cloud engine: authentication, account state, and job lifecycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bridge_core::job::new_job_id;
use bridge_core::{JobId, JobRecord, JobRegistry, JobStatus};
use bridge_transport::TransportError;

use crate::api::{CloudApi, CloudHttp};
use crate::config::CloudConfig;
use crate::limits::apply_service_limits;
use crate::pipeline::{JobTask, PLUGIN_VERSION};
use crate::types::{CloudFeatures, CloudNews, CloudUser, ImagePayload, LoraPayload};

/// How long a sign-in attempt may stay pending.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(300);
/// Delay between sign-in confirmation polls.
const AUTH_RETRY: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum CloudEngineError {
    #[error("Authorization token is required")]
    MissingToken,

    #[error("Not signed in to the cloud service")]
    NotConnected,

    #[error("Sign-in must be started first")]
    SignInNotStarted,

    #[error("Authorization failed: {0}")]
    AuthorizationFailed(String),

    #[error("Sign-in attempt timed out after 5 minutes")]
    SignInTimeout,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Connection to the hosted generation service.
///
/// Holds the signed-in account plus the per-account features, news and
/// model catalog fetched at authentication time. Jobs are tracked in
/// the shared registry; each one is driven by its own background task.
pub struct CloudEngine {
    registry: Arc<JobRegistry>,
    api: Arc<dyn CloudApi>,
    config: CloudConfig,
    token: Mutex<Option<String>>,
    user: Arc<Mutex<Option<CloudUser>>>,
    features: Mutex<CloudFeatures>,
    news: Mutex<Option<CloudNews>>,
    models: Mutex<serde_json::Value>,
    connected: AtomicBool,
    sign_in_client_id: Mutex<Option<String>>,
}

impl CloudEngine {
    pub fn new(registry: Arc<JobRegistry>, config: CloudConfig) -> Self {
        let api = Arc::new(CloudHttp::new(&config.api_url));
        Self::with_api(registry, api, config)
    }

    /// Construct over a custom API implementation (used by tests).
    pub fn with_api(
        registry: Arc<JobRegistry>,
        api: Arc<dyn CloudApi>,
        config: CloudConfig,
    ) -> Self {
        Self {
            registry,
            api,
            config,
            token: Mutex::new(None),
            user: Arc::new(Mutex::new(None)),
            features: Mutex::new(CloudFeatures::default()),
            news: Mutex::new(None),
            models: Mutex::new(serde_json::Value::Null),
            connected: AtomicBool::new(false),
            sign_in_client_id: Mutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn user(&self) -> Option<CloudUser> {
        self.user.lock().ok().and_then(|guard| guard.clone())
    }

    pub fn features(&self) -> CloudFeatures {
        self.features
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn news(&self) -> Option<CloudNews> {
        self.news.lock().ok().and_then(|guard| guard.clone())
    }

    /// Model catalog fetched at authentication time.
    pub fn models(&self) -> serde_json::Value {
        self.models
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or(serde_json::Value::Null)
    }

    // === Authentication ===

    /// Validate a token against the service and load the account.
    ///
    /// On 401 the stored token is scrubbed and the error message
    /// replaced with a sign-in hint; any other failure restores the
    /// previously held token.
    pub async fn authenticate(&self, token: &str) -> Result<CloudUser, CloudEngineError> {
        if token.is_empty() {
            return Err(CloudEngineError::MissingToken);
        }

        let previous = self.set_token(Some(token.to_string())).await;
        let user_data = match self.api.user_info(PLUGIN_VERSION).await {
            Ok(data) => data,
            Err(mut e) => {
                if e.status == Some(401) {
                    self.set_token(None).await;
                    e.message = "The login data is incorrect, please sign in again.".to_string();
                } else {
                    self.set_token(previous).await;
                }
                return Err(e.into());
            }
        };

        let user = parse_user(&user_data)?;
        let features = enumerate_features(&user_data);
        let news = user_data
            .get("news")
            .and_then(|n| n.as_str())
            .filter(|text| !text.is_empty())
            .map(|text| CloudNews::new(text.to_string()));

        let models = self.api.plugin_resources().await?;

        if let Ok(mut guard) = self.user.lock() {
            *guard = Some(user.clone());
        }
        if let Ok(mut guard) = self.features.lock() {
            *guard = features;
        }
        if let Ok(mut guard) = self.news.lock() {
            *guard = news;
        }
        if let Ok(mut guard) = self.models.lock() {
            *guard = models;
        }
        self.connected.store(true, Ordering::SeqCst);
        tracing::info!(user = %user.name, credits = user.credits, "Signed in to cloud service");
        Ok(user)
    }

    /// Begin the browser sign-in handshake. Returns the URL the user
    /// must open to authorize this client.
    pub async fn start_sign_in(&self) -> Result<String, CloudEngineError> {
        let client_id = uuid::Uuid::new_v4().to_string();
        let device = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
        let info = format!("PS AI Diffusion [Device: {device}]");

        let init = self.api.auth_initiate(&client_id, &info).await?;
        if let Ok(mut guard) = self.sign_in_client_id.lock() {
            *guard = Some(client_id);
        }
        Ok(format!("{}{}", self.config.web_url, init.url))
    }

    /// Poll the sign-in handshake once. `Ok(None)` means the user has
    /// not authorized yet.
    pub async fn confirm_sign_in(
        &self,
    ) -> Result<Option<(String, CloudUser)>, CloudEngineError> {
        let client_id = self
            .sign_in_client_id
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .ok_or(CloudEngineError::SignInNotStarted)?;

        let confirm = self.api.auth_confirm(&client_id).await?;
        match confirm.status.as_str() {
            "authorized" => {
                self.clear_sign_in_state();
                let token = confirm.token.ok_or_else(|| {
                    CloudEngineError::AuthorizationFailed(
                        "authorized response carried no token".to_string(),
                    )
                })?;
                let user = self.authenticate(&token).await?;
                Ok(Some((token, user)))
            }
            "not-found" => Ok(None),
            other => {
                self.clear_sign_in_state();
                Err(CloudEngineError::AuthorizationFailed(other.to_string()))
            }
        }
    }

    /// Poll [`confirm_sign_in`](Self::confirm_sign_in) until the user
    /// authorizes or [`AUTH_TIMEOUT`] elapses.
    pub async fn wait_for_sign_in(&self) -> Result<(String, CloudUser), CloudEngineError> {
        let deadline = tokio::time::Instant::now() + AUTH_TIMEOUT;
        loop {
            if let Some(result) = self.confirm_sign_in().await? {
                return Ok(result);
            }
            if tokio::time::Instant::now() + AUTH_RETRY > deadline {
                return Err(CloudEngineError::SignInTimeout);
            }
            tokio::time::sleep(AUTH_RETRY).await;
        }
    }

    /// Drop the session. Running jobs keep their records; no new jobs
    /// can be submitted until the next authentication.
    pub async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.set_token(None).await;
        if let Ok(mut guard) = self.user.lock() {
            *guard = None;
        }
        self.api.close().await;
        tracing::info!("Disconnected from cloud service");
    }

    // === Jobs ===

    /// Enqueue a generation job. Returns immediately with the local job
    /// id; a background task drives the job to a terminal state.
    pub async fn submit(
        &self,
        mut workflow: serde_json::Value,
        images: Option<ImagePayload>,
        loras: Vec<LoraPayload>,
    ) -> Result<JobId, CloudEngineError> {
        if !self.is_connected() {
            return Err(CloudEngineError::NotConnected);
        }

        apply_service_limits(&mut workflow, &self.features());

        let job_id = new_job_id();
        self.registry.insert(&job_id, JobRecord::default()).await;

        let task = JobTask {
            registry: Arc::clone(&self.registry),
            api: Arc::clone(&self.api),
            web_url: self.config.web_url.clone(),
            job_id: job_id.clone(),
            workflow,
            images,
            loras,
            user: Arc::clone(&self.user),
        };
        tokio::spawn(task.run());

        tracing::info!(job_id = %job_id, "Cloud job submitted");
        Ok(job_id)
    }

    /// Request cancellation of a job. Sets the cooperative flag, fires
    /// a best-effort remote cancel when the remote identifiers are
    /// known, and marks the job cancelled. Returns false for unknown
    /// job ids.
    pub async fn cancel(&self, job_id: &str) -> bool {
        let ids = self
            .registry
            .read(job_id, |job| (job.remote_id.clone(), job.worker_id.clone()))
            .await;
        let Some((remote_id, worker_id)) = ids else {
            return false;
        };

        self.registry
            .update(job_id, |job| job.cancel_requested = true)
            .await;

        if let (Some(remote_id), Some(worker_id)) = (remote_id, worker_id) {
            if let Err(e) = self.api.cancel_job(&worker_id, &remote_id).await {
                tracing::warn!(job_id = %job_id, error = %e, "Remote cancel failed");
            }
        }

        self.registry
            .update(job_id, |job| {
                if !job.status.is_terminal() {
                    job.status = JobStatus::Cancelled;
                }
            })
            .await;
        tracing::info!(job_id = %job_id, "Cloud job cancelled");
        true
    }

    // === private helpers ===

    /// Swap the stored token, propagating it to the API layer. Returns
    /// the previous token.
    async fn set_token(&self, token: Option<String>) -> Option<String> {
        let previous = match self.token.lock() {
            Ok(mut guard) => std::mem::replace(&mut *guard, token.clone()),
            Err(_) => None,
        };
        self.api.set_token(token).await;
        previous
    }

    fn clear_sign_in_state(&self) {
        if let Ok(mut guard) = self.sign_in_client_id.lock() {
            *guard = None;
        }
    }
}

fn parse_user(user_data: &serde_json::Value) -> Result<CloudUser, CloudEngineError> {
    let id = user_data
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            CloudEngineError::AuthorizationFailed("account response without a user id".to_string())
        })?;
    let name = user_data
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or(id);
    Ok(CloudUser {
        id: id.to_string(),
        name: name.to_string(),
        credits: user_data.get("credits").and_then(|v| v.as_i64()).unwrap_or(0),
        images_generated: user_data
            .get("images_generated")
            .and_then(|v| v.as_i64())
            .unwrap_or(0),
    })
}

fn enumerate_features(user_data: &serde_json::Value) -> CloudFeatures {
    let defaults = CloudFeatures::default();
    CloudFeatures {
        ip_adapter: true,
        translation: true,
        max_upload_size: user_data
            .get("max_upload_size")
            .and_then(|v| v.as_u64())
            .unwrap_or(defaults.max_upload_size),
        max_control_layers: user_data
            .get("max_control_layers")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
            .unwrap_or(defaults.max_control_layers),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use async_trait::async_trait;

    use crate::types::{AuthConfirm, AuthInitiate, ImageUploadSlot, LoraUploadSlot, RemoteJob};

    /// Minimal scripted API for authentication tests.
    #[derive(Default)]
    struct AuthApi {
        /// When set, `user_info` fails with this HTTP status.
        user_status: Mutex<Option<u16>>,
        confirm_responses: Mutex<Vec<AuthConfirm>>,
        token: Mutex<Option<String>>,
    }

    impl AuthApi {
        fn failing_with(status: u16) -> Self {
            Self {
                user_status: Mutex::new(Some(status)),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl CloudApi for AuthApi {
        async fn set_token(&self, token: Option<String>) {
            *self.token.lock().unwrap() = token;
        }

        async fn auth_initiate(
            &self,
            _client_id: &str,
            _client_info: &str,
        ) -> Result<AuthInitiate, TransportError> {
            Ok(AuthInitiate {
                url: "/auth/abc".to_string(),
            })
        }

        async fn auth_confirm(&self, _client_id: &str) -> Result<AuthConfirm, TransportError> {
            let mut responses = self.confirm_responses.lock().unwrap();
            if responses.is_empty() {
                Ok(AuthConfirm::default())
            } else {
                Ok(responses.remove(0))
            }
        }

        async fn user_info(
            &self,
            _plugin_version: &str,
        ) -> Result<serde_json::Value, TransportError> {
            if let Some(status) = *self.user_status.lock().unwrap() {
                return Err(TransportError::http(status, "denied", "https://api/user", None));
            }
            Ok(serde_json::json!({
                "id": "u-1",
                "name": "tester",
                "credits": 50,
                "images_generated": 7,
                "news": "New models available",
            }))
        }

        async fn plugin_resources(&self) -> Result<serde_json::Value, TransportError> {
            Ok(serde_json::json!({ "checkpoints": ["base"] }))
        }

        async fn generate(
            &self,
            _body: &serde_json::Value,
        ) -> Result<RemoteJob, TransportError> {
            Ok(RemoteJob::default())
        }

        async fn job_status(&self, _remote_id: &str) -> Result<RemoteJob, TransportError> {
            Ok(RemoteJob::default())
        }

        async fn cancel_job(
            &self,
            _worker_id: &str,
            _remote_id: &str,
        ) -> Result<(), TransportError> {
            Ok(())
        }

        async fn image_upload_slot(&self) -> Result<ImageUploadSlot, TransportError> {
            Err(TransportError::network("upload/image", "not scripted"))
        }

        async fn lora_upload_slot(
            &self,
            _hash: &str,
            _size: u64,
        ) -> Result<LoraUploadSlot, TransportError> {
            Err(TransportError::network("upload/lora", "not scripted"))
        }

        async fn put_object(&self, _url: &str, _data: Vec<u8>) -> Result<(), TransportError> {
            Ok(())
        }

        async fn upload_object(
            &self,
            _url: &str,
            _data: Vec<u8>,
            _sha256_b64: &str,
        ) -> Result<(), TransportError> {
            Ok(())
        }

        async fn download(&self, _url: &str) -> Result<Vec<u8>, TransportError> {
            Ok(Vec::new())
        }
    }

    fn test_config() -> CloudConfig {
        CloudConfig {
            api_url: "https://api.test".to_string(),
            web_url: "https://web.test".to_string(),
        }
    }

    fn engine_with(api: AuthApi) -> CloudEngine {
        CloudEngine::with_api(Arc::new(JobRegistry::new()), Arc::new(api), test_config())
    }

    #[tokio::test]
    async fn authenticate_loads_account_state() {
        let engine = engine_with(AuthApi::default());

        let user = engine.authenticate("tok").await.unwrap();
        assert_eq!(user.id, "u-1");
        assert_eq!(user.credits, 50);
        assert!(engine.is_connected());
        assert_eq!(engine.news().unwrap().text, "New models available");
        assert_eq!(engine.models()["checkpoints"][0], "base");
    }

    #[tokio::test]
    async fn authenticate_rejects_empty_token() {
        let engine = engine_with(AuthApi::default());
        assert_matches!(
            engine.authenticate("").await,
            Err(CloudEngineError::MissingToken)
        );
    }

    #[tokio::test]
    async fn rejected_token_is_scrubbed_with_sign_in_hint() {
        let engine = engine_with(AuthApi::failing_with(401));

        let err = engine.authenticate("bad").await.unwrap_err();
        assert_matches!(&err, CloudEngineError::Transport(e) => {
            assert_eq!(e.message, "The login data is incorrect, please sign in again.");
        });
        assert!(!engine.is_connected());
        assert!(engine.token.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn transient_failure_keeps_previous_token() {
        let api = Arc::new(AuthApi::default());
        let engine =
            CloudEngine::with_api(Arc::new(JobRegistry::new()), api.clone(), test_config());
        engine.authenticate("good").await.unwrap();

        *api.user_status.lock().unwrap() = Some(503);
        assert!(engine.authenticate("newer").await.is_err());
        assert_eq!(engine.token.lock().unwrap().as_deref(), Some("good"));
        assert_eq!(api.token.lock().unwrap().as_deref(), Some("good"));
    }

    #[tokio::test]
    async fn confirm_before_start_is_an_error() {
        let engine = engine_with(AuthApi::default());
        assert_matches!(
            engine.confirm_sign_in().await,
            Err(CloudEngineError::SignInNotStarted)
        );
    }

    #[tokio::test]
    async fn sign_in_flow_pending_then_authorized() {
        let api = AuthApi::default();
        api.confirm_responses.lock().unwrap().extend([
            AuthConfirm {
                status: "not-found".to_string(),
                token: None,
            },
            AuthConfirm {
                status: "authorized".to_string(),
                token: Some("fresh-token".to_string()),
            },
        ]);
        let engine = engine_with(api);

        let url = engine.start_sign_in().await.unwrap();
        assert_eq!(url, "https://web.test/auth/abc");

        assert!(engine.confirm_sign_in().await.unwrap().is_none());
        let (token, user) = engine.confirm_sign_in().await.unwrap().unwrap();
        assert_eq!(token, "fresh-token");
        assert_eq!(user.id, "u-1");
        assert!(engine.is_connected());
    }

    #[tokio::test]
    async fn sign_in_denial_clears_handshake_state() {
        let api = AuthApi::default();
        api.confirm_responses.lock().unwrap().push(AuthConfirm {
            status: "denied".to_string(),
            token: None,
        });
        let engine = engine_with(api);

        engine.start_sign_in().await.unwrap();
        assert_matches!(
            engine.confirm_sign_in().await,
            Err(CloudEngineError::AuthorizationFailed(status)) if status == "denied"
        );
        // The handshake must be restarted from scratch.
        assert_matches!(
            engine.confirm_sign_in().await,
            Err(CloudEngineError::SignInNotStarted)
        );
    }

    #[tokio::test]
    async fn submit_requires_connection() {
        let engine = engine_with(AuthApi::default());
        let result = engine
            .submit(serde_json::json!({}), None, Vec::new())
            .await;
        assert_matches!(result, Err(CloudEngineError::NotConnected));
    }

    #[tokio::test]
    async fn cancel_unknown_job_returns_false() {
        let engine = engine_with(AuthApi::default());
        assert!(!engine.cancel("missing").await);
    }

    #[tokio::test]
    async fn disconnect_clears_session() {
        let engine = engine_with(AuthApi::default());
        engine.authenticate("tok").await.unwrap();
        assert!(engine.is_connected());

        engine.disconnect().await;
        assert!(!engine.is_connected());
        assert!(engine.user().is_none());
    }
}
