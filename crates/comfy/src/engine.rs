//! Connection and job management for the local workflow server.
//!
//! [`ComfyEngine`] owns at most one live connection: a probed REST
//! surface plus a single listener task that drives job records in the
//! shared registry. Created once at composition time and handed to the
//! facade by reference; there is no ambient global instance.

use std::sync::Arc;

use bridge_core::job::new_job_id;
use bridge_core::{JobId, JobRecord, JobRegistry, JobStatus};
use bridge_transport::TransportError;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::api::{ComfyApi, ComfyHttp};
use crate::listener::{run_listener, websocket_url};

/// Engine for the local (push-based) backend.
pub struct ComfyEngine {
    registry: Arc<JobRegistry>,
    state: tokio::sync::Mutex<Option<Connection>>,
}

/// Live connection state.
struct Connection {
    api: Arc<dyn ComfyApi>,
    /// Stable per-connection client identifier, used to correlate
    /// listener events with submissions.
    client_id: String,
    cancel: CancellationToken,
    listener: Option<tokio::task::JoinHandle<()>>,
}

/// Errors surfaced synchronously by engine operations. Failures during
/// asynchronous listener dispatch never appear here -- they are
/// absorbed into the affected job record.
#[derive(Debug, thiserror::Error)]
pub enum ComfyEngineError {
    /// No live connection; call `connect` first.
    #[error("Not connected to the workflow server")]
    NotConnected,

    /// The connect-time health probe failed. No partial state is kept.
    #[error("Failed to connect to the workflow server: {0}")]
    Connect(TransportError),

    /// The workflow submission call failed.
    #[error("Failed to submit workflow: {0}")]
    Submit(TransportError),

    /// The job id is not tracked by the registry.
    #[error("Job {0} not found")]
    JobNotFound(String),
}

impl ComfyEngine {
    pub fn new(registry: Arc<JobRegistry>) -> Self {
        Self {
            registry,
            state: tokio::sync::Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.is_some()
    }

    /// Connect to the workflow server.
    ///
    /// Performs a bounded health probe, then starts exactly one
    /// background listener task and marks the connection live. On probe
    /// failure any partial state is torn down and the failure is
    /// returned; the engine never retries connect on its own.
    pub async fn connect(
        &self,
        url: &str,
        auth_token: Option<String>,
    ) -> Result<(), ComfyEngineError> {
        let api = Arc::new(ComfyHttp::new(url, auth_token.clone()));

        match api.system_stats().await {
            Ok(stats) => {
                tracing::info!(
                    devices = %stats["devices"],
                    url = %api.url(),
                    "Connected to workflow server",
                );
            }
            Err(e) => {
                api.close().await;
                return Err(ComfyEngineError::Connect(e));
            }
        }

        let client_id = uuid::Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let listener = tokio::spawn(run_listener(
            websocket_url(api.url(), &client_id),
            auth_token,
            Arc::clone(&self.registry),
            Arc::clone(&api) as Arc<dyn ComfyApi>,
            cancel.clone(),
        ));

        let connection = Connection {
            api,
            client_id,
            cancel,
            listener: Some(listener),
        };

        // Replacing an existing connection tears the old one down first.
        if let Some(previous) = self.state.lock().await.replace(connection) {
            previous.shutdown().await;
        }
        Ok(())
    }

    /// Submit a compiled workflow. Requires a live connection.
    ///
    /// The job record is created (status queued) before the POST is
    /// issued, so listener events arriving concurrently always find an
    /// existing record. A negative seed is replaced with a random
    /// non-negative one; image `i` of the batch uses `seed + i`.
    pub async fn submit(
        &self,
        workflow: &serde_json::Value,
        batch_size: u32,
        seed: i64,
    ) -> Result<JobId, ComfyEngineError> {
        let state = self.state.lock().await;
        let connection = state.as_ref().ok_or(ComfyEngineError::NotConnected)?;

        let job_id = new_job_id();
        let seed = if seed < 0 {
            rand::rng().random_range(0..(1_i64 << 31))
        } else {
            seed
        };

        let record = JobRecord {
            status: JobStatus::Queued,
            node_count: workflow.as_object().map(|o| o.len()).unwrap_or(0) as u32,
            sample_count: count_samples(workflow),
            batch_size,
            seed,
            ..Default::default()
        };
        self.registry.insert(&job_id, record).await;

        if let Err(e) = connection
            .api
            .submit_prompt(workflow, &connection.client_id, &job_id)
            .await
        {
            self.registry
                .update(&job_id, |job| job.fail(e.to_string()))
                .await;
            return Err(ComfyEngineError::Submit(e));
        }

        tracing::info!(job_id = %job_id, batch_size, seed, "Workflow submitted");
        Ok(job_id)
    }

    /// Cancel a queued or running job.
    ///
    /// The record is marked interrupted immediately; the remote queue
    /// delete is attempted afterwards and its outcome is returned, but
    /// does not gate the local status change. No distinction is made
    /// between "removed from queue" and "interrupted mid-execution".
    pub async fn cancel(&self, job_id: &str) -> Result<bool, ComfyEngineError> {
        let state = self.state.lock().await;
        let connection = state.as_ref().ok_or(ComfyEngineError::NotConnected)?;

        let known = self
            .registry
            .update(job_id, |job| job.status = JobStatus::Interrupted)
            .await;
        if !known {
            return Err(ComfyEngineError::JobNotFound(job_id.to_string()));
        }

        match connection.api.delete_queued(job_id).await {
            Ok(()) => {
                tracing::info!(job_id = %job_id, "Job cancelled");
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Remote queue delete failed");
                Ok(false)
            }
        }
    }

    /// Tear down the connection: stop the listener, close the event
    /// channel and the HTTP session. Idempotent.
    pub async fn disconnect(&self) {
        if let Some(connection) = self.state.lock().await.take() {
            connection.shutdown().await;
            tracing::info!("Disconnected from workflow server");
        }
    }
}

impl Connection {
    async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(listener) = self.listener.take() {
            let _ = listener.await;
        }
        self.api.close().await;
    }
}

/// Total sampler steps declared by the graph, summed across nodes that
/// carry an `inputs.steps` field. Informational; progress math uses the
/// event-supplied totals.
fn count_samples(workflow: &serde_json::Value) -> u32 {
    workflow
        .as_object()
        .map(|nodes| {
            nodes
                .values()
                .filter_map(|node| node["inputs"]["steps"].as_u64())
                .sum::<u64>() as u32
        })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Scripted API surface. `fail_delete` controls the queue-delete
    /// outcome; `saw_record_at_submit` captures whether the registry
    /// entry existed when the POST was issued.
    struct ScriptedApi {
        registry: Arc<JobRegistry>,
        fail_submit: bool,
        fail_delete: bool,
        saw_record_at_submit: AtomicBool,
    }

    impl ScriptedApi {
        fn new(registry: Arc<JobRegistry>) -> Self {
            Self {
                registry,
                fail_submit: false,
                fail_delete: false,
                saw_record_at_submit: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl ComfyApi for ScriptedApi {
        async fn system_stats(&self) -> Result<serde_json::Value, TransportError> {
            Ok(serde_json::json!({"devices": []}))
        }

        async fn submit_prompt(
            &self,
            _workflow: &serde_json::Value,
            _client_id: &str,
            prompt_id: &str,
        ) -> Result<(), TransportError> {
            self.saw_record_at_submit
                .store(self.registry.contains(prompt_id).await, Ordering::SeqCst);
            if self.fail_submit {
                return Err(TransportError::network("http://test/prompt", "refused"));
            }
            Ok(())
        }

        async fn delete_queued(&self, _prompt_id: &str) -> Result<(), TransportError> {
            if self.fail_delete {
                return Err(TransportError::http(500, "boom", "http://test/queue", None));
            }
            Ok(())
        }

        async fn view_image(
            &self,
            _filename: &str,
            _subfolder: &str,
            _image_type: &str,
        ) -> Result<Vec<u8>, TransportError> {
            Ok(vec![])
        }

        async fn image_by_id(&self, _image_id: &str) -> Result<Vec<u8>, TransportError> {
            Ok(vec![])
        }
    }

    async fn connected_engine(api: Arc<ScriptedApi>) -> ComfyEngine {
        let engine = ComfyEngine::new(Arc::clone(&api.registry));
        let connection = Connection {
            api,
            client_id: "test-client".to_string(),
            cancel: CancellationToken::new(),
            listener: None,
        };
        *engine.state.lock().await = Some(connection);
        engine
    }

    #[tokio::test]
    async fn submit_requires_connection() {
        let engine = ComfyEngine::new(Arc::new(JobRegistry::new()));
        let result = engine.submit(&serde_json::json!({}), 1, 0).await;
        assert_matches!(result, Err(ComfyEngineError::NotConnected));
    }

    #[tokio::test]
    async fn submit_creates_queued_record_before_post() {
        let registry = Arc::new(JobRegistry::new());
        let api = Arc::new(ScriptedApi::new(Arc::clone(&registry)));
        let engine = connected_engine(Arc::clone(&api)).await;

        let job_id = engine
            .submit(&serde_json::json!({"5": {"inputs": {"steps": 20}}}), 2, 7)
            .await
            .unwrap();

        assert!(api.saw_record_at_submit.load(Ordering::SeqCst));
        let view = registry.view(&job_id).await.unwrap();
        assert_eq!(view.status, JobStatus::Queued);
        let (seed, batch, samples) = registry
            .read(&job_id, |j| (j.seed, j.batch_size, j.sample_count))
            .await
            .unwrap();
        assert_eq!(seed, 7);
        assert_eq!(batch, 2);
        assert_eq!(samples, 20);
    }

    #[tokio::test]
    async fn negative_seed_is_replaced() {
        let registry = Arc::new(JobRegistry::new());
        let api = Arc::new(ScriptedApi::new(Arc::clone(&registry)));
        let engine = connected_engine(api).await;

        let job_id = engine.submit(&serde_json::json!({}), 1, -1).await.unwrap();
        let seed = registry.read(&job_id, |j| j.seed).await.unwrap();
        assert!(seed >= 0);
    }

    #[tokio::test]
    async fn failed_submit_marks_job_error() {
        let registry = Arc::new(JobRegistry::new());
        let mut api = ScriptedApi::new(Arc::clone(&registry));
        api.fail_submit = true;
        let engine = connected_engine(Arc::new(api)).await;

        let result = engine.submit(&serde_json::json!({}), 1, 0).await;
        assert_matches!(result, Err(ComfyEngineError::Submit(_)));
        // The record still exists and carries the failure.
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn cancel_marks_interrupted_when_remote_delete_succeeds() {
        let registry = Arc::new(JobRegistry::new());
        let api = Arc::new(ScriptedApi::new(Arc::clone(&registry)));
        let engine = connected_engine(api).await;

        let job_id = engine.submit(&serde_json::json!({}), 1, 0).await.unwrap();
        let remote_ok = engine.cancel(&job_id).await.unwrap();
        assert!(remote_ok);
        let view = registry.view(&job_id).await.unwrap();
        assert_eq!(view.status, JobStatus::Interrupted);
    }

    #[tokio::test]
    async fn cancel_marks_interrupted_even_when_remote_delete_fails() {
        let registry = Arc::new(JobRegistry::new());
        let mut api = ScriptedApi::new(Arc::clone(&registry));
        api.fail_delete = true;
        let engine = connected_engine(Arc::new(api)).await;

        let job_id = engine.submit(&serde_json::json!({}), 1, 0).await.unwrap();
        let remote_ok = engine.cancel(&job_id).await.unwrap();
        assert!(!remote_ok);
        let view = registry.view(&job_id).await.unwrap();
        assert_eq!(view.status, JobStatus::Interrupted);
    }

    #[tokio::test]
    async fn cancel_unknown_job_is_not_found() {
        let registry = Arc::new(JobRegistry::new());
        let api = Arc::new(ScriptedApi::new(Arc::clone(&registry)));
        let engine = connected_engine(api).await;

        let result = engine.cancel("nope").await;
        assert_matches!(result, Err(ComfyEngineError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let registry = Arc::new(JobRegistry::new());
        let api = Arc::new(ScriptedApi::new(Arc::clone(&registry)));
        let engine = connected_engine(api).await;

        assert!(engine.is_connected().await);
        engine.disconnect().await;
        engine.disconnect().await;
        assert!(!engine.is_connected().await);
    }

    #[test]
    fn count_samples_sums_step_inputs() {
        let workflow = serde_json::json!({
            "1": {"class_type": "CheckpointLoaderSimple", "inputs": {}},
            "5": {"class_type": "KSampler", "inputs": {"steps": 20}},
            "8": {"class_type": "KSampler", "inputs": {"steps": 12}},
        });
        assert_eq!(count_samples(&workflow), 32);
        assert_eq!(count_samples(&serde_json::json!([])), 0);
    }
}
