//! Per-job background task: upload inputs, enqueue remotely, poll to a
//! terminal state, download results.
//!
//! One task exists per submitted job and is the only writer of that
//! job's record. Cancellation is cooperative: the task checks the
//! record's `cancel_requested` flag between stages and before every
//! status poll, and stops without issuing further remote calls.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bridge_core::image_data::{split_images, split_images_base64};
use bridge_core::{JobId, JobRegistry, JobStatus, PaymentRequired};
use bridge_transport::TransportError;

use crate::api::CloudApi;
use crate::types::{CloudUser, ImagePayload, LoraPayload, RemoteJob, RemoteUser};
use crate::upload;

/// Client version reported to the service.
pub const PLUGIN_VERSION: &str = "1.0.0";

/// Fixed delay between remote status polls.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Image blobs whose base64 encoding stays under this go inline in the
/// generate request instead of through object storage.
pub const MAX_INLINE_IMAGE_SIZE: usize = 4096;

/// Fallback message when the server answers 402 without one.
pub const DEFAULT_PAYMENT_MESSAGE: &str = "Insufficient credits. Please purchase more tokens.";

/// Message attached to jobs the server timed out.
pub const TIMEOUT_MESSAGE: &str = "Generation took too long and was cancelled (timeout)";

/// Failure inside one of the job stages.
#[derive(Debug, thiserror::Error)]
pub(crate) enum StageError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("{0}")]
    Invalid(String),
    /// Not a failure: the job's cancel flag was set.
    #[error("cancel requested")]
    Cancelled,
}

/// Everything one job's background task needs.
pub(crate) struct JobTask {
    pub registry: Arc<JobRegistry>,
    pub api: Arc<dyn CloudApi>,
    /// Web frontend base URL, for the payment-required link.
    pub web_url: String,
    pub job_id: JobId,
    pub workflow: serde_json::Value,
    pub images: Option<ImagePayload>,
    pub loras: Vec<LoraPayload>,
    /// Shared account state, updated from balances piggybacked on
    /// job responses.
    pub user: Arc<Mutex<Option<CloudUser>>>,
}

impl JobTask {
    /// Drive the job to a terminal state and record the outcome.
    pub(crate) async fn run(self) {
        let registry = Arc::clone(&self.registry);
        let job_id = self.job_id.clone();
        let web_url = self.web_url.clone();
        let user = Arc::clone(&self.user);

        match self.process().await {
            Ok(()) => {}
            Err(StageError::Cancelled) => {
                registry
                    .update(&job_id, |job| {
                        if !job.status.is_terminal() {
                            job.status = JobStatus::Cancelled;
                        }
                    })
                    .await;
                tracing::info!(job_id = %job_id, "Job cancelled");
            }
            Err(StageError::Transport(e)) if e.code == 402 => {
                let credits = e
                    .data
                    .as_ref()
                    .and_then(|d| d.get("credits"))
                    .and_then(|c| c.as_i64());
                if let Some(credits) = credits {
                    if let Ok(mut guard) = user.lock() {
                        if let Some(user) = guard.as_mut() {
                            user.credits = credits;
                        }
                    }
                }
                let message = if e.message.is_empty() {
                    DEFAULT_PAYMENT_MESSAGE.to_string()
                } else {
                    e.message.clone()
                };
                registry
                    .update(&job_id, |job| {
                        job.payment_required = Some(PaymentRequired {
                            url: format!("{web_url}/user"),
                            credits,
                            details: e.data.clone(),
                        });
                        job.fail(message.clone());
                    })
                    .await;
                tracing::warn!(job_id = %job_id, credits, "Job rejected, payment required");
            }
            Err(e) => {
                let message = e.to_string();
                registry
                    .update(&job_id, |job| job.fail(message.clone()))
                    .await;
                tracing::error!(job_id = %job_id, error = %message, "Job failed");
            }
        }
    }

    async fn process(mut self) -> Result<(), StageError> {
        // Stage 1: upload inputs.
        self.registry
            .update(&self.job_id, |job| job.status = JobStatus::Uploading)
            .await;
        upload::send_loras(self.api.as_ref(), &mut self.workflow, &self.loras).await?;
        upload::send_images(self.api.as_ref(), &mut self.workflow, self.images.as_ref()).await?;
        self.ensure_not_cancelled().await?;

        // Stage 2: enqueue and poll.
        self.registry
            .update(&self.job_id, |job| job.status = JobStatus::InQueue)
            .await;
        let workflow = std::mem::take(&mut self.workflow);
        let body = serde_json::json!({
            "input": {
                "workflow": workflow,
                "clientInfo": format!("ps-ai-diffusion {PLUGIN_VERSION}"),
                "options": { "useWebpCompression": false },
            }
        });
        let response = self.api.generate(&body).await?;
        let remote_id = response.id.clone().ok_or_else(|| {
            StageError::Invalid("Server response is missing the job id".to_string())
        })?;
        let worker_id = response.worker_id.clone();
        self.registry
            .update(&self.job_id, |job| {
                job.remote_id = Some(remote_id.clone());
                job.worker_id = worker_id.clone();
            })
            .await;
        self.apply_user_update(response.user.as_ref());
        tracing::info!(job_id = %self.job_id, remote_id = %remote_id, "Job enqueued remotely");

        let response = self.poll(&remote_id, response).await?;
        let status = response.status.clone().unwrap_or_default().to_lowercase();

        // Stage 3: resolve the terminal state.
        match status.as_str() {
            "completed" => {
                let descriptor = response
                    .output
                    .as_ref()
                    .and_then(|o| o.get("images"))
                    .cloned()
                    .unwrap_or_else(|| serde_json::json!({}));
                let images = self.receive_images(&descriptor).await?;
                let count = images.len();
                self.registry
                    .update(&self.job_id, |job| {
                        job.images = images;
                        job.status = JobStatus::Finished;
                        job.progress = 1.0;
                    })
                    .await;
                tracing::info!(job_id = %self.job_id, images = count, "Job finished");
                Ok(())
            }
            "failed" => {
                let message = render_remote_error(response.error.as_ref());
                self.registry
                    .update(&self.job_id, |job| job.fail(message.clone()))
                    .await;
                tracing::error!(job_id = %self.job_id, error = %message, "Job failed remotely");
                Ok(())
            }
            "cancelled" => {
                self.registry
                    .update(&self.job_id, |job| job.status = JobStatus::Cancelled)
                    .await;
                tracing::info!(job_id = %self.job_id, "Job cancelled remotely");
                Ok(())
            }
            "timed_out" => {
                self.registry
                    .update(&self.job_id, |job| {
                        job.status = JobStatus::TimedOut;
                        if job.error.is_none() {
                            job.error = Some(TIMEOUT_MESSAGE.to_string());
                        }
                    })
                    .await;
                tracing::warn!(job_id = %self.job_id, "Job timed out remotely");
                Ok(())
            }
            other => Err(StageError::Invalid(format!(
                "Unexpected remote job status: {other}"
            ))),
        }
    }

    /// Poll the remote job until it leaves the queue/progress states.
    /// Returns the last response, whose status is terminal.
    async fn poll(&self, remote_id: &str, first: RemoteJob) -> Result<RemoteJob, StageError> {
        let mut response = first;
        let mut status = response.status.clone().unwrap_or_default().to_lowercase();
        while status == "in_queue" || status == "in_progress" {
            self.ensure_not_cancelled().await?;
            response = self.api.job_status(remote_id).await?;
            status = response.status.clone().unwrap_or_default().to_lowercase();
            match status.as_str() {
                "in_queue" => {
                    self.registry
                        .update(&self.job_id, |job| job.status = JobStatus::InQueue)
                        .await;
                }
                "in_progress" => {
                    let progress = response
                        .output
                        .as_ref()
                        .and_then(|o| o.get("progress"))
                        .and_then(|p| p.as_f64())
                        .unwrap_or(0.09);
                    self.registry
                        .update(&self.job_id, |job| {
                            job.status = JobStatus::InProgress;
                            job.progress = job.progress.max(progress);
                        })
                        .await;
                }
                _ => {}
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        Ok(response)
    }

    /// Download and split the result images. An empty offsets list
    /// means the job produced no images.
    async fn receive_images(
        &self,
        images: &serde_json::Value,
    ) -> Result<Vec<Vec<u8>>, StageError> {
        let offsets: Vec<usize> = images
            .get("offsets")
            .and_then(|o| serde_json::from_value(o.clone()).ok())
            .unwrap_or_default();
        if offsets.is_empty() {
            return Ok(Vec::new());
        }

        if let Some(url) = images.get("url").and_then(|u| u.as_str()) {
            let data = self.api.download(url).await?;
            Ok(split_images(&data, &offsets))
        } else if let Some(b64) = images.get("base64").and_then(|b| b.as_str()) {
            split_images_base64(b64, &offsets)
                .map_err(|e| StageError::Invalid(format!("Invalid result image data: {e}")))
        } else {
            Err(StageError::Invalid(
                "No result images found in server response".to_string(),
            ))
        }
    }

    async fn ensure_not_cancelled(&self) -> Result<(), StageError> {
        let cancelled = self
            .registry
            .read(&self.job_id, |job| job.cancel_requested)
            .await
            .unwrap_or(true);
        if cancelled {
            Err(StageError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn apply_user_update(&self, update: Option<&RemoteUser>) {
        let Some(update) = update else { return };
        if let Ok(mut guard) = self.user.lock() {
            if let Some(user) = guard.as_mut() {
                if let Some(credits) = update.credits {
                    user.credits = credits;
                }
                if let Some(generated) = update.images_generated {
                    user.images_generated = generated;
                }
            }
        }
    }
}

/// Render the server's `error` field, which may be a plain string or a
/// structured value.
fn render_remote_error(error: Option<&serde_json::Value>) -> String {
    match error {
        None => "Generation failed".to_string(),
        Some(serde_json::Value::String(message)) => message.clone(),
        Some(other) => other.to_string(),
    }
}
