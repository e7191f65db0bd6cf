//! Backend-agnostic facade over the two generation engines.
//!
//! The facade owns the shared job registry and a tagged backend value,
//! and routes `submit`/`status`/`images`/`cancel` to whichever engine
//! holds the current connection. Status and image reads never touch the
//! backend at all; they only read the registry. Intended to be created
//! once at composition time and handed to the route layer by reference.

use std::sync::Arc;

use bridge_cloud::{CloudConfig, CloudEngine, CloudEngineError, ImagePayload, LoraPayload};
use bridge_comfy::{ComfyEngine, ComfyEngineError};
use bridge_core::{JobId, JobRegistry, JobStatus, JobView};

/// One generation request, covering both backends. The local backend
/// uses `batch_size` and `seed`; the cloud backend uses `images` and
/// `loras`. Unused fields are ignored by the other backend.
#[derive(Debug, Default)]
pub struct GenerationRequest {
    /// Compiled workflow graph.
    pub workflow: serde_json::Value,
    pub batch_size: u32,
    /// Starting seed; negative requests a random one.
    pub seed: i64,
    /// Control-image blob for the cloud backend.
    pub images: Option<ImagePayload>,
    /// LoRA weights to upload for the cloud backend.
    pub loras: Vec<LoraPayload>,
}

impl GenerationRequest {
    pub fn new(workflow: serde_json::Value) -> Self {
        Self {
            workflow,
            batch_size: 1,
            seed: -1,
            images: None,
            loras: Vec::new(),
        }
    }
}

/// The currently selected backend.
pub enum Backend {
    Local(ComfyEngine),
    Cloud(CloudEngine),
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Job {0} not found")]
    NotFound(String),

    /// Images were requested before the job reached its terminal
    /// success state.
    #[error("Job is not finished (status: {0})")]
    NotFinished(JobStatus),

    #[error("Job finished without result images")]
    NoImages,

    #[error("Image index {index} out of range ({count} images)")]
    IndexOutOfRange { index: usize, count: usize },

    #[error(transparent)]
    Local(#[from] ComfyEngineError),

    #[error(transparent)]
    Cloud(#[from] CloudEngineError),
}

/// Facade over the selected backend engine and the shared registry.
pub struct Engine {
    registry: Arc<JobRegistry>,
    backend: Backend,
}

impl Engine {
    /// Wrap an already-constructed backend. The backend must share the
    /// given registry.
    pub fn new(registry: Arc<JobRegistry>, backend: Backend) -> Self {
        Self { registry, backend }
    }

    /// Fresh engine over the local workflow server backend. Call
    /// [`ComfyEngine::connect`] on the backend before submitting.
    pub fn local() -> Self {
        let registry = Arc::new(JobRegistry::new());
        let backend = Backend::Local(ComfyEngine::new(Arc::clone(&registry)));
        Self { registry, backend }
    }

    /// Fresh engine over the cloud backend. Authenticate on the backend
    /// before submitting.
    pub fn cloud(config: CloudConfig) -> Self {
        let registry = Arc::new(JobRegistry::new());
        let backend = Backend::Cloud(CloudEngine::new(Arc::clone(&registry), config));
        Self { registry, backend }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn as_local(&self) -> Option<&ComfyEngine> {
        match &self.backend {
            Backend::Local(engine) => Some(engine),
            Backend::Cloud(_) => None,
        }
    }

    pub fn as_cloud(&self) -> Option<&CloudEngine> {
        match &self.backend {
            Backend::Cloud(engine) => Some(engine),
            Backend::Local(_) => None,
        }
    }

    /// Submit a generation request to the current backend.
    pub async fn submit(&self, request: GenerationRequest) -> Result<JobId, EngineError> {
        match &self.backend {
            Backend::Local(engine) => Ok(engine
                .submit(&request.workflow, request.batch_size, request.seed)
                .await?),
            Backend::Cloud(engine) => Ok(engine
                .submit(request.workflow, request.images, request.loras)
                .await?),
        }
    }

    /// Snapshot of a job's state, regardless of backend.
    pub async fn status(&self, job_id: &str) -> Result<JobView, EngineError> {
        self.registry
            .view(job_id)
            .await
            .ok_or_else(|| EngineError::NotFound(job_id.to_string()))
    }

    /// All result images of a finished job.
    pub async fn images(&self, job_id: &str) -> Result<Vec<Vec<u8>>, EngineError> {
        let status = self
            .registry
            .read(job_id, |job| job.status)
            .await
            .ok_or_else(|| EngineError::NotFound(job_id.to_string()))?;
        if !status.is_success() {
            return Err(EngineError::NotFinished(status));
        }

        let images = self.registry.images(job_id).await.unwrap_or_default();
        if images.is_empty() {
            return Err(EngineError::NoImages);
        }
        Ok(images)
    }

    /// A single result image by batch index.
    pub async fn image(&self, job_id: &str, index: usize) -> Result<Vec<u8>, EngineError> {
        let mut images = self.images(job_id).await?;
        let count = images.len();
        if index >= count {
            return Err(EngineError::IndexOutOfRange { index, count });
        }
        Ok(images.swap_remove(index))
    }

    /// Request cancellation. Returns false for unknown jobs (or, for
    /// the local backend, when there is no live connection).
    pub async fn cancel(&self, job_id: &str) -> bool {
        match &self.backend {
            Backend::Local(engine) => engine.cancel(job_id).await.is_ok(),
            Backend::Cloud(engine) => engine.cancel(job_id).await,
        }
    }

    /// Tear down the backend connection. Job records are kept.
    pub async fn disconnect(&self) {
        match &self.backend {
            Backend::Local(engine) => engine.disconnect().await,
            Backend::Cloud(engine) => engine.disconnect().await,
        }
    }
}
