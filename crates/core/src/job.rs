//! Job record and status types shared by both backend engines.
//!
//! One [`JobRecord`] exists per submitted generation job, keyed by a
//! UUID v4 [`JobId`] that is never reused for the lifetime of the
//! process. Exactly one task mutates a given record: the WebSocket
//! listener for local jobs, or the job's own background task for cloud
//! jobs. Everything else only reads.

use serde::Serialize;

/// Unique job identifier (UUID v4 string).
pub type JobId = String;

/// Generate a fresh job identifier.
pub fn new_job_id() -> JobId {
    uuid::Uuid::new_v4().to_string()
}

/// Lifecycle status of a generation job.
///
/// Covers both backends; each engine only emits its own subset.
/// The local engine uses `Queued`, `Executing`, `Finished`, `Error`,
/// `Interrupted`. The cloud engine uses `Queued`, `Uploading`,
/// `InQueue`, `InProgress`, `Finished`, `Error`, `Cancelled`,
/// `TimedOut`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Uploading,
    Executing,
    InQueue,
    InProgress,
    Finished,
    Error,
    Cancelled,
    Interrupted,
    TimedOut,
}

impl JobStatus {
    /// Whether this status is terminal (no further transitions).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Finished
                | JobStatus::Error
                | JobStatus::Cancelled
                | JobStatus::Interrupted
                | JobStatus::TimedOut
        )
    }

    /// Whether this is the terminal success state. `images` is only
    /// meaningful once this returns true.
    pub fn is_success(self) -> bool {
        matches!(self, JobStatus::Finished)
    }

    /// Wire name of the status (the snake_case serde value).
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Uploading => "uploading",
            JobStatus::Executing => "executing",
            JobStatus::InQueue => "in_queue",
            JobStatus::InProgress => "in_progress",
            JobStatus::Finished => "finished",
            JobStatus::Error => "error",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Interrupted => "interrupted",
            JobStatus::TimedOut => "timed_out",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured payload attached to a job when the cloud service answers
/// HTTP 402. Carries the call-to-action the UI needs.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentRequired {
    /// Checkout / account URL for the user to open.
    pub url: String,
    /// Remaining credit balance, when the server included one.
    pub credits: Option<i64>,
    /// Raw error details from the server, verbatim.
    pub details: Option<serde_json::Value>,
}

/// Mutable state of one generation job.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub status: JobStatus,
    /// Completion in `[0, 1]`. Non-decreasing while running; reset to 0
    /// only by the local execution-start event.
    pub progress: f64,
    /// Result images, append-only, in arrival order.
    pub images: Vec<Vec<u8>>,
    /// Terminal error message. Set at most once, never cleared.
    pub error: Option<String>,

    // Local backend bookkeeping.
    pub node_count: u32,
    pub sample_count: u32,
    pub nodes_done: u32,
    pub samples_done: u32,
    pub batch_size: u32,
    /// Starting seed. Image `i` used `seed + i`.
    pub seed: i64,

    // Cloud backend bookkeeping.
    /// Cooperative cancellation flag checked by the job's poll loop.
    pub cancel_requested: bool,
    /// Remote job identifier, needed for status polling and cancellation.
    pub remote_id: Option<String>,
    /// Remote worker identifier, needed for cancellation.
    pub worker_id: Option<String>,
    pub payment_required: Option<PaymentRequired>,
}

impl Default for JobRecord {
    fn default() -> Self {
        Self {
            status: JobStatus::Queued,
            progress: 0.0,
            images: Vec::new(),
            error: None,
            node_count: 0,
            sample_count: 0,
            nodes_done: 0,
            samples_done: 0,
            batch_size: 1,
            seed: 0,
            cancel_requested: false,
            remote_id: None,
            worker_id: None,
            payment_required: None,
        }
    }
}

impl JobRecord {
    /// Record a terminal error. The first message wins.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = JobStatus::Error;
        if self.error.is_none() {
            self.error = Some(message.into());
        }
    }

    /// Read-only snapshot for the route layer (no image bytes).
    pub fn view(&self, job_id: &str) -> JobView {
        JobView {
            job_id: job_id.to_string(),
            status: self.status,
            progress: self.progress,
            error: self.error.clone(),
            image_count: self.images.len(),
            seeds: (0..self.images.len() as i64).map(|i| self.seed + i).collect(),
            payment_required: self.payment_required.clone(),
        }
    }
}

/// Caller-facing snapshot of a job, safe to serialize into a response.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: f64,
    pub error: Option<String>,
    pub image_count: usize,
    /// Per-image seeds (`seed + index`), one per fetched image.
    pub seeds: Vec<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_required: Option<PaymentRequired>,
}
