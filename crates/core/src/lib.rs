//! Shared job model for the generation bridge.
//!
//! Holds the backend-agnostic pieces both engines build on: the job
//! record and status machine, the in-memory job registry, offset-based
//! result blob splitting, and hashing helpers.

pub mod hashing;
pub mod image_data;
pub mod job;
pub mod registry;

pub use job::{JobId, JobRecord, JobStatus, JobView, PaymentRequired};
pub use registry::JobRegistry;
