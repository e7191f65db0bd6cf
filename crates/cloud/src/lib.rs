//! Cloud backend engine: authenticated submit-and-poll generation over
//! the hosted service's REST API.
//!
//! The engine uploads workflow inputs (control images, LoRA weights),
//! enqueues the job remotely, and spawns one background task per job
//! that polls status at a fixed interval until the remote job reaches a
//! terminal state. No WebSocket is involved.

pub mod api;
pub mod config;
pub mod engine;
pub mod limits;
pub mod pipeline;
pub mod types;
mod upload;

pub use api::{CloudApi, CloudHttp};
pub use config::CloudConfig;
pub use engine::{CloudEngine, CloudEngineError};
pub use types::{CloudFeatures, CloudNews, CloudUser, ImagePayload, LoraPayload};
