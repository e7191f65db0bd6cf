//! Local workflow-server backend engine.
//!
//! Manages one connection to a ComfyUI-protocol server: REST handshake,
//! a persistent WebSocket event listener, and submission/cancellation
//! calls. Listener events drive job records in the shared registry
//! through a push-based state machine.

pub mod api;
pub mod engine;
pub mod listener;
pub mod messages;

pub use api::{ComfyApi, ComfyHttp};
pub use engine::{ComfyEngine, ComfyEngineError};
