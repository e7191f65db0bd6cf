//! Cloud account state and wire types.

use serde::{Deserialize, Serialize};

use bridge_core::hashing::sha256_hex;

/// The signed-in account, refreshed on authentication and whenever the
/// server reports an updated balance.
#[derive(Debug, Clone, Serialize)]
pub struct CloudUser {
    pub id: String,
    pub name: String,
    pub credits: i64,
    pub images_generated: i64,
}

/// Feature switches and limits granted to the account.
#[derive(Debug, Clone)]
pub struct CloudFeatures {
    pub ip_adapter: bool,
    pub translation: bool,
    /// Maximum LoRA upload size in bytes.
    pub max_upload_size: u64,
    /// Maximum control layers per conditioning block.
    pub max_control_layers: usize,
}

impl Default for CloudFeatures {
    fn default() -> Self {
        Self {
            ip_adapter: true,
            translation: true,
            max_upload_size: 300 * 1024 * 1024,
            max_control_layers: 4,
        }
    }
}

/// A service announcement, deduplicated client-side by digest.
#[derive(Debug, Clone, Serialize)]
pub struct CloudNews {
    pub text: String,
    /// First 16 hex chars of the SHA-256 of the text, so callers can
    /// remember which announcement was already shown.
    pub digest: String,
}

impl CloudNews {
    pub fn new(text: String) -> Self {
        let digest = sha256_hex(text.as_bytes())[..16].to_string();
        Self { text, digest }
    }
}

/// Control images for one job: a single concatenated blob plus the
/// start offset of each image within it.
#[derive(Debug, Clone)]
pub struct ImagePayload {
    pub bytes: Vec<u8>,
    pub offsets: Vec<usize>,
}

/// One LoRA model to upload alongside a job. `name` matches the
/// workflow's model reference.
#[derive(Debug, Clone)]
pub struct LoraPayload {
    pub name: String,
    pub bytes: Vec<u8>,
}

// ---- wire types ----

/// Remote job state as returned by enqueue and status calls. All
/// fields are optional on the wire; the pipeline validates what it
/// needs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteJob {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, rename = "worker_id")]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
    #[serde(default)]
    pub user: Option<RemoteUser>,
}

/// Account balance piggybacked on job responses.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteUser {
    #[serde(default)]
    pub credits: Option<i64>,
    #[serde(default)]
    pub images_generated: Option<i64>,
}

/// Server's answer to a LoRA upload request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoraUploadSlot {
    /// `cached`, `too-large`, `limit-exceeded`, or absent when a
    /// pre-signed upload URL is granted.
    #[serde(default)]
    pub status: Option<String>,
    /// Size ceiling in bytes, present with `too-large`.
    #[serde(default)]
    pub max: Option<u64>,
    #[serde(default)]
    pub url: Option<String>,
}

/// Pre-signed slot for an image blob upload.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageUploadSlot {
    pub url: String,
    /// Object key the workflow references after upload.
    pub object: String,
}

/// First step of the browser sign-in handshake.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthInitiate {
    /// Relative sign-in path to append to the web URL.
    pub url: String,
}

/// Poll result of the sign-in handshake.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfirm {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub token: Option<String>,
}
