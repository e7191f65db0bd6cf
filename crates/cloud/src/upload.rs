//! Input uploads performed before a job is enqueued.
//!
//! LoRA weights are content-addressed: the storage id is the base64
//! SHA-256 of the bytes, so the server can answer `cached` and skip
//! the transfer entirely. Control images travel inline as base64 when
//! small, or through a pre-signed object-storage slot when large.

use base64::Engine as _;
use bridge_core::hashing::sha256_base64;

use crate::api::CloudApi;
use crate::pipeline::{StageError, MAX_INLINE_IMAGE_SIZE};
use crate::types::{ImagePayload, LoraPayload};

/// Upload the LoRA models a workflow references and rewrite each model
/// entry to point at its storage id. Payloads the workflow does not
/// reference by name are skipped.
pub(crate) async fn send_loras(
    api: &dyn CloudApi,
    workflow: &mut serde_json::Value,
    payloads: &[LoraPayload],
) -> Result<(), StageError> {
    if payloads.is_empty() {
        return Ok(());
    }
    let Some(loras) = workflow
        .get_mut("models")
        .and_then(|m| m.get_mut("loras"))
        .and_then(|l| l.as_array_mut())
    else {
        return Ok(());
    };

    for entry in loras {
        let Some(name) = entry.get("name").and_then(|n| n.as_str()) else {
            continue;
        };
        let Some(payload) = payloads.iter().find(|p| p.name == name) else {
            continue;
        };
        let storage_id = sha256_base64(&payload.bytes);
        entry["storage_id"] = serde_json::Value::String(storage_id.clone());
        upload_lora(api, &storage_id, &payload.bytes).await?;
    }
    Ok(())
}

async fn upload_lora(
    api: &dyn CloudApi,
    storage_id: &str,
    data: &[u8],
) -> Result<(), StageError> {
    let slot = api.lora_upload_slot(storage_id, data.len() as u64).await?;
    match slot.status.as_deref() {
        Some("cached") => {
            tracing::debug!(storage_id, "LoRA already cached, skipping upload");
            Ok(())
        }
        Some("too-large") => {
            let max_mb = slot.max.unwrap_or(0) as f64 / (1024.0 * 1024.0);
            Err(StageError::Invalid(format!(
                "LoRA model is too large to upload (max {max_mb:.1} MB)"
            )))
        }
        Some("limit-exceeded") => Err(StageError::Invalid(
            "Can't upload LoRA model, limit exceeded".to_string(),
        )),
        _ => {
            let url = slot.url.ok_or_else(|| {
                StageError::Invalid("Invalid upload URL for LoRA model".to_string())
            })?;
            tracing::info!(storage_id, size = data.len(), "Uploading LoRA model");
            api.upload_object(&url, data.to_vec(), storage_id).await?;
            Ok(())
        }
    }
}

/// Attach the control-image blob to the workflow, inline as base64 when
/// its encoded size stays under [`MAX_INLINE_IMAGE_SIZE`], otherwise
/// via a pre-signed object upload.
pub(crate) async fn send_images(
    api: &dyn CloudApi,
    workflow: &mut serde_json::Value,
    images: Option<&ImagePayload>,
) -> Result<(), StageError> {
    let Some(payload) = images else {
        return Ok(());
    };
    let Some(workflow) = workflow.as_object_mut() else {
        return Err(StageError::Invalid("Workflow is not a JSON object".to_string()));
    };

    let encoded_size = payload.bytes.len().div_ceil(3) * 4;
    let image_data = if encoded_size < MAX_INLINE_IMAGE_SIZE {
        let encoded = base64::engine::general_purpose::STANDARD.encode(&payload.bytes);
        serde_json::json!({ "base64": encoded, "offsets": payload.offsets })
    } else {
        let slot = api.image_upload_slot().await?;
        tracing::info!(size = payload.bytes.len(), "Uploading control images");
        api.put_object(&slot.url, payload.bytes.clone()).await?;
        serde_json::json!({ "s3_object": slot.object, "offsets": payload.offsets })
    };
    workflow.insert("image_data".to_string(), image_data);
    Ok(())
}
