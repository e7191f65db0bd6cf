//! WebSocket listener: one long-lived task per connection.
//!
//! Reads raw frames from the server's event channel, parses them into
//! typed [`ComfyMessage`] variants, and applies them to job records in
//! arrival order. On unexpected disconnect the task waits a fixed delay
//! and reconnects for as long as the connection is still live; a
//! deliberate disconnect (cancellation) exits without reconnecting.
//! Missed events are not replayed.

use std::sync::Arc;
use std::time::Duration;

use bridge_core::{JobRegistry, JobStatus};
use futures::StreamExt;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::api::ComfyApi;
use crate::messages::{decode_binary_frame, parse_message, ComfyMessage};

/// Fixed delay before reconnecting after an unexpected disconnect.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Derive the event-channel URL from the HTTP base URL and client id.
pub fn websocket_url(base_url: &str, client_id: &str) -> String {
    let ws_base = if let Some(rest) = base_url.strip_prefix("https") {
        format!("wss{rest}")
    } else if let Some(rest) = base_url.strip_prefix("http") {
        format!("ws{rest}")
    } else {
        base_url.to_string()
    };
    format!("{ws_base}/ws?clientId={client_id}")
}

/// Long-lived listener loop. Runs until the token is cancelled.
pub(crate) async fn run_listener(
    ws_url: String,
    auth_token: Option<String>,
    registry: Arc<JobRegistry>,
    api: Arc<dyn ComfyApi>,
    cancel: CancellationToken,
) {
    loop {
        let request = match build_request(&ws_url, auth_token.as_deref()) {
            Ok(request) => request,
            Err(e) => {
                tracing::error!(error = %e, url = %ws_url, "Invalid WebSocket URL");
                return;
            }
        };

        let connected = tokio::select! {
            _ = cancel.cancelled() => return,
            result = connect_async(request) => result,
        };

        match connected {
            Ok((mut ws_stream, _response)) => {
                tracing::info!(url = %ws_url, "Event channel connected");
                read_frames(&mut ws_stream, &registry, api.as_ref(), &cancel).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, url = %ws_url, "Event channel connect failed");
            }
        }

        if cancel.is_cancelled() {
            return;
        }

        tracing::info!(
            delay_ms = RECONNECT_DELAY.as_millis() as u64,
            "Event channel lost, reconnecting",
        );
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}

fn build_request(
    ws_url: &str,
    auth_token: Option<&str>,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, tokio_tungstenite::tungstenite::Error> {
    let mut request = ws_url.into_client_request()?;
    if let Some(token) = auth_token {
        if let Ok(value) = format!("Bearer {token}").parse() {
            request.headers_mut().insert("Authorization", value);
        }
    }
    Ok(request)
}

/// Process frames until the stream closes or the token fires.
async fn read_frames(
    ws_stream: &mut tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    registry: &JobRegistry,
    api: &dyn ComfyApi,
    cancel: &CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = ws_stream.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => match parse_message(&text) {
                Ok(msg) => dispatch_message(registry, api, msg).await,
                Err(e) => {
                    tracing::warn!(error = %e, raw_message = %text, "Unrecognized event, ignoring");
                }
            },
            Some(Ok(Message::Binary(data))) => {
                // Preview frames only; payload is discarded.
                match decode_binary_frame(&data) {
                    Some(frame) if frame.is_preview() => {
                        tracing::trace!(payload_len = frame.payload_len, "Preview frame discarded");
                    }
                    Some(frame) => {
                        tracing::trace!(event = frame.event, "Unknown binary event, ignoring");
                    }
                    None => {
                        tracing::warn!(len = data.len(), "Binary frame too short, ignoring");
                    }
                }
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                // Handled automatically by tungstenite.
            }
            Some(Ok(Message::Close(frame))) => {
                tracing::info!(?frame, "Event channel closed by server");
                return;
            }
            Some(Ok(Message::Frame(_))) => {}
            Some(Err(e)) => {
                tracing::error!(error = %e, "Event channel receive error");
                return;
            }
            None => return,
        }
    }
}

/// Apply one parsed event to the registry.
///
/// Events for unknown job ids are ignored. Image fetches triggered by
/// `executed` complete before this function returns, preserving append
/// order across events.
pub async fn dispatch_message(registry: &JobRegistry, api: &dyn ComfyApi, msg: ComfyMessage) {
    match msg {
        ComfyMessage::Status(data) => {
            tracing::debug!(
                queue_remaining = data["status"]["exec_info"]["queue_remaining"].as_i64(),
                "Server queue status",
            );
        }
        ComfyMessage::ExecutionStart(data) => {
            let known = registry
                .update(&data.prompt_id, |job| {
                    job.status = JobStatus::Executing;
                    job.progress = 0.0;
                })
                .await;
            if known {
                tracing::info!(job_id = %data.prompt_id, "Job started executing");
            }
        }
        ComfyMessage::ExecutionCached(data) => {
            tracing::debug!(
                job_id = %data.prompt_id,
                nodes = data.nodes.len(),
                "Nodes served from cache",
            );
        }
        ComfyMessage::Progress(data) => {
            if let Some(job_id) = &data.prompt_id {
                registry
                    .update(job_id, |job| {
                        job.samples_done = data.value;
                        if data.max > 0 {
                            let progress = f64::from(data.value) / f64::from(data.max);
                            job.progress = job.progress.max(progress);
                        }
                    })
                    .await;
            }
        }
        ComfyMessage::Executing(data) => match data.node {
            Some(_node) => {
                registry
                    .update(&data.prompt_id, |job| job.nodes_done += 1)
                    .await;
            }
            None => {
                // Graph complete signal.
                let known = registry
                    .update(&data.prompt_id, |job| {
                        if job.status != JobStatus::Error {
                            job.status = JobStatus::Finished;
                            job.progress = 1.0;
                        }
                    })
                    .await;
                if known {
                    tracing::info!(job_id = %data.prompt_id, "Job finished");
                }
            }
        },
        ComfyMessage::Executed(data) => {
            if !registry.contains(&data.prompt_id).await {
                return;
            }
            let images = data.output["images"].as_array().cloned().unwrap_or_default();
            for descriptor in &images {
                fetch_result_image(registry, api, &data.prompt_id, descriptor).await;
            }
        }
        ComfyMessage::ExecutionError(data) => {
            let message = data
                .exception_message
                .unwrap_or_else(|| "Unknown error".to_string());
            let known = registry
                .update(&data.prompt_id, |job| job.fail(message.clone()))
                .await;
            if known {
                tracing::error!(job_id = %data.prompt_id, error = %message, "Job failed");
            }
        }
        ComfyMessage::ExecutionInterrupted(data) => {
            let known = registry
                .update(&data.prompt_id, |job| job.status = JobStatus::Interrupted)
                .await;
            if known {
                tracing::info!(job_id = %data.prompt_id, "Job interrupted");
            }
        }
    }
}

/// Fetch one output image and append it to the job's results.
///
/// Descriptors are either a filename/subfolder/type triple served by
/// `/view`, or an alternate-protocol reference (`source == "http"`)
/// served by the per-id endpoint. Fetch failures are logged and leave
/// job status untouched; a job may finish with fewer images than its
/// batch size.
async fn fetch_result_image(
    registry: &JobRegistry,
    api: &dyn ComfyApi,
    job_id: &str,
    descriptor: &serde_json::Value,
) {
    let fetched = if descriptor["source"].as_str() == Some("http") {
        match descriptor["id"].as_str() {
            Some(image_id) => api.image_by_id(image_id).await,
            None => {
                tracing::warn!(job_id = %job_id, "Image reference without id, skipping");
                return;
            }
        }
    } else {
        let Some(filename) = descriptor["filename"].as_str() else {
            tracing::warn!(job_id = %job_id, "Image descriptor without filename, skipping");
            return;
        };
        let subfolder = descriptor["subfolder"].as_str().unwrap_or("");
        let image_type = descriptor["type"].as_str().unwrap_or("output");
        api.view_image(filename, subfolder, image_type).await
    };

    match fetched {
        Ok(bytes) => {
            registry.update(job_id, |job| job.images.push(bytes)).await;
            tracing::info!(job_id = %job_id, "Fetched result image");
        }
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "Failed to fetch result image");
        }
    }
}
