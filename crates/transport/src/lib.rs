//! Generic HTTP transport shared by both backend engines.
//!
//! Wraps [`reqwest`] with the small call surface the engines need --
//! JSON GET/POST, raw PUT, chunk-progress upload, streamed download --
//! and maps every failure into a uniform [`TransportError`] carrying an
//! HTTP status and an optional structured payload. Higher-level code
//! never touches raw sockets or `reqwest` types directly.

use std::time::Duration;

use tokio::sync::mpsc;

/// Uniform transport failure.
///
/// `code` is the HTTP status for server-side failures and `0` for
/// network-level failures (connection refused, timeout). `data` holds
/// the parsed JSON error body when the server supplied one.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    pub code: u16,
    pub message: String,
    pub url: String,
    pub status: Option<u16>,
    pub data: Option<serde_json::Value>,
}

impl TransportError {
    /// Network-level failure (no HTTP response).
    pub fn network(url: &str, message: impl Into<String>) -> Self {
        Self {
            code: 0,
            message: message.into(),
            url: url.to_string(),
            status: None,
            data: None,
        }
    }

    /// Timed-out request, with the fixed caller-facing message.
    pub fn timeout(url: &str) -> Self {
        Self::network(
            url,
            "Connection timed out, the server took too long to respond",
        )
    }

    /// Server answered with an error status.
    pub fn http(status: u16, message: impl Into<String>, url: &str, data: Option<serde_json::Value>) -> Self {
        Self {
            code: status,
            message: message.into(),
            url: url.to_string(),
            status: Some(status),
            data,
        }
    }
}

/// A successful response body: parsed JSON when the server declared a
/// JSON content type, raw bytes otherwise.
#[derive(Debug, Clone)]
pub enum Payload {
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

impl Payload {
    /// Unwrap a JSON payload, turning a bytes payload into a transport
    /// error (the caller expected a JSON API response).
    pub fn into_json(self, url: &str) -> Result<serde_json::Value, TransportError> {
        match self {
            Payload::Json(value) => Ok(value),
            Payload::Bytes(_) => Err(TransportError::network(
                url,
                "Expected a JSON response but received binary data",
            )),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Payload::Json(value) => value.to_string().into_bytes(),
            Payload::Bytes(bytes) => bytes,
        }
    }
}

/// Build the caller-facing message (and retained data) for an HTTP
/// error response body. A JSON body with an `error` field is preferred;
/// otherwise the raw text is used.
fn error_body_to_message(
    body: &str,
    reason: &str,
) -> (String, Option<serde_json::Value>) {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if value.is_object() {
            let error = value
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("Network error");
            return (format!("{error} ({reason})"), Some(value));
        }
    }
    (format!("{body} ({reason})"), None)
}

fn is_json_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|ct| ct == "application/json" || ct.ends_with("+json"))
}

/// HTTP client wrapper with lazy session creation and reuse.
///
/// The underlying connection pool is created on first use and shared by
/// every request until [`close`](Self::close) drops it; a later request
/// transparently creates a fresh one.
#[derive(Default)]
pub struct RequestManager {
    client: tokio::sync::Mutex<Option<reqwest::Client>>,
}

impl RequestManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lazily create (or reuse) the underlying client.
    async fn client(&self) -> reqwest::Client {
        let mut guard = self.client.lock().await;
        guard.get_or_insert_with(reqwest::Client::new).clone()
    }

    /// Release the underlying connection pool. Idempotent; the next
    /// request creates a new session.
    pub async fn close(&self) {
        self.client.lock().await.take();
    }

    /// GET a URL. JSON responses are parsed, anything else is returned
    /// as raw bytes.
    pub async fn get(
        &self,
        url: &str,
        timeout: Option<Duration>,
        bearer: Option<&str>,
    ) -> Result<Payload, TransportError> {
        let client = self.client().await;
        let mut request = client.get(url);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|e| Self::map_error(url, e))?;
        Self::handle_response(response, url).await
    }

    /// POST a JSON body.
    pub async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
        bearer: Option<&str>,
    ) -> Result<Payload, TransportError> {
        let client = self.client().await;
        let mut request = client.post(url).json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|e| Self::map_error(url, e))?;
        Self::handle_response(response, url).await
    }

    /// PUT raw bytes (pre-signed object-storage upload).
    pub async fn put(&self, url: &str, data: Vec<u8>) -> Result<(), TransportError> {
        let client = self.client().await;
        let response = client
            .put(url)
            .header("Content-Type", "application/octet-stream")
            .body(data)
            .send()
            .await
            .map_err(|e| Self::map_error(url, e))?;

        let status = response.status();
        if status.as_u16() >= 400 {
            let text = response.text().await.unwrap_or_default();
            return Err(TransportError::http(
                status.as_u16(),
                format!("Upload failed: {text}"),
                url,
                None,
            ));
        }
        Ok(())
    }

    /// Upload raw bytes with an optional S3 checksum header, reporting
    /// `(bytes_sent, total_bytes)` progress over the given channel at
    /// start and completion.
    pub async fn upload(
        &self,
        url: &str,
        data: Vec<u8>,
        sha256_b64: Option<&str>,
        progress: Option<mpsc::UnboundedSender<(u64, u64)>>,
    ) -> Result<(), TransportError> {
        let total = data.len() as u64;
        if let Some(tx) = &progress {
            let _ = tx.send((0, total));
        }

        let client = self.client().await;
        let mut request = client
            .put(url)
            .header("Content-Type", "application/octet-stream");
        if let Some(digest) = sha256_b64 {
            request = request.header("x-amz-checksum-sha256", digest);
        }
        let response = request
            .body(data)
            .send()
            .await
            .map_err(|e| Self::map_error(url, e))?;

        let status = response.status();
        if status.as_u16() >= 400 {
            let text = response.text().await.unwrap_or_default();
            return Err(TransportError::http(
                status.as_u16(),
                format!("Upload failed: {text}"),
                url,
                None,
            ));
        }

        if let Some(tx) = &progress {
            let _ = tx.send((total, total));
        }
        Ok(())
    }

    /// Download a URL as raw bytes.
    pub async fn download(
        &self,
        url: &str,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, TransportError> {
        let client = self.client().await;
        let mut request = client.get(url);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request.send().await.map_err(|e| Self::map_error(url, e))?;

        let status = response.status();
        if status.as_u16() >= 400 {
            let text = response.text().await.unwrap_or_default();
            return Err(TransportError::http(
                status.as_u16(),
                format!("Download failed: {text}"),
                url,
                None,
            ));
        }
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| Self::map_error(url, e))
    }

    // ---- private helpers ----

    fn map_error(url: &str, error: reqwest::Error) -> TransportError {
        if error.is_timeout() {
            TransportError::timeout(url)
        } else {
            TransportError::network(url, error.to_string())
        }
    }

    async fn handle_response(
        response: reqwest::Response,
        url: &str,
    ) -> Result<Payload, TransportError> {
        let status = response.status();
        if status.as_u16() >= 400 {
            let reason = status.canonical_reason().unwrap_or("Error").to_string();
            let body = response.text().await.unwrap_or_default();
            let (message, data) = error_body_to_message(&body, &reason);
            tracing::debug!(status = status.as_u16(), url, %message, "Request failed");
            return Err(TransportError::http(status.as_u16(), message, url, data));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if is_json_content_type(&content_type) {
            let value = response
                .json::<serde_json::Value>()
                .await
                .map_err(|e| Self::map_error(url, e))?;
            Ok(Payload::Json(value))
        } else {
            let bytes = response
                .bytes()
                .await
                .map_err(|e| Self::map_error(url, e))?;
            Ok(Payload::Bytes(bytes.to_vec()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn json_error_body_uses_error_field() {
        let (message, data) =
            error_body_to_message(r#"{"error":"Insufficient credits","credits":3}"#, "Payment Required");
        assert_eq!(message, "Insufficient credits (Payment Required)");
        let data = data.unwrap();
        assert_eq!(data["credits"], 3);
    }

    #[test]
    fn json_error_body_without_error_field_falls_back() {
        let (message, data) = error_body_to_message(r#"{"detail":"nope"}"#, "Bad Request");
        assert_eq!(message, "Network error (Bad Request)");
        assert!(data.is_some());
    }

    #[test]
    fn plain_text_error_body_is_passed_through() {
        let (message, data) = error_body_to_message("upstream exploded", "Bad Gateway");
        assert_eq!(message, "upstream exploded (Bad Gateway)");
        assert!(data.is_none());
    }

    #[test]
    fn content_type_detection() {
        assert!(is_json_content_type("application/json"));
        assert!(is_json_content_type("application/json; charset=utf-8"));
        assert!(is_json_content_type("application/problem+json"));
        assert!(!is_json_content_type("image/png"));
        assert!(!is_json_content_type(""));
    }

    #[test]
    fn network_error_has_code_zero_and_no_status() {
        let err = TransportError::network("http://x", "connection refused");
        assert_eq!(err.code, 0);
        assert!(err.status.is_none());
        assert_eq!(err.to_string(), "connection refused");
    }

    #[test]
    fn http_error_carries_status_and_data() {
        let data = serde_json::json!({"credits": 0});
        let err = TransportError::http(402, "Insufficient credits", "http://x", Some(data));
        assert_eq!(err.code, 402);
        assert_eq!(err.status, Some(402));
        assert_eq!(err.data.as_ref().unwrap()["credits"], 0);
    }

    #[test]
    fn payload_into_json_rejects_bytes() {
        let payload = Payload::Bytes(vec![1, 2, 3]);
        assert_matches!(payload.into_json("http://x"), Err(e) if e.code == 0);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let manager = RequestManager::new();
        let _ = manager.client().await;
        manager.close().await;
        manager.close().await;
        // A new session is created on demand after close.
        let _ = manager.client().await;
    }
}
