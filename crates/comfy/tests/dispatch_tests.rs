//! Integration tests for listener event dispatch.
//!
//! Feeds synthetic event sequences through `dispatch_message` against a
//! scripted API surface and checks the resulting job state machine.

use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use bridge_comfy::listener::dispatch_message;
use bridge_comfy::messages::parse_message;
use bridge_comfy::ComfyApi;
use bridge_core::{JobRecord, JobRegistry, JobStatus};
use bridge_transport::TransportError;

/// Serves scripted image bytes and records every fetch.
#[derive(Default)]
struct FetchLog {
    /// `(kind, key)` pairs in call order.
    calls: Mutex<Vec<(String, String)>>,
    /// Filenames that should fail to download.
    failing: Vec<String>,
}

#[async_trait]
impl ComfyApi for FetchLog {
    async fn system_stats(&self) -> Result<serde_json::Value, TransportError> {
        Ok(serde_json::json!({}))
    }

    async fn submit_prompt(
        &self,
        _workflow: &serde_json::Value,
        _client_id: &str,
        _prompt_id: &str,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    async fn delete_queued(&self, _prompt_id: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn view_image(
        &self,
        filename: &str,
        _subfolder: &str,
        _image_type: &str,
    ) -> Result<Vec<u8>, TransportError> {
        self.calls
            .lock()
            .unwrap()
            .push(("view".into(), filename.into()));
        if self.failing.iter().any(|f| f == filename) {
            return Err(TransportError::http(500, "unavailable", "http://test/view", None));
        }
        Ok(format!("bytes:{filename}").into_bytes())
    }

    async fn image_by_id(&self, image_id: &str) -> Result<Vec<u8>, TransportError> {
        self.calls
            .lock()
            .unwrap()
            .push(("by_id".into(), image_id.into()));
        Ok(format!("id:{image_id}").into_bytes())
    }
}

async fn dispatch(registry: &JobRegistry, api: &dyn ComfyApi, json: &str) {
    let msg = parse_message(json).expect("test event should parse");
    dispatch_message(registry, api, msg).await;
}

async fn registry_with_job(job_id: &str) -> Arc<JobRegistry> {
    let registry = Arc::new(JobRegistry::new());
    let record = JobRecord {
        sample_count: 10,
        ..Default::default()
    };
    registry.insert(job_id, record).await;
    registry
}

#[tokio::test]
async fn event_sequence_drives_job_to_finished() {
    let registry = registry_with_job("job-1").await;
    let api = FetchLog::default();

    dispatch(
        &registry,
        &api,
        r#"{"type":"execution_start","data":{"prompt_id":"job-1"}}"#,
    )
    .await;
    let view = registry.view("job-1").await.unwrap();
    assert_eq!(view.status, JobStatus::Executing);
    assert_eq!(view.progress, 0.0);

    dispatch(
        &registry,
        &api,
        r#"{"type":"progress","data":{"value":5,"max":10,"prompt_id":"job-1"}}"#,
    )
    .await;
    let view = registry.view("job-1").await.unwrap();
    assert_eq!(view.progress, 0.5);
    let samples_done = registry.read("job-1", |j| j.samples_done).await.unwrap();
    assert_eq!(samples_done, 5);

    dispatch(
        &registry,
        &api,
        r#"{"type":"executing","data":{"node":null,"prompt_id":"job-1"}}"#,
    )
    .await;
    let view = registry.view("job-1").await.unwrap();
    assert_eq!(view.status, JobStatus::Finished);
    assert_eq!(view.progress, 1.0);
}

#[tokio::test]
async fn progress_is_non_decreasing_until_execution_start_resets_it() {
    let registry = registry_with_job("job-1").await;
    let api = FetchLog::default();

    dispatch(
        &registry,
        &api,
        r#"{"type":"progress","data":{"value":8,"max":10,"prompt_id":"job-1"}}"#,
    )
    .await;
    assert_eq!(registry.view("job-1").await.unwrap().progress, 0.8);

    // A stale lower progress value never moves the bar backwards.
    dispatch(
        &registry,
        &api,
        r#"{"type":"progress","data":{"value":3,"max":10,"prompt_id":"job-1"}}"#,
    )
    .await;
    assert_eq!(registry.view("job-1").await.unwrap().progress, 0.8);

    // Only execution_start resets.
    dispatch(
        &registry,
        &api,
        r#"{"type":"execution_start","data":{"prompt_id":"job-1"}}"#,
    )
    .await;
    assert_eq!(registry.view("job-1").await.unwrap().progress, 0.0);
}

#[tokio::test]
async fn progress_with_zero_max_is_ignored() {
    let registry = registry_with_job("job-1").await;
    let api = FetchLog::default();

    dispatch(
        &registry,
        &api,
        r#"{"type":"progress","data":{"value":5,"max":0,"prompt_id":"job-1"}}"#,
    )
    .await;
    assert_eq!(registry.view("job-1").await.unwrap().progress, 0.0);
}

#[tokio::test]
async fn executing_node_counts_nodes_done() {
    let registry = registry_with_job("job-1").await;
    let api = FetchLog::default();

    for node in ["1", "2", "3"] {
        dispatch(
            &registry,
            &api,
            &format!(r#"{{"type":"executing","data":{{"node":"{node}","prompt_id":"job-1"}}}}"#),
        )
        .await;
    }
    let nodes_done = registry.read("job-1", |j| j.nodes_done).await.unwrap();
    assert_eq!(nodes_done, 3);
}

#[tokio::test]
async fn executed_fetches_images_in_arrival_order() {
    let registry = registry_with_job("job-1").await;
    let api = FetchLog::default();

    dispatch(
        &registry,
        &api,
        r#"{"type":"executed","data":{"prompt_id":"job-1","output":{"images":[
            {"filename":"a.png","subfolder":"","type":"output"},
            {"source":"http","id":"remote-7"},
            {"filename":"b.png","subfolder":"sub","type":"output"}
        ]}}}"#,
    )
    .await;

    let images = registry.images("job-1").await.unwrap();
    assert_eq!(images.len(), 3);
    assert_eq!(images[0], b"bytes:a.png");
    assert_eq!(images[1], b"id:remote-7");
    assert_eq!(images[2], b"bytes:b.png");

    let calls = api.calls.lock().unwrap().clone();
    assert_eq!(
        calls,
        vec![
            ("view".to_string(), "a.png".to_string()),
            ("by_id".to_string(), "remote-7".to_string()),
            ("view".to_string(), "b.png".to_string()),
        ]
    );
}

#[tokio::test]
async fn failed_image_fetch_is_dropped_without_failing_the_job() {
    let registry = registry_with_job("job-1").await;
    let api = FetchLog {
        failing: vec!["broken.png".to_string()],
        ..Default::default()
    };

    dispatch(
        &registry,
        &api,
        r#"{"type":"executed","data":{"prompt_id":"job-1","output":{"images":[
            {"filename":"broken.png","subfolder":"","type":"output"},
            {"filename":"ok.png","subfolder":"","type":"output"}
        ]}}}"#,
    )
    .await;
    dispatch(
        &registry,
        &api,
        r#"{"type":"executing","data":{"node":null,"prompt_id":"job-1"}}"#,
    )
    .await;

    // The job still finishes, with fewer images than requested.
    let view = registry.view("job-1").await.unwrap();
    assert_eq!(view.status, JobStatus::Finished);
    let images = registry.images("job-1").await.unwrap();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0], b"bytes:ok.png");
}

#[tokio::test]
async fn graph_complete_does_not_mask_an_earlier_error() {
    let registry = registry_with_job("job-1").await;
    let api = FetchLog::default();

    dispatch(
        &registry,
        &api,
        r#"{"type":"execution_error","data":{"prompt_id":"job-1","exception_message":"out of memory"}}"#,
    )
    .await;
    dispatch(
        &registry,
        &api,
        r#"{"type":"executing","data":{"node":null,"prompt_id":"job-1"}}"#,
    )
    .await;

    let view = registry.view("job-1").await.unwrap();
    assert_eq!(view.status, JobStatus::Error);
    assert_eq!(view.error.as_deref(), Some("out of memory"));
}

#[tokio::test]
async fn interrupted_event_marks_job_interrupted() {
    let registry = registry_with_job("job-1").await;
    let api = FetchLog::default();

    dispatch(
        &registry,
        &api,
        r#"{"type":"execution_interrupted","data":{"prompt_id":"job-1"}}"#,
    )
    .await;
    assert_eq!(
        registry.view("job-1").await.unwrap().status,
        JobStatus::Interrupted
    );
}

#[tokio::test]
async fn events_for_unknown_jobs_are_ignored() {
    let registry = registry_with_job("job-1").await;
    let api = FetchLog::default();

    dispatch(
        &registry,
        &api,
        r#"{"type":"execution_start","data":{"prompt_id":"other"}}"#,
    )
    .await;
    dispatch(
        &registry,
        &api,
        r#"{"type":"executed","data":{"prompt_id":"other","output":{"images":[{"filename":"x.png"}]}}}"#,
    )
    .await;

    // Nothing fetched, nothing mutated.
    assert!(api.calls.lock().unwrap().is_empty());
    assert_eq!(
        registry.view("job-1").await.unwrap().status,
        JobStatus::Queued
    );
    assert!(registry.view("other").await.is_none());
}
