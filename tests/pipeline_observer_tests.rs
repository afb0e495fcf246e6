//! Observer hooks: cache-key overrides, disk-write vetoes, and task
//! lifecycle notifications.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use common::*;
use pixfetch::ImageRequest;
use pixfetch::image::ImageContainer;
use pixfetch::observer::PipelineObserver;
use pixfetch::response::{ImageResponse, Progress};
use uuid::Uuid;

#[derive(Default)]
struct RecordingObserver {
    events: Mutex<Vec<String>>,
    veto_writes: bool,
    key_override: Option<String>,
}

impl RecordingObserver {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: &str) {
        self.events.lock().unwrap().push(event.to_string());
    }
}

impl PipelineObserver for RecordingObserver {
    fn cache_key(&self, _request: &ImageRequest) -> Option<String> {
        self.key_override.clone()
    }

    fn will_cache(
        &self,
        data: Bytes,
        _image: Option<&ImageContainer>,
        _request: &ImageRequest,
    ) -> Option<Bytes> {
        self.record("will_cache");
        if self.veto_writes { None } else { Some(data) }
    }

    fn task_created(&self, _task_id: Uuid, _request: &ImageRequest) {
        self.record("created");
    }

    fn task_progress(&self, _task_id: Uuid, _progress: Progress) {
        self.record("progress");
    }

    fn task_preview(&self, _task_id: Uuid, _response: &ImageResponse) {
        self.record("preview");
    }

    fn task_finished(&self, _task_id: Uuid, result: &pixfetch::Result<ImageResponse>) {
        self.record(if result.is_ok() { "finished" } else { "failed" });
    }

    fn task_cancelled(&self, _task_id: Uuid) {
        self.record("cancelled");
    }
}

fn fixture_with_observer(observer: &Arc<dyn PipelineObserver>) -> TestPipeline {
    let observer = observer.clone();
    TestPipeline::new(move |config| {
        config.observer = Some(Arc::downgrade(&observer));
    })
}

#[tokio::test]
async fn test_will_cache_veto_blocks_disk_writes() {
    let recording = Arc::new(RecordingObserver {
        veto_writes: true,
        ..Default::default()
    });
    let observer: Arc<dyn PipelineObserver> = recording.clone();
    let fixture = fixture_with_observer(&observer);
    fixture.loader.add_image(&test_url(), 8, 8);

    fixture.pipeline.image(fixture.request()).await.unwrap();

    // The hook ran, the store did not.
    let recording_for_wait = recording.clone();
    assert!(
        wait_until(
            move || recording_for_wait.events().contains(&"will_cache".to_string()),
            Duration::from_secs(2)
        )
        .await
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fixture.data_cache.entry_count(), 0);
}

#[tokio::test]
async fn test_cache_key_override_unifies_entities() {
    let observer: Arc<dyn PipelineObserver> = Arc::new(RecordingObserver {
        key_override: Some("shared-identity".to_string()),
        ..Default::default()
    });
    let fixture = fixture_with_observer(&observer);
    fixture.loader.add_image(&test_url(), 8, 8);

    fixture.pipeline.image(fixture.request()).await.unwrap();

    // A request for a different URL maps onto the same entity and is
    // served from the memory cache without another fetch.
    let other =
        ImageRequest::new(url::Url::parse("http://test.com/other-name.jpeg").unwrap());
    let response = fixture.pipeline.image(other).await.unwrap();
    assert_eq!(response.cache_type, Some(pixfetch::CacheType::Memory));
    assert_eq!(fixture.loader.fetch_count(), 1);
}

#[tokio::test]
async fn test_lifecycle_events_for_successful_load() {
    let recording = Arc::new(RecordingObserver::default());
    let observer: Arc<dyn PipelineObserver> = recording.clone();
    let fixture = fixture_with_observer(&observer);
    fixture.loader.add_image(&test_url(), 8, 8);

    fixture.pipeline.image(fixture.request()).await.unwrap();

    let events = recording.events();
    assert_eq!(events.first().map(String::as_str), Some("created"));
    let finished_at = events
        .iter()
        .position(|event| event == "finished")
        .expect("no finished event");
    // Nothing task-scoped after the terminal event except detached
    // cache encoding.
    for event in &events[finished_at + 1..] {
        assert_eq!(event, "will_cache");
    }
}

#[tokio::test]
async fn test_lifecycle_events_for_cancelled_load() {
    let recording = Arc::new(RecordingObserver::default());
    let observer: Arc<dyn PipelineObserver> = recording.clone();
    let fixture = fixture_with_observer(&observer);
    fixture.loader.set_suspended(true);
    fixture.loader.add_image(&test_url(), 8, 8);

    let task = fixture.pipeline.load_image(fixture.request());
    let loader = fixture.loader.clone();
    assert!(wait_until(move || loader.fetch_count() == 1, Duration::from_secs(2)).await);
    task.cancel();

    let recording_for_wait = recording.clone();
    assert!(
        wait_until(
            move || recording_for_wait.events().contains(&"cancelled".to_string()),
            Duration::from_secs(2)
        )
        .await
    );
    let events = recording.events();
    assert_eq!(events.first().map(String::as_str), Some("created"));
    assert!(!events.contains(&"finished".to_string()));
}
