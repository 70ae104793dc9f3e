//! Engine flow tests: the protocol router, finalizer, and sweeper driven
//! end-to-end against a real on-disk store with fake external seams.

use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex as StdMutex};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;

use ingest::downstream::{Downstream, DownstreamError};
use ingest::engine::{Engine, EngineConfig};
use ingest::lineage::{DeviceLineage, LineageError, LineageResolver};
use ingest::publisher::{DirectivePublisher, PublishError};
use ingest::state_machine::ProtocolState;
use ingest::storage::{TransferStatus, WakeStore};
use wake_protocol::{
    DeviceMessage, Directive, ImageFragment, ImageMetadata, StatusMessage, TelemetryReadings,
    TelemetryReport,
};

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct FakeLineage {
    lineage: DeviceLineage,
}

impl LineageResolver for FakeLineage {
    async fn resolve(&self, device_id: &str) -> Result<DeviceLineage, LineageError> {
        let mut l = self.lineage.clone();
        l.device_id = device_id.to_owned();
        Ok(l)
    }
}

#[derive(Clone, Default)]
struct RecordingDownstream {
    uploads: Arc<StdMutex<Vec<(String, String, Vec<u8>)>>>,
    completions: Arc<StdMutex<Vec<(String, String, String)>>>,
    failures: Arc<StdMutex<Vec<(String, String, String)>>>,
    fail_upload: bool,
}

impl Downstream for RecordingDownstream {
    async fn upload(
        &self,
        device_id: &str,
        artifact_name: &str,
        bytes: Vec<u8>,
    ) -> Result<String, DownstreamError> {
        if self.fail_upload {
            return Err(DownstreamError::Request("upload refused".to_owned()));
        }
        let location = format!("mem://{device_id}/{artifact_name}");
        self.uploads
            .lock()
            .unwrap()
            .push((device_id.to_owned(), artifact_name.to_owned(), bytes));
        Ok(location)
    }

    async fn notify_complete(
        &self,
        device_id: &str,
        artifact_name: &str,
        location: &str,
    ) -> Result<(), DownstreamError> {
        self.completions.lock().unwrap().push((
            device_id.to_owned(),
            artifact_name.to_owned(),
            location.to_owned(),
        ));
        Ok(())
    }

    async fn notify_failure(
        &self,
        device_id: &str,
        artifact_name: &str,
        code: &str,
        _message: &str,
    ) -> Result<(), DownstreamError> {
        self.failures.lock().unwrap().push((
            device_id.to_owned(),
            artifact_name.to_owned(),
            code.to_owned(),
        ));
        Ok(())
    }
}

#[derive(Clone, Default)]
struct RecordingPublisher {
    directives: Arc<StdMutex<Vec<(String, Directive)>>>,
}

impl RecordingPublisher {
    fn sent(&self) -> Vec<(String, Directive)> {
        self.directives.lock().unwrap().clone()
    }

    fn capture_requests(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|(_, d)| match d {
                Directive::CaptureRequest(c) => Some(c.artifact_name),
                _ => None,
            })
            .collect()
    }

    fn missing_requests(&self) -> Vec<Vec<u32>> {
        self.sent()
            .into_iter()
            .filter_map(|(_, d)| match d {
                Directive::MissingFragments(m) => Some(m.indices),
                _ => None,
            })
            .collect()
    }

    fn sleep_directives(&self) -> Vec<wake_protocol::SleepUntil> {
        self.sent()
            .into_iter()
            .filter_map(|(_, d)| match d {
                Directive::SleepUntil(s) => Some(s),
                _ => None,
            })
            .collect()
    }
}

impl DirectivePublisher for RecordingPublisher {
    async fn publish(&self, device_id: &str, directive: Directive) -> Result<(), PublishError> {
        self.directives
            .lock()
            .unwrap()
            .push((device_id.to_owned(), directive));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

type TestEngine = Engine<FakeLineage, RecordingDownstream, RecordingPublisher>;

struct Harness {
    engine: TestEngine,
    store: Arc<Mutex<WakeStore>>,
    downstream: RecordingDownstream,
    publisher: RecordingPublisher,
    _file: NamedTempFile,
}

fn routable_lineage() -> DeviceLineage {
    DeviceLineage {
        mapped: true,
        approved: true,
        timezone: "UTC".to_owned(),
        device_schedule: Some("every 6h".to_owned()),
        ..DeviceLineage::default()
    }
}

fn make_harness(lineage: DeviceLineage, downstream: RecordingDownstream) -> Harness {
    let file = NamedTempFile::new().expect("temp file");
    let store = Arc::new(Mutex::new(WakeStore::open(file.path()).expect("open store")));
    let publisher = RecordingPublisher::default();
    let engine = Engine::new(
        store.clone(),
        FakeLineage { lineage },
        downstream.clone(),
        publisher.clone(),
        EngineConfig {
            fragment_ttl: Duration::minutes(60),
            default_wake_hour: 8,
        },
    );
    Harness {
        engine,
        store,
        downstream,
        publisher,
        _file: file,
    }
}

fn status(device_id: &str, pending: u32) -> DeviceMessage {
    DeviceMessage::Status(StatusMessage {
        device_id: device_id.to_owned(),
        pending_images: pending,
        telemetry: Some(TelemetryReadings {
            temperature: Some(72.5),
            humidity: Some(45.2),
            pressure: Some(1013.2),
            gas_resistance: Some(15.3),
        }),
    })
}

fn metadata(device_id: &str, artifact: &str, total: u32) -> DeviceMessage {
    DeviceMessage::ImageMetadata(ImageMetadata {
        device_id: device_id.to_owned(),
        artifact_name: artifact.to_owned(),
        total_fragments: total,
        image_size_bytes: 0,
        capture_timestamp: None,
        telemetry: None,
    })
}

fn fragment(device_id: &str, artifact: &str, index: u32, bytes: &[u8]) -> DeviceMessage {
    DeviceMessage::ImageFragment(ImageFragment {
        device_id: device_id.to_owned(),
        artifact_name: artifact.to_owned(),
        frag_index: index,
        payload_b64: ImageFragment::encode_payload(bytes),
    })
}

fn hours_from_now(instant: DateTime<Utc>) -> i64 {
    (instant - Utc::now()).num_minutes() / 60
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unmapped_device_short_circuits_to_sleep_only() {
    let lineage = DeviceLineage {
        mapped: false,
        approved: false,
        ..DeviceLineage::default()
    };
    let h = make_harness(lineage, RecordingDownstream::default());

    h.engine.handle_message(status("dev-1", 0)).await.unwrap();

    assert!(
        h.publisher.capture_requests().is_empty(),
        "no artifact is requested from an unmapped device"
    );
    let sleeps = h.publisher.sleep_directives();
    assert_eq!(sleeps.len(), 1);

    let store = h.store.lock().await;
    let wake = store.wake_event(1).unwrap().unwrap();
    assert_eq!(wake.state, ProtocolState::SleepOnly);
    assert!(wake.sleep_issued_at.is_some());
    assert_eq!(wake.images_requested, 0);
}

#[tokio::test]
async fn full_wake_cycle_recovers_missing_fragment_and_finalizes_once() {
    let h = make_harness(routable_lineage(), RecordingDownstream::default());
    let parts: [&[u8]; 5] = [b"alpha-", b"bravo-", b"charlie-", b"delta-", b"echo"];

    // Wake: status -> capture request naming the artifact.
    h.engine.handle_message(status("dev-1", 1)).await.unwrap();
    let requested = h.publisher.capture_requests();
    assert_eq!(requested.len(), 1);
    let artifact = requested[0].clone();

    // Metadata declares 5 fragments; the device's send pass loses index 3.
    h.engine
        .handle_message(metadata("dev-1", &artifact, 5))
        .await
        .unwrap();
    for i in [0u32, 1, 2, 4] {
        h.engine
            .handle_message(fragment("dev-1", &artifact, i, parts[i as usize]))
            .await
            .unwrap();
    }

    // Seeing the final declared index with a gap triggers one targeted
    // retransmission request.
    let missing = h.publisher.missing_requests();
    assert_eq!(missing, vec![vec![3]]);
    assert!(h.downstream.uploads.lock().unwrap().is_empty());

    // The retransmitted fragment completes the transfer.
    h.engine
        .handle_message(fragment("dev-1", &artifact, 3, parts[3]))
        .await
        .unwrap();

    let uploads = h.downstream.uploads.lock().unwrap().clone();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].2, b"alpha-bravo-charlie-delta-echo");
    assert_eq!(h.downstream.completions.lock().unwrap().len(), 1);

    let sleeps = h.publisher.sleep_directives();
    assert_eq!(sleeps.len(), 1);
    let next_wake_at: DateTime<Utc> = sleeps[0].next_wake_at.parse().unwrap();
    assert_eq!(
        hours_from_now(next_wake_at),
        5,
        "next wake is one 6h interval after the actual wake (within the hour)"
    );

    {
        let store = h.store.lock().await;
        let wake = store.wake_event(1).unwrap().unwrap();
        assert_eq!(wake.state, ProtocolState::Complete);
        assert!(wake.is_complete);
        assert_eq!(wake.images_requested, 1);
        assert_eq!(wake.images_completed, 1);

        let transfer = store.transfer("dev-1", &artifact).unwrap().unwrap();
        assert_eq!(transfer.status, TransferStatus::Complete);
        assert!(transfer.storage_location.is_some());
        assert!(!store.has_fragments("dev-1", &artifact).unwrap());

        let device = store.device_state("dev-1").unwrap().unwrap();
        assert!(device.last_wake_at.is_some());
        assert!(device.next_wake_at.is_some());
    }

    // Redelivery after finalize is absorbed.
    h.engine
        .handle_message(fragment("dev-1", &artifact, 3, parts[3]))
        .await
        .unwrap();
    // And a direct second finalize is a no-op: no second upload, no second
    // sleep directive.
    h.engine.finalize("dev-1", &artifact).await.unwrap();
    assert_eq!(h.downstream.uploads.lock().unwrap().len(), 1);
    assert_eq!(h.publisher.sleep_directives().len(), 1);
}

#[tokio::test]
async fn metadata_redelivery_does_not_duplicate_transfer() {
    let h = make_harness(routable_lineage(), RecordingDownstream::default());

    h.engine.handle_message(status("dev-1", 0)).await.unwrap();
    let artifact = h.publisher.capture_requests()[0].clone();

    h.engine
        .handle_message(metadata("dev-1", &artifact, 3))
        .await
        .unwrap();
    h.engine
        .handle_message(metadata("dev-1", &artifact, 3))
        .await
        .unwrap();

    let store = h.store.lock().await;
    let transfer = store.transfer("dev-1", &artifact).unwrap().unwrap();
    assert_eq!(transfer.declared_total, 3);
    assert_eq!(transfer.status, TransferStatus::Receiving);
    assert_eq!(transfer.received_count, 0);
}

#[tokio::test]
async fn fragments_arriving_before_metadata_complete_on_declaration() {
    let h = make_harness(routable_lineage(), RecordingDownstream::default());

    h.engine.handle_message(status("dev-1", 0)).await.unwrap();
    let artifact = h.publisher.capture_requests()[0].clone();

    // The link reorders: both fragments land before the metadata.
    h.engine
        .handle_message(fragment("dev-1", &artifact, 0, b"AB"))
        .await
        .unwrap();
    h.engine
        .handle_message(fragment("dev-1", &artifact, 1, b"CD"))
        .await
        .unwrap();
    assert!(h.downstream.uploads.lock().unwrap().is_empty());

    h.engine
        .handle_message(metadata("dev-1", &artifact, 2))
        .await
        .unwrap();

    let uploads = h.downstream.uploads.lock().unwrap().clone();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].2, b"ABCD");
}

#[tokio::test]
async fn telemetry_only_never_touches_the_wake_path() {
    let h = make_harness(routable_lineage(), RecordingDownstream::default());

    h.engine
        .handle_message(DeviceMessage::Telemetry(TelemetryReport {
            device_id: "dev-1".to_owned(),
            telemetry: TelemetryReadings {
                temperature: Some(70.1),
                humidity: Some(50.0),
                pressure: None,
                gas_resistance: None,
            },
        }))
        .await
        .unwrap();

    assert!(h.publisher.sent().is_empty());
    let store = h.store.lock().await;
    assert!(store.latest_open_wake("dev-1").unwrap().is_none());
    let device = store.device_state("dev-1").unwrap().unwrap();
    assert_eq!(device.temperature, Some(70.1));
    assert!(device.last_seen_at.is_some());
}

#[tokio::test]
async fn upload_failure_reports_typed_code_and_leaves_wake_open() {
    let downstream = RecordingDownstream {
        fail_upload: true,
        ..RecordingDownstream::default()
    };
    let h = make_harness(routable_lineage(), downstream);

    h.engine.handle_message(status("dev-1", 0)).await.unwrap();
    let artifact = h.publisher.capture_requests()[0].clone();
    h.engine
        .handle_message(metadata("dev-1", &artifact, 1))
        .await
        .unwrap();
    h.engine
        .handle_message(fragment("dev-1", &artifact, 0, b"payload"))
        .await
        .unwrap();

    let failures = h.downstream.failures.lock().unwrap().clone();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].2, "upload_failed");
    assert!(h.downstream.completions.lock().unwrap().is_empty());
    assert!(h.publisher.sleep_directives().is_empty());

    let store = h.store.lock().await;
    let wake = store.wake_event(1).unwrap().unwrap();
    assert_eq!(wake.state, ProtocolState::SnapSent, "wake remains in flight");
    assert!(!wake.is_complete);
    // Fragments are retained for the TTL window; the device's next wake is
    // the retry trigger.
    let transfer = store.transfer("dev-1", &artifact).unwrap().unwrap();
    assert_eq!(transfer.status, TransferStatus::Receiving);
}

#[tokio::test]
async fn abandoned_transfer_fails_with_single_notification() {
    let h = make_harness(routable_lineage(), RecordingDownstream::default());
    let long_ago = Utc::now() - Duration::hours(3);

    let (wake_id, _) = {
        let mut store = h.store.lock().await;
        let wake_id = store.create_wake_event("dev-1", long_ago).unwrap();
        store.set_wake_state(wake_id, ProtocolState::SnapSent).unwrap();
        let t = store
            .create_or_get_transfer("dev-1", "stale.jpg", 5, Some(wake_id), long_ago)
            .unwrap();
        store
            .store_fragment(
                "dev-1",
                "stale.jpg",
                0,
                b"A",
                long_ago + Duration::minutes(60),
            )
            .unwrap();
        (wake_id, t)
    };

    let abandoned = h.engine.sweep_once(Utc::now()).await.unwrap();
    assert_eq!(abandoned, 1);

    let failures = h.downstream.failures.lock().unwrap().clone();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].2, "transfer_expired");

    {
        let store = h.store.lock().await;
        let wake = store.wake_event(wake_id).unwrap().unwrap();
        assert_eq!(wake.state, ProtocolState::Failed);
        assert_eq!(wake.failure_code.as_deref(), Some("transfer_expired"));
    }

    // Subsequent sweeps must not re-notify.
    let again = h.engine.sweep_once(Utc::now()).await.unwrap();
    assert_eq!(again, 0);
    assert_eq!(h.downstream.failures.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn site_schedule_is_inherited_when_device_has_none() {
    let lineage = DeviceLineage {
        mapped: true,
        approved: true,
        timezone: "UTC".to_owned(),
        device_schedule: None,
        site_schedule: Some("8,16".to_owned()),
        ..DeviceLineage::default()
    };
    let h = make_harness(lineage, RecordingDownstream::default());

    h.engine.handle_message(status("dev-1", 0)).await.unwrap();
    let artifact = h.publisher.capture_requests()[0].clone();
    h.engine
        .handle_message(metadata("dev-1", &artifact, 1))
        .await
        .unwrap();
    h.engine
        .handle_message(fragment("dev-1", &artifact, 0, b"x"))
        .await
        .unwrap();

    let sleeps = h.publisher.sleep_directives();
    assert_eq!(sleeps.len(), 1);
    let next: DateTime<Utc> = sleeps[0].next_wake_at.parse().unwrap();
    use chrono::Timelike;
    assert!(
        next.hour() == 8 || next.hour() == 16,
        "next wake lands on a site schedule hour, got {next}"
    );
}
