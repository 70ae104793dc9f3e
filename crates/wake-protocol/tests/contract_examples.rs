/// Contract golden tests: load each JSON example file, deserialize to Rust
/// types, serialize back to JSON, and verify round-trip fidelity.
use serde::Serialize;
use serde::de::DeserializeOwned;
use wake_protocol::{DeviceMessage, Directive};

/// Helper: load a JSON example file and assert round-trip.
///
/// Returns the deserialized value so callers can inspect fields.
fn round_trip<T: Serialize + DeserializeOwned>(relative_path: &str) -> T {
    // Example files live next to the workspace root, not the crate root.
    // Cargo sets CARGO_MANIFEST_DIR to the crate directory; we walk up two
    // levels to reach the workspace root.
    let manifest_dir = env!("CARGO_MANIFEST_DIR");
    let workspace_root = std::path::Path::new(manifest_dir)
        .parent()
        .expect("crates/")
        .parent()
        .expect("workspace root");

    let file_path = workspace_root.join(relative_path);
    let json_text = std::fs::read_to_string(&file_path)
        .unwrap_or_else(|e| panic!("Failed to read {}: {}", file_path.display(), e));

    let value: T = serde_json::from_str(&json_text)
        .unwrap_or_else(|e| panic!("Failed to deserialize {}: {}", file_path.display(), e));

    let serialized = serde_json::to_string(&value)
        .unwrap_or_else(|e| panic!("Failed to serialize {}: {}", file_path.display(), e));

    let original_json: serde_json::Value = serde_json::from_str(&json_text).unwrap();
    let roundtrip_json: serde_json::Value = serde_json::from_str(&serialized).unwrap();
    assert_eq!(
        original_json,
        roundtrip_json,
        "Round-trip mismatch for {}",
        file_path.display()
    );

    value
}

#[test]
fn status_round_trip() {
    let msg: DeviceMessage = round_trip("contracts/ws/v1/examples/status.json");
    match msg {
        DeviceMessage::Status(inner) => {
            assert_eq!(inner.device_id, "B8F862F9CFB8");
            assert_eq!(inner.pending_images, 3);
            let telemetry = inner.telemetry.expect("telemetry block");
            assert_eq!(telemetry.temperature, Some(72.5));
        }
        other => panic!("Expected Status, got {:?}", other),
    }
}

#[test]
fn image_metadata_round_trip() {
    let msg: DeviceMessage = round_trip("contracts/ws/v1/examples/image_metadata.json");
    match msg {
        DeviceMessage::ImageMetadata(inner) => {
            assert_eq!(inner.total_fragments, 5);
            assert!(!inner.artifact_name.is_empty());
            assert!(inner.capture_timestamp.is_some());
        }
        other => panic!("Expected ImageMetadata, got {:?}", other),
    }
}

#[test]
fn image_fragment_round_trip_and_payload_decode() {
    let msg: DeviceMessage = round_trip("contracts/ws/v1/examples/image_fragment.json");
    match msg {
        DeviceMessage::ImageFragment(inner) => {
            assert_eq!(inner.frag_index, 2);
            let bytes = inner.payload_bytes().expect("valid base64");
            // JPEG magic prefix from the example payload.
            assert_eq!(&bytes[..3], &[0xFF, 0xD8, 0xFF]);
        }
        other => panic!("Expected ImageFragment, got {:?}", other),
    }
}

#[test]
fn telemetry_round_trip() {
    let msg: DeviceMessage = round_trip("contracts/ws/v1/examples/telemetry.json");
    match msg {
        DeviceMessage::Telemetry(inner) => {
            assert!(!inner.telemetry.is_empty());
        }
        other => panic!("Expected Telemetry, got {:?}", other),
    }
}

#[test]
fn capture_request_round_trip() {
    let msg: Directive = round_trip("contracts/ws/v1/examples/capture_request.json");
    match msg {
        Directive::CaptureRequest(inner) => {
            assert!(!inner.artifact_name.is_empty());
        }
        other => panic!("Expected CaptureRequest, got {:?}", other),
    }
}

#[test]
fn missing_fragments_round_trip() {
    let msg: Directive = round_trip("contracts/ws/v1/examples/missing_fragments.json");
    match msg {
        Directive::MissingFragments(inner) => {
            assert_eq!(inner.indices, vec![3]);
        }
        other => panic!("Expected MissingFragments, got {:?}", other),
    }
}

#[test]
fn sleep_until_round_trip() {
    let msg: Directive = round_trip("contracts/ws/v1/examples/sleep_until.json");
    match msg {
        Directive::SleepUntil(inner) => {
            assert_eq!(inner.next_wake, "12:30 PM");
            assert!(!inner.next_wake_at.is_empty());
        }
        other => panic!("Expected SleepUntil, got {:?}", other),
    }
}

#[test]
fn fragment_payload_encode_decode_inverse() {
    let bytes = [0xFFu8, 0xD8, 0xFF, 0xE0, 0x00, 0x10];
    let encoded = wake_protocol::ImageFragment::encode_payload(&bytes);
    let frag = wake_protocol::ImageFragment {
        device_id: "dev-1".to_owned(),
        artifact_name: "a.jpg".to_owned(),
        frag_index: 0,
        payload_b64: encoded,
    };
    assert_eq!(frag.payload_bytes().unwrap(), bytes);
}

#[test]
fn device_id_accessor_covers_all_kinds() {
    let status = DeviceMessage::Status(wake_protocol::StatusMessage {
        device_id: "dev-a".to_owned(),
        pending_images: 0,
        telemetry: None,
    });
    assert_eq!(status.device_id(), "dev-a");

    let telemetry = DeviceMessage::Telemetry(wake_protocol::TelemetryReport {
        device_id: "dev-b".to_owned(),
        telemetry: wake_protocol::TelemetryReadings::default(),
    });
    assert_eq!(telemetry.device_id(), "dev-b");
}
