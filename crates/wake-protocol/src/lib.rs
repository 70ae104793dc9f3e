// wake-protocol: Device wake-protocol types and serialization.
//
// All transport messages use a top-level `kind` field for discriminated
// deserialization.  Inbound messages come from field devices; outbound
// directives go back to a specific device over the same link.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Shared sub-types
// ---------------------------------------------------------------------------

/// Environmental sensor readings carried on status, metadata, and
/// telemetry-only messages.
///
/// All fields optional; a device with a failed sensor omits the reading
/// rather than sending a sentinel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReadings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pressure: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_resistance: Option<f64>,
}

impl TelemetryReadings {
    pub fn is_empty(&self) -> bool {
        self.temperature.is_none()
            && self.humidity.is_none()
            && self.pressure.is_none()
            && self.gas_resistance.is_none()
    }
}

// ---------------------------------------------------------------------------
// Device -> Server messages
// ---------------------------------------------------------------------------

/// Device status ("alive") message.
///
/// Sent as the first message of a wake.  `pending_images` is the device's
/// self-reported count of artifacts it still holds on local storage; the
/// server uses it for visibility only — the device's own retry cadence is
/// the recovery mechanism for undelivered artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub device_id: String,
    #[serde(default)]
    pub pending_images: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<TelemetryReadings>,
}

/// Image metadata: declares an artifact and its total fragment count.
///
/// Redelivery of the same metadata for an in-flight transfer is absorbed;
/// it must never create a duplicate transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub device_id: String,
    pub artifact_name: String,
    pub total_fragments: u32,
    #[serde(default)]
    pub image_size_bytes: u64,
    /// Device-reported capture time; accepted as-is, no server adjustment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<TelemetryReadings>,
}

/// One fragment of a named artifact.
///
/// `frag_index` is zero-based; `payload_b64` is the raw fragment bytes in
/// standard base64.  Duplicate delivery of the same index is a no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageFragment {
    pub device_id: String,
    pub artifact_name: String,
    pub frag_index: u32,
    pub payload_b64: String,
}

impl ImageFragment {
    /// Decode the base64 payload into raw bytes.
    pub fn payload_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(&self.payload_b64)
    }

    /// Encode raw bytes into the wire payload field.
    pub fn encode_payload(bytes: &[u8]) -> String {
        BASE64.encode(bytes)
    }
}

/// Sensor readings with no artifact expected this wake.
///
/// The only inbound kind that never touches fragment storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReport {
    pub device_id: String,
    pub telemetry: TelemetryReadings,
}

// ---------------------------------------------------------------------------
// Server -> Device directives
// ---------------------------------------------------------------------------

/// Ask the device to produce (or continue producing) a named artifact.
///
/// Safe to send more than once; the device treats it as "produce this named
/// artifact", not "take another photo".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRequest {
    pub artifact_name: String,
}

/// Ask the device to resend exactly the listed fragments.
///
/// `indices` is ascending.  Never a full-artifact restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingFragmentsRequest {
    pub artifact_name: String,
    pub indices: Vec<u32>,
}

/// Put the device back to sleep until its next scheduled wake.
///
/// `next_wake` is the compact display string the device firmware parses
/// (e.g. "6:30 PM"); `next_wake_at` is the RFC 3339 instant for logging and
/// debugging on the server side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SleepUntil {
    pub next_wake: String,
    pub next_wake_at: String,
}

// ---------------------------------------------------------------------------
// Failure codes
// ---------------------------------------------------------------------------

/// Frozen failure codes reported through the downstream failure interface.
pub mod failure_codes {
    pub const ASSEMBLY_FAILED: &str = "assembly_failed";
    pub const UPLOAD_FAILED: &str = "upload_failed";
    pub const COMPLETION_FAILED: &str = "completion_failed";
    pub const TRANSFER_EXPIRED: &str = "transfer_expired";
}

// ---------------------------------------------------------------------------
// Top-level discriminated unions
// ---------------------------------------------------------------------------

/// All inbound message kinds.
///
/// Serializes/deserializes using the `kind` field as a tag.
///
/// ```json
/// { "kind": "status", "device_id": "B8F862F9CFB8", "pending_images": 0 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum DeviceMessage {
    Status(StatusMessage),
    ImageMetadata(ImageMetadata),
    ImageFragment(ImageFragment),
    Telemetry(TelemetryReport),
}

impl DeviceMessage {
    /// The device this message is addressed from.
    pub fn device_id(&self) -> &str {
        match self {
            DeviceMessage::Status(m) => &m.device_id,
            DeviceMessage::ImageMetadata(m) => &m.device_id,
            DeviceMessage::ImageFragment(m) => &m.device_id,
            DeviceMessage::Telemetry(m) => &m.device_id,
        }
    }
}

/// All outbound directive kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum Directive {
    CaptureRequest(CaptureRequest),
    MissingFragments(MissingFragmentsRequest),
    SleepUntil(SleepUntil),
}
