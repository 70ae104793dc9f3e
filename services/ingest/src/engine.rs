//! Protocol router and wake state machine.
//!
//! Every inbound message is handled to logical completion before control
//! returns.  Redelivery and out-of-order delivery are absorbed structurally
//! by the store's write-if-absent keys, so no handler takes a lock for
//! correctness — the store mutex only serializes SQLite access.
//!
//! The engine never invents internal retries: a malformed frame is dropped,
//! a failed finalization step is reported downstream, and the device's own
//! self-reported pending counter drives all recovery on its next wake.

use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::downstream::Downstream;
use crate::lineage::{DeviceLineage, LineageResolver};
use crate::publisher::DirectivePublisher;
use crate::schedule::{self, NextWake, ScheduleExpr};
use crate::state_machine::{IllegalTransition, ProtocolState};
use crate::storage::{StoreError, TransferStatus, WakeStore};
use wake_protocol::{
    CaptureRequest, DeviceMessage, Directive, ImageFragment, ImageMetadata,
    MissingFragmentsRequest, SleepUntil, StatusMessage, TelemetryReport,
};

// ---------------------------------------------------------------------------
// Config and errors
// ---------------------------------------------------------------------------

/// Engine tuning knobs, sourced from the service config.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Fragment rows older than this are swept; also the abandonment
    /// threshold for in-flight transfers.
    pub fragment_ttl: chrono::Duration,
    /// Wake hour used when neither device nor site carries a schedule.
    pub default_wake_hour: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("state machine: {0}")]
    Transition(#[from] IllegalTransition),
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The wake-protocol engine.
///
/// Generic over its three external seams so tests can substitute in-memory
/// fakes; the service wires HTTP clients and the session publisher.
pub struct Engine<L, D, P> {
    pub(crate) store: Arc<Mutex<WakeStore>>,
    pub(crate) lineage: L,
    pub(crate) downstream: D,
    pub(crate) publisher: P,
    pub(crate) cfg: EngineConfig,
}

impl<L, D, P> Engine<L, D, P>
where
    L: LineageResolver,
    D: Downstream,
    P: DirectivePublisher,
{
    pub fn new(
        store: Arc<Mutex<WakeStore>>,
        lineage: L,
        downstream: D,
        publisher: P,
        cfg: EngineConfig,
    ) -> Self {
        Self {
            store,
            lineage,
            downstream,
            publisher,
            cfg,
        }
    }

    /// Classify and handle one inbound message.
    pub async fn handle_message(&self, msg: DeviceMessage) -> Result<(), EngineError> {
        match msg {
            DeviceMessage::Status(m) => self.handle_status(m).await,
            DeviceMessage::ImageMetadata(m) => self.handle_metadata(m).await,
            DeviceMessage::ImageFragment(m) => self.handle_fragment(m).await,
            DeviceMessage::Telemetry(m) => self.handle_telemetry(m).await,
        }
    }

    // -----------------------------------------------------------------------
    // Message handlers
    // -----------------------------------------------------------------------

    async fn handle_status(&self, msg: StatusMessage) -> Result<(), EngineError> {
        let now = Utc::now();
        let device_id = msg.device_id.clone();
        info!(
            device_id = %device_id,
            pending = msg.pending_images,
            "device awake"
        );

        let wake_id = {
            let mut store = self.store.lock().await;
            store.touch_device_seen(&device_id, now, msg.telemetry.as_ref())?;
            store.create_wake_event(&device_id, now)?
        };

        let lineage = match self.lineage.resolve(&device_id).await {
            Ok(l) => Some(l),
            Err(e) => {
                warn!(
                    device_id = %device_id,
                    error = %e,
                    "lineage resolution failed; deferring capture to a later wake"
                );
                None
            }
        };

        let routable = matches!(&lineage, Some(l) if l.mapped && l.approved);
        if routable {
            self.begin_capture(&device_id, wake_id, now).await
        } else {
            // Unmapped or unapproved: no artifact is requested and no data
            // is lost, only deferred to when an operator maps the device.
            info!(device_id = %device_id, "device not routable; sleep only");
            self.advance_wake(wake_id, ProtocolState::SleepOnly).await?;
            self.issue_sleep(&device_id, Some(wake_id), lineage.as_ref(), now)
                .await?;
            Ok(())
        }
    }

    async fn begin_capture(
        &self,
        device_id: &str,
        wake_id: i64,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let artifact_name = generate_artifact_name(now);
        {
            let mut store = self.store.lock().await;
            let wake = require_wake(&store, wake_id)?;
            let next = wake.state.advance(ProtocolState::AckSent)?;
            store.set_wake_state(wake_id, next)?;
            store.mark_ack_sent(wake_id, now)?;
            store.set_wake_artifact(wake_id, &artifact_name)?;
        }

        self.publish_or_drop(
            device_id,
            Directive::CaptureRequest(CaptureRequest {
                artifact_name: artifact_name.clone(),
            }),
        )
        .await;

        {
            let mut store = self.store.lock().await;
            let wake = require_wake(&store, wake_id)?;
            let next = wake.state.advance(ProtocolState::SnapSent)?;
            store.set_wake_state(wake_id, next)?;
            store.mark_capture_requested(wake_id, now)?;
        }
        info!(
            device_id = %device_id,
            artifact = %artifact_name,
            "capture requested"
        );
        Ok(())
    }

    async fn handle_metadata(&self, msg: ImageMetadata) -> Result<(), EngineError> {
        if msg.total_fragments == 0 {
            warn!(
                device_id = %msg.device_id,
                artifact = %msg.artifact_name,
                "metadata declaring zero fragments discarded"
            );
            return Ok(());
        }
        let now = Utc::now();
        let (created, complete) = {
            let mut store = self.store.lock().await;
            store.touch_device_seen(&msg.device_id, now, msg.telemetry.as_ref())?;
            let wake = match store.find_wake_for_artifact(&msg.device_id, &msg.artifact_name)? {
                Some(w) => Some(w),
                None => store.latest_open_wake(&msg.device_id)?,
            };
            if wake.is_none() {
                warn!(
                    device_id = %msg.device_id,
                    artifact = %msg.artifact_name,
                    "metadata for artifact with no open wake"
                );
            }
            let (transfer, created) = store.create_or_get_transfer(
                &msg.device_id,
                &msg.artifact_name,
                msg.total_fragments,
                wake.map(|w| w.wake_id),
                now,
            )?;
            let complete = transfer.status == TransferStatus::Receiving
                && store.is_complete(&msg.device_id, &msg.artifact_name, msg.total_fragments)?;
            (created, complete)
        };

        if created {
            info!(
                device_id = %msg.device_id,
                artifact = %msg.artifact_name,
                total = msg.total_fragments,
                "transfer opened"
            );
        } else {
            debug!(
                device_id = %msg.device_id,
                artifact = %msg.artifact_name,
                "metadata redelivered; transfer reused"
            );
        }
        // Fragments can outrun metadata on a lossy link; the transfer may
        // already be satisfied the moment it is declared.
        if complete {
            self.finalize(&msg.device_id, &msg.artifact_name).await?;
        }
        Ok(())
    }

    async fn handle_fragment(&self, msg: ImageFragment) -> Result<(), EngineError> {
        let bytes = match msg.payload_bytes() {
            Ok(b) if !b.is_empty() => b,
            Ok(_) => {
                warn!(
                    device_id = %msg.device_id,
                    artifact = %msg.artifact_name,
                    index = msg.frag_index,
                    "empty fragment payload discarded"
                );
                return Ok(());
            }
            Err(e) => {
                warn!(
                    device_id = %msg.device_id,
                    artifact = %msg.artifact_name,
                    index = msg.frag_index,
                    error = %e,
                    "undecodable fragment payload discarded"
                );
                return Ok(());
            }
        };

        let now = Utc::now();
        let expires_at = now + self.cfg.fragment_ttl;
        let (newly_stored, transfer) = {
            let mut store = self.store.lock().await;
            store.touch_device_seen(&msg.device_id, now, None)?;
            let transfer = store.transfer(&msg.device_id, &msg.artifact_name)?;
            if transfer
                .as_ref()
                .is_some_and(|t| t.status != TransferStatus::Receiving)
            {
                debug!(
                    device_id = %msg.device_id,
                    artifact = %msg.artifact_name,
                    index = msg.frag_index,
                    "fragment for finalized transfer absorbed"
                );
                return Ok(());
            }
            let newly = store.store_fragment(
                &msg.device_id,
                &msg.artifact_name,
                msg.frag_index,
                &bytes,
                expires_at,
            )?;
            (newly, transfer)
        };

        if newly_stored {
            debug!(
                device_id = %msg.device_id,
                artifact = %msg.artifact_name,
                index = msg.frag_index,
                "fragment stored"
            );
        } else {
            debug!(
                device_id = %msg.device_id,
                artifact = %msg.artifact_name,
                index = msg.frag_index,
                "duplicate fragment absorbed"
            );
        }

        // Until metadata declares a total, completeness is undecidable.
        let Some(transfer) = transfer else {
            return Ok(());
        };
        let declared = u32::try_from(transfer.declared_total).unwrap_or(0);
        let complete = {
            let store = self.store.lock().await;
            store.is_complete(&msg.device_id, &msg.artifact_name, declared)?
        };
        if complete {
            self.finalize(&msg.device_id, &msg.artifact_name).await?;
        } else if msg.frag_index + 1 == declared {
            // The device's send pass has ended with gaps: request exactly
            // the missing indices, never a full restart.
            let missing = {
                let store = self.store.lock().await;
                store.missing_indices(&msg.device_id, &msg.artifact_name, declared)?
            };
            info!(
                device_id = %msg.device_id,
                artifact = %msg.artifact_name,
                missing = missing.len(),
                "requesting missing fragments"
            );
            self.publish_or_drop(
                &msg.device_id,
                Directive::MissingFragments(MissingFragmentsRequest {
                    artifact_name: msg.artifact_name.clone(),
                    indices: missing,
                }),
            )
            .await;
        }
        Ok(())
    }

    async fn handle_telemetry(&self, msg: TelemetryReport) -> Result<(), EngineError> {
        // The only message kind that never touches fragment storage.
        let now = Utc::now();
        let mut store = self.store.lock().await;
        store.touch_device_seen(&msg.device_id, now, Some(&msg.telemetry))?;
        debug!(device_id = %msg.device_id, "telemetry recorded");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Shared helpers
    // -----------------------------------------------------------------------

    /// Validate and persist a wake state transition.
    pub(crate) async fn advance_wake(
        &self,
        wake_id: i64,
        to: ProtocolState,
    ) -> Result<(), EngineError> {
        let mut store = self.store.lock().await;
        let wake = require_wake(&store, wake_id)?;
        let next = wake.state.advance(to)?;
        store.set_wake_state(wake_id, next)?;
        Ok(())
    }

    /// Compute the next wake, commit the device's schedule state, and issue
    /// the sleep directive.
    ///
    /// `reference` is the device's actual wake time (now); the committed
    /// schedule only ever advances.
    pub(crate) async fn issue_sleep(
        &self,
        device_id: &str,
        wake_id: Option<i64>,
        lineage: Option<&DeviceLineage>,
        reference: DateTime<Utc>,
    ) -> Result<NextWake, EngineError> {
        let stored_expr = {
            let store = self.store.lock().await;
            store.device_state(device_id)?.and_then(|d| d.schedule_expr)
        };
        let device_expr = lineage
            .and_then(|l| l.device_schedule.clone())
            .or(stored_expr);
        let site_expr = lineage.and_then(|l| l.site_schedule.clone());

        let expr = match schedule::resolve_expr(
            device_expr.as_deref(),
            site_expr.as_deref(),
            self.cfg.default_wake_hour,
        ) {
            Ok(e) => e,
            Err(e) => {
                warn!(
                    device_id = %device_id,
                    error = %e,
                    "unusable schedule expression; using default hour"
                );
                ScheduleExpr::FixedHour(self.cfg.default_wake_hour)
            }
        };
        let tz = match lineage
            .map(|l| l.timezone.as_str())
            .filter(|s| !s.is_empty())
        {
            Some(name) => match schedule::parse_timezone(name) {
                Ok(tz) => tz,
                Err(e) => {
                    warn!(device_id = %device_id, error = %e, "falling back to UTC");
                    chrono_tz::UTC
                }
            },
            None => chrono_tz::UTC,
        };

        let next = schedule::next_wake(&expr, reference, tz);
        {
            let mut store = self.store.lock().await;
            store.commit_wake_schedule(
                device_id,
                reference,
                next.instant,
                device_expr.as_deref(),
            )?;
        }

        self.publish_or_drop(
            device_id,
            Directive::SleepUntil(SleepUntil {
                next_wake: next.display.clone(),
                next_wake_at: next.instant.to_rfc3339_opts(SecondsFormat::Secs, true),
            }),
        )
        .await;

        if let Some(wake_id) = wake_id {
            let mut store = self.store.lock().await;
            store.mark_sleep_issued(wake_id, reference)?;
        }
        info!(
            device_id = %device_id,
            next_wake = %next.display,
            "sleep directive issued"
        );
        Ok(next)
    }

    /// Send a directive; an offline device is a logged drop, not an error.
    pub(crate) async fn publish_or_drop(&self, device_id: &str, directive: Directive) {
        if let Err(e) = self.publisher.publish(device_id, directive).await {
            warn!(device_id = %device_id, error = %e, "directive dropped");
        }
    }
}

fn require_wake(
    store: &WakeStore,
    wake_id: i64,
) -> Result<crate::storage::WakeEventRow, EngineError> {
    store
        .wake_event(wake_id)?
        .ok_or_else(|| EngineError::Store(StoreError::InvalidData(format!(
            "wake event {wake_id} missing"
        ))))
}

/// Server-generated artifact name: compact UTC timestamp plus entropy so
/// re-used wall-clock seconds cannot collide.
pub(crate) fn generate_artifact_name(now: DateTime<Utc>) -> String {
    let entropy = Uuid::new_v4().simple().to_string();
    format!("img_{}_{}.jpg", now.format("%Y%m%dT%H%M%SZ"), &entropy[..8])
}

#[cfg(test)]
mod tests {
    use super::generate_artifact_name;
    use chrono::{TimeZone, Utc};

    #[test]
    fn artifact_names_embed_timestamp_and_differ() {
        let now = Utc.with_ymd_and_hms(2026, 8, 4, 6, 30, 0).unwrap();
        let a = generate_artifact_name(now);
        let b = generate_artifact_name(now);
        assert!(a.starts_with("img_20260804T063000Z_"));
        assert!(a.ends_with(".jpg"));
        assert_ne!(a, b);
    }
}
