//! Finalization pipeline.
//!
//! Entered exactly once per artifact, gated by completeness and by the
//! fragment rows still existing.  `clear_fragments` at the end is the sole
//! finalize guard: a second pass finds nothing to assemble and becomes a
//! safe no-op.  Each step failure carries a distinct typed code, is reported
//! through the downstream failure interface, and stops the pipeline — the
//! device's next wake (pending count still nonzero) is the retry trigger.

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::downstream::Downstream;
use crate::engine::{Engine, EngineError};
use crate::lineage::LineageResolver;
use crate::publisher::DirectivePublisher;
use crate::state_machine::ProtocolState;
use crate::storage::TransferStatus;
use wake_protocol::failure_codes;

impl<L, D, P> Engine<L, D, P>
where
    L: LineageResolver,
    D: Downstream,
    P: DirectivePublisher,
{
    /// Finalize a complete transfer: assemble, upload, notify, schedule the
    /// next wake, put the device to sleep, and clear the fragment rows.
    pub async fn finalize(&self, device_id: &str, artifact_name: &str) -> Result<(), EngineError> {
        let now = Utc::now();

        let transfer = {
            let store = self.store.lock().await;
            store.transfer(device_id, artifact_name)?
        };
        let Some(transfer) = transfer else {
            return Ok(());
        };
        if transfer.status != TransferStatus::Receiving {
            debug!(
                device_id = %device_id,
                artifact = %artifact_name,
                "transfer already finalized"
            );
            return Ok(());
        }
        {
            let store = self.store.lock().await;
            if !store.has_fragments(device_id, artifact_name)? {
                debug!(
                    device_id = %device_id,
                    artifact = %artifact_name,
                    "fragments already cleared; finalize is a no-op"
                );
                return Ok(());
            }
        }
        let declared = u32::try_from(transfer.declared_total).unwrap_or(0);

        let assembled = {
            let store = self.store.lock().await;
            store.assemble(device_id, artifact_name, declared)
        };
        let bytes = match assembled {
            Ok(b) => b,
            Err(e) => {
                self.report_failure(
                    device_id,
                    artifact_name,
                    failure_codes::ASSEMBLY_FAILED,
                    &e.to_string(),
                )
                .await;
                return Ok(());
            }
        };
        let size = bytes.len();

        let location = match self.downstream.upload(device_id, artifact_name, bytes).await {
            Ok(l) => l,
            Err(e) => {
                self.report_failure(
                    device_id,
                    artifact_name,
                    failure_codes::UPLOAD_FAILED,
                    &e.to_string(),
                )
                .await;
                return Ok(());
            }
        };
        {
            let mut store = self.store.lock().await;
            store.set_transfer_location(device_id, artifact_name, &location)?;
        }

        // Bytes are durably stored past this point; on failure only the
        // linkage needs retrying downstream, not the transfer itself.
        if let Err(e) = self
            .downstream
            .notify_complete(device_id, artifact_name, &location)
            .await
        {
            self.report_failure(
                device_id,
                artifact_name,
                failure_codes::COMPLETION_FAILED,
                &e.to_string(),
            )
            .await;
            return Ok(());
        }

        let wake = {
            let mut store = self.store.lock().await;
            store.set_transfer_status(device_id, artifact_name, TransferStatus::Complete)?;
            match transfer.wake_id {
                Some(id) => store.wake_event(id)?,
                None => store.find_wake_for_artifact(device_id, artifact_name)?,
            }
        };
        if let Some(wake) = &wake {
            self.advance_wake(wake.wake_id, ProtocolState::MetadataReceived)
                .await?;
        } else {
            warn!(
                device_id = %device_id,
                artifact = %artifact_name,
                "no wake event linked to finalized artifact"
            );
        }

        // Re-resolve lineage for timezone/schedule; the reference time is
        // this actual wake, keeping the schedule self-correcting.
        let lineage = match self.lineage.resolve(device_id).await {
            Ok(l) => Some(l),
            Err(e) => {
                warn!(
                    device_id = %device_id,
                    error = %e,
                    "lineage re-resolution failed; using cached schedule"
                );
                None
            }
        };
        self.issue_sleep(
            device_id,
            wake.as_ref().map(|w| w.wake_id),
            lineage.as_ref(),
            now,
        )
        .await?;

        if let Some(wake) = &wake {
            self.advance_wake(wake.wake_id, ProtocolState::Complete).await?;
            let mut store = self.store.lock().await;
            store.mark_wake_complete(wake.wake_id)?;
        }

        {
            let mut store = self.store.lock().await;
            store.clear_fragments(device_id, artifact_name)?;
        }
        info!(
            device_id = %device_id,
            artifact = %artifact_name,
            location = %location,
            size,
            "artifact finalized"
        );
        Ok(())
    }

    /// Report a typed failure downstream; delivery problems are logged, not
    /// propagated — there is no caller awaiting a response.
    pub(crate) async fn report_failure(
        &self,
        device_id: &str,
        artifact_name: &str,
        code: &str,
        message: &str,
    ) {
        error!(
            device_id = %device_id,
            artifact = %artifact_name,
            code,
            message,
            "finalization step failed"
        );
        if let Err(e) = self
            .downstream
            .notify_failure(device_id, artifact_name, code, message)
            .await
        {
            error!(
                device_id = %device_id,
                artifact = %artifact_name,
                error = %e,
                "failure notification could not be delivered"
            );
        }
    }
}
