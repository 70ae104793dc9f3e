//! TTL sweeper: the system's only timeout/cancellation mechanism.
//!
//! Rather than tracking per-transfer timers, bounded storage lifetime bounds
//! liveness problems: fragments expire, and an in-flight transfer left empty
//! past the TTL becomes an explicit `failed` plus one alert.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::downstream::Downstream;
use crate::engine::{Engine, EngineError};
use crate::lineage::LineageResolver;
use crate::publisher::DirectivePublisher;
use crate::state_machine::ProtocolState;
use wake_protocol::failure_codes;

impl<L, D, P> Engine<L, D, P>
where
    L: LineageResolver,
    D: Downstream,
    P: DirectivePublisher,
{
    /// One sweep pass.  Returns the number of transfers abandoned.
    ///
    /// The store flips abandoned transfers to `failed` in the same pass, so
    /// each one is reported exactly once — not on every subsequent sweep.
    pub async fn sweep_once(&self, now: chrono::DateTime<Utc>) -> Result<usize, EngineError> {
        let (expired, removed) = {
            let mut store = self.store.lock().await;
            store.sweep_expired(now, self.cfg.fragment_ttl)?
        };
        if removed > 0 {
            debug!(removed, "expired fragment rows swept");
        }

        for t in &expired {
            warn!(
                device_id = %t.device_id,
                artifact = %t.artifact_name,
                "transfer abandoned past TTL"
            );
            if let Some(wake_id) = t.wake_id {
                let mut store = self.store.lock().await;
                if let Some(wake) = store.wake_event(wake_id)? {
                    if !wake.state.is_terminal() {
                        let next = wake.state.advance(ProtocolState::Failed)?;
                        store.set_wake_state(wake_id, next)?;
                        store.set_wake_failure(wake_id, failure_codes::TRANSFER_EXPIRED)?;
                    }
                }
            }
            self.report_failure(
                &t.device_id,
                &t.artifact_name,
                failure_codes::TRANSFER_EXPIRED,
                "no fragments arrived within the storage TTL",
            )
            .await;
        }
        Ok(expired.len())
    }
}

/// Background sweep loop.  Runs until shutdown is signalled.
pub async fn run_sweeper<L, D, P>(
    engine: Arc<Engine<L, D, P>>,
    period: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) where
    L: LineageResolver,
    D: Downstream,
    P: DirectivePublisher,
{
    let mut ticker = tokio::time::interval(period);
    // The first tick fires immediately; skip it so a restart doesn't sweep
    // before sessions have a chance to resume.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match engine.sweep_once(Utc::now()).await {
                    Ok(0) => {}
                    Ok(n) => info!(abandoned = n, "sweep pass abandoned stale transfers"),
                    Err(e) => error!(error = %e, "sweep pass failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("sweeper stopping (shutdown)");
                    break;
                }
            }
        }
    }
}
