//! Outbound directive publishing.
//!
//! Directives are addressed to a specific device and routed through the
//! per-device session registry.  A device with no active session is asleep
//! or gone; the directive is dropped and the device's own retry cadence is
//! the recovery mechanism.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};
use wake_protocol::Directive;

pub type DirectiveSenders = Arc<RwLock<HashMap<String, mpsc::Sender<Directive>>>>;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("device {0} has no active session")]
    Offline(String),
    #[error("session send failed for device {0}")]
    SessionClosed(String),
}

/// Publishes directives to devices.
pub trait DirectivePublisher: Send + Sync {
    fn publish(
        &self,
        device_id: &str,
        directive: Directive,
    ) -> impl Future<Output = Result<(), PublishError>> + Send;
}

/// Routes directives over the device's live transport session.
#[derive(Clone, Default)]
pub struct SessionPublisher {
    senders: DirectiveSenders,
}

impl SessionPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the directive sender for a device session.
    ///
    /// A reconnect replaces the previous sender; the stale session's channel
    /// closes when its socket task ends.
    pub async fn register(&self, device_id: &str, tx: mpsc::Sender<Directive>) {
        self.senders.write().await.insert(device_id.to_owned(), tx);
    }

    pub async fn unregister(&self, device_id: &str) {
        self.senders.write().await.remove(device_id);
    }
}

impl DirectivePublisher for SessionPublisher {
    async fn publish(&self, device_id: &str, directive: Directive) -> Result<(), PublishError> {
        let tx = {
            let senders = self.senders.read().await;
            senders.get(device_id).cloned()
        };
        match tx {
            None => Err(PublishError::Offline(device_id.to_owned())),
            Some(tx) => tx
                .send(directive)
                .await
                .map_err(|_| PublishError::SessionClosed(device_id.to_owned())),
        }
    }
}
