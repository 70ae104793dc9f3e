use std::sync::Arc;

use crate::downstream::HttpDownstream;
use crate::engine::Engine;
use crate::lineage::HttpLineageResolver;
use crate::publisher::SessionPublisher;

/// The production engine wiring: HTTP seams plus the session publisher.
pub type AppEngine = Engine<HttpLineageResolver, HttpDownstream, SessionPublisher>;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<AppEngine>,
    pub publisher: SessionPublisher,
}

impl AppState {
    pub fn new(engine: Arc<AppEngine>, publisher: SessionPublisher) -> Self {
        Self { engine, publisher }
    }
}
