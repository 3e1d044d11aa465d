//! In-process engine hosting named data sources.
//!
//! Requests are answered on a later [`Engine::poll`], never synchronously. A
//! request whose body is the name of a hosted source is answered with that
//! source's contents; anything else is echoed back.

use std::collections::{HashMap, VecDeque};

use crate::bridge::{Engine, EngineResponse};
use crate::message::SessionId;

/// Responses flushed per poll step.
const POLL_BATCH: usize = 64;

#[derive(Default)]
pub struct MemoryEngine {
    sources: HashMap<String, Vec<u8>>,
    queued: VecDeque<EngineResponse>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `contents` available under `name`, replacing any previous source.
    pub fn host_data_source(&mut self, name: impl Into<String>, contents: impl Into<Vec<u8>>) {
        let name = name.into();
        let contents = contents.into();
        tracing::info!(source = %name, len = contents.len(), "hosting data source");
        self.sources.insert(name, contents);
    }

    pub fn data_sources(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    fn lookup(&self, request: &[u8]) -> Option<&[u8]> {
        let name = std::str::from_utf8(request).ok()?;
        self.sources.get(name.trim()).map(Vec::as_slice)
    }
}

impl Engine for MemoryEngine {
    fn handle_request(&mut self, session: SessionId, request: &[u8]) -> Vec<EngineResponse> {
        let body = self.lookup(request).unwrap_or(request).to_vec();
        tracing::trace!(%session, len = request.len(), "queued engine request");
        self.queued.push_back(EngineResponse::new(session, body));
        vec![]
    }

    fn poll(&mut self) -> Vec<EngineResponse> {
        let n = self.queued.len().min(POLL_BATCH);
        self.queued.drain(..n).collect()
    }

    fn has_pending(&self) -> bool {
        !self.queued.is_empty()
    }

    fn close_session(&mut self, session: SessionId) {
        let before = self.queued.len();
        self.queued.retain(|r| r.session != session);
        let dropped = before - self.queued.len();
        if dropped > 0 {
            tracing::debug!(%session, dropped, "discarded queued responses of closed session");
        }
    }
}
