//! Correlation table for requests the gateway sends to its client.

use rgate_core::{GatewayError, GatewayResult};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

pub type Responder = oneshot::Sender<GatewayResult<Value>>;

struct PendingEntry {
    op: String,
    issued_at: Instant,
    responder: Responder,
}

/// Correlation id → waiting caller. Every entry is completed exactly once:
/// by a matching reply, by expiry, or by [`PendingTable::fail_all`].
#[derive(Default)]
pub struct PendingTable {
    next: u64,
    entries: HashMap<String, PendingEntry>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a correlation id, unique for the life of this table.
    pub fn next_id(&mut self) -> String {
        self.next += 1;
        format!("srv-{}", self.next)
    }

    pub fn insert(&mut self, id: String, op: impl Into<String>, responder: Responder) {
        self.entries.insert(
            id,
            PendingEntry {
                op: op.into(),
                issued_at: Instant::now(),
                responder,
            },
        );
    }

    /// Complete the entry for `id`. Returns `false` for unknown or already
    /// completed ids.
    pub fn resolve(&mut self, id: &str, result: GatewayResult<Value>) -> bool {
        match self.entries.remove(id) {
            Some(entry) => {
                let _ = entry.responder.send(result);
                true
            }
            None => false,
        }
    }

    /// Drop the entry without completing it. The caller owns the outcome.
    pub fn cancel(&mut self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Fail every entry issued more than `timeout` ago, and drop entries
    /// whose caller has gone away. Returns the `(id, op)` of each.
    pub fn expire(&mut self, timeout: Duration) -> Vec<(String, String)> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.issued_at.elapsed() >= timeout || e.responder.is_closed())
            .map(|(id, _)| id.clone())
            .collect();
        let mut out = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(entry) = self.entries.remove(&id) {
                let _ = entry.responder.send(Err(GatewayError::RequestTimeout));
                out.push((id, entry.op));
            }
        }
        out
    }

    /// Fail everything with `SessionTerminated`.
    pub fn fail_all(&mut self) -> usize {
        let count = self.entries.len();
        for (_, entry) in self.entries.drain() {
            let _ = entry.responder.send(Err(GatewayError::SessionTerminated));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
