//! Sync progress events and the sink port they are delivered through.
//!
//! A sync emits events strictly in phase order and finishes with exactly one
//! terminal event, `Done` or `Error`. Sinks are fire-and-forget: they cannot fail
//! the operation and their absence only changes observability.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use crate::{Branch, CheckpointId, EngineError, Phase};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SyncEvent {
    Started {
        from: Branch,
        to: Branch,
    },
    #[serde(rename_all = "camelCase")]
    CheckpointCreated {
        checkpoint_id: CheckpointId,
    },
    Tables {
        tables: Vec<String>,
    },
    LockAcquired,
    Truncated {
        tables: usize,
    },
    TableStart {
        table: String,
    },
    /// `rows` is cumulative for the table.
    TableProgress {
        table: String,
        rows: u64,
    },
    TableDone {
        table: String,
        rows: u64,
    },
    SequencesRestored {
        count: usize,
    },
    #[serde(rename_all = "camelCase")]
    Done {
        checkpoint_id: CheckpointId,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        message: String,
        phase: Phase,
        safety_checkpoint: Option<CheckpointId>,
    },
}

impl SyncEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncEvent::Done { .. } | SyncEvent::Error { .. })
    }

    pub fn failed(phase: Phase, error: &EngineError, safety_checkpoint: Option<CheckpointId>) -> Self {
        SyncEvent::Error {
            message: error.to_string(),
            phase,
            safety_checkpoint,
        }
    }
}

/// Narrow event contract shared by WebSocket relays, logging and test assertions.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: &SyncEvent);
}

/// Adapts a plain callback into a sink.
pub struct FnSink<F>(pub F);

impl<F> ProgressSink for FnSink<F>
where
    F: Fn(&SyncEvent) + Send + Sync,
{
    fn emit(&self, event: &SyncEvent) {
        (self.0)(event)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn emit(&self, _event: &SyncEvent) {}
}

/// Writes every event to the `branchsync::progress` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn emit(&self, event: &SyncEvent) {
        match event {
            SyncEvent::Error { message, phase, safety_checkpoint } => warn!(
                target: "branchsync::progress",
                %phase,
                safety_checkpoint = ?safety_checkpoint,
                "sync failed: {message}"
            ),
            SyncEvent::TableProgress { table, rows } => {
                tracing::debug!(target: "branchsync::progress", %table, rows, "table progress")
            }
            other => info!(target: "branchsync::progress", event = ?other, "sync progress"),
        }
    }
}

/// Forwards events into an unbounded channel, e.g. towards a WebSocket relay.
/// A closed receiver is ignored.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: UnboundedSender<SyncEvent>,
}

impl ChannelSink {
    pub fn new(tx: UnboundedSender<SyncEvent>) -> Self {
        Self { tx }
    }
}

impl ProgressSink for ChannelSink {
    fn emit(&self, event: &SyncEvent) {
        let _ = self.tx.send(event.clone());
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SyncEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn terminal_count(&self) -> usize {
        self.events().iter().filter(|e| e.is_terminal()).count()
    }
}

impl ProgressSink for RecordingSink {
    fn emit(&self, event: &SyncEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
