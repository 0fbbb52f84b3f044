// src/events.rs

use crate::models::{DownloadId, FailureReason, JobStatus};
use std::time::Duration;
use tokio::sync::broadcast;

/// Aggregate progress of one download.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub id: DownloadId,
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
    pub speed_bps: f64,
    pub eta_seconds: Option<u64>,
}

/// Everything the engine tells its collaborators.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    Added {
        id: DownloadId,
    },
    Progress(ProgressUpdate),
    StatusChanged {
        id: DownloadId,
        old: JobStatus,
        new: JobStatus,
        reason: Option<FailureReason>,
    },
    /// A segment (`Some(index)`) or the whole download (`None`) will be
    /// attempted again after `delay`.
    RetryScheduled {
        id: DownloadId,
        segment: Option<usize>,
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
    },
    Removed {
        id: DownloadId,
    },
}

impl DownloadEvent {
    pub fn id(&self) -> DownloadId {
        match self {
            DownloadEvent::Added { id }
            | DownloadEvent::StatusChanged { id, .. }
            | DownloadEvent::RetryScheduled { id, .. }
            | DownloadEvent::Removed { id } => *id,
            DownloadEvent::Progress(update) => update.id,
        }
    }
}

/// Fan-out of engine events. Subscribers that fall more than the channel
/// capacity behind observe `RecvError::Lagged` and skip ahead.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DownloadEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: DownloadEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }
}
