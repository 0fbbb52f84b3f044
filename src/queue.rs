// src/queue.rs

use crate::models::{DownloadId, Priority};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

/// A waiting download: its id, priority, and the order it was submitted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: DownloadId,
    pub priority: Priority,
    seq: u64,
}

impl Ord for QueueEntry {
    /// Higher priority first, then earlier submission.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Decides which queued downloads may run, bounded by `max_concurrent`.
///
/// Holds ids only; the download records live elsewhere.
#[derive(Debug)]
pub struct QueueManager {
    max_concurrent: usize,
    waiting: BinaryHeap<QueueEntry>,
    active: HashSet<DownloadId>,
    next_seq: u64,
}

impl QueueManager {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            waiting: BinaryHeap::new(),
            active: HashSet::new(),
            next_seq: 0,
        }
    }

    /// Queues a download. A download that is already waiting or running is left alone.
    pub fn push(&mut self, id: DownloadId, priority: Priority) {
        if self.active.contains(&id) || self.is_waiting(id) {
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.waiting.push(QueueEntry { id, priority, seq });
    }

    /// Drops a download from the waiting list. Returns whether it was there.
    pub fn remove(&mut self, id: DownloadId) -> bool {
        let before = self.waiting.len();
        self.waiting.retain(|entry| entry.id != id);
        self.waiting.len() != before
    }

    /// Changes the priority of a waiting download without losing its place among equals.
    pub fn set_priority(&mut self, id: DownloadId, priority: Priority) -> bool {
        let mut entries = std::mem::take(&mut self.waiting).into_vec();
        let mut found = false;
        for entry in entries.iter_mut().filter(|e| e.id == id) {
            entry.priority = priority;
            found = true;
        }
        self.waiting = entries.into();
        found
    }

    /// Frees the slot held by `id`.
    pub fn release(&mut self, id: DownloadId) -> bool {
        self.active.remove(&id)
    }

    /// Takes as many waiting downloads as there are free slots, best first,
    /// and marks them active.
    pub fn admit(&mut self) -> Vec<DownloadId> {
        let mut admitted = Vec::new();
        while self.active.len() < self.max_concurrent {
            let Some(entry) = self.waiting.pop() else { break };
            self.active.insert(entry.id);
            admitted.push(entry.id);
        }
        admitted
    }

    pub fn is_waiting(&self, id: DownloadId) -> bool {
        self.waiting.iter().any(|entry| entry.id == id)
    }

    pub fn is_active(&self, id: DownloadId) -> bool {
        self.active.contains(&id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting.len()
    }
}
