// src/manager.rs

use crate::assembler;
use crate::config::EngineConfig;
use crate::events::{DownloadEvent, EventBus};
use crate::fetcher::StopSignal;
use crate::limiter::SpeedLimiter;
use crate::models::{
    DownloadId, DownloadJob, DownloadOptions, FailureReason, InvalidTransition, JobStatus, Priority, SegmentStatus,
};
use crate::orchestrator::{EngineContext, Orchestrator};
use crate::queue::QueueManager;
use crate::retry::{ErrorClass, RetryDecision};
use crate::state_manager::{Persister, StateError, StateManager};
use reqwest::Url;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("invalid url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("destination {} is not writable: {reason}", path.display())]
    DestinationUnwritable { path: PathBuf, reason: String },
    #[error("download {0} not found")]
    NotFound(DownloadId),
    #[error(transparent)]
    InvalidStateTransition(#[from] InvalidTransition),
    #[error("download {0} is running")]
    Running(DownloadId),
    #[error("state manager error: {0}")]
    State(#[from] StateError),
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// A download that currently has an orchestrator.
struct ActiveDownload {
    signal: StopSignal,
    snapshot: watch::Receiver<DownloadJob>,
    finished: watch::Receiver<bool>,
}

struct Inner {
    /// Every known record. For running downloads this is the record as of
    /// admission; the live copy is `ActiveDownload::snapshot`.
    jobs: HashMap<DownloadId, DownloadJob>,
    active: HashMap<DownloadId, ActiveDownload>,
    queue: QueueManager,
    shutting_down: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    store: StateManager,
    ctx: EngineContext,
}

/// The central component that manages the state and lifecycle of all downloads.
///
/// Cheap to clone; every clone drives the same engine.
#[derive(Clone)]
pub struct DownloadManager {
    shared: Arc<Shared>,
}

impl DownloadManager {
    /// Loads every stored download and starts whatever was waiting in the queue.
    ///
    /// Downloads that were still `Downloading` when the process went away are
    /// brought back as `Paused`.
    pub async fn new(store: StateManager, config: EngineConfig) -> Result<Self, ManagerError> {
        let client = config.http_client()?;
        let ctx = EngineContext {
            client,
            limiter: SpeedLimiter::new(config.speed_limit),
            persister: Persister::spawn(store.clone()),
            events: EventBus::new(config.event_capacity),
            config: Arc::new(config),
        };

        let mut jobs = HashMap::new();
        let mut queue = QueueManager::new(ctx.config.max_concurrent);
        let mut loaded = store.load_all().await?;
        loaded.sort_by_key(|job| job.created_at);
        for mut job in loaded {
            if job.status == JobStatus::Downloading {
                job.transition(JobStatus::Paused)?;
                for segment in &mut job.segments {
                    if segment.status == SegmentStatus::Active {
                        segment.status = SegmentStatus::Paused;
                    }
                }
                ctx.persister.save(&job);
                info!(download_id = %job.id, "interrupted download restored as paused");
            }
            if job.status == JobStatus::Queued {
                queue.push(job.id, job.priority);
            }
            jobs.insert(job.id, job);
        }
        info!(downloads = jobs.len(), "download manager ready");

        let manager = Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    jobs,
                    active: HashMap::new(),
                    queue,
                    shutting_down: false,
                }),
                store,
                ctx,
            }),
        };
        {
            let mut inner = manager.shared.inner.lock().await;
            manager.schedule(&mut inner);
        }
        Ok(manager)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.ctx.config
    }

    /// Events for every download: additions, progress, status changes, retries, removals.
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.shared.ctx.events.subscribe()
    }

    /// Registers a new download and, unless `options.autostart` is off,
    /// queues it right away.
    pub async fn add(
        &self,
        url: &str,
        destination: impl Into<PathBuf>,
        options: DownloadOptions,
    ) -> Result<DownloadId, ManagerError> {
        let url = validate_url(url)?;
        let destination = destination.into();
        check_destination(&destination).await?;

        let autostart = options.autostart;
        let mut job = DownloadJob::new(url, destination, options, self.config().default_segments);
        let id = job.id;

        let mut inner = self.shared.inner.lock().await;
        self.shared.ctx.persister.save(&job);
        self.shared.ctx.events.emit(DownloadEvent::Added { id });
        info!(download_id = %id, url = %job.url, destination = %job.destination.display(), "download added");

        if autostart {
            inner.queue.push(id, job.priority);
        } else {
            self.apply(&mut job, JobStatus::Paused)?;
        }
        inner.jobs.insert(id, job);
        self.schedule(&mut inner);
        Ok(id)
    }

    /// Queues a download that was added without autostart or paused.
    pub async fn start(&self, id: DownloadId) -> Result<(), ManagerError> {
        let mut inner = self.shared.inner.lock().await;
        let status = self.current_status(&inner, id)?;
        match status {
            JobStatus::Queued => {
                let priority = inner.jobs.get(&id).map_or(0, |job| job.priority);
                inner.queue.push(id, priority);
                self.schedule(&mut inner);
                Ok(())
            }
            JobStatus::Paused => self.requeue(&mut inner, id),
            from => Err(InvalidTransition { from, to: JobStatus::Downloading }.into()),
        }
    }

    /// Stops a running download at the next chunk boundary, keeping its
    /// progress. A queued download simply leaves the queue.
    ///
    /// A running download that settles some other way first, for instance by
    /// completing, yields `InvalidStateTransition`.
    pub async fn pause(&self, id: DownloadId) -> Result<(), ManagerError> {
        let mut inner = self.shared.inner.lock().await;
        if let Some(active) = inner.active.get(&id) {
            debug!(download_id = %id, "pause requested");
            active.signal.pause();
            let finished = active.finished.clone();
            inner.queue.release(id);
            self.schedule(&mut inner);
            drop(inner);
            wait_finished(finished).await;
            return self.confirm_stopped(id, JobStatus::Paused).await;
        }

        let job = inner.jobs.get_mut(&id).ok_or(ManagerError::NotFound(id))?;
        self.apply(job, JobStatus::Paused)?;
        inner.queue.remove(id);
        Ok(())
    }

    /// Puts a paused download back in the queue; it continues from its stored offsets.
    pub async fn resume(&self, id: DownloadId) -> Result<(), ManagerError> {
        let mut inner = self.shared.inner.lock().await;
        match self.current_status(&inner, id)? {
            JobStatus::Paused => self.requeue(&mut inner, id),
            from => Err(InvalidTransition { from, to: JobStatus::Queued }.into()),
        }
    }

    /// Stops a download for good and throws its partial data away. The record
    /// stays, as `Cancelled`.
    ///
    /// A running download that settles some other way first yields
    /// `InvalidStateTransition`.
    pub async fn cancel(&self, id: DownloadId) -> Result<(), ManagerError> {
        let mut inner = self.shared.inner.lock().await;
        if let Some(active) = inner.active.get(&id) {
            debug!(download_id = %id, "cancel requested");
            active.signal.cancel();
            let finished = active.finished.clone();
            inner.queue.release(id);
            self.schedule(&mut inner);
            drop(inner);
            wait_finished(finished).await;
            return self.confirm_stopped(id, JobStatus::Cancelled).await;
        }

        let scratch = self.config().scratch_dir.clone();
        let job = inner.jobs.get_mut(&id).ok_or(ManagerError::NotFound(id))?;
        self.apply(job, JobStatus::Cancelled)?;
        let temp_files = job.segment_paths(&scratch);
        for segment in &mut job.segments {
            segment.bytes_downloaded = 0;
            segment.status = SegmentStatus::Pending;
        }
        self.shared.ctx.persister.save(job);
        inner.queue.remove(id);
        drop(inner);
        assembler::remove_segments(&temp_files).await;
        Ok(())
    }

    /// Re-queues a failed download with fresh retry counters.
    pub async fn retry(&self, id: DownloadId) -> Result<(), ManagerError> {
        let mut inner = self.shared.inner.lock().await;
        let from = self.current_status(&inner, id)?;
        if inner.active.contains_key(&id) || from != JobStatus::Failed {
            return Err(InvalidTransition { from, to: JobStatus::Queued }.into());
        }
        if let Some(job) = inner.jobs.get_mut(&id) {
            job.retry_count = 0;
        }
        self.requeue_failed(&mut inner, id)
    }

    /// Deletes a download's record and temp files, cancelling it first if it is running.
    pub async fn remove(&self, id: DownloadId) -> Result<(), ManagerError> {
        let running = self.shared.inner.lock().await.active.contains_key(&id);
        if running {
            match self.cancel(id).await {
                // It finished on its own meanwhile; remove it all the same.
                Ok(()) | Err(ManagerError::InvalidStateTransition(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let mut inner = self.shared.inner.lock().await;
        if inner.active.contains_key(&id) {
            return Err(ManagerError::Running(id));
        }
        let job = inner.jobs.remove(&id).ok_or(ManagerError::NotFound(id))?;
        inner.queue.remove(id);
        self.shared.ctx.persister.delete(id);
        drop(inner);

        if job.status != JobStatus::Completed {
            assembler::remove_segments(&job.segment_paths(&self.config().scratch_dir)).await;
        }
        self.shared.ctx.events.emit(DownloadEvent::Removed { id });
        info!(download_id = %id, "download removed");
        Ok(())
    }

    /// Forgets every completed download. The downloaded files stay on disk.
    pub async fn clear_completed(&self) -> Result<usize, ManagerError> {
        let mut inner = self.shared.inner.lock().await;
        let completed: Vec<DownloadId> = inner
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Completed)
            .map(|job| job.id)
            .collect();
        for id in &completed {
            inner.jobs.remove(id);
        }
        drop(inner);

        self.shared.ctx.persister.flush().await?;
        let removed = self.shared.store.delete_with_status(JobStatus::Completed).await?;
        for id in completed {
            self.shared.ctx.events.emit(DownloadEvent::Removed { id });
        }
        debug!(removed, "cleared completed downloads");
        Ok(removed)
    }

    /// Reorders a download that is not running yet.
    pub async fn set_priority(&self, id: DownloadId, priority: Priority) -> Result<(), ManagerError> {
        let mut inner = self.shared.inner.lock().await;
        if inner.active.contains_key(&id) {
            return Err(ManagerError::Running(id));
        }
        let job = inner.jobs.get_mut(&id).ok_or(ManagerError::NotFound(id))?;
        job.priority = priority;
        self.shared.ctx.persister.save(job);
        inner.queue.set_priority(id, priority);
        Ok(())
    }

    /// Changes the global bandwidth cap. 0 lifts it.
    pub async fn set_speed_limit(&self, bytes_per_sec: u64) {
        self.shared.ctx.limiter.set_rate(bytes_per_sec).await;
        info!(bytes_per_sec, "speed limit changed");
    }

    /// A snapshot of one download.
    pub async fn get(&self, id: DownloadId) -> Result<DownloadJob, ManagerError> {
        let inner = self.shared.inner.lock().await;
        snapshot(&inner, id).ok_or(ManagerError::NotFound(id))
    }

    /// Snapshots of every download, oldest first.
    pub async fn list(&self) -> Vec<DownloadJob> {
        let inner = self.shared.inner.lock().await;
        let mut jobs: Vec<DownloadJob> = inner.jobs.keys().filter_map(|id| snapshot(&inner, *id)).collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    /// Waits until a download is neither queued nor downloading and returns
    /// its record. A download with an automatic retry pending counts as settled.
    pub async fn wait_settled(&self, id: DownloadId) -> Result<DownloadJob, ManagerError> {
        let mut events = self.subscribe();
        loop {
            let job = self.get(id).await?;
            if !matches!(job.status, JobStatus::Queued | JobStatus::Downloading) {
                return Ok(job);
            }
            match events.recv().await {
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return Ok(job),
            }
        }
    }

    /// Pauses everything that is running and writes every record out.
    pub async fn shutdown(&self) -> Result<(), ManagerError> {
        let waiting: Vec<watch::Receiver<bool>> = {
            let mut inner = self.shared.inner.lock().await;
            inner.shutting_down = true;
            inner
                .active
                .values()
                .map(|active| {
                    active.signal.pause();
                    active.finished.clone()
                })
                .collect()
        };
        info!(active = waiting.len(), "shutting down");
        for finished in waiting {
            wait_finished(finished).await;
        }

        {
            let inner = self.shared.inner.lock().await;
            for job in inner.jobs.values() {
                self.shared.ctx.persister.save(job);
            }
        }
        self.shared.ctx.persister.flush().await?;
        Ok(())
    }

    /// Checks where a stopped orchestrator actually left the download.
    async fn confirm_stopped(&self, id: DownloadId, wanted: JobStatus) -> Result<(), ManagerError> {
        let inner = self.shared.inner.lock().await;
        let status = self.current_status(&inner, id)?;
        if status != wanted {
            debug!(download_id = %id, %status, %wanted, "download settled before the stop took effect");
            return Err(InvalidTransition { from: status, to: wanted }.into());
        }
        Ok(())
    }

    fn current_status(&self, inner: &Inner, id: DownloadId) -> Result<JobStatus, ManagerError> {
        snapshot(inner, id)
            .map(|job| job.status)
            .ok_or(ManagerError::NotFound(id))
    }

    /// Applies a manager-driven status change to a record that has no
    /// orchestrator, then persists and announces it.
    fn apply(&self, job: &mut DownloadJob, next: JobStatus) -> Result<(), ManagerError> {
        let old = job.transition(next)?;
        self.shared.ctx.persister.save(job);
        self.shared.ctx.events.emit(DownloadEvent::StatusChanged {
            id: job.id,
            old,
            new: next,
            reason: None,
        });
        debug!(download_id = %job.id, %old, new = %next, "status changed");
        Ok(())
    }

    fn requeue(&self, inner: &mut Inner, id: DownloadId) -> Result<(), ManagerError> {
        let job = inner.jobs.get_mut(&id).ok_or(ManagerError::NotFound(id))?;
        self.apply(job, JobStatus::Queued)?;
        let priority = job.priority;
        inner.queue.push(id, priority);
        self.schedule(inner);
        Ok(())
    }

    fn requeue_failed(&self, inner: &mut Inner, id: DownloadId) -> Result<(), ManagerError> {
        let job = inner.jobs.get_mut(&id).ok_or(ManagerError::NotFound(id))?;
        job.reset_segment_retries();
        if matches!(job.last_error, Some(FailureReason::ChecksumMismatch { .. })) {
            // The segments were merged and deleted; only a fresh transfer helps.
            job.segments.clear();
            job.total_size = None;
            job.computed_checksum = None;
        }
        self.requeue(inner, id)
    }

    /// Starts an orchestrator for every download the queue lets in.
    fn schedule(&self, inner: &mut Inner) {
        if inner.shutting_down {
            return;
        }
        for id in inner.queue.admit() {
            let job = match inner.jobs.get(&id) {
                Some(job) if job.status == JobStatus::Queued => job.clone(),
                _ => {
                    inner.queue.release(id);
                    continue;
                }
            };

            let signal = StopSignal::new();
            let (snapshot_tx, snapshot_rx) = watch::channel(job.clone());
            let (finished_tx, finished_rx) = watch::channel(false);
            inner.active.insert(
                id,
                ActiveDownload {
                    signal: signal.clone(),
                    snapshot: snapshot_rx,
                    finished: finished_rx,
                },
            );

            let orchestrator = Orchestrator::new(job, self.shared.ctx.clone(), signal, snapshot_tx);
            let manager = self.clone();
            tokio::spawn(async move {
                let job = orchestrator.run().await;
                manager.finish(job).await;
                let _ = finished_tx.send(true);
            });
        }
    }

    /// Takes back a record from its orchestrator and frees the slot.
    async fn finish(&self, job: DownloadJob) {
        let id = job.id;
        let mut inner = self.shared.inner.lock().await;
        inner.active.remove(&id);
        inner.queue.release(id);
        debug!(download_id = %id, status = %job.status, "orchestrator finished");

        let auto_retry = self.config().auto_retry
            && !inner.shutting_down
            && job.status == JobStatus::Failed
            && job.last_error.as_ref().is_some_and(FailureReason::is_auto_retryable);
        if auto_retry {
            self.schedule_auto_retry(&job);
        }

        inner.jobs.insert(id, job);
        self.schedule(&mut inner);
    }

    fn schedule_auto_retry(&self, job: &DownloadJob) {
        let policy = &self.config().retry;
        let attempt = job.retry_count + 1;
        let delay = match policy.decide(attempt, ErrorClass::Transient) {
            RetryDecision::RetryAfter(delay) => delay,
            RetryDecision::GiveUp => {
                warn!(download_id = %job.id, attempts = attempt, "giving up on download");
                return;
            }
        };

        info!(download_id = %job.id, attempt, ?delay, "download will be retried");
        self.shared.ctx.events.emit(DownloadEvent::RetryScheduled {
            id: job.id,
            segment: None,
            attempt,
            max_attempts: policy.max_attempts,
            delay,
        });

        let manager = self.clone();
        let (id, retry_count) = (job.id, job.retry_count);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.auto_retry(id, retry_count).await;
        });
    }

    async fn auto_retry(&self, id: DownloadId, retry_count: u32) {
        let mut inner = self.shared.inner.lock().await;
        if inner.shutting_down || inner.active.contains_key(&id) {
            return;
        }
        // The user may have retried, cancelled or removed it meanwhile.
        let Some(job) = inner.jobs.get_mut(&id) else { return };
        if job.status != JobStatus::Failed || job.retry_count != retry_count {
            return;
        }
        job.retry_count += 1;
        if let Err(e) = self.requeue_failed(&mut inner, id) {
            warn!(download_id = %id, error = %e, "automatic retry failed");
        }
    }
}

fn snapshot(inner: &Inner, id: DownloadId) -> Option<DownloadJob> {
    match inner.active.get(&id) {
        Some(active) => Some(active.snapshot.borrow().clone()),
        None => inner.jobs.get(&id).cloned(),
    }
}

async fn wait_finished(mut finished: watch::Receiver<bool>) {
    // An error means the orchestrator task is gone, which is just as final.
    let _ = finished.wait_for(|done| *done).await;
}

fn validate_url(raw: &str) -> Result<String, ManagerError> {
    let invalid = |reason: &str| ManagerError::InvalidUrl {
        url: raw.to_string(),
        reason: reason.to_string(),
    };
    let url = Url::parse(raw.trim()).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("only http and https are supported"));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing host"));
    }
    Ok(url.to_string())
}

/// Makes sure the destination's directory exists and accepts new files.
async fn check_destination(path: &Path) -> Result<(), ManagerError> {
    let unwritable = |reason: String| ManagerError::DestinationUnwritable {
        path: path.to_path_buf(),
        reason,
    };
    if path.file_name().is_none() {
        return Err(unwritable("no file name".into()));
    }
    if tokio::fs::metadata(path).await.is_ok_and(|meta| meta.is_dir()) {
        return Err(unwritable("is a directory".into()));
    }

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    tokio::fs::create_dir_all(&parent)
        .await
        .map_err(|e| unwritable(e.to_string()))?;
    tokio::task::spawn_blocking(move || tempfile::NamedTempFile::new_in(parent))
        .await
        .map_err(|e| unwritable(e.to_string()))?
        .map_err(|e| unwritable(e.to_string()))?;
    Ok(())
}
