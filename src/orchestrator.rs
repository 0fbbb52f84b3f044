// src/orchestrator.rs

use crate::assembler::{self, MergeError};
use crate::config::EngineConfig;
use crate::events::{DownloadEvent, EventBus, ProgressUpdate};
use crate::fetcher::{
    self, FetchContext, FetchError, FetchOutcome, FetchProgress, FetchSettings, StopReason, StopSignal,
};
use crate::integrity::{self, Verification};
use crate::limiter::SpeedLimiter;
use crate::models::{DownloadJob, FailureReason, InvalidTransition, JobStatus, Segment, SegmentStatus};
use crate::retry::{ErrorClass, RetryDecision, RetryState};
use crate::segmenter;
use crate::speed::{self, SpeedTracker};
use crate::state_manager::Persister;
use reqwest::Client;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Progress of a download with unknown size is checkpointed this often.
const UNSIZED_PERSIST_BYTES: u64 = 5 * 1024 * 1024;

/// Engine-wide pieces every orchestrator borrows.
#[derive(Clone)]
pub struct EngineContext {
    pub config: Arc<EngineConfig>,
    pub client: Client,
    pub limiter: SpeedLimiter,
    pub persister: Persister,
    pub events: EventBus,
}

impl EngineContext {
    fn fetch_settings(&self) -> FetchSettings {
        FetchSettings {
            read_timeout: self.config.read_timeout,
            progress_interval: self.config.progress_interval,
            progress_bytes: self.config.progress_bytes,
        }
    }
}

/// How one round of supervised fetching ended.
enum Round {
    Completed,
    Stopped,
    /// The server turned out to ignore ranges; start over unsegmented.
    Fallback,
    Failed(FailureReason),
}

/// How an assembly attempt ended.
enum Assembly {
    /// The download reached `Completed` or `Failed`.
    Settled,
    /// Segment files vanished before the merge; those segments were reset.
    Refetch,
}

type FetchResult = (usize, Result<FetchOutcome, FetchError>);

/// Drives one download from admission to a resting state.
///
/// The orchestrator is the only writer of its [`DownloadJob`] while it runs.
/// Everyone else reads the snapshots it publishes through `snapshot`.
pub struct Orchestrator {
    job: DownloadJob,
    ctx: EngineContext,
    stop: StopSignal,
    snapshot: watch::Sender<DownloadJob>,
    speed: SpeedTracker,
    persisted_step: u64,
    persisted_bytes: u64,
}

impl Orchestrator {
    pub fn new(
        job: DownloadJob,
        ctx: EngineContext,
        stop: StopSignal,
        snapshot: watch::Sender<DownloadJob>,
    ) -> Self {
        let speed = SpeedTracker::new(ctx.config.speed_window);
        let mut orchestrator = Self {
            job,
            ctx,
            stop,
            snapshot,
            speed,
            persisted_step: 0,
            persisted_bytes: 0,
        };
        orchestrator.persisted_step = orchestrator.progress_step();
        orchestrator.persisted_bytes = orchestrator.job.downloaded_bytes();
        orchestrator
    }

    /// Runs the download until it completes, fails, or is paused/cancelled,
    /// and hands the final record back.
    pub async fn run(mut self) -> DownloadJob {
        if self.set_status(JobStatus::Downloading, None).is_err() {
            return self.job;
        }
        info!(download_id = %self.job.id, url = %self.job.url, "download started");

        if let Err(e) = tokio::fs::create_dir_all(&self.ctx.config.scratch_dir).await {
            self.fail(FailureReason::Io { reason: e.to_string() });
            return self.job;
        }

        if self.job.segments.is_empty() {
            let probe = tokio::select! {
                probe = fetcher::probe(&self.ctx.client, &self.job.url, self.ctx.config.read_timeout) => probe,
                _ = self.stop.stopped() => return self.finish_stopped().await,
            };
            match probe {
                Ok(probe) => self.allocate(probe.total_size, probe.supports_ranges),
                Err(e) => {
                    warn!(download_id = %self.job.id, error = %e, "probe failed");
                    self.fail(FailureReason::FetchFailed {
                        reason: e.to_string(),
                        retryable: e.class() == ErrorClass::Transient,
                    });
                    return self.job;
                }
            }
        }

        self.reclaim_missing_segments().await;
        let mut refetched = false;
        loop {
            while !self.job.all_segments_complete() {
                match self.supervise().await {
                    Round::Completed => break,
                    Round::Stopped => return self.finish_stopped().await,
                    Round::Fallback => self.fall_back_to_single().await,
                    Round::Failed(reason) => {
                        self.fail(reason);
                        return self.job;
                    }
                }
            }

            if self.stop.is_stopped() {
                return self.finish_stopped().await;
            }
            match self.assemble(!refetched).await {
                Assembly::Settled => return self.job,
                Assembly::Refetch => refetched = true,
            }
        }
    }

    /// Puts finished segments whose temp file is gone back to the start, so
    /// they are fetched again instead of failing the merge.
    async fn reclaim_missing_segments(&mut self) {
        let scratch = self.ctx.config.scratch_dir.clone();
        let mut reclaimed = Vec::new();
        for segment in self.job.segments.iter().filter(|s| s.is_complete()) {
            let path = self.job.segment_path(&scratch, segment.index);
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                reclaimed.push(segment.index);
            }
        }
        if reclaimed.is_empty() {
            return;
        }
        warn!(download_id = %self.job.id, segments = ?reclaimed, "segment files missing, fetching them again");
        for index in &reclaimed {
            self.reset_segment(*index);
        }
        self.persisted_step = self.progress_step();
        self.persisted_bytes = self.job.downloaded_bytes();
        self.persist();
        self.publish();
    }

    fn reset_segment(&mut self, index: usize) {
        if let Some(segment) = self.segment_mut(index) {
            segment.bytes_downloaded = 0;
            segment.retry_count = 0;
            segment.status = SegmentStatus::Pending;
        }
    }

    fn allocate(&mut self, total_size: Option<u64>, supports_ranges: bool) {
        self.job.total_size = total_size;
        self.job.supports_ranges = supports_ranges;
        self.job.segments = segmenter::allocate(
            total_size,
            supports_ranges,
            self.job.num_segments,
            self.ctx.config.min_segment_size,
        );
        info!(
            download_id = %self.job.id,
            total_size = ?total_size,
            supports_ranges,
            segments = self.job.segments.len(),
            "resource probed"
        );
        self.persist();
        self.publish();
    }

    async fn fall_back_to_single(&mut self) {
        warn!(download_id = %self.job.id, "server ignores ranges, falling back to a single segment");
        assembler::remove_segments(&self.job.segment_paths(&self.ctx.config.scratch_dir)).await;
        self.speed.reset();
        self.persisted_step = 0;
        let total_size = self.job.total_size;
        self.allocate(total_size, false);
    }

    /// Spawns a fetcher for every unfinished segment and reacts to their
    /// progress and results until none is left running.
    async fn supervise(&mut self) -> Round {
        let round = self.stop.child();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let fetch_ctx = FetchContext {
            client: self.ctx.client.clone(),
            url: self.job.url.clone(),
            limiter: self.ctx.limiter.clone(),
            settings: self.ctx.fetch_settings(),
            ranged: self.job.supports_ranges,
            progress: tx,
        };
        let policy = self.ctx.config.retry.clone();

        let mut tasks = JoinSet::new();
        let mut retries: HashMap<usize, RetryState> = HashMap::new();
        let pending: Vec<usize> = self
            .job
            .segments
            .iter()
            .filter(|s| !s.is_complete())
            .map(|s| s.index)
            .collect();
        for index in pending {
            self.spawn_fetch(&mut tasks, &fetch_ctx, &round, index, Duration::ZERO);
        }

        let mut failure = None;
        let mut fallback = false;

        loop {
            tokio::select! {
                Some(progress) = rx.recv() => self.on_progress(progress),
                joined = tasks.join_next() => {
                    let Some(joined) = joined else { break };
                    // A fetcher sends all of its progress before it returns.
                    while let Ok(progress) = rx.try_recv() {
                        self.on_progress(progress);
                    }
                    let (index, result) = match joined {
                        Ok(output) => output,
                        Err(e) => {
                            failure.get_or_insert(FailureReason::Io { reason: e.to_string() });
                            round.interrupt();
                            continue;
                        }
                    };
                    match result {
                        Ok(outcome) => self.on_outcome(index, outcome),
                        Err(FetchError::RangeUnsupported(status)) if self.job.supports_ranges => {
                            debug!(download_id = %self.job.id, segment = index, %status, "range ignored");
                            self.set_segment_status(index, SegmentStatus::Failed);
                            fallback = true;
                            round.interrupt();
                        }
                        Err(e) if round.is_stopped() => {
                            debug!(download_id = %self.job.id, segment = index, error = %e, "fetch error while stopping");
                            self.set_segment_status(index, SegmentStatus::Paused);
                        }
                        Err(e) => {
                            let state = retries.entry(index).or_insert_with(|| RetryState {
                                attempts: self.segment(index).map_or(0, |s| s.retry_count),
                                ..RetryState::default()
                            });
                            let class = e.class();
                            let decision = state.record_failure(&policy, class);
                            let attempts = state.attempts;
                            if let Some(segment) = self.segment_mut(index) {
                                segment.retry_count = attempts;
                                segment.status = SegmentStatus::Failed;
                            }
                            match decision {
                                RetryDecision::RetryAfter(delay) => {
                                    warn!(
                                        download_id = %self.job.id,
                                        segment = index,
                                        attempt = attempts,
                                        max_attempts = policy.max_attempts,
                                        ?delay,
                                        error = %e,
                                        "segment failed, retrying"
                                    );
                                    self.ctx.events.emit(DownloadEvent::RetryScheduled {
                                        id: self.job.id,
                                        segment: Some(index),
                                        attempt: attempts,
                                        max_attempts: policy.max_attempts,
                                        delay,
                                    });
                                    self.spawn_fetch(&mut tasks, &fetch_ctx, &round, index, delay);
                                }
                                RetryDecision::GiveUp => {
                                    warn!(download_id = %self.job.id, segment = index, error = %e, "segment failed for good");
                                    let reason = if class == ErrorClass::Permanent {
                                        FailureReason::FetchFailed { reason: e.to_string(), retryable: false }
                                    } else {
                                        FailureReason::RetryBudgetExhausted {
                                            attempts,
                                            last_error: e.to_string(),
                                        }
                                    };
                                    failure.get_or_insert(reason);
                                    round.interrupt();
                                }
                            }
                            self.persist();
                            self.publish();
                        }
                    }
                }
            }
        }

        if self.stop.is_stopped() {
            Round::Stopped
        } else if let Some(reason) = failure {
            Round::Failed(reason)
        } else if fallback {
            Round::Fallback
        } else if self.job.all_segments_complete() {
            Round::Completed
        } else {
            Round::Stopped
        }
    }

    fn spawn_fetch(
        &mut self,
        tasks: &mut JoinSet<FetchResult>,
        fetch_ctx: &FetchContext,
        round: &StopSignal,
        index: usize,
        delay: Duration,
    ) {
        let path = self.job.segment_path(&self.ctx.config.scratch_dir, index);
        let Some(segment) = self.segment_mut(index) else { return };
        segment.status = SegmentStatus::Active;
        let segment = segment.clone();
        let ctx = fetch_ctx.clone();
        let stop = round.clone();

        tasks.spawn(async move {
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stop.stopped() => {
                        return (index, Ok(FetchOutcome::Stopped { bytes_downloaded: segment.bytes_downloaded }));
                    }
                }
            }
            let result = fetcher::fetch_segment(&ctx, &segment, &path, &stop).await;
            (index, result)
        });
    }

    fn on_progress(&mut self, progress: FetchProgress) {
        let Some(segment) = self.segment_mut(progress.index) else { return };
        if segment.status != SegmentStatus::Active {
            return;
        }
        segment.bytes_downloaded = progress.bytes_downloaded;

        let downloaded = self.job.downloaded_bytes();
        self.speed.record(Instant::now(), downloaded);
        let speed_bps = self.speed.speed();
        let remaining = self.job.total_size.map(|t| t.saturating_sub(downloaded));
        self.ctx.events.emit(DownloadEvent::Progress(ProgressUpdate {
            id: self.job.id,
            bytes_downloaded: downloaded,
            total_bytes: self.job.total_size,
            speed_bps,
            eta_seconds: speed::eta_seconds(remaining, speed_bps),
        }));
        self.publish();
        self.maybe_persist();
    }

    fn on_outcome(&mut self, index: usize, outcome: FetchOutcome) {
        let id = self.job.id;
        match outcome {
            FetchOutcome::Completed { bytes_downloaded } => {
                if let Some(segment) = self.segment_mut(index) {
                    segment.bytes_downloaded = bytes_downloaded;
                    segment.status = SegmentStatus::Completed;
                    if segment.end_byte.is_none() && bytes_downloaded > 0 {
                        segment.end_byte = Some(segment.start_byte + bytes_downloaded - 1);
                    }
                }
                if self.job.total_size.is_none() {
                    // An open-ended segment has now told us the size.
                    self.job.total_size = Some(self.job.downloaded_bytes());
                }
                debug!(download_id = %id, segment = index, bytes = bytes_downloaded, "segment complete");
            }
            FetchOutcome::Stopped { bytes_downloaded } => {
                if let Some(segment) = self.segment_mut(index) {
                    segment.bytes_downloaded = bytes_downloaded;
                    segment.status = SegmentStatus::Paused;
                }
            }
        }
        self.persist();
        self.publish();
    }

    async fn finish_stopped(mut self) -> DownloadJob {
        match self.stop.reason() {
            Some(StopReason::Cancel) => {
                assembler::remove_segments(&self.job.segment_paths(&self.ctx.config.scratch_dir)).await;
                for segment in &mut self.job.segments {
                    segment.bytes_downloaded = 0;
                    segment.status = SegmentStatus::Pending;
                }
                let _ = self.set_status(JobStatus::Cancelled, None);
                info!(download_id = %self.job.id, "download cancelled");
            }
            _ => {
                for segment in &mut self.job.segments {
                    if !segment.is_complete() {
                        segment.status = SegmentStatus::Paused;
                    }
                }
                let _ = self.set_status(JobStatus::Paused, None);
                info!(
                    download_id = %self.job.id,
                    downloaded = self.job.downloaded_bytes(),
                    "download paused"
                );
            }
        }
        self.job
    }

    /// Merges the finished segments and, if asked to, verifies the result.
    /// `Completed` is only reported once both steps succeed.
    ///
    /// With `may_refetch`, a segment file that disappeared is reset for
    /// another round of fetching rather than failing the download.
    async fn assemble(&mut self, may_refetch: bool) -> Assembly {
        let scratch = self.ctx.config.scratch_dir.clone();
        let files: Vec<(usize, PathBuf)> = self
            .job
            .segments
            .iter()
            .map(|s| (s.index, self.job.segment_path(&scratch, s.index)))
            .collect();

        let total = match assembler::merge_segments(&files, &self.job.destination, self.job.total_size).await {
            Ok(total) => total,
            Err(MergeError::MissingSegment { index, path }) if may_refetch => {
                warn!(download_id = %self.job.id, segment = index, path = %path.display(), "segment file missing at merge");
                self.reclaim_missing_segments().await;
                return Assembly::Refetch;
            }
            Err(e) => {
                warn!(download_id = %self.job.id, error = %e, "merge failed, segments kept");
                self.fail(merge_failure(e));
                return Assembly::Settled;
            }
        };
        self.job.total_size.get_or_insert(total);
        let paths: Vec<PathBuf> = files.into_iter().map(|(_, path)| path).collect();
        assembler::remove_segments(&paths).await;

        if let Some(spec) = self.job.checksum.clone() {
            match integrity::verify(&self.job.destination, &spec).await {
                Ok(Verification::Match(digest)) => {
                    debug!(download_id = %self.job.id, algorithm = %spec.algorithm, "checksum verified");
                    self.job.computed_checksum = Some(digest);
                }
                Ok(Verification::Mismatch { expected, actual }) => {
                    warn!(download_id = %self.job.id, %expected, %actual, "checksum mismatch");
                    self.job.computed_checksum = Some(actual.clone());
                    self.fail(FailureReason::ChecksumMismatch { expected, actual });
                    return Assembly::Settled;
                }
                Err(e) => {
                    self.fail(FailureReason::Io { reason: e.to_string() });
                    return Assembly::Settled;
                }
            }
        }

        if self.set_status(JobStatus::Completed, None).is_ok() {
            info!(
                download_id = %self.job.id,
                destination = %self.job.destination.display(),
                bytes = total,
                "download completed"
            );
        }
        Assembly::Settled
    }

    fn fail(&mut self, reason: FailureReason) {
        warn!(download_id = %self.job.id, %reason, "download failed");
        let _ = self.set_status(JobStatus::Failed, Some(reason));
    }

    /// Applies a status change, persists it and tells subscribers. Returns
    /// the previous status.
    fn set_status(&mut self, next: JobStatus, reason: Option<FailureReason>) -> Result<JobStatus, InvalidTransition> {
        let old = match self.job.transition(next) {
            Ok(old) => old,
            Err(e) => {
                warn!(download_id = %self.job.id, error = %e, "ignored status change");
                return Err(e);
            }
        };
        self.job.last_error = reason.clone();
        self.persist();
        self.publish();
        self.ctx.events.emit(DownloadEvent::StatusChanged {
            id: self.job.id,
            old,
            new: next,
            reason,
        });
        Ok(old)
    }

    fn progress_step(&self) -> u64 {
        let step = self.ctx.config.persist_step_percent.max(0.1);
        match self.job.progress() {
            Some(fraction) => (fraction * 100.0 / step).floor() as u64,
            None => 0,
        }
    }

    fn maybe_persist(&mut self) {
        match self.job.total_size {
            Some(total) if total > 0 => {
                let step = self.progress_step();
                if step > self.persisted_step {
                    self.persisted_step = step;
                    self.persist();
                }
            }
            _ => {
                let downloaded = self.job.downloaded_bytes();
                if downloaded >= self.persisted_bytes + UNSIZED_PERSIST_BYTES {
                    self.persisted_bytes = downloaded;
                    self.persist();
                }
            }
        }
    }

    fn persist(&self) {
        self.ctx.persister.save(&self.job);
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.job.clone());
    }

    fn segment(&self, index: usize) -> Option<&Segment> {
        self.job.segments.iter().find(|s| s.index == index)
    }

    fn segment_mut(&mut self, index: usize) -> Option<&mut Segment> {
        self.job.segments.iter_mut().find(|s| s.index == index)
    }

    fn set_segment_status(&mut self, index: usize, status: SegmentStatus) {
        if let Some(segment) = self.segment_mut(index) {
            segment.status = status;
        }
    }
}

fn merge_failure(e: MergeError) -> FailureReason {
    FailureReason::MergeError { reason: e.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DownloadOptions;
    use crate::state_manager::StateManager;
    use std::path::Path;

    const MIB: u64 = 1024 * 1024;

    fn job(total_size: Option<u64>, segments: Vec<Segment>, dir: &Path) -> DownloadJob {
        let mut job = DownloadJob::new(
            "http://127.0.0.1:9/file.bin".into(),
            dir.join("file.bin"),
            DownloadOptions::default(),
            segments.len().max(1),
        );
        job.total_size = total_size;
        job.supports_ranges = true;
        job.segments = segments;
        job
    }

    async fn orchestrator(job: DownloadJob, dir: &Path) -> (Orchestrator, StateManager, StopSignal) {
        let store = StateManager::in_memory().await.unwrap();
        let config = EngineConfig::default().with_scratch_dir(dir.join("scratch"));
        let ctx = EngineContext {
            client: config.http_client().unwrap(),
            limiter: SpeedLimiter::unlimited(),
            persister: Persister::spawn(store.clone()),
            events: EventBus::new(config.event_capacity),
            config: Arc::new(config),
        };
        let stop = StopSignal::new();
        let (snapshot, _) = watch::channel(job.clone());
        (Orchestrator::new(job, ctx, stop.clone(), snapshot), store, stop)
    }

    async fn stored_bytes(orchestrator: &Orchestrator, store: &StateManager) -> Option<u64> {
        orchestrator.ctx.persister.flush().await.unwrap();
        let jobs = store.load_all().await.unwrap();
        jobs.first().map(DownloadJob::downloaded_bytes)
    }

    fn progress(index: usize, bytes_downloaded: u64) -> FetchProgress {
        FetchProgress { index, bytes_downloaded }
    }

    fn completed(index: usize, start: u64, end: u64) -> Segment {
        let mut segment = Segment::new(index, start, Some(end));
        segment.bytes_downloaded = end + 1 - start;
        segment.status = SegmentStatus::Completed;
        segment
    }

    #[tokio::test]
    async fn sized_progress_is_checkpointed_every_step() {
        let dir = tempfile::tempdir().unwrap();
        let mut segment = Segment::new(0, 0, Some(999));
        segment.status = SegmentStatus::Active;
        let (mut orch, store, _) = orchestrator(job(Some(1000), vec![segment], dir.path()), dir.path()).await;

        orch.on_progress(progress(0, 49));
        assert_eq!(orch.persisted_step, 0);
        assert_eq!(stored_bytes(&orch, &store).await, None);

        orch.on_progress(progress(0, 60));
        assert_eq!(orch.persisted_step, 1);
        orch.on_progress(progress(0, 120));
        assert_eq!(orch.persisted_step, 2);
        assert_eq!(stored_bytes(&orch, &store).await, Some(120));

        // Still inside the 10-15% band.
        orch.on_progress(progress(0, 140));
        assert_eq!(stored_bytes(&orch, &store).await, Some(120));

        orch.on_progress(progress(0, 160));
        assert_eq!(orch.persisted_step, 3);
        assert_eq!(stored_bytes(&orch, &store).await, Some(160));
    }

    #[tokio::test]
    async fn unsized_progress_is_checkpointed_by_volume() {
        let dir = tempfile::tempdir().unwrap();
        let mut segment = Segment::new(0, 0, None);
        segment.status = SegmentStatus::Active;
        let (mut orch, store, _) = orchestrator(job(None, vec![segment], dir.path()), dir.path()).await;

        orch.on_progress(progress(0, 4 * MIB));
        assert_eq!(orch.persisted_bytes, 0);
        assert_eq!(stored_bytes(&orch, &store).await, None);

        orch.on_progress(progress(0, 5 * MIB));
        assert_eq!(orch.persisted_bytes, 5 * MIB);
        orch.on_progress(progress(0, 9 * MIB));
        assert_eq!(stored_bytes(&orch, &store).await, Some(5 * MIB));
    }

    #[tokio::test]
    async fn open_ended_segment_fixes_the_size_when_it_completes() {
        let dir = tempfile::tempdir().unwrap();
        let mut segment = Segment::new(0, 0, None);
        segment.status = SegmentStatus::Active;
        let (mut orch, _, _) = orchestrator(job(None, vec![segment], dir.path()), dir.path()).await;

        orch.on_outcome(0, FetchOutcome::Completed { bytes_downloaded: 300 });
        let segment = &orch.job.segments[0];
        assert_eq!(segment.status, SegmentStatus::Completed);
        assert_eq!(segment.end_byte, Some(299));
        assert_eq!(orch.job.total_size, Some(300));
        assert_eq!(orch.job.progress(), Some(1.0));
    }

    #[tokio::test]
    async fn empty_open_ended_segment_completes_with_zero_size() {
        let dir = tempfile::tempdir().unwrap();
        let (mut orch, _, _) = orchestrator(job(None, vec![Segment::new(0, 0, None)], dir.path()), dir.path()).await;

        orch.on_outcome(0, FetchOutcome::Completed { bytes_downloaded: 0 });
        assert_eq!(orch.job.segments[0].end_byte, None);
        assert!(orch.job.all_segments_complete());
        assert_eq!(orch.job.total_size, Some(0));
    }

    #[tokio::test]
    async fn stopped_segment_keeps_its_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut segment = Segment::new(0, 0, Some(99));
        segment.status = SegmentStatus::Active;
        let (mut orch, _, _) = orchestrator(job(Some(100), vec![segment], dir.path()), dir.path()).await;

        orch.on_outcome(0, FetchOutcome::Stopped { bytes_downloaded: 40 });
        assert_eq!(orch.job.segments[0].status, SegmentStatus::Paused);
        assert_eq!(orch.job.segments[0].bytes_downloaded, 40);
    }

    #[tokio::test]
    async fn illegal_status_changes_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (mut orch, _, _) = orchestrator(job(None, Vec::new(), dir.path()), dir.path()).await;

        assert_eq!(orch.set_status(JobStatus::Downloading, None).unwrap(), JobStatus::Queued);
        let err = orch.set_status(JobStatus::Queued, None).unwrap_err();
        assert_eq!(err.from, JobStatus::Downloading);
        assert_eq!(err.to, JobStatus::Queued);
        assert_eq!(orch.job.status, JobStatus::Downloading);
    }

    async fn finished_parts(dir: &Path) -> (DownloadJob, Vec<PathBuf>) {
        let job = job(Some(8), vec![completed(0, 0, 3), completed(1, 4, 7)], dir);
        let scratch = dir.join("scratch");
        tokio::fs::create_dir_all(&scratch).await.unwrap();
        let paths = job.segment_paths(&scratch);
        tokio::fs::write(&paths[0], b"abcd").await.unwrap();
        tokio::fs::write(&paths[1], b"efgh").await.unwrap();
        (job, paths)
    }

    #[tokio::test]
    async fn cancel_before_assembly_discards_the_segments() {
        let dir = tempfile::tempdir().unwrap();
        let (job, paths) = finished_parts(dir.path()).await;
        let destination = job.destination.clone();
        let (orch, _, stop) = orchestrator(job, dir.path()).await;

        stop.cancel();
        let job = orch.run().await;
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(!destination.exists());
        assert!(paths.iter().all(|p| !p.exists()));
        assert!(job.segments.iter().all(|s| s.bytes_downloaded == 0));
    }

    #[tokio::test]
    async fn pause_before_assembly_keeps_the_segments() {
        let dir = tempfile::tempdir().unwrap();
        let (job, paths) = finished_parts(dir.path()).await;
        let destination = job.destination.clone();
        let (orch, _, stop) = orchestrator(job, dir.path()).await;

        stop.pause();
        let job = orch.run().await;
        assert_eq!(job.status, JobStatus::Paused);
        assert!(!destination.exists());
        assert!(paths.iter().all(|p| p.exists()));
        assert!(job.all_segments_complete());
    }

    #[tokio::test]
    async fn finished_segments_are_merged_without_fetching() {
        let dir = tempfile::tempdir().unwrap();
        let (job, paths) = finished_parts(dir.path()).await;
        let destination = job.destination.clone();
        let (orch, _, _) = orchestrator(job, dir.path()).await;

        let job = orch.run().await;
        assert_eq!(job.status, JobStatus::Completed, "{:?}", job.last_error);
        assert_eq!(tokio::fs::read(&destination).await.unwrap(), b"abcdefgh");
        assert!(paths.iter().all(|p| !p.exists()));
    }

    #[tokio::test]
    async fn missing_segment_files_are_reset_before_fetching() {
        let dir = tempfile::tempdir().unwrap();
        let (job, paths) = finished_parts(dir.path()).await;
        tokio::fs::remove_file(&paths[1]).await.unwrap();
        let (mut orch, _, _) = orchestrator(job, dir.path()).await;

        orch.reclaim_missing_segments().await;
        assert!(orch.job.segments[0].is_complete());
        assert_eq!(orch.job.segments[1].status, SegmentStatus::Pending);
        assert_eq!(orch.job.segments[1].bytes_downloaded, 0);
        assert_eq!(orch.job.downloaded_bytes(), 4);
        assert_eq!(orch.persisted_step, orch.progress_step());
    }
}
