// src/models.rs

use crate::category::Category;
use crate::integrity::ChecksumSpec;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

pub type DownloadId = Uuid;

/// Higher values are admitted first.
pub type Priority = i32;

/// Version written into every persisted record.
pub const SCHEMA_VERSION: u32 = 2;

/// Represents the persistent state of a single download segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Merge position, 0-based.
    pub index: usize,
    pub start_byte: u64,
    /// Inclusive end. `None` when the resource size is unknown and the
    /// segment simply runs until the server closes the body.
    pub end_byte: Option<u64>,
    /// Bytes flushed to this segment's temp file.
    pub bytes_downloaded: u64,
    pub status: SegmentStatus,
    #[serde(default)]
    pub retry_count: u32,
}

impl Segment {
    pub fn new(index: usize, start_byte: u64, end_byte: Option<u64>) -> Self {
        Self {
            index,
            start_byte,
            end_byte,
            bytes_downloaded: 0,
            status: SegmentStatus::Pending,
            retry_count: 0,
        }
    }

    /// Number of bytes the segment spans, if known.
    pub fn len(&self) -> Option<u64> {
        self.end_byte.map(|end| end + 1 - self.start_byte)
    }

    /// Returns the number of bytes remaining to be downloaded for this segment.
    pub fn remaining_bytes(&self) -> Option<u64> {
        self.len().map(|len| len.saturating_sub(self.bytes_downloaded))
    }

    /// Absolute offset the next request has to start from.
    pub fn resume_offset(&self) -> u64 {
        self.start_byte + self.bytes_downloaded
    }

    pub fn is_complete(&self) -> bool {
        self.status == SegmentStatus::Completed
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SegmentStatus {
    Pending,
    Active,
    Paused,
    Completed,
    Failed,
}

/// The status of a download job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_active(self) -> bool {
        self == JobStatus::Downloading
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
    }

    /// The download lifecycle. Anything not listed here is rejected.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Downloading)
                | (Queued, Paused)
                | (Queued, Cancelled)
                | (Downloading, Paused)
                | (Downloading, Completed)
                | (Downloading, Failed)
                | (Downloading, Cancelled)
                | (Paused, Downloading)
                | (Paused, Queued)
                | (Paused, Cancelled)
                | (Failed, Queued)
                | (Failed, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Downloading => "downloading",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a download ended up in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    #[error("server does not honour range requests")]
    RangeUnsupported,
    #[error("fetch failed: {reason}")]
    FetchFailed { reason: String, retryable: bool },
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("merge failed: {reason}")]
    MergeError { reason: String },
    #[error("retry budget exhausted after {attempts} attempts: {last_error}")]
    RetryBudgetExhausted { attempts: u32, last_error: String },
    #[error("local i/o error: {reason}")]
    Io { reason: String },
}

impl FailureReason {
    /// Failures the engine may re-queue on its own when auto-retry is on:
    /// transient probe errors and segments that ran out of attempts.
    pub fn is_auto_retryable(&self) -> bool {
        matches!(
            self,
            FailureReason::FetchFailed { retryable: true, .. } | FailureReason::RetryBudgetExhausted { .. }
        )
    }
}

#[derive(Debug, Error)]
#[error("cannot move download from {from} to {to}")]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Caller-supplied settings for a new download.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadOptions {
    /// Requested segment count; the engine default applies when `None`.
    pub segments: Option<usize>,
    pub priority: Priority,
    /// Detected from the destination's extension when `None`.
    pub category: Option<Category>,
    pub checksum: Option<ChecksumSpec>,
    /// Submit to the queue right away instead of waiting for `start`.
    pub autostart: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            segments: None,
            priority: 0,
            category: None,
            checksum: None,
            autostart: true,
        }
    }
}

/// Represents the complete, persistent state of a single download job.
/// This struct is what the state manager serializes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadJob {
    pub id: DownloadId,
    #[serde(default)]
    pub schema_version: u32,
    pub url: String,
    pub destination: PathBuf,
    /// Unknown until the resource has been probed.
    pub total_size: Option<u64>,
    /// Whether the server honours byte ranges. Decided by the probe and
    /// cleared if a fetch later discovers otherwise.
    #[serde(default)]
    pub supports_ranges: bool,
    #[serde(default)]
    pub category: Category,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub checksum: Option<ChecksumSpec>,
    /// Digest computed after a verified merge.
    #[serde(default)]
    pub computed_checksum: Option<String>,
    pub num_segments: usize,
    /// The state of each individual segment, in merge order.
    #[serde(default)]
    pub segments: Vec<Segment>,
    pub status: JobStatus,
    #[serde(default)]
    pub last_error: Option<FailureReason>,
    /// Download-level retries taken so far.
    #[serde(default)]
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl DownloadJob {
    pub fn new(url: String, destination: PathBuf, options: DownloadOptions, default_segments: usize) -> Self {
        let now = Utc::now();
        let category = options
            .category
            .unwrap_or_else(|| Category::detect(&destination));
        Self {
            id: Uuid::new_v4(),
            schema_version: SCHEMA_VERSION,
            url,
            destination,
            total_size: None,
            supports_ranges: false,
            category,
            priority: options.priority,
            checksum: options.checksum,
            computed_checksum: None,
            num_segments: options.segments.unwrap_or(default_segments).max(1),
            segments: Vec::new(),
            status: JobStatus::Queued,
            last_error: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Sum of every segment's flushed bytes.
    pub fn downloaded_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.bytes_downloaded).sum()
    }

    /// Calculates download progress as a fraction from 0.0 to 1.0.
    /// `None` while the size is unknown.
    pub fn progress(&self) -> Option<f64> {
        match self.total_size {
            Some(0) => Some(if self.status == JobStatus::Completed { 1.0 } else { 0.0 }),
            Some(total) => Some(self.downloaded_bytes() as f64 / total as f64),
            None => None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn all_segments_complete(&self) -> bool {
        !self.segments.is_empty() && self.segments.iter().all(Segment::is_complete)
    }

    /// Applies a lifecycle move, returning the previous status.
    pub fn transition(&mut self, next: JobStatus) -> Result<JobStatus, InvalidTransition> {
        let from = self.status;
        if !from.can_transition_to(next) {
            return Err(InvalidTransition { from, to: next });
        }
        self.status = next;
        self.updated_at = Utc::now();
        if next != JobStatus::Failed {
            self.last_error = None;
        }
        if next == JobStatus::Completed {
            self.completed_at = Some(self.updated_at);
        }
        Ok(from)
    }

    /// Returns the temp file for one segment, e.g.
    /// `<scratch>/<id>.seg3.odm-part`.
    pub fn segment_path(&self, scratch_dir: &Path, index: usize) -> PathBuf {
        scratch_dir.join(format!("{}.seg{}.odm-part", self.id, index))
    }

    pub fn segment_paths(&self, scratch_dir: &Path) -> Vec<PathBuf> {
        self.segments
            .iter()
            .map(|s| self.segment_path(scratch_dir, s.index))
            .collect()
    }

    pub fn reset_segment_retries(&mut self) {
        for segment in &mut self.segments {
            segment.retry_count = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> DownloadJob {
        DownloadJob::new(
            "https://example.com/file.zip".into(),
            PathBuf::from("/tmp/file.zip"),
            DownloadOptions::default(),
            4,
        )
    }

    #[test]
    fn new_job_starts_queued_with_detected_category() {
        let job = job();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.category, Category::Archives);
        assert_eq!(job.num_segments, 4);
        assert_eq!(job.schema_version, SCHEMA_VERSION);
        assert!(job.progress().is_none());
    }

    #[test]
    fn downloaded_bytes_is_sum_of_segments() {
        let mut job = job();
        job.total_size = Some(100);
        job.segments = vec![Segment::new(0, 0, Some(49)), Segment::new(1, 50, Some(99))];
        job.segments[0].bytes_downloaded = 20;
        job.segments[1].bytes_downloaded = 30;
        assert_eq!(job.downloaded_bytes(), 50);
        assert_eq!(job.progress(), Some(0.5));
        assert_eq!(job.segments[1].resume_offset(), 80);
        assert_eq!(job.segments[1].remaining_bytes(), Some(20));
    }

    #[test]
    fn lifecycle_rejects_illegal_moves() {
        let mut job = job();
        assert!(job.transition(JobStatus::Completed).is_err());
        assert_eq!(job.transition(JobStatus::Downloading).unwrap(), JobStatus::Queued);
        assert_eq!(job.transition(JobStatus::Completed).unwrap(), JobStatus::Downloading);
        assert!(job.completed_at.is_some());
        for next in [JobStatus::Queued, JobStatus::Downloading, JobStatus::Cancelled] {
            assert!(job.transition(next).is_err());
        }
    }

    #[test]
    fn terminal_and_active_flags() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Failed.is_terminal());
        assert!(JobStatus::Downloading.is_active());
        assert!(!JobStatus::Paused.is_active());
    }

    #[test]
    fn transient_failures_are_auto_retryable() {
        let exhausted = FailureReason::RetryBudgetExhausted {
            attempts: 5,
            last_error: "503".into(),
        };
        assert!(exhausted.is_auto_retryable());
        assert!(FailureReason::FetchFailed { reason: "reset".into(), retryable: true }.is_auto_retryable());
        assert!(!FailureReason::FetchFailed { reason: "404".into(), retryable: false }.is_auto_retryable());
        assert!(!FailureReason::ChecksumMismatch { expected: "a".into(), actual: "b".into() }.is_auto_retryable());
        assert!(!FailureReason::MergeError { reason: "disk".into() }.is_auto_retryable());
        assert!(!FailureReason::Io { reason: "disk".into() }.is_auto_retryable());
    }

    #[test]
    fn segment_paths_are_deterministic() {
        let job = job();
        let scratch = Path::new("/scratch");
        assert_eq!(
            job.segment_path(scratch, 3),
            scratch.join(format!("{}.seg3.odm-part", job.id))
        );
    }

    #[test]
    fn old_records_deserialize_with_defaults() {
        let id = Uuid::new_v4();
        let json = format!(
            r#"{{"id":"{id}","url":"http://x/y","destination":"/tmp/y","total_size":10,
                "num_segments":1,"status":"paused","created_at":"2024-01-01T00:00:00Z"}}"#
        );
        let job: DownloadJob = serde_json::from_str(&json).unwrap();
        assert_eq!(job.schema_version, 0);
        assert!(job.segments.is_empty());
        assert_eq!(job.priority, 0);
        assert_eq!(job.status, JobStatus::Paused);
    }
}
