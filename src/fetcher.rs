// src/fetcher.rs

use crate::limiter::SpeedLimiter;
use crate::models::Segment;
use crate::retry::ErrorClass;
use futures_util::StreamExt;
use reqwest::header::{HeaderName, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Custom errors for segment fetches.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("server ignored the range request (status {0})")]
    RangeUnsupported(StatusCode),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected http status {0}")]
    Status(StatusCode),
    #[error("no data received for {0:?}")]
    Timeout(Duration),
    #[error("connection closed after {received} of {expected} bytes")]
    Truncated { received: u64, expected: u64 },
}

impl FetchError {
    pub fn class(&self) -> ErrorClass {
        match self {
            FetchError::RangeUnsupported(_) | FetchError::Io(_) => ErrorClass::Permanent,
            FetchError::Status(status) => status_class(*status),
            FetchError::Network(e) => match e.status() {
                Some(status) => status_class(status),
                None if e.is_builder() => ErrorClass::Permanent,
                None => ErrorClass::Transient,
            },
            FetchError::Timeout(_) | FetchError::Truncated { .. } => ErrorClass::Transient,
        }
    }
}

fn status_class(status: StatusCode) -> ErrorClass {
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        ErrorClass::Transient
    } else {
        ErrorClass::Permanent
    }
}

const STOP_NONE: u8 = 0;
const STOP_PAUSE: u8 = 1;
const STOP_CANCEL: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Pause,
    Cancel,
}

/// Cooperative stop request shared between a download and its fetchers.
///
/// Fetchers check it at every chunk boundary. The recorded reason decides
/// whether temp data survives: a pause keeps it, a cancel discards it.
#[derive(Debug, Clone)]
pub struct StopSignal {
    token: CancellationToken,
    reason: Arc<AtomicU8>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Arc::new(AtomicU8::new(STOP_NONE)),
        }
    }

    /// A signal that stops with its parent but can also be stopped alone,
    /// without recording a reason.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            reason: self.reason.clone(),
        }
    }

    pub fn pause(&self) {
        let _ = self
            .reason
            .compare_exchange(STOP_NONE, STOP_PAUSE, Ordering::SeqCst, Ordering::SeqCst);
        self.token.cancel();
    }

    /// Overrides an earlier pause.
    pub fn cancel(&self) {
        self.reason.store(STOP_CANCEL, Ordering::SeqCst);
        self.token.cancel();
    }

    /// Stops this signal (and its children) without a reason.
    pub fn interrupt(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<StopReason> {
        match self.reason.load(Ordering::SeqCst) {
            STOP_PAUSE => Some(StopReason::Pause),
            STOP_CANCEL => Some(StopReason::Cancel),
            _ => None,
        }
    }

    pub async fn stopped(&self) {
        self.token.cancelled().await
    }
}

/// Cadence and timeouts for fetchers.
#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub read_timeout: Duration,
    pub progress_interval: Duration,
    pub progress_bytes: u64,
}

/// Cumulative flushed bytes of one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchProgress {
    pub index: usize,
    pub bytes_downloaded: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Completed { bytes_downloaded: u64 },
    Stopped { bytes_downloaded: u64 },
}

/// Everything a fetcher of one download shares with its siblings.
#[derive(Clone)]
pub struct FetchContext {
    pub client: Client,
    pub url: String,
    pub limiter: SpeedLimiter,
    pub settings: FetchSettings,
    /// Send `Range` headers. Off for the non-segmented fallback.
    pub ranged: bool,
    pub progress: mpsc::UnboundedSender<FetchProgress>,
}

impl FetchContext {
    fn report(&self, index: usize, bytes_downloaded: u64) {
        let _ = self.progress.send(FetchProgress { index, bytes_downloaded });
    }
}

/// Downloads one segment into `temp_path`, resuming from the bytes already
/// flushed there.
///
/// The temp file is first cut back to the segment's recorded cursor so a
/// tail written after the last persisted checkpoint is never trusted. In
/// non-ranged mode nothing can be resumed and the file starts empty.
pub async fn fetch_segment(
    ctx: &FetchContext,
    segment: &Segment,
    temp_path: &Path,
    stop: &StopSignal,
) -> Result<FetchOutcome, FetchError> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(temp_path)
        .await?;
    let on_disk = file.metadata().await?.len();
    let mut written = if ctx.ranged {
        segment.bytes_downloaded.min(on_disk)
    } else {
        0
    };
    file.set_len(written).await?;
    ctx.report(segment.index, written);

    let segment_len = segment.len();
    if segment_len.is_some_and(|len| written >= len) {
        return Ok(FetchOutcome::Completed { bytes_downloaded: written });
    }
    if stop.is_stopped() {
        drop(file);
        return stopped(stop, temp_path, written).await;
    }

    let mut request = ctx.client.get(&ctx.url);
    if ctx.ranged {
        let start = segment.start_byte + written;
        let range = match segment.end_byte {
            Some(end) => format!("bytes={start}-{end}"),
            None => format!("bytes={start}-"),
        };
        debug!(segment = segment.index, %range, "requesting segment");
        request = request.header(RANGE, range);
    }

    let response = tokio::select! {
        response = request.send() => response?,
        _ = stop.stopped() => {
            drop(file);
            return stopped(stop, temp_path, written).await;
        }
    };

    let status = response.status();
    if ctx.ranged {
        if status.is_success() && status != StatusCode::PARTIAL_CONTENT {
            return Err(FetchError::RangeUnsupported(status));
        }
        if status != StatusCode::PARTIAL_CONTENT {
            return Err(FetchError::Status(status));
        }
        // A 206 for some other offset would shift the segment's bytes.
        let start = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(content_range_start);
        let requested = segment.start_byte + written;
        if start != Some(requested) {
            debug!(segment = segment.index, requested, served = ?start, "partial content at the wrong offset");
            return Err(FetchError::RangeUnsupported(status));
        }
    } else if !status.is_success() {
        return Err(FetchError::Status(status));
    }

    let mut stream = response.bytes_stream();
    let mut reported = written;
    let mut last_report = Instant::now();
    let mut halted = false;

    loop {
        let next = tokio::select! {
            biased;
            _ = stop.stopped() => {
                halted = true;
                break;
            }
            next = tokio::time::timeout(ctx.settings.read_timeout, stream.next()) => next,
        };
        let mut chunk = match next {
            Err(_) => {
                file.flush().await?;
                ctx.report(segment.index, written);
                return Err(FetchError::Timeout(ctx.settings.read_timeout));
            }
            Ok(None) => break,
            Ok(Some(chunk)) => chunk?,
        };

        if let Some(len) = segment_len {
            let room = len - written;
            if chunk.len() as u64 > room {
                chunk.truncate(room as usize);
            }
        }
        if chunk.is_empty() {
            if segment_len.is_some_and(|len| written >= len) {
                break;
            }
            continue;
        }

        tokio::select! {
            biased;
            _ = stop.stopped() => {
                halted = true;
                break;
            }
            _ = ctx.limiter.acquire(chunk.len() as u64) => {}
        }

        file.write_all(&chunk).await?;
        written += chunk.len() as u64;

        if written - reported >= ctx.settings.progress_bytes
            || last_report.elapsed() >= ctx.settings.progress_interval
        {
            file.flush().await?;
            ctx.report(segment.index, written);
            reported = written;
            last_report = Instant::now();
        }

        if segment_len.is_some_and(|len| written >= len) {
            break;
        }
    }

    file.flush().await?;
    drop(file);
    ctx.report(segment.index, written);

    if halted {
        return stopped(stop, temp_path, written).await;
    }
    if let Some(len) = segment_len {
        if written < len {
            return Err(FetchError::Truncated { received: written, expected: len });
        }
    }
    Ok(FetchOutcome::Completed { bytes_downloaded: written })
}

async fn stopped(stop: &StopSignal, temp_path: &Path, written: u64) -> Result<FetchOutcome, FetchError> {
    if stop.reason() == Some(StopReason::Cancel) {
        remove_if_exists(temp_path).await?;
        return Ok(FetchOutcome::Stopped { bytes_downloaded: 0 });
    }
    Ok(FetchOutcome::Stopped { bytes_downloaded: written })
}

pub(crate) async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// What the probe learned about a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    pub total_size: Option<u64>,
    pub supports_ranges: bool,
}

/// Asks for the first byte of the resource. A `206` proves range support and
/// carries the full size in `Content-Range`; a plain `200` means the server
/// ignores ranges and only `Content-Length` can tell the size.
pub async fn probe(client: &Client, url: &str, timeout: Duration) -> Result<ProbeResult, FetchError> {
    let response = client
        .get(url)
        .header(RANGE, "bytes=0-0")
        .timeout(timeout)
        .send()
        .await?;
    let status = response.status();
    let header = |name: HeaderName| {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    let result = match status {
        StatusCode::PARTIAL_CONTENT => ProbeResult {
            total_size: header(CONTENT_RANGE).as_deref().and_then(content_range_total),
            supports_ranges: true,
        },
        StatusCode::RANGE_NOT_SATISFIABLE => ProbeResult {
            total_size: header(CONTENT_RANGE).as_deref().and_then(content_range_total),
            supports_ranges: false,
        },
        s if s.is_success() => ProbeResult {
            total_size: header(CONTENT_LENGTH).and_then(|v| v.trim().parse().ok()),
            supports_ranges: false,
        },
        s => return Err(FetchError::Status(s)),
    };
    // The body is never read; dropping the response closes the connection.
    Ok(result)
}

/// Extracts the complete length from `bytes 0-0/1234` or `bytes */1234`.
fn content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse().ok()
}

/// Extracts the first byte position from `bytes 100-199/1234`.
fn content_range_start(value: &str) -> Option<u64> {
    let range = value.trim().strip_prefix("bytes")?.trim_start();
    let (start, _) = range.split_once('-')?;
    start.trim().parse().ok()
}
