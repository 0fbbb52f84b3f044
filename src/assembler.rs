// src/assembler.rs

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("segment {index} is missing at {}", path.display())]
    MissingSegment { index: usize, path: PathBuf },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("merged {actual} bytes, expected {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
}

/// Where the merge is staged before it is renamed over `destination`.
pub fn staging_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".odm-merge");
    destination.with_file_name(name)
}

/// Concatenates segment files into `destination`, strictly by index.
///
/// The output is staged next to the destination and only renamed into place
/// once its length checks out, so a failed merge never leaves a truncated
/// destination behind. Segment files are left untouched.
pub async fn merge_segments(
    segments: &[(usize, PathBuf)],
    destination: &Path,
    expected_size: Option<u64>,
) -> Result<u64, MergeError> {
    let mut ordered: Vec<&(usize, PathBuf)> = segments.iter().collect();
    ordered.sort_by_key(|(index, _)| *index);

    if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }

    let staging = staging_path(destination);
    let result = write_staging(&ordered, &staging).await;
    let total = match result {
        Ok(total) => total,
        Err(e) => {
            let _ = fs::remove_file(&staging).await;
            return Err(e);
        }
    };

    if let Some(expected) = expected_size {
        if total != expected {
            let _ = fs::remove_file(&staging).await;
            return Err(MergeError::SizeMismatch { expected, actual: total });
        }
    }

    fs::rename(&staging, destination).await?;
    debug!(destination = %destination.display(), bytes = total, "segments merged");
    Ok(total)
}

async fn write_staging(ordered: &[&(usize, PathBuf)], staging: &Path) -> Result<u64, MergeError> {
    let mut out = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(staging)
        .await?;

    let mut total = 0;
    for (index, path) in ordered {
        let mut input = match File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(MergeError::MissingSegment {
                    index: *index,
                    path: path.clone(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        total += tokio::io::copy(&mut input, &mut out).await?;
    }
    out.flush().await?;
    out.sync_all().await?;
    Ok(total)
}

/// Deletes segment temp files. Failures are logged, not returned: the merged
/// file is already in place by the time this runs.
pub async fn remove_segments(paths: &[PathBuf]) {
    for path in paths {
        match fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "could not delete segment file"),
        }
    }
}
