// src/integrity.rs

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported checksum algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("malformed checksum: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Md5,
    Sha1,
    Sha256,
}

impl ChecksumAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            ChecksumAlgorithm::Md5 => "md5",
            ChecksumAlgorithm::Sha1 => "sha1",
            ChecksumAlgorithm::Sha256 => "sha256",
        }
    }

    /// Length of the hex-encoded digest.
    pub fn hex_len(self) -> usize {
        match self {
            ChecksumAlgorithm::Md5 => 32,
            ChecksumAlgorithm::Sha1 => 40,
            ChecksumAlgorithm::Sha256 => 64,
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = IntegrityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "").as_str() {
            "md5" => Ok(ChecksumAlgorithm::Md5),
            "sha1" => Ok(ChecksumAlgorithm::Sha1),
            "sha256" => Ok(ChecksumAlgorithm::Sha256),
            other => Err(IntegrityError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// An expected digest supplied with a download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumSpec {
    pub algorithm: ChecksumAlgorithm,
    /// Lower-case hex.
    pub expected: String,
}

impl ChecksumSpec {
    pub fn new(algorithm: ChecksumAlgorithm, expected: &str) -> Result<Self, IntegrityError> {
        let expected = expected.trim().to_ascii_lowercase();
        if expected.len() != algorithm.hex_len() || hex::decode(&expected).is_err() {
            return Err(IntegrityError::Malformed(format!(
                "{expected:?} is not a {algorithm} digest"
            )));
        }
        Ok(Self { algorithm, expected })
    }
}

impl FromStr for ChecksumSpec {
    type Err = IntegrityError;

    /// Accepts `algo:hex`, or a bare hex digest whose length identifies the
    /// algorithm.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((algo, digest)) = s.split_once(':') {
            return ChecksumSpec::new(algo.parse()?, digest);
        }
        let digest = s.trim();
        let algorithm = match digest.len() {
            32 => ChecksumAlgorithm::Md5,
            40 => ChecksumAlgorithm::Sha1,
            64 => ChecksumAlgorithm::Sha256,
            _ => return Err(IntegrityError::Malformed(digest.to_string())),
        };
        ChecksumSpec::new(algorithm, digest)
    }
}

/// Outcome of comparing a file against a [`ChecksumSpec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Match(String),
    Mismatch { expected: String, actual: String },
}

async fn hash_file<D: Digest>(path: &Path) -> Result<String, IntegrityError> {
    let file = File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut hasher = D::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Compute the hex digest of a file asynchronously.
pub async fn file_digest(path: &Path, algorithm: ChecksumAlgorithm) -> Result<String, IntegrityError> {
    match algorithm {
        ChecksumAlgorithm::Md5 => hash_file::<Md5>(path).await,
        ChecksumAlgorithm::Sha1 => hash_file::<Sha1>(path).await,
        ChecksumAlgorithm::Sha256 => hash_file::<Sha256>(path).await,
    }
}

pub async fn verify(path: &Path, spec: &ChecksumSpec) -> Result<Verification, IntegrityError> {
    let actual = file_digest(path, spec.algorithm).await?;
    if actual == spec.expected {
        Ok(Verification::Match(actual))
    } else {
        Ok(Verification::Mismatch {
            expected: spec.expected.clone(),
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn file_with(content: &[u8]) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        tokio::fs::write(file.path(), content).await.unwrap();
        file
    }

    #[tokio::test]
    async fn digests_known_vectors() {
        let file = file_with(b"abc").await;
        assert_eq!(
            file_digest(file.path(), ChecksumAlgorithm::Md5).await.unwrap(),
            "900150983cd24fb0d6963f7d28e17f72"
        );
        assert_eq!(
            file_digest(file.path(), ChecksumAlgorithm::Sha1).await.unwrap(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(
            file_digest(file.path(), ChecksumAlgorithm::Sha256).await.unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn verify_is_case_insensitive_and_reports_mismatch() {
        let file = file_with(b"abc").await;
        let spec: ChecksumSpec = "SHA256:BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD"
            .parse()
            .unwrap();
        assert!(matches!(verify(file.path(), &spec).await.unwrap(), Verification::Match(_)));

        let wrong = ChecksumSpec::new(ChecksumAlgorithm::Md5, &"0".repeat(32)).unwrap();
        match verify(file.path(), &wrong).await.unwrap() {
            Verification::Mismatch { expected, actual } => {
                assert_eq!(expected, "0".repeat(32));
                assert_eq!(actual, "900150983cd24fb0d6963f7d28e17f72");
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[test]
    fn parses_bare_digests_by_length() {
        let spec: ChecksumSpec = "a9993e364706816aba3e25717850c26c9cd0d89d".parse().unwrap();
        assert_eq!(spec.algorithm, ChecksumAlgorithm::Sha1);
        assert!("abc".parse::<ChecksumSpec>().is_err());
        assert!("crc32:deadbeef".parse::<ChecksumSpec>().is_err());
        assert!("md5:zz".parse::<ChecksumSpec>().is_err());
    }
}
