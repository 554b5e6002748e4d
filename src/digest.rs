//! Content digests for snapshot artifacts.
//!
//! `ChecksummingWriter` hashes bytes on their way into a sink; `verify_file`
//! re-reads an artifact and compares it with the digest recorded in the catalog.

use std::fmt;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use crate::errors::{AppError, Result};

const READ_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    Sha256,
}

impl DigestAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "sha256",
        }
    }

    pub fn hasher(self) -> ContentHasher {
        match self {
            DigestAlgorithm::Sha256 => ContentHasher {
                algorithm: self,
                state: Sha256::new(),
                bytes: 0,
            },
        }
    }
}

impl Default for DigestAlgorithm {
    fn default() -> Self {
        DigestAlgorithm::Sha256
    }
}

/// A digest together with the algorithm that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest {
    pub algorithm: DigestAlgorithm,
    pub hex: String,
}

impl ContentDigest {
    /// Placeholder for snapshots still being captured.
    pub fn pending(algorithm: DigestAlgorithm) -> Self {
        Self {
            algorithm,
            hex: String::new(),
        }
    }

    pub fn of_bytes(algorithm: DigestAlgorithm, bytes: &[u8]) -> Self {
        let mut hasher = algorithm.hasher();
        hasher.update(bytes);
        hasher.finish()
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.hex)
    }
}

/// Incremental hasher that also counts the bytes it has seen.
#[derive(Clone)]
pub struct ContentHasher {
    algorithm: DigestAlgorithm,
    state: Sha256,
    bytes: u64,
}

impl ContentHasher {
    pub fn update(&mut self, data: &[u8]) {
        self.state.update(data);
        self.bytes += data.len() as u64;
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn finish(self) -> ContentDigest {
        ContentDigest {
            algorithm: self.algorithm,
            hex: hex::encode(self.state.finalize()),
        }
    }
}

/// Forwards writes to `inner` unchanged while hashing everything that was accepted.
pub struct ChecksummingWriter<W> {
    inner: W,
    hasher: ContentHasher,
}

impl<W> ChecksummingWriter<W> {
    pub fn new(inner: W, algorithm: DigestAlgorithm) -> Self {
        Self {
            inner,
            hasher: algorithm.hasher(),
        }
    }

    /// Returns the sink, the digest of everything written and the byte count.
    pub fn finalize(self) -> (W, ContentDigest, u64) {
        let bytes = self.hasher.bytes();
        (self.inner, self.hasher.finish(), bytes)
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for ChecksummingWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(written)) => {
                // Only the bytes the sink accepted are hashed.
                this.hasher.update(&buf[..written]);
                Poll::Ready(Ok(written))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Hashes an async reader to the end.
pub async fn digest_reader<R: AsyncRead + Unpin>(
    reader: &mut R,
    algorithm: DigestAlgorithm,
) -> io::Result<(ContentDigest, u64)> {
    let mut hasher = algorithm.hasher();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    let bytes = hasher.bytes();
    Ok((hasher.finish(), bytes))
}

/// Streams a file through the hasher.
pub async fn digest_file(path: &Path, algorithm: DigestAlgorithm) -> Result<(ContentDigest, u64)> {
    let mut file = tokio::fs::File::open(path).await?;
    Ok(digest_reader(&mut file, algorithm).await?)
}

/// Re-reads `path` and fails with `IntegrityMismatch` unless it hashes to `expected`.
pub async fn verify_file(path: &Path, expected: &ContentDigest) -> Result<()> {
    let (actual, _) = digest_file(path, expected.algorithm).await?;
    if &actual != expected {
        return Err(AppError::IntegrityMismatch {
            path: path.to_path_buf(),
            expected: expected.clone(),
            actual,
        });
    }
    Ok(())
}
