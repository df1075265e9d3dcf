use crate::cleanup::{remove_file_with_retry, RetryPolicy};
use std::{
    io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};
use thiserror::Error;
use tokio::{
    fs::File,
    io::{AsyncWriteExt, BufWriter},
};

const DIR_PREFIX: &str = "hazard-upload";
const DEFAULT_EXTENSION: &str = "mp4";

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Failed to create temporary artifact: {0}")]
    Create(io::Error),
    #[error("Failed to write upload chunk: {0}")]
    Write(io::Error),
    #[error("Artifact is already closed for writing")]
    Closed,
}

/// Creates one private directory + file per request.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    policy: RetryPolicy,
    chunk_bytes: usize,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>, policy: RetryPolicy, chunk_bytes: usize) -> Self {
        Self {
            root: root.into(),
            policy,
            chunk_bytes: chunk_bytes.max(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory names combine the process id, a nanosecond timestamp and a
    /// process-wide sequence number, and the directory is created exclusively.
    pub async fn acquire(&self, extension: Option<&str>) -> Result<TempArtifact, ArtifactError> {
        let extension = sanitize_extension(extension);
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(ArtifactError::Create)?;

        let dir = loop {
            let candidate = self.root.join(unique_name());
            match tokio::fs::create_dir(&candidate).await {
                Ok(()) => break candidate,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(ArtifactError::Create(e)),
            }
        };

        let path = dir.join(format!("upload.{}", extension));
        let file = match File::create(&path).await {
            Ok(file) => file,
            Err(e) => {
                let _ = tokio::fs::remove_dir(&dir).await;
                return Err(ArtifactError::Create(e));
            }
        };

        tracing::debug!("Acquired temporary artifact {:?}", path);

        Ok(TempArtifact {
            inner: Some(ArtifactPaths { dir, path }),
            created_at: SystemTime::now(),
            writer: Some(BufWriter::with_capacity(self.chunk_bytes, file)),
            policy: self.policy,
            bytes_written: 0,
        })
    }
}

fn unique_name() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}-{}-{}", DIR_PREFIX, std::process::id(), nanos, seq)
}

fn sanitize_extension(extension: Option<&str>) -> String {
    match extension {
        Some(ext) if is_plain_extension(ext) => ext.to_ascii_lowercase(),
        _ => DEFAULT_EXTENSION.to_string(),
    }
}

fn is_plain_extension(ext: &str) -> bool {
    !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric())
}

#[derive(Debug)]
struct ArtifactPaths {
    dir: PathBuf,
    path: PathBuf,
}

impl ArtifactPaths {
    fn release(self, policy: &RetryPolicy) -> bool {
        if !remove_file_with_retry(&self.path, policy) {
            tracing::warn!(
                "Temporary artifact {:?} could not be deleted; leaving {:?} in place",
                self.path,
                self.dir
            );
            return false;
        }
        match std::fs::remove_dir(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove directory {:?}: {}", self.dir, e),
        }
        tracing::debug!("Released temporary artifact {:?}", self.path);
        true
    }
}

/// An uploaded file owned by exactly one request.
///
/// Dropping an unreleased artifact schedules its deletion on the blocking
/// pool (or performs it inline outside a runtime).
#[derive(Debug)]
pub struct TempArtifact {
    inner: Option<ArtifactPaths>,
    created_at: SystemTime,
    writer: Option<BufWriter<File>>,
    policy: RetryPolicy,
    bytes_written: u64,
}

impl TempArtifact {
    pub fn path(&self) -> &Path {
        match &self.inner {
            Some(paths) => &paths.path,
            None => Path::new(""),
        }
    }

    pub fn dir(&self) -> &Path {
        match &self.inner {
            Some(paths) => &paths.dir,
            None => Path::new(""),
        }
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), ArtifactError> {
        let writer = self.writer.as_mut().ok_or(ArtifactError::Closed)?;
        writer.write_all(chunk).await.map_err(ArtifactError::Write)?;
        self.bytes_written += chunk.len() as u64;
        Ok(())
    }

    /// Flushes and closes the file so it can be opened for decoding.
    pub async fn finish(&mut self) -> Result<(), ArtifactError> {
        let mut writer = self.writer.take().ok_or(ArtifactError::Closed)?;
        writer.flush().await.map_err(ArtifactError::Write)?;
        let mut file = writer.into_inner();
        file.sync_all().await.map_err(ArtifactError::Write)?;
        drop(file);
        Ok(())
    }

    /// Deletes the file, then its directory. Blocks while retrying.
    pub fn release(mut self) -> bool {
        self.release_now()
    }

    fn release_now(&mut self) -> bool {
        drop(self.writer.take());
        match self.inner.take() {
            Some(paths) => paths.release(&self.policy),
            None => true,
        }
    }
}

impl Drop for TempArtifact {
    fn drop(&mut self) {
        let Some(paths) = self.inner.take() else {
            return;
        };
        drop(self.writer.take());
        let policy = self.policy;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || paths.release(&policy));
            }
            Err(_) => {
                paths.release(&policy);
            }
        }
    }
}
