//! Filesystem payload store.
//!
//! Payloads are staged in a hidden temporary file and renamed into place,
//! so a key either names a complete payload or nothing at all.

use super::constants::BUFFER_SIZE;
use super::utils::{create_secure_file, is_safe_payload_key};
use crate::error::BrokerError;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

const PART_SUFFIX: &str = ".part";

/// Size and hash of a payload after it has been persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPayload {
    pub size: u64,
    pub hash: String,
}

pub struct PayloadStore {
    dir: PathBuf,
}

impl PayloadStore {
    /// Open the store rooted at `dir`, creating it if needed and sweeping
    /// temporary files left behind by an interrupted write.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, BrokerError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;

        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') && name.ends_with(PART_SUFFIX) {
                tracing::warn!("Removing interrupted upload {:?}", entry.path());
                let _ = fs::remove_file(entry.path()).await;
            }
        }

        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, BrokerError> {
        if !is_safe_payload_key(key) {
            return Err(BrokerError::PayloadNotFound(key.to_string()));
        }
        Ok(self.dir.join(key))
    }

    /// Stream a payload into a hidden staging file.
    ///
    /// Fails with `PayloadTooLarge` as soon as more than `limit` bytes have
    /// arrived. The staging file is deleted on failure, and when the returned
    /// handle is dropped without being committed.
    pub async fn stage<S, E>(&self, mut chunks: S, limit: u64) -> Result<StagedPayload, BrokerError>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: Into<std::io::Error>,
    {
        let part_path = self
            .dir
            .join(format!(".{}{}", Uuid::new_v4().simple(), PART_SUFFIX));
        // Armed before the first write so every early return cleans up
        let guard = RemoveOnDrop::new(part_path.clone());

        let mut file = create_secure_file(&part_path).await?;
        let mut hasher = blake3::Hasher::new();
        let mut size: u64 = 0;

        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(Into::into)?;
            size += chunk.len() as u64;
            if size > limit {
                return Err(BrokerError::PayloadTooLarge { size, limit });
            }
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }

        file.flush().await?;
        file.sync_all().await?;

        Ok(StagedPayload {
            guard,
            meta: StoredPayload {
                size,
                hash: hasher.finalize().to_hex().to_string(),
            },
        })
    }

    /// Move a staged payload into place under `key`
    pub async fn commit(&self, staged: StagedPayload, key: &str) -> Result<StoredPayload, BrokerError> {
        let final_path = self.path_for(key)?;
        fs::rename(&staged.guard.path, &final_path).await?;
        let StagedPayload { guard, meta } = staged;
        guard.disarm();
        Ok(meta)
    }

    /// Open a payload for streaming
    pub async fn open_payload(&self, key: &str) -> Result<File, BrokerError> {
        let path = self.path_for(key)?;
        match File::open(&path).await {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(BrokerError::PayloadNotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn contains(&self, key: &str) -> bool {
        match self.path_for(key) {
            Ok(path) => fs::try_exists(path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Delete a payload; a missing payload is not an error
    pub async fn remove(&self, key: &str) -> Result<(), BrokerError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!("Removed payload {}", key);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Guard that deletes the payload once a stream finishes with it
    pub(crate) fn removal_guard(&self, key: &str) -> Option<RemoveOnDrop> {
        self.path_for(key).ok().map(RemoveOnDrop::new)
    }
}

/// A fully received payload that has not been assigned a key yet
pub struct StagedPayload {
    guard: RemoveOnDrop,
    meta: StoredPayload,
}

impl StagedPayload {
    pub fn size(&self) -> u64 {
        self.meta.size
    }

    pub fn hash(&self) -> &str {
        &self.meta.hash
    }
}

/// Deletes a file when dropped, unless disarmed
pub struct RemoveOnDrop {
    path: PathBuf,
    armed: bool,
}

impl RemoveOnDrop {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!("Released payload {:?}", self.path),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to release payload {:?}: {}", self.path, e),
        }
    }
}

/// Byte stream of a fetched payload.
///
/// If the fetch released the payload, the file is deleted once the stream
/// is dropped.
pub struct PayloadStream {
    // Declared before `release` so the file handle closes first
    inner: ReaderStream<File>,
    release: Option<RemoveOnDrop>,
    size: u64,
}

impl PayloadStream {
    pub(crate) async fn new(file: File, release: Option<RemoveOnDrop>) -> Result<Self, BrokerError> {
        let size = file.metadata().await?.len();
        Ok(Self {
            inner: ReaderStream::with_capacity(file, BUFFER_SIZE),
            release,
            size,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn release_on_drop(&mut self, guard: Option<RemoveOnDrop>) {
        self.release = guard;
    }

    /// Whether the payload file is deleted when this stream is dropped
    pub fn releases_payload(&self) -> bool {
        self.release.is_some()
    }

    /// Read the whole payload into memory
    pub async fn collect_bytes(mut self) -> Result<Vec<u8>, BrokerError> {
        let mut out = Vec::with_capacity(self.size as usize);
        while let Some(chunk) = self.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }
}

impl Stream for PayloadStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}
