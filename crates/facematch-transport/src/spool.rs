//! Directory-backed message queue.
//!
//! Each message is one JSON file. Publishing writes a hidden temp file and
//! renames it into place, so consumers never see a partial message. File
//! names start with a zero-padded timestamp and sequence number, which makes
//! lexical order the publish order.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

const MESSAGE_EXT: &str = "json";

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("queue I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("message serialization failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl TransportError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// One message read from a queue. It stays queued until acknowledged.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: String,
    pub body: Vec<u8>,
    path: PathBuf,
}

/// A queue rooted at a directory.
#[derive(Debug)]
pub struct SpoolQueue {
    dir: PathBuf,
    sequence: AtomicU64,
}

impl SpoolQueue {
    /// Open (creating if needed) the queue directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, TransportError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| TransportError::io(&dir, e))?;
        Ok(Self {
            dir,
            sequence: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Publish a message, returning its id.
    pub fn send<T: Serialize>(&self, message: &T) -> Result<String, TransportError> {
        let body = serde_json::to_vec(message)?;

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let id = format!("{nanos:020}-{seq:010}-{}", uuid::Uuid::new_v4().simple());

        let tmp = self.dir.join(format!(".{id}.tmp"));
        let dst = self.dir.join(format!("{id}.{MESSAGE_EXT}"));
        write_atomic(&tmp, &dst, &body)?;

        tracing::trace!(queue = %self.dir.display(), %id, bytes = body.len(), "message sent");
        Ok(id)
    }

    /// Read up to `max` pending messages, oldest first.
    ///
    /// Messages removed by another consumer between listing and reading
    /// are skipped.
    pub fn receive(&self, max: usize) -> Result<Vec<Delivery>, TransportError> {
        let mut ids = self.pending_ids()?;
        ids.truncate(max);

        let mut deliveries = Vec::with_capacity(ids.len());
        for id in ids {
            let path = self.dir.join(format!("{id}.{MESSAGE_EXT}"));
            match std::fs::read(&path) {
                Ok(body) => deliveries.push(Delivery { id, body, path }),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(TransportError::io(&path, e)),
            }
        }
        Ok(deliveries)
    }

    /// Remove a delivered message. Acknowledging twice is not an error.
    pub fn ack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        match std::fs::remove_file(&delivery.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TransportError::io(&delivery.path, e)),
        }
    }

    /// Number of messages waiting.
    pub fn len(&self) -> Result<usize, TransportError> {
        Ok(self.pending_ids()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, TransportError> {
        Ok(self.len()? == 0)
    }

    fn pending_ids(&self) -> Result<Vec<String>, TransportError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| TransportError::io(&self.dir, e))?;

        let mut ids: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                if name.starts_with('.') {
                    return None;
                }
                name.strip_suffix(&format!(".{MESSAGE_EXT}"))
                    .map(str::to_string)
            })
            .collect();
        ids.sort();
        Ok(ids)
    }
}

/// Write `body` to `tmp`, then rename it to `dst`. `tmp` never outlives a failure.
fn write_atomic(tmp: &Path, dst: &Path, body: &[u8]) -> Result<(), TransportError> {
    if let Err(e) = std::fs::write(tmp, body) {
        let _ = std::fs::remove_file(tmp);
        return Err(TransportError::io(tmp, e));
    }
    if let Err(e) = std::fs::rename(tmp, dst) {
        let _ = std::fs::remove_file(tmp);
        return Err(TransportError::io(dst, e));
    }
    Ok(())
}
