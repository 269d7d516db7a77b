//! Document persistence adapters
//!
//! The registry talks to storage through `PersistenceAdapter`: `bind` runs
//! once when a document is created (load prior state, merge it in, subscribe
//! so future changes are flushed), `flush` runs when a room empties.
//! `NoPersistence` is the explicit no-op strategy, so registry control flow
//! never special-cases "persistence absent" beyond a null check.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use log::warn;

use crate::doc::{Document, Origin};
use crate::error::SyncError;

#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    /// Load prior state for a room, merge it into the fresh document, and
    /// subscribe to future changes.
    async fn bind(&self, room: &str, doc: &Arc<Document>) -> Result<(), SyncError>;

    /// Best-effort durable write of the document's current state. May be a
    /// no-op strategy.
    async fn flush(&self, room: &str, doc: &Document) -> Result<(), SyncError>;
}

/// The no-op strategy.
pub struct NoPersistence;

#[async_trait]
impl PersistenceAdapter for NoPersistence {
    async fn bind(&self, _room: &str, _doc: &Arc<Document>) -> Result<(), SyncError> {
        Ok(())
    }

    async fn flush(&self, _room: &str, _doc: &Document) -> Result<(), SyncError> {
        Ok(())
    }
}

/// Snapshot-per-room file persistence under a base directory.
///
/// Writes for a given room are serialized through a per-room lock so
/// concurrent document changes never produce interleaved or partial files.
pub struct FilePersistence {
    base_dir: PathBuf,
    write_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl FilePersistence {
    /// Create the adapter, creating the base directory if needed.
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Result<Self, SyncError> {
        let path = PathBuf::from(base_dir.as_ref());
        if !path.exists() {
            std::fs::create_dir_all(&path).map_err(|e| {
                SyncError::Persistence(format!("Failed to create directory: {}", e))
            })?;
        }
        Ok(Self {
            base_dir: path,
            write_locks: Mutex::new(HashMap::new()),
        })
    }

    /// File path for a room, with unsafe characters replaced.
    pub fn room_path(&self, room: &str) -> PathBuf {
        let safe: String = room
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.base_dir.join(format!("{}.bin", safe))
    }

    fn write_lock(&self, room: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.write_locks
            .lock()
            .unwrap()
            .entry(room.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl PersistenceAdapter for FilePersistence {
    async fn bind(&self, room: &str, doc: &Arc<Document>) -> Result<(), SyncError> {
        let path = self.room_path(room);

        if path.exists() {
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|e| SyncError::Persistence(format!("Failed to read {:?}: {}", path, e)))?;
            doc.apply_update(&bytes, Origin::Local)
                .map_err(|e| SyncError::Persistence(format!("Stored state rejected: {}", e)))?;
        }

        // Flush asynchronously on every subsequent change, one writer per room.
        let lock = self.write_lock(room);
        let weak: Weak<Document> = Arc::downgrade(doc);
        let room = room.to_string();
        doc.on_update(move |_update, _origin| {
            let lock = lock.clone();
            let weak = weak.clone();
            let path = path.clone();
            let room = room.clone();
            tokio::spawn(async move {
                let _guard = lock.lock().await;
                let Some(doc) = weak.upgrade() else { return };
                let snapshot = doc.snapshot();
                if let Err(e) = tokio::fs::write(&path, snapshot).await {
                    warn!("[persistence] flush for room '{}' failed: {}", room, e);
                }
            });
        });

        Ok(())
    }

    async fn flush(&self, room: &str, doc: &Document) -> Result<(), SyncError> {
        let lock = self.write_lock(room);
        let _guard = lock.lock().await;
        let path = self.room_path(room);
        tokio::fs::write(&path, doc.snapshot())
            .await
            .map_err(|e| SyncError::Persistence(format!("Failed to write {:?}: {}", path, e)))
    }
}
