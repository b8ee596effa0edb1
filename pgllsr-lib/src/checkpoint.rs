//! Persisted resume position
//!
//! The checkpoint records the position of the last change the consumer has
//! fully handled, so a new [`Stream`](crate::Stream) can be started from it
//! after a restart. The file is JSON:
//!
//! ```json
//! {
//!   "version": "1.0",
//!   "slot_name": "llsr_slot",
//!   "position": "A1/243C4C60",
//!   "last_updated": "2026-10-19T10:30:45Z"
//! }
//! ```
//!
//! Writes go to a temporary sibling file which is then renamed over the
//! checkpoint, so a crash mid-write leaves the previous checkpoint intact.

use crate::error::{CdcError, Result};
use crate::lsn::LogPos;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Checkpoint file format version
const CHECKPOINT_VERSION: &str = "1.0";

/// Contents of the checkpoint file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: String,
    pub slot_name: String,
    pub position: LogPos,
    pub last_updated: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new<S: Into<String>>(slot_name: S, position: LogPos) -> Self {
        Self {
            version: CHECKPOINT_VERSION.to_string(),
            slot_name: slot_name.into(),
            position,
            last_updated: Utc::now(),
        }
    }
}

/// Thread-safe, monotonic resume position backed by a file
#[derive(Debug)]
pub struct PositionCheckpoint {
    path: PathBuf,
    checkpoint: Mutex<Checkpoint>,
    dirty: AtomicBool,
}

impl PositionCheckpoint {
    /// Track positions for `slot_name`, starting at `initial`
    pub fn new<P: Into<PathBuf>, S: Into<String>>(path: P, slot_name: S, initial: LogPos) -> Self {
        Self {
            path: path.into(),
            checkpoint: Mutex::new(Checkpoint::new(slot_name, initial)),
            dirty: AtomicBool::new(false),
        }
    }

    /// Open an existing checkpoint, or start at `default_position`
    ///
    /// A checkpoint written for a different slot is ignored with a warning.
    pub async fn open<P: Into<PathBuf>, S: Into<String>>(
        path: P,
        slot_name: S,
        default_position: LogPos,
    ) -> Result<Self> {
        let path = path.into();
        let slot_name = slot_name.into();

        let initial = match Self::load(&path).await? {
            Some(saved) if saved.slot_name == slot_name => {
                info!(
                    "Resuming slot '{}' from checkpoint {} ({})",
                    slot_name,
                    saved.position,
                    path.display()
                );
                saved.position
            }
            Some(saved) => {
                warn!(
                    "Checkpoint {} belongs to slot '{}', not '{}'; ignoring it",
                    path.display(),
                    saved.slot_name,
                    slot_name
                );
                default_position
            }
            None => default_position,
        };

        Ok(Self::new(path, slot_name, initial))
    }

    /// Read a checkpoint file
    ///
    /// A missing or empty file is `Ok(None)`; unparsable contents are an error.
    pub async fn load(path: &Path) -> Result<Option<Checkpoint>> {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No checkpoint found at {}", path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let trimmed = contents.trim();
        if trimmed.is_empty() {
            info!("Checkpoint file {} is empty", path.display());
            return Ok(None);
        }

        let checkpoint: Checkpoint = serde_json::from_str(trimmed)?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(CdcError::config(format!(
                "unsupported checkpoint version '{}' in {}",
                checkpoint.version,
                path.display()
            )));
        }
        Ok(Some(checkpoint))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn position(&self) -> LogPos {
        self.lock().position
    }

    pub fn snapshot(&self) -> Checkpoint {
        self.lock().clone()
    }

    /// Advance the position; older or equal positions are ignored
    pub fn record(&self, position: LogPos) -> bool {
        let mut checkpoint = self.lock();
        if position <= checkpoint.position {
            return false;
        }
        checkpoint.position = position;
        checkpoint.last_updated = Utc::now();
        drop(checkpoint);
        self.dirty.store(true, Ordering::Release);
        true
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Write the checkpoint if it changed since the last write
    pub async fn persist(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            debug!("Checkpoint unchanged, skipping write");
            return Ok(());
        }

        let snapshot = self.snapshot();
        if let Err(e) = self.write(&snapshot).await {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        debug!(
            "Persisted checkpoint {} to {}",
            snapshot.position,
            self.path.display()
        );
        Ok(())
    }

    async fn write(&self, checkpoint: &Checkpoint) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let json = serde_json::to_string_pretty(checkpoint)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, json.as_bytes()).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Checkpoint> {
        // A poisoned lock still holds a valid position
        self.checkpoint
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
