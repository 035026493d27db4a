//! Durable per-transfer checkpoint store and retry policy.
//!
//! Checkpoints are kept as a single JSON file (`transfer_checkpoints.json`)
//! under a configured directory, flushed on create, on any terminal state,
//! and every 10 chunks during progress. On engine startup, loading this
//! file repopulates the transfers that were `InProgress` or `Paused` when
//! the process last stopped, so they can be resumed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::Result;

/// State of a checkpointed transfer, as persisted on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointState {
    /// Actively receiving chunks.
    InProgress,
    /// Suspended, eligible for resume on restart.
    Paused,
    /// Finished successfully; kept for a short horizon then purged.
    Completed,
    /// Failed after retries were exhausted.
    Failed,
    /// Cancelled by either side.
    Cancelled,
}

impl CheckpointState {
    /// Whether a checkpoint in this state should be offered for resume on
    /// startup.
    #[must_use]
    pub const fn is_resumable(self) -> bool {
        matches!(self, Self::InProgress | Self::Paused)
    }
}

/// One transfer's durable progress record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferCheckpoint {
    /// Transfer this checkpoint belongs to.
    pub transfer_id: Uuid,
    /// File index currently in progress.
    pub file_index: usize,
    /// Total bytes transferred across the whole transfer so far.
    pub bytes_transferred: u64,
    /// Last chunk index successfully received for `file_index`.
    pub last_chunk_index: u64,
    /// Current checkpoint state.
    pub state: CheckpointState,
    /// Human-readable detail when `state` is `Failed`/`Cancelled`.
    pub error_message: Option<String>,
    /// Consecutive failed-chunk retry count; reset on the next successful
    /// chunk.
    pub retry_count: u32,
    /// When the checkpoint was first created.
    pub created_at: DateTime<Utc>,
    /// When the checkpoint was last updated.
    pub updated_at: DateTime<Utc>,
}

/// Exponential backoff tuning for chunk retries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries before giving up on a chunk.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Delay ceiling; `delay(n)` never exceeds this.
    pub max_delay: Duration,
    /// Multiplier applied per retry attempt.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// `delay(n) = min(initial_delay * multiplier^n, max_delay)`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }
}

const CHECKPOINT_FILE_NAME: &str = "transfer_checkpoints.json";
const FLUSH_EVERY_N_CHUNKS: u32 = 10;

/// The durable checkpoint table.
pub struct CheckpointStore {
    path: PathBuf,
    retry_policy: RetryPolicy,
    checkpoints: Mutex<HashMap<Uuid, TransferCheckpoint>>,
    chunks_since_flush: Mutex<HashMap<Uuid, u32>>,
}

impl CheckpointStore {
    /// Open (or create) the checkpoint store under `checkpoint_dir`,
    /// loading any existing `transfer_checkpoints.json`.
    pub async fn open(checkpoint_dir: PathBuf, retry_policy: RetryPolicy) -> Result<Self> {
        fs::create_dir_all(&checkpoint_dir).await?;
        let path = checkpoint_dir.join(CHECKPOINT_FILE_NAME);

        let checkpoints = if path.exists() {
            let bytes = fs::read(&path).await?;
            serde_json::from_slice(&bytes).unwrap_or_default()
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            retry_policy,
            checkpoints: Mutex::new(checkpoints),
            chunks_since_flush: Mutex::new(HashMap::new()),
        })
    }

    async fn flush(&self) -> Result<()> {
        let snapshot = self.checkpoints.lock().expect("checkpoint mutex poisoned").clone();
        let json = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| crate::error::Error::Serialization(e.to_string()))?;

        let temp_path = self.path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, &self.path).await?;

        Ok(())
    }

    /// Create a fresh `InProgress` checkpoint for `transfer_id` and flush
    /// immediately.
    pub async fn create(&self, transfer_id: Uuid) -> Result<()> {
        let now = Utc::now();
        let checkpoint = TransferCheckpoint {
            transfer_id,
            file_index: 0,
            bytes_transferred: 0,
            last_chunk_index: 0,
            state: CheckpointState::InProgress,
            error_message: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
        };
        self.checkpoints
            .lock()
            .expect("checkpoint mutex poisoned")
            .insert(transfer_id, checkpoint);
        self.flush().await
    }

    /// A cloned snapshot of one checkpoint.
    #[must_use]
    pub fn get(&self, transfer_id: Uuid) -> Option<TransferCheckpoint> {
        self.checkpoints
            .lock()
            .expect("checkpoint mutex poisoned")
            .get(&transfer_id)
            .cloned()
    }

    /// Record a successfully received chunk: updates progress, resets
    /// `retry_count`, and flushes every 10 chunks (rate-limited write).
    pub async fn record_chunk(
        &self,
        transfer_id: Uuid,
        file_index: usize,
        chunk_index: u64,
        bytes_transferred: u64,
    ) -> Result<()> {
        let should_flush = {
            let mut checkpoints = self.checkpoints.lock().expect("checkpoint mutex poisoned");
            let Some(checkpoint) = checkpoints.get_mut(&transfer_id) else {
                return Ok(());
            };
            checkpoint.file_index = file_index;
            checkpoint.last_chunk_index = chunk_index;
            checkpoint.bytes_transferred = bytes_transferred;
            checkpoint.retry_count = 0;
            checkpoint.updated_at = Utc::now();

            let mut counters = self.chunks_since_flush.lock().expect("counter mutex poisoned");
            let count = counters.entry(transfer_id).or_insert(0);
            *count += 1;
            if *count >= FLUSH_EVERY_N_CHUNKS {
                *count = 0;
                true
            } else {
                false
            }
        };

        if should_flush {
            self.flush().await?;
        }
        Ok(())
    }

    /// Move a checkpoint to a terminal (or `Paused`) state and flush
    /// immediately.
    pub async fn set_state(
        &self,
        transfer_id: Uuid,
        state: CheckpointState,
        error_message: Option<String>,
    ) -> Result<()> {
        {
            let mut checkpoints = self.checkpoints.lock().expect("checkpoint mutex poisoned");
            if let Some(checkpoint) = checkpoints.get_mut(&transfer_id) {
                checkpoint.state = state;
                checkpoint.error_message = error_message;
                checkpoint.updated_at = Utc::now();
            }
        }
        self.flush().await
    }

    /// Checkpoints left `InProgress`/`Paused` from a previous run, for the
    /// engine to offer as resumable on startup.
    #[must_use]
    pub fn resumable(&self) -> Vec<TransferCheckpoint> {
        self.checkpoints
            .lock()
            .expect("checkpoint mutex poisoned")
            .values()
            .filter(|c| c.state.is_resumable())
            .cloned()
            .collect()
    }

    /// Atomically read `retry_count`, decide whether another retry is
    /// allowed, and increment it if so.
    #[must_use]
    pub fn should_retry_chunk(&self, transfer_id: Uuid) -> bool {
        let mut checkpoints = self.checkpoints.lock().expect("checkpoint mutex poisoned");
        let Some(checkpoint) = checkpoints.get_mut(&transfer_id) else {
            return false;
        };
        if checkpoint.retry_count >= self.retry_policy.max_retries {
            return false;
        }
        checkpoint.retry_count += 1;
        true
    }

    /// Zero `retry_count` after any successful chunk receipt.
    pub fn reset_retry_count(&self, transfer_id: Uuid) {
        let mut checkpoints = self.checkpoints.lock().expect("checkpoint mutex poisoned");
        if let Some(checkpoint) = checkpoints.get_mut(&transfer_id) {
            checkpoint.retry_count = 0;
        }
    }

    /// The retry policy this store was opened with.
    #[must_use]
    pub const fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }
}
