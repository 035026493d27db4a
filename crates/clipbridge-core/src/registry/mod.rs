//! In-memory registry of in-flight transfers.
//!
//! A mutex-protected `transfer_id -> TransferInfo` map with single-writer
//! semantics per record: callers read a consistent snapshot via [`get`](Registry::get),
//! and mutate via [`with_mut`](Registry::with_mut) so the lock is held for
//! the whole read-modify-write. State transitions are enforced in
//! [`TransferStatus::can_transition_to`]; illegal transitions are rejected
//! and logged rather than silently applied.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::chunked_io::{FileInfo, TransferMetadata};
use crate::error::{Error, Result};

/// Lifecycle state of a registry record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    /// Sender has announced; no receiver activity yet.
    Announced,
    /// Receiver has registered an announce but not yet requested.
    Pending,
    /// Receiver has sent at least one `FILE_REQUEST`.
    Requesting,
    /// At least one chunk has been received.
    Transferring,
    /// All files fully received and verified.
    Completed,
    /// Unrecoverable error; retries exhausted or peer reported failure.
    Failed,
    /// Cancelled by either side.
    Cancelled,
    /// `expires_at` passed while still non-terminal.
    Expired,
}

impl TransferStatus {
    /// Whether this status is absorbing (no further transitions allowed).
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled | Self::Expired)
    }

    /// Whether transitioning from `self` to `next` is a legal move in this
    /// record's state machine.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (Self::Announced, n) => n.is_terminal(),
            (Self::Pending, Self::Requesting) => true,
            (Self::Requesting, Self::Transferring) => true,
            (Self::Pending, n) | (Self::Requesting, n) | (Self::Transferring, n) => n.is_terminal(),
            _ => false,
        }
    }
}

/// A registry record: the Registry's exclusive view of one transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferInfo {
    /// Unique identifier, shared with the wire protocol's `transfer_id`.
    pub transfer_id: Uuid,
    /// The announced metadata.
    pub metadata: TransferMetadata,
    /// Current lifecycle state.
    pub status: TransferStatus,
    /// Sender-only: file_index to absolute on-disk source path, populated
    /// by directory expansion at announce time.
    pub source_paths: HashMap<usize, PathBuf>,
    /// Receiver-only: destination directory chosen by the caller.
    pub dest_dir: Option<PathBuf>,
    /// Receiver-only: final paths of files written so far.
    pub downloaded_files: Vec<PathBuf>,
    /// Bytes successfully transferred so far; never exceeds `metadata.total_size`.
    pub bytes_transferred: u64,
    /// File index currently in progress.
    pub current_file_index: usize,
    /// Chunk index currently in progress, within `current_file_index`.
    pub current_chunk_index: u64,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the first chunk activity started, if any.
    pub started_at: Option<DateTime<Utc>>,
    /// When a terminal status was reached, if any.
    pub completed_at: Option<DateTime<Utc>>,
    /// Human-readable detail for Failed/Cancelled/Expired.
    pub error_message: Option<String>,
}

impl TransferInfo {
    /// Whether `now` is past this transfer's `expires_at` (0 means never).
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.metadata.expires_at != 0 && now.timestamp() > self.metadata.expires_at
    }
}

fn new_sender_record(metadata: TransferMetadata, source_paths: HashMap<usize, PathBuf>) -> TransferInfo {
    TransferInfo {
        transfer_id: metadata.transfer_id,
        metadata,
        status: TransferStatus::Announced,
        source_paths,
        dest_dir: None,
        downloaded_files: Vec::new(),
        bytes_transferred: 0,
        current_file_index: 0,
        current_chunk_index: 0,
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
        error_message: None,
    }
}

fn new_receiver_record(metadata: TransferMetadata, dest_dir: Option<PathBuf>) -> TransferInfo {
    TransferInfo {
        transfer_id: metadata.transfer_id,
        metadata,
        status: TransferStatus::Pending,
        source_paths: HashMap::new(),
        dest_dir,
        downloaded_files: Vec::new(),
        bytes_transferred: 0,
        current_file_index: 0,
        current_chunk_index: 0,
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
        error_message: None,
    }
}

/// Expand a list of file/directory paths into an ordered, flattened
/// `FileInfo` list plus a `file_index -> absolute path` map, computing a
/// whole-file MD5 for each entry. Directories contribute one `FileInfo`
/// with `is_directory = true` and no checksum, followed by their
/// descendants in walk order.
pub async fn expand_paths(paths: &[PathBuf]) -> Result<(Vec<FileInfo>, HashMap<usize, PathBuf>)> {
    let mut files = Vec::new();
    let mut source_paths = HashMap::new();

    for root in paths {
        let root_name = root
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();

        if root.is_dir() {
            let file_index = files.len();
            files.push(FileInfo {
                name: root_name.clone(),
                size: 0,
                checksum_md5_hex: String::new(),
                is_directory: true,
                relative_path: root_name.clone(),
                file_index,
            });
            source_paths.insert(file_index, root.clone());

            for entry in WalkDir::new(root).min_depth(1).into_iter().filter_map(std::result::Result::ok) {
                let path = entry.path();
                let relative = path.strip_prefix(root.parent().unwrap_or(root)).unwrap_or(path);
                let relative_path = relative.to_string_lossy().replace('\\', "/");
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("file")
                    .to_string();

                if entry.file_type().is_dir() {
                    let file_index = files.len();
                    files.push(FileInfo {
                        name,
                        size: 0,
                        checksum_md5_hex: String::new(),
                        is_directory: true,
                        relative_path,
                        file_index,
                    });
                    source_paths.insert(file_index, path.to_path_buf());
                } else {
                    let metadata = tokio::fs::metadata(path).await?;
                    let checksum = crate::chunked_io::md5_hex_file(path).await?;
                    let file_index = files.len();
                    files.push(FileInfo {
                        name,
                        size: metadata.len(),
                        checksum_md5_hex: checksum,
                        is_directory: false,
                        relative_path,
                        file_index,
                    });
                    source_paths.insert(file_index, path.to_path_buf());
                }
            }
        } else {
            if !root.exists() {
                return Err(Error::FileNotFound(root.display().to_string()));
            }
            let metadata = tokio::fs::metadata(root).await?;
            let checksum = crate::chunked_io::md5_hex_file(root).await?;
            let file_index = files.len();
            files.push(FileInfo {
                name: root_name.clone(),
                size: metadata.len(),
                checksum_md5_hex: checksum,
                is_directory: false,
                relative_path: root_name,
                file_index,
            });
            source_paths.insert(file_index, root.clone());
        }
    }

    Ok((files, source_paths))
}

/// The in-memory transfer table.
#[derive(Default)]
pub struct Registry {
    records: Mutex<HashMap<Uuid, TransferInfo>>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sender-side announce (status `Announced`).
    pub fn register_sender(&self, metadata: TransferMetadata, source_paths: HashMap<usize, PathBuf>) {
        let record = new_sender_record(metadata, source_paths);
        self.records.lock().expect("registry mutex poisoned").insert(record.transfer_id, record);
    }

    /// Register a receiver-side announce (status `Pending`).
    pub fn register_receiver(&self, metadata: TransferMetadata, dest_dir: Option<PathBuf>) {
        let record = new_receiver_record(metadata, dest_dir);
        self.records.lock().expect("registry mutex poisoned").insert(record.transfer_id, record);
    }

    /// A cloned snapshot of one record.
    #[must_use]
    pub fn get(&self, transfer_id: Uuid) -> Option<TransferInfo> {
        self.records.lock().expect("registry mutex poisoned").get(&transfer_id).cloned()
    }

    /// Whether a record exists for `transfer_id`.
    #[must_use]
    pub fn contains(&self, transfer_id: Uuid) -> bool {
        self.records.lock().expect("registry mutex poisoned").contains_key(&transfer_id)
    }

    /// Run `f` against the record for `transfer_id` while holding the lock,
    /// so read-modify-write is atomic. Returns [`Error::TransferNotFound`]
    /// if no such record exists.
    pub fn with_mut<T>(&self, transfer_id: Uuid, f: impl FnOnce(&mut TransferInfo) -> T) -> Result<T> {
        let mut guard = self.records.lock().expect("registry mutex poisoned");
        let record = guard
            .get_mut(&transfer_id)
            .ok_or_else(|| Error::TransferNotFound(transfer_id.to_string()))?;
        Ok(f(record))
    }

    /// Attempt to move a record to `next`, enforcing the state machine.
    /// Returns [`Error::IllegalTransition`] and logs a warning if the move
    /// is not allowed.
    pub fn transition(&self, transfer_id: Uuid, next: TransferStatus) -> Result<()> {
        self.with_mut(transfer_id, |record| {
            if !record.status.can_transition_to(next) {
                tracing::warn!(
                    transfer_id = %transfer_id,
                    from = ?record.status,
                    to = ?next,
                    "rejected illegal transfer state transition"
                );
                return Err(Error::IllegalTransition(format!(
                    "{:?} -> {next:?}",
                    record.status
                )));
            }
            record.status = next;
            if next.is_terminal() {
                record.completed_at = Some(Utc::now());
            } else if record.started_at.is_none() {
                record.started_at = Some(Utc::now());
            }
            Ok(())
        })?
    }

    /// Resolve `file_index`'s absolute source path for a sender-side
    /// record, for serving a `FILE_REQUEST`.
    pub fn source_path(&self, transfer_id: Uuid, file_index: usize) -> Result<PathBuf> {
        self.with_mut(transfer_id, |record| {
            record
                .source_paths
                .get(&file_index)
                .cloned()
                .ok_or_else(|| Error::FileNotFound(format!("file_index {file_index}")))
        })?
    }

    /// Sweep once: flip expired non-terminal records to `Expired`, and
    /// purge terminal records older than `cleanup_max_age`. Returns the
    /// transfer_ids that were flipped to Expired, so the caller can notify
    /// interested parties.
    pub fn sweep(&self, cleanup_max_age: chrono::Duration) -> Vec<Uuid> {
        let now = Utc::now();
        let mut expired = Vec::new();
        let mut guard = self.records.lock().expect("registry mutex poisoned");

        for record in guard.values_mut() {
            if !record.status.is_terminal() && record.is_expired(now) {
                record.status = TransferStatus::Expired;
                record.completed_at = Some(now);
                expired.push(record.transfer_id);
            }
        }

        guard.retain(|_, record| {
            if !record.status.is_terminal() {
                return true;
            }
            match record.completed_at {
                Some(completed) => now.signed_duration_since(completed) < cleanup_max_age,
                None => true,
            }
        });

        expired
    }

    /// Number of records currently held, for diagnostics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().expect("registry mutex poisoned").len()
    }

    /// Whether the registry holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_metadata(transfer_id: Uuid, expires_at: i64) -> TransferMetadata {
        TransferMetadata {
            files: vec![FileInfo {
                name: "a.txt".to_string(),
                size: 4,
                checksum_md5_hex: crate::chunked_io::md5_hex(b"data"),
                is_directory: false,
                relative_path: "a.txt".to_string(),
                file_index: 0,
            }],
            total_size: 4,
            timestamp: Utc::now().timestamp(),
            source_os: "linux".to_string(),
            transfer_id,
            expires_at,
            chunk_size: 1024,
        }
    }

    #[test]
    fn test_register_sender_then_transition_to_terminal() {
        let registry = Registry::new();
        let tid = Uuid::new_v4();
        registry.register_sender(sample_metadata(tid, 0), HashMap::new());

        assert_eq!(registry.get(tid).unwrap().status, TransferStatus::Announced);
        registry.transition(tid, TransferStatus::Completed).unwrap();
        assert_eq!(registry.get(tid).unwrap().status, TransferStatus::Completed);
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let registry = Registry::new();
        let tid = Uuid::new_v4();
        registry.register_receiver(sample_metadata(tid, 0), None);

        let result = registry.transition(tid, TransferStatus::Transferring);
        assert!(matches!(result, Err(Error::IllegalTransition(_))));
        assert_eq!(registry.get(tid).unwrap().status, TransferStatus::Pending);
    }

    #[test]
    fn test_terminal_is_absorbing() {
        let registry = Registry::new();
        let tid = Uuid::new_v4();
        registry.register_receiver(sample_metadata(tid, 0), None);

        registry.transition(tid, TransferStatus::Requesting).unwrap();
        registry.transition(tid, TransferStatus::Transferring).unwrap();
        registry.transition(tid, TransferStatus::Cancelled).unwrap();

        let result = registry.transition(tid, TransferStatus::Completed);
        assert!(result.is_err());
    }

    #[test]
    fn test_sweep_expires_and_purges() {
        let registry = Registry::new();
        let tid = Uuid::new_v4();
        registry.register_sender(sample_metadata(tid, 1), HashMap::new());

        let expired = registry.sweep(chrono::Duration::hours(1));
        assert_eq!(expired, vec![tid]);
        assert_eq!(registry.get(tid).unwrap().status, TransferStatus::Expired);

        registry
            .with_mut(tid, |record| {
                record.completed_at = Some(Utc::now() - chrono::Duration::hours(2));
            })
            .unwrap();

        registry.sweep(chrono::Duration::hours(1));
        assert!(registry.get(tid).is_none());
    }

    #[tokio::test]
    async fn test_expand_paths_single_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("note.txt");
        tokio::fs::write(&path, b"hello").await.unwrap();

        let (files, sources) = expand_paths(&[path.clone()]).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].size, 5);
        assert_eq!(sources.get(&0), Some(&path));
    }

    #[tokio::test]
    async fn test_expand_paths_directory() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("batch");
        tokio::fs::create_dir(&sub).await.unwrap();
        tokio::fs::write(sub.join("one.txt"), b"111").await.unwrap();
        tokio::fs::write(sub.join("two.txt"), b"2222").await.unwrap();

        let (files, _sources) = expand_paths(&[sub]).await.unwrap();
        assert_eq!(files.len(), 3); // directory placeholder + 2 files
        assert!(files[0].is_directory);
    }

    #[tokio::test]
    async fn test_expand_paths_missing_file_fails() {
        let result = expand_paths(&[PathBuf::from("/no/such/path-should-not-exist")]).await;
        assert!(matches!(result, Err(Error::FileNotFound(_))));
    }
}
