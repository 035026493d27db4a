//! Chunked file I/O and the transfer data model.
//!
//! This module holds the data structures a transfer is described by
//! ([`FileInfo`], [`ChunkInfo`], [`TransferMetadata`]) and the chunked
//! reader/writer that stream a file's bytes without loading the whole file
//! into memory. Integrity at both the chunk and whole-file level is MD5:
//! fast and adequate, since confidentiality and authentication already come
//! from the AEAD layer in [`crate::crypto`].

use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Description of a single file within a transfer. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// File name (final path component).
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// Lowercase hex-encoded MD5 of the whole file.
    pub checksum_md5_hex: String,
    /// Whether this entry is a directory placeholder.
    pub is_directory: bool,
    /// Path relative to the root of the announced batch.
    pub relative_path: String,
    /// Position within `TransferMetadata::files`; unique within a transfer.
    pub file_index: usize,
}

/// Description of one chunk of one file within a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    /// Owning transfer.
    pub transfer_id: Uuid,
    /// Index of the file within the transfer's file list.
    pub file_index: usize,
    /// Monotone chunk index within the file, starting at 0.
    pub chunk_index: u64,
    /// Byte offset of this chunk within the file.
    pub offset: u64,
    /// Number of bytes in this chunk (> 0).
    pub size: u64,
    /// Lowercase hex-encoded MD5 of this chunk's bytes.
    pub checksum_md5_hex: String,
    /// Whether this is the last chunk of the file.
    pub is_last: bool,
}

/// Metadata for an announced batch of files, sent as the body of
/// `FILE_ANNOUNCE`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferMetadata {
    /// Files in the batch, ordered so that `file_index == position`.
    pub files: Vec<FileInfo>,
    /// Sum of all file sizes; must equal `files.iter().map(|f| f.size).sum()`.
    pub total_size: u64,
    /// Unix timestamp (seconds) the batch was announced.
    pub timestamp: i64,
    /// Source operating system identifier (informational only).
    pub source_os: String,
    /// Unique identifier for this announce/download pair.
    pub transfer_id: Uuid,
    /// Epoch seconds after which the offer is no longer valid; 0 = never.
    pub expires_at: i64,
    /// Chunk size negotiated for this transfer.
    pub chunk_size: usize,
}

impl TransferMetadata {
    /// Whether `expires_at` has passed.
    #[must_use]
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at != 0 && now > self.expires_at
    }
}

/// Lowercase hex-encoded MD5 of `data`.
#[must_use]
pub fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Streaming MD5 of a whole file, read in fixed-size blocks so memory use
/// stays flat regardless of file size.
pub async fn md5_hex_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Reads a file as a lazy sequence of fixed-size chunks.
///
/// Chunking is deterministic: `chunk_index = offset / chunk_size`. The
/// reader never loads more than one chunk into memory at a time, and can
/// start at an arbitrary byte offset to support resumed requests.
pub struct ChunkedReader {
    file: fs::File,
    file_size: u64,
    chunk_size: usize,
    next_offset: u64,
}

impl ChunkedReader {
    /// Open `path` for chunked reading, starting at `start_offset` (0 for a
    /// fresh read, or a resume offset).
    pub async fn open(path: &Path, chunk_size: usize, start_offset: u64) -> Result<Self> {
        let mut file = fs::File::open(path).await?;
        let file_size = file.metadata().await?.len();

        if start_offset > file_size {
            return Err(Error::ProtocolError(format!(
                "resume offset {start_offset} exceeds file size {file_size}"
            )));
        }

        file.seek(std::io::SeekFrom::Start(start_offset)).await?;

        Ok(Self {
            file,
            file_size,
            chunk_size,
            next_offset: start_offset,
        })
    }

    /// Read the next chunk, or `None` once the file is exhausted.
    ///
    /// A zero-byte file yields exactly one chunk with `size == 0` and
    /// `is_last == true`, so announce/request/finalize has a chunk to carry
    /// the last-chunk signal even when there is no data.
    pub async fn next_chunk(&mut self) -> Result<Option<(ChunkInfo, Vec<u8>)>> {
        if self.next_offset > self.file_size {
            return Ok(None);
        }

        let is_trailing_empty_file = self.file_size == 0 && self.next_offset == 0;
        if self.next_offset == self.file_size && !is_trailing_empty_file {
            return Ok(None);
        }

        let offset = self.next_offset;
        let chunk_index = offset / self.chunk_size as u64;

        let remaining = self.file_size - offset;
        let want = remaining.min(self.chunk_size as u64) as usize;

        let mut data = vec![0u8; want];
        if want > 0 {
            self.file.read_exact(&mut data).await?;
        }

        let new_offset = offset + want as u64;
        let is_last = new_offset >= self.file_size;

        self.next_offset = if is_trailing_empty_file {
            self.file_size + 1
        } else {
            new_offset
        };

        let info = ChunkInfo {
            transfer_id: Uuid::nil(),
            file_index: 0,
            chunk_index,
            offset,
            size: want as u64,
            checksum_md5_hex: md5_hex(&data),
            is_last,
        };

        Ok(Some((info, data)))
    }
}

/// Writes chunks to a sibling temp file, verifying as it goes, and
/// atomically renames to a collision-free destination on finalize.
pub struct ChunkedWriter {
    dest_path: PathBuf,
    temp_path: PathBuf,
    expected_size: u64,
    expected_checksum_md5_hex: String,
    file: Option<fs::File>,
    bytes_written: u64,
}

impl ChunkedWriter {
    /// Prepare a writer for `dest_path`. The temp file
    /// (`.<name>.tmp`, a sibling of `dest_path`) is created lazily on the
    /// first chunk.
    pub fn new(dest_path: PathBuf, expected_size: u64, expected_checksum_md5_hex: String) -> Self {
        let temp_name = format!(
            ".{}.tmp",
            dest_path.file_name().and_then(|n| n.to_str()).unwrap_or("transfer")
        );
        let temp_path = dest_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(temp_name);

        Self {
            dest_path,
            temp_path,
            expected_size,
            expected_checksum_md5_hex,
            file: None,
            bytes_written: 0,
        }
    }

    async fn ensure_open(&mut self) -> Result<()> {
        if self.file.is_none() {
            if let Some(parent) = self.temp_path.parent() {
                fs::create_dir_all(parent).await?;
            }
            let file = fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&self.temp_path)
                .await?;
            self.file = Some(file);
        }
        Ok(())
    }

    /// Write one chunk at its explicit offset, verifying its MD5 first.
    /// Returns `Ok(false)` (without writing) if the chunk's checksum does
    /// not match `chunk_checksum_md5_hex` — the caller should request a
    /// retransmission rather than advance.
    pub async fn write_chunk(
        &mut self,
        offset: u64,
        data: &[u8],
        chunk_checksum_md5_hex: &str,
    ) -> Result<bool> {
        let actual = md5_hex(data);
        if actual != chunk_checksum_md5_hex {
            return Ok(false);
        }

        self.ensure_open().await?;
        let file = self.file.as_mut().expect("file opened by ensure_open");

        file.seek(std::io::SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;

        let end = offset + data.len() as u64;
        if end > self.bytes_written {
            self.bytes_written = end;
        }

        Ok(true)
    }

    /// Bytes written so far (highest `offset + len` seen, not necessarily
    /// contiguous).
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Close the temp file, verify size and whole-file MD5, and atomically
    /// rename to a collision-free destination. On any verification failure
    /// the temp file is deleted and an [`Error::Integrity`] is returned.
    pub async fn finalize(mut self) -> Result<PathBuf> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }

        let actual_size = fs::metadata(&self.temp_path).await?.len();
        if actual_size != self.expected_size {
            self.cleanup().await;
            return Err(Error::Integrity {
                what: self.dest_path.display().to_string(),
                expected: self.expected_size.to_string(),
                actual: actual_size.to_string(),
            });
        }

        let actual_checksum = md5_hex_file(&self.temp_path).await?;
        if actual_checksum != self.expected_checksum_md5_hex {
            self.cleanup().await;
            return Err(Error::Integrity {
                what: self.dest_path.display().to_string(),
                expected: self.expected_checksum_md5_hex.clone(),
                actual: actual_checksum,
            });
        }

        let final_path = unique_path(&self.dest_path).await;
        fs::rename(&self.temp_path, &final_path).await?;

        Ok(final_path)
    }

    /// Delete the temp file without finalizing, on cancel or unrecoverable
    /// error.
    pub async fn cleanup(&mut self) {
        self.file = None;
        let _ = fs::remove_file(&self.temp_path).await;
    }
}

/// Returns `path` unchanged if free, otherwise the first `name_1.ext`,
/// `name_2.ext`, … that does not already exist.
pub async fn unique_path(path: &Path) -> PathBuf {
    if fs::metadata(path).await.is_err() {
        return path.to_path_buf();
    }

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("file");
    let ext = path.extension().and_then(|s| s.to_str());

    let mut counter = 1u32;
    loop {
        let candidate_name = match ext {
            Some(ext) => format!("{stem}_{counter}.{ext}"),
            None => format!("{stem}_{counter}"),
        };
        let candidate = parent.join(candidate_name);
        if fs::metadata(&candidate).await.is_err() {
            return candidate;
        }
        counter += 1;
    }
}

/// Guard against directory-traversal: reject a relative path that escapes
/// its intended root via `..` components or an absolute path.
pub fn sanitize_relative_path(relative: &str) -> Result<PathBuf> {
    let candidate = Path::new(relative);

    if candidate.is_absolute() {
        return Err(Error::ProtocolError(format!(
            "absolute path not allowed: {relative}"
        )));
    }

    for component in candidate.components() {
        if matches!(component, std::path::Component::ParentDir) {
            return Err(Error::ProtocolError(format!(
                "path traversal not allowed: {relative}"
            )));
        }
    }

    Ok(candidate.to_path_buf())
}

/// Format a byte count as a human-readable string (`"1.5 MB"`, …).
#[must_use]
pub fn format_size(size: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = size as f64;
    let mut unit_index = 0;

    while value >= 1024.0 && unit_index < UNITS.len() - 1 {
        value /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{size} {}", UNITS[unit_index])
    } else {
        format!("{value:.1} {}", UNITS[unit_index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_md5_hex_known_value() {
        assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(md5_hex(b"hello"), "5d41402abc4b2a76b9719d911017c592");
    }

    #[tokio::test]
    async fn test_chunked_reader_empty_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.bin");
        fs::write(&path, b"").await.unwrap();

        let mut reader = ChunkedReader::open(&path, 1024, 0).await.unwrap();
        let (info, data) = reader.next_chunk().await.unwrap().unwrap();
        assert!(info.is_last);
        assert_eq!(info.size, 0);
        assert!(data.is_empty());
        assert!(reader.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_chunked_reader_exact_chunk_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("exact.bin");
        fs::write(&path, vec![7u8; 1024]).await.unwrap();

        let mut reader = ChunkedReader::open(&path, 1024, 0).await.unwrap();
        let (info, data) = reader.next_chunk().await.unwrap().unwrap();
        assert_eq!(data.len(), 1024);
        assert!(info.is_last);
        assert!(reader.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_chunked_reader_partial_last_chunk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.bin");
        fs::write(&path, vec![1u8; 1500]).await.unwrap();

        let mut reader = ChunkedReader::open(&path, 1024, 0).await.unwrap();
        let (first, first_data) = reader.next_chunk().await.unwrap().unwrap();
        assert_eq!(first_data.len(), 1024);
        assert!(!first.is_last);

        let (second, second_data) = reader.next_chunk().await.unwrap().unwrap();
        assert_eq!(second_data.len(), 476);
        assert!(second.is_last);
    }

    #[tokio::test]
    async fn test_chunked_reader_resume_offset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("resume.bin");
        let content: Vec<u8> = (0..2048u32).map(|i| (i % 256) as u8).collect();
        fs::write(&path, &content).await.unwrap();

        let mut reader = ChunkedReader::open(&path, 1024, 1024).await.unwrap();
        let (info, data) = reader.next_chunk().await.unwrap().unwrap();
        assert_eq!(info.offset, 1024);
        assert_eq!(data, &content[1024..2048]);
    }

    #[tokio::test]
    async fn test_writer_roundtrip() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out.bin");
        let content = b"the quick brown fox jumps over the lazy dog";
        let checksum = md5_hex(content);

        let mut writer = ChunkedWriter::new(dest.clone(), content.len() as u64, checksum);
        assert!(writer.write_chunk(0, content, &md5_hex(content)).await.unwrap());

        let final_path = writer.finalize().await.unwrap();
        assert_eq!(final_path, dest);

        let written = fs::read(&final_path).await.unwrap();
        assert_eq!(written, content);
    }

    #[tokio::test]
    async fn test_writer_rejects_bad_chunk_checksum() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out.bin");
        let content = b"data";

        let mut writer = ChunkedWriter::new(dest, content.len() as u64, md5_hex(content));
        let accepted = writer.write_chunk(0, content, "not-a-real-checksum").await.unwrap();
        assert!(!accepted);
        assert_eq!(writer.bytes_written(), 0);
    }

    #[tokio::test]
    async fn test_writer_size_mismatch_fails_finalize() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out.bin");
        let content = b"short";

        let mut writer = ChunkedWriter::new(dest, 999, md5_hex(content));
        writer.write_chunk(0, content, &md5_hex(content)).await.unwrap();

        let result = writer.finalize().await;
        assert!(matches!(result, Err(Error::Integrity { .. })));
    }

    #[tokio::test]
    async fn test_unique_path_collision() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("note.txt");
        fs::write(&path, b"first").await.unwrap();

        let resolved = unique_path(&path).await;
        assert_eq!(resolved, dir.path().join("note_1.txt"));

        fs::write(&resolved, b"second").await.unwrap();
        let next = unique_path(&path).await;
        assert_eq!(next, dir.path().join("note_2.txt"));
    }

    #[test]
    fn test_sanitize_relative_path_rejects_traversal() {
        assert!(sanitize_relative_path("../escape.txt").is_err());
        assert!(sanitize_relative_path("/etc/passwd").is_err());
        assert!(sanitize_relative_path("nested/../../escape.txt").is_err());
        assert!(sanitize_relative_path("nested/ok.txt").is_ok());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(10 * 1024 * 1024), "10.0 MB");
    }
}
