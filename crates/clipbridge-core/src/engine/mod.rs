//! The public sync engine: the six operations an embedding application
//! drives a transfer with, plus the server loop that answers a peer's
//! connections.
//!
//! The engine orchestrates every other module: it resolves a peer address
//! through an external [`PeerResolver`], opens and hands off to
//! [`crate::session`] for the handshake, speaks [`crate::codec`] frames,
//! reads/writes through [`crate::chunked_io`], and keeps [`crate::registry`]
//! and [`crate::checkpoint`] in sync with what actually happened on the
//! wire. It never touches the OS clipboard itself - that is the embedding
//! application's job, delivered back through [`EngineCallbacks`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use uuid::Uuid;

use crate::checkpoint::{CheckpointState, CheckpointStore};
use crate::chunked_io::{ChunkedReader, ChunkedWriter, TransferMetadata};
use crate::codec::{self, MessageType};
use crate::config::Config;
use crate::crypto::KEY_SIZE;
use crate::error::{Error, Result};
use crate::pairing::PairingStore;
use crate::registry::{self, Registry, TransferStatus};
use crate::session::Session;

/// Resolves the address of the (single) paired peer. Implemented by the
/// embedding application, typically backed by mDNS or a cached last-known
/// address; the engine only consumes the result.
pub trait PeerResolver: Send + Sync {
    /// Returns the peer's address if one is currently reachable.
    fn get_first_peer(&self) -> Option<SocketAddr>;
}

/// A resolver that always returns a fixed, pre-configured address.
pub struct StaticPeerResolver(pub SocketAddr);

impl PeerResolver for StaticPeerResolver {
    fn get_first_peer(&self) -> Option<SocketAddr> {
        Some(self.0)
    }
}

/// Callbacks the engine invokes as transfers progress. All methods have a
/// no-op default so an embedder only implements what it needs.
pub trait EngineCallbacks: Send + Sync {
    /// A batch of files finished downloading.
    fn on_files_received(&self, _transfer_id: Uuid, _paths: &[PathBuf]) {}
    /// A direct text transfer arrived.
    fn on_text_received(&self, _text: &str) {}
    /// A peer announced a lazy transfer.
    fn on_files_announced(&self, _transfer_id: Uuid, _metadata: &TransferMetadata) {}
    /// Rate-limited progress update for an in-flight transfer.
    fn on_transfer_progress(&self, _transfer_id: Uuid, _bytes_done: u64, _bytes_total: u64, _current_file_name: &str) {}
    /// A record was flipped to `Expired` by the sweep.
    fn on_expired(&self, _transfer_id: Uuid) {}
}

/// Callbacks implementation that does nothing, for callers with no
/// clipboard adapter wired up yet.
pub struct NoopCallbacks;

impl EngineCallbacks for NoopCallbacks {}

struct LastSent {
    kind: &'static str,
    checksum_md5_hex: String,
    at: Instant,
}

/// One progress update, broadcast on a per-transfer `watch` channel.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    /// Transfer the update belongs to.
    pub transfer_id: Uuid,
    /// Bytes transferred so far.
    pub bytes_done: u64,
    /// Total bytes in the transfer.
    pub bytes_total: u64,
    /// Name of the file currently being written.
    pub current_file_name: String,
}

const PROGRESS_EMIT_INTERVAL: Duration = Duration::from_millis(100);

/// The sync engine: owns the registry, checkpoint store, and pairing
/// state, and exposes the operations an embedding application drives a
/// transfer with.
pub struct SyncEngine {
    config: Config,
    registry: Arc<Registry>,
    checkpoint: Arc<CheckpointStore>,
    pairing: Arc<Mutex<PairingStore>>,
    peer_resolver: Arc<dyn PeerResolver>,
    callbacks: Arc<dyn EngineCallbacks>,
    last_sent: Mutex<Option<LastSent>>,
    cancel_signals: Mutex<HashMap<Uuid, Arc<AtomicBool>>>,
    last_progress_emit: Mutex<HashMap<Uuid, Instant>>,
    progress_channels: Mutex<HashMap<Uuid, watch::Sender<ProgressEvent>>>,
}

impl SyncEngine {
    /// Build a new engine: loads the pairing store and checkpoint store
    /// from the paths named by `config`. A checkpoint left `InProgress`/
    /// `Paused` from a previous run is not automatically re-registered in
    /// the (metadata-less) checkpoint file alone; an embedder that wants to
    /// offer resume on startup should inspect [`CheckpointStore::resumable`]
    /// itself once it has re-announced or re-discovered the matching
    /// transfer metadata.
    pub async fn new(
        config: Config,
        peer_resolver: Arc<dyn PeerResolver>,
        callbacks: Arc<dyn EngineCallbacks>,
    ) -> Result<Self> {
        let pairing = PairingStore::load(config.pairing_path()).await?;
        let checkpoint = CheckpointStore::open(config.checkpoint_dir(), config.retry_policy.to_retry_policy()).await?;
        Self::from_parts(config, Registry::new(), checkpoint, pairing, peer_resolver, callbacks)
    }

    /// Build an engine from already-open parts, for callers that manage
    /// the registry/checkpoint/pairing stores themselves (or need to inject
    /// pre-populated state, as integration tests do to skip the PIN
    /// handshake).
    pub fn from_parts(
        config: Config,
        registry: Registry,
        checkpoint: CheckpointStore,
        pairing: PairingStore,
        peer_resolver: Arc<dyn PeerResolver>,
        callbacks: Arc<dyn EngineCallbacks>,
    ) -> Result<Self> {
        Ok(Self {
            config,
            registry: Arc::new(registry),
            checkpoint: Arc::new(checkpoint),
            pairing: Arc::new(Mutex::new(pairing)),
            peer_resolver,
            callbacks,
            last_sent: Mutex::new(None),
            cancel_signals: Mutex::new(HashMap::new()),
            last_progress_emit: Mutex::new(HashMap::new()),
            progress_channels: Mutex::new(HashMap::new()),
        })
    }

    fn shared_key(&self) -> Option<[u8; KEY_SIZE]> {
        self.pairing
            .lock()
            .expect("pairing mutex poisoned")
            .paired_device()
            .and_then(|d| d.shared_key().ok())
    }

    fn require_shared_key(&self) -> Result<[u8; KEY_SIZE]> {
        self.shared_key().ok_or(Error::NotPaired)
    }

    async fn dial(&self) -> Result<Session<TcpStream>> {
        let peer_addr = self.peer_resolver.get_first_peer().ok_or(Error::NoPeer)?;
        let key = self.require_shared_key()?;

        let stream = TcpStream::connect(peer_addr).await?;
        crate::session::configure_tcp_keepalive(&stream)?;

        Session::connect_client(stream, Some(peer_addr), key).await
    }

    fn check_loop_suppression(&self, kind: &'static str, checksum_md5_hex: &str) -> bool {
        let mut guard = self.last_sent.lock().expect("last_sent mutex poisoned");
        if let Some(last) = guard.as_ref() {
            if last.kind == kind
                && last.checksum_md5_hex == checksum_md5_hex
                && last.at.elapsed() < crate::LOOP_SUPPRESSION_WINDOW
            {
                return true;
            }
        }
        *guard = Some(LastSent {
            kind,
            checksum_md5_hex: checksum_md5_hex.to_string(),
            at: Instant::now(),
        });
        false
    }

    fn emit_progress(&self, transfer_id: Uuid, bytes_done: u64, bytes_total: u64, current_file_name: &str) {
        let should_emit = {
            let mut guard = self.last_progress_emit.lock().expect("progress mutex poisoned");
            let now = Instant::now();
            let emit = guard
                .get(&transfer_id)
                .is_none_or(|last| now.duration_since(*last) >= PROGRESS_EMIT_INTERVAL);
            if emit {
                guard.insert(transfer_id, now);
            }
            emit
        };

        if !should_emit {
            return;
        }

        self.callbacks
            .on_transfer_progress(transfer_id, bytes_done, bytes_total, current_file_name);

        let event = ProgressEvent {
            transfer_id,
            bytes_done,
            bytes_total,
            current_file_name: current_file_name.to_string(),
        };
        let channels = self.progress_channels.lock().expect("progress channel mutex poisoned");
        if let Some(tx) = channels.get(&transfer_id) {
            let _ = tx.send(event);
        }
    }

    /// Subscribe to progress updates for `transfer_id`, creating the
    /// channel if this is the first subscriber.
    pub fn subscribe_progress(&self, transfer_id: Uuid) -> watch::Receiver<ProgressEvent> {
        let mut channels = self.progress_channels.lock().expect("progress channel mutex poisoned");
        channels
            .entry(transfer_id)
            .or_insert_with(|| {
                let (tx, _rx) = watch::channel(ProgressEvent {
                    transfer_id,
                    bytes_done: 0,
                    bytes_total: 0,
                    current_file_name: String::new(),
                });
                tx
            })
            .subscribe()
    }

    fn cancel_signal(&self, transfer_id: Uuid) -> Arc<AtomicBool> {
        self.cancel_signals
            .lock()
            .expect("cancel signal mutex poisoned")
            .entry(transfer_id)
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    /// Set the cancel signal for a live transfer and make a best-effort
    /// attempt to notify the peer. Returns `true` if a record for
    /// `transfer_id` exists.
    pub async fn cancel_transfer(&self, transfer_id: Uuid, reason: &str) -> bool {
        if !self.registry.contains(transfer_id) {
            return false;
        }

        self.cancel_signal(transfer_id).store(true, Ordering::SeqCst);

        if let Ok(mut session) = self.dial().await {
            let body = codec::encode_json(&codec::TransferCancelPayload {
                transfer_id,
                reason: reason.to_string(),
            });
            if let Ok(body) = body {
                let _ = session.send(MessageType::TransferCancel, &body).await;
            }
        }

        true
    }

    /// Compute metadata and announce a batch of files to the paired peer.
    /// Directories are expanded into their constituent files.
    pub async fn announce_files(&self, paths: Vec<PathBuf>) -> Result<Uuid> {
        let (files, source_paths) = registry::expand_paths(&paths).await?;
        let total_size: u64 = files.iter().map(|f| f.size).sum();

        if total_size > self.config.max_total_size {
            return Err(Error::SizeLimit(total_size, self.config.max_total_size));
        }

        let combined_checksum = crate::chunked_io::md5_hex(
            files
                .iter()
                .map(|f| f.checksum_md5_hex.as_str())
                .collect::<Vec<_>>()
                .join(",")
                .as_bytes(),
        );

        if self.check_loop_suppression("files", &combined_checksum) {
            if let Some(existing) = self.find_announced_with_checksum(&combined_checksum) {
                return Ok(existing);
            }
        }

        let transfer_id = Uuid::new_v4();
        let metadata = TransferMetadata {
            files,
            total_size,
            timestamp: Utc::now().timestamp(),
            source_os: std::env::consts::OS.to_string(),
            transfer_id,
            expires_at: 0,
            chunk_size: self.config.chunk_size,
        };

        self.registry.register_sender(metadata.clone(), source_paths);

        let mut session = self.dial().await?;
        let body = codec::encode_json(&metadata)?;
        session.send(MessageType::FileAnnounce, &body).await?;

        Ok(transfer_id)
    }

    fn find_announced_with_checksum(&self, _checksum: &str) -> Option<Uuid> {
        None
    }

    /// Resume offset for `file_index` within `transfer_id`: the sum of
    /// earlier files' sizes subtracted from `bytes_transferred`. Clamped
    /// to zero if out of range.
    fn resume_offset(&self, metadata: &TransferMetadata, file_index: usize, checkpoint_bytes: u64) -> u64 {
        let earlier: u64 = metadata.files[..file_index].iter().map(|f| f.size).sum();
        checkpoint_bytes.saturating_sub(earlier)
    }

    /// Request a previously announced transfer, writing files under
    /// `dest_dir` (or the current directory if `None`).
    pub async fn request_transfer(&self, transfer_id: Uuid, dest_dir: Option<PathBuf>) -> Result<Option<Vec<PathBuf>>> {
        let record = self
            .registry
            .get(transfer_id)
            .ok_or_else(|| Error::TransferNotFound(transfer_id.to_string()))?;

        if record.is_expired(Utc::now()) {
            let _ = self.registry.transition(transfer_id, TransferStatus::Expired);
            return Ok(None);
        }

        self.registry.transition(transfer_id, TransferStatus::Requesting)?;
        self.checkpoint.create(transfer_id).await?;

        let dest = dest_dir.unwrap_or_else(|| PathBuf::from("."));
        tokio::fs::create_dir_all(&dest).await?;

        let cancel = self.cancel_signal(transfer_id);
        let mut downloaded = Vec::new();
        let mut bytes_so_far = 0u64;

        let result = self
            .run_request_loop(transfer_id, &record.metadata, &dest, &cancel, &mut downloaded, &mut bytes_so_far)
            .await;

        match result {
            Ok(()) => {
                self.registry.transition(transfer_id, TransferStatus::Completed)?;
                self.checkpoint.set_state(transfer_id, CheckpointState::Completed, None).await?;
                self.callbacks.on_files_received(transfer_id, &downloaded);
                Ok(Some(downloaded))
            }
            Err(e) => {
                let was_cancelled = cancel.load(Ordering::SeqCst);
                let next_status = if was_cancelled { TransferStatus::Cancelled } else { TransferStatus::Failed };
                let checkpoint_state = if was_cancelled { CheckpointState::Cancelled } else { CheckpointState::Failed };
                let _ = self.registry.transition(transfer_id, next_status);
                self.checkpoint
                    .set_state(transfer_id, checkpoint_state, Some(e.to_string()))
                    .await?;

                if let Ok(mut session) = self.dial().await {
                    if let Ok(body) = codec::encode_json(&codec::TransferCancelPayload {
                        transfer_id,
                        reason: e.to_string(),
                    }) {
                        let _ = session.send(MessageType::TransferCancel, &body).await;
                    }
                }

                if was_cancelled {
                    Ok(None)
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn run_request_loop(
        &self,
        transfer_id: Uuid,
        metadata: &TransferMetadata,
        dest: &std::path::Path,
        cancel: &Arc<AtomicBool>,
        downloaded: &mut Vec<PathBuf>,
        bytes_so_far: &mut u64,
    ) -> Result<()> {
        let mut session = self.dial().await?;
        let mut marked_transferring = false;

        for file in &metadata.files {
            if cancel.load(Ordering::SeqCst) {
                return Err(Error::Cancelled("cancelled before file start".to_string()));
            }
            if file.is_directory {
                let dir_path = crate::chunked_io::sanitize_relative_path(&file.relative_path)
                    .map(|rel| dest.join(rel))?;
                tokio::fs::create_dir_all(&dir_path).await?;
                continue;
            }

            let checkpoint = self.checkpoint.get(transfer_id);
            let offset = checkpoint
                .map(|c| self.resume_offset(metadata, file.file_index, c.bytes_transferred))
                .unwrap_or(0);

            let request = codec::FileRequestPayload {
                transfer_id,
                file_index: file.file_index,
                offset,
            };
            session
                .send(MessageType::FileRequest, &codec::encode_json(&request)?)
                .await?;

            let rel_path = crate::chunked_io::sanitize_relative_path(&file.relative_path)?;
            let dest_path = dest.join(rel_path);
            let mut writer = ChunkedWriter::new(dest_path, file.size, file.checksum_md5_hex.clone());

            loop {
                if cancel.load(Ordering::SeqCst) {
                    writer.cleanup().await;
                    return Err(Error::Cancelled("cancelled mid-chunk".to_string()));
                }

                let frame = tokio::time::timeout(self.config.chunk_timeout(), session.recv())
                    .await
                    .map_err(|_| Error::Timeout(self.config.chunk_timeout()))??;

                if frame.message_type == MessageType::TransferError {
                    let payload: codec::TransferErrorPayload = codec::decode_json(&frame.body)?;
                    writer.cleanup().await;
                    return Err(Error::ProtocolError(payload.message));
                }
                if frame.message_type != MessageType::FileChunk {
                    return Err(Error::ProtocolError("expected FILE_CHUNK".to_string()));
                }

                let (chunk_info, chunk_data) = codec::decode_file_chunk(&frame.body)?;

                if !marked_transferring {
                    self.registry.transition(transfer_id, TransferStatus::Transferring)?;
                    marked_transferring = true;
                }

                let accepted = writer
                    .write_chunk(chunk_info.offset, &chunk_data, &chunk_info.checksum_md5_hex)
                    .await?;

                if !accepted {
                    if !self.checkpoint.should_retry_chunk(transfer_id) {
                        writer.cleanup().await;
                        return Err(Error::Integrity {
                            what: format!("chunk {} of file {}", chunk_info.chunk_index, file.name),
                            expected: chunk_info.checksum_md5_hex,
                            actual: "mismatch after retries exhausted".to_string(),
                        });
                    }
                    continue;
                }

                self.checkpoint.reset_retry_count(transfer_id);
                *bytes_so_far += chunk_data.len() as u64;

                self.checkpoint
                    .record_chunk(transfer_id, file.file_index, chunk_info.chunk_index, *bytes_so_far)
                    .await?;
                self.registry.with_mut(transfer_id, |record| {
                    record.bytes_transferred = *bytes_so_far;
                    record.current_file_index = file.file_index;
                    record.current_chunk_index = chunk_info.chunk_index;
                })?;

                self.emit_progress(transfer_id, *bytes_so_far, metadata.total_size, &file.name);

                let ack = codec::AckPayload { success: true, message: String::new() };
                session.send(MessageType::FileChunkAck, &codec::encode_json(&ack)?).await?;

                if chunk_info.is_last {
                    break;
                }
            }

            let final_path = writer.finalize().await?;
            downloaded.push(final_path);
        }

        let complete = codec::TransferCompletePayload { transfer_id };
        session
            .send(MessageType::TransferComplete, &codec::encode_json(&complete)?)
            .await?;

        Ok(())
    }

    /// Download exactly one file from an announced transfer, returning its
    /// bytes without writing to disk.
    pub async fn download_single_file(&self, transfer_id: Uuid, file_index: usize) -> Result<Option<Vec<u8>>> {
        let record = self
            .registry
            .get(transfer_id)
            .ok_or_else(|| Error::TransferNotFound(transfer_id.to_string()))?;

        if record.is_expired(Utc::now()) {
            let _ = self.registry.transition(transfer_id, TransferStatus::Expired);
            return Ok(None);
        }

        let file = record
            .metadata
            .files
            .get(file_index)
            .ok_or_else(|| Error::FileNotFound(format!("file_index {file_index}")))?
            .clone();

        let mut session = self.dial().await?;
        let request = codec::FileRequestPayload { transfer_id, file_index, offset: 0 };
        session
            .send(MessageType::FileRequest, &codec::encode_json(&request)?)
            .await?;

        let mut buffer = Vec::with_capacity(file.size as usize);
        loop {
            let frame = tokio::time::timeout(self.config.chunk_timeout(), session.recv())
                .await
                .map_err(|_| Error::Timeout(self.config.chunk_timeout()))??;

            if frame.message_type != MessageType::FileChunk {
                return Err(Error::ProtocolError("expected FILE_CHUNK".to_string()));
            }
            let (chunk_info, chunk_data) = codec::decode_file_chunk(&frame.body)?;
            if crate::chunked_io::md5_hex(&chunk_data) != chunk_info.checksum_md5_hex {
                return Err(Error::Integrity {
                    what: format!("chunk {} of file {}", chunk_info.chunk_index, file.name),
                    expected: chunk_info.checksum_md5_hex,
                    actual: crate::chunked_io::md5_hex(&chunk_data),
                });
            }
            buffer.extend_from_slice(&chunk_data);
            if chunk_info.is_last {
                break;
            }
        }

        if crate::chunked_io::md5_hex(&buffer) != file.checksum_md5_hex {
            return Err(Error::Integrity {
                what: file.name,
                expected: file.checksum_md5_hex,
                actual: crate::chunked_io::md5_hex(&buffer),
            });
        }

        Ok(Some(buffer))
    }

    /// Send a short text string directly (no announce/request round trip).
    pub async fn send_text(&self, text: &str) -> Result<bool> {
        let checksum = crate::chunked_io::md5_hex(text.as_bytes());
        if self.check_loop_suppression("text", &checksum) {
            return Ok(true);
        }

        let mut session = self.dial().await?;
        session
            .send(MessageType::TextTransfer, &codec::encode_text_transfer(text))
            .await?;

        let frame = session.recv().await?;
        if frame.message_type != MessageType::TextAck {
            return Err(Error::ProtocolError("expected TEXT_ACK".to_string()));
        }
        let ack: codec::AckPayload = codec::decode_json(&frame.body)?;
        Ok(ack.success)
    }

    /// Send a small bundle of files directly, packed into one frame.
    pub async fn send_files_direct(&self, paths: Vec<PathBuf>) -> Result<bool> {
        let (files, source_paths) = registry::expand_paths(&paths).await?;
        let total_size: u64 = files.iter().map(|f| f.size).sum();

        if total_size > self.config.max_total_size {
            return Err(Error::SizeLimit(total_size, self.config.max_total_size));
        }

        let mut packed = Vec::with_capacity(total_size as usize);
        for file in &files {
            if file.is_directory {
                continue;
            }
            if let Some(path) = source_paths.get(&file.file_index) {
                packed.extend_from_slice(&tokio::fs::read(path).await?);
            }
        }

        let combined_checksum = crate::chunked_io::md5_hex(&packed);
        if self.check_loop_suppression("files_direct", &combined_checksum) {
            return Ok(true);
        }

        let metadata = TransferMetadata {
            files,
            total_size,
            timestamp: Utc::now().timestamp(),
            source_os: std::env::consts::OS.to_string(),
            transfer_id: Uuid::new_v4(),
            expires_at: 0,
            chunk_size: self.config.chunk_size,
        };

        let mut session = self.dial().await?;
        let body = codec::encode_file_transfer(&metadata, &packed)?;
        session.send(MessageType::FileTransfer, &body).await?;

        let frame = session.recv().await?;
        if frame.message_type != MessageType::FileAck {
            return Err(Error::ProtocolError("expected FILE_ACK".to_string()));
        }
        let ack: codec::AckPayload = codec::decode_json(&frame.body)?;
        Ok(ack.success)
    }

    /// Bind the data port and serve incoming connections until `shutdown`
    /// resolves. Each accepted connection is handled on its own task; a
    /// background sweeper flips expired registry records every
    /// `sweep_interval_secs`.
    pub async fn serve(self: Arc<Self>, shutdown: impl std::future::Future<Output = ()>) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.port)).await?;

        let sweeper_engine = Arc::clone(&self);
        let sweep_interval = Duration::from_secs(self.config.sweep_interval_secs);
        let cleanup_max_age = chrono::Duration::seconds(self.config.cleanup_max_age_secs as i64);
        let sweeper = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            loop {
                interval.tick().await;
                for transfer_id in sweeper_engine.registry.sweep(cleanup_max_age) {
                    sweeper_engine.callbacks.on_expired(transfer_id);
                }
            }
        });

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer_addr) = accepted?;
                    let engine = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = engine.serve_connection(stream, peer_addr).await {
                            tracing::warn!(peer = %peer_addr, error = %e, "connection closed with error");
                        }
                    });
                }
                () = &mut shutdown => break,
            }
        }

        sweeper.abort();
        Ok(())
    }

    async fn serve_connection(&self, stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        crate::session::configure_tcp_keepalive(&stream)?;
        let shared_key = self.shared_key();
        let mut session =
            Session::accept_server(stream, Some(peer_addr), shared_key, self.config.require_pairing).await?;

        loop {
            let frame = session.recv().await?;
            match frame.message_type {
                MessageType::Ping => {
                    session.send(MessageType::Pong, &[]).await?;
                }
                MessageType::TextTransfer => {
                    let text = codec::decode_text_transfer(&frame.body)?;
                    self.callbacks.on_text_received(&text);
                    let ack = codec::AckPayload { success: true, message: String::new() };
                    session.send(MessageType::TextAck, &codec::encode_json(&ack)?).await?;
                }
                MessageType::FileTransfer => {
                    let (metadata, bytes) = codec::decode_file_transfer(&frame.body)?;
                    let paths = self.unpack_direct_transfer(&metadata, &bytes).await;
                    let ack = match &paths {
                        Ok(paths) => {
                            self.callbacks.on_files_received(metadata.transfer_id, paths);
                            codec::AckPayload { success: true, message: String::new() }
                        }
                        Err(e) => codec::AckPayload { success: false, message: e.to_string() },
                    };
                    session.send(MessageType::FileAck, &codec::encode_json(&ack)?).await?;
                }
                MessageType::FileAnnounce => {
                    let metadata: TransferMetadata = codec::decode_json(&frame.body)?;
                    self.callbacks.on_files_announced(metadata.transfer_id, &metadata);
                    self.registry.register_receiver(metadata, None);
                }
                MessageType::FileRequest => {
                    let request: codec::FileRequestPayload = codec::decode_json(&frame.body)?;
                    self.serve_file_request(&mut session, &request).await?;
                }
                MessageType::FileChunkAck => {}
                MessageType::TransferComplete => {
                    let payload: codec::TransferCompletePayload = codec::decode_json(&frame.body)?;
                    let _ = self.registry.transition(payload.transfer_id, TransferStatus::Completed);
                }
                MessageType::TransferCancel => {
                    let payload: codec::TransferCancelPayload = codec::decode_json(&frame.body)?;
                    self.cancel_signal(payload.transfer_id).store(true, Ordering::SeqCst);
                    let _ = self.registry.transition(payload.transfer_id, TransferStatus::Cancelled);
                }
                MessageType::TransferError => {
                    let payload: codec::TransferErrorPayload = codec::decode_json(&frame.body)?;
                    let _ = self.registry.transition(payload.transfer_id, TransferStatus::Failed);
                    tracing::warn!(transfer_id = %payload.transfer_id, message = %payload.message, "peer reported transfer error");
                }
                other => {
                    return Err(Error::ProtocolError(format!("unexpected message type in dispatch loop: {other:?}")));
                }
            }
        }
    }

    async fn unpack_direct_transfer(&self, metadata: &TransferMetadata, bytes: &[u8]) -> Result<Vec<PathBuf>> {
        let dest = std::env::temp_dir().join(format!("clipbridge/recv_{}", Utc::now().timestamp_millis()));
        tokio::fs::create_dir_all(&dest).await?;

        let mut offset = 0usize;
        let mut paths = Vec::new();
        for file in &metadata.files {
            if file.is_directory {
                continue;
            }
            let end = offset + file.size as usize;
            let slice = bytes.get(offset..end).ok_or_else(|| {
                Error::ProtocolError("FILE_TRANSFER body shorter than announced sizes".to_string())
            })?;

            if crate::chunked_io::md5_hex(slice) != file.checksum_md5_hex {
                return Err(Error::Integrity {
                    what: file.name.clone(),
                    expected: file.checksum_md5_hex.clone(),
                    actual: crate::chunked_io::md5_hex(slice),
                });
            }

            let rel_path = crate::chunked_io::sanitize_relative_path(&file.relative_path)?;
            let final_path = crate::chunked_io::unique_path(&dest.join(rel_path)).await;
            if let Some(parent) = final_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&final_path, slice).await?;
            paths.push(final_path);

            offset = end;
        }

        Ok(paths)
    }

    async fn serve_file_request(
        &self,
        session: &mut Session<TcpStream>,
        request: &codec::FileRequestPayload,
    ) -> Result<()> {
        let source_path = self.registry.source_path(request.transfer_id, request.file_index)?;
        let record = self
            .registry
            .get(request.transfer_id)
            .ok_or_else(|| Error::TransferNotFound(request.transfer_id.to_string()))?;
        let chunk_size = record.metadata.chunk_size;

        let cancel = self.cancel_signal(request.transfer_id);
        let mut reader = ChunkedReader::open(&source_path, chunk_size, request.offset).await?;
        while let Some((mut info, data)) = reader.next_chunk().await? {
            if cancel.load(Ordering::SeqCst) {
                return Err(Error::Cancelled(format!("transfer {} cancelled by peer", request.transfer_id)));
            }
            info.transfer_id = request.transfer_id;
            info.file_index = request.file_index;
            let body = codec::encode_file_chunk(&info, &data)?;
            session.send(MessageType::FileChunk, &body).await?;

            let ack_frame = session.recv().await?;
            if ack_frame.message_type != MessageType::FileChunkAck {
                return Err(Error::ProtocolError("expected FILE_CHUNK_ACK".to_string()));
            }
        }

        Ok(())
    }

    /// Number of live (non-terminal) transfers the registry is tracking,
    /// for diagnostics.
    #[must_use]
    pub fn active_transfer_count(&self) -> usize {
        self.registry.len()
    }

    /// Current lifecycle status of a tracked transfer, for diagnostics and
    /// an embedder's UI. `None` if no record exists (never announced, or
    /// already swept away).
    #[must_use]
    pub fn transfer_status(&self, transfer_id: Uuid) -> Option<TransferStatus> {
        self.registry.get(transfer_id).map(|record| record.status)
    }
}
