//! End-to-end lazy-transfer tests over a real loopback `TcpListener`/
//! `TcpStream` pair: one or both sides run [`SyncEngine::serve`] and the
//! other dials in, exercising expiry and mid-stream cancellation exactly as
//! an embedding application would.

mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clipbridge_core::codec::{self, MessageType};
use clipbridge_core::engine::{EngineCallbacks, NoopCallbacks};
use clipbridge_core::registry::TransferStatus;
use clipbridge_core::session::Session;
use tokio::net::TcpStream;
use uuid::Uuid;

use common::{build_engine, build_engine_with_chunk_size, get_test_port, random_shared_key_hex};

/// Craft and deliver a `FILE_ANNOUNCE` frame directly over the wire to
/// `addr`, bypassing `SyncEngine::announce_files` so the test can control
/// `expires_at` and `chunk_size`, which the engine's own announce path
/// always sets to `0` / the configured default.
async fn send_raw_announce(
    addr: std::net::SocketAddr,
    shared_key: &[u8; clipbridge_core::crypto::KEY_SIZE],
    metadata: &clipbridge_core::chunked_io::TransferMetadata,
) {
    let stream = TcpStream::connect(addr).await.expect("connect for raw announce");
    let mut session = Session::connect_client(stream, Some(addr), *shared_key)
        .await
        .expect("handshake for raw announce");

    let body = codec::encode_json(metadata).expect("encode announce metadata");
    session
        .send(MessageType::FileAnnounce, &body)
        .await
        .expect("send FILE_ANNOUNCE");

    // Give the receiving engine's dispatch loop a moment to register it.
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn sample_metadata(
    transfer_id: Uuid,
    expires_at: i64,
    chunk_size: usize,
    size: u64,
) -> clipbridge_core::chunked_io::TransferMetadata {
    clipbridge_core::chunked_io::TransferMetadata {
        files: vec![clipbridge_core::chunked_io::FileInfo {
            name: "payload.bin".to_string(),
            size,
            checksum_md5_hex: String::new(),
            is_directory: false,
            relative_path: "payload.bin".to_string(),
            file_index: 0,
        }],
        total_size: size,
        timestamp: chrono::Utc::now().timestamp(),
        source_os: "linux".to_string(),
        transfer_id,
        expires_at,
        chunk_size,
    }
}

/// Scenario 4: a receiver that waits past `expires_at` and then calls
/// `request_transfer` gets `Ok(None)` without ever dialing the peer, and
/// the record is flipped to `Expired`.
#[tokio::test]
async fn test_request_transfer_after_expiry_returns_none() {
    let receiver_dir = tempfile::tempdir().unwrap();
    let receiver_port = get_test_port();
    let key_hex = random_shared_key_hex();
    let key: [u8; clipbridge_core::crypto::KEY_SIZE] =
        hex::decode(&key_hex).unwrap().try_into().unwrap();

    // peer_addr on the receiver engine is never dialed successfully in this
    // test (there is no listener there); that is the point - an expired
    // record must short-circuit before any dial is attempted.
    let dead_peer_addr: std::net::SocketAddr = "127.0.0.1:1".parse().unwrap();
    let receiver = build_engine(
        receiver_dir.path(),
        receiver_port,
        dead_peer_addr,
        &key_hex,
        Arc::new(NoopCallbacks),
    )
    .await;

    let (_shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let serve_engine = Arc::clone(&receiver);
    let serve_task = tokio::spawn(async move {
        let _ = serve_engine
            .serve(async {
                let _ = shutdown_rx.await;
            })
            .await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let transfer_id = Uuid::new_v4();
    let announce_addr: std::net::SocketAddr = format!("127.0.0.1:{receiver_port}").parse().unwrap();
    let expired_at = chrono::Utc::now().timestamp() - 5;
    let metadata = sample_metadata(transfer_id, expired_at, 64 * 1024, 10);
    send_raw_announce(announce_addr, &key, &metadata).await;

    assert_eq!(receiver.transfer_status(transfer_id), Some(TransferStatus::Pending));

    let result = receiver.request_transfer(transfer_id, Some(receiver_dir.path().join("out"))).await;
    assert!(matches!(result, Ok(None)), "expected Ok(None), got {result:?}");
    assert_eq!(receiver.transfer_status(transfer_id), Some(TransferStatus::Expired));

    serve_task.abort();
}

struct CountingCallbacks {
    progress_events: AtomicU64,
}

impl EngineCallbacks for CountingCallbacks {
    fn on_transfer_progress(&self, _transfer_id: Uuid, _bytes_done: u64, _bytes_total: u64, _current_file_name: &str) {
        self.progress_events.fetch_add(1, Ordering::SeqCst);
    }
}

/// Scenario 5: cancelling mid-stream stops the request within one chunk
/// period, flips both sides' registry to `Cancelled`, removes the
/// receiver's partial temp file, and halts the sender's serve loop instead
/// of streaming the rest of the file.
#[tokio::test]
async fn test_cancel_mid_stream_stops_both_sides() {
    let sender_dir = tempfile::tempdir().unwrap();
    let receiver_dir = tempfile::tempdir().unwrap();
    let sender_port = get_test_port();
    let receiver_port = get_test_port();
    let key_hex = random_shared_key_hex();

    let sender_addr: std::net::SocketAddr = format!("127.0.0.1:{sender_port}").parse().unwrap();
    let receiver_addr: std::net::SocketAddr = format!("127.0.0.1:{receiver_port}").parse().unwrap();

    // Small chunks and a large file so the chunk-by-chunk request/ack round
    // trip takes long enough that the cancel lands mid-stream rather than
    // racing a transfer that has already finished.
    let chunk_size = 1024;
    let receiver_progress = Arc::new(CountingCallbacks { progress_events: AtomicU64::new(0) });
    let sender = build_engine_with_chunk_size(
        sender_dir.path(),
        sender_port,
        receiver_addr,
        &key_hex,
        Arc::new(NoopCallbacks),
        chunk_size,
    )
    .await;
    let receiver = build_engine_with_chunk_size(
        receiver_dir.path(),
        receiver_port,
        sender_addr,
        &key_hex,
        Arc::clone(&receiver_progress) as Arc<dyn EngineCallbacks>,
        chunk_size,
    )
    .await;

    let (sender_shutdown_tx, sender_shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let (receiver_shutdown_tx, receiver_shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let serve_sender = Arc::clone(&sender);
    let sender_task = tokio::spawn(async move {
        let _ = serve_sender
            .serve(async {
                let _ = sender_shutdown_rx.await;
            })
            .await;
    });
    let serve_receiver = Arc::clone(&receiver);
    let receiver_task = tokio::spawn(async move {
        let _ = serve_receiver
            .serve(async {
                let _ = receiver_shutdown_rx.await;
            })
            .await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let file_size = (chunk_size * 4000) as u64;
    let source_path = sender_dir.path().join("payload.bin");
    tokio::fs::write(&source_path, vec![0xABu8; file_size as usize]).await.unwrap();

    let transfer_id = sender.announce_files(vec![source_path.clone()]).await.expect("announce");
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(receiver.transfer_status(transfer_id), Some(TransferStatus::Pending));

    let request_receiver = Arc::clone(&receiver);
    let dest_dir = receiver_dir.path().join("out");
    let request_task = tokio::spawn(async move {
        request_receiver.request_transfer(transfer_id, Some(dest_dir)).await
    });

    // Wait for at least one chunk to round-trip before cancelling.
    tokio::time::timeout(Duration::from_secs(5), async {
        while receiver_progress.progress_events.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("no chunk progress observed before timeout");

    assert!(receiver.cancel_transfer(transfer_id, "user cancelled").await);

    let result = tokio::time::timeout(Duration::from_secs(5), request_task)
        .await
        .expect("request_transfer task did not finish within one chunk period")
        .expect("request_transfer task panicked");
    assert!(matches!(result, Ok(None)), "expected Ok(None), got {result:?}");

    assert_eq!(receiver.transfer_status(transfer_id), Some(TransferStatus::Cancelled));

    // The sender's FILE_REQUEST-serving loop must have observed the
    // TRANSFER_CANCEL and halted rather than streaming to completion.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sender.transfer_status(transfer_id), Some(TransferStatus::Cancelled));

    let leftover_temp = receiver_dir.path().join("out").join(".payload.bin.tmp");
    assert!(!leftover_temp.exists(), "partial temp file should have been cleaned up on cancel");
    let final_path = receiver_dir.path().join("out").join("payload.bin");
    assert!(!final_path.exists(), "cancelled transfer should not produce a finished file");

    sender_task.abort();
    receiver_task.abort();
    let _ = sender_shutdown_tx.send(());
    let _ = receiver_shutdown_tx.send(());
}
