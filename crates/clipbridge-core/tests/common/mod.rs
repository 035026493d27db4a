//! Common test utilities for `clipbridge-core` integration tests.
//!
//! These build a [`SyncEngine`] pair that is paired without running the
//! real PIN handshake (a matching [`PairedDevice`] is written directly into
//! each side's [`PairingStore`]) and bound to deterministic, non-colliding
//! ports so the tests can run concurrently.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use chrono::Utc;
use clipbridge_core::checkpoint::CheckpointStore;
use clipbridge_core::config::Config;
use clipbridge_core::crypto::KEY_SIZE;
use clipbridge_core::engine::{EngineCallbacks, StaticPeerResolver, SyncEngine};
use clipbridge_core::pairing::{PairedDevice, PairingStore};
use clipbridge_core::registry::Registry;

/// Base port for tests, incremented for each engine to avoid conflicts
/// between parallel tests.
static TEST_PORT_COUNTER: AtomicU16 = AtomicU16::new(54200);

/// Get a unique port for a test engine.
pub fn get_test_port() -> u16 {
    TEST_PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Build a [`SyncEngine`] listening on `port`, pre-paired with a peer at
/// `peer_addr` using `shared_key_hex`, backed by a fresh tempdir for its
/// checkpoint and pairing stores.
pub async fn build_engine(
    dir: &std::path::Path,
    port: u16,
    peer_addr: SocketAddr,
    shared_key_hex: &str,
    callbacks: Arc<dyn EngineCallbacks>,
) -> Arc<SyncEngine> {
    build_engine_with_chunk_size(dir, port, peer_addr, shared_key_hex, callbacks, clipbridge_core::DEFAULT_CHUNK_SIZE).await
}

/// Like [`build_engine`], but with an explicit chunk size - useful for
/// forcing a transfer to span multiple chunks in a test.
pub async fn build_engine_with_chunk_size(
    dir: &std::path::Path,
    port: u16,
    peer_addr: SocketAddr,
    shared_key_hex: &str,
    callbacks: Arc<dyn EngineCallbacks>,
    chunk_size: usize,
) -> Arc<SyncEngine> {
    let mut config = Config::default();
    config.port = port;
    config.require_pairing = true;
    config.chunk_timeout_secs = 5;
    config.chunk_size = chunk_size;

    let checkpoint = CheckpointStore::open(dir.join("checkpoints"), config.retry_policy.to_retry_policy())
        .await
        .expect("open checkpoint store");

    let mut pairing = PairingStore::load(dir.join("pairing.json")).await.expect("load pairing store");
    let now = Utc::now();
    pairing
        .set_paired_device(PairedDevice {
            device_id: "peer".to_string(),
            device_name: "peer-device".to_string(),
            shared_key_hex: shared_key_hex.to_string(),
            paired_at: now,
            last_seen: now,
        })
        .await
        .expect("set paired device");

    let engine = SyncEngine::from_parts(
        config,
        Registry::new(),
        checkpoint,
        pairing,
        Arc::new(StaticPeerResolver(peer_addr)),
        callbacks,
    )
    .expect("build engine");

    Arc::new(engine)
}

/// A fresh random shared key, hex-encoded, for pairing two test engines.
pub fn random_shared_key_hex() -> String {
    hex::encode(clipbridge_core::crypto::random_bytes::<KEY_SIZE>())
}
