//! # Clipbridge Core Library
//!
//! `clipbridge-core` provides the sync engine for Clipbridge, a peer-to-peer
//! LAN clipboard bridge between two trusted devices.
//!
//! ## Features
//!
//! - **Length-framed, AEAD-encrypted transport**: every frame after pairing
//!   is confidential and authenticated (AES-256-GCM).
//! - **Lazy transfer**: announce metadata first, stream chunks on request,
//!   so a receiver only pulls the files it actually pastes.
//! - **Resumable downloads**: a persisted checkpoint lets an interrupted
//!   receive continue from its last acknowledged chunk.
//! - **One-shot pairing**: a 6-digit PIN bootstraps a long-term shared key;
//!   no PKI, no certificates.
//!
//! ## Modules
//!
//! Clipboard monitoring and injection are not part of this crate - they are
//! the embedding application's responsibility.
//!
//! - [`codec`] - length-framed wire protocol, AEAD encrypt/decrypt, JSON
//!   sub-payload parsing
//! - [`chunked_io`] - chunked file reader/writer with MD5 verification
//! - [`registry`] - in-memory table of in-flight transfers
//! - [`checkpoint`] - durable per-transfer progress and retry accounting
//! - [`pairing`] - PIN-authenticated key agreement between two devices
//! - [`session`] - per-connection handshake and message dispatch loop
//! - [`engine`] - the public sync engine API
//! - [`config`] - settings loaded from a platform-appropriate config file
//! - [`error`] - the unified error type
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use clipbridge_core::config::Config;
//! use clipbridge_core::engine::{NoopCallbacks, StaticPeerResolver, SyncEngine};
//!
//! let config = Config::load().await?;
//! let peer = Arc::new(StaticPeerResolver("192.168.1.42:9876".parse()?));
//! let engine = SyncEngine::new(config, peer, Arc::new(NoopCallbacks)).await?;
//!
//! engine.send_text("hello from my laptop").await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::unused_async)]
#![allow(clippy::len_without_is_empty)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::derivable_impls)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::unused_self)]
#![allow(clippy::missing_errors_doc)]

pub mod checkpoint;
pub mod chunked_io;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod pairing;
pub mod registry;
pub mod session;

pub use error::{Error, Result};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Wire protocol version `(major, minor)`.
pub const PROTOCOL_VERSION: (u8, u8) = (1, 0);

/// Default TCP port for the data connection (transfers, text, handshake).
pub const DEFAULT_DATA_PORT: u16 = 9876;

/// Default TCP port for the one-shot pairing handshake.
pub const DEFAULT_PAIRING_PORT: u16 = 9877;

/// Default chunk size for chunked file transfer: 1 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Hard ceiling on a single wire frame: 128 MiB.
pub const MAX_FRAME_SIZE: usize = 128 * 1024 * 1024;

/// Hard ceiling on the parser's receive buffer before the connection is
/// dropped: 256 MiB.
pub const MAX_RECEIVE_BUFFER: usize = 256 * 1024 * 1024;

/// Default ceiling on a single file within a bundle: 100 MiB.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Default ceiling on the total size of an announced or direct-sent bundle:
/// 500 MiB.
pub const DEFAULT_MAX_TOTAL_SIZE: u64 = 500 * 1024 * 1024;

/// Window within which an identical text/file send is silently dropped.
pub const LOOP_SUPPRESSION_WINDOW: std::time::Duration = std::time::Duration::from_secs(2);

/// Registry expiry sweep period, in seconds.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Horizon after which terminal registry records are purged, in seconds.
pub const DEFAULT_CLEANUP_MAX_AGE_SECS: u64 = 60 * 60;
