//! Per-connection handshake and framed message exchange.
//!
//! A [`Session`] owns one TCP connection from handshake through to close.
//! The handshake establishes whether frames on this connection are
//! AEAD-encrypted; the actual dispatch table (what to do with each message
//! type once established) lives in [`crate::engine`], which has the
//! registry, chunked I/O, and checkpoint store this session's frames act
//! on.

use std::net::SocketAddr;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::codec::{self, Frame, MessageType};
use crate::crypto::{self, KEY_SIZE};
use crate::error::{Error, Result};

/// Random nonce length used in `AUTH_CHALLENGE`.
pub const NONCE_SIZE: usize = 32;

/// Idle timeout for an established session: no frame received in this
/// window closes the connection.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for each individual handshake step.
pub const AUTH_STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Enable TCP keepalive with a short probe interval, matching a LAN
/// deployment where a dead peer should be noticed quickly.
pub fn configure_tcp_keepalive(stream: &TcpStream) -> Result<()> {
    let socket_ref = SockRef::from(stream);

    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(10))
        .with_interval(Duration::from_secs(5));

    socket_ref
        .set_tcp_keepalive(&keepalive)
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;

    Ok(())
}

/// An authenticated (or handshaking) connection, framed per [`crate::codec`].
pub struct Session<S> {
    stream: S,
    session_key: Option<[u8; KEY_SIZE]>,
    peer_addr: Option<SocketAddr>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Server side of the handshake (§4.6, steps 1-3).
    ///
    /// `shared_key` is `None` when no device is paired yet; if
    /// `require_pairing` is also true the connection is refused with
    /// `AUTH_FAILURE` before any challenge is sent.
    pub async fn accept_server(
        mut stream: S,
        peer_addr: Option<SocketAddr>,
        shared_key: Option<[u8; KEY_SIZE]>,
        require_pairing: bool,
    ) -> Result<Self> {
        let Some(key) = shared_key else {
            if require_pairing {
                let body = codec::encode_json(&codec::AuthFailurePayload {
                    reason: "Device not paired".to_string(),
                })?;
                codec::write_frame(&mut stream, MessageType::AuthFailure, &body).await?;
                return Err(Error::NotPaired);
            }
            return Ok(Self { stream, session_key: None, peer_addr });
        };

        let nonce = crypto::random_bytes::<NONCE_SIZE>();
        codec::write_frame(&mut stream, MessageType::AuthChallenge, &nonce).await?;

        let frame = codec::read_frame_with_timeout(&mut stream, None, AUTH_STEP_TIMEOUT).await?;
        if frame.message_type != MessageType::AuthResponse {
            return Err(Error::ProtocolError("expected AUTH_RESPONSE".to_string()));
        }

        let expected = crypto::auth_response(&nonce, &key);
        if !crypto::constant_time_eq(&frame.body, &expected) {
            let body = codec::encode_json(&codec::AuthFailurePayload {
                reason: "authentication response mismatch".to_string(),
            })?;
            codec::write_frame(&mut stream, MessageType::AuthFailure, &body).await?;
            return Err(Error::AuthFailed("response mismatch".to_string()));
        }

        codec::write_frame(&mut stream, MessageType::AuthSuccess, &[]).await?;

        Ok(Self {
            stream,
            session_key: Some(key),
            peer_addr,
        })
    }

    /// Client side of the handshake: read the challenge, answer it, and
    /// expect success.
    pub async fn connect_client(
        mut stream: S,
        peer_addr: Option<SocketAddr>,
        shared_key: [u8; KEY_SIZE],
    ) -> Result<Self> {
        let frame = codec::read_frame_with_timeout(&mut stream, None, AUTH_STEP_TIMEOUT).await?;
        if frame.message_type == MessageType::AuthFailure {
            let payload: codec::AuthFailurePayload = codec::decode_json(&frame.body)
                .unwrap_or(codec::AuthFailurePayload { reason: "unknown".to_string() });
            return Err(Error::AuthFailed(payload.reason));
        }
        if frame.message_type != MessageType::AuthChallenge {
            return Err(Error::ProtocolError("expected AUTH_CHALLENGE".to_string()));
        }

        let response = crypto::auth_response(&frame.body, &shared_key);
        codec::write_frame(&mut stream, MessageType::AuthResponse, &response).await?;

        let result = codec::read_frame_with_timeout(&mut stream, None, AUTH_STEP_TIMEOUT).await?;
        match result.message_type {
            MessageType::AuthSuccess => Ok(Self {
                stream,
                session_key: Some(shared_key),
                peer_addr,
            }),
            MessageType::AuthFailure => {
                let payload: codec::AuthFailurePayload = codec::decode_json(&result.body)
                    .unwrap_or(codec::AuthFailurePayload { reason: "unknown".to_string() });
                Err(Error::AuthFailed(payload.reason))
            }
            _ => Err(Error::ProtocolError("expected AUTH_SUCCESS/AUTH_FAILURE".to_string())),
        }
    }

    /// Whether the handshake completed and frames are now AEAD-encrypted.
    #[must_use]
    pub fn is_established(&self) -> bool {
        self.session_key.is_some()
    }

    /// The peer's address, if known.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Receive the next frame, bounded by [`IDLE_TIMEOUT`].
    pub async fn recv(&mut self) -> Result<Frame> {
        codec::read_frame_with_timeout(&mut self.stream, self.session_key.as_ref(), IDLE_TIMEOUT).await
    }

    /// Send a frame, encrypted if the session is established.
    pub async fn send(&mut self, message_type: MessageType, body: &[u8]) -> Result<()> {
        match self.session_key {
            Some(key) => codec::write_encrypted_frame(&mut self.stream, &key, message_type, body).await,
            None => codec::write_frame(&mut self.stream, message_type, body).await,
        }
    }

    /// Send a ping and expect a reply within `deadline`.
    pub async fn ping(&mut self, deadline: Duration) -> Result<()> {
        self.send(MessageType::Ping, &[]).await?;
        let frame = timeout(deadline, self.recv())
            .await
            .map_err(|_| Error::Timeout(deadline))??;
        if frame.message_type != MessageType::Pong {
            return Err(Error::ProtocolError("expected PONG".to_string()));
        }
        Ok(())
    }

    /// Split back into the underlying stream, discarding session state.
    pub fn into_inner(self) -> S {
        self.stream
    }
}
