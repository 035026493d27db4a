//! One-shot PIN-authenticated key agreement between two trusted devices.
//!
//! Runs on its own port, separate from the data connection, and is not
//! framed with the codec's length-prefixed wire format: each field is
//! either fixed-size or prefixed with a single length byte, matching the
//! original pairing handshake this behavior was carried over from. At most
//! one device can be paired at a time; re-pairing overwrites prior state.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::crypto::{self, KEY_SIZE};
use crate::error::{Error, Result};

/// Fixed width of a device id on the wire and on disk.
pub const DEVICE_ID_SIZE: usize = 16;

const PAIR_REQUEST: u8 = 0x01;
const PAIR_SUCCESS: u8 = 0x04;
const PAIR_FAILURE: u8 = 0x05;

const PAIRING_STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// This device's stable identifier: the first 16 bytes of
/// `SHA-256(hostname)`, hex-encoded.
#[must_use]
pub fn local_device_id() -> [u8; DEVICE_ID_SIZE] {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string());
    let digest = crypto::sha256(hostname.as_bytes());
    let mut id = [0u8; DEVICE_ID_SIZE];
    id.copy_from_slice(&digest[..DEVICE_ID_SIZE]);
    id
}

/// A paired device's persisted identity and long-term key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairedDevice {
    /// The peer's device id, hex-encoded.
    pub device_id: String,
    /// The peer's self-reported display name.
    pub device_name: String,
    /// Long-term AEAD key, hex-encoded.
    pub shared_key_hex: String,
    /// When pairing completed.
    pub paired_at: DateTime<Utc>,
    /// Last time a session successfully authenticated with this device.
    pub last_seen: DateTime<Utc>,
}

impl PairedDevice {
    /// Decode `shared_key_hex` back into raw key bytes.
    pub fn shared_key(&self) -> Result<[u8; KEY_SIZE]> {
        let bytes = hex::decode(&self.shared_key_hex)
            .map_err(|e| Error::Serialization(format!("invalid shared_key hex: {e}")))?;
        bytes
            .try_into()
            .map_err(|_| Error::Serialization("shared_key is not 32 bytes".to_string()))
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PairingFile {
    paired_device: Option<PairedDevice>,
}

/// On-disk store for the single paired device.
pub struct PairingStore {
    path: PathBuf,
    paired_device: Option<PairedDevice>,
}

impl PairingStore {
    /// Load `pairing.json` from `path`, or start empty if it does not
    /// exist yet.
    pub async fn load(path: PathBuf) -> Result<Self> {
        if !path.exists() {
            return Ok(Self { path, paired_device: None });
        }

        let bytes = tokio::fs::read(&path).await?;
        let file: PairingFile = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Serialization(format!("malformed pairing.json: {e}")))?;

        Ok(Self {
            path,
            paired_device: file.paired_device,
        })
    }

    /// The current paired device, if any.
    #[must_use]
    pub fn paired_device(&self) -> Option<&PairedDevice> {
        self.paired_device.as_ref()
    }

    /// Whether a device is currently paired.
    #[must_use]
    pub fn is_paired(&self) -> bool {
        self.paired_device.is_some()
    }

    /// Replace the paired device and persist, with file mode `0600` on
    /// Unix. Re-pairing overwrites any prior state.
    pub async fn set_paired_device(&mut self, device: PairedDevice) -> Result<()> {
        self.paired_device = Some(device);
        self.save().await
    }

    /// Update `last_seen` for the currently paired device and persist.
    pub async fn touch_last_seen(&mut self) -> Result<()> {
        if let Some(device) = self.paired_device.as_mut() {
            device.last_seen = Utc::now();
        }
        self.save().await
    }

    async fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = PairingFile {
            paired_device: self.paired_device.clone(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| Error::Serialization(e.to_string()))?;

        tokio::fs::write(&self.path, json.as_bytes()).await?;

        #[cfg(target_os = "linux")]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&self.path, permissions).await?;
        }

        Ok(())
    }
}

fn encode_request(pin: &str, device_id: &[u8; DEVICE_ID_SIZE], device_name: &str, k_c: &[u8; KEY_SIZE]) -> Vec<u8> {
    let pin_bytes = pin.as_bytes();
    let name_bytes = device_name.as_bytes();

    let mut out = Vec::with_capacity(1 + 1 + pin_bytes.len() + DEVICE_ID_SIZE + 1 + name_bytes.len() + KEY_SIZE);
    out.push(PAIR_REQUEST);
    out.push(pin_bytes.len() as u8);
    out.extend_from_slice(pin_bytes);
    out.extend_from_slice(device_id);
    out.push(name_bytes.len() as u8);
    out.extend_from_slice(name_bytes);
    out.extend_from_slice(k_c);
    out
}

struct DecodedRequest {
    pin: String,
    device_id: [u8; DEVICE_ID_SIZE],
    device_name: String,
    k_c: [u8; KEY_SIZE],
}

fn decode_request(data: &[u8]) -> Result<DecodedRequest> {
    if data.is_empty() || data[0] != PAIR_REQUEST {
        return Err(Error::ProtocolError("expected PAIR_REQUEST".to_string()));
    }
    if data.len() < 2 {
        return Err(Error::ProtocolError("truncated PAIR_REQUEST".to_string()));
    }

    let pin_len = data[1] as usize;
    let mut offset = 2;
    if data.len() < offset + pin_len + DEVICE_ID_SIZE + 1 {
        return Err(Error::ProtocolError("truncated PAIR_REQUEST".to_string()));
    }

    let pin = String::from_utf8(data[offset..offset + pin_len].to_vec())
        .map_err(|_| Error::ProtocolError("PAIR_REQUEST pin is not UTF-8".to_string()))?;
    offset += pin_len;

    let mut device_id = [0u8; DEVICE_ID_SIZE];
    device_id.copy_from_slice(&data[offset..offset + DEVICE_ID_SIZE]);
    offset += DEVICE_ID_SIZE;

    let name_len = data[offset] as usize;
    offset += 1;
    if data.len() < offset + name_len + KEY_SIZE {
        return Err(Error::ProtocolError("truncated PAIR_REQUEST".to_string()));
    }

    let device_name = String::from_utf8(data[offset..offset + name_len].to_vec())
        .map_err(|_| Error::ProtocolError("PAIR_REQUEST name is not UTF-8".to_string()))?;
    offset += name_len;

    let mut k_c = [0u8; KEY_SIZE];
    k_c.copy_from_slice(&data[offset..offset + KEY_SIZE]);

    Ok(DecodedRequest { pin, device_id, device_name, k_c })
}

fn encode_success(device_id: &[u8; DEVICE_ID_SIZE], device_name: &str, k_s: &[u8; KEY_SIZE]) -> Vec<u8> {
    let id_hex = hex::encode(device_id);
    let id_bytes = id_hex.as_bytes();
    let name_bytes = device_name.as_bytes();

    let mut out = Vec::with_capacity(1 + 1 + id_bytes.len() + 1 + name_bytes.len() + KEY_SIZE);
    out.push(PAIR_SUCCESS);
    out.push(id_bytes.len() as u8);
    out.extend_from_slice(id_bytes);
    out.push(name_bytes.len() as u8);
    out.extend_from_slice(name_bytes);
    out.extend_from_slice(k_s);
    out
}

fn encode_failure(reason: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + reason.len());
    out.push(PAIR_FAILURE);
    out.extend_from_slice(reason.as_bytes());
    out
}

struct DecodedSuccess {
    device_id_hex: String,
    device_name: String,
    k_s: [u8; KEY_SIZE],
}

fn decode_response(data: &[u8]) -> Result<DecodedSuccess> {
    if data.is_empty() {
        return Err(Error::ProtocolError("empty pairing response".to_string()));
    }
    if data[0] == PAIR_FAILURE {
        let reason = String::from_utf8_lossy(&data[1..]).to_string();
        return Err(Error::AuthFailed(reason));
    }
    if data[0] != PAIR_SUCCESS {
        return Err(Error::ProtocolError("expected PAIR_SUCCESS".to_string()));
    }

    let mut offset = 1;
    let id_len = data[offset] as usize;
    offset += 1;
    let device_id_hex = String::from_utf8(data[offset..offset + id_len].to_vec())
        .map_err(|_| Error::ProtocolError("device id not UTF-8".to_string()))?;
    offset += id_len;

    let name_len = data[offset] as usize;
    offset += 1;
    let device_name = String::from_utf8(data[offset..offset + name_len].to_vec())
        .map_err(|_| Error::ProtocolError("device name not UTF-8".to_string()))?;
    offset += name_len;

    let mut k_s = [0u8; KEY_SIZE];
    k_s.copy_from_slice(&data[offset..offset + KEY_SIZE]);

    Ok(DecodedSuccess { device_id_hex, device_name, k_s })
}

/// Listens once for an incoming pairing request and validates it against a
/// caller-supplied PIN.
pub struct PairingServer {
    listener: TcpListener,
    pin: String,
    our_device_name: String,
}

impl PairingServer {
    /// Bind the pairing port and generate the PIN to display to the user.
    pub async fn bind(addr: std::net::SocketAddr, our_device_name: String) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let pin = crypto::generate_pin();
        Ok(Self { listener, pin, our_device_name })
    }

    /// The PIN to show the user, so it can be entered on the client.
    #[must_use]
    pub fn pin(&self) -> &str {
        &self.pin
    }

    /// Accept exactly one pairing attempt and, on success, return the
    /// freshly paired device record.
    pub async fn accept_once(&self) -> Result<PairedDevice> {
        let (mut socket, _peer) = self.listener.accept().await?;

        let mut buf = vec![0u8; 1024];
        let n = timeout(PAIRING_STEP_TIMEOUT, socket.read(&mut buf))
            .await
            .map_err(|_| Error::Timeout(PAIRING_STEP_TIMEOUT))??;
        buf.truncate(n);

        let request = match decode_request(&buf) {
            Ok(request) => request,
            Err(e) => {
                socket.write_all(&encode_failure("malformed pairing request")).await?;
                return Err(e);
            }
        };

        if !crypto::constant_time_eq(request.pin.as_bytes(), self.pin.as_bytes()) {
            socket.write_all(&encode_failure("invalid PIN")).await?;
            return Err(Error::AuthFailed("invalid PIN".to_string()));
        }

        let our_device_id = local_device_id();
        let k_s = crypto::random_bytes::<KEY_SIZE>();
        socket
            .write_all(&encode_success(&our_device_id, &self.our_device_name, &k_s))
            .await?;

        let shared_key = crypto::xor_key_halves(&k_s, &request.k_c);
        let now = Utc::now();

        Ok(PairedDevice {
            device_id: hex::encode(request.device_id),
            device_name: request.device_name,
            shared_key_hex: hex::encode(shared_key),
            paired_at: now,
            last_seen: now,
        })
    }
}

/// Connects to a waiting [`PairingServer`] and completes the handshake
/// using the PIN the user entered.
pub struct PairingClient;

impl PairingClient {
    /// Pair with the device listening at `addr` using `pin`.
    pub async fn pair_with_pin(
        addr: std::net::SocketAddr,
        pin: &str,
        our_device_name: &str,
    ) -> Result<PairedDevice> {
        let mut socket = timeout(PAIRING_STEP_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout(PAIRING_STEP_TIMEOUT))??;

        let our_device_id = local_device_id();
        let k_c = crypto::random_bytes::<KEY_SIZE>();
        let request = encode_request(pin, &our_device_id, our_device_name, &k_c);

        socket.write_all(&request).await?;

        let mut buf = vec![0u8; 1024];
        let n = timeout(PAIRING_STEP_TIMEOUT, socket.read(&mut buf))
            .await
            .map_err(|_| Error::Timeout(PAIRING_STEP_TIMEOUT))??;
        buf.truncate(n);

        let response = decode_response(&buf)?;
        let shared_key = crypto::xor_key_halves(&response.k_s, &k_c);
        let now = Utc::now();

        Ok(PairedDevice {
            device_id: response.device_id_hex,
            device_name: response.device_name,
            shared_key_hex: hex::encode(shared_key),
            paired_at: now,
            last_seen: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_request_roundtrip() {
        let device_id = local_device_id();
        let k_c = crypto::random_bytes::<KEY_SIZE>();
        let encoded = encode_request("123456", &device_id, "laptop", &k_c);

        let decoded = decode_request(&encoded).unwrap();
        assert_eq!(decoded.pin, "123456");
        assert_eq!(decoded.device_id, device_id);
        assert_eq!(decoded.device_name, "laptop");
        assert_eq!(decoded.k_c, k_c);
    }

    #[test]
    fn test_success_roundtrip() {
        let device_id = local_device_id();
        let k_s = crypto::random_bytes::<KEY_SIZE>();
        let encoded = encode_success(&device_id, "desktop", &k_s);

        let decoded = decode_response(&encoded).unwrap();
        assert_eq!(decoded.device_id_hex, hex::encode(device_id));
        assert_eq!(decoded.device_name, "desktop");
        assert_eq!(decoded.k_s, k_s);
    }

    #[test]
    fn test_failure_response_surfaces_reason() {
        let encoded = encode_failure("invalid PIN");
        let result = decode_response(&encoded);
        assert!(matches!(result, Err(Error::AuthFailed(reason)) if reason == "invalid PIN"));
    }

    #[tokio::test]
    async fn test_full_pairing_handshake_over_loopback() {
        let server = PairingServer::bind("127.0.0.1:0".parse().unwrap(), "server-device".to_string())
            .await
            .unwrap();
        let addr = server.listener.local_addr().unwrap();
        let pin = server.pin().to_string();

        let server_task = tokio::spawn(async move { server.accept_once().await });

        let client_result =
            PairingClient::pair_with_pin(addr, &pin, "client-device").await.unwrap();
        let server_result = server_task.await.unwrap().unwrap();

        assert_eq!(client_result.shared_key_hex, server_result.shared_key_hex);
        assert_eq!(server_result.device_name, "client-device");
        assert_eq!(client_result.device_name, "server-device");
    }

    #[tokio::test]
    async fn test_wrong_pin_rejected() {
        let server = PairingServer::bind("127.0.0.1:0".parse().unwrap(), "server-device".to_string())
            .await
            .unwrap();
        let addr = server.listener.local_addr().unwrap();

        let server_task = tokio::spawn(async move { server.accept_once().await });

        let client_result = PairingClient::pair_with_pin(addr, "000000", "client-device").await;
        assert!(client_result.is_err());

        let server_result = server_task.await.unwrap();
        assert!(server_result.is_err());
    }

    #[tokio::test]
    async fn test_pairing_store_roundtrip_with_0600_permissions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pairing.json");

        let mut store = PairingStore::load(path.clone()).await.unwrap();
        assert!(!store.is_paired());

        let now = Utc::now();
        store
            .set_paired_device(PairedDevice {
                device_id: "abc123".to_string(),
                device_name: "phone".to_string(),
                shared_key_hex: hex::encode([7u8; KEY_SIZE]),
                paired_at: now,
                last_seen: now,
            })
            .await
            .unwrap();

        let reloaded = PairingStore::load(path.clone()).await.unwrap();
        assert!(reloaded.is_paired());
        assert_eq!(reloaded.paired_device().unwrap().device_name, "phone");

        #[cfg(target_os = "linux")]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
    }
}
