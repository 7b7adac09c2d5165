//! src/wire.rs
//!
//! Consolidates the node-to-node wire format: the gossip message record, the
//! bootstrap handshake records, the framed envelope that carries them, and
//! the cluster-secret message authentication code. This module is the single
//! source of truth for what travels between peers.

use crate::error::{Error, Result};
use hmac::{Hmac, Mac};
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use sha2::Sha256;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

/// Header under which the HTTP collaborator carries the same hex signature
/// that rides in the wire envelope here.
pub const SIGNATURE_HEADER: &str = "X-Repram-Signature";

// --- Gossip message record ---

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    Put,
    Ping,
    Pong,
    Sync,
    Ack,
}

/// A peer description as carried on the wire in SYNC/PONG messages and in
/// bootstrap responses.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    pub address: String,
    pub port: u16,
    pub http_port: u16,
    #[serde(default = "default_enclave", deserialize_with = "enclave_or_default")]
    pub enclave: String,
}

impl NodeInfo {
    /// The `host:port` gossip address this description points at.
    pub fn gossip_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

pub fn default_enclave() -> String {
    "default".to_string()
}

// Older nodes sent an empty enclave tag; it means "default" on the wire.
fn enclave_or_default<'de, D>(de: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(de)?;
    Ok(if s.is_empty() { default_enclave() } else { s })
}

/// The gossip wire unit. Optional fields are omitted from the record when
/// absent; which ones are present depends on `type`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
    /// TTL in whole seconds (PUT only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u32>,
    /// Sender clock, Unix seconds.
    pub timestamp: i64,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_info: Option<NodeInfo>,
}

impl Message {
    pub fn put(from: &str, key: &str, data: Vec<u8>, ttl: Duration, message_id: String) -> Self {
        Self {
            kind: MessageType::Put,
            from: from.to_string(),
            to: None,
            key: Some(key.to_string()),
            data: Some(data),
            ttl: Some(ttl.as_secs() as u32),
            timestamp: unix_now(),
            message_id,
            node_info: None,
        }
    }

    pub fn ping(from: &str, to: &str, info: NodeInfo, message_id: String) -> Self {
        Self {
            kind: MessageType::Ping,
            from: from.to_string(),
            to: Some(to.to_string()),
            key: None,
            data: None,
            ttl: None,
            timestamp: unix_now(),
            message_id,
            node_info: Some(info),
        }
    }

    pub fn pong(from: &str, to: &str, info: NodeInfo, message_id: String) -> Self {
        Self {
            kind: MessageType::Pong,
            from: from.to_string(),
            to: Some(to.to_string()),
            key: None,
            data: None,
            ttl: None,
            timestamp: unix_now(),
            message_id,
            node_info: Some(info),
        }
    }

    pub fn sync(from: &str, to: Option<&str>, info: NodeInfo, message_id: String) -> Self {
        Self {
            kind: MessageType::Sync,
            from: from.to_string(),
            to: to.map(str::to_string),
            key: None,
            data: None,
            ttl: None,
            timestamp: unix_now(),
            message_id,
            node_info: Some(info),
        }
    }

    /// An acknowledgement carries the acknowledged PUT's `message_id` so the
    /// originator can correlate it with its pending write.
    pub fn ack(from: &str, to: &str, key: Option<String>, put_message_id: &str) -> Self {
        Self {
            kind: MessageType::Ack,
            from: from.to_string(),
            to: Some(to.to_string()),
            key,
            data: None,
            ttl: None,
            timestamp: unix_now(),
            message_id: put_message_id.to_string(),
            node_info: None,
        }
    }
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_secs() as i64
}

/// Generator for message ids that are globally unique per sender:
/// `<node_id>-<unix millis>-<monotonic counter>`.
pub struct MessageIds {
    node_id: String,
    counter: AtomicU64,
}

impl MessageIds {
    pub fn new(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn next(&self) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before Unix epoch")
            .as_millis() as u64;
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}-{}", self.node_id, millis, n)
    }
}

// --- Bootstrap handshake records ---

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapRequest {
    pub node_id: String,
    pub address: String,
    pub gossip_port: u16,
    pub http_port: u16,
    #[serde(default = "default_enclave", deserialize_with = "enclave_or_default")]
    pub enclave: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapResponse {
    pub success: bool,
    pub peers: Vec<NodeInfo>,
}

// --- Message authentication ---

/// Keyed MAC for the wire. Holds no key in open mode (empty cluster secret),
/// in which case outbound messages are unsigned and inbound signatures are
/// not required.
#[derive(Clone)]
pub struct WireMac {
    secret: Option<Vec<u8>>,
}

impl WireMac {
    pub fn new(cluster_secret: &str) -> Self {
        let secret = if cluster_secret.is_empty() {
            None
        } else {
            Some(cluster_secret.as_bytes().to_vec())
        };
        Self { secret }
    }

    pub fn open_mode(&self) -> bool {
        self.secret.is_none()
    }

    /// Hex-encoded HMAC-SHA-256 over the message body, or `None` in open mode.
    pub fn sign(&self, body: &[u8]) -> Option<String> {
        let secret = self.secret.as_ref()?;
        let mut mac =
            HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any length");
        mac.update(body);
        Some(hex::encode(mac.finalize().into_bytes()))
    }

    /// Verifies an inbound signature against the body. With a configured
    /// secret, unsigned or mis-signed messages are `Forbidden`; in open mode
    /// every message is accepted.
    pub fn verify(&self, body: &[u8], signature: Option<&str>) -> Result<()> {
        let Some(secret) = self.secret.as_ref() else {
            return Ok(());
        };
        let signature = signature.ok_or(Error::Forbidden)?;
        let expected = hex::decode(signature).map_err(|_| Error::Forbidden)?;
        let mut mac =
            HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any length");
        mac.update(body);
        mac.verify_slice(&expected).map_err(|_| Error::Forbidden)
    }
}

// --- Wire envelope ---

/// The framed unit actually written to a stream: the self-describing JSON
/// record plus its signature. The envelope itself is bincode-framed.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub signature: Option<String>,
    pub body: Vec<u8>,
}

impl Envelope {
    /// Serializes `record`, signs it, and frames the result for the wire.
    pub fn seal<T: Serialize>(record: &T, mac: &WireMac) -> Result<Vec<u8>> {
        let body = serde_json::to_vec(record)?;
        let signature = mac.sign(&body);
        Ok(bincode::serialize(&Envelope { signature, body })?)
    }

    /// Unframes wire bytes, verifies the signature, and decodes the record.
    /// Verification failures reject the message before any state is touched.
    pub fn open<T: DeserializeOwned>(bytes: &[u8], mac: &WireMac) -> Result<T> {
        let envelope: Envelope = bincode::deserialize(bytes)?;
        mac.verify(&envelope.body, envelope.signature.as_deref())?;
        Ok(serde_json::from_slice(&envelope.body)?)
    }
}

// --- Unit Tests ---
