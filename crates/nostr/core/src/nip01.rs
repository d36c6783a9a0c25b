//! NIP-01: event identity.
//!
//! An event's id is the lowercase hex SHA-256 of its canonical commitment
//! `[0, pubkey, created_at, kind, tags, content]`, and its signature is a
//! BIP-340 Schnorr signature over the 32 id bytes. Every consumer recomputes
//! the same id from the same six fields, so the commitment layout is fixed.

use std::time::{SystemTime, UNIX_EPOCH};

use bitcoin::key::Secp256k1;
use bitcoin::secp256k1::{Keypair, Message, SecretKey, XOnlyPublicKey, schnorr};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors raised while building, signing or checking events.
#[derive(Debug, Error)]
pub enum Nip01Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("invalid secret key: {0}")]
    InvalidSecretKey(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid event id: {0}")]
    InvalidId(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("system clock error: {0}")]
    Clock(String),
}

pub type Result<T> = std::result::Result<T, Nip01Error>;

/// A signed Nostr event as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Lowercase hex SHA-256 of the canonical commitment.
    pub id: String,
    /// Lowercase hex x-only public key of the signer.
    pub pubkey: String,
    /// Unix timestamp in seconds.
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    /// Lowercase hex Schnorr signature over `id`.
    pub sig: String,
}

impl Event {
    /// The identity-bearing fields of this event.
    pub fn unsigned(&self) -> UnsignedEvent {
        UnsignedEvent {
            pubkey: self.pubkey.clone(),
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
        }
    }

    /// Recompute the id from the identity-bearing fields, ignoring `id` and `sig`.
    pub fn compute_id(&self) -> Result<String> {
        get_event_hash(&self.unsigned())
    }
}

/// Event fields that feed the id; everything but `id` and `sig`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl UnsignedEvent {
    /// Attach an id and signature produced elsewhere.
    pub fn into_event(self, id: String, sig: String) -> Event {
        Event {
            id,
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig,
        }
    }
}

/// An event under construction; the pubkey comes from the signing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTemplate {
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

pub const KIND_METADATA: u16 = 0;
pub const KIND_SHORT_TEXT_NOTE: u16 = 1;

/// Seconds since the Unix epoch.
pub fn unix_now_secs() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .map_err(|error| Nip01Error::Clock(error.to_string()))
}

/// Generate a random 32-byte secret key.
pub fn generate_secret_key() -> [u8; 32] {
    loop {
        let mut candidate = [0_u8; 32];
        rand::rng().fill_bytes(&mut candidate);
        if SecretKey::from_slice(&candidate).is_ok() {
            return candidate;
        }
    }
}

/// X-only public key for a secret key.
pub fn get_public_key(secret_key: &[u8; 32]) -> Result<[u8; 32]> {
    let keypair = keypair_from_secret(secret_key)?;
    let (xonly, _parity) = keypair.x_only_public_key();
    Ok(xonly.serialize())
}

pub fn get_public_key_hex(secret_key: &[u8; 32]) -> Result<String> {
    Ok(hex::encode(get_public_key(secret_key)?))
}

/// Canonical commitment: `[0,pubkey,created_at,kind,tags,content]` as compact JSON.
pub fn serialize_event(event: &UnsignedEvent) -> Result<String> {
    let commitment = (
        0_u8,
        &event.pubkey,
        event.created_at,
        event.kind,
        &event.tags,
        &event.content,
    );
    Ok(serde_json::to_string(&commitment)?)
}

/// Event id: SHA-256 of the UTF-8 commitment, lowercase hex.
pub fn get_event_hash(event: &UnsignedEvent) -> Result<String> {
    let commitment = serialize_event(event)?;
    Ok(sha256_hex(commitment.as_bytes()))
}

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Schnorr-sign a hex-encoded 32-byte digest (an event id or a token hash).
pub fn sign_id(secret_key: &[u8; 32], id: &str) -> Result<String> {
    let secp = Secp256k1::signing_only();
    let keypair = keypair_from_secret(secret_key)?;
    let message = message_from_hex(id)?;
    let signature = secp.sign_schnorr_no_aux_rand(&message, &keypair);
    Ok(hex::encode(signature.serialize()))
}

/// Check a Schnorr signature over a hex digest against a hex x-only key.
pub fn verify_signature_hex(signature: &str, id: &str, pubkey: &str) -> Result<bool> {
    let secp = Secp256k1::verification_only();
    let message = message_from_hex(id)?;

    let signature_bytes = hex::decode(signature)?;
    let signature = schnorr::Signature::from_slice(&signature_bytes)
        .map_err(|error| Nip01Error::InvalidSignature(error.to_string()))?;

    let pubkey_bytes = hex::decode(pubkey)?;
    let pubkey = XOnlyPublicKey::from_slice(&pubkey_bytes)
        .map_err(|error| Nip01Error::InvalidPublicKey(error.to_string()))?;

    Ok(secp.verify_schnorr(&signature, &message, &pubkey).is_ok())
}

/// Check `sig` over the event's claimed `id`. The id itself is not recomputed.
pub fn verify_signature(event: &Event) -> Result<bool> {
    verify_signature_hex(&event.sig, &event.id, &event.pubkey)
}

/// Structural check: 64-hex id, 64-hex lowercase pubkey, 128-hex sig.
pub fn validate_event(event: &Event) -> bool {
    is_lower_hex(&event.id, 64) && is_lower_hex(&event.pubkey, 64) && is_lower_hex(&event.sig, 128)
}

/// Full check: structure, recomputed id, and signature.
pub fn verify_event(event: &Event) -> Result<bool> {
    if !validate_event(event) {
        return Ok(false);
    }
    if event.compute_id()? != event.id {
        return Ok(false);
    }
    verify_signature(event)
}

/// Sign a template, producing a complete event.
pub fn finalize_event(template: &EventTemplate, secret_key: &[u8; 32]) -> Result<Event> {
    let unsigned = UnsignedEvent {
        pubkey: get_public_key_hex(secret_key)?,
        created_at: template.created_at,
        kind: template.kind,
        tags: template.tags.clone(),
        content: template.content.clone(),
    };
    sign_unsigned(unsigned, secret_key)
}

pub(crate) fn sign_unsigned(unsigned: UnsignedEvent, secret_key: &[u8; 32]) -> Result<Event> {
    let id = get_event_hash(&unsigned)?;
    let sig = sign_id(secret_key, &id)?;
    Ok(unsigned.into_event(id, sig))
}

pub(crate) fn keypair_from_secret(secret_key: &[u8; 32]) -> Result<Keypair> {
    let secp = Secp256k1::signing_only();
    let secret = SecretKey::from_slice(secret_key)
        .map_err(|error| Nip01Error::InvalidSecretKey(error.to_string()))?;
    Ok(Keypair::from_secret_key(&secp, &secret))
}

fn message_from_hex(id: &str) -> Result<Message> {
    let bytes = hex::decode(id)?;
    let digest: [u8; 32] = bytes.try_into().map_err(|bytes: Vec<u8>| {
        Nip01Error::InvalidId(format!("expected 32 bytes, got {}", bytes.len()))
    })?;
    Ok(Message::from_digest(digest))
}

fn is_lower_hex(value: &str, len: usize) -> bool {
    value.len() == len
        && value
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}
