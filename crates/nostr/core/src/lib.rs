//! Nostr event identity primitives.
//!
//! - NIP-01: canonical commitment, event ids, Schnorr signing and verification
//! - NIP-04: encrypted direct messages (requires `full` feature)
//! - NIP-26: delegated event signing

pub mod nip01;
#[cfg(feature = "full")]
pub mod nip04;
pub mod nip26;
mod tag_parsing;

pub use nip01::{
    Event, EventTemplate, KIND_METADATA, KIND_SHORT_TEXT_NOTE, Nip01Error, UnsignedEvent,
    finalize_event, generate_secret_key, get_event_hash, get_public_key, get_public_key_hex,
    serialize_event, sign_id, unix_now_secs, validate_event, verify_event, verify_signature,
};
#[cfg(feature = "full")]
pub use nip04::{
    ENCRYPTED_DM_KIND, Nip04Error, create_encrypted_dm, decrypt as decrypt_dm_content,
    decrypt_dm, encrypt as encrypt_dm,
};
pub use nip26::{
    DELEGATION_TAG, Delegation, Nip26Error, create_delegation, create_delegation_event,
    delegation_commitment, delegation_tag, find_delegation, sign_delegation_token,
    upsert_delegation_tag, verify_delegated_event, verify_delegation_token,
};
