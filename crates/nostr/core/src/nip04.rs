//! NIP-04: encrypted direct messages.
//!
//! The AES-256 key is the x-coordinate of the ECDH point between the sender's
//! secret key and the recipient's x-only key (lifted with an even-parity
//! prefix). Content is `base64(ciphertext) + "?iv=" + base64(iv)` using
//! CBC with PKCS#7 padding and a random 16-byte IV. The scheme is not
//! authenticated; NIP-44 supersedes it for new designs.

use aes::Aes256;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bitcoin::secp256k1::{PublicKey, SecretKey, ecdh};
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use thiserror::Error;

use crate::nip01::{Event, Nip01Error, UnsignedEvent, get_public_key_hex, sign_unsigned};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

pub const ENCRYPTED_DM_KIND: u16 = 4;
const IV_DELIMITER: &str = "?iv=";
const IV_SIZE: usize = 16;

#[derive(Debug, Error)]
pub enum Nip04Error {
    #[error("invalid secret key: {0}")]
    InvalidSecretKey(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("missing ?iv= delimiter in content")]
    MissingIv,

    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid iv length: expected 16, got {0}")]
    InvalidIvLength(usize),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("decrypted message is not UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error(transparent)]
    Event(#[from] Nip01Error),
}

pub type Result<T> = std::result::Result<T, Nip04Error>;

/// Encrypt `message` from `secret_key` to `recipient_pubkey` (x-only hex).
pub fn encrypt(secret_key: &[u8; 32], recipient_pubkey: &str, message: &str) -> Result<String> {
    let key = shared_key(secret_key, recipient_pubkey)?;
    let mut iv = [0_u8; IV_SIZE];
    rand::rng().fill_bytes(&mut iv);

    let ciphertext = Aes256CbcEnc::new(&key.into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(message.as_bytes());

    Ok(format!(
        "{}{IV_DELIMITER}{}",
        BASE64.encode(ciphertext),
        BASE64.encode(iv)
    ))
}

/// Decrypt `content` sent by `sender_pubkey` to the holder of `secret_key`.
pub fn decrypt(secret_key: &[u8; 32], sender_pubkey: &str, content: &str) -> Result<String> {
    let (ciphertext, iv) = content
        .split_once(IV_DELIMITER)
        .filter(|(ciphertext, iv)| !ciphertext.is_empty() && !iv.is_empty())
        .ok_or(Nip04Error::MissingIv)?;

    let ciphertext = BASE64.decode(ciphertext)?;
    let iv: [u8; IV_SIZE] = BASE64
        .decode(iv)?
        .try_into()
        .map_err(|iv: Vec<u8>| Nip04Error::InvalidIvLength(iv.len()))?;

    let key = shared_key(secret_key, sender_pubkey)?;
    let plaintext = Aes256CbcDec::new(&key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|error| Nip04Error::Decryption(error.to_string()))?;

    Ok(String::from_utf8(plaintext)?)
}

/// Decrypt a DM event addressed to `secret_key`.
///
/// Returns `Ok(None)` when the content does not carry an IV at all.
pub fn decrypt_dm(secret_key: &[u8; 32], event: &Event) -> Result<Option<String>> {
    match decrypt(secret_key, &event.pubkey, &event.content) {
        Ok(message) => Ok(Some(message)),
        Err(Nip04Error::MissingIv) => Ok(None),
        Err(error) => Err(error),
    }
}

/// Build and sign a kind-4 DM event to `recipient_pubkey`.
pub fn create_encrypted_dm(
    secret_key: &[u8; 32],
    recipient_pubkey: &str,
    message: &str,
    created_at: u64,
) -> Result<Event> {
    let unsigned = UnsignedEvent {
        pubkey: get_public_key_hex(secret_key)?,
        created_at,
        kind: ENCRYPTED_DM_KIND,
        tags: vec![vec!["p".to_string(), recipient_pubkey.to_string()]],
        content: encrypt(secret_key, recipient_pubkey, message)?,
    };
    Ok(sign_unsigned(unsigned, secret_key)?)
}

/// Recipient named by the first `p` tag of a DM.
pub fn dm_recipient(event: &Event) -> Option<&str> {
    crate::tag_parsing::find_tag_value(&event.tags, "p")
}

fn shared_key(secret_key: &[u8; 32], pubkey: &str) -> Result<[u8; 32]> {
    let secret = SecretKey::from_slice(secret_key)
        .map_err(|error| Nip04Error::InvalidSecretKey(error.to_string()))?;

    let xonly = hex::decode(pubkey).map_err(|error| Nip04Error::InvalidPublicKey(error.to_string()))?;
    let mut compressed = Vec::with_capacity(33);
    compressed.push(0x02);
    compressed.extend_from_slice(&xonly);
    let point = PublicKey::from_slice(&compressed)
        .map_err(|error| Nip04Error::InvalidPublicKey(error.to_string()))?;

    let shared = ecdh::shared_secret_point(&point, &secret);
    let mut key = [0_u8; 32];
    key.copy_from_slice(&shared[..32]);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE: [u8; 32] = [0x0a; 32];
    const BOB: [u8; 32] = [0x0b; 32];
    const EVE: [u8; 32] = [0x0e; 32];

    #[test]
    fn roundtrip_between_two_keys() -> anyhow::Result<()> {
        let alice_pub = get_public_key_hex(&ALICE)?;
        let bob_pub = get_public_key_hex(&BOB)?;

        for message in ["", "hi", "sixteen byte msg", "héllo wörld 🌍 with a longer body"] {
            let content = encrypt(&ALICE, &bob_pub, message)?;
            assert_eq!(decrypt(&BOB, &alice_pub, &content)?, message);
        }
        Ok(())
    }

    #[test]
    fn content_format_and_fresh_iv() -> anyhow::Result<()> {
        let bob_pub = get_public_key_hex(&BOB)?;
        let first = encrypt(&ALICE, &bob_pub, "same")?;
        let second = encrypt(&ALICE, &bob_pub, "same")?;

        let (ciphertext, iv) = first
            .split_once("?iv=")
            .ok_or_else(|| anyhow::anyhow!("missing delimiter"))?;
        assert_eq!(BASE64.decode(ciphertext)?.len(), 16);
        assert_eq!(BASE64.decode(iv)?.len(), 16);
        assert_ne!(first, second);
        Ok(())
    }

    #[test]
    fn dm_event_roundtrip() -> anyhow::Result<()> {
        let bob_pub = get_public_key_hex(&BOB)?;
        let event = create_encrypted_dm(&ALICE, &bob_pub, "meet at noon", 1_700_000_000)?;

        assert_eq!(event.kind, ENCRYPTED_DM_KIND);
        assert_eq!(dm_recipient(&event), Some(bob_pub.as_str()));
        assert!(crate::nip01::verify_event(&event)?);
        assert_eq!(decrypt_dm(&BOB, &event)?, Some("meet at noon".to_string()));
        Ok(())
    }

    #[test]
    fn content_without_iv_yields_nothing() -> anyhow::Result<()> {
        let mut event = create_encrypted_dm(&ALICE, &get_public_key_hex(&BOB)?, "x", 1)?;
        event.content = "bm9pdg==".to_string();
        assert_eq!(decrypt_dm(&BOB, &event)?, None);

        event.content = "bm9pdg==?iv=".to_string();
        assert_eq!(decrypt_dm(&BOB, &event)?, None);
        Ok(())
    }

    #[test]
    fn third_party_cannot_read() -> anyhow::Result<()> {
        let alice_pub = get_public_key_hex(&ALICE)?;
        let content = encrypt(&ALICE, &get_public_key_hex(&BOB)?, "for bob only")?;

        match decrypt(&EVE, &alice_pub, &content) {
            Ok(plaintext) => assert_ne!(plaintext, "for bob only"),
            Err(error) => assert!(matches!(
                error,
                Nip04Error::Decryption(_) | Nip04Error::Utf8(_)
            )),
        }
        Ok(())
    }

    #[test]
    fn bad_iv_length_is_reported() -> anyhow::Result<()> {
        let alice_pub = get_public_key_hex(&ALICE)?;
        let content = format!("{}?iv={}", BASE64.encode([0_u8; 16]), BASE64.encode([0_u8; 8]));
        assert!(matches!(
            decrypt(&BOB, &alice_pub, &content),
            Err(Nip04Error::InvalidIvLength(8))
        ));
        Ok(())
    }

    #[test]
    fn invalid_recipient_key_is_rejected() {
        assert!(matches!(
            encrypt(&ALICE, "not-hex", "x"),
            Err(Nip04Error::InvalidPublicKey(_))
        ));
    }
}
