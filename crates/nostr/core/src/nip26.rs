//! NIP-26: delegated event signing.
//!
//! A delegator signs `sha256("nostr:delegation:<publisher>:<conditions>")`,
//! allowing `publisher` to sign events that count as the delegator's. The
//! proof travels in the event as `["delegation", delegator, conditions, token]`.
//! Conditions are carried verbatim; interpreting them is left to relays.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::nip01::{
    self, Event, Nip01Error, UnsignedEvent, get_public_key_hex, sha256_hex, sign_id,
    sign_unsigned, verify_signature_hex,
};
use crate::tag_parsing::{find_tag, position_tag, tag_field};

pub const DELEGATION_TAG: &str = "delegation";

#[derive(Debug, Error)]
pub enum Nip26Error {
    #[error(transparent)]
    Event(#[from] Nip01Error),

    #[error("delegation is for {expected}, signing key is {actual}")]
    PublisherMismatch { expected: String, actual: String },
}

pub type Result<T> = std::result::Result<T, Nip26Error>;

/// A signed grant from `pubkey` (delegator) to `publisher_pubkey`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegation {
    pub pubkey: String,
    pub publisher_pubkey: String,
    pub conditions: String,
    pub token: String,
}

/// The string the delegator commits to.
pub fn delegation_commitment(publisher_pubkey: &str, conditions: &str) -> String {
    format!("nostr:delegation:{publisher_pubkey}:{conditions}")
}

/// Sign the SHA-256 of an unsigned token.
pub fn sign_delegation_token(secret_key: &[u8; 32], commitment: &str) -> Result<String> {
    let digest = sha256_hex(commitment.as_bytes());
    Ok(sign_id(secret_key, &digest)?)
}

pub fn create_delegation(
    secret_key: &[u8; 32],
    publisher_pubkey: &str,
    conditions: &str,
) -> Result<Delegation> {
    let pubkey = get_public_key_hex(secret_key)?;
    let commitment = delegation_commitment(publisher_pubkey, conditions);
    let token = sign_delegation_token(secret_key, &commitment)?;

    Ok(Delegation {
        pubkey,
        publisher_pubkey: publisher_pubkey.to_string(),
        conditions: conditions.to_string(),
        token,
    })
}

pub fn delegation_tag(delegation: &Delegation) -> Vec<String> {
    vec![
        DELEGATION_TAG.to_string(),
        delegation.pubkey.clone(),
        delegation.conditions.clone(),
        delegation.token.clone(),
    ]
}

/// Overwrite the first complete delegation tag, or append one.
///
/// Every other tag keeps its position. Extra trailing elements on a replaced
/// tag are preserved.
pub fn upsert_delegation_tag(mut tags: Vec<Vec<String>>, delegation: &Delegation) -> Vec<Vec<String>> {
    match position_tag(&tags, DELEGATION_TAG, 4).and_then(|index| tags.get_mut(index)) {
        Some(tag) => {
            tag[1].clone_from(&delegation.pubkey);
            tag[2].clone_from(&delegation.conditions);
            tag[3].clone_from(&delegation.token);
        }
        None => tags.push(delegation_tag(delegation)),
    }
    tags
}

/// Stamp `delegation` into `event` and sign it as the publisher.
pub fn create_delegation_event(
    publisher_secret_key: &[u8; 32],
    event: UnsignedEvent,
    delegation: &Delegation,
) -> Result<Event> {
    let publisher = get_public_key_hex(publisher_secret_key)?;
    if publisher != delegation.publisher_pubkey {
        return Err(Nip26Error::PublisherMismatch {
            expected: delegation.publisher_pubkey.clone(),
            actual: publisher,
        });
    }

    let unsigned = UnsignedEvent {
        pubkey: delegation.publisher_pubkey.clone(),
        tags: upsert_delegation_tag(event.tags, delegation),
        ..event
    };
    Ok(sign_unsigned(unsigned, publisher_secret_key)?)
}

/// Check the token against the delegator key.
pub fn verify_delegation_token(delegation: &Delegation) -> Result<bool> {
    let commitment = delegation_commitment(&delegation.publisher_pubkey, &delegation.conditions);
    let digest = sha256_hex(commitment.as_bytes());
    Ok(verify_signature_hex(
        &delegation.token,
        &digest,
        &delegation.pubkey,
    )?)
}

/// Read the delegation proof of an event published by `publisher_pubkey`.
pub fn find_delegation(tags: &[Vec<String>], publisher_pubkey: &str) -> Option<Delegation> {
    let tag = find_tag(tags, DELEGATION_TAG, 4)?;
    Some(Delegation {
        pubkey: tag_field(tag, 1)?.to_string(),
        publisher_pubkey: publisher_pubkey.to_string(),
        conditions: tag_field(tag, 2)?.to_string(),
        token: tag_field(tag, 3)?.to_string(),
    })
}

/// Verify a delegated event: the publisher's signature and the delegator's token.
///
/// Events without a delegation tag return `false`.
pub fn verify_delegated_event(event: &Event) -> Result<bool> {
    let Some(delegation) = find_delegation(&event.tags, &event.pubkey) else {
        return Ok(false);
    };
    if !nip01::verify_event(event)? {
        return Ok(false);
    }
    verify_delegation_token(&delegation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nip01::{KIND_SHORT_TEXT_NOTE, get_public_key_hex};

    const DELEGATOR: [u8; 32] = [0x11; 32];
    const PUBLISHER: [u8; 32] = [0x22; 32];

    fn delegation(conditions: &str) -> anyhow::Result<Delegation> {
        let publisher = get_public_key_hex(&PUBLISHER)?;
        Ok(create_delegation(&DELEGATOR, &publisher, conditions)?)
    }

    fn plain_tags() -> Vec<Vec<String>> {
        vec![
            vec!["e".to_string(), "root".to_string()],
            vec!["p".to_string(), "someone".to_string()],
        ]
    }

    #[test]
    fn commitment_template() {
        assert_eq!(
            delegation_commitment("abc", "kind=1&created_at<1700000000"),
            "nostr:delegation:abc:kind=1&created_at<1700000000"
        );
    }

    #[test]
    fn created_delegation_carries_delegator_key() -> anyhow::Result<()> {
        let delegation = delegation("kind=1")?;
        assert_eq!(delegation.pubkey, get_public_key_hex(&DELEGATOR)?);
        assert_eq!(delegation.publisher_pubkey, get_public_key_hex(&PUBLISHER)?);
        assert_eq!(delegation.token.len(), 128);
        assert!(verify_delegation_token(&delegation)?);
        Ok(())
    }

    #[test]
    fn token_does_not_cover_other_conditions() -> anyhow::Result<()> {
        let mut delegation = delegation("kind=1")?;
        delegation.conditions = "kind=0".to_string();
        assert!(!verify_delegation_token(&delegation)?);
        Ok(())
    }

    #[test]
    fn upsert_appends_once() -> anyhow::Result<()> {
        let delegation = delegation("kind=1")?;
        let tags = upsert_delegation_tag(plain_tags(), &delegation);

        assert_eq!(tags.len(), 3);
        assert_eq!(&tags[..2], plain_tags().as_slice());
        assert_eq!(tags[2], delegation_tag(&delegation));
        Ok(())
    }

    #[test]
    fn second_upsert_replaces_in_place() -> anyhow::Result<()> {
        let first = delegation("kind=1")?;
        let second = delegation("kind=7")?;

        let mut tags = plain_tags();
        tags.insert(1, vec!["t".to_string(), "middle".to_string()]);
        let tags = upsert_delegation_tag(tags, &first);
        let tags = upsert_delegation_tag(tags, &second);

        let delegation_tags: Vec<_> = tags.iter().filter(|tag| tag[0] == DELEGATION_TAG).collect();
        assert_eq!(delegation_tags.len(), 1);
        assert_eq!(delegation_tags[0], &delegation_tag(&second));

        let others: Vec<_> = tags.iter().filter(|tag| tag[0] != DELEGATION_TAG).cloned().collect();
        assert_eq!(
            others,
            vec![
                vec!["e".to_string(), "root".to_string()],
                vec!["t".to_string(), "middle".to_string()],
                vec!["p".to_string(), "someone".to_string()],
            ]
        );
        Ok(())
    }

    #[test]
    fn short_delegation_tag_is_not_replaced() -> anyhow::Result<()> {
        let delegation = delegation("kind=1")?;
        let tags = vec![vec![DELEGATION_TAG.to_string(), "incomplete".to_string()]];
        let tags = upsert_delegation_tag(tags, &delegation);

        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0], vec![DELEGATION_TAG.to_string(), "incomplete".to_string()]);
        Ok(())
    }

    #[test]
    fn delegated_event_is_signed_by_publisher() -> anyhow::Result<()> {
        let delegation = delegation("kind=1")?;
        let unsigned = UnsignedEvent {
            pubkey: get_public_key_hex(&DELEGATOR)?,
            created_at: 1_700_000_000,
            kind: KIND_SHORT_TEXT_NOTE,
            tags: plain_tags(),
            content: "on behalf".to_string(),
        };

        let event = create_delegation_event(&PUBLISHER, unsigned, &delegation)?;

        assert_eq!(event.pubkey, delegation.publisher_pubkey);
        assert_eq!(event.id, event.compute_id()?);
        assert!(crate::nip01::verify_event(&event)?);
        assert!(verify_delegated_event(&event)?);
        assert_eq!(find_delegation(&event.tags, &event.pubkey), Some(delegation));
        Ok(())
    }

    #[test]
    fn delegation_event_rejects_wrong_publisher_key() -> anyhow::Result<()> {
        let delegation = delegation("kind=1")?;
        let unsigned = UnsignedEvent {
            pubkey: String::new(),
            created_at: 1,
            kind: KIND_SHORT_TEXT_NOTE,
            tags: vec![],
            content: String::new(),
        };

        let result = create_delegation_event(&DELEGATOR, unsigned, &delegation);
        assert!(matches!(result, Err(Nip26Error::PublisherMismatch { .. })));
        Ok(())
    }

    #[test]
    fn undelegated_event_does_not_verify_as_delegated() -> anyhow::Result<()> {
        let event = crate::nip01::finalize_event(
            &crate::nip01::EventTemplate {
                created_at: 1,
                kind: KIND_SHORT_TEXT_NOTE,
                tags: plain_tags(),
                content: "plain".to_string(),
            },
            &PUBLISHER,
        )?;
        assert!(!verify_delegated_event(&event)?);
        Ok(())
    }
}
