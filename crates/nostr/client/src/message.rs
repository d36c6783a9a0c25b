//! Relay protocol frames.
//!
//! Frames are JSON arrays whose first element selects the interpretation.
//! They are decoded once at the transport boundary into closed enums. Frames
//! the client does not route decode to [`RelayMessage::Ignored`]; routed frames
//! whose payload has the wrong shape decode to [`RelayMessage::Invalid`].

use crate::error::{ClientError, Result};
use nostr::Event;
use serde_json::{Value, json};

/// One or more subscription filters.
///
/// Filters are opaque to the client. A JSON array is treated as a list of
/// filters, any other value as a single filter.
#[derive(Debug, Clone, PartialEq)]
pub struct Filters(Vec<Value>);

impl Filters {
    pub fn into_vec(self) -> Vec<Value> {
        self.0
    }
}

impl From<Value> for Filters {
    fn from(value: Value) -> Self {
        match value {
            Value::Array(filters) => Self(filters),
            filter => Self(vec![filter]),
        }
    }
}

impl From<Vec<Value>> for Filters {
    fn from(filters: Vec<Value>) -> Self {
        Self(filters)
    }
}

/// Frames sent from client to relay.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    /// `["EVENT", event]`
    Event(Event),
    /// `["REQ", subscription_id, filter...]`
    Req {
        subscription_id: String,
        filters: Vec<Value>,
    },
    /// `["CLOSE", subscription_id]`
    Close { subscription_id: String },
}

impl ClientMessage {
    pub fn req(subscription_id: impl Into<String>, filters: impl Into<Filters>) -> Self {
        Self::Req {
            subscription_id: subscription_id.into(),
            filters: filters.into().into_vec(),
        }
    }

    pub fn close(subscription_id: impl Into<String>) -> Self {
        Self::Close {
            subscription_id: subscription_id.into(),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Event(event) => json!(["EVENT", event]),
            Self::Req {
                subscription_id,
                filters,
            } => {
                let mut frame = Vec::with_capacity(filters.len() + 2);
                frame.push(json!("REQ"));
                frame.push(json!(subscription_id));
                frame.extend(filters.iter().cloned());
                Value::Array(frame)
            }
            Self::Close { subscription_id } => json!(["CLOSE", subscription_id]),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_value())?)
    }
}

/// Frames received from a relay.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// `["EVENT", subscription_id, event]`
    Event {
        subscription_id: String,
        event: Event,
    },
    /// `["EOSE", subscription_id]`
    Eose { subscription_id: String },
    /// `["NOTICE", ...]`; everything after the tag.
    Notice(Vec<Value>),
    /// `["OK", ...]`; everything after the tag.
    Ok(Vec<Value>),
    /// Unknown tag or a frame shorter than its tag requires. No handler
    /// fires apart from `message`.
    Ignored,
    /// Routed tag with a malformed payload: an `EVENT` whose subscription id
    /// is not a string or whose payload is not a complete signed event, or an
    /// `EOSE` whose subscription id is not a string. Logged at `warn` and
    /// otherwise handled like [`RelayMessage::Ignored`].
    Invalid(String),
}

impl RelayMessage {
    /// Decode a text frame. Only invalid JSON is an error.
    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|error| ClientError::Protocol(format!("invalid JSON frame: {error}")))?;
        Ok(Self::from_value(value))
    }

    pub fn from_value(value: Value) -> Self {
        let Value::Array(mut frame) = value else {
            return Self::Ignored;
        };
        if frame.len() < 2 {
            return Self::Ignored;
        }
        let rest = frame.split_off(1);
        let Some(tag) = frame.first().and_then(Value::as_str) else {
            return Self::Ignored;
        };

        match tag {
            "EVENT" => decode_event(rest),
            "EOSE" => match rest.first().and_then(Value::as_str) {
                Some(subscription_id) => Self::Eose {
                    subscription_id: subscription_id.to_string(),
                },
                None => Self::Invalid("EOSE subscription id is not a string".to_string()),
            },
            "NOTICE" => Self::Notice(rest),
            "OK" => Self::Ok(rest),
            _ => Self::Ignored,
        }
    }
}

fn decode_event(rest: Vec<Value>) -> RelayMessage {
    let mut fields = rest.into_iter();
    let (Some(subscription_id), Some(payload)) = (fields.next(), fields.next()) else {
        return RelayMessage::Ignored;
    };
    let Value::String(subscription_id) = subscription_id else {
        return RelayMessage::Invalid("EVENT subscription id is not a string".to_string());
    };
    match serde_json::from_value::<Event>(payload) {
        Ok(event) => RelayMessage::Event {
            subscription_id,
            event,
        },
        Err(error) => RelayMessage::Invalid(format!("invalid EVENT payload: {error}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> Event {
        Event {
            id: "id".to_string(),
            pubkey: "pubkey".to_string(),
            created_at: 1,
            kind: 1,
            tags: vec![vec!["t".to_string(), "x".to_string()]],
            content: "hello".to_string(),
            sig: "sig".to_string(),
        }
    }

    #[test]
    fn req_with_single_filter() -> Result<()> {
        let frame = ClientMessage::req("s1", json!({"kinds": [1]})).to_json()?;
        assert_eq!(frame, r#"["REQ","s1",{"kinds":[1]}]"#);
        Ok(())
    }

    #[test]
    fn req_flattens_filter_lists() -> Result<()> {
        let from_array = ClientMessage::req("s2", json!([{"kinds": [0]}, {"authors": ["ab"]}]));
        let from_vec = ClientMessage::req("s2", vec![json!({"kinds": [0]}), json!({"authors": ["ab"]})]);

        let expected = r#"["REQ","s2",{"kinds":[0]},{"authors":["ab"]}]"#;
        assert_eq!(from_array.to_json()?, expected);
        assert_eq!(from_vec.to_json()?, expected);
        Ok(())
    }

    #[test]
    fn close_and_event_frames() -> Result<()> {
        assert_eq!(ClientMessage::close("s1").to_json()?, r#"["CLOSE","s1"]"#);

        let value = ClientMessage::Event(sample_event()).to_value();
        assert_eq!(value[0], json!("EVENT"));
        assert_eq!(value[1]["content"], json!("hello"));
        Ok(())
    }

    #[test]
    fn decode_routed_frames() -> Result<()> {
        let event_frame = serde_json::to_string(&json!(["EVENT", "s1", sample_event()]))?;
        assert_eq!(
            RelayMessage::from_json(&event_frame)?,
            RelayMessage::Event {
                subscription_id: "s1".to_string(),
                event: sample_event(),
            }
        );
        assert_eq!(
            RelayMessage::from_json(r#"["EOSE","s1"]"#)?,
            RelayMessage::Eose {
                subscription_id: "s1".to_string()
            }
        );
        assert_eq!(
            RelayMessage::from_json(r#"["NOTICE","slow down",3]"#)?,
            RelayMessage::Notice(vec![json!("slow down"), json!(3)])
        );
        assert_eq!(
            RelayMessage::from_json(r#"["OK","event-id",true,""]"#)?,
            RelayMessage::Ok(vec![json!("event-id"), json!(true), json!("")])
        );
        Ok(())
    }

    #[test]
    fn decode_ignores_what_it_does_not_route() -> Result<()> {
        let cases = [
            r#"[]"#,
            r#"["EOSE"]"#,
            r#"["EVENT","s1"]"#,
            r#"["AUTH","challenge"]"#,
            r#"[1,2,3]"#,
            r#"{"kind":"EVENT"}"#,
            r#""text""#,
        ];
        for case in cases {
            assert_eq!(RelayMessage::from_json(case)?, RelayMessage::Ignored, "{case}");
        }
        Ok(())
    }

    #[test]
    fn malformed_routed_payloads_are_invalid() -> Result<()> {
        let mut unsigned = serde_json::to_value(sample_event())?;
        if let Value::Object(fields) = &mut unsigned {
            fields.remove("sig");
        }
        let missing_sig = serde_json::to_string(&json!(["EVENT", "s1", unsigned]))?;

        for case in [
            missing_sig.as_str(),
            r#"["EVENT",7,{}]"#,
            r#"["EVENT","s1",{"id":"only"}]"#,
            r#"["EOSE",42]"#,
        ] {
            assert!(
                matches!(RelayMessage::from_json(case)?, RelayMessage::Invalid(_)),
                "{case}"
            );
        }
        Ok(())
    }

    #[test]
    fn invalid_json_is_an_error() {
        let result = RelayMessage::from_json("[\"EVENT\",");
        assert!(matches!(result, Err(ClientError::Protocol(_))));
    }
}
