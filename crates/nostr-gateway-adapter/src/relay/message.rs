/*
[INPUT]:  Raw relay frames and subscription filters
[OUTPUT]: Typed NIP-01 client/relay messages and filter matching
[POS]:    Relay layer - wire codec
[UPDATE]: When supporting additional relay message types
*/

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::http::{GatewayError, Result};
use crate::types::{EventId, Kind, PublicKey, SignedEvent};

/// NIP-01 subscription filter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<EventId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<PublicKey>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kinds: Vec<Kind>,
    #[serde(rename = "#p", default, skip_serializing_if = "Vec::is_empty")]
    pub p_tags: Vec<PublicKey>,
    #[serde(rename = "#e", default, skip_serializing_if = "Vec::is_empty")]
    pub e_tags: Vec<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: EventId) -> Self {
        self.ids.push(id);
        self
    }

    pub fn author(mut self, author: PublicKey) -> Self {
        self.authors.push(author);
        self
    }

    pub fn kind(mut self, kind: Kind) -> Self {
        self.kinds.push(kind);
        self
    }

    pub fn pubkey_tag(mut self, pubkey: PublicKey) -> Self {
        self.p_tags.push(pubkey);
        self
    }

    pub fn event_tag(mut self, id: EventId) -> Self {
        self.e_tags.push(id);
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Local evaluation, used by the in-memory relay and to drop stray events.
    pub fn matches(&self, event: &SignedEvent) -> bool {
        if !self.ids.is_empty() && !self.ids.contains(&event.id) {
            return false;
        }
        if !self.authors.is_empty() && !self.authors.contains(&event.pubkey) {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        if !self.p_tags.is_empty()
            && !event
                .tags_named("p")
                .filter_map(|tag| tag.get(1))
                .any(|value| self.p_tags.iter().any(|p| p.to_hex() == *value))
        {
            return false;
        }
        if !self.e_tags.is_empty()
            && !event
                .tags_named("e")
                .filter_map(|tag| tag.get(1))
                .any(|value| self.e_tags.iter().any(|e| e.to_hex() == *value))
        {
            return false;
        }
        if self.since.is_some_and(|since| event.created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.created_at > until) {
            return false;
        }
        true
    }
}

/// Frames sent to a relay
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Event(SignedEvent),
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    Close(String),
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String> {
        let value = match self {
            ClientMessage::Event(event) => json!(["EVENT", event]),
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut frame = vec![json!("REQ"), json!(subscription_id)];
                for filter in filters {
                    frame.push(serde_json::to_value(filter)?);
                }
                Value::Array(frame)
            }
            ClientMessage::Close(subscription_id) => json!(["CLOSE", subscription_id]),
        };
        Ok(value.to_string())
    }
}

/// Frames received from a relay
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event {
        subscription_id: String,
        event: Box<SignedEvent>,
    },
    Ok {
        event_id: EventId,
        accepted: bool,
        message: String,
    },
    EndOfStoredEvents(String),
    Closed {
        subscription_id: String,
        message: String,
    },
    Notice(String),
    Auth(String),
}

impl RelayMessage {
    pub fn from_json(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)?;
        let frame = value
            .as_array()
            .ok_or_else(|| GatewayError::InvalidResponse("relay frame is not an array".into()))?;
        let label = frame
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::InvalidResponse("relay frame without label".into()))?;

        let text = |index: usize| -> Result<String> {
            frame
                .get(index)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    GatewayError::InvalidResponse(format!("{label} frame missing field {index}"))
                })
        };

        match label {
            "EVENT" => {
                let event = frame
                    .get(2)
                    .cloned()
                    .ok_or_else(|| GatewayError::InvalidResponse("EVENT frame without event".into()))?;
                Ok(RelayMessage::Event {
                    subscription_id: text(1)?,
                    event: Box::new(serde_json::from_value(event)?),
                })
            }
            "OK" => Ok(RelayMessage::Ok {
                event_id: EventId::from_hex(&text(1)?)?,
                accepted: frame.get(2).and_then(Value::as_bool).unwrap_or(false),
                message: text(3).unwrap_or_default(),
            }),
            "EOSE" => Ok(RelayMessage::EndOfStoredEvents(text(1)?)),
            "CLOSED" => Ok(RelayMessage::Closed {
                subscription_id: text(1)?,
                message: text(2).unwrap_or_default(),
            }),
            "NOTICE" => Ok(RelayMessage::Notice(text(1)?)),
            "AUTH" => Ok(RelayMessage::Auth(text(1)?)),
            other => Err(GatewayError::InvalidResponse(format!(
                "unknown relay frame {other}"
            ))),
        }
    }
}
