use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize, Serializer};

use crate::error::MessageError;
use crate::keyspace::{COUNTERS_KEY, MESSAGE_PREFIX};

/// Caller-supplied identifier of a message.
///
/// Doubles as the deduplication key: two submissions sharing an id are the
/// same message as far as the relay is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of an individual recipient.
///
/// Recipient ids are used as storage keys, so they can never be empty,
/// equal to the counters key or fall inside the message namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RecipientId(String);

impl RecipientId {
    pub fn parse(id: impl Into<String>) -> Result<Self, InvalidRecipient> {
        let id = id.into();
        if id.is_empty() || id == COUNTERS_KEY || id.starts_with(MESSAGE_PREFIX) {
            return Err(InvalidRecipient { id });
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecipientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A recipient id collided with a reserved key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("recipient id {id:?} is empty or collides with a reserved key")]
pub struct InvalidRecipient {
    pub id: String,
}

/// Tag naming a delivery channel, e.g. `email` or `sms`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelType(pub String);

impl ChannelType {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelType {
    fn from(tag: &str) -> Self {
        Self(tag.to_string())
    }
}

/// Abstract addressee of a message.
///
/// A recipient resolver registered under `kind` turns `(scope, group)` into
/// concrete recipient ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTarget {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(alias = "environment", default, skip_serializing_if = "String::is_empty")]
    pub scope: String,

    #[serde(rename = "id")]
    pub group: String,
}

impl MessageTarget {
    pub fn new(kind: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            scope: String::new(),
            group: group.into(),
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }
}

/// Inbound notification.
///
/// Never mutated once built. A zero `ttl` means the message is not written
/// to the deduplication ledger.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: MessageId,
    pub subject: String,
    #[serde(rename = "message")]
    pub body: String,
    #[serde(rename = "validity", serialize_with = "serialize_ttl")]
    pub ttl: Duration,
    pub target: MessageTarget,
}

#[derive(Deserialize)]
struct MessageWire {
    #[serde(default)]
    id: String,
    #[serde(default)]
    subject: String,
    #[serde(alias = "body", default)]
    message: String,
    #[serde(alias = "ttl", default)]
    validity: Option<String>,
    target: MessageTarget,
}

impl Message {
    pub fn new(
        id: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
        target: MessageTarget,
    ) -> Self {
        Self {
            id: MessageId(id.into()),
            subject: subject.into(),
            body: body.into(),
            ttl: Duration::ZERO,
            target,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Decode an inbound submission.
    pub fn from_json(payload: &[u8]) -> Result<Self, MessageError> {
        let wire: MessageWire = serde_json::from_slice(payload).map_err(MessageError::Malformed)?;

        if wire.id.is_empty() {
            return Err(MessageError::MissingId);
        }

        let ttl = match wire.validity.as_deref() {
            Some(value) => parse_ttl(value)?,
            None => Duration::ZERO,
        };

        Ok(Self {
            id: MessageId(wire.id),
            subject: wire.subject,
            body: wire.message,
            ttl,
            target: wire.target,
        })
    }
}

/// Parse a duration string such as `24h`, `90m` or `1h 30m`.
///
/// Empty strings and a bare `0` are accepted as zero.
pub fn parse_ttl(value: &str) -> Result<Duration, MessageError> {
    let value = value.trim();
    if value.is_empty() || value == "0" {
        return Ok(Duration::ZERO);
    }
    humantime::parse_duration(value).map_err(|_| MessageError::InvalidTtl {
        value: value.to_string(),
    })
}

fn serialize_ttl<S: Serializer>(ttl: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&humantime::format_duration(*ttl))
}

/// Per-recipient mapping of channel type to address.
///
/// Updates replace the whole mapping; there is no per-field patching.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    #[serde(default)]
    pub addresses: BTreeMap<ChannelType, String>,
}

impl Subscription {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_address(mut self, channel: impl Into<ChannelType>, address: impl Into<String>) -> Self {
        self.addresses.insert(channel.into(), address.into());
        self
    }

    pub fn address(&self, channel: &ChannelType) -> Option<&str> {
        self.addresses
            .get(channel)
            .map(String::as_str)
            .filter(|a| !a.is_empty())
    }

    /// Channel/address pairs that actually carry an address.
    pub fn active(&self) -> impl Iterator<Item = (&ChannelType, &str)> {
        self.addresses
            .iter()
            .filter(|(_, a)| !a.is_empty())
            .map(|(c, a)| (c, a.as_str()))
    }

    /// True when no channel carries an address.
    pub fn is_empty(&self) -> bool {
        self.active().next().is_none()
    }
}

/// Aggregated view derived from the store on every call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub messages_stored: u64,
    pub users_subscribed: u64,
    pub messages_sent: BTreeMap<String, i64>,
}
