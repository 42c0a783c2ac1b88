use std::error::Error as StdError;

use crate::types::{ChannelType, InvalidRecipient};

type BoxError = Box<dyn StdError + Send + Sync>;

/// Failures talking to the key-value store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store operation failed: {context}: {source}")]
    Backend {
        context: String,
        #[source]
        source: BoxError,
    },

    /// The key exists but holds a different kind of value.
    #[error("key {key:?} holds a value of the wrong type")]
    WrongType { key: String },

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl StoreError {
    #[must_use]
    pub fn backend(context: impl Into<String>, source: impl StdError + Send + Sync + 'static) -> Self {
        Self::Backend {
            context: context.into(),
            source: Box::new(source),
        }
    }
}

/// Failures turning a target into recipients.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("scope {scope:?} is not configured")]
    NotConfigured { scope: String },

    #[error("group {group:?} not found")]
    UnknownGroup { group: String },

    #[error("recipient lookup failed: {context}: {source}")]
    Backend {
        context: String,
        #[source]
        source: BoxError,
    },
}

impl ResolveError {
    #[must_use]
    pub fn backend(context: impl Into<String>, source: impl StdError + Send + Sync + 'static) -> Self {
        Self::Backend {
            context: context.into(),
            source: Box::new(source),
        }
    }
}

/// Failures of a single channel send.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("no destination address given")]
    EmptyAddress,

    #[error("send timed out")]
    Timeout,

    #[error("transport failed: {context}: {source}")]
    Transport {
        context: String,
        #[source]
        source: BoxError,
    },
}

impl SendError {
    #[must_use]
    pub fn transport(context: impl Into<String>, source: impl StdError + Send + Sync + 'static) -> Self {
        Self::Transport {
            context: context.into(),
            source: Box::new(source),
        }
    }
}

/// Malformed inbound message.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("malformed message payload: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("message identifier is missing")]
    MissingId,

    #[error("invalid time-to-live {value:?}")]
    InvalidTtl { value: String },
}

/// Errors returned when a dispatch cannot make progress.
///
/// Anything recoverable (unknown channel on one recipient, empty recipient
/// list, store write failure) is absorbed and reported in the outcome instead.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    InvalidMessage(#[from] MessageError),

    /// No resolver is registered for the target type.
    #[error("{target_type} target type not implemented")]
    NotImplemented { target_type: String },

    #[error("error retrieving recipients: {0}")]
    Resolution(#[source] ResolveError),

    /// The send pool no longer accepts work.
    #[error("relay is shut down")]
    Shutdown,
}

/// One rejected address in a subscription update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressViolation {
    pub channel: ChannelType,
    pub address: String,
    /// Human readable description of what the channel accepts.
    pub rule: String,
}

/// Errors returned by a subscription update.
#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    #[error("unknown channel type {channel}")]
    UnknownChannel { channel: ChannelType },

    #[error(transparent)]
    InvalidRecipient(#[from] InvalidRecipient),

    #[error("{} invalid address(es): {}", .0.len(), describe_violations(.0))]
    InvalidAddresses(Vec<AddressViolation>),

    #[error(transparent)]
    Store(#[from] StoreError),
}

fn describe_violations(violations: &[AddressViolation]) -> String {
    violations
        .iter()
        .map(|v| format!("{} {:?} must match {}", v.channel, v.address, v.rule))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Facade error carrying the caller-visible status of a request.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("unauthorized")]
    Unauthorized,

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Subscribe(#[from] SubscribeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RelayError {
    /// HTTP status an outer routing layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            RelayError::Unauthorized => 401,
            RelayError::Dispatch(err) => match err {
                DispatchError::InvalidMessage(_) => 400,
                DispatchError::NotImplemented { .. } => 501,
                DispatchError::Resolution(_) => 500,
                DispatchError::Shutdown => 503,
            },
            RelayError::Subscribe(err) => match err {
                SubscribeError::UnknownChannel { .. }
                | SubscribeError::InvalidRecipient(_)
                | SubscribeError::InvalidAddresses(_) => 400,
                SubscribeError::Store(_) => 500,
            },
            RelayError::Store(_) => 500,
        }
    }
}

/// Final outcome of one queued send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    Dropped(DropReason),
    Failed(String),
}

/// Reasons a send was dropped without a transport attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Send queue at capacity.
    Backpressure,

    /// Pool is shutting down.
    Shutdown,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::Backpressure => write!(f, "send queue at capacity"),
            DropReason::Shutdown => write!(f, "send pool is shut down"),
        }
    }
}
