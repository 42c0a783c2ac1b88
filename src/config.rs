//! Relay configuration.
//!
//! Settings come from an optional file and `RELAY_`-prefixed environment
//! variables (nested keys separated by `__`, e.g.
//! `RELAY_DISPATCHER__QUEUE_CAPACITY=500`). Every field has a default.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ::config::{Config, Environment, File};
use serde::Deserialize;

use crate::channel::{AddressRule, ChannelRegistry, ChannelSender, LogSender, E164_PATTERN, EMAIL_PATTERN};
use crate::error::StoreError;
use crate::keyspace::{Keyspace, ReservedPrefix, DEFAULT_SUBSCRIPTION_PREFIX};
use crate::reconciler::NoticeTemplates;
use crate::resolver::{RecipientResolver, ResolverRegistry, StaticResolver};
use crate::worker::{OverflowPolicy, SendPoolConfig};

/// Default file source, extension resolved by the `config` crate.
pub const DEFAULT_CONFIG_FILE: &str = "config/relay";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] ::config::ConfigError),

    #[error("channel {channel}: invalid address pattern: {source}")]
    InvalidPattern {
        channel: String,
        #[source]
        source: regex::Error,
    },

    #[error("channel {channel}: {kind} sender needs a url")]
    MissingUrl { channel: String, kind: &'static str },

    #[error("channel {channel}: built without the {feature} feature")]
    FeatureDisabled { channel: String, feature: &'static str },

    #[error(transparent)]
    Keyspace(#[from] ReservedPrefix),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    pub log_level: String,
    pub store: StoreSettings,
    pub dispatcher: DispatcherSettings,
    pub notices: NoticeTemplates,
    /// API user -> password, for submission and subscriber enumeration.
    pub api_users: HashMap<String, String>,
    pub channels: Vec<ChannelSettings>,
    /// Target type -> resolver.
    pub resolvers: HashMap<String, ResolverSettings>,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            store: StoreSettings::default(),
            dispatcher: DispatcherSettings::default(),
            notices: NoticeTemplates::default(),
            api_users: HashMap::new(),
            channels: Vec::new(),
            resolvers: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Redis connection URL; the in-memory store is used when absent.
    pub redis_url: Option<String>,
    /// Namespace of subscription records; empty selects the legacy layout.
    pub subscription_prefix: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            redis_url: None,
            subscription_prefix: DEFAULT_SUBSCRIPTION_PREFIX.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherSettings {
    /// Defaults to available parallelism.
    pub worker_count: Option<usize>,
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub send_timeout_ms: u64,
    pub dead_letter_capacity: usize,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        let pool = SendPoolConfig::default();
        Self {
            worker_count: None,
            queue_capacity: pool.queue_capacity,
            overflow_policy: pool.overflow_policy,
            send_timeout_ms: pool.send_timeout.as_millis() as u64,
            dead_letter_capacity: pool.dead_letter_capacity,
        }
    }
}

impl DispatcherSettings {
    pub fn pool_config(&self) -> SendPoolConfig {
        let defaults = SendPoolConfig::default();
        SendPoolConfig {
            worker_count: self.worker_count.unwrap_or(defaults.worker_count),
            queue_capacity: self.queue_capacity,
            overflow_policy: self.overflow_policy,
            send_timeout: Duration::from_millis(self.send_timeout_ms),
            dead_letter_capacity: self.dead_letter_capacity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderKind {
    Log,
    Webhook,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelSettings {
    #[serde(rename = "type")]
    pub channel: String,
    pub kind: SenderKind,
    /// Regex addresses must match; inferred for `email` and `sms`.
    #[serde(default)]
    pub address_pattern: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl ChannelSettings {
    fn address_rule(&self) -> Result<AddressRule, ConfigError> {
        let pattern = match (&self.address_pattern, self.channel.as_str()) {
            (Some(pattern), _) => pattern.as_str(),
            (None, "email") => EMAIL_PATTERN,
            (None, "sms") => E164_PATTERN,
            (None, _) => r"^\S+$",
        };
        AddressRule::new(pattern).map_err(|source| ConfigError::InvalidPattern {
            channel: self.channel.clone(),
            source,
        })
    }

    pub fn build(&self) -> Result<Arc<dyn ChannelSender>, ConfigError> {
        let rule = self.address_rule()?;
        match self.kind {
            SenderKind::Log => Ok(Arc::new(LogSender::new(self.channel.as_str(), rule))),
            SenderKind::Webhook => self.build_webhook(rule),
        }
    }

    #[cfg(feature = "http")]
    fn build_webhook(&self, rule: AddressRule) -> Result<Arc<dyn ChannelSender>, ConfigError> {
        let url = self.url.as_ref().ok_or_else(|| ConfigError::MissingUrl {
            channel: self.channel.clone(),
            kind: "webhook",
        })?;

        let mut sender = crate::channel_webhook::WebhookSender::new(url.as_str(), rule);
        if let Some(secret) = &self.secret {
            sender = sender.with_secret(secret.as_bytes());
        }
        if let Some(ms) = self.timeout_ms {
            sender = sender.with_timeout(Duration::from_millis(ms));
        }
        Ok(Arc::new(sender))
    }

    #[cfg(not(feature = "http"))]
    fn build_webhook(&self, _rule: AddressRule) -> Result<Arc<dyn ChannelSender>, ConfigError> {
        Err(ConfigError::FeatureDisabled {
            channel: self.channel.clone(),
            feature: "http",
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolverSettings {
    /// Scope -> group -> members.
    Static {
        #[serde(default)]
        scopes: HashMap<String, HashMap<String, Vec<String>>>,
    },
}

impl ResolverSettings {
    pub fn build(&self) -> Arc<dyn RecipientResolver> {
        match self {
            ResolverSettings::Static { scopes } => Arc::new(StaticResolver::new(scopes.clone())),
        }
    }
}

impl RelaySettings {
    pub fn keyspace(&self) -> Result<Keyspace, ConfigError> {
        Ok(Keyspace::new(self.store.subscription_prefix.as_str())?)
    }

    pub fn channel_registry(&self) -> Result<ChannelRegistry, ConfigError> {
        let mut registry = ChannelRegistry::new();
        for channel in &self.channels {
            registry.register(channel.channel.as_str(), channel.build()?);
        }
        Ok(registry)
    }

    pub fn resolver_registry(&self) -> ResolverRegistry {
        let mut registry = ResolverRegistry::new();
        for (target_type, resolver) in &self.resolvers {
            registry.register(target_type.as_str(), resolver.build());
        }
        registry
    }
}

/// Load settings from `path` (or the default file when `None`) and the
/// environment.
pub fn load_settings(path: Option<&Path>) -> Result<RelaySettings, ConfigError> {
    let file = match path {
        Some(path) => File::from(path).required(true),
        None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
    };

    let config = Config::builder()
        .add_source(file)
        .add_source(
            Environment::with_prefix("RELAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    Ok(config.try_deserialize()?)
}
