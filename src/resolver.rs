//! Recipient resolvers and their registry.
//!
//! A resolver turns a target `(scope, group)` into recipient ids. Identity
//! provider specific resolvers (org membership, directory groups) live
//! outside this crate and plug in through [`RecipientResolver`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ResolveError;

/// Scope used when a target does not name one.
pub const DEFAULT_SCOPE: &str = "default";

#[async_trait]
pub trait RecipientResolver: Send + Sync {
    /// Recipients belonging to `group` within `scope`.
    ///
    /// Implementations decide what a scope means and may answer
    /// [`ResolveError::NotConfigured`] for unknown scopes.
    async fn resolve(&self, scope: &str, group: &str) -> Result<Vec<String>, ResolveError>;
}

/// Resolver backed by a fixed scope -> group -> members table.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    scopes: HashMap<String, HashMap<String, Vec<String>>>,
}

impl StaticResolver {
    pub fn new(scopes: HashMap<String, HashMap<String, Vec<String>>>) -> Self {
        Self { scopes }
    }

    pub fn with_group<I, S>(mut self, scope: &str, group: &str, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes
            .entry(scope.to_string())
            .or_default()
            .insert(group.to_string(), members.into_iter().map(Into::into).collect());
        self
    }
}

#[async_trait]
impl RecipientResolver for StaticResolver {
    async fn resolve(&self, scope: &str, group: &str) -> Result<Vec<String>, ResolveError> {
        let scope = if scope.is_empty() { DEFAULT_SCOPE } else { scope };
        let groups = self
            .scopes
            .get(scope)
            .ok_or_else(|| ResolveError::NotConfigured { scope: scope.to_string() })?;
        groups
            .get(group)
            .cloned()
            .ok_or_else(|| ResolveError::UnknownGroup { group: group.to_string() })
    }
}

/// Registry of resolvers keyed by target type.
#[derive(Default, Clone)]
pub struct ResolverRegistry {
    resolvers: BTreeMap<String, Arc<dyn RecipientResolver>>,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, target_type: impl Into<String>, resolver: Arc<dyn RecipientResolver>) {
        let target_type = target_type.into();
        tracing::debug!(%target_type, "recipient resolver registered");
        self.resolvers.insert(target_type, resolver);
    }

    pub fn with(mut self, target_type: impl Into<String>, resolver: Arc<dyn RecipientResolver>) -> Self {
        self.register(target_type, resolver);
        self
    }

    pub fn get(&self, target_type: &str) -> Option<&Arc<dyn RecipientResolver>> {
        self.resolvers.get(target_type)
    }

    pub fn target_types(&self) -> impl Iterator<Item = &str> {
        self.resolvers.keys().map(String::as_str)
    }
}
