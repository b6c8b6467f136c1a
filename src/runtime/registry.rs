//! Name → handler registries for orchestrations and activities.
//!
//! Registration problems (duplicates) are collected while building and
//! reported together by [`RegistryBuilder::build`], so a misconfigured process
//! fails at startup rather than on the first lookup.

use std::collections::HashMap;
use std::sync::Arc;

use super::{ActivityContext, ActivityHandler, FnActivity, FnOrchestration, OrchestrationHandler};
use crate::_typed_codec::{Codec, Json};
use crate::error::ConfigError;
use crate::OrchestrationContext;

/// Immutable, cheaply cloneable handler lookup table.
pub struct Registry<H: ?Sized> {
    pub(crate) inner: Arc<HashMap<String, Arc<H>>>,
}

// Manual Clone impl since H: ?Sized doesn't auto-derive Clone
impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: ?Sized> Default for Registry<H> {
    fn default() -> Self {
        Self {
            inner: Arc::new(HashMap::new()),
        }
    }
}

pub struct RegistryBuilder<H: ?Sized> {
    map: HashMap<String, Arc<H>>,
    errors: Vec<String>,
    kind: &'static str,
}

pub type OrchestrationRegistry = Registry<dyn OrchestrationHandler>;
pub type ActivityRegistry = Registry<dyn ActivityHandler>;
pub type OrchestrationRegistryBuilder = RegistryBuilder<dyn OrchestrationHandler>;
pub type ActivityRegistryBuilder = RegistryBuilder<dyn ActivityHandler>;

impl<H: ?Sized> Registry<H> {
    pub fn get(&self, name: &str) -> Option<Arc<H>> {
        let found = self.inner.get(name).cloned();
        if found.is_none() {
            tracing::debug!(
                target: "duraflow::runtime::registry",
                requested_name = %name,
                registered_names = ?self.list_names(),
                "registry lookup miss"
            );
        }
        found
    }

    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl OrchestrationRegistry {
    pub fn builder() -> OrchestrationRegistryBuilder {
        RegistryBuilder::new("orchestration")
    }

    pub(crate) fn resolve(&self, name: &str) -> Result<Arc<dyn OrchestrationHandler>, ConfigError> {
        self.get(name)
            .ok_or_else(|| ConfigError::UnknownOrchestration(name.to_string()))
    }
}

impl ActivityRegistry {
    pub fn builder() -> ActivityRegistryBuilder {
        RegistryBuilder::new("activity")
    }

    pub(crate) fn resolve(&self, name: &str) -> Result<Arc<dyn ActivityHandler>, ConfigError> {
        self.get(name).ok_or_else(|| ConfigError::UnknownActivity(name.to_string()))
    }
}

impl<H: ?Sized> RegistryBuilder<H> {
    fn new(kind: &'static str) -> Self {
        Self {
            map: HashMap::new(),
            errors: Vec::new(),
            kind,
        }
    }

    /// Build the registry, failing if any registration was rejected.
    pub fn build(self) -> Result<Registry<H>, ConfigError> {
        match self.errors.len() {
            0 => Ok(Registry {
                inner: Arc::new(self.map),
            }),
            1 => Err(ConfigError::Duplicate {
                kind: self.kind,
                name: self.errors.into_iter().next().unwrap_or_default(),
            }),
            _ => Err(ConfigError::Multiple(
                self.errors
                    .iter()
                    .map(|name| format!("{} '{name}' registered more than once", self.kind))
                    .collect(),
            )),
        }
    }

    /// Add every handler of `other`; name clashes are registration errors.
    pub fn merge(mut self, other: Registry<H>) -> Self {
        for (name, handler) in other.inner.iter() {
            self.insert(name.clone(), handler.clone());
        }
        self
    }

    fn insert(&mut self, name: String, handler: Arc<H>) {
        if self.map.contains_key(&name) {
            self.errors.push(name);
        } else {
            self.map.insert(name, handler);
        }
    }
}

impl OrchestrationRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert(name.into(), Arc::new(FnOrchestration(f)));
        self
    }

    /// Register with JSON decoded input and JSON encoded output.
    pub fn register_typed<In, Out, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |ctx: OrchestrationContext, input_s: String| {
            let f_inner = f.clone();
            async move {
                let input: In = Json::decode(&input_s)?;
                let out: Out = f_inner(ctx, input).await?;
                Json::encode(&out)
            }
        };
        self.insert(name.into(), Arc::new(FnOrchestration(wrapper)));
        self
    }
}

impl ActivityRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert(name.into(), Arc::new(FnActivity(f)));
        self
    }

    pub fn register_typed<In, Out, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(ActivityContext, In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |ctx: ActivityContext, input_s: String| {
            let f_inner = f.clone();
            async move {
                let input: In = Json::decode(&input_s)?;
                let out: Out = f_inner(ctx, input).await?;
                Json::encode(&out)
            }
        };
        self.insert(name.into(), Arc::new(FnActivity(wrapper)));
        self
    }
}
