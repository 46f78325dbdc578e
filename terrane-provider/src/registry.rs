//! The set of provider types available to a run.
//!
//! A registry is built once per run and handed to the engine explicitly;
//! there is no process-wide provider table.

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use std::{collections::BTreeMap, sync::Arc};
use terrane_core::value::Value;

use crate::framework::ResourceProvider;

/// Produces a configured provider instance from a provider configuration
/// block's value.
#[async_trait]
pub trait ProviderFactory: Send + Sync {
    async fn configure(&self, config: Value) -> Result<Arc<dyn ResourceProvider>>;
}

/// Adapts a plain closure into a [`ProviderFactory`].
struct FnFactory<F>(F);

#[async_trait]
impl<F> ProviderFactory for FnFactory<F>
where
    F: Fn(Value) -> Result<Arc<dyn ResourceProvider>> + Send + Sync,
{
    async fn configure(&self, config: Value) -> Result<Arc<dyn ResourceProvider>> {
        (self.0)(config)
    }
}

#[derive(Clone, Default)]
pub struct ProviderRegistry {
    factories: BTreeMap<String, Arc<dyn ProviderFactory>>,
}
impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, type_: &str, factory: Arc<dyn ProviderFactory>) -> &mut Self {
        self.factories.insert(type_.to_string(), factory);
        self
    }

    pub fn register_fn<F>(&mut self, type_: &str, f: F) -> &mut Self
    where
        F: Fn(Value) -> Result<Arc<dyn ResourceProvider>> + Send + Sync + 'static,
    {
        self.register(type_, Arc::new(FnFactory(f)))
    }

    /// Register a provider that ignores its configuration.
    pub fn register_instance(
        &mut self,
        type_: &str,
        provider: Arc<dyn ResourceProvider>,
    ) -> &mut Self {
        self.register_fn(type_, move |_config| Ok(provider.clone()))
    }

    pub fn contains(&self, type_: &str) -> bool {
        self.factories.contains_key(type_)
    }

    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub async fn configure(&self, type_: &str, config: Value) -> Result<Arc<dyn ResourceProvider>> {
        let factory = match self.factories.get(type_) {
            Some(f) => f,
            None => bail!("unknown provider {:?}", type_),
        };
        factory
            .configure(config)
            .await
            .with_context(|| format!("configuring provider {:?}", type_))
    }
}
