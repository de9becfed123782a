pub mod jsonld;
pub mod runner;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{SourceCatalog, DEFAULT_USER_AGENT};
use crate::error::{CollectError, Result};
use crate::types::ProductItem;

pub use jsonld::JsonLdCollector;
pub use runner::{CollectorRunner, FetchPath};

/// HTTP client for one run, already routed through the run's proxy.
#[derive(Clone)]
pub struct FetchContext {
    pub client: reqwest::Client,
}

impl FetchContext {
    pub fn build(proxy: Option<&str>, timeout: Duration) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(DEFAULT_USER_AGENT);
        if let Some(url) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(url)?);
        }
        Ok(Self { client: builder.build()? })
    }
}

/// One retail source. Every capability comes in two flavours: a cheap
/// structured path and a heavier rendered path the runner falls back to.
#[async_trait]
pub trait Collector: Send + Sync {
    fn source(&self) -> &str;

    async fn discover_structured(
        &self,
        ctx: &FetchContext,
        listing_url: &str,
    ) -> std::result::Result<Vec<String>, CollectError>;

    async fn discover_rendered(
        &self,
        ctx: &FetchContext,
        listing_url: &str,
    ) -> std::result::Result<Vec<String>, CollectError>;

    async fn fetch_structured(
        &self,
        ctx: &FetchContext,
        url: &str,
    ) -> std::result::Result<ProductItem, CollectError>;

    async fn fetch_rendered(
        &self,
        ctx: &FetchContext,
        url: &str,
    ) -> std::result::Result<ProductItem, CollectError>;
}

/// Source id → collector.
#[derive(Default, Clone)]
pub struct CollectorRegistry {
    collectors: HashMap<String, Arc<dyn Collector>>,
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A JSON-LD collector for every catalog source.
    pub fn from_catalog(catalog: &SourceCatalog) -> Self {
        let mut registry = Self::new();
        for (id, cfg) in &catalog.sources {
            registry.register(Arc::new(JsonLdCollector::new(id, cfg.clone())));
        }
        registry
    }

    pub fn register(&mut self, collector: Arc<dyn Collector>) {
        self.collectors.insert(collector.source().to_string(), collector);
    }

    pub fn get(&self, source: &str) -> Option<Arc<dyn Collector>> {
        self.collectors.get(source).cloned()
    }
}
