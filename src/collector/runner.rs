use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::collector::{Collector, FetchContext};
use crate::error::CollectError;
use crate::types::ProductItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchPath {
    Structured,
    Rendered,
}

#[derive(Debug, Clone)]
pub struct FetchedItem {
    pub item: ProductItem,
    pub path: FetchPath,
}

#[derive(Debug, Clone, Default)]
pub struct Discovery {
    /// De-duplicated, in discovery order.
    pub urls: Vec<String>,
    /// Listings that needed the rendered path.
    pub fallbacks: usize,
    /// Listings where both paths failed.
    pub failed_listings: Vec<(String, CollectError)>,
}

/// Runs a collector with the structured → rendered fallback applied uniformly.
pub struct CollectorRunner {
    collector: Arc<dyn Collector>,
    ctx: FetchContext,
}

impl CollectorRunner {
    pub fn new(collector: Arc<dyn Collector>, ctx: FetchContext) -> Self {
        Self { collector, ctx }
    }

    fn source(&self) -> &str {
        self.collector.source()
    }

    /// Walks every listing URL until `max_items` product URLs are found.
    /// Fails only if no listing could be read at all.
    pub async fn discover(
        &self,
        listing_urls: &[String],
        max_items: usize,
    ) -> Result<Discovery, CollectError> {
        let mut out = Discovery::default();
        let mut seen = HashSet::new();

        for listing in listing_urls {
            if out.urls.len() >= max_items {
                break;
            }
            let found = match self.collector.discover_structured(&self.ctx, listing).await {
                Ok(urls) => urls,
                Err(e) if e.allows_fallback() => {
                    self.log_fallback("discover", listing, &e);
                    match self.collector.discover_rendered(&self.ctx, listing).await {
                        Ok(urls) => {
                            out.fallbacks += 1;
                            urls
                        }
                        Err(e) => {
                            self.log_failure("discover", listing, &e);
                            out.failed_listings.push((listing.clone(), e));
                            continue;
                        }
                    }
                }
                Err(e) => {
                    self.log_failure("discover", listing, &e);
                    out.failed_listings.push((listing.clone(), e));
                    continue;
                }
            };

            for url in found {
                if out.urls.len() >= max_items {
                    break;
                }
                if seen.insert(url.clone()) {
                    out.urls.push(url);
                }
            }
        }

        if !listing_urls.is_empty() && out.failed_listings.len() == listing_urls.len() {
            if let Some((_, e)) = out.failed_listings.pop() {
                return Err(e);
            }
        }
        Ok(out)
    }

    pub async fn fetch_detail(&self, url: &str) -> Result<FetchedItem, CollectError> {
        match self.collector.fetch_structured(&self.ctx, url).await {
            Ok(item) => Ok(FetchedItem { item, path: FetchPath::Structured }),
            Err(e) if e.allows_fallback() => {
                self.log_fallback("detail", url, &e);
                match self.collector.fetch_rendered(&self.ctx, url).await {
                    Ok(item) => Ok(FetchedItem { item, path: FetchPath::Rendered }),
                    Err(e) => {
                        self.log_failure("detail", url, &e);
                        Err(e)
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    fn log_fallback(&self, stage: &str, url: &str, e: &CollectError) {
        if e.is_structural() {
            warn!(
                event = "SCHEMA_MISMATCH",
                source = self.source(),
                stage,
                url,
                error = %e,
                "Structured path no longer matches; falling back to rendered",
            );
        } else {
            debug!(
                event = "COLLECT_TRANSIENT",
                source = self.source(),
                stage,
                url,
                error = %e,
                "Structured path failed; falling back to rendered",
            );
        }
    }

    fn log_failure(&self, stage: &str, url: &str, e: &CollectError) {
        let event = if e.is_structural() { "SCHEMA_MISMATCH" } else { "COLLECT_TRANSIENT" };
        warn!(event, source = self.source(), stage, url, error = %e, "Collection failed on both paths");
    }
}
