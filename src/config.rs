use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::types::Layer;

/// Scheduler tick (seconds).
pub const TICK_INTERVAL_SECS: u64 = 60;

/// Housekeeping (retention purge + stale-item sweep) interval (seconds).
pub const HOUSEKEEPING_INTERVAL_SECS: u64 = 24 * 3_600;

/// Per-item error messages retained on a run report. Errors beyond this are only counted.
pub const MAX_REPORTED_ERRORS: usize = 10;

/// Source id used for watchlist-check jobs and their audit records.
pub const WATCHLIST_SOURCE: &str = "watchlist";

/// Candidates pulled from the tracker before the scheduler truncates to the job size.
pub const WATCHLIST_CANDIDATE_POOL: usize = 50;

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Browser user agents rotated on the rendered fallback path.
pub const USER_AGENTS: &[&str] = &[
    DEFAULT_USER_AGENT,
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
];

/// Adaptive interval bounds and per-layer defaults.
pub mod layer_defaults {
    pub const MIN_INTERVAL_MINS: u64 = 5;
    pub const MAX_INTERVAL_MINS: u64 = 120;

    pub const SEED_INTERVAL_MINS: u64 = 15;
    pub const SEED_MAX_ITEMS: usize = 50;

    pub const CATEGORY_INTERVAL_MINS: u64 = 60;
    pub const CATEGORY_MAX_ITEMS: usize = 30;

    pub const WATCHLIST_INTERVAL_MINS: u64 = 10;
    pub const WATCHLIST_MAX_ITEMS: usize = 20;

    /// Success rate below which a layer backs off.
    pub const LOW_SUCCESS_RATE: f64 = 0.5;
    /// New items per run above which a layer speeds up.
    pub const HIGH_YIELD_NEW_ITEMS: u32 = 10;
    /// Weight of the latest outcome in the success-rate EMA.
    pub const SUCCESS_EMA_WEIGHT: f64 = 0.1;
    /// Weight of the latest count in the new-items EMA.
    pub const NEW_ITEMS_EMA_WEIGHT: f64 = 0.2;
    /// Fraction of the gap to baseline closed per neutral outcome.
    pub const RELAX_WEIGHT: f64 = 0.1;
}

/// Drop detection thresholds (fractions, not percents).
pub mod drop_thresholds {
    /// Smallest price movement that counts as a change.
    pub const PRICE_EPSILON: f64 = 0.01;
    pub const VOLATILE_CV: f64 = 0.15;
    pub const STABLE_CV: f64 = 0.05;
    pub const VOLATILE: f64 = 0.10;
    pub const STABLE: f64 = 0.15;
    pub const DEFAULT: f64 = 0.12;
    /// Full aggregate recompute every N observations.
    pub const RECOMPUTE_EVERY: i64 = 5;
    /// Watch candidates: current price within this factor of the 30-day floor.
    pub const NEAR_FLOOR_FACTOR: f64 = 1.10;
    pub const MIN_OBSERVATIONS_FOR_TREND: i64 = 3;
}

// ---------------------------------------------------------------------------
// Source catalog
// ---------------------------------------------------------------------------

/// CSS selectors for the rendered (DOM) extraction path. Unset fields fall back
/// to schema.org itemprop / OpenGraph defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectorConfig {
    pub title: Option<String>,
    pub price: Option<String>,
    pub list_price: Option<String>,
    pub brand: Option<String>,
    pub image: Option<String>,
    pub sizes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub layers: BTreeMap<Layer, Vec<String>>,
    /// Substring identifying product links on listing pages.
    #[serde(default)]
    pub product_link_hint: Option<String>,
    #[serde(default)]
    pub selectors: SelectorConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceCatalog {
    pub sources: BTreeMap<String, SourceConfig>,
}

impl SourceCatalog {
    pub fn from_json(raw: &str) -> Result<Self> {
        let catalog: SourceCatalog = serde_json::from_str(raw)?;
        if catalog.sources.is_empty() {
            return Err(AppError::Config("source catalog has no sources".to_string()));
        }
        Ok(catalog)
    }

    pub fn load(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn source_ids(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    pub fn get(&self, source: &str) -> Option<&SourceConfig> {
        self.sources.get(source)
    }

    pub fn urls(&self, source: &str, layer: Layer) -> &[String] {
        self.sources
            .get(source)
            .and_then(|s| s.layers.get(&layer))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Sneaker retailers with sale (seed) and standard category listings.
    pub fn builtin() -> Self {
        let mut sources = BTreeMap::new();
        sources.insert(
            "jdsports".to_string(),
            source(
                "JD Sports",
                "/product/",
                &[
                    "https://www.jdsports.fr/promo/",
                    "https://www.jdsports.fr/homme/chaussures-homme/promo/",
                    "https://www.jdsports.fr/femme/chaussures-femme/promo/",
                ],
                &[
                    "https://www.jdsports.fr/homme/chaussures-homme/baskets/",
                    "https://www.jdsports.fr/femme/chaussures-femme/baskets/",
                    "https://www.jdsports.fr/homme/chaussures-homme/?sort=newest",
                ],
            ),
        );
        sources.insert(
            "size".to_string(),
            source(
                "size?",
                "/product/",
                &[
                    "https://www.size.co.uk/sale/",
                    "https://www.size.co.uk/mens/footwear/sale/",
                    "https://www.size.co.uk/womens/footwear/sale/",
                ],
                &[
                    "https://www.size.co.uk/mens/footwear/",
                    "https://www.size.co.uk/womens/footwear/",
                    "https://www.size.co.uk/search/?q=&sort=latest",
                ],
            ),
        );
        sources.insert(
            "courir".to_string(),
            source(
                "Courir",
                "/p/",
                &[
                    "https://www.courir.com/fr/c/promotions-en-cours/",
                    "https://www.courir.com/fr/c/promotions/",
                ],
                &[
                    "https://www.courir.com/fr/c/homme/chaussures/",
                    "https://www.courir.com/fr/c/femme/chaussures/",
                ],
            ),
        );
        sources.insert(
            "footlocker".to_string(),
            source(
                "Foot Locker",
                "/product/",
                &["https://www.footlocker.fr/fr/category/soldes.html"],
                &[
                    "https://www.footlocker.fr/category/hommes/chaussures.html",
                    "https://www.footlocker.fr/category/femmes/chaussures.html",
                ],
            ),
        );
        Self { sources }
    }
}

fn source(name: &str, hint: &str, seed: &[&str], category: &[&str]) -> SourceConfig {
    let mut layers = BTreeMap::new();
    layers.insert(Layer::Seed, seed.iter().map(|s| s.to_string()).collect());
    layers.insert(Layer::Category, category.iter().map(|s| s.to_string()).collect());
    SourceConfig {
        name: name.to_string(),
        layers,
        product_link_hint: Some(hint.to_string()),
        selectors: SelectorConfig::default(),
    }
}

// ---------------------------------------------------------------------------
// Runtime configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub db_path: String,
    /// JSON source catalog (SOURCES_FILE). None = built-in catalog.
    pub sources_file: Option<String>,
    pub tick_interval: Duration,
    pub max_jobs_per_tick: usize,
    pub max_concurrency: usize,
    /// Delay between item fetches within one run (ITEM_PACING_MS).
    pub item_pacing: Duration,
    pub run_timeout: Duration,
    pub http_timeout: Duration,
    pub use_rotating_proxy: bool,
    /// `host:port[:user:pass]` entries (PROXY_LIST, comma-separated).
    pub proxy_list: Vec<String>,
    pub proxy_list_url: Option<String>,
    pub proxy_max_fails: u32,
    pub proxy_cooldown: Duration,
    pub webhook_url: Option<String>,
    pub alert_min_score: f64,
    pub comparables_url: Option<String>,
    pub watchlist_size: usize,
    pub retention_days: i64,
    pub stale_item_days: i64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "radar.db".to_string()),
            sources_file: non_empty_var("SOURCES_FILE"),
            tick_interval: Duration::from_secs(parse_var("TICK_INTERVAL_SECS", TICK_INTERVAL_SECS)?),
            max_jobs_per_tick: parse_var("MAX_JOBS_PER_TICK", 3usize)?,
            max_concurrency: parse_var("MAX_CONCURRENCY", 3usize)?.max(1),
            item_pacing: Duration::from_millis(parse_var("ITEM_PACING_MS", 1_500u64)?),
            run_timeout: Duration::from_secs(parse_var("RUN_TIMEOUT_SECS", 600u64)?),
            http_timeout: Duration::from_secs(parse_var("HTTP_TIMEOUT_SECS", 30u64)?),
            use_rotating_proxy: parse_var("USE_ROTATING_PROXY", false)?,
            proxy_list: std::env::var("PROXY_LIST")
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            proxy_list_url: non_empty_var("PROXY_LIST_URL"),
            proxy_max_fails: parse_var("PROXY_MAX_FAILS", 3u32)?,
            proxy_cooldown: Duration::from_secs(parse_var("PROXY_COOLDOWN_SECS", 300u64)?),
            webhook_url: non_empty_var("WEBHOOK_URL"),
            alert_min_score: parse_var("ALERT_MIN_SCORE", 70.0f64)?,
            comparables_url: non_empty_var("COMPARABLES_URL"),
            watchlist_size: parse_var("WATCHLIST_SIZE", layer_defaults::WATCHLIST_MAX_ITEMS)?,
            retention_days: parse_var("RETENTION_DAYS", 90i64)?,
            stale_item_days: parse_var("STALE_ITEM_DAYS", 14i64)?,
        })
    }

    pub fn catalog(&self) -> Result<SourceCatalog> {
        match &self.sources_file {
            Some(path) => SourceCatalog::load(path),
            None => Ok(SourceCatalog::builtin()),
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::Config(format!("{key} has an invalid value: {raw}"))),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_has_seed_and_category_urls() {
        let catalog = SourceCatalog::builtin();
        assert_eq!(catalog.sources.len(), 4);
        for id in catalog.source_ids() {
            assert!(!catalog.urls(id, Layer::Seed).is_empty(), "{id} seed");
            assert!(!catalog.urls(id, Layer::Category).is_empty(), "{id} category");
            assert!(catalog.urls(id, Layer::Watchlist).is_empty());
        }
    }

    #[test]
    fn catalog_parses_layer_keys() {
        let raw = r#"{
            "sources": {
                "shop": {
                    "name": "Shop",
                    "layers": { "seed": ["https://shop.test/sale"] },
                    "selectors": { "price": ".price" }
                }
            }
        }"#;
        let catalog = SourceCatalog::from_json(raw).unwrap();
        assert_eq!(catalog.urls("shop", Layer::Seed), ["https://shop.test/sale".to_string()]);
        assert!(catalog.urls("shop", Layer::Category).is_empty());
        assert_eq!(catalog.get("shop").unwrap().selectors.price.as_deref(), Some(".price"));
        assert!(catalog.urls("missing", Layer::Seed).is_empty());
    }

    #[test]
    fn empty_catalog_is_a_config_error() {
        let err = SourceCatalog::from_json(r#"{"sources": {}}"#).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }
}
