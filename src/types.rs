use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub type ItemId = i64;

pub const NS_PER_SEC: i64 = 1_000_000_000;
pub const HOUR_NS: i64 = 3_600 * NS_PER_SEC;
pub const DAY_NS: i64 = 24 * HOUR_NS;

pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

// ---------------------------------------------------------------------------
// Layers and jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    Seed,
    Category,
    Watchlist,
}

impl Layer {
    pub const ALL: [Layer; 3] = [Layer::Seed, Layer::Category, Layer::Watchlist];

    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::Seed => "seed",
            Layer::Category => "category",
            Layer::Watchlist => "watchlist",
        }
    }

    pub fn parse(s: &str) -> Option<Layer> {
        match s {
            "seed" => Some(Layer::Seed),
            "category" => Some(Layer::Category),
            "watchlist" => Some(Layer::Watchlist),
            _ => None,
        }
    }
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    LayerScrape,
    WatchlistCheck,
}

/// A unit of work emitted by the scheduler and consumed by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeJob {
    pub kind: JobKind,
    pub source: String,
    pub layer: Layer,
    /// Listing URLs to discover from (layer scrapes only).
    pub urls: Vec<String>,
    /// Items to re-check (watchlist jobs only).
    pub item_ids: Vec<ItemId>,
    pub max_items: usize,
    /// Lower is more urgent.
    pub priority: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerOrigin {
    Scheduled,
    Manual,
}

impl TriggerOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerOrigin::Scheduled => "scheduled",
            TriggerOrigin::Manual => "manual",
        }
    }
}

impl std::fmt::Display for TriggerOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Items
// ---------------------------------------------------------------------------

/// What a collector extracts from one product page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductItem {
    pub external_id: String,
    pub title: String,
    pub brand: Option<String>,
    pub price: f64,
    pub list_price: Option<f64>,
    pub discount_pct: Option<f64>,
    pub image_url: Option<String>,
    pub sizes: Vec<String>,
    pub category: Option<String>,
    pub color: Option<String>,
    pub in_stock: bool,
}

impl ProductItem {
    /// Discount in percent, derived from list price when the source omits it.
    pub fn effective_discount(&self) -> Option<f64> {
        self.discount_pct.or_else(|| match self.list_price {
            Some(list) if list > 0.0 && list > self.price => {
                Some(((1.0 - self.price / list) * 1000.0).round() / 10.0)
            }
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedItem {
    pub id: ItemId,
    pub source: String,
    pub external_id: String,
    pub title: String,
    pub brand: Option<String>,
    pub price: f64,
    pub list_price: Option<f64>,
    pub discount_pct: Option<f64>,
    pub url: String,
    pub image_url: Option<String>,
    pub category: Option<String>,
    pub color: Option<String>,
    pub sizes: Vec<String>,
    pub in_stock: bool,
    pub active: bool,
    pub first_seen_ns: i64,
    pub last_seen_ns: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertAction {
    Created,
    Updated { price_changed: bool },
}

#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub item: TrackedItem,
    pub action: UpsertAction,
}

impl UpsertOutcome {
    pub fn needs_tracking(&self) -> bool {
        matches!(
            self.action,
            UpsertAction::Created | UpsertAction::Updated { price_changed: true }
        )
    }
}

// ---------------------------------------------------------------------------
// Price history
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceObservation {
    /// Assigned by the store; 0 before insertion.
    pub id: i64,
    pub item_id: ItemId,
    pub price: f64,
    pub list_price: Option<f64>,
    pub url: Option<String>,
    pub observed_at_ns: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Up,
    Down,
    Stable,
}

impl Trend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trend::Up => "up",
            Trend::Down => "down",
            Trend::Stable => "stable",
        }
    }

    pub fn parse(s: &str) -> Option<Trend> {
        match s {
            "up" => Some(Trend::Up),
            "down" => Some(Trend::Down),
            "stable" => Some(Trend::Stable),
            _ => None,
        }
    }
}

/// Rolling aggregates for one item. Owned by the price tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceStats {
    pub item_id: ItemId,
    pub current_price: f64,
    pub previous_price: Option<f64>,
    pub min_30d: f64,
    pub max_30d: f64,
    pub avg_30d: f64,
    pub median_30d: f64,
    pub p25_30d: f64,
    pub p75_30d: f64,
    /// Coefficient of variation over 30 days. None until two prices exist.
    pub cv_30d: Option<f64>,
    pub min_7d: f64,
    pub max_7d: f64,
    pub avg_7d: f64,
    pub median_7d: f64,
    pub trend: Option<Trend>,
    pub is_drop: bool,
    pub drop_percent: Option<f64>,
    pub drop_detected_at_ns: Option<i64>,
    pub observation_count: i64,
    pub price_change_count: i64,
    pub last_recompute_ns: i64,
    pub updated_at_ns: i64,
}

impl PriceStats {
    /// Stats for an item's very first observation: every aggregate equals the price.
    pub fn seed(item_id: ItemId, price: f64, now_ns: i64) -> Self {
        Self {
            item_id,
            current_price: price,
            previous_price: None,
            min_30d: price,
            max_30d: price,
            avg_30d: price,
            median_30d: price,
            p25_30d: price,
            p75_30d: price,
            cv_30d: None,
            min_7d: price,
            max_7d: price,
            avg_7d: price,
            median_7d: price,
            trend: None,
            is_drop: false,
            drop_percent: None,
            drop_detected_at_ns: None,
            observation_count: 1,
            price_change_count: 0,
            last_recompute_ns: now_ns,
            updated_at_ns: now_ns,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReference {
    Floor30d,
    PreviousPrice,
}

/// Result of recording one observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DropSignal {
    pub is_drop: bool,
    pub drop_percent: Option<f64>,
    pub reference: Option<DropReference>,
}

impl DropSignal {
    pub fn none() -> Self {
        Self { is_drop: false, drop_percent: None, reference: None }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DropRecord {
    pub item: TrackedItem,
    pub stats: PriceStats,
}

// ---------------------------------------------------------------------------
// Run audit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Started,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Started => "started",
            RunStatus::InProgress => "in_progress",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<RunStatus> {
        match s {
            "started" => Some(RunStatus::Started),
            "in_progress" => Some(RunStatus::InProgress),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            "cancelled" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled)
    }

    /// started → in_progress → {completed | failed | cancelled}. A run that never
    /// got past setup may fail or be cancelled straight from started.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match (self, next) {
            (RunStatus::Started, RunStatus::InProgress) => true,
            (RunStatus::Started, RunStatus::Failed | RunStatus::Cancelled) => true,
            (RunStatus::InProgress, n) => n.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeRun {
    /// Assigned by the store; 0 before insertion.
    pub id: i64,
    pub source: String,
    pub layer: Layer,
    pub trigger: TriggerOrigin,
    pub status: RunStatus,
    pub started_at_ns: i64,
    pub finished_at_ns: Option<i64>,
    pub duration_ms: Option<f64>,
    pub items_found: i64,
    pub items_created: i64,
    pub items_updated: i64,
    pub error_count: i64,
    pub error_message: Option<String>,
    pub error_context: Option<String>,
    pub proxy_used: Option<String>,
}

// ---------------------------------------------------------------------------
// Comparables and scores
// ---------------------------------------------------------------------------

/// Resale price distribution for similar listings on the secondary marketplace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Comparables {
    pub listing_count: u32,
    pub median: f64,
    pub p25: f64,
    pub p75: f64,
    /// Dispersion in percent, when the marketplace reports it.
    #[serde(default)]
    pub cv: Option<f64>,
    /// Marketplace liquidity figure on a 0–100 scale.
    #[serde(default)]
    pub liquidity_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recommendation {
    Buy,
    Watch,
    Ignore,
}

impl Recommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recommendation::Buy => "buy",
            Recommendation::Watch => "watch",
            Recommendation::Ignore => "ignore",
        }
    }

    pub fn parse(s: &str) -> Option<Recommendation> {
        match s {
            "buy" => Some(Recommendation::Buy),
            "watch" => Some(Recommendation::Watch),
            "ignore" => Some(Recommendation::Ignore),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceBand {
    pub aggressive: f64,
    pub optimal: f64,
    pub patient: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub overall: f64,
    pub margin_score: f64,
    pub liquidity_score: f64,
    pub popularity_score: f64,
    pub risk_score: f64,
    pub margin_abs: f64,
    pub margin_pct: f64,
    pub action: Recommendation,
    pub confidence: f64,
    pub price_band: Option<PriceBand>,
    pub estimated_days_to_sell: u32,
    pub explanation: String,
    pub risks: Vec<String>,
    pub model_version: String,
}
