use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    DropRecord, ItemId, PriceObservation, PriceStats, ProductItem, Score, ScrapeRun, TrackedItem,
    UpsertOutcome,
};

/// Which items are worth a high-frequency re-check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatchCriteria {
    /// Trend `down` counts once this many observations exist.
    pub min_observations_for_trend: i64,
    /// Current price at or below `min_30d * near_floor_factor`.
    pub near_floor_factor: f64,
    /// CV strictly above this marks an item volatile.
    pub volatile_cv: f64,
}

impl WatchCriteria {
    pub fn matches(&self, stats: &PriceStats) -> bool {
        let trending_down = stats.trend == Some(crate::types::Trend::Down)
            && stats.observation_count >= self.min_observations_for_trend;
        let near_floor =
            stats.min_30d > 0.0 && stats.current_price <= stats.min_30d * self.near_floor_factor;
        let volatile = stats.cv_30d.is_some_and(|cv| cv > self.volatile_cv);
        trending_down || near_floor || volatile
    }

    /// Closest-to-floor first.
    pub fn rank(stats: &PriceStats) -> f64 {
        if stats.min_30d > 0.0 {
            stats.current_price / stats.min_30d
        } else {
            f64::MAX
        }
    }
}

/// Persistence for items, price history, run audit records and scores.
///
/// Implementations must keep `(source, external_id)` unique and must write an
/// observation together with the stats it produced.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or refresh an item. Re-discovery reactivates an inactive item.
    async fn upsert_item(
        &self,
        source: &str,
        url: &str,
        item: &ProductItem,
        now_ns: i64,
    ) -> Result<UpsertOutcome>;

    async fn get_item(&self, id: ItemId) -> Result<Option<TrackedItem>>;

    async fn items_by_ids(&self, ids: &[ItemId]) -> Result<Vec<TrackedItem>>;

    /// Marks items not seen since `seen_before_ns` inactive. Returns the count.
    async fn deactivate_stale_items(&self, seen_before_ns: i64) -> Result<u64>;

    async fn load_price_stats(&self, item_id: ItemId) -> Result<Option<PriceStats>>;

    /// Observations at or after `since_ns`, oldest first.
    async fn observation_history(&self, item_id: ItemId, since_ns: i64)
        -> Result<Vec<PriceObservation>>;

    /// Appends the observation and replaces the stats atomically. Returns the observation id.
    async fn commit_observation(&self, obs: &PriceObservation, stats: &PriceStats) -> Result<i64>;

    async fn observation_count(&self, item_id: ItemId) -> Result<i64>;

    /// Drops at or above `min_percent` detected since `since_ns`, largest first.
    async fn recent_drops(&self, min_percent: f64, since_ns: i64, limit: usize)
        -> Result<Vec<DropRecord>>;

    /// Active items matching `criteria`, closest to their floor first.
    async fn watch_candidates(&self, criteria: WatchCriteria, limit: usize) -> Result<Vec<ItemId>>;

    /// Deletes observations older than `cutoff_ns`, always keeping each item's latest one.
    async fn purge_observations_before(&self, cutoff_ns: i64) -> Result<u64>;

    async fn insert_run(&self, run: &ScrapeRun) -> Result<i64>;

    async fn update_run(&self, run: &ScrapeRun) -> Result<()>;

    async fn get_run(&self, id: i64) -> Result<Option<ScrapeRun>>;

    /// Most recent first.
    async fn recent_runs(&self, limit: usize) -> Result<Vec<ScrapeRun>>;

    async fn save_score(&self, item_id: ItemId, score: &Score, now_ns: i64) -> Result<()>;

    async fn latest_score(&self, item_id: ItemId) -> Result<Option<Score>>;
}

/// Shared by both stores so "price changed" means the same thing everywhere.
pub fn price_changed(old: f64, new: f64) -> bool {
    (old - new).abs() > crate::config::drop_thresholds::PRICE_EPSILON
}
