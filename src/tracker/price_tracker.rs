use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::drop_thresholds;
use crate::db::store::{price_changed, Store, WatchCriteria};
use crate::error::Result;
use crate::tracker::stats::{classify_drop, compute_aggregates, select_threshold};
use crate::types::{
    now_ns, DropRecord, DropSignal, ItemId, PriceObservation, PriceStats, DAY_NS, HOUR_NS,
};

/// Appends price observations, keeps per-item aggregates current and flags drops.
///
/// Observations for one item are applied strictly in arrival order through a
/// per-item async mutex; different items proceed in parallel.
pub struct PriceTracker {
    store: Arc<dyn Store>,
    locks: DashMap<ItemId, Arc<Mutex<()>>>,
}

impl PriceTracker {
    pub fn new(store: Arc<dyn Store>) -> Arc<Self> {
        Arc::new(Self { store, locks: DashMap::new() })
    }

    pub fn watch_criteria() -> WatchCriteria {
        WatchCriteria {
            min_observations_for_trend: drop_thresholds::MIN_OBSERVATIONS_FOR_TREND,
            near_floor_factor: drop_thresholds::NEAR_FLOOR_FACTOR,
            volatile_cv: drop_thresholds::VOLATILE_CV,
        }
    }

    pub async fn record_observation(
        &self,
        item_id: ItemId,
        price: f64,
        list_price: Option<f64>,
        url: Option<&str>,
    ) -> Result<DropSignal> {
        self.record_observation_at(item_id, price, list_price, url, now_ns()).await
    }

    pub async fn record_observation_at(
        &self,
        item_id: ItemId,
        price: f64,
        list_price: Option<f64>,
        url: Option<&str>,
        now: i64,
    ) -> Result<DropSignal> {
        let lock = self.lock_for(item_id);
        let guard = lock.lock().await;
        let result = self.apply(item_id, price, list_price, url, now).await;
        drop(guard);
        drop(lock);
        self.locks.remove_if(&item_id, |_, l| Arc::strong_count(l) == 1);
        result
    }

    fn lock_for(&self, item_id: ItemId) -> Arc<Mutex<()>> {
        self.locks.entry(item_id).or_default().clone()
    }

    async fn apply(
        &self,
        item_id: ItemId,
        price: f64,
        list_price: Option<f64>,
        url: Option<&str>,
        now: i64,
    ) -> Result<DropSignal> {
        let obs = PriceObservation {
            id: 0,
            item_id,
            price,
            list_price,
            url: url.map(str::to_string),
            observed_at_ns: now,
        };

        let (stats, signal) = match self.store.load_price_stats(item_id).await? {
            // First sighting: every aggregate is the price itself, never a drop.
            None => (PriceStats::seed(item_id, price, now), DropSignal::none()),
            Some(mut stats) => {
                let mut signal = DropSignal::none();
                if price_changed(stats.current_price, price) {
                    stats.previous_price = Some(stats.current_price);
                    stats.current_price = price;
                    stats.price_change_count += 1;

                    let threshold = select_threshold(stats.cv_30d);
                    signal = classify_drop(price, stats.min_30d, stats.previous_price, threshold);
                    // The flag describes the latest price change only.
                    stats.is_drop = signal.is_drop;
                    stats.drop_percent = signal.drop_percent;
                    stats.drop_detected_at_ns = signal.is_drop.then_some(now);

                    // Keep the window extremes current between full recomputes,
                    // so one decline is not re-flagged against a stale floor.
                    stats.min_30d = stats.min_30d.min(price);
                    stats.max_30d = stats.max_30d.max(price);
                    stats.min_7d = stats.min_7d.min(price);
                    stats.max_7d = stats.max_7d.max(price);
                }
                stats.observation_count += 1;
                stats.updated_at_ns = now;

                if stats.observation_count % drop_thresholds::RECOMPUTE_EVERY == 0 {
                    let mut history =
                        self.store.observation_history(item_id, now - 30 * DAY_NS).await?;
                    history.push(obs.clone());
                    if let Some(agg) = compute_aggregates(&history, now) {
                        agg.apply_to(&mut stats, now);
                    }
                    debug!(item_id, observations = stats.observation_count, "Price aggregates recomputed");
                }
                (stats, signal)
            }
        };

        self.store.commit_observation(&obs, &stats).await?;

        if signal.is_drop {
            info!(
                event = "PRICE_DROP",
                item_id,
                price,
                drop_percent = signal.drop_percent.unwrap_or_default(),
                floor_30d = stats.min_30d,
                "PRICE DROP | item {item_id} at {price:.2} (-{:.1}%)",
                signal.drop_percent.unwrap_or_default(),
            );
        }

        Ok(signal)
    }

    pub async fn stats(&self, item_id: ItemId) -> Result<Option<PriceStats>> {
        self.store.load_price_stats(item_id).await
    }

    pub async fn list_recent_drops(
        &self,
        min_drop_percent: f64,
        window_hours: i64,
        limit: usize,
    ) -> Result<Vec<DropRecord>> {
        let since = now_ns() - window_hours * HOUR_NS;
        self.store.recent_drops(min_drop_percent, since, limit).await
    }

    pub async fn list_watch_candidates(&self, limit: usize) -> Result<Vec<ItemId>> {
        self.store.watch_candidates(Self::watch_criteria(), limit).await
    }

    /// Deletes observations older than `days`, keeping each item's latest one.
    pub async fn purge_older_than(&self, days: i64) -> Result<u64> {
        let cutoff = now_ns() - days * DAY_NS;
        let purged = self.store.purge_observations_before(cutoff).await?;
        info!(purged, days, "Price history purge complete");
        Ok(purged)
    }
}
