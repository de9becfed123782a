use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::db::store::{price_changed, Store, WatchCriteria};
use crate::error::{AppError, Result};
use crate::types::{
    DropRecord, ItemId, PriceObservation, PriceStats, ProductItem, Score, ScrapeRun, TrackedItem,
    UpsertAction, UpsertOutcome,
};

// ---------------------------------------------------------------------------
// MemoryState: everything behind one lock so multi-table writes are atomic
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    items: BTreeMap<ItemId, TrackedItem>,
    by_key: HashMap<(String, String), ItemId>,
    stats: HashMap<ItemId, PriceStats>,
    observations: Vec<PriceObservation>,
    runs: BTreeMap<i64, ScrapeRun>,
    scores: HashMap<ItemId, Score>,
    next_item_id: i64,
    next_observation_id: i64,
    next_run_id: i64,
}

/// In-process store with the same invariants as the SQLite one. Backs tests
/// and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| AppError::Store("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_item(
        &self,
        source: &str,
        url: &str,
        item: &ProductItem,
        now_ns: i64,
    ) -> Result<UpsertOutcome> {
        let mut state = self.lock()?;
        let key = (source.to_string(), item.external_id.clone());

        if let Some(&id) = state.by_key.get(&key) {
            if let Some(existing) = state.items.get_mut(&id) {
                let changed = price_changed(existing.price, item.price);
                existing.title = item.title.clone();
                if existing.brand.is_none() {
                    existing.brand = item.brand.clone();
                }
                existing.price = item.price;
                existing.list_price = item.list_price;
                existing.discount_pct = item.effective_discount();
                existing.url = url.to_string();
                if item.image_url.is_some() {
                    existing.image_url = item.image_url.clone();
                }
                if existing.category.is_none() {
                    existing.category = item.category.clone();
                }
                if existing.color.is_none() {
                    existing.color = item.color.clone();
                }
                existing.sizes = item.sizes.clone();
                existing.in_stock = item.in_stock;
                existing.active = true;
                existing.last_seen_ns = now_ns;
                return Ok(UpsertOutcome {
                    item: existing.clone(),
                    action: UpsertAction::Updated { price_changed: changed },
                });
            }
        }

        state.next_item_id += 1;
        let id = state.next_item_id;
        let tracked = TrackedItem {
            id,
            source: source.to_string(),
            external_id: item.external_id.clone(),
            title: item.title.clone(),
            brand: item.brand.clone(),
            price: item.price,
            list_price: item.list_price,
            discount_pct: item.effective_discount(),
            url: url.to_string(),
            image_url: item.image_url.clone(),
            category: item.category.clone(),
            color: item.color.clone(),
            sizes: item.sizes.clone(),
            in_stock: item.in_stock,
            active: true,
            first_seen_ns: now_ns,
            last_seen_ns: now_ns,
        };
        state.by_key.insert(key, id);
        state.items.insert(id, tracked.clone());
        Ok(UpsertOutcome { item: tracked, action: UpsertAction::Created })
    }

    async fn get_item(&self, id: ItemId) -> Result<Option<TrackedItem>> {
        Ok(self.lock()?.items.get(&id).cloned())
    }

    async fn items_by_ids(&self, ids: &[ItemId]) -> Result<Vec<TrackedItem>> {
        let state = self.lock()?;
        let mut items: Vec<TrackedItem> =
            ids.iter().filter_map(|id| state.items.get(id).cloned()).collect();
        items.sort_by_key(|i| i.id);
        items.dedup_by_key(|i| i.id);
        Ok(items)
    }

    async fn deactivate_stale_items(&self, seen_before_ns: i64) -> Result<u64> {
        let mut state = self.lock()?;
        let mut n = 0;
        for item in state.items.values_mut() {
            if item.active && item.last_seen_ns < seen_before_ns {
                item.active = false;
                n += 1;
            }
        }
        Ok(n)
    }

    async fn load_price_stats(&self, item_id: ItemId) -> Result<Option<PriceStats>> {
        Ok(self.lock()?.stats.get(&item_id).cloned())
    }

    async fn observation_history(
        &self,
        item_id: ItemId,
        since_ns: i64,
    ) -> Result<Vec<PriceObservation>> {
        let state = self.lock()?;
        let mut history: Vec<PriceObservation> = state
            .observations
            .iter()
            .filter(|o| o.item_id == item_id && o.observed_at_ns >= since_ns)
            .cloned()
            .collect();
        history.sort_by_key(|o| (o.observed_at_ns, o.id));
        Ok(history)
    }

    async fn commit_observation(&self, obs: &PriceObservation, stats: &PriceStats) -> Result<i64> {
        let mut state = self.lock()?;
        if !state.items.contains_key(&obs.item_id) {
            return Err(AppError::Store(format!("unknown item {}", obs.item_id)));
        }
        state.next_observation_id += 1;
        let id = state.next_observation_id;
        state.observations.push(PriceObservation { id, ..obs.clone() });
        state.stats.insert(stats.item_id, stats.clone());
        Ok(id)
    }

    async fn observation_count(&self, item_id: ItemId) -> Result<i64> {
        let state = self.lock()?;
        Ok(state.observations.iter().filter(|o| o.item_id == item_id).count() as i64)
    }

    async fn recent_drops(
        &self,
        min_percent: f64,
        since_ns: i64,
        limit: usize,
    ) -> Result<Vec<DropRecord>> {
        let state = self.lock()?;
        let mut drops: Vec<DropRecord> = state
            .stats
            .values()
            .filter(|s| {
                s.is_drop
                    && s.drop_percent.is_some_and(|p| p >= min_percent)
                    && s.drop_detected_at_ns.is_some_and(|t| t >= since_ns)
            })
            .filter_map(|s| {
                state
                    .items
                    .get(&s.item_id)
                    .map(|item| DropRecord { item: item.clone(), stats: s.clone() })
            })
            .collect();
        drops.sort_by(|a, b| {
            let pa = a.stats.drop_percent.unwrap_or(0.0);
            let pb = b.stats.drop_percent.unwrap_or(0.0);
            pb.total_cmp(&pa).then(a.item.id.cmp(&b.item.id))
        });
        drops.truncate(limit);
        Ok(drops)
    }

    async fn watch_candidates(&self, criteria: WatchCriteria, limit: usize) -> Result<Vec<ItemId>> {
        let state = self.lock()?;
        let mut matches: Vec<&PriceStats> = state
            .stats
            .values()
            .filter(|s| state.items.get(&s.item_id).is_some_and(|i| i.active))
            .filter(|s| criteria.matches(s))
            .collect();
        matches.sort_by(|a, b| {
            WatchCriteria::rank(a)
                .total_cmp(&WatchCriteria::rank(b))
                .then(a.item_id.cmp(&b.item_id))
        });
        Ok(matches.into_iter().take(limit).map(|s| s.item_id).collect())
    }

    async fn purge_observations_before(&self, cutoff_ns: i64) -> Result<u64> {
        let mut state = self.lock()?;
        let mut latest: HashMap<ItemId, i64> = HashMap::new();
        for o in &state.observations {
            let e = latest.entry(o.item_id).or_insert(o.id);
            if o.id > *e {
                *e = o.id;
            }
        }
        let before = state.observations.len();
        state
            .observations
            .retain(|o| o.observed_at_ns >= cutoff_ns || latest.get(&o.item_id) == Some(&o.id));
        Ok((before - state.observations.len()) as u64)
    }

    async fn insert_run(&self, run: &ScrapeRun) -> Result<i64> {
        let mut state = self.lock()?;
        state.next_run_id += 1;
        let id = state.next_run_id;
        state.runs.insert(id, ScrapeRun { id, ..run.clone() });
        Ok(id)
    }

    async fn update_run(&self, run: &ScrapeRun) -> Result<()> {
        let mut state = self.lock()?;
        match state.runs.get_mut(&run.id) {
            Some(existing) => {
                *existing = run.clone();
                Ok(())
            }
            None => Err(AppError::Store(format!("unknown run {}", run.id))),
        }
    }

    async fn get_run(&self, id: i64) -> Result<Option<ScrapeRun>> {
        Ok(self.lock()?.runs.get(&id).cloned())
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<ScrapeRun>> {
        let state = self.lock()?;
        let mut runs: Vec<ScrapeRun> = state.runs.values().cloned().collect();
        runs.sort_by(|a, b| b.started_at_ns.cmp(&a.started_at_ns).then(b.id.cmp(&a.id)));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn save_score(&self, item_id: ItemId, score: &Score, _now_ns: i64) -> Result<()> {
        self.lock()?.scores.insert(item_id, score.clone());
        Ok(())
    }

    async fn latest_score(&self, item_id: ItemId) -> Result<Option<Score>> {
        Ok(self.lock()?.scores.get(&item_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DAY_NS;

    fn product(external_id: &str, price: f64) -> ProductItem {
        ProductItem {
            external_id: external_id.to_string(),
            title: "Runner".to_string(),
            price,
            in_stock: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn key_is_source_and_external_id() {
        let store = MemoryStore::new();
        let a = store.upsert_item("s1", "u", &product("X", 50.0), 1).await.unwrap();
        let b = store.upsert_item("s2", "u", &product("X", 50.0), 1).await.unwrap();
        let again = store.upsert_item("s1", "u", &product("X", 50.005), 2).await.unwrap();
        assert_ne!(a.item.id, b.item.id);
        assert_eq!(again.item.id, a.item.id);
        assert_eq!(again.action, UpsertAction::Updated { price_changed: false });
        assert!(!again.needs_tracking());
    }

    #[tokio::test]
    async fn purge_spares_the_newest_observation_per_item() {
        let store = MemoryStore::new();
        let a = store.upsert_item("s", "u", &product("A", 10.0), 0).await.unwrap().item;
        let b = store.upsert_item("s", "u", &product("B", 10.0), 0).await.unwrap().item;
        let stats = PriceStats::seed(a.id, 10.0, 0);
        for (item, day) in [(a.id, 1), (a.id, 2), (b.id, 1), (a.id, 60)] {
            let obs = PriceObservation {
                id: 0,
                item_id: item,
                price: 10.0,
                list_price: None,
                url: None,
                observed_at_ns: day * DAY_NS,
            };
            store.commit_observation(&obs, &stats).await.unwrap();
        }
        let removed = store.purge_observations_before(30 * DAY_NS).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.observation_count(a.id).await.unwrap(), 1);
        assert_eq!(store.observation_count(b.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn commit_rejects_unknown_item() {
        let store = MemoryStore::new();
        let obs = PriceObservation {
            id: 0,
            item_id: 99,
            price: 1.0,
            list_price: None,
            url: None,
            observed_at_ns: 0,
        };
        let err = store.commit_observation(&obs, &PriceStats::seed(99, 1.0, 0)).await;
        assert!(err.is_err());
    }
}
