use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{Config, HOUSEKEEPING_INTERVAL_SECS, WATCHLIST_CANDIDATE_POOL};
use crate::db::Store;
use crate::error::Result;
use crate::orchestrator::{BatchReport, ScrapeOrchestrator};
use crate::scheduler::SmartScheduler;
use crate::tracker::PriceTracker;
use crate::types::{now_ns, TriggerOrigin, DAY_NS};

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub tick_interval: Duration,
    pub max_jobs_per_tick: usize,
    pub max_concurrency: usize,
    pub watchlist_size: usize,
    pub retention_days: i64,
    pub stale_item_days: i64,
}

impl LoopSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            tick_interval: cfg.tick_interval,
            max_jobs_per_tick: cfg.max_jobs_per_tick,
            max_concurrency: cfg.max_concurrency,
            watchlist_size: cfg.watchlist_size,
            retention_days: cfg.retention_days,
            stale_item_days: cfg.stale_item_days,
        }
    }
}

/// Timer that asks the scheduler for due jobs and hands them to the orchestrator.
pub struct ScrapeLoop {
    orchestrator: Arc<ScrapeOrchestrator>,
    scheduler: Arc<SmartScheduler>,
    tracker: Arc<PriceTracker>,
    store: Arc<dyn Store>,
    settings: LoopSettings,
}

impl ScrapeLoop {
    pub fn new(
        orchestrator: Arc<ScrapeOrchestrator>,
        scheduler: Arc<SmartScheduler>,
        tracker: Arc<PriceTracker>,
        store: Arc<dyn Store>,
        settings: LoopSettings,
    ) -> Self {
        Self { orchestrator, scheduler, tracker, store, settings }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = interval(self.settings.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut housekeeping = interval(Duration::from_secs(HOUSEKEEPING_INTERVAL_SECS));
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(tick_secs = self.settings.tick_interval.as_secs(), "Scrape loop started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(&cancel).await {
                        error!("Scrape tick failed: {e}");
                    }
                }
                _ = housekeeping.tick() => {
                    if let Err(e) = self.housekeeping().await {
                        error!("Housekeeping failed: {e}");
                    }
                }
            }
        }
        info!("Scrape loop stopped");
    }

    /// One scheduling round. Runs whatever is due and returns the batch.
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<BatchReport> {
        let pool = WATCHLIST_CANDIDATE_POOL.max(self.settings.watchlist_size);
        let candidates = self.tracker.list_watch_candidates(pool).await?;
        let jobs = self.scheduler.select_next_jobs(self.settings.max_jobs_per_tick, &candidates);
        if jobs.is_empty() {
            debug!(candidates = candidates.len(), "Nothing due");
            return Ok(BatchReport::default());
        }
        info!(jobs = jobs.len(), candidates = candidates.len(), "Dispatching due jobs");
        Ok(self
            .orchestrator
            .run_jobs(jobs, self.settings.max_concurrency, TriggerOrigin::Scheduled, cancel)
            .await)
    }

    pub async fn housekeeping(&self) -> Result<()> {
        let purged = self.tracker.purge_older_than(self.settings.retention_days).await?;
        let seen_before = now_ns() - self.settings.stale_item_days * DAY_NS;
        let deactivated = self.store.deactivate_stale_items(seen_before).await?;
        info!(event = "HOUSEKEEPING", purged, deactivated, "Housekeeping complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::runner::testing::{catalog_of, product, FakeCollector};
    use crate::collector::CollectorRegistry;
    use crate::comparables::NoComparables;
    use crate::config::SourceCatalog;
    use crate::db::MemoryStore;
    use crate::notifier::NoopNotifier;
    use crate::orchestrator::{OrchestratorSettings, Pipeline};
    use crate::scheduler::LayerConfig;
    use crate::scorer::ScoringEngine;
    use crate::config::WATCHLIST_SOURCE;
    use crate::types::{JobKind, RunStatus};

    fn scrape_loop(store: &Arc<MemoryStore>) -> ScrapeLoop {
        let catalog =
            SourceCatalog::from_json(r#"{"sources": {"shop": {"layers": {"seed": ["L"]}}}}"#).unwrap();
        let mut registry = CollectorRegistry::new();
        registry.register(Arc::new(FakeCollector::new("shop").with_listing("L", catalog_of(4, 80.0))));
        let scheduler = Arc::new(SmartScheduler::new(&catalog, LayerConfig::defaults(20)).unwrap());
        let tracker = PriceTracker::new(store.clone());
        let orchestrator = ScrapeOrchestrator::new(
            Pipeline {
                store: store.clone(),
                catalog,
                registry,
                proxies: None,
                tracker: tracker.clone(),
                scorer: ScoringEngine::default(),
                comparables: Arc::new(NoComparables),
                notifier: Arc::new(NoopNotifier),
                scheduler: scheduler.clone(),
            },
            OrchestratorSettings {
                item_pacing: Duration::ZERO,
                run_timeout: Duration::from_secs(60),
                http_timeout: Duration::from_secs(5),
                alert_min_score: 70.0,
            },
        );
        ScrapeLoop::new(
            orchestrator,
            scheduler,
            tracker,
            store.clone(),
            LoopSettings {
                tick_interval: Duration::from_secs(60),
                max_jobs_per_tick: 3,
                max_concurrency: 3,
                watchlist_size: 20,
                retention_days: 90,
                stale_item_days: 14,
            },
        )
    }

    #[tokio::test]
    async fn tick_runs_due_layers_once() {
        let store = MemoryStore::new();
        let lp = scrape_loop(&store);
        let cancel = CancellationToken::new();

        let first = lp.tick(&cancel).await.unwrap();
        assert_eq!(first.reports.len(), 1);
        assert_eq!(first.reports[0].status, RunStatus::Completed);
        assert_eq!(first.items_created, 4);
        let runs = store.recent_runs(10).await.unwrap();
        assert_eq!(runs[0].trigger, TriggerOrigin::Scheduled);

        // Fresh items sit at their floor, so the watchlist is due; seed was just stamped.
        let second = lp.tick(&cancel).await.unwrap();
        assert_eq!(second.reports.len(), 1);
        let watch = &second.reports[0];
        assert_eq!(watch.kind, JobKind::WatchlistCheck);
        assert_eq!(watch.source, WATCHLIST_SOURCE);
        assert_eq!(watch.status, RunStatus::Completed);
        assert_eq!(watch.items_updated, 4);
        assert!(second.reports.iter().all(|r| r.kind != JobKind::LayerScrape));

        let third = lp.tick(&cancel).await.unwrap();
        assert!(third.reports.is_empty());
    }

    #[tokio::test]
    async fn housekeeping_deactivates_stale_items() {
        let store = MemoryStore::new();
        let lp = scrape_loop(&store);
        let old = now_ns() - 30 * DAY_NS;
        let stale = store.upsert_item("shop", "https://shop.test/old", &product("OLD", 40.0), old).await.unwrap();
        let fresh = store.upsert_item("shop", "https://shop.test/new", &product("NEW", 40.0), now_ns()).await.unwrap();

        lp.housekeeping().await.unwrap();
        assert!(!store.get_item(stale.item.id).await.unwrap().unwrap().active);
        assert!(store.get_item(fresh.item.id).await.unwrap().unwrap().active);
    }

    #[tokio::test]
    async fn run_returns_once_cancelled() {
        let store = MemoryStore::new();
        let lp = scrape_loop(&store);
        let cancel = CancellationToken::new();
        cancel.cancel();
        lp.run(cancel).await;
    }
}
