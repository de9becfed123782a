pub mod run_log;

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Datelike;
use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collector::{CollectorRegistry, CollectorRunner, FetchContext, FetchPath};
use crate::comparables::ComparablesLookup;
use crate::config::{layer_defaults, Config, SourceCatalog, MAX_REPORTED_ERRORS};
use crate::db::Store;
use crate::error::{AppError, CollectError, Result};
use crate::notifier::{Alert, AlertKind, Notifier};
use crate::proxy::pool::redact;
use crate::proxy::ProxyPool;
use crate::scheduler::SmartScheduler;
use crate::scorer::{ScoringEngine, ScoringInput};
use crate::tracker::PriceTracker;
use crate::types::{
    now_ns, Comparables, DropSignal, JobKind, Layer, ProductItem, RunStatus, Score, ScrapeJob,
    TrackedItem, TriggerOrigin, UpsertAction, UpsertOutcome,
};
use run_log::{RunCounts, RunRecorder};

// ---------------------------------------------------------------------------
// Settings and collaborators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Delay between item fetches within one run. Zero in tests.
    pub item_pacing: Duration,
    pub run_timeout: Duration,
    pub http_timeout: Duration,
    pub alert_min_score: f64,
}

impl OrchestratorSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            item_pacing: cfg.item_pacing,
            run_timeout: cfg.run_timeout,
            http_timeout: cfg.http_timeout,
            alert_min_score: cfg.alert_min_score,
        }
    }
}

/// Everything a source run touches.
pub struct Pipeline {
    pub store: Arc<dyn Store>,
    pub catalog: SourceCatalog,
    pub registry: CollectorRegistry,
    /// `None` runs every request direct.
    pub proxies: Option<Arc<ProxyPool>>,
    pub tracker: Arc<PriceTracker>,
    pub scorer: ScoringEngine,
    pub comparables: Arc<dyn ComparablesLookup>,
    pub notifier: Arc<dyn Notifier>,
    pub scheduler: Arc<SmartScheduler>,
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub kind: JobKind,
    pub source: String,
    pub layer: Layer,
    /// `None` when the audit record itself could not be written.
    pub run_id: Option<i64>,
    pub status: RunStatus,
    pub items_found: i64,
    pub items_created: i64,
    pub items_updated: i64,
    pub error_count: i64,
    /// First `MAX_REPORTED_ERRORS` per-item errors.
    pub errors: Vec<String>,
    pub error_message: Option<String>,
    pub drops: u32,
    pub alerts_sent: u32,
    pub fallbacks: u32,
    pub duration_ms: f64,
}

impl SourceReport {
    fn unrecorded(kind: JobKind, source: String, layer: Layer, message: String) -> Self {
        Self {
            kind,
            source,
            layer,
            run_id: None,
            status: RunStatus::Failed,
            items_found: 0,
            items_created: 0,
            items_updated: 0,
            error_count: 0,
            errors: Vec::new(),
            error_message: Some(message),
            drops: 0,
            alerts_sent: 0,
            fallbacks: 0,
            duration_ms: 0.0,
        }
    }

    /// What the scheduler is told: a completed run that collected something,
    /// or at least did not fail on every item.
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Completed
            && !(self.items_created + self.items_updated == 0 && self.error_count > 0)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub reports: Vec<SourceReport>,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub items_created: i64,
    pub items_updated: i64,
    pub error_count: i64,
}

impl BatchReport {
    fn from_reports(reports: Vec<SourceReport>) -> Self {
        let mut batch = BatchReport::default();
        for r in &reports {
            match r.status {
                RunStatus::Completed => batch.completed += 1,
                RunStatus::Cancelled => batch.cancelled += 1,
                _ => batch.failed += 1,
            }
            batch.items_created += r.items_created;
            batch.items_updated += r.items_updated;
            batch.error_count += r.error_count;
        }
        batch.reports = reports;
        batch
    }
}

/// Running counters for one source run.
#[derive(Debug, Default)]
struct RunTally {
    found: i64,
    created: i64,
    updated: i64,
    error_count: i64,
    errors: Vec<String>,
    drops: u32,
    alerts_sent: u32,
    fallbacks: u32,
}

impl RunTally {
    fn item_error(&mut self, url: &str, err: impl Display) {
        self.error_count += 1;
        if self.errors.len() < MAX_REPORTED_ERRORS {
            self.errors.push(format!("{url}: {err}"));
        }
    }

    fn counts(&self) -> RunCounts {
        RunCounts {
            items_found: self.found,
            items_created: self.created,
            items_updated: self.updated,
            error_count: self.error_count,
        }
    }
}

/// Why a run stopped early, and in which phase.
struct RunFailure {
    phase: &'static str,
    error: AppError,
}

impl RunFailure {
    fn new(phase: &'static str, error: AppError) -> Self {
        Self { phase, error }
    }
}

// ---------------------------------------------------------------------------
// ScrapeOrchestrator
// ---------------------------------------------------------------------------

/// Runs scrape jobs under bounded concurrency. Each job gets one audit record
/// and its own task; one source failing never aborts its siblings.
pub struct ScrapeOrchestrator {
    deps: Pipeline,
    settings: OrchestratorSettings,
}

impl ScrapeOrchestrator {
    pub fn new(deps: Pipeline, settings: OrchestratorSettings) -> Arc<Self> {
        Arc::new(Self { deps, settings })
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.deps.catalog.source_ids().map(str::to_string).collect()
    }

    /// One seed-layer run per known source, triggered manually.
    pub async fn run_sources(self: &Arc<Self>, sources: &[String], max_concurrency: usize) -> BatchReport {
        let jobs = sources.iter().filter_map(|s| self.seed_job(s)).collect();
        self.run_jobs(jobs, max_concurrency, TriggerOrigin::Manual, &CancellationToken::new())
            .await
    }

    fn seed_job(&self, source: &str) -> Option<ScrapeJob> {
        if self.deps.registry.get(source).is_none() {
            warn!(source, "Unknown source skipped");
            return None;
        }
        let urls = self.deps.catalog.urls(source, Layer::Seed);
        if urls.is_empty() {
            warn!(source, "Source has no seed URLs, skipped");
            return None;
        }
        Some(ScrapeJob {
            kind: JobKind::LayerScrape,
            source: source.to_string(),
            layer: Layer::Seed,
            urls: urls.to_vec(),
            item_ids: Vec::new(),
            max_items: layer_defaults::SEED_MAX_ITEMS,
            priority: 1,
        })
    }

    pub async fn run_jobs(
        self: &Arc<Self>,
        jobs: Vec<ScrapeJob>,
        max_concurrency: usize,
        origin: TriggerOrigin,
        cancel: &CancellationToken,
    ) -> BatchReport {
        let gate = Arc::new(Semaphore::new(max_concurrency.max(1)));
        let mut labels = Vec::with_capacity(jobs.len());
        let mut handles = Vec::with_capacity(jobs.len());

        for job in jobs {
            labels.push((job.kind, job.source.clone(), job.layer));
            let this = Arc::clone(self);
            let gate = Arc::clone(&gate);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let _permit = gate.acquire_owned().await.ok();
                this.run_job(job, origin, cancel).await
            }));
        }

        let mut reports = Vec::with_capacity(handles.len());
        for ((kind, source, layer), joined) in labels.into_iter().zip(join_all(handles).await) {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => {
                    error!(source = %source, layer = %layer, "Source run task aborted: {e}");
                    let report = SourceReport::unrecorded(kind, source, layer, format!("task aborted: {e}"));
                    self.feed_back(&report);
                    reports.push(report);
                }
            }
        }

        let batch = BatchReport::from_reports(reports);
        info!(
            event = "BATCH_COMPLETE",
            trigger = %origin,
            completed = batch.completed,
            failed = batch.failed,
            cancelled = batch.cancelled,
            created = batch.items_created,
            updated = batch.items_updated,
            errors = batch.error_count,
            "Batch finished: {} completed, {} failed, {} cancelled",
            batch.completed,
            batch.failed,
            batch.cancelled,
        );
        batch
    }

    async fn run_job(&self, job: ScrapeJob, origin: TriggerOrigin, cancel: CancellationToken) -> SourceReport {
        let proxy = self.acquire_proxy();
        let mut recorder = match RunRecorder::start(
            Arc::clone(&self.deps.store),
            &job.source,
            job.layer,
            origin,
            proxy.as_deref().map(redact),
        )
        .await
        {
            Ok(r) => r,
            Err(e) => {
                error!(source = %job.source, layer = %job.layer, "Could not open run record: {e}");
                let report = SourceReport::unrecorded(job.kind, job.source, job.layer, e.to_string());
                self.feed_back(&report);
                return report;
            }
        };
        let run_id = recorder.run().id;
        let started = Instant::now();
        let mut tally = RunTally::default();

        let result = match job.kind {
            JobKind::LayerScrape => {
                self.scrape_layer(&job, proxy.as_deref(), &mut recorder, &mut tally, &cancel).await
            }
            JobKind::WatchlistCheck => {
                self.check_watchlist(&job, proxy.as_deref(), &mut recorder, &mut tally, &cancel).await
            }
        };

        let counts = tally.counts();
        let (intended, finished) = match &result {
            Ok(()) => (RunStatus::Completed, recorder.complete(counts).await),
            Err(f) if matches!(f.error, AppError::Cancelled) => {
                (RunStatus::Cancelled, recorder.cancel(counts).await)
            }
            Err(f) => (RunStatus::Failed, recorder.fail(counts, &f.error, f.phase).await),
        };
        let (status, duration_ms, error_message) = match finished {
            Ok(run) => (run.status, run.duration_ms.unwrap_or_default(), run.error_message),
            Err(e) => (
                intended,
                started.elapsed().as_secs_f64() * 1e3,
                Some(result.as_ref().err().map_or_else(|| e.to_string(), |f| f.error.to_string())),
            ),
        };

        let report = SourceReport {
            kind: job.kind,
            source: job.source,
            layer: job.layer,
            run_id: Some(run_id),
            status,
            items_found: tally.found,
            items_created: tally.created,
            items_updated: tally.updated,
            error_count: tally.error_count,
            errors: tally.errors,
            error_message,
            drops: tally.drops,
            alerts_sent: tally.alerts_sent,
            fallbacks: tally.fallbacks,
            duration_ms,
        };

        if report.status == RunStatus::Failed {
            error!(
                event = "SCRAPE_RUN_FAILED",
                source = %report.source,
                layer = %report.layer,
                run_id,
                error = report.error_message.as_deref().unwrap_or_default(),
                "Run failed",
            );
        } else {
            info!(
                event = "SCRAPE_RUN_COMPLETE",
                source = %report.source,
                layer = %report.layer,
                run_id,
                status = %report.status,
                found = report.items_found,
                created = report.items_created,
                updated = report.items_updated,
                errors = report.error_count,
                drops = report.drops,
                fallbacks = report.fallbacks,
                "Run {} for {}/{}",
                report.status,
                report.source,
                report.layer,
            );
        }

        self.feed_back(&report);
        report
    }

    fn feed_back(&self, report: &SourceReport) {
        let new_items = u32::try_from(report.items_created).unwrap_or(u32::MAX);
        self.deps.scheduler.report_outcome(&report.source, report.layer, report.succeeded(), new_items);
    }

    // --- layer scrape ---

    async fn scrape_layer(
        &self,
        job: &ScrapeJob,
        proxy: Option<&str>,
        recorder: &mut RunRecorder,
        tally: &mut RunTally,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), RunFailure> {
        let collector = self.deps.registry.get(&job.source).ok_or_else(|| {
            RunFailure::new("setup", AppError::Config(format!("no collector for source {}", job.source)))
        })?;
        let ctx = FetchContext::build(proxy, self.settings.http_timeout)
            .map_err(|e| RunFailure::new("setup", e))?;
        let runner = CollectorRunner::new(collector, ctx);
        recorder.in_progress().await.map_err(|e| RunFailure::new("setup", e))?;
        let deadline = Instant::now() + self.settings.run_timeout;

        let discovery = match self.guarded(runner.discover(&job.urls, job.max_items), deadline, cancel).await {
            Ok(Ok(d)) => d,
            Ok(Err(e)) => {
                self.charge_proxy(proxy, &e);
                return Err(RunFailure::new("discover", e.into()));
            }
            Err(halt) => return Err(RunFailure::new("discover", halt)),
        };
        tally.found = discovery.urls.len() as i64;
        tally.fallbacks += discovery.fallbacks as u32;
        for (listing, e) in &discovery.failed_listings {
            self.charge_proxy(proxy, e);
            tally.item_error(listing, e);
        }
        debug!(source = %job.source, layer = %job.layer, found = tally.found, "Discovery finished");

        for (i, url) in discovery.urls.iter().enumerate() {
            if i > 0 {
                self.pace(deadline, cancel).await.map_err(|e| RunFailure::new("fetch", e))?;
            }
            let fetched = match self.guarded(runner.fetch_detail(url), deadline, cancel).await {
                Ok(Ok(f)) => f,
                Ok(Err(e)) => {
                    self.charge_proxy(proxy, &e);
                    warn!(source = %job.source, url = %url, "Item fetch failed: {e}");
                    tally.item_error(url, &e);
                    continue;
                }
                Err(halt) => return Err(RunFailure::new("fetch", halt)),
            };
            if fetched.path == FetchPath::Rendered {
                tally.fallbacks += 1;
            }
            // Persistence runs to completion even if the deadline passes meanwhile.
            if let Err(e) = self.persist_item(&job.source, url, &fetched.item, tally).await {
                warn!(source = %job.source, url = %url, "Item persistence failed: {e}");
                tally.item_error(url, &e);
            }
        }
        Ok(())
    }

    async fn persist_item(
        &self,
        source: &str,
        url: &str,
        item: &ProductItem,
        tally: &mut RunTally,
    ) -> Result<()> {
        let outcome = self.deps.store.upsert_item(source, url, item, now_ns()).await?;
        match outcome.action {
            UpsertAction::Created => tally.created += 1,
            UpsertAction::Updated { .. } => tally.updated += 1,
        }
        if !outcome.needs_tracking() {
            return Ok(());
        }
        let UpsertOutcome { item: tracked, action } = outcome;

        let signal = self
            .deps
            .tracker
            .record_observation(tracked.id, tracked.price, tracked.list_price, Some(url))
            .await?;
        let score = self.score_item(&tracked).await?;

        if action == UpsertAction::Created && score.overall >= self.settings.alert_min_score {
            let alert = Alert {
                kind: AlertKind::NewDeal,
                item: tracked.clone(),
                score: Some(score.clone()),
                previous_price: None,
                drop_percent: None,
            };
            self.alert(alert, tally).await;
        }
        if signal.is_drop {
            tally.drops += 1;
            self.alert_drop(tracked, score, signal, tally).await;
        }
        Ok(())
    }

    // --- watchlist check ---

    async fn check_watchlist(
        &self,
        job: &ScrapeJob,
        proxy: Option<&str>,
        recorder: &mut RunRecorder,
        tally: &mut RunTally,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), RunFailure> {
        let ctx = FetchContext::build(proxy, self.settings.http_timeout)
            .map_err(|e| RunFailure::new("setup", e))?;
        recorder.in_progress().await.map_err(|e| RunFailure::new("setup", e))?;
        let deadline = Instant::now() + self.settings.run_timeout;

        let items = self
            .deps
            .store
            .items_by_ids(&job.item_ids)
            .await
            .map_err(|e| RunFailure::new("load", e))?;
        tally.found = items.len() as i64;

        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                self.pace(deadline, cancel).await.map_err(|e| RunFailure::new("fetch", e))?;
            }
            let Some(collector) = self.deps.registry.get(&item.source) else {
                tally.item_error(&item.url, format!("no collector for source {}", item.source));
                continue;
            };
            let runner = CollectorRunner::new(collector, ctx.clone());
            let mut fetched = match self.guarded(runner.fetch_detail(&item.url), deadline, cancel).await {
                Ok(Ok(f)) => f,
                Ok(Err(e)) => {
                    self.charge_proxy(proxy, &e);
                    warn!(item_id = item.id, url = %item.url, "Watchlist re-check failed: {e}");
                    tally.item_error(&item.url, &e);
                    continue;
                }
                Err(halt) => return Err(RunFailure::new("fetch", halt)),
            };
            if fetched.path == FetchPath::Rendered {
                tally.fallbacks += 1;
            }
            // The tracked identity wins over whatever id the page reports now.
            fetched.item.external_id = item.external_id.clone();
            if let Err(e) = self.recheck_item(item, &fetched.item, tally).await {
                warn!(item_id = item.id, "Watchlist persistence failed: {e}");
                tally.item_error(&item.url, &e);
            }
        }
        Ok(())
    }

    /// Every re-check records an observation, changed or not. A changed price
    /// is rescored.
    async fn recheck_item(&self, item: &TrackedItem, fresh: &ProductItem, tally: &mut RunTally) -> Result<()> {
        let outcome = self.deps.store.upsert_item(&item.source, &item.url, fresh, now_ns()).await?;
        tally.updated += 1;
        let price_moved = outcome.needs_tracking();
        let tracked = outcome.item;
        let signal = self
            .deps
            .tracker
            .record_observation(tracked.id, tracked.price, tracked.list_price, Some(&tracked.url))
            .await?;
        if !price_moved && !signal.is_drop {
            return Ok(());
        }
        let score = self.score_item(&tracked).await?;
        if signal.is_drop {
            tally.drops += 1;
            self.alert_drop(tracked, score, signal, tally).await;
        }
        Ok(())
    }

    // --- shared steps ---

    async fn score_item(&self, item: &TrackedItem) -> Result<Score> {
        let comparables = match self.deps.comparables.get_comparables(item).await {
            Ok(c) => c,
            Err(e) => {
                warn!(item_id = item.id, "Comparables lookup failed, scoring without: {e}");
                Comparables::default()
            }
        };
        let month = chrono::Utc::now().month();
        let score = self.deps.scorer.score(&ScoringInput { item, comparables: &comparables, month });
        self.deps.store.save_score(item.id, &score, now_ns()).await?;
        debug!(item_id = item.id, score = score.overall, action = score.action.as_str(), "Item scored");
        Ok(score)
    }

    async fn alert_drop(&self, item: TrackedItem, score: Score, signal: DropSignal, tally: &mut RunTally) {
        let previous_price = match self.deps.tracker.stats(item.id).await {
            Ok(stats) => stats.and_then(|s| s.previous_price),
            Err(_) => None,
        };
        let alert = Alert {
            kind: AlertKind::PriceDrop,
            item,
            score: Some(score),
            previous_price,
            drop_percent: signal.drop_percent,
        };
        self.alert(alert, tally).await;
    }

    async fn alert(&self, alert: Alert, tally: &mut RunTally) {
        match self.deps.notifier.notify(&alert).await {
            Ok(()) => tally.alerts_sent += 1,
            Err(e) => warn!(
                event = "ALERT_FAILED",
                item_id = alert.item.id,
                kind = ?alert.kind,
                "Notification failed: {e}"
            ),
        }
    }

    fn acquire_proxy(&self) -> Option<String> {
        let pool = self.deps.proxies.as_ref()?;
        let proxy = pool.acquire();
        if proxy.is_none() {
            warn!(stats = ?pool.stats(), "No proxy available, running direct");
        }
        proxy
    }

    fn charge_proxy(&self, proxy: Option<&str>, err: &CollectError) {
        if let (Some(pool), Some(url)) = (&self.deps.proxies, proxy) {
            if err.implicates_proxy() {
                pool.report_failure(url);
            }
        }
    }

    /// Races `fut` against cancellation and the run deadline. Both are checked
    /// first, so an already-expired run never starts another fetch.
    async fn guarded<F: Future>(
        &self,
        fut: F,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> std::result::Result<F::Output, AppError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AppError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => Err(AppError::Timeout(format!(
                "run exceeded {}s",
                self.settings.run_timeout.as_secs()
            ))),
            out = fut => Ok(out),
        }
    }

    async fn pace(&self, deadline: Instant, cancel: &CancellationToken) -> std::result::Result<(), AppError> {
        self.guarded(tokio::time::sleep(self.settings.item_pacing), deadline, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::collector::runner::testing::{catalog_of, FakeCollector};
    use crate::config::WATCHLIST_SOURCE;
    use crate::db::MemoryStore;
    use crate::notifier::testing::RecordingNotifier;
    use crate::scheduler::LayerConfig;

    struct FixedComparables(Comparables);

    #[async_trait]
    impl ComparablesLookup for FixedComparables {
        async fn get_comparables(&self, _item: &TrackedItem) -> Result<Comparables> {
            Ok(self.0.clone())
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        orch: Arc<ScrapeOrchestrator>,
        scheduler: Arc<SmartScheduler>,
        notifier: Arc<RecordingNotifier>,
    }

    fn settings() -> OrchestratorSettings {
        OrchestratorSettings {
            item_pacing: Duration::ZERO,
            run_timeout: Duration::from_secs(600),
            http_timeout: Duration::from_secs(5),
            alert_min_score: 0.0,
        }
    }

    fn harness(
        collectors: Vec<Arc<FakeCollector>>,
        proxies: Option<Arc<ProxyPool>>,
        settings: OrchestratorSettings,
    ) -> Harness {
        harness_with(collectors, proxies, settings, RecordingNotifier::default())
    }

    fn harness_with(
        collectors: Vec<Arc<FakeCollector>>,
        proxies: Option<Arc<ProxyPool>>,
        settings: OrchestratorSettings,
        notifier: RecordingNotifier,
    ) -> Harness {
        let store = MemoryStore::new();
        let catalog = SourceCatalog::from_json(
            r#"{"sources": {
                "shop": {"name": "Shop", "layers": {"seed": ["L"]}},
                "down": {"name": "Down", "layers": {"seed": ["D"]}}
            }}"#,
        )
        .unwrap();
        let mut registry = CollectorRegistry::new();
        for c in collectors {
            registry.register(c);
        }
        let scheduler = Arc::new(SmartScheduler::new(&catalog, LayerConfig::defaults(20)).unwrap());
        let notifier = Arc::new(notifier);
        let comparables = Comparables {
            listing_count: 60,
            median: 160.0,
            p25: 150.0,
            p75: 175.0,
            cv: Some(10.0),
            liquidity_score: 80.0,
        };
        let orch = ScrapeOrchestrator::new(
            Pipeline {
                store: store.clone(),
                catalog,
                registry,
                proxies,
                tracker: PriceTracker::new(store.clone()),
                scorer: ScoringEngine::default(),
                comparables: Arc::new(FixedComparables(comparables)),
                notifier: notifier.clone(),
                scheduler: scheduler.clone(),
            },
            settings,
        );
        Harness { store, orch, scheduler, notifier }
    }

    fn seed(source: &str, listing: &str) -> ScrapeJob {
        ScrapeJob {
            kind: JobKind::LayerScrape,
            source: source.to_string(),
            layer: Layer::Seed,
            urls: vec![listing.to_string()],
            item_ids: Vec::new(),
            max_items: 50,
            priority: 1,
        }
    }

    async fn run(h: &Harness, jobs: Vec<ScrapeJob>) -> BatchReport {
        h.orch.run_jobs(jobs, 3, TriggerOrigin::Scheduled, &CancellationToken::new()).await
    }

    fn failing_both_paths(fake: &mut FakeCollector, url: &str) {
        fake.structured_errors.insert(url.to_string(), CollectError::Transport("reset".into()));
        fake.rendered_errors.insert(url.to_string(), CollectError::Blocked { status: 403 });
    }

    fn down_source() -> FakeCollector {
        let mut down = FakeCollector::new("down");
        down.structured_discover_error = Some(CollectError::Blocked { status: 503 });
        down.rendered_discover_error = Some(CollectError::Blocked { status: 503 });
        down
    }

    #[tokio::test]
    async fn partial_item_failures_still_complete() {
        let mut fake = FakeCollector::new("shop").with_listing("L", catalog_of(10, 60.0));
        failing_both_paths(&mut fake, "https://shop.test/p/3");
        failing_both_paths(&mut fake, "https://shop.test/p/7");
        let h = harness(vec![Arc::new(fake)], None, settings());

        let batch = run(&h, vec![seed("shop", "L")]).await;
        let r = &batch.reports[0];
        assert_eq!(r.status, RunStatus::Completed);
        assert_eq!(r.items_found, 10);
        assert_eq!(r.items_created, 8);
        assert_eq!(r.error_count, 2);
        assert_eq!(r.errors.len(), 2);

        let stored = h.store.get_run(r.run_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
        assert_eq!(stored.items_created, 8);
        assert_eq!(stored.error_count, 2);
        let ids: Vec<i64> = (1..=10).collect();
        assert_eq!(h.store.items_by_ids(&ids).await.unwrap().len(), 8);
    }

    #[tokio::test]
    async fn error_list_is_bounded() {
        let mut fake = FakeCollector::new("shop").with_listing("L", catalog_of(12, 60.0));
        for i in 0..12 {
            failing_both_paths(&mut fake, &format!("https://shop.test/p/{i}"));
        }
        let h = harness(vec![Arc::new(fake)], None, settings());

        let r = &run(&h, vec![seed("shop", "L")]).await.reports[0];
        assert_eq!(r.status, RunStatus::Completed);
        assert_eq!(r.error_count, 12);
        assert_eq!(r.errors.len(), MAX_REPORTED_ERRORS);
        // Nothing collected: the scheduler hears a failure.
        assert!(!r.succeeded());
        let status = h.scheduler.status();
        let shop = status.iter().find(|l| l.source == "shop").unwrap();
        assert!(shop.success_rate < 1.0);
    }

    #[tokio::test]
    async fn rediscovery_is_idempotent() {
        let fake = Arc::new(FakeCollector::new("shop").with_listing("L", catalog_of(10, 60.0)));
        let h = harness(vec![fake], None, settings());

        let first = run(&h, vec![seed("shop", "L")]).await;
        assert_eq!(first.items_created, 10);
        let before = h.store.get_item(1).await.unwrap().unwrap();
        let second = run(&h, vec![seed("shop", "L")]).await;
        assert_eq!(second.items_created, 0);
        assert_eq!(second.items_updated, 10);
        assert_eq!(second.reports[0].drops, 0);

        // Unchanged price: only last_seen moves, and no observation is written.
        let after = h.store.get_item(1).await.unwrap().unwrap();
        assert_eq!(after.first_seen_ns, before.first_seen_ns);
        assert!(after.last_seen_ns >= before.last_seen_ns);
        assert_eq!(after.price, before.price);
        assert_eq!(after.title, before.title);
        assert_eq!(h.store.observation_count(1).await.unwrap(), 1);
        let stats = h.store.load_price_stats(1).await.unwrap().unwrap();
        assert_eq!(stats.observation_count, 1);
        assert_eq!(stats.price_change_count, 0);
    }

    #[tokio::test]
    async fn new_deals_and_drops_alert() {
        let fake = Arc::new(FakeCollector::new("shop").with_listing("L", catalog_of(3, 60.0)));
        let h = harness(vec![fake.clone()], None, settings());

        run(&h, vec![seed("shop", "L")]).await;
        {
            let alerts = h.notifier.alerts.lock().unwrap();
            assert_eq!(alerts.len(), 3);
            assert!(alerts.iter().all(|a| a.kind == AlertKind::NewDeal));
        }

        fake.set_price("https://shop.test/p/0", 48.0);
        let r = &run(&h, vec![seed("shop", "L")]).await.reports[0];
        assert_eq!(r.drops, 1);
        assert_eq!(r.items_created, 0);

        let alerts = h.notifier.alerts.lock().unwrap();
        let price_drop = alerts.iter().find(|a| a.kind == AlertKind::PriceDrop).unwrap();
        assert_eq!(price_drop.item.id, 1);
        assert_eq!(price_drop.previous_price, Some(60.0));
        assert!((price_drop.drop_percent.unwrap() - 20.0).abs() < 0.01);
        drop(alerts);

        let stats = h.store.load_price_stats(1).await.unwrap().unwrap();
        assert!(stats.is_drop);
        assert!(h.store.latest_score(1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn alert_threshold_filters_new_deals() {
        let fake = Arc::new(FakeCollector::new("shop").with_listing("L", catalog_of(3, 60.0)));
        let h = harness(vec![fake], None, OrchestratorSettings { alert_min_score: 101.0, ..settings() });
        let r = &run(&h, vec![seed("shop", "L")]).await.reports[0];
        assert_eq!(r.alerts_sent, 0);
        assert!(h.notifier.alerts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_notifier_does_not_fail_the_run() {
        let fake = Arc::new(FakeCollector::new("shop").with_listing("L", catalog_of(2, 60.0)));
        let notifier = RecordingNotifier { fail: true, ..Default::default() };
        let h = harness_with(vec![fake], None, settings(), notifier);

        let r = &run(&h, vec![seed("shop", "L")]).await.reports[0];
        assert_eq!(r.status, RunStatus::Completed);
        assert_eq!(r.items_created, 2);
        assert_eq!(r.alerts_sent, 0);
        assert_eq!(h.notifier.alerts.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn one_failing_source_does_not_affect_siblings() {
        let ok = FakeCollector::new("shop").with_listing("L", catalog_of(2, 60.0));
        let h = harness(vec![Arc::new(ok), Arc::new(down_source())], None, settings());

        let batch = run(&h, vec![seed("shop", "L"), seed("down", "D")]).await;
        assert_eq!(batch.completed, 1);
        assert_eq!(batch.failed, 1);

        let down = batch.reports.iter().find(|r| r.source == "down").unwrap();
        assert_eq!(down.status, RunStatus::Failed);
        assert!(down.error_message.as_deref().unwrap().contains("HTTP 503"));
        let stored = h.store.get_run(down.run_id.unwrap()).await.unwrap().unwrap();
        assert!(stored.error_context.unwrap().starts_with("phase=discover"));

        let status = h.scheduler.status();
        let rate = |s: &str| status.iter().find(|l| l.source == s).unwrap().success_rate;
        assert_eq!(rate("shop"), 1.0);
        assert!((rate("down") - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn blocked_runs_charge_their_proxy() {
        let pool = Arc::new(ProxyPool::from_list(&["10.0.0.1:8080".to_string()], 1, Duration::from_secs(300)));
        let h = harness(vec![Arc::new(down_source())], Some(pool.clone()), settings());

        let r = &run(&h, vec![seed("down", "D")]).await.reports[0];
        assert_eq!(r.status, RunStatus::Failed);
        assert_eq!(pool.stats().cooling_down, 1);
        let stored = h.store.get_run(r.run_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(stored.proxy_used.as_deref(), Some("http://10.0.0.1:8080"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fails_only_the_slow_run() {
        let mut slow = FakeCollector::new("shop").with_listing("L", catalog_of(5, 60.0));
        slow.fetch_delay = Some(Duration::from_secs(10));
        let fast = FakeCollector::new("down").with_listing("D", catalog_of(5, 60.0));
        let h = harness(
            vec![Arc::new(slow), Arc::new(fast)],
            None,
            OrchestratorSettings { run_timeout: Duration::from_secs(25), ..settings() },
        );

        let batch = run(&h, vec![seed("shop", "L"), seed("down", "D")]).await;
        let slow = batch.reports.iter().find(|r| r.source == "shop").unwrap();
        assert_eq!(slow.status, RunStatus::Failed);
        assert_eq!(slow.items_created, 2);
        assert!(slow.error_message.as_deref().unwrap().contains("Timed out"));

        let fast = batch.reports.iter().find(|r| r.source == "down").unwrap();
        assert_eq!(fast.status, RunStatus::Completed);
        assert_eq!(fast.items_created, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_new_fetches_and_keeps_persisted_items() {
        let mut slow = FakeCollector::new("shop").with_listing("L", catalog_of(5, 60.0));
        slow.fetch_delay = Some(Duration::from_secs(10));
        let h = harness(vec![Arc::new(slow)], None, settings());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(15)).await;
            trigger.cancel();
        });
        let batch = h.orch.run_jobs(vec![seed("shop", "L")], 1, TriggerOrigin::Scheduled, &cancel).await;
        let r = &batch.reports[0];
        assert_eq!(r.status, RunStatus::Cancelled);
        assert_eq!(r.items_created, 1);
        assert_eq!(batch.cancelled, 1);
        let stored = h.store.get_run(r.run_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Cancelled);
        assert_eq!(h.store.observation_count(1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn watchlist_check_records_every_item_and_flags_drops() {
        let fake = Arc::new(FakeCollector::new("shop").with_listing("L", catalog_of(3, 60.0)));
        let h = harness(vec![fake.clone()], None, settings());
        run(&h, vec![seed("shop", "L")]).await;

        // Item 2 is p/1 at 61.0.
        fake.set_price("https://shop.test/p/1", 45.0);
        let job = ScrapeJob {
            kind: JobKind::WatchlistCheck,
            source: WATCHLIST_SOURCE.to_string(),
            layer: Layer::Watchlist,
            urls: Vec::new(),
            item_ids: vec![2, 3, 99],
            max_items: 3,
            priority: 1,
        };
        let r = &run(&h, vec![job]).await.reports[0];
        assert_eq!(r.status, RunStatus::Completed);
        assert_eq!(r.items_found, 2);
        assert_eq!(r.items_updated, 2);
        assert_eq!(r.drops, 1);
        assert_eq!(h.store.observation_count(2).await.unwrap(), 2);
        assert_eq!(h.store.observation_count(3).await.unwrap(), 2);

        let stored = h.store.get_run(r.run_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(stored.source, WATCHLIST_SOURCE);
        assert!(h
            .notifier
            .alerts
            .lock()
            .unwrap()
            .iter()
            .any(|a| a.kind == AlertKind::PriceDrop && a.item.id == 2));
    }

    #[tokio::test]
    async fn watchlist_price_rise_is_rescored() {
        let fake = Arc::new(FakeCollector::new("shop").with_listing("L", catalog_of(2, 60.0)));
        let h = harness(vec![fake.clone()], None, settings());
        run(&h, vec![seed("shop", "L")]).await;
        // p25 150: 150 * 0.92 - 4.50 - 60
        assert_eq!(h.store.latest_score(1).await.unwrap().unwrap().margin_abs, 73.5);

        fake.set_price("https://shop.test/p/0", 70.0);
        let job = ScrapeJob {
            kind: JobKind::WatchlistCheck,
            source: WATCHLIST_SOURCE.to_string(),
            layer: Layer::Watchlist,
            urls: Vec::new(),
            item_ids: vec![1],
            max_items: 1,
            priority: 1,
        };
        let r = &run(&h, vec![job]).await.reports[0];
        assert_eq!(r.drops, 0);
        assert_eq!(r.alerts_sent, 0);
        assert_eq!(h.store.latest_score(1).await.unwrap().unwrap().margin_abs, 63.5);
    }

    #[tokio::test]
    async fn manual_runs_cover_known_sources_only() {
        let fake = Arc::new(FakeCollector::new("shop").with_listing("L", catalog_of(2, 60.0)));
        let h = harness(vec![fake], None, settings());

        let batch = h.orch.run_sources(&["shop".to_string(), "ghost".to_string()], 2).await;
        assert_eq!(batch.reports.len(), 1);
        let stored = h.store.get_run(batch.reports[0].run_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(stored.trigger, TriggerOrigin::Manual);
        assert_eq!(stored.status, RunStatus::Completed);
    }
}
