use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{layer_defaults as ld, SourceCatalog, WATCHLIST_SOURCE};
use crate::error::{AppError, Result};
use crate::types::{now_ns, ItemId, JobKind, Layer, ScrapeJob};

// ---------------------------------------------------------------------------
// Layer configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct LayerConfig {
    pub layer: Layer,
    /// Interval the layer relaxes back toward after neutral outcomes.
    pub baseline: Duration,
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub max_items: usize,
    /// Lower runs first.
    pub priority: u8,
}

impl LayerConfig {
    fn mins(m: u64) -> Duration {
        Duration::from_secs(m * 60)
    }

    pub fn defaults(watchlist_size: usize) -> Vec<LayerConfig> {
        let min = Self::mins(ld::MIN_INTERVAL_MINS);
        let max = Self::mins(ld::MAX_INTERVAL_MINS);
        vec![
            LayerConfig {
                layer: Layer::Seed,
                baseline: Self::mins(ld::SEED_INTERVAL_MINS),
                min_interval: min,
                max_interval: max,
                max_items: ld::SEED_MAX_ITEMS,
                priority: 1,
            },
            LayerConfig {
                layer: Layer::Category,
                baseline: Self::mins(ld::CATEGORY_INTERVAL_MINS),
                min_interval: min,
                max_interval: max,
                max_items: ld::CATEGORY_MAX_ITEMS,
                priority: 2,
            },
            LayerConfig {
                layer: Layer::Watchlist,
                baseline: Self::mins(ld::WATCHLIST_INTERVAL_MINS),
                min_interval: min,
                max_interval: max,
                max_items: watchlist_size,
                priority: 1,
            },
        ]
    }

    fn validate(&self) -> Result<()> {
        if self.baseline.is_zero() || self.min_interval.is_zero() || self.max_interval.is_zero() {
            return Err(AppError::Config(format!("{} layer has a zero interval", self.layer)));
        }
        if !(self.min_interval <= self.baseline && self.baseline <= self.max_interval) {
            return Err(AppError::Config(format!(
                "{} layer needs min <= baseline <= max (got {:?} / {:?} / {:?})",
                self.layer, self.min_interval, self.baseline, self.max_interval
            )));
        }
        if self.max_items == 0 {
            return Err(AppError::Config(format!("{} layer has max_items = 0", self.layer)));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per (source, layer) adaptive state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct LayerSchedule {
    interval: Duration,
    last_run_ns: Option<i64>,
    success_rate: f64,
    avg_new_items: f64,
}

impl LayerSchedule {
    fn new(baseline: Duration) -> Self {
        Self { interval: baseline, last_run_ns: None, success_rate: 1.0, avg_new_items: 0.0 }
    }

    fn next_run_ns(&self, now: i64) -> i64 {
        match self.last_run_ns {
            Some(last) => last.saturating_add(self.interval.as_nanos() as i64),
            None => now,
        }
    }

    /// How long past due the layer is; `None` when not yet due.
    fn overdue_by(&self, now: i64) -> Option<i64> {
        let next = self.next_run_ns(now);
        (now >= next).then_some(now - next)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Retune {
    Backoff,
    SpeedUp,
    Relax,
}

/// Applies one outcome to a layer's state. Returns the rule that fired.
fn retune(state: &mut LayerSchedule, cfg: &LayerConfig, success: bool, new_items: u32) -> Retune {
    let w = ld::SUCCESS_EMA_WEIGHT;
    state.success_rate = state.success_rate * (1.0 - w) + if success { w } else { 0.0 };
    let n = ld::NEW_ITEMS_EMA_WEIGHT;
    state.avg_new_items = state.avg_new_items * (1.0 - n) + new_items as f64 * n;

    let (next, rule) = if state.success_rate < ld::LOW_SUCCESS_RATE {
        (state.interval.saturating_mul(2), Retune::Backoff)
    } else if new_items > ld::HIGH_YIELD_NEW_ITEMS {
        (state.interval / 2, Retune::SpeedUp)
    } else {
        let r = ld::RELAX_WEIGHT;
        (state.interval.mul_f64(1.0 - r) + cfg.baseline.mul_f64(r), Retune::Relax)
    };
    state.interval = next.clamp(cfg.min_interval, cfg.max_interval);
    rule
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerStatus {
    pub source: String,
    pub layer: Layer,
    pub interval_secs: u64,
    pub baseline_secs: u64,
    pub last_run_ns: Option<i64>,
    pub next_run_ns: i64,
    pub overdue: bool,
    pub success_rate: f64,
    pub avg_new_items: f64,
}

// ---------------------------------------------------------------------------
// SmartScheduler
// ---------------------------------------------------------------------------

type LayerKey = (String, Layer);

/// Decides which layer scrapes and watchlist checks are due, and retunes each
/// layer's interval from reported outcomes. Performs no I/O.
pub struct SmartScheduler {
    configs: BTreeMap<Layer, LayerConfig>,
    /// Listing URLs per (source, layer). Pairs without URLs are never scheduled.
    targets: BTreeMap<LayerKey, Vec<String>>,
    schedules: DashMap<LayerKey, LayerSchedule>,
}

impl SmartScheduler {
    pub fn new(catalog: &SourceCatalog, layer_configs: Vec<LayerConfig>) -> Result<Self> {
        let mut configs = BTreeMap::new();
        for cfg in layer_configs {
            cfg.validate()?;
            let layer = cfg.layer;
            if configs.insert(layer, cfg).is_some() {
                return Err(AppError::Config(format!("{layer} layer configured twice")));
            }
        }
        if let Some(missing) = Layer::ALL.iter().find(|l| !configs.contains_key(*l)) {
            return Err(AppError::Config(format!("{missing} layer is not configured")));
        }
        if catalog.sources.is_empty() {
            return Err(AppError::Config("no sources to schedule".into()));
        }

        let schedules = DashMap::new();
        let mut targets = BTreeMap::new();
        for source in catalog.source_ids() {
            for layer in [Layer::Seed, Layer::Category] {
                let urls = catalog.urls(source, layer);
                if urls.is_empty() {
                    debug!(source, layer = %layer, "No target URLs, layer skipped");
                    continue;
                }
                let key = (source.to_string(), layer);
                schedules.insert(key.clone(), LayerSchedule::new(configs[&layer].baseline));
                targets.insert(key, urls.to_vec());
            }
        }
        schedules.insert(
            (WATCHLIST_SOURCE.to_string(), Layer::Watchlist),
            LayerSchedule::new(configs[&Layer::Watchlist].baseline),
        );

        info!(layers = schedules.len(), sources = catalog.sources.len(), "Scheduler ready");
        Ok(Self { configs, targets, schedules })
    }

    pub fn select_next_jobs(&self, max_jobs: usize, watch_candidates: &[ItemId]) -> Vec<ScrapeJob> {
        self.select_next_jobs_at(max_jobs, watch_candidates, now_ns())
    }

    /// Due jobs, most urgent first, truncated to `max_jobs`. Emitted jobs are
    /// stamped as run at `now` so the next tick does not re-emit them.
    pub fn select_next_jobs_at(
        &self,
        max_jobs: usize,
        watch_candidates: &[ItemId],
        now: i64,
    ) -> Vec<ScrapeJob> {
        // (job, overdue_ns)
        let mut due: Vec<(ScrapeJob, i64)> = Vec::new();

        let watch_key = (WATCHLIST_SOURCE.to_string(), Layer::Watchlist);
        if !watch_candidates.is_empty() {
            let overdue = self.schedules.get(&watch_key).and_then(|s| s.overdue_by(now));
            if let Some(overdue) = overdue {
                let cfg = &self.configs[&Layer::Watchlist];
                let item_ids: Vec<ItemId> = watch_candidates.iter().copied().take(cfg.max_items).collect();
                due.push((
                    ScrapeJob {
                        kind: JobKind::WatchlistCheck,
                        source: WATCHLIST_SOURCE.to_string(),
                        layer: Layer::Watchlist,
                        urls: Vec::new(),
                        max_items: item_ids.len(),
                        item_ids,
                        priority: cfg.priority,
                    },
                    overdue,
                ));
            }
        }

        for ((source, layer), urls) in &self.targets {
            let key = (source.clone(), *layer);
            let Some(overdue) = self.schedules.get(&key).and_then(|s| s.overdue_by(now)) else {
                continue;
            };
            let cfg = &self.configs[layer];
            due.push((
                ScrapeJob {
                    kind: JobKind::LayerScrape,
                    source: source.clone(),
                    layer: *layer,
                    urls: urls.clone(),
                    item_ids: Vec::new(),
                    max_items: cfg.max_items,
                    priority: cfg.priority,
                },
                overdue,
            ));
        }

        due.sort_by_key(|(job, overdue)| {
            (job.priority, job.kind != JobKind::WatchlistCheck, Reverse(*overdue))
        });
        due.truncate(max_jobs);

        for (job, _) in &due {
            if let Some(mut s) = self.schedules.get_mut(&(job.source.clone(), job.layer)) {
                s.last_run_ns = Some(now);
            }
        }
        due.into_iter().map(|(job, _)| job).collect()
    }

    /// Feeds one run outcome back. Returns the retuned interval, or `None` for
    /// an unknown (source, layer).
    pub fn report_outcome(
        &self,
        source: &str,
        layer: Layer,
        success: bool,
        new_items: u32,
    ) -> Option<Duration> {
        let cfg = self.configs.get(&layer)?;
        // get_mut holds the shard write lock, so outcomes for one key never interleave.
        let Some(mut state) = self.schedules.get_mut(&(source.to_string(), layer)) else {
            warn!(source, layer = %layer, "Outcome for an unscheduled layer ignored");
            return None;
        };
        let before = state.interval;
        let rule = retune(&mut state, cfg, success, new_items);
        if state.interval != before {
            debug!(
                event = "SCHEDULE_RETUNE",
                source,
                layer = %layer,
                rule = ?rule,
                from_secs = before.as_secs(),
                to_secs = state.interval.as_secs(),
                success_rate = state.success_rate,
                "Layer interval retuned"
            );
        }
        Some(state.interval)
    }

    pub fn status(&self) -> Vec<LayerStatus> {
        self.status_at(now_ns())
    }

    /// Snapshot of every scheduled layer, sorted by source then layer.
    pub fn status_at(&self, now: i64) -> Vec<LayerStatus> {
        let mut out: Vec<LayerStatus> = self
            .schedules
            .iter()
            .map(|entry| {
                let ((source, layer), s) = entry.pair();
                let next_run_ns = s.next_run_ns(now);
                LayerStatus {
                    source: source.clone(),
                    layer: *layer,
                    interval_secs: s.interval.as_secs(),
                    baseline_secs: self.configs[layer].baseline.as_secs(),
                    last_run_ns: s.last_run_ns,
                    next_run_ns,
                    overdue: now >= next_run_ns,
                    success_rate: s.success_rate,
                    avg_new_items: s.avg_new_items,
                }
            })
            .collect();
        out.sort_by(|a, b| (&a.source, a.layer).cmp(&(&b.source, b.layer)));
        out
    }
}
