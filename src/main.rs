mod collector;
mod comparables;
mod config;
mod db;
mod error;
mod notifier;
mod orchestrator;
mod proxy;
mod scheduler;
mod scorer;
mod scrape_loop;
mod tracker;
mod types;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::collector::CollectorRegistry;
use crate::comparables::{ComparablesLookup, HttpComparables, NoComparables};
use crate::config::Config;
use crate::db::{SqliteStore, Store};
use crate::error::Result;
use crate::notifier::{NoopNotifier, Notifier, WebhookNotifier};
use crate::orchestrator::{OrchestratorSettings, Pipeline, ScrapeOrchestrator};
use crate::proxy::ProxyPool;
use crate::scheduler::{LayerConfig, SmartScheduler};
use crate::scorer::ScoringEngine;
use crate::scrape_loop::{LoopSettings, ScrapeLoop};
use crate::tracker::PriceTracker;

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Database setup ---
    let store: Arc<dyn Store> = Arc::new(SqliteStore::connect(&cfg.db_path).await?);
    info!("Database ready at {}", cfg.db_path);

    // --- Sources ---
    let catalog = cfg.catalog()?;
    let registry = CollectorRegistry::from_catalog(&catalog);
    info!(
        sources = catalog.sources.len(),
        "Source catalog loaded: {}",
        catalog.source_ids().collect::<Vec<_>>().join(", ")
    );

    // --- Proxies ---
    let proxies = if cfg.use_rotating_proxy {
        let pool = ProxyPool::from_list(&cfg.proxy_list, cfg.proxy_max_fails, cfg.proxy_cooldown);
        if let Some(url) = &cfg.proxy_list_url {
            let client = reqwest::Client::builder().timeout(cfg.http_timeout).build()?;
            if let Err(e) = pool.load_from_url(&client, url).await {
                warn!("Proxy list download failed: {e}");
            }
        }
        if pool.is_empty() {
            warn!("USE_ROTATING_PROXY set but no proxies configured, running direct");
        }
        info!(proxies = pool.len(), "Proxy pool ready");
        Some(Arc::new(pool))
    } else {
        None
    };

    // --- Pipeline components ---
    let tracker = PriceTracker::new(Arc::clone(&store));
    let comparables: Arc<dyn ComparablesLookup> = match &cfg.comparables_url {
        Some(url) => Arc::new(HttpComparables::new(url, cfg.http_timeout)?),
        None => {
            warn!("COMPARABLES_URL not set: every item scores against zero listings");
            Arc::new(NoComparables)
        }
    };
    let notifier: Arc<dyn Notifier> = match &cfg.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url, cfg.http_timeout)?),
        None => {
            info!("WEBHOOK_URL not set: alerts disabled");
            Arc::new(NoopNotifier)
        }
    };
    let scheduler = Arc::new(SmartScheduler::new(&catalog, LayerConfig::defaults(cfg.watchlist_size))?);

    let orchestrator = ScrapeOrchestrator::new(
        Pipeline {
            store: Arc::clone(&store),
            catalog,
            registry,
            proxies,
            tracker: Arc::clone(&tracker),
            scorer: ScoringEngine::default(),
            comparables,
            notifier,
            scheduler: Arc::clone(&scheduler),
        },
        OrchestratorSettings::from_config(&cfg),
    );

    // --- Manual one-shot: `radar run [source...]` ---
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.first().map(String::as_str) == Some("run") {
        let sources: Vec<String> = if args.len() > 1 {
            args[1..].to_vec()
        } else {
            orchestrator.source_ids()
        };
        let batch = orchestrator.run_sources(&sources, cfg.max_concurrency).await;
        info!(
            completed = batch.completed,
            failed = batch.failed,
            created = batch.items_created,
            updated = batch.items_updated,
            "Manual run finished"
        );
        return Ok(());
    }

    // --- Shutdown ---
    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, finishing in-flight runs");
            shutdown.cancel();
        }
    });

    let scrape_loop = ScrapeLoop::new(
        orchestrator,
        scheduler,
        tracker,
        store,
        LoopSettings::from_config(&cfg),
    );
    scrape_loop.run(cancel).await;

    Ok(())
}
