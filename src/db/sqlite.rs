use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::str::FromStr;

use crate::db::models::{ItemRow, ObservationRow, RunRow, ScoreRow, StatsRow};
use crate::db::store::{price_changed, Store, WatchCriteria};
use crate::error::Result;
use crate::types::{
    DropRecord, ItemId, PriceObservation, PriceStats, ProductItem, Score, ScrapeRun, TrackedItem,
    UpsertAction, UpsertOutcome,
};

const ITEM_COLUMNS: &str = "id, source, external_id, title, brand, price, list_price, discount_pct, \
     url, image_url, category, color, sizes, in_stock, active, first_seen_at, last_seen_at";

const RUN_COLUMNS: &str = "id, source, layer, trigger_origin, status, started_at, finished_at, \
     duration_ms, items_found, items_created, items_updated, error_count, error_message, \
     error_context, proxy_used";

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if needed) the database file and applies migrations.
    pub async fn connect(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{path}"))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Self::from_pool(pool).await
    }

    /// Single shared connection so every query sees the same in-memory database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    async fn load_item(&self, id: ItemId) -> Result<Option<TrackedItem>> {
        let row = sqlx::query_as::<_, ItemRow>(&format!(
            "SELECT {ITEM_COLUMNS} FROM tracked_items WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ItemRow::into_item).transpose()
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_item(
        &self,
        source: &str,
        url: &str,
        item: &ProductItem,
        now_ns: i64,
    ) -> Result<UpsertOutcome> {
        let sizes = serde_json::to_string(&item.sizes)?;
        let discount = item.effective_discount();

        let mut tx = self.pool.begin().await?;

        let previous: Option<f64> = sqlx::query_scalar(
            "SELECT price FROM tracked_items WHERE source = ? AND external_id = ?",
        )
        .bind(source)
        .bind(&item.external_id)
        .fetch_optional(&mut *tx)
        .await?;

        // Discovery-time fields (brand, category, color, first_seen) are only
        // filled in when missing; price and availability always refresh.
        let row = sqlx::query_as::<_, ItemRow>(&format!(
            r#"
            INSERT INTO tracked_items (
                source, external_id, title, brand, price, list_price, discount_pct,
                url, image_url, category, color, sizes, in_stock, active,
                first_seen_at, last_seen_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
            ON CONFLICT (source, external_id) DO UPDATE SET
                title        = excluded.title,
                brand        = COALESCE(tracked_items.brand, excluded.brand),
                price        = excluded.price,
                list_price   = excluded.list_price,
                discount_pct = excluded.discount_pct,
                url          = excluded.url,
                image_url    = COALESCE(excluded.image_url, tracked_items.image_url),
                category     = COALESCE(tracked_items.category, excluded.category),
                color        = COALESCE(tracked_items.color, excluded.color),
                sizes        = excluded.sizes,
                in_stock     = excluded.in_stock,
                active       = 1,
                last_seen_at = excluded.last_seen_at
            RETURNING {ITEM_COLUMNS}
            "#
        ))
        .bind(source)
        .bind(&item.external_id)
        .bind(&item.title)
        .bind(&item.brand)
        .bind(item.price)
        .bind(item.list_price)
        .bind(discount)
        .bind(url)
        .bind(&item.image_url)
        .bind(&item.category)
        .bind(&item.color)
        .bind(&sizes)
        .bind(i64::from(item.in_stock))
        .bind(now_ns)
        .bind(now_ns)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        let action = match previous {
            None => UpsertAction::Created,
            Some(old) => UpsertAction::Updated { price_changed: price_changed(old, item.price) },
        };
        Ok(UpsertOutcome { item: row.into_item()?, action })
    }

    async fn get_item(&self, id: ItemId) -> Result<Option<TrackedItem>> {
        self.load_item(id).await
    }

    async fn items_by_ids(&self, ids: &[ItemId]) -> Result<Vec<TrackedItem>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {ITEM_COLUMNS} FROM tracked_items WHERE id IN ("));
        let mut sep = qb.separated(", ");
        for id in ids {
            sep.push_bind(*id);
        }
        sep.push_unseparated(") ORDER BY id");
        let rows: Vec<ItemRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(ItemRow::into_item).collect()
    }

    async fn deactivate_stale_items(&self, seen_before_ns: i64) -> Result<u64> {
        let res = sqlx::query(
            "UPDATE tracked_items SET active = 0 WHERE active = 1 AND last_seen_at < ?",
        )
        .bind(seen_before_ns)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    async fn load_price_stats(&self, item_id: ItemId) -> Result<Option<PriceStats>> {
        let row = sqlx::query_as::<_, StatsRow>("SELECT * FROM price_stats WHERE item_id = ?")
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(PriceStats::from))
    }

    async fn observation_history(
        &self,
        item_id: ItemId,
        since_ns: i64,
    ) -> Result<Vec<PriceObservation>> {
        let rows = sqlx::query_as::<_, ObservationRow>(
            r#"
            SELECT id, item_id, price, list_price, url, observed_at
            FROM price_observations
            WHERE item_id = ? AND observed_at >= ?
            ORDER BY observed_at ASC, id ASC
            "#,
        )
        .bind(item_id)
        .bind(since_ns)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(PriceObservation::from).collect())
    }

    async fn commit_observation(&self, obs: &PriceObservation, stats: &PriceStats) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let obs_id = sqlx::query(
            "INSERT INTO price_observations (item_id, price, list_price, url, observed_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(obs.item_id)
        .bind(obs.price)
        .bind(obs.list_price)
        .bind(&obs.url)
        .bind(obs.observed_at_ns)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO price_stats (
                item_id, current_price, previous_price,
                min_30d, max_30d, avg_30d, median_30d, p25_30d, p75_30d, cv_30d,
                min_7d, max_7d, avg_7d, median_7d, trend,
                is_drop, drop_percent, drop_detected_at,
                observation_count, price_change_count, last_recompute_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(stats.item_id)
        .bind(stats.current_price)
        .bind(stats.previous_price)
        .bind(stats.min_30d)
        .bind(stats.max_30d)
        .bind(stats.avg_30d)
        .bind(stats.median_30d)
        .bind(stats.p25_30d)
        .bind(stats.p75_30d)
        .bind(stats.cv_30d)
        .bind(stats.min_7d)
        .bind(stats.max_7d)
        .bind(stats.avg_7d)
        .bind(stats.median_7d)
        .bind(stats.trend.map(|t| t.as_str()))
        .bind(i64::from(stats.is_drop))
        .bind(stats.drop_percent)
        .bind(stats.drop_detected_at_ns)
        .bind(stats.observation_count)
        .bind(stats.price_change_count)
        .bind(stats.last_recompute_ns)
        .bind(stats.updated_at_ns)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(obs_id)
    }

    async fn observation_count(&self, item_id: ItemId) -> Result<i64> {
        let n: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM price_observations WHERE item_id = ?")
                .bind(item_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(n)
    }

    async fn recent_drops(
        &self,
        min_percent: f64,
        since_ns: i64,
        limit: usize,
    ) -> Result<Vec<DropRecord>> {
        let stats = sqlx::query_as::<_, StatsRow>(
            r#"
            SELECT * FROM price_stats
            WHERE is_drop = 1
              AND drop_percent >= ?
              AND drop_detected_at >= ?
            ORDER BY drop_percent DESC, item_id ASC
            LIMIT ?
            "#,
        )
        .bind(min_percent)
        .bind(since_ns)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(stats.len());
        for row in stats {
            let stats = PriceStats::from(row);
            if let Some(item) = self.load_item(stats.item_id).await? {
                out.push(DropRecord { item, stats });
            }
        }
        Ok(out)
    }

    async fn watch_candidates(&self, criteria: WatchCriteria, limit: usize) -> Result<Vec<ItemId>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT s.item_id
            FROM price_stats s
            JOIN tracked_items i ON i.id = s.item_id
            WHERE i.active = 1
              AND (
                    (s.trend = 'down' AND s.observation_count >= ?)
                 OR (s.min_30d > 0 AND s.current_price <= s.min_30d * ?)
                 OR (s.cv_30d IS NOT NULL AND s.cv_30d > ?)
              )
            ORDER BY CASE WHEN s.min_30d > 0 THEN s.current_price / s.min_30d ELSE 1e308 END ASC,
                     s.item_id ASC
            LIMIT ?
            "#,
        )
        .bind(criteria.min_observations_for_trend)
        .bind(criteria.near_floor_factor)
        .bind(criteria.volatile_cv)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn purge_observations_before(&self, cutoff_ns: i64) -> Result<u64> {
        let res = sqlx::query(
            r#"
            DELETE FROM price_observations
            WHERE observed_at < ?
              AND id NOT IN (SELECT MAX(id) FROM price_observations GROUP BY item_id)
            "#,
        )
        .bind(cutoff_ns)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    async fn insert_run(&self, run: &ScrapeRun) -> Result<i64> {
        let id = sqlx::query(
            r#"
            INSERT INTO scrape_runs (
                source, layer, trigger_origin, status, started_at, finished_at, duration_ms,
                items_found, items_created, items_updated, error_count,
                error_message, error_context, proxy_used
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.source)
        .bind(run.layer.as_str())
        .bind(run.trigger.as_str())
        .bind(run.status.as_str())
        .bind(run.started_at_ns)
        .bind(run.finished_at_ns)
        .bind(run.duration_ms)
        .bind(run.items_found)
        .bind(run.items_created)
        .bind(run.items_updated)
        .bind(run.error_count)
        .bind(&run.error_message)
        .bind(&run.error_context)
        .bind(&run.proxy_used)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    async fn update_run(&self, run: &ScrapeRun) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scrape_runs SET
                status = ?, finished_at = ?, duration_ms = ?,
                items_found = ?, items_created = ?, items_updated = ?, error_count = ?,
                error_message = ?, error_context = ?, proxy_used = ?
            WHERE id = ?
            "#,
        )
        .bind(run.status.as_str())
        .bind(run.finished_at_ns)
        .bind(run.duration_ms)
        .bind(run.items_found)
        .bind(run.items_created)
        .bind(run.items_updated)
        .bind(run.error_count)
        .bind(&run.error_message)
        .bind(&run.error_context)
        .bind(&run.proxy_used)
        .bind(run.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_run(&self, id: i64) -> Result<Option<ScrapeRun>> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM scrape_runs WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(RunRow::into_run).transpose()
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<ScrapeRun>> {
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM scrape_runs ORDER BY started_at DESC, id DESC LIMIT ?"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(RunRow::into_run).collect()
    }

    async fn save_score(&self, item_id: ItemId, score: &Score, now_ns: i64) -> Result<()> {
        let risks = serde_json::to_string(&score.risks)?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO scores (
                item_id, overall, margin_score, liquidity_score, popularity_score, risk_score,
                margin_abs, margin_pct, action, confidence,
                price_aggressive, price_optimal, price_patient,
                days_to_sell, explanation, risks, model_version, scored_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(item_id)
        .bind(score.overall)
        .bind(score.margin_score)
        .bind(score.liquidity_score)
        .bind(score.popularity_score)
        .bind(score.risk_score)
        .bind(score.margin_abs)
        .bind(score.margin_pct)
        .bind(score.action.as_str())
        .bind(score.confidence)
        .bind(score.price_band.map(|b| b.aggressive))
        .bind(score.price_band.map(|b| b.optimal))
        .bind(score.price_band.map(|b| b.patient))
        .bind(i64::from(score.estimated_days_to_sell))
        .bind(&score.explanation)
        .bind(&risks)
        .bind(&score.model_version)
        .bind(now_ns)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_score(&self, item_id: ItemId) -> Result<Option<Score>> {
        let row = sqlx::query_as::<_, ScoreRow>("SELECT * FROM scores WHERE item_id = ?")
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ScoreRow::into_score).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Layer, RunStatus, TriggerOrigin, DAY_NS};

    fn product(external_id: &str, price: f64) -> ProductItem {
        ProductItem {
            external_id: external_id.to_string(),
            title: format!("Sneaker {external_id}"),
            brand: Some("Nike".to_string()),
            price,
            list_price: Some(120.0),
            sizes: vec!["42".to_string(), "43".to_string()],
            in_stock: true,
            ..Default::default()
        }
    }

    fn observation(item_id: ItemId, price: f64, at: i64) -> PriceObservation {
        PriceObservation { id: 0, item_id, price, list_price: None, url: None, observed_at_ns: at }
    }

    #[tokio::test]
    async fn upsert_creates_then_updates() {
        let store = SqliteStore::in_memory().await.unwrap();

        let first = store.upsert_item("shop", "https://s/1", &product("A1", 100.0), 10).await.unwrap();
        assert_eq!(first.action, UpsertAction::Created);
        assert_eq!(first.item.discount_pct, Some(16.7));
        assert_eq!(first.item.sizes, vec!["42", "43"]);

        let same = store.upsert_item("shop", "https://s/1", &product("A1", 100.0), 20).await.unwrap();
        assert_eq!(same.action, UpsertAction::Updated { price_changed: false });
        assert_eq!(same.item.id, first.item.id);
        assert_eq!(same.item.first_seen_ns, 10);
        assert_eq!(same.item.last_seen_ns, 20);

        let cheaper = store.upsert_item("shop", "https://s/1", &product("A1", 90.0), 30).await.unwrap();
        assert_eq!(cheaper.action, UpsertAction::Updated { price_changed: true });

        let other_source = store.upsert_item("other", "https://o/1", &product("A1", 90.0), 30).await.unwrap();
        assert_ne!(other_source.item.id, first.item.id);
    }

    #[tokio::test]
    async fn commit_and_purge_keep_latest_observation() {
        let store = SqliteStore::in_memory().await.unwrap();
        let item = store.upsert_item("shop", "u", &product("A1", 100.0), 0).await.unwrap().item;

        let mut stats = PriceStats::seed(item.id, 100.0, 0);
        for day in 0..3 {
            store.commit_observation(&observation(item.id, 100.0, day * DAY_NS), &stats).await.unwrap();
            stats.observation_count += 1;
        }
        assert_eq!(store.observation_count(item.id).await.unwrap(), 3);

        // Everything is older than the cutoff; only the newest survives.
        let purged = store.purge_observations_before(100 * DAY_NS).await.unwrap();
        assert_eq!(purged, 2);
        let left = store.observation_history(item.id, 0).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].observed_at_ns, 2 * DAY_NS);

        let loaded = store.load_price_stats(item.id).await.unwrap().unwrap();
        assert_eq!(loaded.current_price, 100.0);
    }

    #[tokio::test]
    async fn drops_and_watch_candidates() {
        let store = SqliteStore::in_memory().await.unwrap();
        let a = store.upsert_item("shop", "u", &product("A", 80.0), 0).await.unwrap().item;
        let b = store.upsert_item("shop", "u", &product("B", 200.0), 0).await.unwrap().item;

        let mut dropped = PriceStats::seed(a.id, 80.0, 0);
        dropped.min_30d = 100.0;
        dropped.is_drop = true;
        dropped.drop_percent = Some(20.0);
        dropped.drop_detected_at_ns = Some(5 * DAY_NS);
        store.commit_observation(&observation(a.id, 80.0, 5 * DAY_NS), &dropped).await.unwrap();

        let mut flat = PriceStats::seed(b.id, 200.0, 0);
        flat.min_30d = 150.0;
        store.commit_observation(&observation(b.id, 200.0, 5 * DAY_NS), &flat).await.unwrap();

        let drops = store.recent_drops(10.0, 4 * DAY_NS, 10).await.unwrap();
        assert_eq!(drops.len(), 1);
        assert_eq!(drops[0].item.id, a.id);
        assert!(store.recent_drops(25.0, 0, 10).await.unwrap().is_empty());
        assert!(store.recent_drops(10.0, 6 * DAY_NS, 10).await.unwrap().is_empty());

        let criteria = WatchCriteria {
            min_observations_for_trend: 3,
            near_floor_factor: 1.10,
            volatile_cv: 0.15,
        };
        assert_eq!(store.watch_candidates(criteria, 10).await.unwrap(), vec![a.id]);

        assert_eq!(store.deactivate_stale_items(1).await.unwrap(), 2);
        assert!(store.watch_candidates(criteria, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_records_round_trip_through_updates() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut run = ScrapeRun {
            id: 0,
            source: "shop".into(),
            layer: Layer::Seed,
            trigger: TriggerOrigin::Manual,
            status: RunStatus::Started,
            started_at_ns: 1,
            finished_at_ns: None,
            duration_ms: None,
            items_found: 0,
            items_created: 0,
            items_updated: 0,
            error_count: 0,
            error_message: None,
            error_context: None,
            proxy_used: Some("http://p:1".into()),
        };
        run.id = store.insert_run(&run).await.unwrap();
        run.status = RunStatus::Completed;
        run.items_found = 4;
        run.error_count = 1;
        store.update_run(&run).await.unwrap();

        let loaded = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(loaded, run);
        assert_eq!(store.recent_runs(5).await.unwrap().len(), 1);
    }
}
