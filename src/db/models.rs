//! Row types for the SQLite schema in `migrations/`, with conversions into
//! domain types. Enum columns are stored as their lowercase names.
use crate::error::{AppError, Result};
use crate::types::{
    Layer, PriceBand, PriceObservation, PriceStats, Recommendation, RunStatus, Score, ScrapeRun,
    TrackedItem, TriggerOrigin, Trend,
};

#[derive(Debug, sqlx::FromRow)]
pub struct ItemRow {
    pub id: i64,
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
    pub sizes: String,
    pub in_stock: i64,
    pub active: i64,
    pub first_seen_at: i64,
    pub last_seen_at: i64,
}

impl ItemRow {
    pub fn into_item(self) -> Result<TrackedItem> {
        Ok(TrackedItem {
            id: self.id,
            source: self.source,
            external_id: self.external_id,
            title: self.title,
            brand: self.brand,
            price: self.price,
            list_price: self.list_price,
            discount_pct: self.discount_pct,
            url: self.url,
            image_url: self.image_url,
            category: self.category,
            color: self.color,
            sizes: serde_json::from_str(&self.sizes)?,
            in_stock: self.in_stock != 0,
            active: self.active != 0,
            first_seen_ns: self.first_seen_at,
            last_seen_ns: self.last_seen_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct ObservationRow {
    pub id: i64,
    pub item_id: i64,
    pub price: f64,
    pub list_price: Option<f64>,
    pub url: Option<String>,
    pub observed_at: i64,
}

impl From<ObservationRow> for PriceObservation {
    fn from(r: ObservationRow) -> Self {
        PriceObservation {
            id: r.id,
            item_id: r.item_id,
            price: r.price,
            list_price: r.list_price,
            url: r.url,
            observed_at_ns: r.observed_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct StatsRow {
    pub item_id: i64,
    pub current_price: f64,
    pub previous_price: Option<f64>,
    pub min_30d: f64,
    pub max_30d: f64,
    pub avg_30d: f64,
    pub median_30d: f64,
    pub p25_30d: f64,
    pub p75_30d: f64,
    pub cv_30d: Option<f64>,
    pub min_7d: f64,
    pub max_7d: f64,
    pub avg_7d: f64,
    pub median_7d: f64,
    pub trend: Option<String>,
    pub is_drop: i64,
    pub drop_percent: Option<f64>,
    pub drop_detected_at: Option<i64>,
    pub observation_count: i64,
    pub price_change_count: i64,
    pub last_recompute_at: i64,
    pub updated_at: i64,
}

impl From<StatsRow> for PriceStats {
    fn from(r: StatsRow) -> Self {
        PriceStats {
            item_id: r.item_id,
            current_price: r.current_price,
            previous_price: r.previous_price,
            min_30d: r.min_30d,
            max_30d: r.max_30d,
            avg_30d: r.avg_30d,
            median_30d: r.median_30d,
            p25_30d: r.p25_30d,
            p75_30d: r.p75_30d,
            cv_30d: r.cv_30d,
            min_7d: r.min_7d,
            max_7d: r.max_7d,
            avg_7d: r.avg_7d,
            median_7d: r.median_7d,
            trend: r.trend.as_deref().and_then(Trend::parse),
            is_drop: r.is_drop != 0,
            drop_percent: r.drop_percent,
            drop_detected_at_ns: r.drop_detected_at,
            observation_count: r.observation_count,
            price_change_count: r.price_change_count,
            last_recompute_ns: r.last_recompute_at,
            updated_at_ns: r.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct RunRow {
    pub id: i64,
    pub source: String,
    pub layer: String,
    pub trigger_origin: String,
    pub status: String,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub duration_ms: Option<f64>,
    pub items_found: i64,
    pub items_created: i64,
    pub items_updated: i64,
    pub error_count: i64,
    pub error_message: Option<String>,
    pub error_context: Option<String>,
    pub proxy_used: Option<String>,
}

impl RunRow {
    pub fn into_run(self) -> Result<ScrapeRun> {
        let layer = Layer::parse(&self.layer)
            .ok_or_else(|| AppError::Store(format!("unknown layer {}", self.layer)))?;
        let status = RunStatus::parse(&self.status)
            .ok_or_else(|| AppError::Store(format!("unknown run status {}", self.status)))?;
        let trigger = match self.trigger_origin.as_str() {
            "manual" => TriggerOrigin::Manual,
            _ => TriggerOrigin::Scheduled,
        };
        Ok(ScrapeRun {
            id: self.id,
            source: self.source,
            layer,
            trigger,
            status,
            started_at_ns: self.started_at,
            finished_at_ns: self.finished_at,
            duration_ms: self.duration_ms,
            items_found: self.items_found,
            items_created: self.items_created,
            items_updated: self.items_updated,
            error_count: self.error_count,
            error_message: self.error_message,
            error_context: self.error_context,
            proxy_used: self.proxy_used,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct ScoreRow {
    pub item_id: i64,
    pub overall: f64,
    pub margin_score: f64,
    pub liquidity_score: f64,
    pub popularity_score: f64,
    pub risk_score: f64,
    pub margin_abs: f64,
    pub margin_pct: f64,
    pub action: String,
    pub confidence: f64,
    pub price_aggressive: Option<f64>,
    pub price_optimal: Option<f64>,
    pub price_patient: Option<f64>,
    pub days_to_sell: i64,
    pub explanation: String,
    pub risks: String,
    pub model_version: String,
    pub scored_at: i64,
}

impl ScoreRow {
    pub fn into_score(self) -> Result<Score> {
        let price_band = match (self.price_aggressive, self.price_optimal, self.price_patient) {
            (Some(aggressive), Some(optimal), Some(patient)) => {
                Some(PriceBand { aggressive, optimal, patient })
            }
            _ => None,
        };
        Ok(Score {
            overall: self.overall,
            margin_score: self.margin_score,
            liquidity_score: self.liquidity_score,
            popularity_score: self.popularity_score,
            risk_score: self.risk_score,
            margin_abs: self.margin_abs,
            margin_pct: self.margin_pct,
            action: Recommendation::parse(&self.action).unwrap_or(Recommendation::Ignore),
            confidence: self.confidence,
            price_band,
            estimated_days_to_sell: self.days_to_sell.max(0) as u32,
            explanation: self.explanation,
            risks: serde_json::from_str(&self.risks)?,
            model_version: self.model_version,
        })
    }
}
