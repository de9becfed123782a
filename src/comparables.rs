use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::Result;
use crate::types::{Comparables, TrackedItem};

/// Secondary-marketplace price distribution for an item. Zero listings is a
/// valid answer, not an error.
#[async_trait]
pub trait ComparablesLookup: Send + Sync {
    async fn get_comparables(&self, item: &TrackedItem) -> Result<Comparables>;
}

/// Used when no marketplace endpoint is configured.
pub struct NoComparables;

#[async_trait]
impl ComparablesLookup for NoComparables {
    async fn get_comparables(&self, _item: &TrackedItem) -> Result<Comparables> {
        Ok(Comparables::default())
    }
}

/// Response body of the comparables endpoint. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ComparablesResponse {
    listing_count: u32,
    price_p25: f64,
    price_median: f64,
    price_p75: f64,
    price_min: f64,
    price_max: f64,
    cv: Option<f64>,
    liquidity_score: Option<f64>,
}

impl ComparablesResponse {
    fn into_comparables(self) -> Comparables {
        let mut out = Comparables {
            listing_count: self.listing_count,
            median: self.price_median,
            p25: self.price_p25,
            p75: self.price_p75,
            cv: self.cv,
            liquidity_score: 0.0,
        };
        out.liquidity_score = match self.liquidity_score {
            Some(score) if score > 0.0 => score.min(100.0),
            _ => marketplace_liquidity(&out, self.price_min, self.price_max),
        };
        out
    }
}

/// Liquidity estimate when the marketplace does not publish one: up to 60
/// points for listing depth (saturating at 100 listings), up to 40 for a
/// tight price spread.
pub fn marketplace_liquidity(c: &Comparables, min: f64, max: f64) -> f64 {
    if c.listing_count == 0 {
        return 0.0;
    }
    let depth = (c.listing_count as f64 / 100.0).min(1.0) * 60.0;
    let spread = if c.median > 0.0 && max >= min {
        (max - min) / c.median
    } else {
        1.0
    };
    let tightness = (1.0 - spread.min(1.0)) * 40.0;
    ((depth + tightness) * 10.0).round() / 10.0
}

pub struct HttpComparables {
    client: reqwest::Client,
    url: String,
}

impl HttpComparables {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url: url.to_string() })
    }
}

#[async_trait]
impl ComparablesLookup for HttpComparables {
    async fn get_comparables(&self, item: &TrackedItem) -> Result<Comparables> {
        let price = format!("{:.2}", item.price);
        let mut query: Vec<(&str, &str)> = vec![("name", item.title.as_str()), ("price", price.as_str())];
        if let Some(brand) = item.brand.as_deref() {
            query.push(("brand", brand));
        }
        if let Some(category) = item.category.as_deref() {
            query.push(("category", category));
        }

        let body: ComparablesResponse = self
            .client
            .get(&self.url)
            .query(&query)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let comparables = body.into_comparables();
        debug!(
            item_id = item.id,
            listings = comparables.listing_count,
            median = comparables.median,
            "Comparables fetched"
        );
        Ok(comparables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_mean_no_listings() {
        let resp: ComparablesResponse = serde_json::from_str("{}").unwrap();
        let c = resp.into_comparables();
        assert_eq!(c.listing_count, 0);
        assert_eq!(c.liquidity_score, 0.0);
    }

    #[test]
    fn published_liquidity_is_kept() {
        let raw = r#"{"listingCount": 12, "priceP25": 80, "priceMedian": 95, "priceP75": 110, "liquidityScore": 64}"#;
        let c = serde_json::from_str::<ComparablesResponse>(raw).unwrap().into_comparables();
        assert_eq!(c.listing_count, 12);
        assert_eq!(c.p25, 80.0);
        assert_eq!(c.liquidity_score, 64.0);
    }

    #[test]
    fn liquidity_estimated_from_depth_and_spread() {
        let c = Comparables { listing_count: 50, median: 100.0, p25: 90.0, p75: 110.0, ..Default::default() };
        // depth 30 + tightness (1 - 0.5) * 40 = 20
        assert_eq!(marketplace_liquidity(&c, 75.0, 125.0), 50.0);

        let deep = Comparables { listing_count: 400, ..c.clone() };
        assert_eq!(marketplace_liquidity(&deep, 100.0, 100.0), 100.0);

        let empty = Comparables::default();
        assert_eq!(marketplace_liquidity(&empty, 0.0, 0.0), 0.0);
    }

    #[tokio::test]
    async fn no_comparables_is_empty() {
        let item = TrackedItem {
            id: 1,
            source: "shop".into(),
            external_id: "X1".into(),
            title: "Samba OG".into(),
            brand: Some("adidas".into()),
            price: 50.0,
            list_price: None,
            discount_pct: None,
            url: "https://shop.test/x1".into(),
            image_url: None,
            category: None,
            color: None,
            sizes: Vec::new(),
            in_stock: true,
            active: true,
            first_seen_ns: 0,
            last_seen_ns: 0,
        };
        let c = NoComparables.get_comparables(&item).await.unwrap();
        assert_eq!(c, Comparables::default());
    }
}
