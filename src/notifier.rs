use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{AppError, Result};
use crate::types::{Score, TrackedItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    NewDeal,
    PriceDrop,
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub kind: AlertKind,
    pub item: TrackedItem,
    pub score: Option<Score>,
    /// Only for drops.
    pub previous_price: Option<f64>,
    pub drop_percent: Option<f64>,
}

/// External alert sink. Callers log failures and carry on.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, alert: &Alert) -> Result<()>;
}

/// Used when no webhook is configured.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _alert: &Alert) -> Result<()> {
        Ok(())
    }
}

/// Discord-compatible webhook sink.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url: url.to_string() })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, alert: &Alert) -> Result<()> {
        let resp = self.client.post(&self.url).json(&payload(alert)).send().await?;
        let status = resp.status().as_u16();
        if status != 200 && status != 204 {
            return Err(AppError::Notify(format!("webhook answered HTTP {status}")));
        }
        debug!(item_id = alert.item.id, kind = ?alert.kind, "Alert delivered");
        Ok(())
    }
}

fn embed_color(score: Option<f64>) -> u32 {
    match score {
        Some(s) if s >= 85.0 => 0x2ecc71,
        Some(s) if s >= 70.0 => 0xf1c40f,
        Some(s) if s >= 50.0 => 0xe67e22,
        _ => 0x95a5a6,
    }
}

pub fn payload(alert: &Alert) -> Value {
    let item = &alert.item;
    let title = match alert.kind {
        AlertKind::NewDeal => format!("New deal: {}", item.title),
        AlertKind::PriceDrop => format!(
            "Price drop -{:.1}%: {}",
            alert.drop_percent.unwrap_or_default(),
            item.title
        ),
    };

    let mut fields = vec![json!({ "name": "Price", "value": format!("{:.2} €", item.price), "inline": true })];
    if let Some(prev) = alert.previous_price {
        fields.push(json!({ "name": "Was", "value": format!("{prev:.2} €"), "inline": true }));
    } else if let Some(list) = item.list_price {
        fields.push(json!({ "name": "List price", "value": format!("{list:.2} €"), "inline": true }));
    }
    if let Some(score) = &alert.score {
        fields.push(json!({
            "name": "Margin",
            "value": format!("{:.2} € ({:.0}%)", score.margin_abs, score.margin_pct),
            "inline": true,
        }));
        fields.push(json!({
            "name": "Score",
            "value": format!("{:.0}/100 · {}", score.overall, score.action.as_str()),
            "inline": true,
        }));
    }
    if let Some(brand) = &item.brand {
        fields.push(json!({ "name": "Brand", "value": brand, "inline": true }));
    }
    fields.push(json!({ "name": "Source", "value": item.source, "inline": true }));

    let mut embed = json!({
        "title": title,
        "url": item.url,
        "color": embed_color(alert.score.as_ref().map(|s| s.overall)),
        "fields": fields,
    });
    if let Some(explanation) = alert.score.as_ref().map(|s| s.explanation.as_str()).filter(|e| !e.is_empty()) {
        embed["description"] = json!(explanation);
    }
    if let Some(image) = &item.image_url {
        embed["thumbnail"] = json!({ "url": image });
    }
    json!({ "embeds": [embed] })
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Records alerts; optionally fails every delivery.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub alerts: Mutex<Vec<Alert>>,
        pub fail: bool,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, alert: &Alert) -> Result<()> {
            self.alerts.lock().unwrap().push(alert.clone());
            if self.fail {
                return Err(AppError::Notify("webhook down".into()));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PriceBand, Recommendation};

    fn item() -> TrackedItem {
        TrackedItem {
            id: 7,
            source: "courir".into(),
            external_id: "ABC".into(),
            title: "Gel-1130".into(),
            brand: Some("ASICS".into()),
            price: 69.99,
            list_price: Some(120.0),
            discount_pct: Some(41.7),
            url: "https://shop.test/p/abc".into(),
            image_url: Some("https://cdn.test/abc.jpg".into()),
            category: None,
            color: None,
            sizes: vec![],
            in_stock: true,
            active: true,
            first_seen_ns: 0,
            last_seen_ns: 0,
        }
    }

    fn score(overall: f64) -> Score {
        Score {
            overall,
            margin_score: 80.0,
            liquidity_score: 70.0,
            popularity_score: 79.0,
            risk_score: 90.0,
            margin_abs: 31.5,
            margin_pct: 45.0,
            action: Recommendation::Buy,
            confidence: 0.86,
            price_band: Some(PriceBand { aggressive: 95.0, optimal: 105.0, patient: 115.0 }),
            estimated_days_to_sell: 4,
            explanation: "Solid margin, active market.".into(),
            risks: vec![],
            model_version: "rules_v2".into(),
        }
    }

    #[test]
    fn deal_payload_carries_prices_margin_and_link() {
        let alert = Alert {
            kind: AlertKind::NewDeal,
            item: item(),
            score: Some(score(86.0)),
            previous_price: None,
            drop_percent: None,
        };
        let body = payload(&alert);
        let embed = &body["embeds"][0];
        assert_eq!(embed["title"], "New deal: Gel-1130");
        assert_eq!(embed["url"], "https://shop.test/p/abc");
        assert_eq!(embed["color"], 0x2ecc71);
        assert_eq!(embed["thumbnail"]["url"], "https://cdn.test/abc.jpg");
        let fields = embed["fields"].as_array().unwrap();
        assert!(fields.iter().any(|f| f["name"] == "Margin" && f["value"] == "31.50 € (45%)"));
        assert!(fields.iter().any(|f| f["name"] == "List price"));
    }

    #[test]
    fn drop_payload_shows_previous_price() {
        let alert = Alert {
            kind: AlertKind::PriceDrop,
            item: item(),
            score: None,
            previous_price: Some(89.99),
            drop_percent: Some(22.2),
        };
        let body = payload(&alert);
        let embed = &body["embeds"][0];
        assert_eq!(embed["title"], "Price drop -22.2%: Gel-1130");
        assert_eq!(embed["color"], 0x95a5a6);
        assert!(embed["fields"].as_array().unwrap().iter().any(|f| f["name"] == "Was" && f["value"] == "89.99 €"));
    }

    #[test]
    fn color_bands() {
        assert_eq!(embed_color(Some(72.0)), 0xf1c40f);
        assert_eq!(embed_color(Some(55.0)), 0xe67e22);
        assert_eq!(embed_color(Some(10.0)), 0x95a5a6);
    }
}
