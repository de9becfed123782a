use async_trait::async_trait;
use rand::seq::SliceRandom;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;

use crate::collector::{Collector, FetchContext};
use crate::config::{SelectorConfig, SourceConfig, DEFAULT_USER_AGENT, USER_AGENTS};
use crate::error::CollectError;
use crate::types::ProductItem;

type CollectResult<T> = Result<T, CollectError>;

const STRUCTURED_ACCEPT: &str = "application/ld+json, application/json;q=0.9, text/html;q=0.8";
const BROWSER_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";

/// Site-agnostic collector driven by a catalog entry.
///
/// Structured path: schema.org JSON-LD embedded in the page (`ItemList` on
/// listings, `Product` on detail pages). Rendered path: CSS selectors over the
/// DOM, fetched with a rotated browser user agent.
pub struct JsonLdCollector {
    source: String,
    config: SourceConfig,
}

impl JsonLdCollector {
    pub fn new(source: &str, config: SourceConfig) -> Self {
        Self { source: source.to_string(), config }
    }

    async fn get_page(
        &self,
        ctx: &FetchContext,
        url: &str,
        accept: &str,
        user_agent: &str,
    ) -> CollectResult<String> {
        let resp = ctx
            .client
            .get(url)
            .header(ACCEPT, accept)
            .header(ACCEPT_LANGUAGE, "fr-FR,fr;q=0.9,en;q=0.8")
            .header(USER_AGENT, user_agent)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(CollectError::from_status(status.as_u16(), url));
        }
        Ok(resp.text().await?)
    }

    fn browser_agent() -> &'static str {
        USER_AGENTS.choose(&mut rand::thread_rng()).copied().unwrap_or(DEFAULT_USER_AGENT)
    }
}

#[async_trait]
impl Collector for JsonLdCollector {
    fn source(&self) -> &str {
        &self.source
    }

    async fn discover_structured(&self, ctx: &FetchContext, listing_url: &str) -> CollectResult<Vec<String>> {
        let html = self.get_page(ctx, listing_url, STRUCTURED_ACCEPT, DEFAULT_USER_AGENT).await?;
        let urls = parse_item_list(&html, listing_url);
        if urls.is_empty() {
            return Err(CollectError::Schema(format!("no ItemList on {listing_url}")));
        }
        Ok(urls)
    }

    async fn discover_rendered(&self, ctx: &FetchContext, listing_url: &str) -> CollectResult<Vec<String>> {
        let html = self.get_page(ctx, listing_url, BROWSER_ACCEPT, Self::browser_agent()).await?;
        let hint = self.config.product_link_hint.as_deref().unwrap_or("/product");
        let urls = extract_product_links(&html, listing_url, hint);
        if urls.is_empty() {
            return Err(CollectError::Schema(format!("no product links on {listing_url}")));
        }
        Ok(urls)
    }

    async fn fetch_structured(&self, ctx: &FetchContext, url: &str) -> CollectResult<ProductItem> {
        let html = self.get_page(ctx, url, STRUCTURED_ACCEPT, DEFAULT_USER_AGENT).await?;
        parse_jsonld_product(&html, url)
    }

    async fn fetch_rendered(&self, ctx: &FetchContext, url: &str) -> CollectResult<ProductItem> {
        let html = self.get_page(ctx, url, BROWSER_ACCEPT, Self::browser_agent()).await?;
        parse_rendered_product(&html, url, &self.config.selectors)
    }
}

// ---------------------------------------------------------------------------
// JSON-LD extraction
// ---------------------------------------------------------------------------

fn selector(css: &str) -> CollectResult<Selector> {
    Selector::parse(css).map_err(|e| CollectError::Schema(format!("invalid selector {css}: {e:?}")))
}

/// Every JSON-LD node in the page, with `@graph` containers and arrays flattened.
fn jsonld_nodes(doc: &Html) -> Vec<Value> {
    let Ok(sel) = selector(r#"script[type="application/ld+json"]"#) else {
        return Vec::new();
    };
    let mut nodes = Vec::new();
    for script in doc.select(&sel) {
        let raw: String = script.text().collect();
        if let Ok(value) = serde_json::from_str::<Value>(raw.trim()) {
            flatten_nodes(value, &mut nodes);
        }
    }
    nodes
}

fn flatten_nodes(value: Value, out: &mut Vec<Value>) {
    match value {
        Value::Array(items) => items.into_iter().for_each(|v| flatten_nodes(v, out)),
        Value::Object(mut map) => {
            if let Some(graph) = map.remove("@graph") {
                flatten_nodes(graph, out);
            }
            if !map.is_empty() {
                out.push(Value::Object(map));
            }
        }
        _ => {}
    }
}

fn has_type(node: &Value, ty: &str) -> bool {
    match node.get("@type") {
        Some(Value::String(s)) => s == ty,
        Some(Value::Array(types)) => types.iter().any(|t| t.as_str() == Some(ty)),
        _ => false,
    }
}

fn text_of(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(map) => text_of(map.get("name").or_else(|| map.get("url"))),
        Value::Array(items) => items.iter().find_map(|v| text_of(Some(v))),
        _ => None,
    }
}

fn number_of(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_price(s),
        _ => None,
    }
}

fn resolve(base: &str, href: &str) -> Option<String> {
    let base = Url::parse(base).ok()?;
    base.join(href).ok().map(|u| u.to_string())
}

/// Product URLs from a schema.org `ItemList`.
pub fn parse_item_list(html: &str, base_url: &str) -> Vec<String> {
    let doc = Html::parse_document(html);
    let mut urls = Vec::new();
    for node in jsonld_nodes(&doc).iter().filter(|n| has_type(n, "ItemList")) {
        let Some(Value::Array(elements)) = node.get("itemListElement") else {
            continue;
        };
        for el in elements {
            let href = el
                .get("url")
                .and_then(Value::as_str)
                .or_else(|| el.get("item").and_then(Value::as_str))
                .or_else(|| el.get("item").and_then(|i| i.get("url")).and_then(Value::as_str));
            if let Some(abs) = href.and_then(|h| resolve(base_url, h)) {
                if !urls.contains(&abs) {
                    urls.push(abs);
                }
            }
        }
    }
    urls
}

/// Last non-empty path segment, minus any extension. Used when a page carries no SKU.
pub fn id_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.filter(|s| !s.is_empty()).last()?;
    let stem = segment.split('.').next().unwrap_or(segment);
    (!stem.is_empty()).then(|| stem.to_string())
}

pub fn parse_jsonld_product(html: &str, url: &str) -> CollectResult<ProductItem> {
    let doc = Html::parse_document(html);
    let nodes = jsonld_nodes(&doc);
    let product = nodes
        .iter()
        .find(|n| has_type(n, "Product") || has_type(n, "ProductGroup"))
        .ok_or_else(|| CollectError::Schema(format!("no Product JSON-LD on {url}")))?;

    let title = text_of(product.get("name"))
        .ok_or_else(|| CollectError::Schema(format!("Product without name on {url}")))?;

    let offers: Vec<&Value> = match product.get("offers") {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(v @ Value::Object(_)) => vec![v],
        _ => Vec::new(),
    };
    let price = offers
        .iter()
        .filter_map(|o| number_of(o.get("price")).or_else(|| number_of(o.get("lowPrice"))))
        .fold(None, |acc: Option<f64>, p| Some(acc.map_or(p, |a| a.min(p))))
        .ok_or_else(|| CollectError::Schema(format!("Product without price on {url}")))?;
    let list_price = offers
        .iter()
        .filter_map(|o| number_of(o.get("highPrice")))
        .find(|high| *high > price);
    let in_stock = offers.is_empty()
        || offers.iter().any(|o| {
            o.get("availability")
                .and_then(Value::as_str)
                .map_or(true, is_available)
        });

    let mut sizes: Vec<String> = Vec::new();
    if let Some(Value::Array(variants)) = product.get("hasVariant") {
        for v in variants {
            if let Some(size) = text_of(v.get("size")) {
                if !sizes.contains(&size) {
                    sizes.push(size);
                }
            }
        }
    } else if let Some(size) = text_of(product.get("size")) {
        sizes.push(size);
    }

    let external_id = text_of(product.get("sku"))
        .or_else(|| text_of(product.get("productID")))
        .or_else(|| text_of(product.get("mpn")))
        .or_else(|| id_from_url(url))
        .ok_or_else(|| CollectError::Schema(format!("no product id on {url}")))?;

    Ok(ProductItem {
        external_id,
        title,
        brand: text_of(product.get("brand")),
        price,
        list_price,
        discount_pct: None,
        image_url: text_of(product.get("image")),
        sizes,
        category: text_of(product.get("category")),
        color: text_of(product.get("color")),
        in_stock,
    })
}

fn is_available(availability: &str) -> bool {
    availability.contains("InStock") || availability.contains("LimitedAvailability")
}

// ---------------------------------------------------------------------------
// Rendered (DOM) extraction
// ---------------------------------------------------------------------------

fn element_value(el: ElementRef<'_>) -> Option<String> {
    let v = el
        .value()
        .attr("content")
        .map(str::to_string)
        .unwrap_or_else(|| el.text().collect::<String>());
    let v = v.split_whitespace().collect::<Vec<_>>().join(" ");
    (!v.is_empty()).then_some(v)
}

/// First non-empty match over `candidates`, tried in order.
fn first_value(doc: &Html, candidates: &[&str]) -> Option<String> {
    candidates.iter().find_map(|css| {
        let sel = selector(css).ok()?;
        doc.select(&sel).find_map(element_value)
    })
}

fn all_values(doc: &Html, css: &str) -> Vec<String> {
    let Ok(sel) = selector(css) else {
        return Vec::new();
    };
    let mut out: Vec<String> = Vec::new();
    for v in doc.select(&sel).filter_map(element_value) {
        if !out.contains(&v) {
            out.push(v);
        }
    }
    out
}

pub fn parse_rendered_product(
    html: &str,
    url: &str,
    selectors: &SelectorConfig,
) -> CollectResult<ProductItem> {
    let doc = Html::parse_document(html);

    let with_default = |custom: &Option<String>, defaults: &[&'static str]| -> Vec<String> {
        custom
            .iter()
            .cloned()
            .chain(defaults.iter().map(|s| s.to_string()))
            .collect()
    };

    let title_sel = with_default(&selectors.title, &[r#"[itemprop="name"]"#, "h1", r#"meta[property="og:title"]"#]);
    let price_sel = with_default(
        &selectors.price,
        &[r#"[itemprop="price"]"#, r#"meta[property="product:price:amount"]"#, r#"meta[property="og:price:amount"]"#],
    );
    let brand_sel = with_default(&selectors.brand, &[r#"[itemprop="brand"]"#, r#"meta[property="product:brand"]"#]);
    let image_sel = with_default(&selectors.image, &[r#"meta[property="og:image"]"#]);
    let list_sel = with_default(&selectors.list_price, &[]);

    fn refs(v: &[String]) -> Vec<&str> {
        v.iter().map(String::as_str).collect()
    }

    let title = first_value(&doc, &refs(&title_sel))
        .ok_or_else(|| CollectError::Schema(format!("no title on {url}")))?;
    let price = first_value(&doc, &refs(&price_sel))
        .and_then(|p| parse_price(&p))
        .ok_or_else(|| CollectError::Schema(format!("no price on {url}")))?;
    let list_price = first_value(&doc, &refs(&list_sel))
        .and_then(|p| parse_price(&p))
        .filter(|lp| *lp > price);
    let sizes = selectors.sizes.as_deref().map(|css| all_values(&doc, css)).unwrap_or_default();
    let external_id = first_value(&doc, &[r#"[itemprop="sku"]"#, r#"meta[property="product:retailer_item_id"]"#])
        .or_else(|| id_from_url(url))
        .ok_or_else(|| CollectError::Schema(format!("no product id on {url}")))?;

    Ok(ProductItem {
        external_id,
        title,
        brand: first_value(&doc, &refs(&brand_sel)),
        price,
        list_price,
        discount_pct: None,
        image_url: first_value(&doc, &refs(&image_sel)),
        sizes,
        category: None,
        color: None,
        in_stock: true,
    })
}

/// Absolute product URLs from anchors whose href contains `hint`.
pub fn extract_product_links(html: &str, base_url: &str, hint: &str) -> Vec<String> {
    let doc = Html::parse_document(html);
    let Ok(sel) = selector("a[href]") else {
        return Vec::new();
    };
    let mut urls = Vec::new();
    for a in doc.select(&sel) {
        let Some(href) = a.value().attr("href") else { continue };
        if !href.contains(hint) {
            continue;
        }
        if let Some(abs) = resolve(base_url, href) {
            if !urls.contains(&abs) {
                urls.push(abs);
            }
        }
    }
    urls
}

/// Normalises retail price strings: `"1 299,99 €"`, `"€89.95"`, `"1,299.00"`, `"89,95"`.
pub fn parse_price(raw: &str) -> Option<f64> {
    let cleaned: String = raw.chars().filter(|c| c.is_ascii_digit() || *c == ',' || *c == '.').collect();
    if cleaned.is_empty() {
        return None;
    }
    let last_comma = cleaned.rfind(',');
    let last_dot = cleaned.rfind('.');
    let normalised = match (last_comma, last_dot) {
        (Some(c), Some(d)) if c > d => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (Some(c), None) => {
            let decimals = cleaned.len() - c - 1;
            if decimals <= 2 && cleaned.matches(',').count() == 1 {
                cleaned.replace(',', ".")
            } else {
                cleaned.replace(',', "")
            }
        }
        (None, Some(d)) => {
            let decimals = cleaned.len() - d - 1;
            if cleaned.matches('.').count() > 1 || decimals == 3 {
                cleaned.replace('.', "")
            } else {
                cleaned
            }
        }
        (None, None) => cleaned,
    };
    normalised.parse::<f64>().ok().filter(|p| p.is_finite() && *p >= 0.0)
}
