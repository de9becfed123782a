use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;

/// Pick randomly among this many least-recently-used proxies.
const LRU_SPREAD: usize = 5;

#[derive(Debug)]
struct ProxyState {
    url: String,
    fail_count: u32,
    last_used: Option<Instant>,
    last_failure: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProxyStats {
    pub total: usize,
    pub available: usize,
    pub cooling_down: usize,
}

/// Rotating outbound proxies. A proxy that fails `max_fails` times sits out
/// for `cooldown` after its last failure, then rejoins with a clean count.
/// Proxies are never removed.
pub struct ProxyPool {
    proxies: Mutex<Vec<ProxyState>>,
    max_fails: u32,
    cooldown: Duration,
}

/// `host:port` or `host:port:user:pass` → proxy URL. Full URLs pass through.
pub fn parse_proxy(entry: &str) -> Option<String> {
    let entry = entry.trim();
    if entry.is_empty() {
        return None;
    }
    if entry.contains("://") {
        return Some(entry.to_string());
    }
    let parts: Vec<&str> = entry.split(':').collect();
    match parts.as_slice() {
        [host, port] if !host.is_empty() && port.parse::<u16>().is_ok() => {
            Some(format!("http://{host}:{port}"))
        }
        [host, port, user, pass] if !host.is_empty() && port.parse::<u16>().is_ok() => {
            Some(format!("http://{user}:{pass}@{host}:{port}"))
        }
        _ => None,
    }
}

impl ProxyPool {
    pub fn from_list(entries: &[String], max_fails: u32, cooldown: Duration) -> Self {
        let pool = Self { proxies: Mutex::new(Vec::new()), max_fails: max_fails.max(1), cooldown };
        pool.extend(entries.iter().map(String::as_str));
        pool
    }

    fn state(&self) -> MutexGuard<'_, Vec<ProxyState>> {
        self.proxies.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn extend<'a>(&self, entries: impl Iterator<Item = &'a str>) -> usize {
        let mut proxies = self.state();
        let mut added = 0;
        for entry in entries {
            match parse_proxy(entry) {
                Some(url) if !proxies.iter().any(|p| p.url == url) => {
                    proxies.push(ProxyState { url, fail_count: 0, last_used: None, last_failure: None });
                    added += 1;
                }
                Some(_) => {}
                None => warn!(entry, "Skipping unparseable proxy entry"),
            }
        }
        added
    }

    /// Appends proxies from a provider endpoint returning one entry per line.
    pub async fn load_from_url(&self, client: &reqwest::Client, url: &str) -> Result<usize> {
        let body = client.get(url).send().await?.error_for_status()?.text().await?;
        let added = self.extend(body.lines());
        info!(added, total = self.len(), "Proxy list loaded");
        Ok(added)
    }

    pub fn len(&self) -> usize {
        self.state().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn acquire(&self) -> Option<String> {
        self.acquire_at(Instant::now())
    }

    pub fn acquire_at(&self, now: Instant) -> Option<String> {
        let mut proxies = self.state();

        let mut candidates: Vec<usize> = Vec::new();
        for (i, p) in proxies.iter_mut().enumerate() {
            if p.fail_count >= self.max_fails {
                let cooled = p
                    .last_failure
                    .map_or(true, |t| now.saturating_duration_since(t) >= self.cooldown);
                if !cooled {
                    continue;
                }
                p.fail_count = 0;
            }
            candidates.push(i);
        }
        if candidates.is_empty() {
            return None;
        }

        // Never-used proxies first, then oldest use first.
        candidates.sort_by_key(|&i| proxies[i].last_used);
        let spread = candidates.len().min(LRU_SPREAD);
        let pick = candidates[rand::thread_rng().gen_range(0..spread)];

        let chosen = &mut proxies[pick];
        chosen.last_used = Some(now);
        Some(chosen.url.clone())
    }

    pub fn report_failure(&self, url: &str) {
        self.report_failure_at(url, Instant::now());
    }

    pub fn report_failure_at(&self, url: &str, now: Instant) {
        let mut proxies = self.state();
        if let Some(p) = proxies.iter_mut().find(|p| p.url == url) {
            p.fail_count += 1;
            p.last_failure = Some(now);
            if p.fail_count == self.max_fails {
                warn!(proxy = %redact(url), cooldown_secs = self.cooldown.as_secs(), "Proxy cooling down");
            }
        }
    }

    pub fn stats(&self) -> ProxyStats {
        self.stats_at(Instant::now())
    }

    pub fn stats_at(&self, now: Instant) -> ProxyStats {
        let proxies = self.state();
        let cooling_down = proxies
            .iter()
            .filter(|p| {
                p.fail_count >= self.max_fails
                    && p.last_failure.is_some_and(|t| now.saturating_duration_since(t) < self.cooldown)
            })
            .count();
        ProxyStats { total: proxies.len(), available: proxies.len() - cooling_down, cooling_down }
    }
}

/// Strips credentials before a proxy URL reaches logs or run records.
pub fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}***@{}", &url[..scheme_end + 3], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}
