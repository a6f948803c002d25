// =============================================================================
// Polygon.io REST client — forex aggregate bars
// =============================================================================
//
// GET /v2/aggs/ticker/C:{PAIR}/range/{mult}/{span}/{from}/{to}
//
// Pagination is followed via `next_url` until exhausted. Failures retry up
// to 3 times with exponential backoff starting at 1s; a 429 honors the
// upstream Retry-After header instead of the computed backoff.
// =============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, warn};

use crate::config::{BAR_HTTP_BACKOFF_BASE, BAR_HTTP_RETRIES, BAR_HTTP_TIMEOUT};

use super::Bar;

const POLYGON_BASE_URL: &str = "https://api.polygon.io";

/// REST client for Polygon forex aggregates.
#[derive(Clone)]
pub struct BarClient {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl BarClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(BAR_HTTP_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key: api_key.into(),
            base_url: POLYGON_BASE_URL.to_string(),
            client,
        }
    }

    /// Fetch 15-minute bars for `pair` over `[start, end]`, oldest first.
    pub async fn fetch_bars(
        &self,
        pair: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>> {
        let mut url = format!(
            "{}/v2/aggs/ticker/C:{}/range/15/minute/{}/{}?adjusted=true&sort=asc&limit=50000&apiKey={}",
            self.base_url,
            pair,
            start.timestamp_millis(),
            end.timestamp_millis(),
            self.api_key,
        );

        let mut bars = Vec::new();

        // Follow next_url pages until exhausted.
        loop {
            let body = self.get_with_retries(&url, pair).await?;

            if let Some(results) = body.get("results").and_then(|v| v.as_array()) {
                for entry in results {
                    match parse_agg(entry) {
                        Ok(b) => bars.push(b),
                        Err(e) => warn!(pair, error = %e, "skipping malformed aggregate"),
                    }
                }
            }

            match body.get("next_url").and_then(|v| v.as_str()) {
                Some(next) => {
                    url = format!("{next}&apiKey={}", self.api_key);
                }
                None => break,
            }
        }

        debug!(pair, count = bars.len(), "bars fetched");
        Ok(bars)
    }

    /// GET a URL with the retry/backoff policy, returning the parsed JSON.
    async fn get_with_retries(&self, url: &str, pair: &str) -> Result<serde_json::Value> {
        let mut backoff = BAR_HTTP_BACKOFF_BASE;
        let mut last_error = None;

        for attempt in 0..=BAR_HTTP_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }

            let resp = match self.client.get(url).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    warn!(pair, attempt, error = %e, "bar request failed");
                    last_error = Some(anyhow::Error::from(e));
                    continue;
                }
            };

            let status = resp.status();

            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                // Respect the upstream's Retry-After over our own backoff.
                if let Some(secs) = resp
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                {
                    backoff = std::time::Duration::from_secs(secs);
                }
                warn!(pair, attempt, "rate limited by upstream");
                last_error = Some(anyhow::anyhow!("rate limited (429)"));
                continue;
            }

            if status.is_server_error() {
                warn!(pair, attempt, status = %status, "upstream server error");
                last_error = Some(anyhow::anyhow!("upstream returned {status}"));
                continue;
            }

            let body: serde_json::Value = resp
                .json()
                .await
                .context("failed to parse aggregates response")?;

            if !status.is_success() {
                anyhow::bail!("aggregates request for {pair} returned {status}: {body}");
            }

            return Ok(body);
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("bar fetch retries exhausted")))
    }
}

/// Parse one aggregate entry: `{ "t": ms, "o":, "h":, "l":, "c":, "v": }`.
fn parse_agg(entry: &serde_json::Value) -> Result<Bar> {
    let ts_ms = entry["t"].as_i64().context("missing field t")?;
    let timestamp = Utc
        .timestamp_millis_opt(ts_ms)
        .single()
        .context("aggregate timestamp out of range")?;

    Ok(Bar {
        timestamp,
        open: entry["o"].as_f64().context("missing field o")?,
        high: entry["h"].as_f64().context("missing field h")?,
        low: entry["l"].as_f64().context("missing field l")?,
        close: entry["c"].as_f64().context("missing field c")?,
        volume: entry["v"].as_f64().unwrap_or(0.0),
    })
}

impl std::fmt::Debug for BarClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BarClient")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_agg_happy_path() {
        let entry = serde_json::json!({
            "t": 1721030400000_i64,
            "o": 1.0891, "h": 1.0902, "l": 1.0885, "c": 1.0899, "v": 1234.0
        });
        let bar = parse_agg(&entry).unwrap();
        assert_eq!(bar.open, 1.0891);
        assert_eq!(bar.high, 1.0902);
        assert_eq!(bar.low, 1.0885);
        assert_eq!(bar.close, 1.0899);
        assert_eq!(bar.timestamp.timestamp_millis(), 1721030400000);
    }

    #[test]
    fn parse_agg_rejects_missing_fields() {
        let entry = serde_json::json!({ "t": 1721030400000_i64, "o": 1.0 });
        assert!(parse_agg(&entry).is_err());
    }

    #[test]
    fn parse_agg_defaults_missing_volume() {
        let entry = serde_json::json!({
            "t": 1721030400000_i64,
            "o": 1.0, "h": 1.0, "l": 1.0, "c": 1.0
        });
        assert_eq!(parse_agg(&entry).unwrap().volume, 0.0);
    }
}
