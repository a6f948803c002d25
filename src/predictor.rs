// =============================================================================
// Predictor — chart-pack analysis via the Anthropic messages API
// =============================================================================
//
// The model's free-text response is parsed by a single function with an
// explicit fallback chain:
//   1. a "Current Bias" line classified on the same line,
//   2. else the next few lines (bold or bare BULLISH/BEARISH/NEUTRAL),
//   3. else the first 500 characters of the whole response,
//   4. else Neutral.
//
// Retries: 3 attempts on rate-limit or timeout, exponential backoff from 2s.
// =============================================================================

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{PREDICTOR_BACKOFF_BASE, PREDICTOR_RETRIES};
use crate::types::{Direction, SessionId};

/// Parsed directional call. Conviction rides with the direction; a Neutral
/// call carries none and opens no position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Bias {
    Bullish { conviction: u8 },
    Bearish { conviction: u8 },
    Neutral,
}

impl Bias {
    /// Direction to trade, or None for Neutral.
    pub fn direction(&self) -> Option<(Direction, u8)> {
        match *self {
            Self::Bullish { conviction } => Some((Direction::Bullish, conviction)),
            Self::Bearish { conviction } => Some((Direction::Bearish, conviction)),
            Self::Neutral => None,
        }
    }
}

/// A completed prediction.
#[derive(Debug, Clone)]
pub struct Prediction {
    pub bias: Bias,
    /// The model's full analysis text.
    pub rationale: String,
    pub model_key: String,
    pub cost: f64,
    pub latency_ms: u64,
}

/// The external predictor boundary.
#[async_trait]
pub trait Predictor: Send + Sync {
    /// Stable identifier stored with trades and window rows.
    fn model_key(&self) -> &str;

    async fn predict(
        &self,
        artifact: &Path,
        pair: &str,
        session: SessionId,
    ) -> Result<Prediction>;
}

// =============================================================================
// Response parsing
// =============================================================================

/// Parse a model response into a Bias. Never fails: anything unclassifiable
/// is Neutral.
pub fn parse_prediction(text: &str) -> Bias {
    let direction = parse_direction(text);
    let conviction = parse_conviction(text).unwrap_or(5);

    match direction {
        Some(Direction::Bullish) => Bias::Bullish { conviction },
        Some(Direction::Bearish) => Bias::Bearish { conviction },
        None => Bias::Neutral,
    }
}

fn classify(line: &str) -> Option<Option<Direction>> {
    // Returns Some(direction) when the line names a class; the inner None
    // encodes an explicit NEUTRAL.
    if line.contains("BULLISH") {
        Some(Some(Direction::Bullish))
    } else if line.contains("BEARISH") {
        Some(Some(Direction::Bearish))
    } else if line.contains("NEUTRAL") {
        Some(None)
    } else {
        None
    }
}

fn parse_direction(text: &str) -> Option<Direction> {
    let lines: Vec<String> = text.lines().map(|l| l.to_uppercase()).collect();

    for (i, line) in lines.iter().enumerate() {
        if !line.contains("CURRENT BIAS") {
            continue;
        }
        // Same-line classification wins.
        if let Some(direction) = classify(line) {
            return direction;
        }
        // Multi-line format: the class sits on one of the next few lines,
        // often bolded.
        for next in lines.iter().skip(i + 1).take(3) {
            if let Some(direction) = classify(next.trim()) {
                return direction;
            }
        }
        break;
    }

    // Fallback: scan the head of the response.
    let head: String = text.chars().take(500).collect::<String>().to_uppercase();
    if head.contains("BULLISH") {
        Some(Direction::Bullish)
    } else if head.contains("BEARISH") {
        Some(Direction::Bearish)
    } else {
        None
    }
}

fn parse_conviction(text: &str) -> Option<u8> {
    let upper = text.to_uppercase();
    let idx = upper.find("CONVICTION")?;
    // Digits following the marker, tolerating ":", "**", whitespace, "7/10".
    let tail = &upper[idx + "CONVICTION".len()..];
    let digits: String = tail
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .take(2)
        .collect();

    let value: u8 = digits.parse().ok()?;
    (1..=10).contains(&value).then_some(value)
}

// =============================================================================
// Claude predictor
// =============================================================================

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MODEL: &str = "claude-haiku-4-5-20251001";
const MODEL_KEY: &str = "claude_haiku_45";
/// Approximate cost per prediction at Haiku pricing.
const COST_PER_CALL: f64 = 0.001;

pub struct ClaudePredictor {
    api_key: String,
    client: reqwest::Client,
}

impl ClaudePredictor {
    pub fn new(api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .expect("failed to build reqwest client");
        Self {
            api_key: api_key.into(),
            client,
        }
    }

    fn build_prompt(pair: &str, session: SessionId, chart_pack: &str) -> String {
        format!(
            "Analyze the attached intraday chart pack for {pair} ahead of the {session} session.\n\
             \n\
             The chart pack is JSON with 15-minute OHLC bars (oldest first), session \n\
             high/low levels, previous-day high/low, and numbered fair value gaps (FVGs).\n\
             Higher FVG numbers are more recent; bullish FVGs gap upward, bearish gap \n\
             downward. Treat session levels and the previous-day high/low as key \n\
             support/resistance.\n\
             \n\
             {chart_pack}\n\
             \n\
             Provide a concise technical analysis with:\n\
             \n\
             1. Current Bias: [BULLISH/BEARISH/NEUTRAL]\n\
             2. Next Hour Prediction: [Up/Down/Neutral]\n\
             3. Conviction: [1-10] (10 = highest confidence)\n\
             4. ## General Analysis\n\
                3-5 sentences on session patterns, level interactions, and FVG recency.\n\
             5. ## Bullish Factors (bullet points, maximum 5)\n\
             6. ## Bearish Factors (bullet points, maximum 5)\n\
             \n\
             Be specific with FVG numbers and levels. Be decisive: LONG, SHORT, or WAIT.\n\
             Ensure each section has content and strictly follow this format."
        )
    }

    async fn call_once(&self, prompt: &str) -> Result<ApiOutcome> {
        let body = serde_json::json!({
            "model": MODEL,
            "max_tokens": 2000,
            "messages": [{
                "role": "user",
                "content": [{ "type": "text", "text": prompt }]
            }]
        });

        let resp = match self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => return Ok(ApiOutcome::Retryable("timeout".to_string())),
            Err(e) => return Err(e).context("predictor request failed"),
        };

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Ok(ApiOutcome::Retryable("rate limited".to_string()));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse predictor response")?;

        if !status.is_success() {
            anyhow::bail!("predictor returned {status}: {body}");
        }

        let text = body["content"][0]["text"]
            .as_str()
            .context("predictor response missing content text")?
            .to_string();

        Ok(ApiOutcome::Text(text))
    }
}

enum ApiOutcome {
    Text(String),
    Retryable(String),
}

#[async_trait]
impl Predictor for ClaudePredictor {
    fn model_key(&self) -> &str {
        MODEL_KEY
    }

    async fn predict(
        &self,
        artifact: &Path,
        pair: &str,
        session: SessionId,
    ) -> Result<Prediction> {
        let started = Instant::now();

        let chart_pack = tokio::fs::read_to_string(artifact)
            .await
            .with_context(|| format!("failed to read chart pack {}", artifact.display()))?;
        let prompt = Self::build_prompt(pair, session, &chart_pack);

        let mut backoff = PREDICTOR_BACKOFF_BASE;
        let mut last_reason = String::new();

        for attempt in 0..PREDICTOR_RETRIES {
            if attempt > 0 {
                warn!(pair, attempt, reason = %last_reason, "retrying prediction");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }

            match self.call_once(&prompt).await? {
                ApiOutcome::Text(text) => {
                    let bias = parse_prediction(&text);
                    let latency_ms = started.elapsed().as_millis() as u64;
                    info!(pair, session = %session, bias = ?bias, latency_ms, "prediction complete");
                    return Ok(Prediction {
                        bias,
                        rationale: text,
                        model_key: MODEL_KEY.to_string(),
                        cost: COST_PER_CALL,
                        latency_ms,
                    });
                }
                ApiOutcome::Retryable(reason) => {
                    last_reason = reason;
                }
            }
        }

        debug!(pair, reason = %last_reason, "prediction retries exhausted");
        anyhow::bail!("prediction for {pair} failed after retries: {last_reason}")
    }
}

impl std::fmt::Debug for ClaudePredictor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaudePredictor")
            .field("api_key", &"<redacted>")
            .field("model", &MODEL)
            .finish()
    }
}
