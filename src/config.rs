// =============================================================================
// Engine Configuration — environment-sourced settings and compiled-in tables
// =============================================================================
//
// Every tunable lives here. Settings come from the environment (a `.env` file
// is honored via dotenv in main); the instrument list, typical ECN spreads,
// and the slippage model are compiled-in constants shared by the risk engine,
// the store, and the orchestrator.
// =============================================================================

use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Percentile choice
// =============================================================================

/// Which percentile of the MFE/MAE distribution to target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Percentile {
    P25,
    P50,
    P75,
}

impl Percentile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::P25 => "P25",
            Self::P50 => "P50",
            Self::P75 => "P75",
        }
    }
}

impl FromStr for Percentile {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "P25" => Ok(Self::P25),
            "P50" => Ok(Self::P50),
            "P75" => Ok(Self::P75),
            other => anyhow::bail!("unknown percentile '{other}' (expected P25/P50/P75)"),
        }
    }
}

impl std::fmt::Display for Percentile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Settings
// =============================================================================

/// Engine settings sourced from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    /// SQLite database path (from DATABASE_URL; `sqlite://` prefix accepted).
    pub database_url: String,
    /// Anthropic API key for the predictor.
    pub anthropic_api_key: String,
    /// Polygon.io API key for bars and the quote stream.
    pub polygon_api_key: String,

    /// Account seed balance used when the account row does not exist yet.
    pub starting_balance: Decimal,
    /// Risk per trade as a percentage of balance.
    pub risk_percent: Decimal,
    pub min_lot_size: f64,
    pub max_lot_size: f64,
    /// Commission per lot per side; roundtrip cost is twice this.
    pub commission_per_lot: Decimal,
    /// Spread assumed for instruments missing from the ECN spread table.
    pub default_spread_pips: f64,

    pub rolling_window_months: u32,
    pub tp_percentile: Percentile,
    pub sl_percentile: Percentile,

    /// Seconds before session open to pre-warm bar data (T-120 by default).
    pub ohlc_prewarm_seconds: u64,
    /// Seconds before session open to pre-render inputs (T-60 by default).
    pub input_prewarm_seconds: u64,

    /// Directory where chart-pack artifacts are written.
    pub charts_dir: String,
    /// Bind address for the admin API.
    pub bind_addr: String,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

impl Settings {
    /// Load settings from the environment, falling back to defaults for
    /// anything unset or unparseable.
    pub fn from_env() -> Self {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "meridian.db".to_string());
        // Accept sqlite:// URLs and bare paths alike.
        let database_url = database_url
            .strip_prefix("sqlite://")
            .unwrap_or(&database_url)
            .to_string();

        let settings = Self {
            database_url,
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").unwrap_or_default(),
            polygon_api_key: std::env::var("POLYGON_API_KEY").unwrap_or_default(),

            starting_balance: env_or("STARTING_BALANCE", dec!(10000.00)),
            risk_percent: env_or("RISK_PERCENT", dec!(1.55)),
            min_lot_size: env_or("MIN_LOT_SIZE", 0.01),
            max_lot_size: env_or("MAX_LOT_SIZE", 5.0),
            commission_per_lot: env_or("COMMISSION_PER_LOT", dec!(3.50)),
            default_spread_pips: env_or("DEFAULT_SPREAD_PIPS", 0.3),

            rolling_window_months: env_or("ROLLING_WINDOW_MONTHS", 6),
            tp_percentile: env_or("TP_PERCENTILE", Percentile::P75),
            sl_percentile: env_or("SL_PERCENTILE", Percentile::P50),

            ohlc_prewarm_seconds: env_or("OHLC_PREWARM_SECONDS", 120),
            input_prewarm_seconds: env_or("INPUT_PREWARM_SECONDS", 60),

            charts_dir: std::env::var("CHARTS_DIR").unwrap_or_else(|_| "charts".to_string()),
            bind_addr: std::env::var("MERIDIAN_BIND_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
        };

        info!(
            db = %settings.database_url,
            risk_percent = %settings.risk_percent,
            tp = %settings.tp_percentile,
            sl = %settings.sl_percentile,
            "settings loaded"
        );

        settings
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "meridian.db".to_string(),
            anthropic_api_key: String::new(),
            polygon_api_key: String::new(),
            starting_balance: dec!(10000.00),
            risk_percent: dec!(1.55),
            min_lot_size: 0.01,
            max_lot_size: 5.0,
            commission_per_lot: dec!(3.50),
            default_spread_pips: 0.3,
            rolling_window_months: 6,
            tp_percentile: Percentile::P75,
            sl_percentile: Percentile::P50,
            ohlc_prewarm_seconds: 120,
            input_prewarm_seconds: 60,
            charts_dir: "charts".to_string(),
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

// =============================================================================
// Compiled-in instrument tables
// =============================================================================

/// The 19 traded pairs (CHF pairs excluded).
pub const TRADING_PAIRS: &[&str] = &[
    // Majors
    "EURUSD", "GBPUSD", "USDJPY", "AUDUSD", "USDCAD", "NZDUSD",
    // Crosses
    "EURGBP", "EURJPY", "GBPJPY", "EURAUD", "EURCAD", "EURNZD",
    "GBPAUD", "GBPCAD", "GBPNZD", "AUDJPY", "CADJPY",
    // Metals
    "XAUUSD", "XAGUSD",
];

/// Typical ECN spread per pair, in pips. Pairs not listed here fall back to
/// `Settings::default_spread_pips`.
pub fn typical_spread_pips(pair: &str) -> Option<f64> {
    let spread = match pair {
        "EURUSD" => 0.1,
        "GBPUSD" => 0.3,
        "USDJPY" => 0.2,
        "AUDUSD" => 0.3,
        "USDCAD" => 0.4,
        "NZDUSD" => 0.5,
        "EURGBP" => 0.4,
        "EURJPY" => 0.5,
        "GBPJPY" => 0.8,
        "EURAUD" => 0.6,
        "EURCAD" => 0.6,
        "EURNZD" => 0.8,
        "GBPAUD" => 0.9,
        "GBPCAD" => 0.8,
        "GBPNZD" => 1.0,
        "AUDJPY" => 0.5,
        "CADJPY" => 0.5,
        "XAUUSD" => 0.15,
        "XAGUSD" => 0.02,
        _ => return None,
    };
    Some(spread)
}

// =============================================================================
// Slippage model (pips)
// =============================================================================

/// Slippage on a limit exit at take-profit.
pub const SLIPPAGE_EXIT_TP_PIPS: f64 = 0.1;
/// Slippage on a stop exit — stops fill worse than limits.
pub const SLIPPAGE_EXIT_SL_PIPS: f64 = 0.5;

// =============================================================================
// Upstream timeouts & retries
// =============================================================================

/// HTTP timeout for bar fetches.
pub const BAR_HTTP_TIMEOUT: Duration = Duration::from_secs(30);
/// Retry budget for bar fetches.
pub const BAR_HTTP_RETRIES: u32 = 3;
/// First retry delay for bar fetches; doubles per attempt.
pub const BAR_HTTP_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Quote stream connect timeout.
pub const STREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Protocol-level ping cadence on the quote stream.
pub const STREAM_PING_INTERVAL: Duration = Duration::from_secs(30);
/// How long a ping may go unanswered before the link is considered dead.
pub const STREAM_PING_TIMEOUT: Duration = Duration::from_secs(10);
/// Delay before a reconnection attempt.
pub const STREAM_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Retry budget for predictor calls (rate-limit or timeout only).
pub const PREDICTOR_RETRIES: u32 = 3;
/// First retry delay for predictor calls; doubles per attempt.
pub const PREDICTOR_BACKOFF_BASE: Duration = Duration::from_secs(2);

/// Width of the chart-render worker pool.
pub const RENDER_POOL_WIDTH: usize = 4;

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.starting_balance, dec!(10000.00));
        assert_eq!(s.risk_percent, dec!(1.55));
        assert_eq!(s.commission_per_lot, dec!(3.50));
        assert_eq!(s.min_lot_size, 0.01);
        assert_eq!(s.max_lot_size, 5.0);
        assert_eq!(s.rolling_window_months, 6);
        assert_eq!(s.tp_percentile, Percentile::P75);
        assert_eq!(s.sl_percentile, Percentile::P50);
        assert_eq!(s.ohlc_prewarm_seconds, 120);
        assert_eq!(s.input_prewarm_seconds, 60);
    }

    #[test]
    fn nineteen_pairs_all_have_spreads() {
        assert_eq!(TRADING_PAIRS.len(), 19);
        for pair in TRADING_PAIRS {
            assert!(
                typical_spread_pips(pair).is_some(),
                "missing spread for {pair}"
            );
        }
    }

    #[test]
    fn unknown_pair_has_no_spread() {
        assert!(typical_spread_pips("USDCHF").is_none());
    }

    #[test]
    fn percentile_parses_case_insensitively() {
        assert_eq!("p75".parse::<Percentile>().unwrap(), Percentile::P75);
        assert_eq!("P25".parse::<Percentile>().unwrap(), Percentile::P25);
        assert!("P99".parse::<Percentile>().is_err());
    }
}
