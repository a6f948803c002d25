// =============================================================================
// Persistent Store — SQLite-backed trades, account, and rolling window
// =============================================================================
//
// Single connection behind a parking_lot::Mutex, WAL mode for concurrent
// readers. Cash quantities (balances, P/L, commission) are rust_decimal
// values persisted as canonical strings; prices and pips are REAL.
//
// `close_position` is the serialization point for all outcome and account
// changes: the trade outcome update and the account update commit in one
// transaction, and closing an already-closed trade returns the stored exit
// without touching the account.
// =============================================================================

pub mod rolling;

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{Percentile, Settings, SLIPPAGE_EXIT_SL_PIPS, SLIPPAGE_EXIT_TP_PIPS};
use crate::instruments;
use crate::types::{Direction, Outcome, SessionId};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS account (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    balance TEXT NOT NULL,
    initial_balance TEXT NOT NULL,
    total_trades INTEGER NOT NULL DEFAULT 0,
    winning_trades INTEGER NOT NULL DEFAULT 0,
    losing_trades INTEGER NOT NULL DEFAULT 0,
    peak_balance TEXT NOT NULL,
    max_drawdown_pct TEXT NOT NULL DEFAULT '0.00',
    last_updated TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS trades (
    trade_id TEXT PRIMARY KEY,
    pair TEXT NOT NULL,
    session_name TEXT NOT NULL,
    session_datetime TEXT NOT NULL,

    prediction TEXT NOT NULL CHECK (prediction IN ('BULLISH', 'BEARISH')),
    conviction INTEGER CHECK (conviction BETWEEN 1 AND 10),
    rationale TEXT,
    model TEXT NOT NULL,

    entry_price REAL NOT NULL,
    spread_pips REAL NOT NULL,

    stop_loss REAL NOT NULL,
    take_profit REAL NOT NULL,
    sl_pips REAL NOT NULL,
    tp_pips REAL NOT NULL,
    lot_size REAL NOT NULL,
    risk_pct TEXT NOT NULL,
    tp_percentile TEXT NOT NULL,
    sl_percentile TEXT NOT NULL,

    exit_price REAL,
    outcome TEXT CHECK (outcome IN ('WIN', 'LOSS', 'BREAKEVEN', 'TIMEOUT')),
    pnl_pips REAL,
    pnl_cash TEXT,
    commission TEXT,

    created_at TEXT NOT NULL,
    verified_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_trades_pair_session ON trades (pair, session_name);
CREATE INDEX IF NOT EXISTS idx_trades_datetime ON trades (session_datetime DESC);

CREATE TABLE IF NOT EXISTS rolling_window (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pair TEXT NOT NULL,
    session_name TEXT NOT NULL,
    session_datetime TEXT NOT NULL,
    model TEXT NOT NULL,

    prediction TEXT NOT NULL CHECK (prediction IN ('BULLISH', 'BEARISH')),
    correct INTEGER NOT NULL,

    mfe_pips REAL NOT NULL,
    mae_pips REAL NOT NULL,

    in_window INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,

    UNIQUE (pair, session_name, session_datetime, model)
);

CREATE INDEX IF NOT EXISTS idx_rolling_lookup
    ON rolling_window (pair, session_name, session_datetime DESC);

CREATE TABLE IF NOT EXISTS percentile_targets (
    pair TEXT NOT NULL,
    session_name TEXT NOT NULL,
    model TEXT NOT NULL,
    sample_count INTEGER NOT NULL,
    accuracy_pct REAL NOT NULL,
    mfe_p25 REAL NOT NULL,
    mfe_p50 REAL NOT NULL,
    mfe_p75 REAL NOT NULL,
    mae_p25 REAL NOT NULL,
    mae_p50 REAL NOT NULL,
    mae_p75 REAL NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (pair, session_name, model)
);
"#;

// =============================================================================
// Row types
// =============================================================================

/// Parameters for opening a new simulated position.
#[derive(Debug, Clone)]
pub struct TradeEntry {
    pub pair: String,
    pub session: SessionId,
    pub session_datetime: DateTime<Utc>,
    pub prediction: Direction,
    pub conviction: u8,
    pub rationale: Option<String>,
    pub model: String,
    /// Entry already adjusted for spread by the orchestrator.
    pub entry_price: f64,
    pub spread_pips: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub sl_pips: f64,
    pub tp_pips: f64,
    pub lot_size: f64,
    pub risk_pct: Decimal,
    pub tp_percentile: Percentile,
    pub sl_percentile: Percentile,
}

/// A persisted trade row; outcome fields are all set or all null.
#[derive(Debug, Clone, Serialize)]
pub struct TradeRecord {
    pub trade_id: Uuid,
    pub pair: String,
    pub session_name: String,
    pub session_datetime: DateTime<Utc>,
    pub prediction: Direction,
    pub conviction: u8,
    pub model: String,
    pub entry_price: f64,
    pub spread_pips: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub sl_pips: f64,
    pub tp_pips: f64,
    pub lot_size: f64,
    pub exit_price: Option<f64>,
    pub outcome: Option<Outcome>,
    pub pnl_pips: Option<f64>,
    pub pnl_cash: Option<Decimal>,
    pub commission: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
}

/// Result of closing a position.
#[derive(Debug, Clone, Serialize)]
pub struct TradeExit {
    pub trade_id: Uuid,
    pub exit_price: f64,
    pub outcome: Outcome,
    pub pnl_pips: f64,
    /// Net of slippage and roundtrip commission.
    pub pnl_cash: Decimal,
    pub commission: Decimal,
    pub slippage_pips: f64,
}

/// Distinguishes a fresh close from an idempotent re-close.
#[derive(Debug, Clone)]
pub enum CloseResult {
    Closed(TradeExit),
    /// The trade was already closed; the stored exit is returned and the
    /// account is untouched.
    AlreadyClosed(TradeExit),
}

impl CloseResult {
    pub fn exit(&self) -> &TradeExit {
        match self {
            Self::Closed(e) | Self::AlreadyClosed(e) => e,
        }
    }
}

/// Account state plus derived figures for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct AccountSnapshot {
    pub balance: Decimal,
    pub initial_balance: Decimal,
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub win_rate: f64,
    pub peak_balance: Decimal,
    pub max_drawdown_pct: Decimal,
    pub pnl: Decimal,
    pub pnl_pct: f64,
    pub last_updated: DateTime<Utc>,
}

// =============================================================================
// Database
// =============================================================================

pub struct Database {
    conn: Mutex<Connection>,
    starting_balance: Decimal,
    commission_per_lot: Decimal,
    rolling_window_months: u32,
}

impl Database {
    /// Open (or create) the database at `path`, apply the schema, and seed
    /// the account row if absent.
    pub fn open(path: impl AsRef<Path>, settings: &Settings) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("failed to open database at {}", path.as_ref().display()))?;
        Self::init(conn, settings)
    }

    /// In-memory database (tests).
    pub fn open_in_memory(settings: &Settings) -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        Self::init(conn, settings)
    }

    fn init(conn: Connection, settings: &Settings) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .context("failed to set busy timeout")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply schema")?;

        let db = Self {
            conn: Mutex::new(conn),
            starting_balance: settings.starting_balance,
            commission_per_lot: settings.commission_per_lot,
            rolling_window_months: settings.rolling_window_months,
        };
        db.ensure_account()?;
        info!("database ready");
        Ok(db)
    }

    fn ensure_account(&self) -> Result<()> {
        let conn = self.conn.lock();
        let seeded: i64 = conn.query_row("SELECT COUNT(*) FROM account", [], |r| r.get(0))?;
        if seeded == 0 {
            conn.execute(
                "INSERT INTO account (id, balance, initial_balance, peak_balance, last_updated)
                 VALUES (1, ?1, ?1, ?1, ?2)",
                params![self.starting_balance.to_string(), Utc::now().to_rfc3339()],
            )
            .context("failed to seed account row")?;
            info!(balance = %self.starting_balance, "account seeded");
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Positions
    // -------------------------------------------------------------------------

    /// Persist a new position with null outcome fields; returns its id.
    pub fn open_position(&self, entry: &TradeEntry) -> Result<Uuid> {
        let trade_id = Uuid::new_v4();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO trades (
                trade_id, pair, session_name, session_datetime,
                prediction, conviction, rationale, model,
                entry_price, spread_pips,
                stop_loss, take_profit, sl_pips, tp_pips,
                lot_size, risk_pct, tp_percentile, sl_percentile,
                created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
            params![
                trade_id.to_string(),
                entry.pair,
                entry.session.as_str(),
                entry.session_datetime.to_rfc3339(),
                entry.prediction.as_str(),
                entry.conviction,
                entry.rationale,
                entry.model,
                entry.entry_price,
                entry.spread_pips,
                entry.stop_loss,
                entry.take_profit,
                entry.sl_pips,
                entry.tp_pips,
                entry.lot_size,
                entry.risk_pct.to_string(),
                entry.tp_percentile.as_str(),
                entry.sl_percentile.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )
        .context("failed to insert trade")?;

        info!(
            trade_id = %trade_id,
            pair = %entry.pair,
            prediction = %entry.prediction,
            entry_price = entry.entry_price,
            tp = entry.take_profit,
            sl = entry.stop_loss,
            lots = entry.lot_size,
            "position opened"
        );
        Ok(trade_id)
    }

    /// Close a position and settle the account, atomically.
    ///
    /// Slippage is 0.5 pips on stop exits and 0.1 pips otherwise; roundtrip
    /// commission is `2 x commission_per_lot x lots`. Calling close on an
    /// already-closed trade is idempotent.
    pub fn close_position(
        &self,
        trade_id: Uuid,
        exit_price: f64,
        outcome: Outcome,
        was_stop_exit: bool,
    ) -> Result<CloseResult> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("failed to begin transaction")?;

        let row = tx
            .query_row(
                "SELECT pair, prediction, entry_price, lot_size,
                        outcome, exit_price, pnl_pips, pnl_cash, commission
                 FROM trades WHERE trade_id = ?1",
                params![trade_id.to_string()],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, f64>(2)?,
                        r.get::<_, f64>(3)?,
                        r.get::<_, Option<String>>(4)?,
                        r.get::<_, Option<f64>>(5)?,
                        r.get::<_, Option<f64>>(6)?,
                        r.get::<_, Option<String>>(7)?,
                        r.get::<_, Option<String>>(8)?,
                    ))
                },
            )
            .optional()
            .context("failed to load trade")?;

        let Some((pair, prediction, entry_price, lot_size, prior_outcome, prior_exit, prior_pips, prior_cash, prior_comm)) =
            row
        else {
            anyhow::bail!("close of unknown trade {trade_id}");
        };

        // Idempotency: a closed trade is terminal.
        if let Some(prior) = prior_outcome {
            debug!(trade_id = %trade_id, outcome = %prior, "close ignored — already closed");
            let exit = TradeExit {
                trade_id,
                exit_price: prior_exit.unwrap_or(exit_price),
                outcome: prior.parse::<Outcome>()?,
                pnl_pips: prior_pips.unwrap_or(0.0),
                pnl_cash: decimal_from_sql(prior_cash.as_deref())?,
                commission: decimal_from_sql(prior_comm.as_deref())?,
                slippage_pips: 0.0,
            };
            return Ok(CloseResult::AlreadyClosed(exit));
        }

        let direction: Direction = prediction.parse()?;
        let slippage_pips = if was_stop_exit {
            SLIPPAGE_EXIT_SL_PIPS
        } else {
            SLIPPAGE_EXIT_TP_PIPS
        };

        // Raw movement in pips, exit slippage always working against us.
        let raw_pips =
            direction.sign() * instruments::price_diff_to_pips(&pair, exit_price - entry_price);
        let pnl_pips = round1(raw_pips - slippage_pips);

        let lots = Decimal::try_from(lot_size).context("lot size out of decimal range")?;
        let gross = Decimal::try_from(pnl_pips).context("pnl pips out of decimal range")?
            * instruments::pip_cash_per_lot(&pair)
            * lots;
        let commission = (self.commission_per_lot * dec!(2) * lots).round_dp(2);
        let net = (gross - commission).round_dp(2);

        let verified_at = Utc::now();
        tx.execute(
            "UPDATE trades
             SET exit_price = ?1, outcome = ?2, pnl_pips = ?3,
                 pnl_cash = ?4, commission = ?5, verified_at = ?6
             WHERE trade_id = ?7",
            params![
                exit_price,
                outcome.as_str(),
                pnl_pips,
                net.to_string(),
                commission.to_string(),
                verified_at.to_rfc3339(),
                trade_id.to_string(),
            ],
        )
        .context("failed to update trade outcome")?;

        Self::settle_account(&tx, net, outcome, verified_at)?;

        tx.commit().context("failed to commit close")?;

        info!(
            trade_id = %trade_id,
            pair = %pair,
            outcome = %outcome,
            exit_price,
            pnl_pips,
            pnl_cash = %net,
            "position closed"
        );

        Ok(CloseResult::Closed(TradeExit {
            trade_id,
            exit_price,
            outcome,
            pnl_pips,
            pnl_cash: net,
            commission,
            slippage_pips,
        }))
    }

    /// Apply a settled P/L to the account inside the caller's transaction.
    fn settle_account(
        tx: &rusqlite::Transaction<'_>,
        net: Decimal,
        outcome: Outcome,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let (balance, peak, max_dd, total, wins, losses) = tx.query_row(
            "SELECT balance, peak_balance, max_drawdown_pct,
                    total_trades, winning_trades, losing_trades
             FROM account WHERE id = 1",
            [],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, u32>(3)?,
                    r.get::<_, u32>(4)?,
                    r.get::<_, u32>(5)?,
                ))
            },
        )?;

        let balance = Decimal::from_str(&balance).context("corrupt account balance")?;
        let peak = Decimal::from_str(&peak).context("corrupt peak balance")?;
        let max_dd = Decimal::from_str(&max_dd).context("corrupt max drawdown")?;

        let new_balance = balance + net;
        let new_peak = peak.max(new_balance);
        let drawdown = if new_peak > Decimal::ZERO {
            ((new_peak - new_balance) / new_peak * dec!(100)).round_dp(2)
        } else {
            Decimal::ZERO
        };
        let new_max_dd = max_dd.max(drawdown);

        // Timeout and breakeven count as neither a win nor a loss.
        let (wins, losses) = match outcome {
            Outcome::Win => (wins + 1, losses),
            Outcome::Loss => (wins, losses + 1),
            Outcome::Breakeven | Outcome::Timeout => (wins, losses),
        };

        tx.execute(
            "UPDATE account
             SET balance = ?1, total_trades = ?2, winning_trades = ?3,
                 losing_trades = ?4, peak_balance = ?5, max_drawdown_pct = ?6,
                 last_updated = ?7
             WHERE id = 1",
            params![
                new_balance.to_string(),
                total + 1,
                wins,
                losses,
                new_peak.to_string(),
                new_max_dd.to_string(),
                at.to_rfc3339(),
            ],
        )
        .context("failed to update account")?;

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn account_snapshot(&self) -> Result<AccountSnapshot> {
        let conn = self.conn.lock();
        let (balance, initial, total, wins, losses, peak, max_dd, updated) = conn.query_row(
            "SELECT balance, initial_balance, total_trades, winning_trades,
                    losing_trades, peak_balance, max_drawdown_pct, last_updated
             FROM account WHERE id = 1",
            [],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, u32>(2)?,
                    r.get::<_, u32>(3)?,
                    r.get::<_, u32>(4)?,
                    r.get::<_, String>(5)?,
                    r.get::<_, String>(6)?,
                    r.get::<_, String>(7)?,
                ))
            },
        )?;

        let balance = Decimal::from_str(&balance)?;
        let initial = Decimal::from_str(&initial)?;
        let pnl = balance - initial;
        let win_rate = if total > 0 {
            f64::from(wins) / f64::from(total) * 100.0
        } else {
            0.0
        };
        let pnl_pct = if initial > Decimal::ZERO {
            decimal_to_f64(pnl / initial * dec!(100))
        } else {
            0.0
        };

        Ok(AccountSnapshot {
            balance,
            initial_balance: initial,
            total_trades: total,
            winning_trades: wins,
            losing_trades: losses,
            win_rate,
            peak_balance: Decimal::from_str(&peak)?,
            max_drawdown_pct: Decimal::from_str(&max_dd)?,
            pnl,
            pnl_pct,
            last_updated: ts_from_sql(&updated)?,
        })
    }

    pub fn get_trade(&self, trade_id: Uuid) -> Result<Option<TradeRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("{TRADE_SELECT} WHERE trade_id = ?1"),
            params![trade_id.to_string()],
            trade_record_from_row,
        )
        .optional()
        .context("failed to load trade")
    }

    /// Recent trades, newest session first.
    pub fn recent_trades(&self, limit: u32, offset: u32) -> Result<Vec<TradeRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{TRADE_SELECT} ORDER BY session_datetime DESC, created_at DESC LIMIT ?1 OFFSET ?2"
        ))?;
        let rows = stmt
            .query_map(params![limit, offset], trade_record_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub(crate) fn connection(&self) -> &Mutex<Connection> {
        &self.conn
    }

    pub(crate) fn rolling_window_months(&self) -> u32 {
        self.rolling_window_months
    }
}

const TRADE_SELECT: &str = "SELECT trade_id, pair, session_name, session_datetime,
        prediction, conviction, model, entry_price, spread_pips,
        stop_loss, take_profit, sl_pips, tp_pips, lot_size,
        exit_price, outcome, pnl_pips, pnl_cash, commission,
        created_at, verified_at
 FROM trades";

fn trade_record_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<TradeRecord> {
    let parse_fail = |e: anyhow::Error| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
    };

    let trade_id: String = r.get(0)?;
    let session_datetime: String = r.get(3)?;
    let prediction: String = r.get(4)?;
    let outcome: Option<String> = r.get(15)?;
    let pnl_cash: Option<String> = r.get(17)?;
    let commission: Option<String> = r.get(18)?;
    let created_at: String = r.get(19)?;
    let verified_at: Option<String> = r.get(20)?;

    Ok(TradeRecord {
        trade_id: Uuid::parse_str(&trade_id)
            .map_err(|e| parse_fail(anyhow::Error::from(e)))?,
        pair: r.get(1)?,
        session_name: r.get(2)?,
        session_datetime: ts_from_sql(&session_datetime).map_err(parse_fail)?,
        prediction: prediction.parse::<Direction>().map_err(parse_fail)?,
        conviction: r.get(5)?,
        model: r.get(6)?,
        entry_price: r.get(7)?,
        spread_pips: r.get(8)?,
        stop_loss: r.get(9)?,
        take_profit: r.get(10)?,
        sl_pips: r.get(11)?,
        tp_pips: r.get(12)?,
        lot_size: r.get(13)?,
        exit_price: r.get(14)?,
        outcome: outcome
            .map(|s| s.parse::<Outcome>().map_err(parse_fail))
            .transpose()?,
        pnl_pips: r.get(16)?,
        pnl_cash: pnl_cash
            .map(|s| Decimal::from_str(&s).map_err(|e| parse_fail(anyhow::Error::from(e))))
            .transpose()?,
        commission: commission
            .map(|s| Decimal::from_str(&s).map_err(|e| parse_fail(anyhow::Error::from(e))))
            .transpose()?,
        created_at: ts_from_sql(&created_at).map_err(parse_fail)?,
        verified_at: verified_at
            .map(|s| ts_from_sql(&s).map_err(parse_fail))
            .transpose()?,
    })
}

// =============================================================================
// SQL conversion helpers
// =============================================================================

pub(crate) fn ts_from_sql(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("invalid stored timestamp '{raw}'"))
}

fn decimal_from_sql(raw: Option<&str>) -> Result<Decimal> {
    match raw {
        Some(s) => Decimal::from_str(s).with_context(|| format!("invalid stored decimal '{s}'")),
        None => Ok(Decimal::ZERO),
    }
}

fn decimal_to_f64(d: Decimal) -> f64 {
    d.to_f64().unwrap_or(0.0)
}

/// Round pips to one decimal, the precision stored by the engine.
pub(crate) fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}
