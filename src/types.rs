// =============================================================================
// Shared types used across the Meridian trading engine
// =============================================================================

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The three daily trading sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionId {
    Asian,
    London,
    NewYork,
}

impl SessionId {
    /// All sessions in intraday order.
    pub const ALL: [SessionId; 3] = [Self::Asian, Self::London, Self::NewYork];

    /// Stable name used in the database and on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Asian => "Asian_Open",
            Self::London => "London_Open",
            Self::NewYork => "NY_Open",
        }
    }
}

impl FromStr for SessionId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Asian_Open" => Ok(Self::Asian),
            "London_Open" => Ok(Self::London),
            "NY_Open" => Ok(Self::NewYork),
            other => anyhow::bail!("unknown session '{other}'"),
        }
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A concrete session open: which session, and its exact UTC open instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub open: DateTime<Utc>,
}

impl Session {
    pub fn new(id: SessionId, open: DateTime<Utc>) -> Self {
        Self { id, open }
    }
}

impl std::fmt::Display for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} @ {}", self.id, self.open.to_rfc3339())
    }
}

/// Direction of a position. Stored as BULLISH/BEARISH to match the
/// predictor's vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Bullish,
    Bearish,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bullish => "BULLISH",
            Self::Bearish => "BEARISH",
        }
    }

    /// +1.0 for longs, -1.0 for shorts; multiplies raw price movement.
    pub fn sign(&self) -> f64 {
        match self {
            Self::Bullish => 1.0,
            Self::Bearish => -1.0,
        }
    }
}

impl FromStr for Direction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BULLISH" => Ok(Self::Bullish),
            "BEARISH" => Ok(Self::Bearish),
            other => anyhow::bail!("unknown direction '{other}'"),
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of a closed position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Win,
    Loss,
    Breakeven,
    Timeout,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Win => "WIN",
            Self::Loss => "LOSS",
            Self::Breakeven => "BREAKEVEN",
            Self::Timeout => "TIMEOUT",
        }
    }
}

impl FromStr for Outcome {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WIN" => Ok(Self::Win),
            "LOSS" => Ok(Self::Loss),
            "BREAKEVEN" => Ok(Self::Breakeven),
            "TIMEOUT" => Ok(Self::Timeout),
            other => anyhow::bail!("unknown outcome '{other}'"),
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of a position an alert fired on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerKind {
    TakeProfit,
    StopLoss,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TakeProfit => "TP",
            Self::StopLoss => "SL",
        }
    }
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_names_roundtrip() {
        for id in SessionId::ALL {
            assert_eq!(id.as_str().parse::<SessionId>().unwrap(), id);
        }
    }

    #[test]
    fn direction_sign() {
        assert_eq!(Direction::Bullish.sign(), 1.0);
        assert_eq!(Direction::Bearish.sign(), -1.0);
    }

    #[test]
    fn outcome_roundtrip() {
        for o in [Outcome::Win, Outcome::Loss, Outcome::Breakeven, Outcome::Timeout] {
            assert_eq!(o.as_str().parse::<Outcome>().unwrap(), o);
        }
    }
}
