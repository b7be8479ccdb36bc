// =============================================================================
// Shared types used across the demo desk
// =============================================================================

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// A single timestamped price observation from the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    #[serde(default)]
    pub symbol: String,
    /// Unix seconds.
    pub epoch: i64,
    pub quote: f64,
}

impl Tick {
    pub fn new(symbol: impl Into<String>, epoch: i64, quote: f64) -> Self {
        Self {
            symbol: symbol.into(),
            epoch,
            quote,
        }
    }

    /// Reject quotes that would corrupt candles or settlement math.
    pub fn validate(&self) -> Result<(), SessionError> {
        if !self.quote.is_finite() {
            return Err(SessionError::InvalidTick(format!(
                "non-finite quote {} at epoch {}",
                self.quote, self.epoch
            )));
        }
        if self.quote <= 0.0 {
            return Err(SessionError::InvalidTick(format!(
                "non-positive quote {} at epoch {}",
                self.quote, self.epoch
            )));
        }
        Ok(())
    }
}

/// Contract types offered by the trade form.
///
/// `Digits` and `Multiplier` are menu entries only; they carry no win
/// condition and are refused at placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContractType {
    Rise,
    Fall,
    Higher,
    Lower,
    Touch,
    NoTouch,
    Digits,
    Multiplier,
}

impl ContractType {
    pub fn is_supported(self) -> bool {
        !matches!(self, Self::Digits | Self::Multiplier)
    }
}

impl std::fmt::Display for ContractType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rise => write!(f, "Rise"),
            Self::Fall => write!(f, "Fall"),
            Self::Higher => write!(f, "Higher"),
            Self::Lower => write!(f, "Lower"),
            Self::Touch => write!(f, "Touch"),
            Self::NoTouch => write!(f, "No Touch"),
            Self::Digits => write!(f, "Digits"),
            Self::Multiplier => write!(f, "Multiplier"),
        }
    }
}

impl FromStr for ContractType {
    type Err = SessionError;

    /// Accepts the variant names as well as the labels shown in the trade form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalised: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        match normalised.as_str() {
            "rise" | "call" => Ok(Self::Rise),
            "fall" | "put" => Ok(Self::Fall),
            "higher" => Ok(Self::Higher),
            "lower" => Ok(Self::Lower),
            "touch" | "onetouch" => Ok(Self::Touch),
            "notouch" => Ok(Self::NoTouch),
            "digits" => Ok(Self::Digits),
            "multiplier" => Ok(Self::Multiplier),
            _ => Err(SessionError::InvalidTrade(format!(
                "unknown contract type '{s}'"
            ))),
        }
    }
}

/// Rule that decides when a pending trade is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ExpiryCondition {
    /// Settle on the N-th tick observed after the trade opened.
    Ticks(u32),
    /// Settle on the first tick whose epoch is at or after this timestamp.
    Deadline(i64),
}

impl Default for ExpiryCondition {
    fn default() -> Self {
        Self::Ticks(5)
    }
}

impl std::fmt::Display for ExpiryCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ticks(n) => write!(f, "{n} ticks"),
            Self::Deadline(at) => write!(f, "deadline {at}"),
        }
    }
}

/// Which side of the entry price a touch target sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BarrierSide {
    Above,
    Below,
}

impl std::fmt::Display for BarrierSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Above => write!(f, "Above"),
            Self::Below => write!(f, "Below"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeResult {
    Win,
    Loss,
}

impl std::fmt::Display for TradeResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Win => write!(f, "Win"),
            Self::Loss => write!(f, "Loss"),
        }
    }
}

/// What `open_trade` does when the active slot is already taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActiveTradePolicy {
    /// Refuse the new trade with `TradeAlreadyActive`.
    Reject,
    /// Drop the pending trade unsettled and open the new one.
    Replace,
}

impl Default for ActiveTradePolicy {
    fn default() -> Self {
        Self::Reject
    }
}

impl std::fmt::Display for ActiveTradePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reject => write!(f, "Reject"),
            Self::Replace => write!(f, "Replace"),
        }
    }
}
