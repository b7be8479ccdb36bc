// =============================================================================
// Demo Trade Settlement: single-slot state machine for simulated contracts
// =============================================================================
//
// Life-cycle:
//   (open_trade)  ->  Pending  --tick-->  Pending   (expiry not met)
//                                 \-->  Settled   (expiry met, removed from slot)
//
// Win conditions evaluated at expiry:
//   Rise     exit >  entry
//   Fall     exit <  entry
//   Higher   exit >  entry * (1 + barrier_offset)
//   Lower    exit <  entry * (1 - barrier_offset)
//   Touch    target reached by any tick after entry (expiry tick included)
//   NoTouch  target never reached
//
// Win credits `stake * payout_ratio`, Loss debits `stake`. Every settlement
// appends one immutable ledger entry. The engine is owned by the session task;
// nothing else mutates balance or ledger.
// =============================================================================

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SessionError;
use crate::runtime_config::RuntimeConfig;
use crate::types::{
    ActiveTradePolicy, BarrierSide, ContractType, ExpiryCondition, Tick, TradeResult,
};

// ---------------------------------------------------------------------------
// Trade model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeStatus {
    Pending,
    Settled,
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Settled => write!(f, "Settled"),
        }
    }
}

/// Everything needed to place a demo trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRequest {
    pub symbol: String,
    pub contract_type: ContractType,
    pub stake: f64,
    pub entry_price: f64,
    /// Unix seconds of the tick the entry price was taken from.
    pub entry_time: i64,
    #[serde(default)]
    pub expiry: ExpiryCondition,
    /// Side of the touch target. Drawn at random when absent.
    #[serde(default)]
    pub touch_side: Option<BarrierSide>,
}

/// A placed demo trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemoTrade {
    /// Unique identifier (UUID v4).
    pub id: String,
    pub symbol: String,
    pub contract_type: ContractType,
    pub stake: f64,
    pub entry_price: f64,
    pub entry_time: i64,
    pub expiry: ExpiryCondition,
    /// Target for Touch/NoTouch, strike for Higher/Lower.
    #[serde(default)]
    pub barrier: Option<f64>,
    #[serde(default)]
    pub barrier_side: Option<BarrierSide>,
    /// Ticks observed since the trade was opened.
    #[serde(default)]
    pub ticks_seen: u32,
    #[serde(default)]
    pub high_since_entry: Option<f64>,
    #[serde(default)]
    pub low_since_entry: Option<f64>,
    pub status: TradeStatus,
    pub opened_at: String,
}

/// Price and time at which a trade's expiry condition was met.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TradeExit {
    pub price: f64,
    pub epoch: i64,
}

impl DemoTrade {
    /// Feed one tick to a pending trade.
    ///
    /// Returns the exit once the expiry condition is satisfied, `None` while
    /// the trade stays pending. Settled trades ignore further ticks.
    pub fn observe(&mut self, tick: &Tick) -> Option<TradeExit> {
        if self.status != TradeStatus::Pending {
            return None;
        }

        self.ticks_seen = self.ticks_seen.saturating_add(1);
        self.high_since_entry = Some(
            self.high_since_entry
                .map_or(tick.quote, |h| h.max(tick.quote)),
        );
        self.low_since_entry = Some(
            self.low_since_entry
                .map_or(tick.quote, |l| l.min(tick.quote)),
        );

        let expired = match self.expiry {
            ExpiryCondition::Ticks(n) => self.ticks_seen >= n,
            ExpiryCondition::Deadline(at) => tick.epoch >= at,
        };

        expired.then_some(TradeExit {
            price: tick.quote,
            epoch: tick.epoch,
        })
    }

    /// Whether the touch target has been reached since entry.
    pub fn touched(&self) -> bool {
        let Some(barrier) = self.barrier else {
            return false;
        };
        match self.barrier_side {
            Some(BarrierSide::Above) => self.high_since_entry.is_some_and(|h| h >= barrier),
            Some(BarrierSide::Below) => self.low_since_entry.is_some_and(|l| l <= barrier),
            None => false,
        }
    }

    fn barrier_or_err(&self) -> Result<f64, SessionError> {
        self.barrier.ok_or_else(|| {
            SessionError::InvalidTrade(format!("trade {} has no barrier", self.id))
        })
    }

    /// Decide the outcome for an exit at `exit_price`.
    pub fn evaluate(&self, exit_price: f64) -> Result<TradeResult, SessionError> {
        let won = match self.contract_type {
            ContractType::Rise => exit_price > self.entry_price,
            ContractType::Fall => exit_price < self.entry_price,
            ContractType::Higher => exit_price > self.barrier_or_err()?,
            ContractType::Lower => exit_price < self.barrier_or_err()?,
            ContractType::Touch => self.touched(),
            ContractType::NoTouch => !self.touched(),
            other => return Err(SessionError::UnsupportedContractType(other)),
        };
        Ok(if won { TradeResult::Win } else { TradeResult::Loss })
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// One settled trade. Never mutated after it is appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub trade_id: String,
    pub symbol: String,
    pub contract_type: ContractType,
    pub stake: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub result: TradeResult,
    pub profit_or_loss: f64,
    pub entry_time: i64,
    pub exit_time: i64,
    /// RFC 3339 wall-clock time of settlement.
    pub timestamp: String,
}

/// Aggregate figures over the whole ledger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerStats {
    pub total_trades: usize,
    pub wins: usize,
    pub losses: usize,
    /// Percentage in `[0, 100]`.
    pub win_rate_pct: f64,
    pub total_profit: f64,
}

impl LedgerStats {
    pub fn from_entries(entries: &[LedgerEntry]) -> Self {
        let total_trades = entries.len();
        let wins = entries
            .iter()
            .filter(|e| e.result == TradeResult::Win)
            .count();
        let win_rate_pct = if total_trades > 0 {
            wins as f64 / total_trades as f64 * 100.0
        } else {
            0.0
        };
        Self {
            total_trades,
            wins,
            losses: total_trades - wins,
            win_rate_pct,
            total_profit: entries.iter().map(|e| e.profit_or_loss).sum(),
        }
    }
}

/// Emitted when a pending trade settles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementResult {
    pub trade_id: String,
    pub result: TradeResult,
    pub exit_price: f64,
    pub exit_time: i64,
    pub profit_or_loss: f64,
    pub balance_after: f64,
}

// ---------------------------------------------------------------------------
// Settlement Engine
// ---------------------------------------------------------------------------

/// Constants the engine is built with.
#[derive(Debug, Clone)]
pub struct SettlementConfig {
    pub starting_balance: f64,
    /// Profit fraction of stake on a win (e.g. 0.95).
    pub payout_ratio: f64,
    pub min_stake: f64,
    /// Relative distance of touch targets and Higher/Lower strikes.
    pub barrier_offset: f64,
    pub policy: ActiveTradePolicy,
    pub rng_seed: Option<u64>,
}

impl From<&RuntimeConfig> for SettlementConfig {
    fn from(cfg: &RuntimeConfig) -> Self {
        Self {
            starting_balance: cfg.starting_balance,
            payout_ratio: cfg.payout_ratio,
            min_stake: cfg.min_stake,
            barrier_offset: cfg.barrier_offset,
            policy: cfg.active_trade_policy,
            rng_seed: cfg.rng_seed,
        }
    }
}

/// Owns the active-trade slot, the balance and the ledger.
pub struct SettlementEngine {
    config: SettlementConfig,
    active: Option<DemoTrade>,
    balance: f64,
    ledger: Vec<LedgerEntry>,
    rng: StdRng,
}

impl SettlementEngine {
    pub fn new(config: SettlementConfig) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        info!(
            balance = config.starting_balance,
            payout_ratio = config.payout_ratio,
            policy = %config.policy,
            "SettlementEngine initialised"
        );
        Self {
            balance: config.starting_balance,
            config,
            active: None,
            ledger: Vec::new(),
            rng,
        }
    }

    // -------------------------------------------------------------------------
    // Open a trade
    // -------------------------------------------------------------------------

    /// Place a trade into the active slot.
    ///
    /// Fails on malformed input, placeholder contract types, or (under the
    /// `Reject` policy) when a trade is already pending. Under `Replace` the
    /// pending trade is dropped without touching balance or ledger.
    pub fn open_trade(&mut self, request: TradeRequest) -> Result<DemoTrade, SessionError> {
        self.validate_request(&request)?;

        if let Some(current) = &self.active {
            match self.config.policy {
                ActiveTradePolicy::Reject => {
                    warn!(active_id = %current.id, "trade rejected: slot occupied");
                    return Err(SessionError::TradeAlreadyActive {
                        active_id: current.id.clone(),
                    });
                }
                ActiveTradePolicy::Replace => {
                    warn!(
                        replaced_id = %current.id,
                        ticks_seen = current.ticks_seen,
                        "pending trade replaced without settlement"
                    );
                }
            }
        }

        let (barrier, barrier_side) = self.barrier_for(&request);

        let trade = DemoTrade {
            id: Uuid::new_v4().to_string(),
            symbol: request.symbol,
            contract_type: request.contract_type,
            stake: request.stake,
            entry_price: request.entry_price,
            entry_time: request.entry_time,
            expiry: request.expiry,
            barrier,
            barrier_side,
            ticks_seen: 0,
            high_since_entry: None,
            low_since_entry: None,
            status: TradeStatus::Pending,
            opened_at: Utc::now().to_rfc3339(),
        };

        info!(
            id = %trade.id,
            symbol = %trade.symbol,
            contract = %trade.contract_type,
            stake = trade.stake,
            entry_price = trade.entry_price,
            expiry = %trade.expiry,
            barrier = ?trade.barrier,
            "demo trade opened"
        );

        self.active = Some(trade.clone());
        Ok(trade)
    }

    fn validate_request(&self, request: &TradeRequest) -> Result<(), SessionError> {
        if !request.contract_type.is_supported() {
            return Err(SessionError::UnsupportedContractType(request.contract_type));
        }
        if !request.stake.is_finite() || request.stake <= 0.0 {
            return Err(SessionError::InvalidTrade(format!(
                "stake must be a positive number, got {}",
                request.stake
            )));
        }
        if request.stake < self.config.min_stake {
            return Err(SessionError::InvalidTrade(format!(
                "stake {} is below the minimum of {}",
                request.stake, self.config.min_stake
            )));
        }
        if !request.entry_price.is_finite() || request.entry_price <= 0.0 {
            return Err(SessionError::InvalidTrade(format!(
                "entry price must be a positive number, got {}",
                request.entry_price
            )));
        }
        match request.expiry {
            ExpiryCondition::Ticks(0) => Err(SessionError::InvalidTrade(
                "tick expiry must be at least one tick".into(),
            )),
            ExpiryCondition::Deadline(at) if at <= request.entry_time => {
                Err(SessionError::InvalidTrade(format!(
                    "deadline {at} is not after entry time {}",
                    request.entry_time
                )))
            }
            _ => Ok(()),
        }
    }

    fn barrier_for(&mut self, request: &TradeRequest) -> (Option<f64>, Option<BarrierSide>) {
        let offset = self.config.barrier_offset;
        let entry = request.entry_price;
        match request.contract_type {
            ContractType::Higher => (Some(entry * (1.0 + offset)), Some(BarrierSide::Above)),
            ContractType::Lower => (Some(entry * (1.0 - offset)), Some(BarrierSide::Below)),
            ContractType::Touch | ContractType::NoTouch => {
                let side = request.touch_side.unwrap_or_else(|| {
                    if self.rng.gen_bool(0.5) {
                        BarrierSide::Above
                    } else {
                        BarrierSide::Below
                    }
                });
                let target = match side {
                    BarrierSide::Above => entry * (1.0 + offset),
                    BarrierSide::Below => entry * (1.0 - offset),
                };
                (Some(target), Some(side))
            }
            _ => (None, None),
        }
    }

    // -------------------------------------------------------------------------
    // Tick updates
    // -------------------------------------------------------------------------

    /// Advance the active trade by one tick and settle it if it expired.
    ///
    /// Returns `Ok(None)` when there is no active trade or it is still
    /// pending. An invalid tick is refused before any state is touched.
    pub fn on_tick(&mut self, tick: &Tick) -> Result<Option<SettlementResult>, SessionError> {
        tick.validate()?;

        let Some(trade) = self.active.as_mut() else {
            return Ok(None);
        };

        let Some(exit) = trade.observe(tick) else {
            debug!(
                id = %trade.id,
                ticks_seen = trade.ticks_seen,
                quote = tick.quote,
                "trade pending"
            );
            return Ok(None);
        };

        let result = trade.evaluate(exit.price)?;

        // Only now does the trade leave the slot.
        let Some(mut trade) = self.active.take() else {
            return Ok(None);
        };
        trade.status = TradeStatus::Settled;

        let profit_or_loss = match result {
            TradeResult::Win => trade.stake * self.config.payout_ratio,
            TradeResult::Loss => -trade.stake,
        };
        self.balance += profit_or_loss;

        self.ledger.push(LedgerEntry {
            trade_id: trade.id.clone(),
            symbol: trade.symbol.clone(),
            contract_type: trade.contract_type,
            stake: trade.stake,
            entry_price: trade.entry_price,
            exit_price: exit.price,
            result,
            profit_or_loss,
            entry_time: trade.entry_time,
            exit_time: exit.epoch,
            timestamp: Utc::now().to_rfc3339(),
        });

        info!(
            id = %trade.id,
            contract = %trade.contract_type,
            entry_price = trade.entry_price,
            exit_price = exit.price,
            result = %result,
            profit_or_loss,
            balance = self.balance,
            "demo trade settled"
        );

        Ok(Some(SettlementResult {
            trade_id: trade.id,
            result,
            exit_price: exit.price,
            exit_time: exit.epoch,
            profit_or_loss,
            balance_after: self.balance,
        }))
    }

    // -------------------------------------------------------------------------
    // Balance
    // -------------------------------------------------------------------------

    /// Overwrite the balance. The ledger is left as is.
    pub fn reset_balance(&mut self, balance: f64) -> Result<f64, SessionError> {
        if !balance.is_finite() || balance < 0.0 {
            return Err(SessionError::InvalidBalance(balance));
        }
        let previous = self.balance;
        self.balance = balance;
        info!(previous, balance, "demo balance reset");
        Ok(balance)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn active_trade(&self) -> Option<&DemoTrade> {
        self.active.as_ref()
    }

    pub fn balance(&self) -> f64 {
        self.balance
    }

    /// Settled trades in settlement order.
    pub fn ledger(&self) -> &[LedgerEntry] {
        &self.ledger
    }

    pub fn stats(&self) -> LedgerStats {
        LedgerStats::from_entries(&self.ledger)
    }
}

impl std::fmt::Debug for SettlementEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettlementEngine")
            .field("active", &self.active.as_ref().map(|t| &t.id))
            .field("balance", &self.balance)
            .field("ledger_entries", &self.ledger.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
