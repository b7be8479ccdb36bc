// =============================================================================
// Session: single consumer that owns candles, trades, balance and ledger
// =============================================================================
//
// Producers (feed listener, API handlers) never touch session state. They
// push `SessionEvent`s onto one bounded mpsc queue; a single Tokio task drains
// it in FIFO order and is the only code that mutates the aggregator or the
// settlement engine. After every change it publishes an immutable
// `SessionSnapshot` for readers.
//
// Stopping: when every sender is dropped the task returns its `Session`.
// A trade still pending at that point stays pending.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::market_data::{Candle, CandleAggregator};
use crate::runtime_config::RuntimeConfig;
use crate::settlement::{
    DemoTrade, LedgerEntry, LedgerStats, SettlementConfig, SettlementEngine, SettlementResult,
    TradeRequest,
};
use crate::types::{BarrierSide, ContractType, ExpiryCondition, Tick};

// =============================================================================
// Events
// =============================================================================

/// A trade placement as the presentation layer sends it.
///
/// Entry price and time default to the most recent tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenTradeCommand {
    /// Variant name or form label, e.g. `"Rise"` or `"No Touch"`.
    pub contract_type: String,
    pub stake: f64,
    #[serde(default)]
    pub expiry: ExpiryCondition,
    #[serde(default)]
    pub touch_side: Option<BarrierSide>,
    #[serde(default)]
    pub entry_price: Option<f64>,
    #[serde(default)]
    pub entry_time: Option<i64>,
}

/// Everything the session task reacts to, in arrival order.
#[derive(Debug)]
pub enum SessionEvent {
    Tick(Tick),
    OpenTrade {
        command: OpenTradeCommand,
        reply: oneshot::Sender<Result<DemoTrade, SessionError>>,
    },
    ResetBalance {
        balance: f64,
        reply: oneshot::Sender<Result<f64, SessionError>>,
    },
}

// =============================================================================
// Snapshot
// =============================================================================

/// Read-only view of the session published after every change.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionSnapshot {
    pub version: u64,
    pub symbol: String,
    pub server_time: i64,
    pub last_tick: Option<Tick>,
    pub candles: Vec<Candle>,
    pub active_trade: Option<DemoTrade>,
    pub balance: f64,
    /// Settled trades, oldest first.
    pub ledger: Vec<LedgerEntry>,
    pub stats: LedgerStats,
}

struct Shared {
    version: AtomicU64,
    snapshot: RwLock<SessionSnapshot>,
    started_at: std::time::Instant,
}

// =============================================================================
// Session (consumer side)
// =============================================================================

pub struct Session {
    symbol: String,
    aggregator: CandleAggregator,
    settlement: SettlementEngine,
    last_tick: Option<Tick>,
    shared: Arc<Shared>,
}

impl Session {
    /// Build a session plus the handle and queue that feed it.
    pub fn new(config: &RuntimeConfig) -> (Self, SessionHandle, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let shared = Arc::new(Shared {
            version: AtomicU64::new(0),
            snapshot: RwLock::new(SessionSnapshot::default()),
            started_at: std::time::Instant::now(),
        });

        let mut session = Self {
            symbol: config.symbol.clone(),
            aggregator: CandleAggregator::new(config.granularity_secs, config.candle_capacity),
            settlement: SettlementEngine::new(SettlementConfig::from(config)),
            last_tick: None,
            shared: shared.clone(),
        };
        session.publish();

        let handle = SessionHandle { events: tx, shared };
        (session, handle, rx)
    }

    /// Create a session and spawn its consumer task.
    pub fn start(config: &RuntimeConfig) -> (SessionHandle, JoinHandle<Session>) {
        let (session, handle, rx) = Self::new(config);
        let task = tokio::spawn(session.run(rx));
        (handle, task)
    }

    /// Drain `events` until every sender is gone, then hand the session back.
    pub async fn run(mut self, mut events: mpsc::Receiver<SessionEvent>) -> Self {
        info!(symbol = %self.symbol, "session started");

        while let Some(event) = events.recv().await {
            self.handle(event);
        }

        match self.settlement.active_trade() {
            Some(trade) => info!(
                symbol = %self.symbol,
                pending_trade = %trade.id,
                "session stopped; pending trade left unsettled"
            ),
            None => info!(symbol = %self.symbol, "session stopped"),
        }
        self
    }

    /// Apply one event and publish the resulting state.
    pub fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Tick(tick) => match self.apply_tick(tick) {
                Ok(_) => self.publish(),
                Err(e) => warn!(error = %e, "tick dropped"),
            },
            SessionEvent::OpenTrade { command, reply } => {
                let result = self.open_trade(command);
                match &result {
                    Ok(_) => self.publish(),
                    Err(e) => warn!(error = %e, "trade not opened"),
                }
                if reply.send(result).is_err() {
                    debug!("open_trade caller went away before the reply");
                }
            }
            SessionEvent::ResetBalance { balance, reply } => {
                let result = self.settlement.reset_balance(balance);
                if result.is_ok() {
                    self.publish();
                }
                if reply.send(result).is_err() {
                    debug!("reset_balance caller went away before the reply");
                }
            }
        }
    }

    /// Feed a tick to the aggregator, then to the active trade.
    ///
    /// An invalid tick is refused before either component changes.
    pub fn apply_tick(&mut self, tick: Tick) -> Result<Option<SettlementResult>, SessionError> {
        self.aggregator.ingest(&tick)?;
        let settled = self.settlement.on_tick(&tick)?;
        self.last_tick = Some(tick);
        Ok(settled)
    }

    /// Resolve a command against the latest market data and open the trade.
    pub fn open_trade(&mut self, command: OpenTradeCommand) -> Result<DemoTrade, SessionError> {
        let contract_type: ContractType = command.contract_type.parse()?;

        let (entry_price, entry_time) = match (command.entry_price, &self.last_tick) {
            (Some(price), last) => {
                let time = command
                    .entry_time
                    .or_else(|| last.as_ref().map(|t| t.epoch))
                    .unwrap_or_else(|| Utc::now().timestamp());
                (price, time)
            }
            (None, Some(last)) => (last.quote, command.entry_time.unwrap_or(last.epoch)),
            (None, None) => return Err(SessionError::NoMarketData),
        };

        self.settlement.open_trade(TradeRequest {
            symbol: self.symbol.clone(),
            contract_type,
            stake: command.stake,
            entry_price,
            entry_time,
            expiry: command.expiry,
            touch_side: command.touch_side,
        })
    }

    pub fn candles(&self) -> Vec<Candle> {
        self.aggregator.candles()
    }

    pub fn settlement(&self) -> &SettlementEngine {
        &self.settlement
    }

    fn publish(&mut self) {
        let version = self.shared.version.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = SessionSnapshot {
            version,
            symbol: self.symbol.clone(),
            server_time: Utc::now().timestamp_millis(),
            last_tick: self.last_tick.clone(),
            candles: self.aggregator.candles(),
            active_trade: self.settlement.active_trade().cloned(),
            balance: self.settlement.balance(),
            ledger: self.settlement.ledger().to_vec(),
            stats: self.settlement.stats(),
        };
        *self.shared.snapshot.write() = snapshot;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("symbol", &self.symbol)
            .field("candles", &self.aggregator.len())
            .field("settlement", &self.settlement)
            .finish()
    }
}

// =============================================================================
// SessionHandle (producer / reader side)
// =============================================================================

/// Cloneable entry point for producers and readers.
#[derive(Clone)]
pub struct SessionHandle {
    events: mpsc::Sender<SessionEvent>,
    shared: Arc<Shared>,
}

impl SessionHandle {
    /// Sender for the feed listener.
    pub fn tick_sender(&self) -> mpsc::Sender<SessionEvent> {
        self.events.clone()
    }

    /// Queue a tick, waiting for room if the queue is full.
    pub async fn submit_tick(&self, tick: Tick) -> Result<(), SessionError> {
        self.events
            .send(SessionEvent::Tick(tick))
            .await
            .map_err(|_| SessionError::SessionClosed)
    }

    /// Place a trade. Resolves once the session has processed every event
    /// queued before it.
    pub async fn open_trade(&self, command: OpenTradeCommand) -> Result<DemoTrade, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(SessionEvent::OpenTrade { command, reply })
            .await
            .map_err(|_| SessionError::SessionClosed)?;
        rx.await.map_err(|_| SessionError::SessionClosed)?
    }

    pub async fn reset_balance(&self, balance: f64) -> Result<f64, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(SessionEvent::ResetBalance { balance, reply })
            .await
            .map_err(|_| SessionError::SessionClosed)?;
        rx.await.map_err(|_| SessionError::SessionClosed)?
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.snapshot.read().clone()
    }

    pub fn version(&self) -> u64 {
        self.shared.version.load(Ordering::SeqCst)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.shared.started_at.elapsed().as_secs()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActiveTradePolicy, TradeResult};

    fn config() -> RuntimeConfig {
        RuntimeConfig {
            rng_seed: Some(1),
            queue_capacity: 8,
            ..RuntimeConfig::default()
        }
    }

    fn tick(epoch: i64, quote: f64) -> Tick {
        Tick::new("R_100", epoch, quote)
    }

    fn rise(ticks: u32) -> OpenTradeCommand {
        OpenTradeCommand {
            contract_type: "Rise".into(),
            stake: 10.0,
            expiry: ExpiryCondition::Ticks(ticks),
            touch_side: None,
            entry_price: None,
            entry_time: None,
        }
    }

    #[test]
    fn ticks_build_candles_and_settle_trades() {
        let (mut session, handle, _rx) = Session::new(&config());

        session.apply_tick(tick(65, 100.0)).unwrap();
        let trade = session.open_trade(rise(2)).unwrap();
        assert_eq!(trade.entry_price, 100.0);
        assert_eq!(trade.entry_time, 65);

        assert!(session.apply_tick(tick(90, 101.0)).unwrap().is_none());
        let settled = session.apply_tick(tick(125, 103.0)).unwrap().unwrap();
        assert_eq!(settled.result, TradeResult::Win);

        assert_eq!(session.candles().len(), 2);
        assert_eq!(session.settlement().ledger().len(), 1);

        // Nothing is published until an event passes through `handle`.
        assert!(handle.snapshot().ledger.is_empty());
    }

    #[test]
    fn handle_publishes_snapshots() {
        let (mut session, handle, _rx) = Session::new(&config());
        let v0 = handle.version();

        session.handle(SessionEvent::Tick(tick(60, 50.0)));
        let snap = handle.snapshot();
        assert!(snap.version > v0);
        assert_eq!(snap.candles.len(), 1);
        assert_eq!(snap.last_tick, Some(tick(60, 50.0)));
        assert_eq!(snap.balance, 1000.0);
    }

    #[test]
    fn invalid_tick_is_dropped_without_publishing() {
        let (mut session, handle, _rx) = Session::new(&config());
        session.handle(SessionEvent::Tick(tick(60, 50.0)));
        let version = handle.version();

        session.handle(SessionEvent::Tick(tick(61, f64::NAN)));
        assert_eq!(handle.version(), version);
        assert_eq!(handle.snapshot().last_tick, Some(tick(60, 50.0)));
    }

    #[test]
    fn trade_without_market_data_fails() {
        let (mut session, _handle, _rx) = Session::new(&config());
        assert_eq!(session.open_trade(rise(1)).unwrap_err(), SessionError::NoMarketData);
    }

    #[test]
    fn explicit_entry_price_needs_no_tick() {
        let (mut session, _handle, _rx) = Session::new(&config());
        let mut cmd = rise(1);
        cmd.entry_price = Some(100.0);
        cmd.entry_time = Some(10);
        let trade = session.open_trade(cmd).unwrap();
        assert_eq!(trade.entry_time, 10);
    }

    #[test]
    fn unknown_and_placeholder_contracts_are_refused() {
        let (mut session, _handle, _rx) = Session::new(&config());
        session.apply_tick(tick(60, 100.0)).unwrap();

        let mut cmd = rise(1);
        cmd.contract_type = "Straddle".into();
        assert!(matches!(session.open_trade(cmd), Err(SessionError::InvalidTrade(_))));

        let mut cmd = rise(1);
        cmd.contract_type = "Digits".into();
        assert_eq!(
            session.open_trade(cmd).unwrap_err(),
            SessionError::UnsupportedContractType(ContractType::Digits)
        );
    }

    #[tokio::test]
    async fn queued_events_are_applied_in_order() {
        let (handle, task) = Session::start(&config());

        for (epoch, quote) in [(60, 100.0), (70, 101.0), (130, 99.0)] {
            handle.submit_tick(tick(epoch, quote)).await.unwrap();
        }
        // The reply arrives only after the three ticks were applied.
        let trade = handle.open_trade(rise(1)).await.unwrap();
        assert_eq!(trade.entry_price, 99.0);

        let snap = handle.snapshot();
        assert_eq!(snap.candles.len(), 2);
        assert_eq!(snap.active_trade.as_ref().map(|t| t.id.clone()), Some(trade.id));

        handle.submit_tick(tick(140, 98.0)).await.unwrap();
        assert_eq!(handle.reset_balance(2000.0).await.unwrap(), 2000.0);

        let snap = handle.snapshot();
        assert!(snap.active_trade.is_none());
        assert_eq!(snap.ledger.len(), 1);
        assert_eq!(snap.ledger[0].result, TradeResult::Loss);
        assert_eq!(snap.balance, 2000.0);

        drop(handle);
        let session = task.await.unwrap();
        assert_eq!(session.settlement().ledger().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_trades_are_serialised_under_reject() {
        let (handle, task) = Session::start(&config());
        handle.submit_tick(tick(60, 100.0)).await.unwrap();

        let (a, b) = tokio::join!(handle.open_trade(rise(5)), handle.open_trade(rise(5)));
        let outcomes = [a.is_ok(), b.is_ok()];
        assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
        let err = a.err().or(b.err()).unwrap();
        assert!(matches!(err, SessionError::TradeAlreadyActive { .. }));

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn replace_policy_swaps_trade_through_the_queue() {
        let cfg = RuntimeConfig {
            active_trade_policy: ActiveTradePolicy::Replace,
            ..config()
        };
        let (handle, task) = Session::start(&cfg);
        handle.submit_tick(tick(60, 100.0)).await.unwrap();

        let first = handle.open_trade(rise(5)).await.unwrap();
        let second = handle.open_trade(rise(5)).await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(handle.snapshot().active_trade.unwrap().id, second.id);

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn stopping_leaves_pending_trade_pending() {
        let (handle, task) = Session::start(&config());
        handle.submit_tick(tick(60, 100.0)).await.unwrap();
        let trade = handle.open_trade(rise(10)).await.unwrap();
        handle.submit_tick(tick(61, 101.0)).await.unwrap();

        drop(handle);
        let session = task.await.unwrap();

        let pending = session.settlement().active_trade().unwrap();
        assert_eq!(pending.id, trade.id);
        assert_eq!(pending.ticks_seen, 1);
        assert!(session.settlement().ledger().is_empty());
        assert_eq!(session.settlement().balance(), 1000.0);
    }

    #[tokio::test]
    async fn commands_fail_once_session_is_gone() {
        let (session, handle, rx) = Session::new(&config());
        drop(rx);
        drop(session);

        assert_eq!(
            handle.submit_tick(tick(1, 1.0)).await.unwrap_err(),
            SessionError::SessionClosed
        );
        assert_eq!(
            handle.open_trade(rise(1)).await.unwrap_err(),
            SessionError::SessionClosed
        );
    }
}
