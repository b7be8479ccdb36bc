use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SessionError;
use crate::types::Tick;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// An OHLC summary of every tick that fell into one fixed-width bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Bucket start in unix seconds (epoch floored to the granularity).
    pub bucket_start: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl Candle {
    fn from_quote(bucket_start: i64, quote: f64) -> Self {
        Self {
            bucket_start,
            open: quote,
            high: quote,
            low: quote,
            close: quote,
        }
    }

    fn absorb(&mut self, quote: f64) {
        self.high = self.high.max(quote);
        self.low = self.low.min(quote);
        self.close = quote;
    }
}

/// Whether a tick opened a fresh candle or extended the live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandleUpdateKind {
    Opened,
    Updated,
}

/// Outcome of a single [`CandleAggregator::ingest`] call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CandleUpdate {
    pub kind: CandleUpdateKind,
    /// The live candle after the tick was applied.
    pub candle: Candle,
    /// Number of old candles dropped to stay within capacity.
    pub evicted: usize,
}

// ---------------------------------------------------------------------------
// CandleAggregator -- bounded ring of candles at a fixed granularity
// ---------------------------------------------------------------------------

/// Ring buffer that folds ticks into candles and keeps at most `capacity`
/// of them, oldest-first.
///
/// Only the last candle is ever mutated. Ticks must arrive in non-decreasing
/// epoch order; a tick whose bucket is older than the live candle is folded
/// into the live candle rather than rewriting history.
#[derive(Debug, Clone)]
pub struct CandleAggregator {
    candles: VecDeque<Candle>,
    granularity_secs: i64,
    capacity: usize,
}

impl CandleAggregator {
    /// Create an aggregator. A zero granularity or capacity is raised to 1.
    pub fn new(granularity_secs: i64, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            candles: VecDeque::with_capacity(capacity + 1),
            granularity_secs: granularity_secs.max(1),
            capacity,
        }
    }

    pub fn granularity_secs(&self) -> i64 {
        self.granularity_secs
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bucket start for `epoch`, floored to the granularity.
    pub fn bucket_of(&self, epoch: i64) -> i64 {
        epoch - epoch.rem_euclid(self.granularity_secs)
    }

    /// Apply one tick.
    ///
    /// * Empty ring, or the tick's bucket is newer than the live candle: a new
    ///   candle is appended with `open = high = low = close = quote`.
    /// * Otherwise the live candle's high/low/close are updated in place.
    ///
    /// The oldest candles are then dropped until the ring fits `capacity`.
    /// An invalid quote leaves the ring untouched.
    pub fn ingest(&mut self, tick: &Tick) -> Result<CandleUpdate, SessionError> {
        tick.validate()?;

        let bucket = self.bucket_of(tick.epoch);

        let extends_live =
            matches!(self.candles.back(), Some(last) if bucket <= last.bucket_start);

        let (kind, candle) = if extends_live {
            let last = self
                .candles
                .back_mut()
                .ok_or_else(|| SessionError::InvalidTick("candle ring emptied".into()))?;
            last.absorb(tick.quote);
            (CandleUpdateKind::Updated, *last)
        } else {
            let fresh = Candle::from_quote(bucket, tick.quote);
            self.candles.push_back(fresh);
            (CandleUpdateKind::Opened, fresh)
        };

        let mut evicted = 0;
        while self.candles.len() > self.capacity {
            self.candles.pop_front();
            evicted += 1;
        }

        if kind == CandleUpdateKind::Opened {
            debug!(
                bucket = candle.bucket_start,
                open = candle.open,
                evicted,
                "candle opened"
            );
        }

        Ok(CandleUpdate {
            kind,
            candle,
            evicted,
        })
    }

    /// All retained candles, oldest first.
    pub fn candles(&self) -> Vec<Candle> {
        self.candles.iter().copied().collect()
    }

    /// The live (most recent) candle.
    pub fn last(&self) -> Option<&Candle> {
        self.candles.back()
    }

    pub fn last_close(&self) -> Option<f64> {
        self.candles.back().map(|c| c.close)
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
