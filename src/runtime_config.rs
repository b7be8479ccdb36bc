// =============================================================================
// Runtime Configuration: demo desk settings with atomic save
// =============================================================================
//
// Every tunable constant of the session lives here: candle granularity and
// retention, payout ratio, stake floor, barrier distance, active-trade policy
// and the feed/listener endpoints.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
//
// =============================================================================

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::ActiveTradePolicy;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbol() -> String {
    "R_100".to_string()
}

fn default_app_id() -> String {
    "1089".to_string()
}

fn default_feed_url() -> String {
    "wss://ws.binaryws.com/websockets/v3".to_string()
}

fn default_granularity_secs() -> i64 {
    60
}

fn default_candle_capacity() -> usize {
    150
}

fn default_payout_ratio() -> f64 {
    0.95
}

fn default_starting_balance() -> f64 {
    1000.0
}

fn default_min_stake() -> f64 {
    0.35
}

fn default_barrier_offset() -> f64 {
    0.0015
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level configuration for the demo desk.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Feed ----------------------------------------------------------------

    /// Instrument streamed from the feed (e.g. `R_100`).
    #[serde(default = "default_symbol")]
    pub symbol: String,

    /// Application id appended to the feed URL.
    #[serde(default = "default_app_id")]
    pub app_id: String,

    /// Optional token sent in an `authorize` request. Never written to disk.
    #[serde(default, skip_serializing)]
    pub api_token: Option<String>,

    #[serde(default = "default_feed_url")]
    pub feed_url: String,

    /// Seconds to wait before reconnecting after the feed drops.
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,

    // --- Candles -------------------------------------------------------------

    /// Width of one candle bucket in seconds.
    #[serde(default = "default_granularity_secs")]
    pub granularity_secs: i64,

    /// Maximum number of retained candles.
    #[serde(default = "default_candle_capacity")]
    pub candle_capacity: usize,

    // --- Settlement ----------------------------------------------------------

    /// Profit on a winning trade as a fraction of stake.
    #[serde(default = "default_payout_ratio")]
    pub payout_ratio: f64,

    #[serde(default = "default_starting_balance")]
    pub starting_balance: f64,

    #[serde(default = "default_min_stake")]
    pub min_stake: f64,

    /// Relative distance of touch targets and Higher/Lower strikes from entry.
    #[serde(default = "default_barrier_offset")]
    pub barrier_offset: f64,

    /// What happens when a trade is placed while another is pending.
    #[serde(default)]
    pub active_trade_policy: ActiveTradePolicy,

    /// Seed for the touch-side draw. Entropy-seeded when absent.
    #[serde(default)]
    pub rng_seed: Option<u64>,

    // --- Session & API -------------------------------------------------------

    /// Capacity of the tick/command queue feeding the session.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            app_id: default_app_id(),
            api_token: None,
            feed_url: default_feed_url(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            granularity_secs: default_granularity_secs(),
            candle_capacity: default_candle_capacity(),
            payout_ratio: default_payout_ratio(),
            starting_balance: default_starting_balance(),
            min_stake: default_min_stake(),
            barrier_offset: default_barrier_offset(),
            active_trade_policy: ActiveTradePolicy::Reject,
            rng_seed: None,
            queue_capacity: default_queue_capacity(),
            bind_addr: default_bind_addr(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbol = %config.symbol,
            granularity_secs = config.granularity_secs,
            policy = %config.active_trade_policy,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Apply `DEMO_DESK_*` / `DERIV_*` environment overrides.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(symbol) = non_empty("DEMO_DESK_SYMBOL") {
            self.symbol = symbol.to_uppercase();
        }
        if let Some(app_id) = non_empty("DERIV_APP_ID") {
            self.app_id = app_id;
        }
        if let Some(token) = non_empty("DERIV_API_TOKEN") {
            self.api_token = Some(token);
        }
        if let Some(addr) = non_empty("DEMO_DESK_BIND_ADDR") {
            self.bind_addr = addr;
        }
    }

    /// Reject settings the session cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.symbol.trim().is_empty() {
            bail!("symbol must not be empty");
        }
        if self.granularity_secs <= 0 {
            bail!("granularity_secs must be positive, got {}", self.granularity_secs);
        }
        if self.candle_capacity == 0 {
            bail!("candle_capacity must be positive");
        }
        if self.queue_capacity == 0 {
            bail!("queue_capacity must be positive");
        }
        if !(self.payout_ratio > 0.0 && self.payout_ratio <= 10.0) {
            bail!("payout_ratio must be in (0, 10], got {}", self.payout_ratio);
        }
        if !self.starting_balance.is_finite() || self.starting_balance < 0.0 {
            bail!("starting_balance must be non-negative, got {}", self.starting_balance);
        }
        if !self.min_stake.is_finite() || self.min_stake < 0.0 {
            bail!("min_stake must be non-negative, got {}", self.min_stake);
        }
        if !(0.0..1.0).contains(&self.barrier_offset) {
            bail!("barrier_offset must be in [0, 1), got {}", self.barrier_offset);
        }
        Ok(())
    }

    /// Feed URL with the application id attached.
    pub fn feed_endpoint(&self) -> String {
        let sep = if self.feed_url.contains('?') { '&' } else { '?' };
        format!("{}{}app_id={}", self.feed_url, sep, self.app_id)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.symbol, "R_100");
        assert_eq!(cfg.granularity_secs, 60);
        assert_eq!(cfg.candle_capacity, 150);
        assert_eq!(cfg.active_trade_policy, ActiveTradePolicy::Reject);
        assert!((cfg.payout_ratio - 0.95).abs() < f64::EPSILON);
        assert!((cfg.min_stake - 0.35).abs() < f64::EPSILON);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.symbol, "R_100");
        assert_eq!(cfg.queue_capacity, 1024);
        assert_eq!(cfg.rng_seed, None);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "active_trade_policy": "Replace", "candle_capacity": 300 }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.active_trade_policy, ActiveTradePolicy::Replace);
        assert_eq!(cfg.candle_capacity, 300);
        assert_eq!(cfg.granularity_secs, 60);
    }

    #[test]
    fn api_token_is_never_serialised() {
        let mut cfg = RuntimeConfig::default();
        cfg.api_token = Some("secret".into());
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(!json.contains("secret"));
        assert!(!json.contains("api_token"));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut cfg = RuntimeConfig::default();
        cfg.granularity_secs = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = RuntimeConfig::default();
        cfg.payout_ratio = f64::NAN;
        assert!(cfg.validate().is_err());

        let mut cfg = RuntimeConfig::default();
        cfg.barrier_offset = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = RuntimeConfig::default();
        cfg.candle_capacity = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn env_overrides_apply_non_empty_values() {
        let mut cfg = RuntimeConfig::default();
        cfg.apply_overrides(|key| match key {
            "DEMO_DESK_SYMBOL" => Some(" r_50 ".into()),
            "DERIV_API_TOKEN" => Some("tok".into()),
            "DERIV_APP_ID" => Some("   ".into()),
            _ => None,
        });
        assert_eq!(cfg.symbol, "R_50");
        assert_eq!(cfg.api_token.as_deref(), Some("tok"));
        assert_eq!(cfg.app_id, "1089");
    }

    #[test]
    fn feed_endpoint_appends_app_id() {
        let cfg = RuntimeConfig::default();
        assert_eq!(
            cfg.feed_endpoint(),
            "wss://ws.binaryws.com/websockets/v3?app_id=1089"
        );
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = std::env::temp_dir().join(format!("demo-desk-cfg-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("runtime_config.json");

        let mut cfg = RuntimeConfig::default();
        cfg.candle_capacity = 250;
        cfg.save(&path).unwrap();

        let loaded = RuntimeConfig::load(&path).unwrap();
        assert_eq!(loaded.candle_capacity, 250);
        assert!(!path.with_extension("json.tmp").exists());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
