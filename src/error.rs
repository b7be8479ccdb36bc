use thiserror::Error as ThisError;

use crate::types::ContractType;

/// Recoverable errors raised by the aggregation and settlement pipeline.
///
/// None of these are fatal to the session; callers log or surface them and
/// keep going.
#[derive(ThisError, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Invalid tick: {0}")]
    InvalidTick(String),

    #[error("Trade {active_id} is still pending")]
    TradeAlreadyActive { active_id: String },

    #[error("Contract type {0} has no settlement rule")]
    UnsupportedContractType(ContractType),

    #[error("Invalid trade: {0}")]
    InvalidTrade(String),

    #[error("Invalid balance: {0}")]
    InvalidBalance(f64),

    #[error("No market data received yet")]
    NoMarketData,

    #[error("Session is not running")]
    SessionClosed,
}
