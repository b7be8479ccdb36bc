pub mod candle_buffer;
pub mod tick_stream;

pub use candle_buffer::{Candle, CandleAggregator, CandleUpdate, CandleUpdateKind};
