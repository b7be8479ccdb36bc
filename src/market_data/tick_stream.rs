// =============================================================================
// Tick Stream: Deriv price feed listener
// =============================================================================
//
// connect -> authorize (only when a token is configured) -> subscribe -> read
//
// Every tick is pushed onto the session queue with `send().await`, so a slow
// consumer applies backpressure to the socket instead of growing memory.
// =============================================================================

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::error::SessionError;
use crate::runtime_config::RuntimeConfig;
use crate::session::SessionEvent;
use crate::types::Tick;

/// What a single feed frame turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    Tick(Tick),
    /// The server reported an error for one of our requests.
    Error { code: String, message: String },
    /// Authorize acknowledgements, subscription echoes, pings.
    Other,
}

/// Connect to the feed for `config.symbol` and forward ticks to the session.
///
/// Runs until the stream disconnects or the session goes away (returns
/// `Ok`), or a transport/protocol error occurs (returns `Err`). The caller
/// (main.rs) handles reconnection.
pub async fn run_tick_stream(
    config: &RuntimeConfig,
    events: &mpsc::Sender<SessionEvent>,
) -> Result<()> {
    let url = config.feed_endpoint();
    let symbol = config.symbol.as_str();
    info!(url = %url, symbol = %symbol, "connecting to tick WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to tick WebSocket")?;

    info!(symbol = %symbol, "tick WebSocket connected");
    let (mut write, mut read) = ws_stream.split();

    if let Some(token) = config.api_token.as_deref() {
        let auth = serde_json::json!({ "authorize": token });
        write
            .send(Message::Text(auth.to_string()))
            .await
            .context("failed to send authorize request")?;

        // The first reply tells us whether the token was accepted.
        match read.next().await {
            Some(Ok(Message::Text(text))) => {
                if let FeedMessage::Error { code, message } = parse_feed_message(&text)? {
                    bail!("authorize rejected: {code}: {message}");
                }
                info!("feed authorized");
            }
            Some(Ok(other)) => {
                warn!(frame = ?other, "unexpected frame in reply to authorize");
            }
            Some(Err(e)) => return Err(e).context("tick WebSocket error during authorize"),
            None => bail!("tick WebSocket closed during authorize"),
        }
    }

    let subscribe = serde_json::json!({ "ticks": symbol, "subscribe": 1 });
    write
        .send(Message::Text(subscribe.to_string()))
        .await
        .context("failed to send ticks subscription")?;
    info!(symbol = %symbol, "subscribed to ticks");

    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match parse_feed_message(&text) {
                Ok(FeedMessage::Tick(tick)) => {
                    debug!(epoch = tick.epoch, quote = tick.quote, "tick");
                    if events.send(SessionEvent::Tick(tick)).await.is_err() {
                        info!(symbol = %symbol, "session stopped — closing tick stream");
                        return Ok(());
                    }
                }
                Ok(FeedMessage::Error { code, message }) => {
                    error!(code = %code, message = %message, "feed returned an error");
                    bail!("feed error {code}: {message}");
                }
                Ok(FeedMessage::Other) => {}
                Err(e) => {
                    warn!(error = %e, "failed to parse feed message");
                }
            },
            // tungstenite answers pings itself; binary frames are not used.
            Some(Ok(Message::Close(frame))) => {
                warn!(symbol = %symbol, frame = ?frame, "tick WebSocket closed by server");
                return Ok(());
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!(symbol = %symbol, error = %e, "tick WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol = %symbol, "tick WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

/// Classify one text frame from the feed.
///
/// Expected tick shape:
/// ```json
/// { "msg_type": "tick", "tick": { "symbol": "R_100", "epoch": 1700000000, "quote": 1234.56 } }
/// ```
pub fn parse_feed_message(text: &str) -> Result<FeedMessage, SessionError> {
    let root: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| SessionError::InvalidTick(format!("malformed JSON: {e}")))?;

    if let Some(err) = root.get("error") {
        let code = err["code"].as_str().unwrap_or("Unknown").to_string();
        let message = err["message"].as_str().unwrap_or_default().to_string();
        return Ok(FeedMessage::Error { code, message });
    }

    match root.get("tick") {
        Some(tick) => parse_tick(tick).map(FeedMessage::Tick),
        None => Ok(FeedMessage::Other),
    }
}

fn parse_tick(tick: &serde_json::Value) -> Result<Tick, SessionError> {
    let epoch = match &tick["epoch"] {
        serde_json::Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| SessionError::InvalidTick(format!("epoch {n} is not an integer"))),
        serde_json::Value::String(s) => s
            .parse::<i64>()
            .map_err(|_| SessionError::InvalidTick(format!("epoch '{s}' is not an integer"))),
        serde_json::Value::Null => Err(SessionError::InvalidTick("missing field tick.epoch".into())),
        other => Err(SessionError::InvalidTick(format!("epoch has unexpected type: {other}"))),
    }?;

    let quote = parse_number(&tick["quote"], "tick.quote")?;
    let symbol = tick["symbol"].as_str().unwrap_or_default().to_string();

    let tick = Tick {
        symbol,
        epoch,
        quote,
    };
    tick.validate()?;
    Ok(tick)
}

/// The feed sends prices as JSON numbers; older endpoints use strings.
fn parse_number(val: &serde_json::Value, name: &str) -> Result<f64, SessionError> {
    match val {
        serde_json::Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| SessionError::InvalidTick(format!("field {name} is not a valid f64"))),
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .map_err(|_| SessionError::InvalidTick(format!("failed to parse {name} as f64: {s}"))),
        serde_json::Value::Null => Err(SessionError::InvalidTick(format!("missing field {name}"))),
        _ => Err(SessionError::InvalidTick(format!(
            "field {name} has unexpected JSON type"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tick_message_ok() {
        let json = r#"{
            "echo_req": { "ticks": "R_100", "subscribe": 1 },
            "msg_type": "tick",
            "subscription": { "id": "abc" },
            "tick": {
                "ask": 1234.58,
                "bid": 1234.54,
                "epoch": 1700000065,
                "id": "abc",
                "pip_size": 2,
                "quote": 1234.56,
                "symbol": "R_100"
            }
        }"#;
        let msg = parse_feed_message(json).expect("should parse");
        assert_eq!(
            msg,
            FeedMessage::Tick(Tick::new("R_100", 1_700_000_065, 1234.56))
        );
    }

    #[test]
    fn string_quote_is_accepted() {
        let json = r#"{ "tick": { "epoch": "90", "quote": "10.5" } }"#;
        let msg = parse_feed_message(json).unwrap();
        assert_eq!(msg, FeedMessage::Tick(Tick::new("", 90, 10.5)));
    }

    #[test]
    fn missing_epoch_is_invalid_tick() {
        let err = parse_feed_message(r#"{ "tick": { "quote": 10.0 } }"#).unwrap_err();
        assert!(matches!(err, SessionError::InvalidTick(m) if m.contains("epoch")));
    }

    #[test]
    fn non_numeric_quote_is_invalid_tick() {
        let err = parse_feed_message(r#"{ "tick": { "epoch": 1, "quote": "abc" } }"#).unwrap_err();
        assert!(matches!(err, SessionError::InvalidTick(_)));

        let err = parse_feed_message(r#"{ "tick": { "epoch": 1, "quote": true } }"#).unwrap_err();
        assert!(matches!(err, SessionError::InvalidTick(_)));
    }

    #[test]
    fn error_frames_are_surfaced() {
        let json = r#"{ "error": { "code": "InvalidToken", "message": "The token is invalid." }, "msg_type": "authorize" }"#;
        assert_eq!(
            parse_feed_message(json).unwrap(),
            FeedMessage::Error {
                code: "InvalidToken".into(),
                message: "The token is invalid.".into(),
            }
        );
    }

    #[test]
    fn other_frames_are_ignored() {
        let json = r#"{ "msg_type": "authorize", "authorize": { "loginid": "VRTC1" } }"#;
        assert_eq!(parse_feed_message(json).unwrap(), FeedMessage::Other);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_feed_message("not json").is_err());
    }
}
