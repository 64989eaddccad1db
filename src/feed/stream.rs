//! Streaming price source over WebSocket.
//!
//! Connects to a trade stream and turns text frames into price quotes.
//! Reconnection policy lives in the feed loop, not here.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Deserialize;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

use super::{PriceQuote, StreamSource};

/// Binance-style trade event: `{"e":"trade","p":"43000.10","T":1700000000000,...}`.
#[derive(Debug, Deserialize)]
struct TradeEvent {
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "T", default)]
    trade_time_ms: Option<i64>,
}

/// Parse one text frame. Frames that are not trade events yield `None`.
pub fn parse_trade_frame(text: &str) -> Option<PriceQuote> {
    let event: TradeEvent = serde_json::from_str(text).ok()?;
    let price: f64 = event.price.trim().parse().ok()?;
    if !price.is_finite() || price <= 0.0 {
        return None;
    }
    let timestamp = event
        .trade_time_ms
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_else(Utc::now);
    Some(PriceQuote { price, timestamp })
}

pub struct WsTradeStream {
    url: String,
}

impl WsTradeStream {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl StreamSource for WsTradeStream {
    async fn connect(&self) -> Result<BoxStream<'static, Result<PriceQuote>>> {
        let (ws, resp) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .with_context(|| format!("WebSocket connect failed: {}", self.url))?;
        info!(url = %self.url, status = %resp.status(), "Price stream connected");

        let quotes = ws
            .take_while(|msg| {
                let open = !matches!(msg, Ok(Message::Close(_)));
                if !open {
                    debug!("Price stream closed by server");
                }
                futures::future::ready(open)
            })
            .filter_map(|msg| async move {
                match msg {
                    Ok(Message::Text(text)) => parse_trade_frame(&text).map(Ok),
                    Ok(_) => None,
                    Err(e) => Some(Err(anyhow::anyhow!("Price stream read error: {e}"))),
                }
            });

        Ok(quotes.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_trade_frame() {
        let q = parse_trade_frame(
            r#"{"e":"trade","E":1700000000001,"s":"BTCUSDT","t":1,"p":"43000.10","q":"0.01","T":1700000000000}"#,
        )
        .unwrap();
        assert!((q.price - 43000.10).abs() < 1e-9);
        assert_eq!(q.timestamp.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_parse_trade_frame_without_time() {
        let q = parse_trade_frame(r#"{"p":"1.5"}"#).unwrap();
        assert_eq!(q.price, 1.5);
    }

    #[test]
    fn test_parse_non_trade_frames() {
        assert!(parse_trade_frame(r#"{"result":null,"id":1}"#).is_none());
        assert!(parse_trade_frame("not json").is_none());
        assert!(parse_trade_frame(r#"{"p":"0"}"#).is_none());
    }
}
