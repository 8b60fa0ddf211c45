//! Websocket feed ingress.
//!
//! Connects to the exchange feed, subscribes to the market, orderbook, trade
//! and account channels, and forwards every channel message into the job
//! queue untouched. Parsing beyond the envelope happens in the worker.

use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};

use crate::queue::JobQueue;

pub const MARKETS_CHANNEL: &str = "v3_markets";
pub const ORDERBOOK_CHANNEL: &str = "v3_orderbook";
pub const TRADES_CHANNEL: &str = "v3_trades";
pub const ACCOUNTS_CHANNEL: &str = "v3_accounts";

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Subscribed,
    ChannelData,
    #[serde(other)]
    Other,
}

/// Envelope shared by every feed message. `contents` stays raw JSON until the
/// per-channel handler parses it.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub contents: serde_json::Value,
}

pub struct FeedIngress {
    ws_endpoint: String,
    markets: Vec<String>,
    account_subscription: serde_json::Value,
    queue: JobQueue<FeedMessage>,
}

impl FeedIngress {
    pub fn new(
        ws_endpoint: String,
        markets: Vec<String>,
        account_subscription: serde_json::Value,
        queue: JobQueue<FeedMessage>,
    ) -> Self {
        Self {
            ws_endpoint,
            markets,
            account_subscription,
            queue,
        }
    }

    /// Runs forever, reconnecting with capped exponential backoff. The
    /// backoff resets whenever a connection is established, so a healthy
    /// session that later drops with a read error still reconnects fast.
    pub async fn run(self) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match connect_async(&self.ws_endpoint).await {
                Ok((stream, _)) => {
                    log::info!("[FEED] connected to {}", self.ws_endpoint);
                    backoff = INITIAL_BACKOFF;
                    match self.stream_messages(stream).await {
                        Ok(()) => log::warn!("[FEED] connection closed; reconnecting"),
                        Err(err) => log::error!("[FEED] connection error: {:#}", err),
                    }
                }
                Err(err) => {
                    log::error!(
                        "[FEED] failed to connect to {}: {:#}",
                        self.ws_endpoint,
                        err
                    );
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = next_backoff(backoff);
        }
    }

    async fn stream_messages(
        &self,
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    ) -> Result<()> {
        let (mut sink, mut stream) = stream.split();

        sink.send(Message::Text(
            json!({ "type": "subscribe", "channel": MARKETS_CHANNEL }).to_string(),
        ))
        .await
        .context("markets subscription failed")?;
        sink.send(Message::Text(self.account_subscription.to_string()))
            .await
            .context("accounts subscription failed")?;
        for market in &self.markets {
            sink.send(Message::Text(
                json!({
                    "type": "subscribe",
                    "channel": ORDERBOOK_CHANNEL,
                    "id": market,
                    "includeOffsets": true,
                })
                .to_string(),
            ))
            .await
            .with_context(|| format!("orderbook subscription failed for {}", market))?;
            sink.send(Message::Text(
                json!({
                    "type": "subscribe",
                    "channel": TRADES_CHANNEL,
                    "id": market,
                })
                .to_string(),
            ))
            .await
            .with_context(|| format!("trades subscription failed for {}", market))?;
        }

        while let Some(frame) = stream.next().await {
            match frame.context("websocket read failed")? {
                Message::Text(raw) => self.dispatch(&raw),
                Message::Close(_) => return Ok(()),
                _ => {}
            }
        }
        Ok(())
    }

    /// Parses the envelope and enqueues channel messages. Malformed frames
    /// are logged and dropped; they never tear down the connection.
    fn dispatch(&self, raw: &str) {
        match serde_json::from_str::<FeedMessage>(raw) {
            Ok(message) if !message.channel.is_empty() => {
                let channel = message.channel.clone();
                if let Err(err) = self.queue.enqueue(channel, message) {
                    log::error!("[FEED] failed to enqueue message: {}", err);
                }
            }
            Ok(_) => {}
            Err(err) => {
                log::warn!("[FEED] dropping malformed message: {}", err);
            }
        }
    }
}
