//! Replica worker: consumes feed jobs and applies them to the store.
//!
//! Handlers are idempotent so a retried or duplicated job converges to the
//! same replica state. A returned error fails the job and lets the queue
//! retry it; unknown markets and malformed payload entries are logged and
//! skipped instead, since retrying cannot fix them.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::feed::{
    FeedMessage, MessageKind, ACCOUNTS_CHANNEL, MARKETS_CHANNEL, ORDERBOOK_CHANNEL, TRADES_CHANNEL,
};
use crate::queue::{Job, JobHandler};
use crate::replica::{
    ActiveOrderRow, BookSide, MarketRow, PositionSide, ReplicaStore, TradeRow, TRADES_MAX_SIZE,
};

const TERMINAL_ORDER_STATUSES: [&str; 2] = ["CANCELED", "FILLED"];
const CLOSED_POSITION_STATUS: &str = "CLOSED";

pub struct FeedWorker {
    store: Arc<ReplicaStore>,
}

#[async_trait]
impl JobHandler<FeedMessage> for FeedWorker {
    async fn handle(&self, job: &Job<FeedMessage>) -> Result<()> {
        match job.channel.as_str() {
            MARKETS_CHANNEL => self.handle_markets(&job.payload).await,
            ORDERBOOK_CHANNEL => self.handle_orderbook(&job.payload).await,
            TRADES_CHANNEL => self.handle_trades(&job.payload).await,
            ACCOUNTS_CHANNEL => self.handle_accounts(&job.payload).await,
            other => {
                log::debug!("[REPLICA] ignoring message on unknown channel {}", other);
                Ok(())
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarketEntry {
    #[serde(default)]
    index_price: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BookSnapshotEntry {
    price: String,
    size: String,
    offset: String,
}

#[derive(Debug, Default, Deserialize)]
struct BookSnapshot {
    #[serde(default)]
    bids: Vec<BookSnapshotEntry>,
    #[serde(default)]
    asks: Vec<BookSnapshotEntry>,
}

#[derive(Debug, Deserialize)]
struct BookDelta {
    offset: String,
    #[serde(default)]
    bids: Vec<[String; 2]>,
    #[serde(default)]
    asks: Vec<[String; 2]>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TradeEntry {
    side: String,
    size: String,
    price: String,
    created_at: String,
}

#[derive(Debug, Default, Deserialize)]
struct TradesContents {
    #[serde(default)]
    trades: Vec<TradeEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountContents {
    #[serde(default)]
    quote_balance: Option<String>,
    #[serde(default)]
    open_positions: HashMap<String, PositionEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionEntry {
    #[serde(default)]
    market: Option<String>,
    side: String,
    size: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderEntry {
    id: String,
    market: String,
    side: String,
    #[serde(rename = "type")]
    kind: String,
    status: String,
    price: String,
    size: String,
    remaining_size: String,
}

#[derive(Debug, Deserialize)]
struct AccountSnapshotContents {
    account: AccountContents,
    #[serde(default)]
    orders: Vec<OrderEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct AccountDeltaContents {
    #[serde(default)]
    accounts: Vec<AccountContents>,
    #[serde(default)]
    orders: Vec<OrderEntry>,
    #[serde(default)]
    positions: Vec<PositionEntry>,
}

fn parse_f64(field: &str, raw: &str) -> Option<f64> {
    match raw.parse::<f64>() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("[REPLICA] skipping unparsable {} value {:?}", field, raw);
            None
        }
    }
}

impl FeedWorker {
    pub fn new(store: Arc<ReplicaStore>) -> Self {
        Self { store }
    }

    /// Resolves the market a book/trade message belongs to. Feeds for markets
    /// outside the replica are ignored rather than failed.
    async fn market_for(&self, message: &FeedMessage) -> Result<Option<MarketRow>> {
        let name = message.id.as_deref().unwrap_or_default();
        let market = self.store.market_by_name(name).await?;
        if market.is_none() {
            log::debug!("[REPLICA] ignoring message for unknown market {}", name);
        }
        Ok(market)
    }

    // --- markets channel ---

    async fn handle_markets(&self, message: &FeedMessage) -> Result<()> {
        let value = match message.kind {
            // the snapshot nests the map under "markets"; deltas are the map
            MessageKind::Subscribed => message
                .contents
                .get("markets")
                .cloned()
                .unwrap_or_default(),
            MessageKind::ChannelData => message.contents.clone(),
            MessageKind::Other => return Ok(()),
        };
        let entries: HashMap<String, MarketEntry> =
            serde_json::from_value(value).context("malformed markets contents")?;

        for (name, entry) in entries {
            let Some(raw) = entry.index_price.as_deref().filter(|p| !p.is_empty()) else {
                continue;
            };
            let Some(price) = parse_f64("indexPrice", raw) else {
                continue;
            };
            match message.kind {
                MessageKind::Subscribed => {
                    self.store
                        .upsert_market(&name, entry.status.as_deref(), price)
                        .await?;
                }
                MessageKind::ChannelData => {
                    // price updates never create markets
                    if !self.store.set_index_price(&name, price).await? {
                        log::debug!("[REPLICA] price update for unknown market {}", name);
                    }
                }
                MessageKind::Other => {}
            }
        }
        Ok(())
    }

    // --- orderbook channel ---

    async fn handle_orderbook(&self, message: &FeedMessage) -> Result<()> {
        let Some(market) = self.market_for(message).await? else {
            return Ok(());
        };
        match message.kind {
            MessageKind::Subscribed => self.apply_book_snapshot(&market, message).await,
            MessageKind::ChannelData => self.apply_book_delta(&market, message).await,
            MessageKind::Other => Ok(()),
        }
    }

    async fn apply_book_snapshot(&self, market: &MarketRow, message: &FeedMessage) -> Result<()> {
        let snapshot: BookSnapshot = serde_json::from_value(message.contents.clone())
            .context("malformed orderbook snapshot")?;
        self.store.clear_book(market.id).await?;
        let sides = [
            (BookSide::Bid, snapshot.bids),
            (BookSide::Ask, snapshot.asks),
        ];
        for (side, entries) in sides {
            for entry in entries {
                let (Some(price), Some(size), Some(offset)) = (
                    parse_f64("price", &entry.price),
                    parse_f64("size", &entry.size),
                    entry.offset.parse::<i64>().ok(),
                ) else {
                    log::warn!(
                        "[REPLICA] skipping malformed snapshot level for {}",
                        market.name
                    );
                    continue;
                };
                if size > 0.0 {
                    self.store
                        .apply_level(market.id, side, price, size, offset)
                        .await?;
                }
            }
        }
        log::debug!("[REPLICA] rebuilt order book for {}", market.name);
        Ok(())
    }

    async fn apply_book_delta(&self, market: &MarketRow, message: &FeedMessage) -> Result<()> {
        let delta: BookDelta = serde_json::from_value(message.contents.clone())
            .context("malformed orderbook delta")?;
        let offset: i64 = delta
            .offset
            .parse()
            .with_context(|| format!("bad orderbook offset {:?}", delta.offset))?;
        let sides = [(BookSide::Bid, delta.bids), (BookSide::Ask, delta.asks)];
        for (side, entries) in sides {
            for [raw_price, raw_size] in entries {
                let (Some(price), Some(size)) =
                    (parse_f64("price", &raw_price), parse_f64("size", &raw_size))
                else {
                    continue;
                };
                self.store
                    .apply_level(market.id, side, price, size, offset)
                    .await?;
            }
        }
        Ok(())
    }

    // --- trades channel ---

    async fn handle_trades(&self, message: &FeedMessage) -> Result<()> {
        let Some(market) = self.market_for(message).await? else {
            return Ok(());
        };
        let contents: TradesContents = serde_json::from_value(message.contents.clone())
            .context("malformed trades contents")?;
        let mut rows = Vec::with_capacity(contents.trades.len());
        for entry in contents.trades {
            let (Some(size), Some(price)) = (
                parse_f64("size", &entry.size),
                parse_f64("price", &entry.price),
            ) else {
                continue;
            };
            rows.push(TradeRow {
                side: entry.side,
                size,
                price,
                created_at: entry.created_at,
            });
        }
        match message.kind {
            MessageKind::Subscribed => {
                self.store.clear_trades(market.id).await?;
                rows.truncate(TRADES_MAX_SIZE);
                self.store.insert_trades(market.id, &rows).await?;
            }
            MessageKind::ChannelData => {
                self.store.insert_trades(market.id, &rows).await?;
                self.store.prune_trades(market.id, TRADES_MAX_SIZE).await?;
            }
            MessageKind::Other => {}
        }
        Ok(())
    }

    // --- accounts channel ---

    async fn handle_accounts(&self, message: &FeedMessage) -> Result<()> {
        let Some(account_id) = message.id.as_deref() else {
            log::warn!("[REPLICA] dropping account message without id");
            return Ok(());
        };
        match message.kind {
            MessageKind::Subscribed => self.apply_account_snapshot(account_id, message).await,
            MessageKind::ChannelData => self.apply_account_delta(account_id, message).await,
            MessageKind::Other => Ok(()),
        }
    }

    /// Orders and positions reference markets by name; a missing market is a
    /// job failure since the replica cannot key the row without it.
    async fn require_market(&self, name: &str) -> Result<MarketRow> {
        self.store
            .market_by_name(name)
            .await?
            .ok_or_else(|| anyhow!("market {} not found in replica", name))
    }

    async fn apply_account_snapshot(&self, account_id: &str, message: &FeedMessage) -> Result<()> {
        let contents: AccountSnapshotContents =
            serde_json::from_value(message.contents.clone())
                .context("malformed account snapshot")?;

        // snapshot replaces everything the account owns
        self.store.clear_account(account_id).await?;

        for order in &contents.orders {
            if TERMINAL_ORDER_STATUSES.contains(&order.status.as_str()) {
                continue;
            }
            self.upsert_order(account_id, order).await?;
        }

        if let Some(raw) = contents.account.quote_balance.as_deref() {
            if let Some(balance) = parse_f64("quoteBalance", raw) {
                self.store.upsert_account_balance(account_id, balance).await?;
            }
        }

        for (market_name, position) in &contents.account.open_positions {
            let entry = PositionEntry {
                market: Some(market_name.clone()),
                side: position.side.clone(),
                size: position.size.clone(),
                status: position.status.clone(),
            };
            self.upsert_position(account_id, &entry).await?;
        }
        log::info!("[REPLICA] account {} snapshot applied", account_id);
        Ok(())
    }

    async fn apply_account_delta(&self, account_id: &str, message: &FeedMessage) -> Result<()> {
        let contents: AccountDeltaContents = serde_json::from_value(message.contents.clone())
            .context("malformed account delta")?;

        if let Some(account) = contents.accounts.first() {
            if let Some(raw) = account.quote_balance.as_deref() {
                if let Some(balance) = parse_f64("quoteBalance", raw) {
                    self.store.upsert_account_balance(account_id, balance).await?;
                }
            }
        }

        for order in &contents.orders {
            if TERMINAL_ORDER_STATUSES.contains(&order.status.as_str()) {
                self.store.delete_active_order(&order.id).await?;
            } else {
                self.upsert_order(account_id, order).await?;
            }
        }

        for position in &contents.positions {
            self.upsert_position(account_id, position).await?;
        }
        Ok(())
    }

    async fn upsert_order(&self, account_id: &str, order: &OrderEntry) -> Result<()> {
        let market = self.require_market(&order.market).await?;
        let (Some(price), Some(size), Some(remaining)) = (
            parse_f64("price", &order.price),
            parse_f64("size", &order.size),
            parse_f64("remainingSize", &order.remaining_size),
        ) else {
            return Ok(());
        };
        self.store
            .upsert_active_order(&ActiveOrderRow {
                id: order.id.clone(),
                market_id: market.id,
                account_id: account_id.to_string(),
                side: order.side.clone(),
                kind: order.kind.clone(),
                price,
                size,
                remaining_size: remaining,
                status: order.status.clone(),
            })
            .await
    }

    async fn upsert_position(&self, account_id: &str, position: &PositionEntry) -> Result<()> {
        let market_name = position
            .market
            .as_deref()
            .ok_or_else(|| anyhow!("position update without market"))?;
        let market = self.require_market(market_name).await?;

        if position.status.as_deref() == Some(CLOSED_POSITION_STATUS) {
            return self.store.delete_position(market.id, account_id).await;
        }
        let Some(side) = PositionSide::parse(&position.side) else {
            log::warn!(
                "[REPLICA] skipping position with unknown side {:?} on {}",
                position.side,
                market_name
            );
            return Ok(());
        };
        let Some(size) = parse_f64("size", &position.size) else {
            return Ok(());
        };
        self.store
            .upsert_position(market.id, account_id, side, size)
            .await
    }
}
