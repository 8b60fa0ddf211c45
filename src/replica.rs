//! Local replica of exchange state, persisted in SQLite.
//!
//! The feed worker is the only writer; the trader and signal evaluator only
//! read. Every mutation is scoped to a single row key (market+side+price,
//! order id, or market+account), so concurrent handlers serialize at the row
//! level through SQLite itself.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

/// Per-market cap on retained trades. Older rows are pruned after each batch.
pub const TRADES_MAX_SIZE: usize = 100;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS markets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT UNIQUE NOT NULL,
    status TEXT NOT NULL DEFAULT 'ONLINE',
    index_price REAL NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS book_levels (
    market_id INTEGER NOT NULL,
    side TEXT NOT NULL,
    price REAL NOT NULL,
    size REAL NOT NULL,
    book_offset INTEGER NOT NULL,
    PRIMARY KEY (market_id, side, price)
);
CREATE TABLE IF NOT EXISTS trades (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    market_id INTEGER NOT NULL,
    side TEXT NOT NULL,
    size REAL NOT NULL,
    price REAL NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_trades_market_time ON trades(market_id, created_at);
CREATE TABLE IF NOT EXISTS positions (
    market_id INTEGER NOT NULL,
    account_id TEXT NOT NULL,
    side TEXT NOT NULL,
    size REAL NOT NULL,
    PRIMARY KEY (market_id, account_id)
);
CREATE TABLE IF NOT EXISTS active_orders (
    id TEXT PRIMARY KEY,
    market_id INTEGER NOT NULL,
    account_id TEXT NOT NULL,
    side TEXT NOT NULL,
    kind TEXT NOT NULL,
    price REAL NOT NULL,
    size REAL NOT NULL,
    remaining_size REAL NOT NULL,
    status TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS accounts (
    id TEXT PRIMARY KEY,
    quote_balance REAL NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS candles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    market_id INTEGER NOT NULL,
    close REAL NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_candles_market_time ON candles(market_id, created_at);
";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookSide {
    Bid,
    Ask,
}

impl BookSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookSide::Bid => "BID",
            BookSide::Ask => "ASK",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "LONG" => Some(PositionSide::Long),
            "SHORT" => Some(PositionSide::Short),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MarketRow {
    pub id: i64,
    pub name: String,
    pub status: String,
    pub index_price: f64,
}

#[derive(Debug, Clone)]
pub struct BookLevel {
    pub side: BookSide,
    pub price: f64,
    pub size: f64,
    pub offset: i64,
}

#[derive(Debug, Clone)]
pub struct TradeRow {
    pub side: String,
    pub size: f64,
    pub price: f64,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct PositionRow {
    pub market_id: i64,
    pub account_id: String,
    pub side: PositionSide,
    pub size: f64,
}

#[derive(Debug, Clone)]
pub struct ActiveOrderRow {
    pub id: String,
    pub market_id: i64,
    pub account_id: String,
    pub side: String,
    pub kind: String,
    pub price: f64,
    pub size: f64,
    pub remaining_size: f64,
    pub status: String,
}

pub struct ReplicaStore {
    conn: Mutex<Connection>,
}

impl ReplicaStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open replica store {}", path))?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory store")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("failed to initialize replica schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // --- markets ---

    pub async fn upsert_market(
        &self,
        name: &str,
        status: Option<&str>,
        index_price: f64,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO markets (name, status, index_price)
             VALUES (?1, COALESCE(?2, 'ONLINE'), ?3)
             ON CONFLICT(name) DO UPDATE SET
                 status = COALESCE(?2, markets.status),
                 index_price = ?3",
            params![name, status, index_price],
        )?;
        Ok(())
    }

    /// Updates the index price of an existing market. Returns false when the
    /// market is unknown; delta messages never create markets.
    pub async fn set_index_price(&self, name: &str, index_price: f64) -> Result<bool> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE markets SET index_price = ?2 WHERE name = ?1",
            params![name, index_price],
        )?;
        Ok(updated > 0)
    }

    pub async fn market_by_name(&self, name: &str) -> Result<Option<MarketRow>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT id, name, status, index_price FROM markets WHERE name = ?1",
                params![name],
                |row| {
                    Ok(MarketRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        status: row.get(2)?,
                        index_price: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    // --- order book levels ---

    pub async fn clear_book(&self, market_id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM book_levels WHERE market_id = ?1",
            params![market_id],
        )?;
        Ok(())
    }

    /// Offset-gated write of a single price level.
    ///
    /// Absent keys are inserted with the message offset. Present keys are
    /// only touched when the incoming offset is strictly greater than the
    /// stored one. A size of zero is retained as a tombstone so a delayed
    /// lower-offset update cannot resurrect a deleted level; reads exclude
    /// zero-size rows.
    pub async fn apply_level(
        &self,
        market_id: i64,
        side: BookSide,
        price: f64,
        size: f64,
        offset: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO book_levels (market_id, side, price, size, book_offset)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(market_id, side, price) DO UPDATE SET
                 size = excluded.size,
                 book_offset = excluded.book_offset
             WHERE excluded.book_offset > book_levels.book_offset",
            params![market_id, side.as_str(), price, size, offset],
        )?;
        Ok(())
    }

    pub async fn find_level(
        &self,
        market_id: i64,
        side: BookSide,
        price: f64,
    ) -> Result<Option<(f64, i64)>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT size, book_offset FROM book_levels
                 WHERE market_id = ?1 AND side = ?2 AND price = ?3",
                params![market_id, side.as_str(), price],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row)
    }

    /// All live (non-tombstone) levels for a market.
    pub async fn book_levels(&self, market_id: i64) -> Result<Vec<BookLevel>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT side, price, size, book_offset FROM book_levels
             WHERE market_id = ?1 AND size > 0",
        )?;
        let rows = stmt.query_map(params![market_id], |row| {
            let side: String = row.get(0)?;
            Ok(BookLevel {
                side: if side == "BID" {
                    BookSide::Bid
                } else {
                    BookSide::Ask
                },
                price: row.get(1)?,
                size: row.get(2)?,
                offset: row.get(3)?,
            })
        })?;
        let mut levels = Vec::new();
        for row in rows {
            levels.push(row?);
        }
        Ok(levels)
    }

    // --- trades ---

    pub async fn clear_trades(&self, market_id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM trades WHERE market_id = ?1", params![market_id])?;
        Ok(())
    }

    pub async fn insert_trades(&self, market_id: i64, trades: &[TradeRow]) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO trades (market_id, side, size, price, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for trade in trades {
                stmt.execute(params![
                    market_id,
                    trade.side,
                    trade.size,
                    trade.price,
                    trade.created_at
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub async fn trade_count(&self, market_id: i64) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM trades WHERE market_id = ?1",
            params![market_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Deletes the oldest rows (creation time ascending) until the per-market
    /// count is back at `cap`.
    pub async fn prune_trades(&self, market_id: i64, cap: usize) -> Result<()> {
        let count = self.trade_count(market_id).await?;
        if count <= cap {
            return Ok(());
        }
        let excess = (count - cap) as i64;
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM trades WHERE id IN (
                 SELECT id FROM trades WHERE market_id = ?1
                 ORDER BY created_at ASC, id ASC LIMIT ?2
             )",
            params![market_id, excess],
        )?;
        Ok(())
    }

    pub async fn trades_newest_first(&self, market_id: i64) -> Result<Vec<TradeRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT side, size, price, created_at FROM trades
             WHERE market_id = ?1 ORDER BY created_at DESC, id DESC",
        )?;
        let rows = stmt.query_map(params![market_id], |row| {
            Ok(TradeRow {
                side: row.get(0)?,
                size: row.get(1)?,
                price: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;
        let mut trades = Vec::new();
        for row in rows {
            trades.push(row?);
        }
        Ok(trades)
    }

    // --- accounts, positions, active orders ---

    /// Drops all positions and active orders owned by the account; used when
    /// an account snapshot replaces local state.
    pub async fn clear_account(&self, account_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM positions WHERE account_id = ?1",
            params![account_id],
        )?;
        conn.execute(
            "DELETE FROM active_orders WHERE account_id = ?1",
            params![account_id],
        )?;
        Ok(())
    }

    pub async fn upsert_account_balance(&self, account_id: &str, quote_balance: f64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO accounts (id, quote_balance) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET quote_balance = excluded.quote_balance",
            params![account_id, quote_balance],
        )?;
        Ok(())
    }

    pub async fn quote_balance(&self, account_id: &str) -> Result<Option<f64>> {
        let conn = self.conn.lock().await;
        let balance = conn
            .query_row(
                "SELECT quote_balance FROM accounts WHERE id = ?1",
                params![account_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(balance)
    }

    pub async fn upsert_active_order(&self, order: &ActiveOrderRow) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO active_orders
                 (id, market_id, account_id, side, kind, price, size, remaining_size, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                 remaining_size = excluded.remaining_size,
                 status = excluded.status",
            params![
                order.id,
                order.market_id,
                order.account_id,
                order.side,
                order.kind,
                order.price,
                order.size,
                order.remaining_size,
                order.status
            ],
        )?;
        Ok(())
    }

    pub async fn delete_active_order(&self, order_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM active_orders WHERE id = ?1",
            params![order_id],
        )?;
        Ok(())
    }

    pub async fn active_order_count(&self, market_id: i64, account_id: &str) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM active_orders WHERE market_id = ?1 AND account_id = ?2",
            params![market_id, account_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub async fn upsert_position(
        &self,
        market_id: i64,
        account_id: &str,
        side: PositionSide,
        size: f64,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO positions (market_id, account_id, side, size)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(market_id, account_id) DO UPDATE SET size = excluded.size",
            params![market_id, account_id, side.as_str(), size],
        )?;
        Ok(())
    }

    pub async fn delete_position(&self, market_id: i64, account_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM positions WHERE market_id = ?1 AND account_id = ?2",
            params![market_id, account_id],
        )?;
        Ok(())
    }

    pub async fn position(
        &self,
        market_id: i64,
        account_id: &str,
    ) -> Result<Option<PositionRow>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT market_id, account_id, side, size FROM positions
                 WHERE market_id = ?1 AND account_id = ?2",
                params![market_id, account_id],
                |row| {
                    let side: String = row.get(2)?;
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, side, row.get::<_, f64>(3)?))
                },
            )
            .optional()?;
        match row {
            Some((market_id, account_id, side, size)) => {
                let side = PositionSide::parse(&side)
                    .with_context(|| format!("invalid position side {} in replica", side))?;
                Ok(Some(PositionRow {
                    market_id,
                    account_id,
                    side,
                    size,
                }))
            }
            None => Ok(None),
        }
    }

    // --- candles ---

    pub async fn replace_candles(&self, market_id: i64, candles: &[(f64, String)]) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM candles WHERE market_id = ?1", params![market_id])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO candles (market_id, close, created_at) VALUES (?1, ?2, ?3)",
            )?;
            for (close, created_at) in candles {
                stmt.execute(params![market_id, close, created_at])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Close prices ordered oldest to newest.
    pub async fn close_series(&self, market_id: i64) -> Result<Vec<f64>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT close FROM candles WHERE market_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![market_id], |row| row.get(0))?;
        let mut series = Vec::new();
        for row in rows {
            series.push(row?);
        }
        Ok(series)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn market_upsert_is_idempotent() {
        let store = ReplicaStore::in_memory().unwrap();
        store.upsert_market("BTC-USD", Some("ONLINE"), 100.0).await.unwrap();
        store.upsert_market("BTC-USD", None, 101.0).await.unwrap();
        let market = store.market_by_name("BTC-USD").await.unwrap().unwrap();
        assert_eq!(market.status, "ONLINE");
        assert_eq!(market.index_price, 101.0);
    }

    #[tokio::test]
    async fn set_index_price_never_creates_markets() {
        let store = ReplicaStore::in_memory().unwrap();
        assert!(!store.set_index_price("ETH-USD", 42.0).await.unwrap());
        assert!(store.market_by_name("ETH-USD").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn apply_level_rejects_stale_offsets() {
        let store = ReplicaStore::in_memory().unwrap();
        store.upsert_market("BTC-USD", None, 0.0).await.unwrap();
        let market = store.market_by_name("BTC-USD").await.unwrap().unwrap();

        store.apply_level(market.id, BookSide::Bid, 100.0, 2.0, 5).await.unwrap();
        store.apply_level(market.id, BookSide::Bid, 100.0, 3.0, 4).await.unwrap();
        let (size, offset) = store
            .find_level(market.id, BookSide::Bid, 100.0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(size, 2.0);
        assert_eq!(offset, 5);
    }

    #[tokio::test]
    async fn zero_size_levels_are_tombstoned_not_listed() {
        let store = ReplicaStore::in_memory().unwrap();
        store.upsert_market("BTC-USD", None, 0.0).await.unwrap();
        let market = store.market_by_name("BTC-USD").await.unwrap().unwrap();

        store.apply_level(market.id, BookSide::Ask, 101.0, 1.0, 1).await.unwrap();
        store.apply_level(market.id, BookSide::Ask, 101.0, 0.0, 2).await.unwrap();
        assert!(store.book_levels(market.id).await.unwrap().is_empty());
        // the key still carries its last applied offset
        let (size, offset) = store
            .find_level(market.id, BookSide::Ask, 101.0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(size, 0.0);
        assert_eq!(offset, 2);
    }

    #[tokio::test]
    async fn prune_trades_removes_oldest_first() {
        let store = ReplicaStore::in_memory().unwrap();
        store.upsert_market("BTC-USD", None, 0.0).await.unwrap();
        let market = store.market_by_name("BTC-USD").await.unwrap().unwrap();

        let trades: Vec<TradeRow> = (0..5)
            .map(|i| TradeRow {
                side: "BUY".to_string(),
                size: 1.0,
                price: 100.0 + i as f64,
                created_at: format!("2023-01-01T00:00:0{}Z", i),
            })
            .collect();
        store.insert_trades(market.id, &trades).await.unwrap();
        store.prune_trades(market.id, 3).await.unwrap();

        let remaining = store.trades_newest_first(market.id).await.unwrap();
        assert_eq!(remaining.len(), 3);
        assert_eq!(remaining[0].price, 104.0);
        assert_eq!(remaining[2].price, 102.0);
    }

    #[tokio::test]
    async fn position_upsert_keeps_one_row_per_market_account() {
        let store = ReplicaStore::in_memory().unwrap();
        store.upsert_market("BTC-USD", None, 0.0).await.unwrap();
        let market = store.market_by_name("BTC-USD").await.unwrap().unwrap();

        store
            .upsert_position(market.id, "acct-1", PositionSide::Long, 1.0)
            .await
            .unwrap();
        store
            .upsert_position(market.id, "acct-1", PositionSide::Long, 2.5)
            .await
            .unwrap();
        let position = store.position(market.id, "acct-1").await.unwrap().unwrap();
        assert_eq!(position.size, 2.5);
        assert_eq!(position.side, PositionSide::Long);
    }
}
