//! Top-level wiring: startup sync, feed/worker tasks and the trader loop.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};

use crate::config::StatBotConfig;
use crate::exchange::{ApiCredentials, ExchangeClient, HttpExchangeClient};
use crate::feed::FeedIngress;
use crate::queue::{self, RetryPolicy};
use crate::replica::{MarketRow, ReplicaStore};
use crate::signal::{CointClient, SignalEvaluator};
use crate::trader::{Trader, TradingParams};
use crate::worker::FeedWorker;

pub struct StatBot {
    cfg: StatBotConfig,
    store: Arc<ReplicaStore>,
    exchange: Arc<dyn ExchangeClient>,
    trader: Trader,
}

impl StatBot {
    /// Builds the full context. Any failure here is fatal: the trader must
    /// not start against an unsynced replica.
    pub async fn new(cfg: StatBotConfig) -> Result<Self> {
        let store = Arc::new(ReplicaStore::open(&cfg.db_path)?);
        let exchange: Arc<dyn ExchangeClient> = Arc::new(
            HttpExchangeClient::connect(
                &cfg.rest_endpoint,
                ApiCredentials {
                    key: cfg.api_key.clone(),
                    secret: cfg.api_secret.clone(),
                    passphrase: cfg.api_passphrase.clone(),
                },
                &cfg.time_frame,
            )
            .await
            .context("failed to connect to the exchange")?,
        );

        sync_markets(&store, exchange.as_ref()).await?;
        let market_a = require_market(&store, &cfg.market_a).await?;
        let market_b = require_market(&store, &cfg.market_b).await?;
        sync_candles(&store, exchange.as_ref(), &[&market_a, &market_b], cfg.candles_limit)
            .await?;

        let account = exchange
            .get_account()
            .await
            .context("failed to fetch the trading account")?;
        store
            .upsert_account_balance(&account.id, account.quote_balance)
            .await?;
        log::info!(
            "[SYNC] account {} with {:.2} quote balance",
            account.id,
            account.quote_balance
        );

        let signal = Arc::new(SignalEvaluator::new(
            store.clone(),
            CointClient::new(&cfg.coint_endpoint, cfg.zscore_window),
        ));
        let trader = Trader::new(
            store.clone(),
            exchange.clone(),
            signal,
            TradingParams {
                tradable_capital: cfg.tradable_capital,
                stop_loss: cfg.stop_loss,
                trigger_thresh: cfg.trigger_thresh,
                limit_order: cfg.limit_order,
                tick_secs: cfg.tick_secs,
            },
            account.id,
            market_a,
            market_b,
            cfg.positive_market.clone(),
        );

        Ok(Self {
            cfg,
            store,
            exchange,
            trader,
        })
    }

    pub async fn run(&mut self) -> Result<()> {
        let (job_queue, runner) = queue::channel(RetryPolicy::default());
        let worker = FeedWorker::new(self.store.clone());
        tokio::spawn(runner.run(worker));

        let feed = FeedIngress::new(
            self.cfg.web_socket_endpoint.clone(),
            vec![self.cfg.market_a.clone(), self.cfg.market_b.clone()],
            self.exchange.account_subscription(),
            job_queue,
        );
        tokio::spawn(feed.run());

        self.trader.run().await
    }
}

async fn require_market(store: &ReplicaStore, name: &str) -> Result<MarketRow> {
    let market = store
        .market_by_name(name)
        .await?
        .ok_or_else(|| anyhow!("market {} is not listed on the exchange", name))?;
    if market.status != "ONLINE" {
        log::warn!("[SYNC] market {} is {}", name, market.status);
    }
    Ok(market)
}

async fn sync_markets(store: &ReplicaStore, exchange: &dyn ExchangeClient) -> Result<()> {
    let markets = exchange
        .get_markets()
        .await
        .context("startup market sync failed")?;
    let count = markets.len();
    for market in markets {
        store
            .upsert_market(&market.name, Some(&market.status), market.index_price)
            .await?;
    }
    log::info!("[SYNC] replicated {} markets", count);
    Ok(())
}

/// Seeds candle history for the pair. Markets with an incomplete window are
/// left empty; the signal evaluator reports them as not ready.
async fn sync_candles(
    store: &ReplicaStore,
    exchange: &dyn ExchangeClient,
    markets: &[&MarketRow],
    limit: usize,
) -> Result<()> {
    for market in markets {
        let candles = exchange
            .get_candles(&market.name, limit)
            .await
            .with_context(|| format!("candle sync failed for {}", market.name))?;
        if candles.len() < limit {
            log::warn!(
                "[SYNC] {} has only {}/{} candles; skipping seed",
                market.name,
                candles.len(),
                limit
            );
            continue;
        }
        let rows: Vec<(f64, String)> = candles
            .into_iter()
            .map(|c| (c.close, c.updated_at))
            .collect();
        store.replace_candles(market.id, &rows).await?;
        log::info!("[SYNC] seeded {} candles for {}", limit, market.name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{
        AccountInfo, Candle, ExchangeError, MarketInfo, OrderAck, OrderRequest,
    };
    use async_trait::async_trait;

    struct StubExchange {
        candles: usize,
    }

    #[async_trait]
    impl ExchangeClient for StubExchange {
        async fn get_markets(&self) -> Result<Vec<MarketInfo>, ExchangeError> {
            Ok(vec![
                MarketInfo {
                    name: "BTC-USD".to_string(),
                    status: "ONLINE".to_string(),
                    index_price: 100.0,
                },
                MarketInfo {
                    name: "ETH-USD".to_string(),
                    status: "OFFLINE".to_string(),
                    index_price: 20.0,
                },
            ])
        }
        async fn get_candles(
            &self,
            _market: &str,
            _limit: usize,
        ) -> Result<Vec<Candle>, ExchangeError> {
            Ok((0..self.candles)
                .map(|i| Candle {
                    close: 100.0 + i as f64,
                    updated_at: format!("2023-01-01T{:02}:00:00Z", i % 24),
                })
                .collect())
        }
        async fn get_account(&self) -> Result<AccountInfo, ExchangeError> {
            Ok(AccountInfo {
                id: "acct-1".to_string(),
                position_id: "pos-1".to_string(),
                quote_balance: 1000.0,
            })
        }
        async fn create_order(&self, _request: &OrderRequest) -> Result<OrderAck, ExchangeError> {
            Err(ExchangeError::Other("not expected".to_string()))
        }
        async fn cancel_active_orders(&self, _market: &str) -> Result<(), ExchangeError> {
            Ok(())
        }
        fn account_subscription(&self) -> serde_json::Value {
            serde_json::json!({})
        }
    }

    #[tokio::test]
    async fn startup_sync_replicates_markets() {
        let store = ReplicaStore::in_memory().unwrap();
        let exchange = StubExchange { candles: 3 };
        sync_markets(&store, &exchange).await.unwrap();
        let btc = store.market_by_name("BTC-USD").await.unwrap().unwrap();
        assert_eq!(btc.index_price, 100.0);
        assert_eq!(
            store.market_by_name("ETH-USD").await.unwrap().unwrap().status,
            "OFFLINE"
        );
    }

    #[tokio::test]
    async fn candle_sync_skips_incomplete_windows() {
        let store = ReplicaStore::in_memory().unwrap();
        let exchange = StubExchange { candles: 3 };
        sync_markets(&store, &exchange).await.unwrap();
        let btc = store.market_by_name("BTC-USD").await.unwrap().unwrap();

        sync_candles(&store, &exchange, &[&btc], 5).await.unwrap();
        assert!(store.close_series(btc.id).await.unwrap().is_empty());

        sync_candles(&store, &exchange, &[&btc], 3).await.unwrap();
        assert_eq!(store.close_series(btc.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn missing_pair_market_is_fatal() {
        let store = ReplicaStore::in_memory().unwrap();
        sync_markets(&store, &StubExchange { candles: 0 }).await.unwrap();
        assert!(require_market(&store, "XRP-USD").await.is_err());
        assert!(require_market(&store, "BTC-USD").await.is_ok());
    }
}
