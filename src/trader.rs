//! Pair trading state machine.
//!
//! One serialized tick loop drives three states: `ManageNewTrades` evaluates
//! the z-score and opens both legs, `EntryPending` watches the open pair for
//! a z-score sign flip, and `CloseTrades` cancels resting orders and
//! flattens both legs with reduce-only market orders. Ticks never overlap,
//! so at most one order batch is in flight at a time.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::exchange::{ExchangeClient, OrderRequest, OrderSide};
use crate::liquidity::{self, TradeDetails};
use crate::replica::{MarketRow, PositionSide, ReplicaStore};
use crate::signal::SignalSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotState {
    ManageNewTrades,
    EntryPending,
    CloseTrades,
}

#[derive(Debug, Clone)]
pub struct TradingParams {
    /// Upper bound on quote capital committed across both legs.
    pub tradable_capital: f64,
    /// Fractional stop distance from the entry price.
    pub stop_loss: f64,
    /// Absolute z-score required to open a pair.
    pub trigger_thresh: f64,
    /// Resting limit entries when true, market entries with a protective
    /// stop when false.
    pub limit_order: bool,
    pub tick_secs: u64,
}

pub struct Trader {
    store: Arc<ReplicaStore>,
    exchange: Arc<dyn ExchangeClient>,
    signal: Arc<dyn SignalSource>,
    params: TradingParams,
    account_id: String,
    market_a: MarketRow,
    market_b: MarketRow,
    /// The leg bought when the z-score is positive.
    positive_market: String,
    state: BotState,
    entry_sign_positive: Option<bool>,
}

impl Trader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<ReplicaStore>,
        exchange: Arc<dyn ExchangeClient>,
        signal: Arc<dyn SignalSource>,
        params: TradingParams,
        account_id: String,
        market_a: MarketRow,
        market_b: MarketRow,
        positive_market: String,
    ) -> Self {
        Self {
            store,
            exchange,
            signal,
            params,
            account_id,
            market_a,
            market_b,
            positive_market,
            state: BotState::ManageNewTrades,
            entry_sign_positive: None,
        }
    }

    pub fn state(&self) -> BotState {
        self.state
    }

    /// Serialized tick loop; a failed tick is logged and the next one runs.
    pub async fn run(&mut self) -> Result<()> {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.params.tick_secs.max(1)));
        log::info!(
            "[TRADE] managing {} / {} every {}s",
            self.market_a.name,
            self.market_b.name,
            self.params.tick_secs
        );
        loop {
            ticker.tick().await;
            if let Err(err) = self.step().await {
                log::error!("[TRADE] tick failed: {:#}", err);
            }
        }
    }

    pub async fn step(&mut self) -> Result<()> {
        match self.state {
            BotState::ManageNewTrades => self.manage_new_trades().await,
            BotState::EntryPending => self.watch_open_pair().await,
            BotState::CloseTrades => self.close_trades().await,
        }
    }

    /// Entry sides for both legs given the z-score sign. A positive z-score
    /// buys the configured positive market and sells the other leg.
    fn entry_sides(&self, sign_positive: bool) -> (OrderSide, OrderSide) {
        let a_is_long = (self.market_a.name == self.positive_market) == sign_positive;
        if a_is_long {
            (OrderSide::Buy, OrderSide::Sell)
        } else {
            (OrderSide::Sell, OrderSide::Buy)
        }
    }

    async fn leg_details(
        &self,
        market: &MarketRow,
        side: OrderSide,
        capital: f64,
    ) -> Result<Option<TradeDetails>> {
        let levels = self.store.book_levels(market.id).await?;
        match liquidity::trade_details(
            &market.name,
            &levels,
            side,
            capital,
            self.params.stop_loss,
        ) {
            Ok(details) => Ok(Some(details)),
            Err(err) => {
                log::warn!("[TRADE] {} not tradable this tick: {}", market.name, err);
                Ok(None)
            }
        }
    }

    async fn pair_mids(&self, sign_positive: bool) -> Result<Option<(f64, f64)>> {
        let (side_a, side_b) = self.entry_sides(sign_positive);
        let details_a = self
            .leg_details(&self.market_a, side_a, self.params.tradable_capital)
            .await?;
        let details_b = self
            .leg_details(&self.market_b, side_b, self.params.tradable_capital)
            .await?;
        match (details_a, details_b) {
            (Some(a), Some(b)) => Ok(Some((a.mid_price, b.mid_price))),
            _ => Ok(None),
        }
    }

    async fn manage_new_trades(&mut self) -> Result<()> {
        let position_a = self.store.position(self.market_a.id, &self.account_id).await?;
        let position_b = self.store.position(self.market_b.id, &self.account_id).await?;
        if position_a.is_some() || position_b.is_some() {
            // picked up an existing pair, e.g. after a restart
            self.entry_sign_positive = self.infer_entry_sign(&position_a, &position_b);
            log::info!("[TRADE] open position found; watching for exit");
            self.state = BotState::EntryPending;
            return Ok(());
        }
        let resting = self
            .store
            .active_order_count(self.market_a.id, &self.account_id)
            .await?
            + self
                .store
                .active_order_count(self.market_b.id, &self.account_id)
                .await?;
        if resting > 0 {
            log::debug!("[TRADE] {} resting orders; not evaluating entries", resting);
            return Ok(());
        }

        let Some((mid_a, mid_b)) = self.pair_mids(true).await? else {
            return Ok(());
        };
        let signal = match self
            .signal
            .latest_zscore(&self.market_a.name, &self.market_b.name, mid_a, mid_b)
            .await
        {
            Ok(signal) => signal,
            Err(err) => {
                log::warn!("[SIGNAL] skipping entry evaluation: {}", err);
                return Ok(());
            }
        };
        if signal.zscore.abs() <= self.params.trigger_thresh {
            log::debug!(
                "[EVAL] z-score {:.4} below trigger {:.2}",
                signal.zscore,
                self.params.trigger_thresh
            );
            return Ok(());
        }

        let Some(per_leg) = self.capital_per_leg().await? else {
            return Ok(());
        };
        let sign_positive = signal.sign_positive();
        let (side_a, side_b) = self.entry_sides(sign_positive);
        log::info!(
            "[EVAL] z-score {:.4} crossed trigger; entering {} {} / {} {}",
            signal.zscore,
            side_a.as_str(),
            self.market_a.name,
            side_b.as_str(),
            self.market_b.name
        );

        let market_a = self.market_a.clone();
        let market_b = self.market_b.clone();
        let placed_a = self.place_entry(&market_a, side_a, per_leg).await?;
        let placed_b = self.place_entry(&market_b, side_b, per_leg).await?;
        if placed_a || placed_b {
            self.entry_sign_positive = Some(sign_positive);
            self.state = BotState::EntryPending;
        }
        Ok(())
    }

    /// Quote capital committed to each leg: half of the configured capital,
    /// never more than the account balance allows, and clamped to recent
    /// per-leg trade liquidity when entries rest as limit orders.
    ///
    /// A leg with no recorded trades has no liquidity estimate at all and
    /// makes the whole tick untradable, in either entry mode.
    async fn capital_per_leg(&self) -> Result<Option<f64>> {
        let mut quotes = Vec::with_capacity(2);
        for market in [&self.market_a, &self.market_b] {
            let trades = self.store.trades_newest_first(market.id).await?;
            match liquidity::trade_liquidity(&market.name, &trades) {
                Ok(liq) => quotes.push(liq.avg_size * liq.latest_price),
                Err(err) => {
                    log::warn!("[TRADE] cannot size {}: {}", market.name, err);
                    return Ok(None);
                }
            }
        }

        let balance = self
            .store
            .quote_balance(&self.account_id)
            .await?
            .unwrap_or(0.0);
        let tradable = self.params.tradable_capital.min(balance);
        if tradable <= 0.0 {
            log::warn!("[TRADE] no tradable capital (balance {:.2})", balance);
            return Ok(None);
        }
        let mut per_leg = tradable / 2.0;
        if self.params.limit_order {
            for quote in quotes {
                per_leg = per_leg.min(quote);
            }
        }
        Ok(Some(per_leg))
    }

    async fn place_entry(
        &self,
        market: &MarketRow,
        side: OrderSide,
        capital: f64,
    ) -> Result<bool> {
        let Some(details) = self.leg_details(market, side, capital).await? else {
            return Ok(false);
        };
        if details.quantity <= 0.0 {
            return Ok(false);
        }

        let placement = if self.params.limit_order {
            self.exchange
                .create_order(&OrderRequest::limit_entry(
                    &market.name,
                    side,
                    details.quantity,
                    details.mid_price,
                ))
                .await
                .map(|_| ())
        } else {
            // market entry plus a protective stop on the opposite side
            match self
                .exchange
                .create_order(&OrderRequest::market_entry(
                    &market.name,
                    side,
                    details.quantity,
                    details.mid_price,
                ))
                .await
            {
                Ok(_) => self
                    .exchange
                    .create_order(&OrderRequest::stop_market(
                        &market.name,
                        side.opposite(),
                        details.quantity,
                        details.stop_loss,
                    ))
                    .await
                    .map(|_| ()),
                Err(err) => Err(err),
            }
        };
        match placement {
            Ok(()) => Ok(true),
            Err(err) => {
                log::error!("[ORDER] {} entry rejected: {}", market.name, err);
                Ok(false)
            }
        }
    }

    fn infer_entry_sign(
        &self,
        position_a: &Option<crate::replica::PositionRow>,
        position_b: &Option<crate::replica::PositionRow>,
    ) -> Option<bool> {
        let a_is_positive = self.market_a.name == self.positive_market;
        if let Some(position) = position_a {
            let long = position.side == PositionSide::Long;
            return Some(long == a_is_positive);
        }
        if let Some(position) = position_b {
            let long = position.side == PositionSide::Long;
            return Some(long != a_is_positive);
        }
        None
    }

    async fn watch_open_pair(&mut self) -> Result<()> {
        let position_a = self.store.position(self.market_a.id, &self.account_id).await?;
        let position_b = self.store.position(self.market_b.id, &self.account_id).await?;
        let resting = self
            .store
            .active_order_count(self.market_a.id, &self.account_id)
            .await?
            + self
                .store
                .active_order_count(self.market_b.id, &self.account_id)
                .await?;

        if position_a.is_none() && position_b.is_none() {
            if resting == 0 {
                log::info!("[TRADE] pair flat again; resuming entry management");
                self.entry_sign_positive = None;
                self.state = BotState::ManageNewTrades;
            }
            // otherwise entries are still resting; keep waiting
            return Ok(());
        }

        let entry_positive = match self.entry_sign_positive {
            Some(sign) => sign,
            None => match self.infer_entry_sign(&position_a, &position_b) {
                Some(sign) => {
                    self.entry_sign_positive = Some(sign);
                    sign
                }
                None => return Ok(()),
            },
        };

        let Some((mid_a, mid_b)) = self.pair_mids(entry_positive).await? else {
            return Ok(());
        };
        let signal = match self
            .signal
            .latest_zscore(&self.market_a.name, &self.market_b.name, mid_a, mid_b)
            .await
        {
            Ok(signal) => signal,
            Err(err) => {
                log::warn!("[SIGNAL] skipping exit evaluation: {}", err);
                return Ok(());
            }
        };
        // the spread mean-reverted past zero: take the pair off
        if signal.zscore != 0.0 && signal.sign_positive() != entry_positive {
            log::info!(
                "[EVAL] z-score {:.4} flipped sign; closing the pair",
                signal.zscore
            );
            self.state = BotState::CloseTrades;
        }
        Ok(())
    }

    async fn close_trades(&mut self) -> Result<()> {
        let markets = [self.market_a.clone(), self.market_b.clone()];
        for market in &markets {
            if let Err(err) = self.exchange.cancel_active_orders(&market.name).await {
                log::error!("[ORDER] cancel on {} failed: {}", market.name, err);
            }
            let Some(position) = self.store.position(market.id, &self.account_id).await? else {
                continue;
            };
            let side = match position.side {
                PositionSide::Long => OrderSide::Sell,
                PositionSide::Short => OrderSide::Buy,
            };
            let price = match self.leg_details(market, side, 0.0).await? {
                Some(details) => details.mid_price,
                None => market.index_price,
            };
            let request = OrderRequest::market_close(&market.name, side, position.size, price);
            match self.exchange.create_order(&request).await {
                Ok(_) => log::info!(
                    "[POSITION] flattening {} {} {}",
                    market.name,
                    side.as_str(),
                    position.size
                ),
                Err(err) => {
                    log::error!("[ORDER] close on {} rejected: {}", market.name, err)
                }
            }
        }
        self.entry_sign_positive = None;
        self.state = BotState::ManageNewTrades;
        Ok(())
    }
}
