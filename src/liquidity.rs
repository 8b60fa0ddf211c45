//! Pricing and liquidity reads against the replicated order book.

use std::fmt;

use crate::exchange::OrderSide;
use crate::replica::{BookLevel, BookSide, TradeRow};

#[derive(Debug)]
pub enum LiquidityError {
    /// The replicated book has no level on the side the quote needs.
    NoLiquidity { market: String },
    /// No trades have been replicated for the market yet.
    NoTrades { market: String },
}

impl fmt::Display for LiquidityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LiquidityError::NoLiquidity { market } => {
                write!(f, "no book liquidity for {}", market)
            }
            LiquidityError::NoTrades { market } => {
                write!(f, "no recent trades for {}", market)
            }
        }
    }
}

impl std::error::Error for LiquidityError {}

#[derive(Debug, Clone, Copy)]
pub struct TradeDetails {
    pub mid_price: f64,
    pub stop_loss: f64,
    pub quantity: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct TradeLiquidity {
    pub avg_size: f64,
    pub latest_price: f64,
}

fn best_level(levels: &[BookLevel], side: BookSide) -> Option<f64> {
    let prices = levels.iter().filter(|l| l.side == side).map(|l| l.price);
    match side {
        // best bid is the highest, best ask the lowest
        BookSide::Bid => prices.max_by(|a, b| a.total_cmp(b)),
        BookSide::Ask => prices.min_by(|a, b| a.total_cmp(b)),
    }
}

/// Quote for an entry on one leg: reference price, protective stop and the
/// base quantity the capital buys at that price.
///
/// Both book sides must be populated; a one-sided book is degenerate and is
/// never quoted against, whichever side the entry needs. A buy is priced off
/// the best bid and a sell off the best ask, so resting limit entries sit
/// inside the spread instead of crossing it. The stop sits `stop_loss_pct`
/// below the price for a buy and above it for a sell.
pub fn trade_details(
    market: &str,
    levels: &[BookLevel],
    side: OrderSide,
    capital: f64,
    stop_loss_pct: f64,
) -> Result<TradeDetails, LiquidityError> {
    let (Some(best_bid), Some(best_ask)) = (
        best_level(levels, BookSide::Bid),
        best_level(levels, BookSide::Ask),
    ) else {
        return Err(LiquidityError::NoLiquidity {
            market: market.to_string(),
        });
    };
    let mid_price = match side {
        OrderSide::Buy => best_bid,
        OrderSide::Sell => best_ask,
    };

    let stop_loss = match side {
        OrderSide::Buy => mid_price * (1.0 - stop_loss_pct),
        OrderSide::Sell => mid_price * (1.0 + stop_loss_pct),
    };
    let quantity = if mid_price > 0.0 {
        capital / mid_price
    } else {
        0.0
    };
    Ok(TradeDetails {
        mid_price,
        stop_loss,
        quantity,
    })
}

/// Average trade size and latest trade price over the replicated trade list.
/// `trades` is expected newest first, as the replica returns it.
pub fn trade_liquidity(market: &str, trades: &[TradeRow]) -> Result<TradeLiquidity, LiquidityError> {
    let Some(latest) = trades.first() else {
        return Err(LiquidityError::NoTrades {
            market: market.to_string(),
        });
    };
    let total: f64 = trades.iter().map(|t| t.size).sum();
    Ok(TradeLiquidity {
        avg_size: total / trades.len() as f64,
        latest_price: latest.price,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(side: BookSide, price: f64, size: f64) -> BookLevel {
        BookLevel {
            side,
            price,
            size,
            offset: 1,
        }
    }

    fn book() -> Vec<BookLevel> {
        vec![
            level(BookSide::Bid, 99.0, 1.0),
            level(BookSide::Bid, 100.0, 2.0),
            level(BookSide::Ask, 101.0, 1.5),
            level(BookSide::Ask, 102.0, 3.0),
        ]
    }

    #[test]
    fn buy_quotes_off_best_bid() {
        let details = trade_details("BTC-USD", &book(), OrderSide::Buy, 500.0, 0.15).unwrap();
        assert_eq!(details.mid_price, 100.0);
        assert_eq!(details.quantity, 5.0);
        assert!((details.stop_loss - 85.0).abs() < 1e-9);
    }

    #[test]
    fn sell_quotes_off_best_ask_with_stop_above() {
        let details = trade_details("BTC-USD", &book(), OrderSide::Sell, 505.0, 0.15).unwrap();
        assert_eq!(details.mid_price, 101.0);
        assert_eq!(details.quantity, 5.0);
        assert!((details.stop_loss - 116.15).abs() < 1e-9);
    }

    #[test]
    fn empty_side_is_a_liquidity_error() {
        let asks_only = vec![level(BookSide::Ask, 101.0, 1.0)];
        let bids_only = vec![level(BookSide::Bid, 100.0, 1.0)];
        // either empty partition rejects the quote, whichever side is asked
        for book in [&asks_only, &bids_only] {
            for side in [OrderSide::Buy, OrderSide::Sell] {
                let err = trade_details("BTC-USD", book, side, 100.0, 0.15).unwrap_err();
                assert!(matches!(err, LiquidityError::NoLiquidity { .. }));
            }
        }
    }

    #[test]
    fn trade_liquidity_averages_sizes_and_takes_latest_price() {
        let trades = vec![
            TradeRow {
                side: "BUY".to_string(),
                size: 2.0,
                price: 105.0,
                created_at: "2023-01-01T00:00:02Z".to_string(),
            },
            TradeRow {
                side: "SELL".to_string(),
                size: 4.0,
                price: 104.0,
                created_at: "2023-01-01T00:00:01Z".to_string(),
            },
        ];
        let liquidity = trade_liquidity("BTC-USD", &trades).unwrap();
        assert_eq!(liquidity.avg_size, 3.0);
        assert_eq!(liquidity.latest_price, 105.0);
    }

    #[test]
    fn no_trades_is_an_error() {
        let err = trade_liquidity("BTC-USD", &[]).unwrap_err();
        assert!(matches!(err, LiquidityError::NoTrades { .. }));
    }
}
