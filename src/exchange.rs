//! Typed REST client for the exchange.
//!
//! Order placement, cancellation and the startup reads all go through the
//! `ExchangeClient` trait so the trader can be driven by a stub in tests.
//! Request signing is HMAC-SHA256 over `timestamp + method + path + body`
//! with a base64url-encoded key, matching the exchange's private API.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;

use crate::feed::ACCOUNTS_CHANNEL;

/// FOK orders only need to outlive their immediate match window.
pub const MARKET_ORDER_EXPIRY_SECS: i64 = 70;
pub const LIMIT_ORDER_EXPIRY_HOURS: i64 = 24;
pub const STOP_MARKET_LIMIT_FEE: &str = "0.000500";
const DEFAULT_LIMIT_FEE: &str = "0.001000";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    pub fn opposite(&self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Market,
    Limit,
    StopMarket,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::StopMarket => "STOP_MARKET",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeInForce {
    Fok,
    Gtt,
}

impl TimeInForce {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeInForce::Fok => "FOK",
            TimeInForce::Gtt => "GTT",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub market: String,
    pub side: OrderSide,
    pub kind: OrderType,
    pub size: f64,
    pub price: f64,
    pub trigger_price: Option<f64>,
    pub time_in_force: TimeInForce,
    pub post_only: bool,
    pub limit_fee: String,
    pub expiration: DateTime<Utc>,
    pub reduce_only: bool,
}

impl OrderRequest {
    /// Immediate-or-nothing entry at the current mid.
    pub fn market_entry(market: &str, side: OrderSide, size: f64, price: f64) -> Self {
        Self {
            market: market.to_string(),
            side,
            kind: OrderType::Market,
            size,
            price,
            trigger_price: None,
            time_in_force: TimeInForce::Fok,
            post_only: false,
            limit_fee: DEFAULT_LIMIT_FEE.to_string(),
            expiration: Utc::now() + ChronoDuration::seconds(MARKET_ORDER_EXPIRY_SECS),
            reduce_only: false,
        }
    }

    /// Resting entry at the mid, good for a day.
    pub fn limit_entry(market: &str, side: OrderSide, size: f64, price: f64) -> Self {
        Self {
            market: market.to_string(),
            side,
            kind: OrderType::Limit,
            size,
            price,
            trigger_price: None,
            time_in_force: TimeInForce::Gtt,
            post_only: false,
            limit_fee: DEFAULT_LIMIT_FEE.to_string(),
            expiration: Utc::now() + ChronoDuration::hours(LIMIT_ORDER_EXPIRY_HOURS),
            reduce_only: false,
        }
    }

    /// Protective stop paired with a market entry. Always reduce-only so it
    /// can never increase exposure.
    pub fn stop_market(market: &str, side: OrderSide, size: f64, trigger_price: f64) -> Self {
        Self {
            market: market.to_string(),
            side,
            kind: OrderType::StopMarket,
            size,
            price: 1.0,
            trigger_price: Some(trigger_price),
            time_in_force: TimeInForce::Fok,
            post_only: false,
            limit_fee: STOP_MARKET_LIMIT_FEE.to_string(),
            expiration: Utc::now() + ChronoDuration::seconds(MARKET_ORDER_EXPIRY_SECS),
            reduce_only: true,
        }
    }

    /// Reduce-only market order that flattens an open position.
    pub fn market_close(market: &str, side: OrderSide, size: f64, price: f64) -> Self {
        Self {
            reduce_only: true,
            ..Self::market_entry(market, side, size, price)
        }
    }
}

#[derive(Debug, Clone)]
pub struct MarketInfo {
    pub name: String,
    pub status: String,
    pub index_price: f64,
}

#[derive(Debug, Clone)]
pub struct Candle {
    pub close: f64,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct AccountInfo {
    pub id: String,
    pub position_id: String,
    pub quote_balance: f64,
}

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: String,
}

#[derive(Debug)]
pub enum ExchangeError {
    Http(reqwest::Error),
    Rejected { status: u16, body: String },
    Other(String),
}

impl fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeError::Http(err) => write!(f, "exchange request failed: {}", err),
            ExchangeError::Rejected { status, body } => {
                write!(f, "exchange rejected request ({}): {}", status, body)
            }
            ExchangeError::Other(msg) => write!(f, "exchange error: {}", msg),
        }
    }
}

impl std::error::Error for ExchangeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExchangeError::Http(err) => Some(err),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        ExchangeError::Http(err)
    }
}

#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn get_markets(&self) -> Result<Vec<MarketInfo>, ExchangeError>;
    async fn get_candles(&self, market: &str, limit: usize) -> Result<Vec<Candle>, ExchangeError>;
    async fn get_account(&self) -> Result<AccountInfo, ExchangeError>;
    async fn create_order(&self, request: &OrderRequest) -> Result<OrderAck, ExchangeError>;
    async fn cancel_active_orders(&self, market: &str) -> Result<(), ExchangeError>;
    /// Signed subscribe payload for the private account feed channel.
    fn account_subscription(&self) -> serde_json::Value;
}

#[derive(Debug, Clone)]
pub struct ApiCredentials {
    pub key: String,
    pub secret: String,
    pub passphrase: String,
}

pub struct HttpExchangeClient {
    http: reqwest::Client,
    base_url: String,
    credentials: ApiCredentials,
    resolution: String,
    position_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarketPayload {
    status: String,
    #[serde(default)]
    index_price: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MarketsResponse {
    markets: HashMap<String, MarketPayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CandlePayload {
    close: String,
    updated_at: String,
}

#[derive(Debug, Deserialize)]
struct CandlesResponse {
    candles: Vec<CandlePayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountPayload {
    id: String,
    position_id: String,
    quote_balance: String,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    account: AccountPayload,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    order: OrderIdPayload,
}

#[derive(Debug, Deserialize)]
struct OrderIdPayload {
    id: String,
}

fn parse_decimal_field(field: &str, raw: &str) -> Result<f64, ExchangeError> {
    raw.parse::<f64>()
        .map_err(|_| ExchangeError::Other(format!("unparsable {} value {:?}", field, raw)))
}

/// Quantizes a size for the wire; truncates so we never round exposure up.
pub fn format_size(size: f64) -> String {
    Decimal::from_f64(size)
        .map(|d| {
            d.round_dp_with_strategy(6, RoundingStrategy::ToZero)
                .normalize()
                .to_string()
        })
        .unwrap_or_else(|| size.to_string())
}

pub fn format_price(price: f64) -> String {
    Decimal::from_f64(price)
        .map(|d| d.round_dp(6).normalize().to_string())
        .unwrap_or_else(|| price.to_string())
}

/// Stop triggers are coarser than prices on the order endpoint.
pub fn format_trigger_price(price: f64) -> String {
    Decimal::from_f64(price)
        .map(|d| d.round_dp(1).to_string())
        .unwrap_or_else(|| price.to_string())
}

impl HttpExchangeClient {
    /// Connects and resolves the position id the order endpoints require.
    pub async fn connect(
        base_url: &str,
        credentials: ApiCredentials,
        resolution: &str,
    ) -> Result<Self, ExchangeError> {
        let mut client = Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            resolution: resolution.to_string(),
            position_id: String::new(),
        };
        let account = client.get_account().await?;
        client.position_id = account.position_id;
        Ok(client)
    }

    fn sign(&self, method: &str, path: &str, timestamp: &str, body: &str) -> Result<String, ExchangeError> {
        let key = URL_SAFE
            .decode(&self.credentials.secret)
            .map_err(|err| ExchangeError::Other(format!("invalid api secret: {}", err)))?;
        let mut mac = <Hmac<Sha256> as KeyInit>::new_from_slice(&key)
            .map_err(|err| ExchangeError::Other(format!("invalid hmac key: {}", err)))?;
        mac.update(format!("{}{}{}{}", timestamp, method, path, body).as_bytes());
        Ok(URL_SAFE.encode(mac.finalize().into_bytes()))
    }

    async fn private_request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response, ExchangeError> {
        let timestamp = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let raw_body = body
            .as_ref()
            .map(|b| b.to_string())
            .unwrap_or_default();
        let signature = self.sign(method.as_str(), path, &timestamp, &raw_body)?;

        let mut request = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .header("DYDX-API-KEY", &self.credentials.key)
            .header("DYDX-SIGNATURE", signature)
            .header("DYDX-TIMESTAMP", timestamp)
            .header("DYDX-PASSPHRASE", &self.credentials.passphrase);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExchangeError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ExchangeClient for HttpExchangeClient {
    async fn get_markets(&self) -> Result<Vec<MarketInfo>, ExchangeError> {
        let response: MarketsResponse = self
            .http
            .get(format!("{}/v3/markets", self.base_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let mut markets = Vec::with_capacity(response.markets.len());
        for (name, payload) in response.markets {
            let index_price = match payload.index_price.as_deref() {
                Some(raw) if !raw.is_empty() => parse_decimal_field("indexPrice", raw)?,
                _ => 0.0,
            };
            markets.push(MarketInfo {
                name,
                status: payload.status,
                index_price,
            });
        }
        Ok(markets)
    }

    async fn get_candles(&self, market: &str, limit: usize) -> Result<Vec<Candle>, ExchangeError> {
        let response: CandlesResponse = self
            .http
            .get(format!("{}/v3/candles/{}", self.base_url, market))
            .query(&[("resolution", self.resolution.as_str())])
            .query(&[("limit", limit)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let mut candles = Vec::with_capacity(response.candles.len());
        for payload in response.candles {
            candles.push(Candle {
                close: parse_decimal_field("close", &payload.close)?,
                updated_at: payload.updated_at,
            });
        }
        // the feed returns newest first; callers want chronological order
        candles.reverse();
        Ok(candles)
    }

    async fn get_account(&self) -> Result<AccountInfo, ExchangeError> {
        let response: AccountResponse = self
            .private_request(reqwest::Method::GET, "/v3/accounts", None)
            .await?
            .json()
            .await?;
        Ok(AccountInfo {
            id: response.account.id,
            position_id: response.account.position_id,
            quote_balance: parse_decimal_field("quoteBalance", &response.account.quote_balance)?,
        })
    }

    async fn create_order(&self, request: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        let client_id = Utc::now().timestamp_nanos_opt().unwrap_or_default().to_string();
        let mut body = json!({
            "market": request.market,
            "side": request.side.as_str(),
            "type": request.kind.as_str(),
            "timeInForce": request.time_in_force.as_str(),
            "size": format_size(request.size),
            "price": format_price(request.price),
            "postOnly": request.post_only,
            "limitFee": request.limit_fee,
            "expiration": request.expiration.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            "reduceOnly": request.reduce_only,
            "positionId": self.position_id,
            "clientId": client_id,
        });
        if let Some(trigger) = request.trigger_price {
            body["triggerPrice"] = json!(format_trigger_price(trigger));
        }
        let response: OrderResponse = self
            .private_request(reqwest::Method::POST, "/v3/orders", Some(body))
            .await?
            .json()
            .await?;
        log::info!(
            "[ORDER] submitted {} {} {} on {} (id {})",
            request.kind.as_str(),
            request.side.as_str(),
            format_size(request.size),
            request.market,
            response.order.id
        );
        Ok(OrderAck {
            order_id: response.order.id,
        })
    }

    async fn cancel_active_orders(&self, market: &str) -> Result<(), ExchangeError> {
        let path = format!("/v3/orders?market={}", market);
        self.private_request(reqwest::Method::DELETE, &path, None)
            .await?;
        log::info!("[ORDER] canceled active orders on {}", market);
        Ok(())
    }

    fn account_subscription(&self) -> serde_json::Value {
        let timestamp = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let signature = self
            .sign("GET", "/ws/accounts", &timestamp, "")
            .unwrap_or_default();
        json!({
            "type": "subscribe",
            "channel": ACCOUNTS_CHANNEL,
            "accountNumber": "0",
            "apiKey": self.credentials.key,
            "signature": signature,
            "timestamp": timestamp,
            "passphrase": self.credentials.passphrase,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn size_formatting_truncates_and_strips_zeros() {
        assert_eq!(format_size(0.1234567), "0.123456");
        assert_eq!(format_size(2.5), "2.5");
        assert_eq!(format_size(3.0), "3");
        assert_eq!(
            Decimal::from_f64(0.1234567)
                .unwrap()
                .round_dp_with_strategy(6, RoundingStrategy::ToZero),
            dec!(0.123456)
        );
    }

    #[test]
    fn trigger_prices_round_to_one_decimal() {
        assert_eq!(format_trigger_price(102.3456), "102.3");
        assert_eq!(format_trigger_price(99.95), "100.0");
    }

    #[test]
    fn market_entry_is_fok_with_short_expiry() {
        let request = OrderRequest::market_entry("BTC-USD", OrderSide::Buy, 1.0, 100.0);
        assert_eq!(request.kind, OrderType::Market);
        assert_eq!(request.time_in_force, TimeInForce::Fok);
        assert!(!request.reduce_only);
        let ttl = request.expiration - Utc::now();
        assert!(ttl <= ChronoDuration::seconds(MARKET_ORDER_EXPIRY_SECS));
        assert!(ttl > ChronoDuration::seconds(MARKET_ORDER_EXPIRY_SECS - 5));
    }

    #[test]
    fn stop_market_is_reduce_only_with_trigger() {
        let request = OrderRequest::stop_market("BTC-USD", OrderSide::Sell, 1.0, 85.0);
        assert_eq!(request.kind, OrderType::StopMarket);
        assert_eq!(request.trigger_price, Some(85.0));
        assert!(request.reduce_only);
        assert_eq!(request.limit_fee, STOP_MARKET_LIMIT_FEE);
    }

    #[test]
    fn market_close_flattens_without_adding_exposure() {
        let request = OrderRequest::market_close("ETH-USD", OrderSide::Sell, 2.0, 2000.0);
        assert_eq!(request.kind, OrderType::Market);
        assert!(request.reduce_only);
        assert_eq!(request.side, OrderSide::Sell);
    }

    #[test]
    fn opposite_sides() {
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
        assert_eq!(OrderSide::Sell.opposite(), OrderSide::Buy);
    }
}
