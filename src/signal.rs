//! Z-score signal evaluation against the external cointegration service.
//!
//! The service owns the statistics; this module only assembles the two close
//! series, splices the live mid price over the most recent close, and reads
//! the last z-score back out of the response.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::replica::ReplicaStore;

#[derive(Debug)]
pub enum SignalError {
    /// No candle history replicated for the market yet.
    EmptySeries { market: String },
    /// The service answered but the latest z-score slot is null.
    NotReady,
    /// Transport or non-success response from the service.
    Service(String),
    Internal(String),
}

impl fmt::Display for SignalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalError::EmptySeries { market } => {
                write!(f, "no price series for {}", market)
            }
            SignalError::NotReady => write!(f, "latest z-score is not ready"),
            SignalError::Service(msg) => write!(f, "cointegration service error: {}", msg),
            SignalError::Internal(msg) => write!(f, "signal evaluation failed: {}", msg),
        }
    }
}

impl std::error::Error for SignalError {}

#[derive(Debug, Serialize)]
struct CointRequest<'a> {
    series1: &'a [f64],
    series2: &'a [f64],
    window: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CointResult {
    pub coint_flag: bool,
    pub p_value: f64,
    pub t_value: f64,
    pub critical_value: f64,
    pub hedge_ratio: f64,
    pub zero_crossing: u32,
    /// Rolling z-scores; leading slots are null until the window fills.
    pub zscore_list: Vec<Option<f64>>,
}

pub struct CointClient {
    http: reqwest::Client,
    base_url: String,
    window: usize,
}

impl CointClient {
    pub fn new(base_url: &str, window: usize) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            window,
        }
    }

    pub async fn calculate(
        &self,
        series1: &[f64],
        series2: &[f64],
    ) -> Result<CointResult, SignalError> {
        let response = self
            .http
            .post(format!("{}/calculate_cointegration", self.base_url))
            .json(&CointRequest {
                series1,
                series2,
                window: self.window,
            })
            .send()
            .await
            .map_err(|err| SignalError::Service(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SignalError::Service(format!("{}: {}", status, body)));
        }
        response
            .json()
            .await
            .map_err(|err| SignalError::Service(err.to_string()))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ZscoreSignal {
    pub zscore: f64,
}

impl ZscoreSignal {
    pub fn sign_positive(&self) -> bool {
        self.zscore > 0.0
    }
}

/// Seam between the trader and the signal pipeline.
#[async_trait]
pub trait SignalSource: Send + Sync {
    async fn latest_zscore(
        &self,
        market_a: &str,
        market_b: &str,
        mid_a: f64,
        mid_b: f64,
    ) -> Result<ZscoreSignal, SignalError>;
}

pub struct SignalEvaluator {
    store: Arc<ReplicaStore>,
    coint: CointClient,
}

/// Replaces the most recent close with the live mid so the last z-score
/// reflects current prices instead of the last full candle.
fn splice_live_price(series: &mut Vec<f64>, live: f64) {
    series.pop();
    series.push(live);
}

impl SignalEvaluator {
    pub fn new(store: Arc<ReplicaStore>, coint: CointClient) -> Self {
        Self { store, coint }
    }

    async fn close_series(&self, market: &str, live_mid: f64) -> Result<Vec<f64>, SignalError> {
        let row = self
            .store
            .market_by_name(market)
            .await
            .map_err(|err| SignalError::Internal(err.to_string()))?
            .ok_or_else(|| SignalError::EmptySeries {
                market: market.to_string(),
            })?;
        let mut series = self
            .store
            .close_series(row.id)
            .await
            .map_err(|err| SignalError::Internal(err.to_string()))?;
        if series.is_empty() {
            return Err(SignalError::EmptySeries {
                market: market.to_string(),
            });
        }
        splice_live_price(&mut series, live_mid);
        Ok(series)
    }
}

#[async_trait]
impl SignalSource for SignalEvaluator {
    async fn latest_zscore(
        &self,
        market_a: &str,
        market_b: &str,
        mid_a: f64,
        mid_b: f64,
    ) -> Result<ZscoreSignal, SignalError> {
        let series_a = self.close_series(market_a, mid_a).await?;
        let series_b = self.close_series(market_b, mid_b).await?;
        let result = self.coint.calculate(&series_a, &series_b).await?;
        match result.zscore_list.last().copied().flatten() {
            Some(zscore) => {
                log::debug!(
                    "[SIGNAL] z-score {:.4} ({} vs {})",
                    zscore,
                    market_a,
                    market_b
                );
                Ok(ZscoreSignal { zscore })
            }
            None => Err(SignalError::NotReady),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splice_replaces_the_latest_close() {
        let mut series = vec![1.0, 2.0, 3.0];
        splice_live_price(&mut series, 9.0);
        assert_eq!(series, vec![1.0, 2.0, 9.0]);
    }

    #[test]
    fn splice_on_single_element_keeps_length_one() {
        let mut series = vec![5.0];
        splice_live_price(&mut series, 6.0);
        assert_eq!(series, vec![6.0]);
    }

    #[test]
    fn coint_result_parses_nulls_in_zscore_list() {
        let raw = r#"{
            "cointFlag": true,
            "pValue": 0.02,
            "tValue": -3.1,
            "criticalValue": -2.9,
            "hedgeRatio": 1.4,
            "zeroCrossing": 12,
            "zscoreList": [null, null, 0.5, -1.2]
        }"#;
        let result: CointResult = serde_json::from_str(raw).unwrap();
        assert!(result.coint_flag);
        assert_eq!(result.zscore_list.len(), 4);
        assert_eq!(result.zscore_list.last().copied().flatten(), Some(-1.2));
    }

    #[test]
    fn trailing_null_means_not_ready() {
        let list: Vec<Option<f64>> = vec![Some(0.5), None];
        assert_eq!(list.last().copied().flatten(), None);
    }

    #[tokio::test]
    async fn empty_candle_history_is_an_error() {
        let store = Arc::new(ReplicaStore::in_memory().unwrap());
        store.upsert_market("BTC-USD", None, 0.0).await.unwrap();
        let evaluator = SignalEvaluator::new(store, CointClient::new("http://localhost:8000", 21));
        let err = evaluator.close_series("BTC-USD", 100.0).await.unwrap_err();
        assert!(matches!(err, SignalError::EmptySeries { .. }));
    }

    #[test]
    fn sign_is_positive_only_above_zero() {
        assert!(ZscoreSignal { zscore: 1.2 }.sign_positive());
        assert!(!ZscoreSignal { zscore: -0.3 }.sign_positive());
        assert!(!ZscoreSignal { zscore: 0.0 }.sign_positive());
    }
}
