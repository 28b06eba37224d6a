use crate::config::ExchangeSettings;
use crate::error::EngineError;
use crate::models::{Candle, OrderSide};
use crate::retry::retry_with_backoff;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Filled,
    Accepted,
    Rejected,
}

#[derive(Debug, Clone)]
pub struct OrderReceipt {
    pub order_id: String,
    pub status: OrderStatus,
    pub filled_price: Option<f64>,
}

impl OrderReceipt {
    pub fn is_success(&self) -> bool {
        matches!(self.status, OrderStatus::Filled | OrderStatus::Accepted)
    }
}

/// Boundary to the exchange. Implemented over HTTP in production and
/// by scripted clients in tests.
#[async_trait]
pub trait MarketClient: Send + Sync {
    async fn get_candles(
        &self,
        instrument: &str,
        timeframe: &str,
        count: usize,
    ) -> Result<Vec<Candle>, EngineError>;

    async fn get_ticker(&self, instrument: &str) -> Result<f64, EngineError>;

    async fn place_market_order(
        &self,
        instrument: &str,
        side: OrderSide,
        size: f64,
    ) -> Result<OrderReceipt, EngineError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CandleDto {
    timestamp: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerDto {
    price: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderDto {
    order_id: String,
    status: String,
    #[serde(default)]
    filled_price: Option<f64>,
}

pub struct HttpMarketClient {
    http: Client,
    base_url: String,
    max_retries: u32,
}

impl HttpMarketClient {
    pub fn new(settings: &ExchangeSettings) -> Result<Self, EngineError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(|err| EngineError::MarketData(format!("cannot build http client: {}", err)))?;
        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            max_retries: settings.max_retries.max(1),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, EngineError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| EngineError::MarketData(format!("GET {} failed: {}", url, err)))?;
        if !response.status().is_success() {
            return Err(EngineError::MarketData(format!(
                "GET {} returned status {}",
                url,
                response.status()
            )));
        }
        response
            .json::<T>()
            .await
            .map_err(|err| EngineError::MarketData(format!("GET {} bad payload: {}", url, err)))
    }
}

#[async_trait]
impl MarketClient for HttpMarketClient {
    async fn get_candles(
        &self,
        instrument: &str,
        timeframe: &str,
        count: usize,
    ) -> Result<Vec<Candle>, EngineError> {
        let url = format!(
            "{}/candles/{}?timeframe={}&count={}",
            self.base_url, instrument, timeframe, count
        );
        let dtos: Vec<CandleDto> = retry_with_backoff!(
            format!("candles {}", instrument),
            self.max_retries,
            self.get_json::<Vec<CandleDto>>(&url)
        )?;
        Ok(dtos
            .into_iter()
            .map(|dto| Candle {
                instrument: instrument.to_string(),
                timestamp: dto.timestamp,
                open: dto.open,
                high: dto.high,
                low: dto.low,
                close: dto.close,
                volume: dto.volume,
            })
            .collect())
    }

    async fn get_ticker(&self, instrument: &str) -> Result<f64, EngineError> {
        let url = format!("{}/ticker/{}", self.base_url, instrument);
        let dto: TickerDto = retry_with_backoff!(
            format!("ticker {}", instrument),
            self.max_retries,
            self.get_json::<TickerDto>(&url)
        )?;
        if !dto.price.is_finite() || dto.price <= 0.0 {
            return Err(EngineError::MarketData(format!(
                "ticker {} returned unusable price {}",
                instrument, dto.price
            )));
        }
        Ok(dto.price)
    }

    async fn place_market_order(
        &self,
        instrument: &str,
        side: OrderSide,
        size: f64,
    ) -> Result<OrderReceipt, EngineError> {
        let url = format!("{}/orders", self.base_url);
        let body = serde_json::json!({
            "instrument": instrument,
            "side": side.as_str(),
            "type": "market",
            "size": size,
        });

        // No automatic resubmit: a submit timeout may mean the order
        // reached the exchange, and a second attempt could double-fill.
        // The intent dies with the cycle either way.
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|err| EngineError::OrderExecution {
                instrument: instrument.to_string(),
                reason: format!("submit failed: {}", err),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            warn!(
                "Order submit for {} rejected: status={} body={}",
                instrument, status, detail
            );
            return Err(EngineError::OrderExecution {
                instrument: instrument.to_string(),
                reason: format!("status {}", status),
            });
        }

        let dto: OrderDto =
            response
                .json()
                .await
                .map_err(|err| EngineError::OrderExecution {
                    instrument: instrument.to_string(),
                    reason: format!("bad order payload: {}", err),
                })?;

        let status = match dto.status.to_ascii_lowercase().as_str() {
            "filled" | "done" => OrderStatus::Filled,
            "accepted" | "new" | "pending" => OrderStatus::Accepted,
            _ => OrderStatus::Rejected,
        };

        Ok(OrderReceipt {
            order_id: dto.order_id,
            status,
            filled_price: dto.filled_price,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receipt_success_covers_filled_and_accepted() {
        let filled = OrderReceipt {
            order_id: "1".to_string(),
            status: OrderStatus::Filled,
            filled_price: Some(10.0),
        };
        let rejected = OrderReceipt {
            order_id: "2".to_string(),
            status: OrderStatus::Rejected,
            filled_price: None,
        };
        assert!(filled.is_success());
        assert!(!rejected.is_success());
    }

    #[tokio::test]
    async fn unreachable_exchange_surfaces_market_data_error() {
        let client = HttpMarketClient::new(&ExchangeSettings {
            base_url: "http://127.0.0.1:1".to_string(),
            request_timeout_secs: 1,
            max_retries: 1,
        })
        .unwrap();
        let err = client.get_ticker("BTC").await.unwrap_err();
        assert!(matches!(err, EngineError::MarketData(_)));
    }
}
