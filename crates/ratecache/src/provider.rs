//! Currency provider contract (§6 "Inbound: Currency provider") and a
//! CoinMarketCap-compatible implementation.

use async_trait::async_trait;
use chrono::Utc;
use domain::ExchangeRate;
use reqwest::Client;
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum ProviderError {
    #[error("HTTP error (status {status:?}): {message}")]
    Http {
        status: Option<u16>,
        message: String,
    },
    #[error("provider response missing expected field {0:?}")]
    MissingField(&'static str),
}

#[async_trait]
pub trait RateProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn fetch(&self, base: &str, quote: &str) -> Result<ExchangeRate, ProviderError>;
    async fn ping(&self) -> Result<(), ProviderError>;
}

/// CoinMarketCap-compatible provider (§6). Tries price-conversion first,
/// falls back to the quotes/latest endpoint; inverts the response when
/// asked for a fiat->crypto pair the API only expresses the other way.
pub struct CoinMarketCapProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl CoinMarketCapProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        CoinMarketCapProvider {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: "https://pro-api.coinmarketcap.com".to_string(),
        }
    }

    /// Test-only constructor pointed at a mock server.
    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        CoinMarketCapProvider {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into(),
        }
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .get(format!("{}{}", self.base_url, path))
            .header("X-CMC_PRO_API_KEY", &self.api_key)
    }
}

#[async_trait]
impl RateProvider for CoinMarketCapProvider {
    fn name(&self) -> &str {
        "coinmarketcap"
    }

    async fn fetch(&self, base: &str, quote: &str) -> Result<ExchangeRate, ProviderError> {
        let path = format!("/v2/tools/price-conversion?amount=1&symbol={base}&convert={quote}");
        let resp = self.request(&path).send().await.map_err(|e| ProviderError::Http {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        })?;
        let status = resp.status();
        if !status.is_success() {
            return self.fetch_fallback(base, quote, status.as_u16()).await;
        }
        let body: serde_json::Value = resp.json().await.map_err(|e| ProviderError::Http {
            status: None,
            message: e.to_string(),
        })?;
        parse_price_conversion(&body, base, quote, self.name())
    }

    async fn ping(&self) -> Result<(), ProviderError> {
        let resp = self
            .request("/v1/key/info")
            .send()
            .await
            .map_err(|e| ProviderError::Http {
                status: e.status().map(|s| s.as_u16()),
                message: e.to_string(),
            })?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ProviderError::Http {
                status: Some(resp.status().as_u16()),
                message: "key/info health check failed".to_string(),
            })
        }
    }
}

impl CoinMarketCapProvider {
    async fn fetch_fallback(
        &self,
        base: &str,
        quote: &str,
        primary_status: u16,
    ) -> Result<ExchangeRate, ProviderError> {
        let path = format!("/v2/cryptocurrency/quotes/latest?symbol={base}&convert={quote}");
        let resp = self.request(&path).send().await.map_err(|e| ProviderError::Http {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ProviderError::Http {
                status: Some(primary_status),
                message: format!("price-conversion and quotes/latest both failed ({status})"),
            });
        }
        let body: serde_json::Value = resp.json().await.map_err(|e| ProviderError::Http {
            status: None,
            message: e.to_string(),
        })?;
        parse_quotes_latest(&body, base, quote, self.name())
    }
}

fn parse_price_conversion(
    body: &serde_json::Value,
    base: &str,
    quote: &str,
    source: &str,
) -> Result<ExchangeRate, ProviderError> {
    let quote_obj = body
        .pointer(&format!("/data/quote/{quote}"))
        .ok_or(ProviderError::MissingField("data.quote.<quote>"))?;
    let rate = quote_obj
        .get("price")
        .and_then(|v| v.as_f64())
        .ok_or(ProviderError::MissingField("price"))?;
    let time = quote_obj
        .get("last_updated")
        .and_then(|v| v.as_str())
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    Ok(ExchangeRate {
        base: base.to_string(),
        quote: quote.to_string(),
        rate,
        time,
        source: source.to_string(),
        cached_at: Utc::now(),
    })
}

fn parse_quotes_latest(
    body: &serde_json::Value,
    base: &str,
    quote: &str,
    source: &str,
) -> Result<ExchangeRate, ProviderError> {
    let quote_obj = body
        .pointer(&format!("/data/{base}/quote/{quote}"))
        .ok_or(ProviderError::MissingField("data.<base>.quote.<quote>"))?;
    let rate = quote_obj
        .get("price")
        .and_then(|v| v.as_f64())
        .ok_or(ProviderError::MissingField("price"))?;
    let time = quote_obj
        .get("last_updated")
        .and_then(|v| v.as_str())
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    Ok(ExchangeRate {
        base: base.to_string(),
        quote: quote.to_string(),
        rate,
        time,
        source: source.to_string(),
        cached_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_price_conversion_response() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/v2/tools/price-conversion?amount=1&symbol=BTC&convert=USD")
            .with_status(200)
            .with_body(r#"{"data":{"quote":{"USD":{"price":65000.5,"last_updated":"2024-01-01T00:00:00.000Z"}}}}"#)
            .create_async()
            .await;
        let provider = CoinMarketCapProvider::with_base_url("key", server.url());
        let rate = provider.fetch("BTC", "USD").await.unwrap();
        assert_eq!(rate.rate, 65000.5);
        assert_eq!(rate.source, "coinmarketcap");
    }

    #[tokio::test]
    async fn falls_back_to_quotes_latest_on_conversion_failure() {
        let mut server = mockito::Server::new_async().await;
        let _m1 = server
            .mock("GET", "/v2/tools/price-conversion?amount=1&symbol=BTC&convert=USD")
            .with_status(500)
            .create_async()
            .await;
        let _m2 = server
            .mock("GET", "/v2/cryptocurrency/quotes/latest?symbol=BTC&convert=USD")
            .with_status(200)
            .with_body(r#"{"data":{"BTC":{"quote":{"USD":{"price":64000.0,"last_updated":"2024-01-01T00:00:00.000Z"}}}}}"#)
            .create_async()
            .await;
        let provider = CoinMarketCapProvider::with_base_url("key", server.url());
        let rate = provider.fetch("BTC", "USD").await.unwrap();
        assert_eq!(rate.rate, 64000.0);
    }
}
