//! Client side of the accrual calculator's polling contract.

use crate::utils::rate_limiter::ThrottleSignal;
use async_trait::async_trait;
use loyalty_sdk::objects::AccrualResponse;
use reqwest::StatusCode;
use reqwest::header::RETRY_AFTER;
use rust_decimal::Decimal;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Result of one poll that reached the upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccrualPoll {
    Ready(AccrualResponse),
    Throttled(ThrottleSignal),
    /// Any other status.
    Rejected { status: u16 },
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP request error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed accrual response: {0}")]
    Malformed(String),

    #[error("accrual base url cannot carry a path: {0}")]
    InvalidBaseUrl(Url),
}

impl SourceError {
    /// Transport-level failures are retried without consuming retry budget.
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Transport(_) | SourceError::Timeout(_))
    }
}

#[async_trait]
pub trait AccrualSource: Send + Sync {
    async fn poll(&self, order_number: &str) -> Result<AccrualPoll, SourceError>;
}

/// Decode a `200` body. Negative awards are rejected.
pub fn decode_accrual(body: &[u8]) -> Result<AccrualResponse, SourceError> {
    let response: AccrualResponse =
        serde_json::from_slice(body).map_err(|e| SourceError::Malformed(e.to_string()))?;
    if response.accrual < Decimal::ZERO {
        return Err(SourceError::Malformed(format!(
            "negative accrual {} for order {}",
            response.accrual, response.order
        )));
    }
    Ok(response)
}

pub struct HttpAccrualSource {
    base_url: Url,
    timeout: Duration,
    http_client: reqwest::Client,
}

impl HttpAccrualSource {
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self, SourceError> {
        if base_url.cannot_be_a_base() {
            return Err(SourceError::InvalidBaseUrl(base_url));
        }
        Ok(Self {
            base_url,
            timeout,
            http_client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }

    /// `{base}/api/orders/{number}`, with the number as a single escaped segment.
    pub fn order_url(&self, order_number: &str) -> Result<Url, SourceError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SourceError::InvalidBaseUrl(self.base_url.clone()))?
            .pop_if_empty()
            .extend(["api", "orders", order_number]);
        Ok(url)
    }
}

#[async_trait]
impl AccrualSource for HttpAccrualSource {
    async fn poll(&self, order_number: &str) -> Result<AccrualPoll, SourceError> {
        let url = self.order_url(order_number)?;
        let timed_out = |e: reqwest::Error| {
            if e.is_timeout() {
                SourceError::Timeout(self.timeout)
            } else {
                SourceError::Transport(e)
            }
        };

        let response = self.http_client.get(url).send().await.map_err(timed_out)?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            return Ok(AccrualPoll::Throttled(ThrottleSignal {
                status: status.as_u16(),
                retry_after,
            }));
        }

        if status != StatusCode::OK {
            tracing::debug!(order_number, status = status.as_u16(), "Accrual poll rejected");
            return Ok(AccrualPoll::Rejected {
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(timed_out)?;
        Ok(AccrualPoll::Ready(decode_accrual(&body)?))
    }
}
