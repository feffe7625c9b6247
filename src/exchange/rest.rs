use crate::error::ExchangeError;
use crate::exchange::retry::{with_retry, RateLimitHeadroom, RetryPolicy};
use crate::exchange::ExchangeResult;
use crate::market::Timeframe;
use crate::models::Candle;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use governor::{Quota, RateLimiter};
use reqwest::Client;
use serde::Deserialize;
use std::num::NonZeroU32;
use std::sync::Arc;

const KLINE_PATH: &str = "/v5/market/kline";
/// Candles per request
const PAGE_LIMIT: i64 = 1000;
const DEFAULT_REQUESTS_PER_MINUTE: u32 = 120;
/// Venue code for "too many visits"
const RATE_LIMITED_CODE: i64 = 10006;

type KlineRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Anything that can fill a candle range, used to refresh the backtest cache
#[async_trait]
pub trait KlineSource: Send + Sync {
    /// Closed candles with right-labelled timestamps in `(start, end]`, oldest first
    async fn fetch_klines(
        &self,
        timeframe: &Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> ExchangeResult<Vec<Candle>>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KlineResponse {
    ret_code: i64,
    ret_msg: String,
    result: Option<KlineResult>,
}

#[derive(Debug, Deserialize)]
struct KlineResult {
    #[serde(default)]
    list: Vec<Vec<String>>,
}

/// Public kline endpoint client with client-side rate limiting and bounded retries
#[derive(Clone)]
pub struct RestKlineSource {
    client: Client,
    base_url: String,
    symbol: String,
    category: String,
    retry: RetryPolicy,
    rate_limiter: Arc<KlineRateLimiter>,
}

impl RestKlineSource {
    pub fn new(base_url: impl Into<String>, symbol: impl Into<String>, retry: RetryPolicy) -> ExchangeResult<Self> {
        Self::with_rate(base_url, symbol, retry, DEFAULT_REQUESTS_PER_MINUTE)
    }

    pub fn with_rate(
        base_url: impl Into<String>,
        symbol: impl Into<String>,
        retry: RetryPolicy,
        requests_per_minute: u32,
    ) -> ExchangeResult<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        let quota = Quota::per_minute(NonZeroU32::new(requests_per_minute).unwrap_or(NonZeroU32::MIN));
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            symbol: symbol.into(),
            category: "linear".to_string(),
            retry,
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
        })
    }

    /// Venue interval code for a timeframe
    pub fn venue_interval(timeframe: &Timeframe) -> ExchangeResult<&'static str> {
        Ok(match timeframe.minutes() {
            1 => "1",
            3 => "3",
            5 => "5",
            15 => "15",
            30 => "30",
            60 => "60",
            120 => "120",
            240 => "240",
            360 => "360",
            720 => "720",
            1440 => "D",
            _ => return Err(ExchangeError::UnsupportedInterval(timeframe.to_string())),
        })
    }

    /// One page of candles whose open time is in `[first_open, last_open]`
    async fn fetch_page(
        &self,
        timeframe: &Timeframe,
        interval: &str,
        first_open: DateTime<Utc>,
        last_open: DateTime<Utc>,
    ) -> ExchangeResult<Vec<Candle>> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}{}", self.base_url, KLINE_PATH);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("category", self.category.as_str()),
                ("symbol", self.symbol.as_str()),
                ("interval", interval),
                ("start", &first_open.timestamp_millis().to_string()),
                ("end", &last_open.timestamp_millis().to_string()),
                ("limit", &PAGE_LIMIT.to_string()),
            ])
            .send()
            .await?;

        if let Some(headroom) = RateLimitHeadroom::from_headers(response.headers()) {
            if let Some(delay) = headroom.backoff(self.retry.rate_limit_floor) {
                tracing::warn!(
                    "Rate limit headroom low ({}/{}), sleeping {:?}",
                    headroom.remaining,
                    headroom.limit,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ExchangeError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let body: KlineResponse = response
            .json()
            .await
            .map_err(|e| ExchangeError::Decode(e.to_string()))?;
        match body.ret_code {
            0 => {}
            RATE_LIMITED_CODE => return Err(ExchangeError::RetryRequested(body.ret_msg)),
            code => {
                return Err(ExchangeError::Venue {
                    code,
                    message: body.ret_msg,
                })
            }
        }

        let rows = body.result.map(|r| r.list).unwrap_or_default();
        let mut candles = rows
            .iter()
            .map(|row| parse_row(row, timeframe))
            .collect::<ExchangeResult<Vec<_>>>()?;
        // Newest first on the wire
        candles.sort_by_key(|c| c.timestamp);
        Ok(candles)
    }
}

/// `[start_ms, open, high, low, close, volume, turnover]`, relabelled to the bucket's right edge
fn parse_row(row: &[String], timeframe: &Timeframe) -> ExchangeResult<Candle> {
    let field = |i: usize| -> ExchangeResult<f64> {
        row.get(i)
            .ok_or_else(|| ExchangeError::Decode(format!("kline row too short: {:?}", row)))?
            .parse::<f64>()
            .map_err(|e| ExchangeError::Decode(format!("bad kline field {}: {}", i, e)))
    };
    let start_ms = field(0)? as i64;
    let open_time = Utc
        .timestamp_millis_opt(start_ms)
        .single()
        .ok_or_else(|| ExchangeError::Decode(format!("bad kline timestamp {}", start_ms)))?;
    Ok(Candle::new(
        open_time + timeframe.duration(),
        field(1)?,
        field(2)?,
        field(3)?,
        field(4)?,
        field(5)?,
    ))
}

#[async_trait]
impl KlineSource for RestKlineSource {
    async fn fetch_klines(
        &self,
        timeframe: &Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> ExchangeResult<Vec<Candle>> {
        let interval = Self::venue_interval(timeframe)?;
        let step = timeframe.duration();
        let last_open = timeframe.bucket_end(end) - step;
        let mut cursor = timeframe.bucket_end(start);
        let mut out: Vec<Candle> = Vec::new();

        while cursor <= last_open {
            let page_end = (cursor + step * (PAGE_LIMIT as i32 - 1)).min(last_open);
            tracing::info!("Fetching OHLCV data - {} .. {}", cursor, page_end);
            let page = with_retry(&self.retry, || {
                self.fetch_page(timeframe, interval, cursor, page_end)
            })
            .await?;

            for candle in page {
                let newer = out.last().map_or(true, |last| candle.timestamp > last.timestamp);
                if newer && candle.timestamp > start && candle.timestamp <= end {
                    out.push(candle);
                }
            }
            cursor = page_end + step;
        }

        tracing::debug!("Fetched {} {} candles for {}", out.len(), timeframe, self.symbol);
        Ok(out)
    }
}
