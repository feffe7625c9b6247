use crate::exchange::KlineSource;
use crate::market::Timeframe;
use crate::models::Candle;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

const HEADER: &str = "time,open,high,low,close,volume";

/// On-disk OHLCV history for one exchange, pair and timeframe:
/// `{cache_dir}/{exchange}/{pair}/{timeframe}/data.csv`
#[derive(Debug, Clone)]
pub struct CandleCache {
    path: PathBuf,
    timeframe: Timeframe,
}

impl CandleCache {
    pub fn new(cache_dir: &Path, exchange: &str, pair: &str, timeframe: &Timeframe) -> Self {
        let path = cache_dir
            .join(exchange)
            .join(pair)
            .join(timeframe.label())
            .join("data.csv");
        Self {
            path,
            timeframe: timeframe.clone(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Cached candles, oldest first; empty when nothing is cached yet
    pub fn load(&self) -> Result<Vec<Candle>> {
        if !self.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;

        let mut candles = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("Failed to read {}", self.path.display()))?;
            let line = line.trim();
            if line.is_empty() || (index == 0 && line.starts_with("time")) {
                continue;
            }
            let candle = parse_row(line)
                .with_context(|| format!("{} line {}", self.path.display(), index + 1))?;
            candles.push(candle);
        }

        tracing::debug!("Loaded {} candles from {}", candles.len(), self.path.display());
        Ok(candles)
    }

    pub fn save(&self, candles: &[Candle]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let file = File::create(&self.path)
            .with_context(|| format!("Failed to create {}", self.path.display()))?;
        let mut writer = BufWriter::new(file);

        writeln!(writer, "{}", HEADER)?;
        for candle in candles {
            writeln!(
                writer,
                "{},{},{},{},{},{}",
                candle.timestamp.to_rfc3339(),
                candle.open,
                candle.high,
                candle.low,
                candle.close,
                candle.volume
            )?;
        }
        writer.flush()?;

        tracing::info!("Saved {} candles to {}", candles.len(), self.path.display());
        Ok(())
    }

    /// Extend the cache up to `end`. The newest cached candle is dropped and
    /// fetched again since it may have been written before it closed. An empty
    /// cache is filled from `start`.
    pub async fn refresh(
        &self,
        source: &dyn KlineSource,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let mut candles = self.load()?;
        candles.pop();
        let from = candles.last().map_or(start, |c| c.timestamp);
        if from >= end {
            return Ok(candles);
        }

        let fetched = source
            .fetch_klines(&self.timeframe, from, end)
            .await
            .with_context(|| format!("Failed to fetch {} candles from {}", self.timeframe, from))?;
        let newest = candles.last().map(|c| c.timestamp);
        candles.extend(
            fetched
                .into_iter()
                .filter(|c| newest.map_or(true, |n| c.timestamp > n)),
        );

        self.save(&candles)?;
        Ok(candles)
    }

    /// Cached data as is, unless it is missing or `update` asks for a refresh
    pub async fn load_or_fetch(
        &self,
        source: &dyn KlineSource,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        update: bool,
    ) -> Result<Vec<Candle>> {
        if self.exists() && !update {
            return self.load();
        }
        self.refresh(source, start, end).await
    }
}

fn parse_row(line: &str) -> Result<Candle> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() < 6 {
        anyhow::bail!("expected 6 columns, found {}", fields.len());
    }
    // Accept "2024-01-01 00:05:00+00:00" as well as RFC 3339
    let time = fields[0].replacen(' ', "T", 1);
    let timestamp = DateTime::parse_from_rfc3339(&time)
        .with_context(|| format!("Invalid time '{}'", fields[0]))?
        .with_timezone(&Utc);

    let number = |i: usize| -> Result<f64> {
        fields[i]
            .parse::<f64>()
            .with_context(|| format!("Invalid number '{}'", fields[i]))
    };
    Ok(Candle::new(
        timestamp,
        number(1)?,
        number(2)?,
        number(3)?,
        number(4)?,
        number(5)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::ExchangeResult;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use std::sync::Mutex;

    fn ts(min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(min)
    }

    /// One-minute candles priced by their minute; records requested ranges
    struct Minutes {
        calls: Mutex<Vec<(DateTime<Utc>, DateTime<Utc>)>>,
    }

    #[async_trait]
    impl KlineSource for Minutes {
        async fn fetch_klines(
            &self,
            _timeframe: &Timeframe,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> ExchangeResult<Vec<Candle>> {
            self.calls.lock().unwrap().push((start, end));
            let mut out = Vec::new();
            let mut t = start + Duration::minutes(1);
            while t <= end {
                let p = (t - ts(0)).num_minutes() as f64;
                out.push(Candle::new(t, p, p + 1.0, p - 1.0, p, 1.0));
                t += Duration::minutes(1);
            }
            Ok(out)
        }
    }

    fn cache(name: &str) -> CandleCache {
        let dir = std::env::temp_dir().join(format!("perpbot-cache-{}-{}", name, uuid::Uuid::new_v4()));
        CandleCache::new(&dir, "bybit", "BTCUSDT", &"1m".parse().unwrap())
    }

    #[test]
    fn test_path_layout() {
        let cache = CandleCache::new(Path::new("ohlc"), "bybit", "BTCUSDT", &"5m".parse().unwrap());
        assert_eq!(cache.path(), Path::new("ohlc/bybit/BTCUSDT/5m/data.csv"));
    }

    #[test]
    fn test_save_then_load() {
        let cache = cache("roundtrip");
        let candles = vec![
            Candle::new(ts(1), 100.0, 101.5, 99.25, 100.75, 12.5),
            Candle::new(ts(2), 100.75, 102.0, 100.0, 101.0, 3.0),
        ];
        cache.save(&candles).unwrap();
        assert_eq!(cache.load().unwrap(), candles);
    }

    #[test]
    fn test_parses_space_separated_time() {
        let candle = parse_row("2024-01-01 00:05:00+00:00,1,2,0.5,1.5,10").unwrap();
        assert_eq!(candle.timestamp, ts(5));
        assert_eq!(candle.low, 0.5);
        assert!(parse_row("2024-01-01 00:05:00+00:00,1,2").is_err());
        assert!(parse_row("yesterday,1,2,0.5,1.5,10").is_err());
    }

    #[tokio::test]
    async fn test_refresh_refetches_last_candle() {
        let cache = cache("refresh");
        let source = Minutes {
            calls: Mutex::new(Vec::new()),
        };

        let first = cache.refresh(&source, ts(0), ts(5)).await.unwrap();
        assert_eq!(first.len(), 5);

        let second = cache.refresh(&source, ts(0), ts(8)).await.unwrap();
        assert_eq!(second.len(), 8);
        assert_eq!(second.last().unwrap().timestamp, ts(8));
        // Second fetch starts after the kept candle at 00:04
        assert_eq!(source.calls.lock().unwrap()[1], (ts(4), ts(8)));
        assert_eq!(cache.load().unwrap(), second);
    }

    #[test]
    fn test_load_or_fetch_uses_cache() {
        let cache = cache("cached");
        let source = Minutes {
            calls: Mutex::new(Vec::new()),
        };
        tokio_test::block_on(cache.load_or_fetch(&source, ts(0), ts(3), false)).unwrap();
        let again = tokio_test::block_on(cache.load_or_fetch(&source, ts(0), ts(9), false)).unwrap();
        assert_eq!(again.len(), 3);
        assert_eq!(source.calls.lock().unwrap().len(), 1);
    }
}
