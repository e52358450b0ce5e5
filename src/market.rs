//! Market snapshot sources feeding the decision engine's classifier

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rand::Rng;
use sqlx::postgres::PgPool;
use sqlx::Row;
use tokio::sync::Mutex;

use crate::config::MarketConfig;
use crate::domain::MarketSample;
use crate::error::Result;
use crate::rng::SimRng;

#[async_trait]
pub trait MarketSource: Send + Sync {
    /// The most recent `size` samples, oldest first. May return fewer.
    async fn recent_window(&self, size: usize) -> Result<Vec<MarketSample>>;
}

/// Fixed samples, used by tests and replays
#[derive(Debug, Clone, Default)]
pub struct StaticMarket {
    samples: Vec<MarketSample>,
}

impl StaticMarket {
    pub fn new(samples: Vec<MarketSample>) -> Self {
        Self { samples }
    }

    /// Evenly spaced hourly samples at the given prices and a constant volume
    pub fn from_prices(prices: &[f64], volume: f64) -> Self {
        let start = Utc::now() - Duration::hours(prices.len() as i64);
        let samples = prices
            .iter()
            .enumerate()
            .map(|(i, &p)| MarketSample::new(p, volume, start + Duration::hours(i as i64)))
            .collect();
        Self { samples }
    }
}

#[async_trait]
impl MarketSource for StaticMarket {
    async fn recent_window(&self, size: usize) -> Result<Vec<MarketSample>> {
        let skip = self.samples.len().saturating_sub(size);
        Ok(self.samples[skip..].to_vec())
    }
}

struct WalkState {
    rng: SimRng,
    price: f64,
}

/// Hourly random walk. Each call continues the walk from where the previous
/// one ended, so successive cycles see moving markets.
pub struct SyntheticMarket {
    state: Mutex<WalkState>,
    step_pct: f64,
    base_volume: f64,
}

impl SyntheticMarket {
    pub fn new(start_price: f64, step_pct: f64, base_volume: f64, seed: Option<u64>) -> Self {
        Self {
            state: Mutex::new(WalkState {
                rng: SimRng::from_seed_option(seed),
                price: start_price,
            }),
            step_pct,
            base_volume,
        }
    }

    pub fn from_config(config: &MarketConfig, seed: Option<u64>) -> Self {
        Self::new(
            config.synthetic_start_price,
            config.synthetic_step_pct,
            config.synthetic_base_volume,
            seed,
        )
    }
}

#[async_trait]
impl MarketSource for SyntheticMarket {
    async fn recent_window(&self, size: usize) -> Result<Vec<MarketSample>> {
        let mut state = self.state.lock().await;
        let start = Utc::now() - Duration::hours(size as i64);
        let mut samples = Vec::with_capacity(size);
        for i in 0..size {
            let step: f64 = state.rng.gen_range(-1.0..=1.0) * self.step_pct / 100.0;
            state.price = (state.price * (1.0 + step)).max(0.01);
            let volume = self.base_volume * state.rng.gen_range(0.5..1.5);
            samples.push(MarketSample::new(
                state.price,
                volume,
                start + Duration::hours(i as i64),
            ));
        }
        Ok(samples)
    }
}

/// Reads `arena_market_samples` written by the ingestion pipeline
#[derive(Clone)]
pub struct PostgresMarket {
    pool: PgPool,
    symbol: String,
}

impl PostgresMarket {
    pub fn new(pool: PgPool, symbol: impl Into<String>) -> Self {
        Self {
            pool,
            symbol: symbol.into(),
        }
    }
}

#[async_trait]
impl MarketSource for PostgresMarket {
    async fn recent_window(&self, size: usize) -> Result<Vec<MarketSample>> {
        let rows = sqlx::query(
            r#"
            SELECT price, volume, sample_ts FROM (
                SELECT price, volume, sample_ts
                FROM arena_market_samples
                WHERE symbol = $1
                ORDER BY sample_ts DESC
                LIMIT $2
            ) recent
            ORDER BY sample_ts ASC
            "#,
        )
        .bind(&self.symbol)
        .bind(i64::try_from(size).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| MarketSample::new(r.get("price"), r.get("volume"), r.get("sample_ts")))
            .collect())
    }
}
