use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One price/volume observation from the market snapshot source
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketSample {
    pub price: f64,
    pub volume: f64,
    pub timestamp: DateTime<Utc>,
}

impl MarketSample {
    pub fn new(price: f64, volume: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            price,
            volume,
            timestamp,
        }
    }
}

/// Three-bucket level used for volatility and volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Low,
    Medium,
    High,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Low => "low",
            Level::Medium => "medium",
            Level::High => "high",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for Level {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Level::Low),
            "medium" => Ok(Level::Medium),
            "high" => Ok(Level::High),
            _ => Err(format!("Unknown level: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    StrongUp,
    WeakUp,
    Sideways,
    WeakDown,
    StrongDown,
}

impl Trend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trend::StrongUp => "strong_up",
            Trend::WeakUp => "weak_up",
            Trend::Sideways => "sideways",
            Trend::WeakDown => "weak_down",
            Trend::StrongDown => "strong_down",
        }
    }
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for Trend {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "strong_up" => Ok(Trend::StrongUp),
            "weak_up" => Ok(Trend::WeakUp),
            "sideways" => Ok(Trend::Sideways),
            "weak_down" => Ok(Trend::WeakDown),
            "strong_down" => Ok(Trend::StrongDown),
            _ => Err(format!("Unknown trend: {}", s)),
        }
    }
}

/// Bucket boundaries for the classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketThresholds {
    /// Coefficient of variation (%) above which volatility is high
    pub volatility_high_pct: f64,
    pub volatility_medium_pct: f64,
    /// Momentum (%) beyond which a trend is strong
    pub trend_strong_pct: f64,
    pub trend_weak_pct: f64,
    /// Absolute mean-volume boundaries
    pub volume_high: f64,
    pub volume_medium: f64,
}

impl Default for MarketThresholds {
    fn default() -> Self {
        Self {
            volatility_high_pct: 3.0,
            volatility_medium_pct: 1.5,
            trend_strong_pct: 2.0,
            trend_weak_pct: 0.5,
            volume_high: 1_000_000.0,
            volume_medium: 100_000.0,
        }
    }
}

/// Categorical summary of a market window, stored on every memory
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketCondition {
    pub volatility: Level,
    pub trend: Trend,
    pub volume: Level,
    /// OLS slope normalised by mean price, in percent
    pub momentum: f64,
}

impl MarketCondition {
    /// Condition reported for windows that carry no usable price signal.
    pub fn flat() -> Self {
        Self {
            volatility: Level::Low,
            trend: Trend::Sideways,
            volume: Level::Low,
            momentum: 0.0,
        }
    }

    pub fn classify(window: &[MarketSample], thresholds: &MarketThresholds) -> Self {
        if window.is_empty() {
            return Self::flat();
        }

        let prices: Vec<f64> = window.iter().map(|s| s.price).collect();
        let n = prices.len() as f64;
        let mean_price = prices.iter().sum::<f64>() / n;
        let mean_volume = window.iter().map(|s| s.volume).sum::<f64>() / n;
        let volume = classify_volume(mean_volume, thresholds);

        if !mean_price.is_finite() || mean_price <= 0.0 {
            return Self {
                volume,
                ..Self::flat()
            };
        }

        let variance = prices.iter().map(|p| (p - mean_price).powi(2)).sum::<f64>() / n;
        let cv_pct = variance.sqrt() / mean_price * 100.0;
        let volatility = if cv_pct > thresholds.volatility_high_pct {
            Level::High
        } else if cv_pct > thresholds.volatility_medium_pct {
            Level::Medium
        } else {
            Level::Low
        };

        let momentum = ols_slope(&prices) / mean_price * 100.0;
        let trend = if momentum > thresholds.trend_strong_pct {
            Trend::StrongUp
        } else if momentum > thresholds.trend_weak_pct {
            Trend::WeakUp
        } else if momentum < -thresholds.trend_strong_pct {
            Trend::StrongDown
        } else if momentum < -thresholds.trend_weak_pct {
            Trend::WeakDown
        } else {
            Trend::Sideways
        };

        Self {
            volatility,
            trend,
            volume,
            momentum,
        }
    }
}

fn classify_volume(mean_volume: f64, thresholds: &MarketThresholds) -> Level {
    if mean_volume > thresholds.volume_high {
        Level::High
    } else if mean_volume > thresholds.volume_medium {
        Level::Medium
    } else {
        Level::Low
    }
}

/// Least-squares slope of `ys` against their index. 0.0 for fewer than two points.
pub fn ols_slope(ys: &[f64]) -> f64 {
    if ys.len() < 2 {
        return 0.0;
    }
    let n = ys.len() as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = ys.iter().sum::<f64>() / n;

    let mut num = 0.0;
    let mut den = 0.0;
    for (i, &y) in ys.iter().enumerate() {
        let dx = i as f64 - mean_x;
        num += dx * (y - mean_y);
        den += dx * dx;
    }
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}
