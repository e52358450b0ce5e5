use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Known pattern families. Fields are optional because the library that
/// discovers patterns does not guarantee every parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionFamily {
    Momentum {
        lookback: Option<u32>,
        threshold_pct: Option<f64>,
    },
    MeanReversion {
        lookback: Option<u32>,
        z_entry: Option<f64>,
    },
    Breakout {
        lookback: Option<u32>,
        volume_multiplier: Option<f64>,
    },
    VolatilityRegime {
        regime: Option<String>,
    },
    /// Family tag present but not one we model
    Unrecognized(String),
    /// No family tag at all
    Untagged,
}

impl ConditionFamily {
    pub fn tag(&self) -> Option<&str> {
        match self {
            ConditionFamily::Momentum { .. } => Some("momentum"),
            ConditionFamily::MeanReversion { .. } => Some("mean_reversion"),
            ConditionFamily::Breakout { .. } => Some("breakout"),
            ConditionFamily::VolatilityRegime { .. } => Some("volatility_regime"),
            ConditionFamily::Unrecognized(tag) => Some(tag.as_str()),
            ConditionFamily::Untagged => None,
        }
    }
}

/// Pattern condition payload: a typed family plus every field we did not
/// consume, so round-tripping through this crate never drops data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub struct PatternConditions {
    pub family: ConditionFamily,
    pub extensions: Map<String, Value>,
}

impl Default for PatternConditions {
    fn default() -> Self {
        Self {
            family: ConditionFamily::Untagged,
            extensions: Map::new(),
        }
    }
}

const FAMILY_KEY: &str = "family";

fn take_u32(map: &mut Map<String, Value>, key: &str) -> Option<u32> {
    let v = map.get(key)?.as_u64().and_then(|n| u32::try_from(n).ok())?;
    map.remove(key);
    Some(v)
}

fn take_f64(map: &mut Map<String, Value>, key: &str) -> Option<f64> {
    let v = map.get(key)?.as_f64()?;
    map.remove(key);
    Some(v)
}

fn take_string(map: &mut Map<String, Value>, key: &str) -> Option<String> {
    let v = map.get(key)?.as_str()?.to_string();
    map.remove(key);
    Some(v)
}

impl From<Value> for PatternConditions {
    fn from(value: Value) -> Self {
        let mut map = match value {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("raw".to_string(), other);
                map
            }
        };

        // "type" is accepted as an alias for older payloads
        let tag = take_string(&mut map, FAMILY_KEY).or_else(|| take_string(&mut map, "type"));

        let family = match tag.as_deref() {
            Some("momentum") => ConditionFamily::Momentum {
                lookback: take_u32(&mut map, "lookback"),
                threshold_pct: take_f64(&mut map, "threshold_pct"),
            },
            Some("mean_reversion") => ConditionFamily::MeanReversion {
                lookback: take_u32(&mut map, "lookback"),
                z_entry: take_f64(&mut map, "z_entry"),
            },
            Some("breakout") => ConditionFamily::Breakout {
                lookback: take_u32(&mut map, "lookback"),
                volume_multiplier: take_f64(&mut map, "volume_multiplier"),
            },
            Some("volatility_regime") => ConditionFamily::VolatilityRegime {
                regime: take_string(&mut map, "regime"),
            },
            Some(other) => ConditionFamily::Unrecognized(other.to_string()),
            None => ConditionFamily::Untagged,
        };

        Self {
            family,
            extensions: map,
        }
    }
}

impl From<PatternConditions> for Value {
    fn from(conditions: PatternConditions) -> Self {
        let mut map = conditions.extensions;
        if let Some(tag) = conditions.family.tag() {
            map.insert(FAMILY_KEY.to_string(), Value::from(tag));
        }
        let mut put = |key: &str, value: Option<Value>| {
            if let Some(v) = value {
                map.insert(key.to_string(), v);
            }
        };
        match conditions.family {
            ConditionFamily::Momentum {
                lookback,
                threshold_pct,
            } => {
                put("lookback", lookback.map(Value::from));
                put("threshold_pct", threshold_pct.map(Value::from));
            }
            ConditionFamily::MeanReversion { lookback, z_entry } => {
                put("lookback", lookback.map(Value::from));
                put("z_entry", z_entry.map(Value::from));
            }
            ConditionFamily::Breakout {
                lookback,
                volume_multiplier,
            } => {
                put("lookback", lookback.map(Value::from));
                put("volume_multiplier", volume_multiplier.map(Value::from));
            }
            ConditionFamily::VolatilityRegime { regime } => {
                put("regime", regime.map(Value::from));
            }
            ConditionFamily::Unrecognized(_) | ConditionFamily::Untagged => {}
        }
        Value::Object(map)
    }
}

/// A candidate trading rule maintained by the external pattern library
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub id: String,
    pub name: String,
    pub votes: u32,
    pub runs: u32,
    #[serde(default)]
    pub h2h_wins: u32,
    #[serde(default)]
    pub h2h_losses: u32,
    #[serde(default)]
    pub origin: String,
    #[serde(default)]
    pub conditions: PatternConditions,
}

impl Pattern {
    /// votes / max(1, runs); the quality signal used for ranking and execution weights
    pub fn vote_ratio(&self) -> f64 {
        self.votes as f64 / self.runs.max(1) as f64
    }
}

/// Library order: vote ratio desc, head-to-head wins desc, id asc.
pub fn compare_patterns(a: &Pattern, b: &Pattern) -> Ordering {
    b.vote_ratio()
        .partial_cmp(&a.vote_ratio())
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.h2h_wins.cmp(&a.h2h_wins))
        .then_with(|| a.id.cmp(&b.id))
}

pub fn rank_patterns(patterns: &mut [Pattern]) {
    patterns.sort_by(compare_patterns);
}
