//! Algorithm selection policy for the backward-data operator.
//!
//! Policies are parsed from short strings so they can come from configuration files or the
//! environment: `heuristic`, `heuristic(cache=64)`, `force=NAME`, or a bare algorithm name.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_HEURISTIC_CACHE_SIZE: usize = 128;

/// Effective policy applied when picking an algorithm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlgoPolicy {
    /// First available algorithm in priority order. Choices are remembered per problem in an LRU
    /// cache of `cache_size` entries; zero disables the cache.
    Heuristic { cache_size: usize },
    /// Use the named algorithm when it is available, otherwise fall back to the heuristic.
    Force { algorithm: String },
}

impl Default for AlgoPolicy {
    fn default() -> Self {
        AlgoPolicy::Heuristic {
            cache_size: DEFAULT_HEURISTIC_CACHE_SIZE,
        }
    }
}

impl AlgoPolicy {
    pub fn from_setting(setting: AlgoPolicySetting) -> Self {
        match setting {
            AlgoPolicySetting::Force(name) if name.is_empty() => AlgoPolicy::default(),
            AlgoPolicySetting::Force(algorithm) => AlgoPolicy::Force { algorithm },
            AlgoPolicySetting::Heuristic { cache_size } => AlgoPolicy::Heuristic { cache_size },
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        parse_policy_string(raw).map(Self::from_setting)
    }

    /// Same policy with the heuristic cache turned off.
    pub fn without_cache(self) -> Self {
        match self {
            AlgoPolicy::Heuristic { .. } => AlgoPolicy::Heuristic { cache_size: 0 },
            forced => forced,
        }
    }

    pub fn cache_size(&self) -> usize {
        match self {
            AlgoPolicy::Heuristic { cache_size } => *cache_size,
            AlgoPolicy::Force { .. } => 0,
        }
    }
}

/// Raw setting as written in configuration, before normalisation into an [`AlgoPolicy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlgoPolicySetting {
    Force(String),
    Heuristic { cache_size: usize },
}

impl<'de> Deserialize<'de> for AlgoPolicySetting {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse_policy_string(&raw).map_err(serde::de::Error::custom)
    }
}

impl Serialize for AlgoPolicySetting {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            AlgoPolicySetting::Force(name) => {
                // The bare form is only used when it reads back as the same forced name.
                let bare_round_trips = matches!(
                    parse_policy_string(name),
                    Ok(AlgoPolicySetting::Force(ref parsed)) if parsed == name
                );
                if bare_round_trips {
                    serializer.serialize_str(name)
                } else {
                    serializer.serialize_str(&format!("force={name}"))
                }
            }
            AlgoPolicySetting::Heuristic { cache_size } => {
                if *cache_size == DEFAULT_HEURISTIC_CACHE_SIZE {
                    serializer.serialize_str("heuristic")
                } else {
                    serializer.serialize_str(&format!("heuristic(cache={cache_size})"))
                }
            }
        }
    }
}

fn parse_policy_string(raw: &str) -> Result<AlgoPolicySetting> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(AlgoPolicySetting::Force(String::new()));
    }

    if let Some(rest) = trimmed.strip_prefix("force=") {
        return Ok(AlgoPolicySetting::Force(rest.trim().to_string()));
    }

    if trimmed.eq_ignore_ascii_case("heuristic") {
        return Ok(AlgoPolicySetting::Heuristic {
            cache_size: DEFAULT_HEURISTIC_CACHE_SIZE,
        });
    }

    if let Some(rest) = trimmed
        .strip_prefix("heuristic(")
        .and_then(|inner| inner.strip_suffix(')'))
    {
        let mut cache_size = DEFAULT_HEURISTIC_CACHE_SIZE;
        for part in rest.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if let Some(value) = part.strip_prefix("cache=") {
                cache_size = value
                    .trim()
                    .parse()
                    .map_err(|_| anyhow!("invalid heuristic cache size: {value}"))?;
            } else {
                return Err(anyhow!("unknown heuristic policy option: {part}"));
            }
        }
        return Ok(AlgoPolicySetting::Heuristic { cache_size });
    }

    Ok(AlgoPolicySetting::Force(trimmed.to_string()))
}
