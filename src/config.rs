//! Runtime configuration with the defaults the subsystem ships with.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::Topic;

pub const DEFAULT_POOL_TOPIC: &str = "matchmaking-signaling";
pub const DEFAULT_DIRECT_TOPIC: &str = "direct-pairing";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub matchmaking: MatchmakingConfig,
    pub session: SessionConfig,
    pub bridge: BridgeConfig,
}

impl Config {
    /// Parse a (possibly partial) JSON document; missing keys keep defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchmakingConfig {
    /// Relay topic shared by every pool-matched pair
    pub pool_topic: Topic,
    #[serde(rename = "match_poll_interval_ms", with = "millis")]
    pub match_poll_interval: Duration,
    #[serde(rename = "pool_size_poll_interval_ms", with = "millis")]
    pub pool_size_poll_interval: Duration,
}

impl Default for MatchmakingConfig {
    fn default() -> Self {
        Self {
            pool_topic: Topic::from(DEFAULT_POOL_TOPIC),
            match_poll_interval: Duration::from_secs(2),
            pool_size_poll_interval: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    #[serde(rename = "negotiation_timeout_ms", with = "millis")]
    pub negotiation_timeout: Duration,
    #[serde(rename = "recovery_window_ms", with = "millis")]
    pub recovery_window: Duration,
    /// Pause between observing the peer's `ready` and creating the offer
    #[serde(rename = "offer_delay_ms", with = "millis")]
    pub offer_delay: Duration,
    pub data_channel_label: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout: Duration::from_secs(15),
            recovery_window: Duration::from_secs(8),
            offer_delay: Duration::from_millis(250),
            data_channel_label: "chat".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub direct_topic: Topic,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            direct_topic: Topic::from(DEFAULT_DIRECT_TOPIC),
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
