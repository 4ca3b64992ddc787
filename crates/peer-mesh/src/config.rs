use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::chunk::ChunkConfig;
use crate::reconnect::ReconnectPolicy;

pub const DEFAULT_GATHERING_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CHECKING_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_SEND_HIGH_WATER: usize = 1024 * 1024;
pub const DEFAULT_SEND_POLL_INTERVAL: Duration = Duration::from_millis(50);
pub const DEFAULT_SEND_SATURATION_WAIT: Duration = Duration::from_secs(2);
pub const DEFAULT_DATA_CHANNEL_LABEL: &str = "peer-mesh-data";
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// A STUN/TURN server handed to the negotiation primitive.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: String::new(),
            credential: String::new(),
        }
    }
}

/// Outbound backpressure knobs used by the router before writing a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SendConfig {
    pub high_water_bytes: usize,
    #[serde(with = "millis")]
    pub poll_interval: Duration,
    #[serde(with = "millis")]
    pub saturation_wait: Duration,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            high_water_bytes: DEFAULT_SEND_HIGH_WATER,
            poll_interval: DEFAULT_SEND_POLL_INTERVAL,
            saturation_wait: DEFAULT_SEND_SATURATION_WAIT,
        }
    }
}

/// Everything the orchestration core consumes, passed explicitly into the
/// registry. Durations deserialize from milliseconds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub chunk: ChunkConfig,
    #[serde(with = "millis")]
    pub gathering_timeout: Duration,
    #[serde(with = "millis")]
    pub checking_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub send: SendConfig,
    pub ice_servers: Vec<IceServer>,
    pub data_channel_label: String,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            chunk: ChunkConfig::default(),
            gathering_timeout: DEFAULT_GATHERING_TIMEOUT,
            checking_timeout: DEFAULT_CHECKING_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
            send: SendConfig::default(),
            ice_servers: vec![IceServer::stun(DEFAULT_STUN_URL)],
            data_channel_label: DEFAULT_DATA_CHANNEL_LABEL.to_string(),
        }
    }
}

impl MeshConfig {
    /// Defaults overridden by `PEER_MESH_*` environment variables. Values
    /// below their minimum, or unparsable, fall back to the default with a
    /// warning.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let chunk = ChunkConfig {
            max_fragment_bytes: parse_usize_env(
                "PEER_MESH_MAX_FRAGMENT_BYTES",
                defaults.chunk.max_fragment_bytes,
                1,
            ),
            max_message_bytes: parse_usize_env(
                "PEER_MESH_MAX_MESSAGE_BYTES",
                defaults.chunk.max_message_bytes,
                1,
            ),
            ..defaults.chunk
        };
        let reconnect = ReconnectPolicy {
            base_delay: parse_millis_env(
                "PEER_MESH_RECONNECT_BASE_MS",
                defaults.reconnect.base_delay,
                1,
            ),
            backoff_factor: parse_factor_env(
                "PEER_MESH_RECONNECT_FACTOR",
                defaults.reconnect.backoff_factor,
            ),
            max_attempts: parse_usize_env(
                "PEER_MESH_RECONNECT_MAX_ATTEMPTS",
                defaults.reconnect.max_attempts as usize,
                0,
            ) as u32,
        };
        let ice_servers = if env_truthy("PEER_MESH_DISABLE_STUN") {
            Vec::new()
        } else {
            defaults.ice_servers.clone()
        };
        Self {
            chunk,
            gathering_timeout: parse_millis_env(
                "PEER_MESH_GATHERING_TIMEOUT_MS",
                defaults.gathering_timeout,
                1,
            ),
            checking_timeout: parse_millis_env(
                "PEER_MESH_CHECKING_TIMEOUT_MS",
                defaults.checking_timeout,
                1,
            ),
            reconnect,
            ice_servers,
            ..defaults
        }
    }

    /// Configuration with no STUN servers, for host-only candidates.
    pub fn localhost() -> Self {
        Self {
            ice_servers: Vec::new(),
            ..Self::default()
        }
    }
}

pub(crate) fn env_truthy(var: &str) -> bool {
    std::env::var(var)
        .map(|value| !matches!(value.trim(), "" | "0" | "false" | "no"))
        .unwrap_or(false)
}

fn parse_usize_env(var: &str, default: usize, min: usize) -> usize {
    match std::env::var(var) {
        Ok(value) => match value.trim().parse::<usize>() {
            Ok(parsed) if parsed >= min => parsed,
            Ok(parsed) => {
                warn!(
                    target = "peer_mesh::config",
                    var, parsed, min, default, "config value below minimum; using default"
                );
                default
            }
            Err(err) => {
                warn!(
                    target = "peer_mesh::config",
                    var,
                    error = %err,
                    default,
                    "failed to parse config value from env; using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

fn parse_millis_env(var: &str, default: Duration, min_ms: u64) -> Duration {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    let parsed = parse_usize_env(var, default_ms as usize, min_ms as usize);
    Duration::from_millis(parsed as u64)
}

fn parse_factor_env(var: &str, default: f64) -> f64 {
    match std::env::var(var) {
        Ok(value) => match value.trim().parse::<f64>() {
            Ok(parsed) if parsed.is_finite() && parsed >= 1.0 => parsed,
            _ => {
                warn!(
                    target = "peer_mesh::config",
                    var, default, "backoff factor must be a finite number >= 1; using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
