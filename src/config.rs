//! Configuration management for ticketgate.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{GatewayError, Result};

/// Main configuration for the ticketgate service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Issue tracker configuration
    #[serde(default)]
    pub tracker: TrackerConfig,

    /// Redis coordination configuration
    #[serde(default)]
    pub redis: RedisConfig,

    /// Ticket token store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Anti-abuse configuration
    #[serde(default)]
    pub security: SecurityConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            tracker: TrackerConfig::default(),
            redis: RedisConfig::default(),
            store: StoreConfig::default(),
            security: SecurityConfig::default(),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Keyword that must appear in the client User-Agent header
    #[serde(default = "default_ua_keyword")]
    pub required_ua_keyword: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            required_ua_keyword: default_ua_keyword(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    "0.0.0.0:8080".parse().unwrap()
}

fn default_ua_keyword() -> String {
    "Ticketgate Client".to_string()
}

/// Issue tracker (GitHub Issues) configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// API token; usually supplied via the GITHUB_TOKEN environment variable
    #[serde(default)]
    pub token: String,

    /// Repository owner
    #[serde(default)]
    pub owner: String,

    /// Repository name
    #[serde(default)]
    pub repo: String,
}

/// Redis coordination configuration.
///
/// When no URL is configured, the service runs with local-only enforcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL (e.g. redis://127.0.0.1:6379)
    #[serde(default)]
    pub url: Option<String>,

    /// Prefix applied to every key written by this service
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_key_prefix() -> String {
    "ticketgate".to_string()
}

/// Ticket token store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the ticket token file
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

/// Anti-abuse configuration: rate limits, challenge parameters, blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Fixed rate-limit window in seconds
    #[serde(default = "default_rate_window_secs")]
    pub rate_window_secs: u64,

    /// Challenge time-to-live in seconds
    #[serde(default = "default_challenge_ttl_secs")]
    pub challenge_ttl_secs: u64,

    /// Accepted clock skew for submission timestamps, in seconds
    #[serde(default = "default_timestamp_skew_secs")]
    pub timestamp_skew_secs: u64,

    /// Duplicate-submission suppression window in seconds
    #[serde(default = "default_duplicate_window_secs")]
    pub duplicate_window_secs: u64,

    /// Proof-of-work difficulty in leading zero bits (0 disables PoW)
    #[serde(default = "default_pow_difficulty_bits")]
    pub pow_difficulty_bits: u8,

    /// Signature failures tolerated per challenge before the client is blocked
    #[serde(default = "default_fail_threshold")]
    pub signature_fail_threshold: u32,

    /// Duration of a client block in seconds
    #[serde(default = "default_block_secs")]
    pub signature_block_secs: u64,

    /// Challenge issuances allowed per client per window
    #[serde(default = "default_challenge_limit")]
    pub challenge_limit_per_window: u32,

    /// Ticket submissions allowed per client per window
    #[serde(default = "default_submit_limit")]
    pub submit_limit_per_window: u32,

    /// Status queries allowed per client per window
    #[serde(default = "default_query_limit")]
    pub query_limit_per_window: u32,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            rate_window_secs: default_rate_window_secs(),
            challenge_ttl_secs: default_challenge_ttl_secs(),
            timestamp_skew_secs: default_timestamp_skew_secs(),
            duplicate_window_secs: default_duplicate_window_secs(),
            pow_difficulty_bits: default_pow_difficulty_bits(),
            signature_fail_threshold: default_fail_threshold(),
            signature_block_secs: default_block_secs(),
            challenge_limit_per_window: default_challenge_limit(),
            submit_limit_per_window: default_submit_limit(),
            query_limit_per_window: default_query_limit(),
        }
    }
}

fn default_rate_window_secs() -> u64 {
    900
}

fn default_challenge_ttl_secs() -> u64 {
    120
}

fn default_timestamp_skew_secs() -> u64 {
    90
}

fn default_duplicate_window_secs() -> u64 {
    600
}

fn default_pow_difficulty_bits() -> u8 {
    20
}

fn default_fail_threshold() -> u32 {
    5
}

fn default_block_secs() -> u64 {
    600
}

fn default_challenge_limit() -> u32 {
    30
}

fn default_submit_limit() -> u32 {
    6
}

fn default_query_limit() -> u32 {
    60
}

/// Maximum accepted proof-of-work difficulty.
const MAX_POW_BITS: u8 = 30;

impl SecurityConfig {
    /// Fixed rate-limit window as a [`Duration`].
    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_secs)
    }

    /// Challenge time-to-live as a [`Duration`].
    pub fn challenge_ttl(&self) -> Duration {
        Duration::from_secs(self.challenge_ttl_secs)
    }

    /// Accepted timestamp skew as a [`Duration`].
    pub fn timestamp_skew(&self) -> Duration {
        Duration::from_secs(self.timestamp_skew_secs)
    }

    /// Duplicate-suppression window as a [`Duration`].
    pub fn duplicate_window(&self) -> Duration {
        Duration::from_secs(self.duplicate_window_secs)
    }

    /// Client block duration as a [`Duration`].
    pub fn signature_block_duration(&self) -> Duration {
        Duration::from_secs(self.signature_block_secs)
    }
}

impl GatewayConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: GatewayConfig = serde_yaml::from_str(&contents)
            .map_err(|e| GatewayError::Config(e.to_string()))?;
        Ok(config)
    }

    /// Overlay deployment-environment variables onto the loaded configuration.
    ///
    /// Environment values win over file values so that secrets and
    /// per-deployment addresses never need to live in the config file.
    pub fn overlay_env(&mut self) {
        if let Some(addr) = env_parsed::<SocketAddr>("LISTEN_ADDR") {
            self.server.listen_addr = addr;
        }
        if let Some(keyword) = env_nonempty("REQUIRED_UA_KEYWORD") {
            self.server.required_ua_keyword = keyword;
        }
        if let Some(token) = env_nonempty("GITHUB_TOKEN") {
            self.tracker.token = token;
        }
        if let Some(owner) = env_nonempty("GITHUB_OWNER") {
            self.tracker.owner = owner;
        }
        if let Some(repo) = env_nonempty("GITHUB_REPO") {
            self.tracker.repo = repo;
        }
        if let Some(url) = env_nonempty("REDIS_URL") {
            self.redis.url = Some(url);
        }
        if let Some(prefix) = env_nonempty("REDIS_KEY_PREFIX") {
            self.redis.key_prefix = prefix;
        }
        if let Some(dir) = env_nonempty("DATA_DIR") {
            self.store.data_dir = PathBuf::from(dir);
        }
        if let Some(bits) = env_parsed::<u8>("POW_DIFFICULTY_BITS") {
            self.security.pow_difficulty_bits = bits;
        }
        if let Some(limit) = env_parsed::<u32>("CHALLENGE_LIMIT_PER_WINDOW") {
            self.security.challenge_limit_per_window = limit;
        }
        if let Some(limit) = env_parsed::<u32>("SUBMIT_LIMIT_PER_WINDOW") {
            self.security.submit_limit_per_window = limit;
        }
        if let Some(limit) = env_parsed::<u32>("QUERY_LIMIT_PER_WINDOW") {
            self.security.query_limit_per_window = limit;
        }
    }

    /// Validate the configuration, clamping out-of-range values.
    pub fn validate(&mut self) -> Result<()> {
        if self.tracker.token.trim().is_empty() {
            return Err(GatewayError::Config(
                "tracker token is required (set GITHUB_TOKEN)".to_string(),
            ));
        }
        if self.tracker.owner.trim().is_empty() || self.tracker.repo.trim().is_empty() {
            return Err(GatewayError::Config(
                "tracker owner and repo are required".to_string(),
            ));
        }
        self.security.pow_difficulty_bits = self.security.pow_difficulty_bits.min(MAX_POW_BITS);
        Ok(())
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_nonempty(key).and_then(|v| v.parse().ok())
}
