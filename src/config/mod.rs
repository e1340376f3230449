//! Configuration management for OGP.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::link::{SimulatorConfig, DEFAULT_MTU};
use crate::protocol::{ReassemblerConfig, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE, MIN_PAYLOAD_SIZE};
use crate::reliability::{ReliabilityConfig, RetryPolicy};
use crate::types::MAX_TIMER_DURATION;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Protocol parameters.
    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// UDP links to open at startup.
    #[serde(default)]
    pub links: Vec<LinkConfig>,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config: {e}")))?;

        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config: {e}")))?;

        Ok(())
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        self.protocol.validate()?;
        self.logging.validate()?;

        let mut names = std::collections::HashSet::new();
        for link in &self.links {
            link.validate()?;
            if !names.insert(link.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "Duplicate link name '{}'",
                    link.name
                )));
            }
        }

        Ok(())
    }
}

/// Protocol parameters shared by both directions of an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Largest fragment payload, excluding the fragment header.
    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: usize,

    /// Retransmissions of a guaranteed message before giving up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retransmissions.
    #[serde(default)]
    pub retry_policy: RetryPolicy,

    /// How long a guaranteed message may stay unacknowledged.
    #[serde(default = "default_ttl", with = "humantime_serde")]
    pub ttl: Duration,

    /// How long a received fragment is remembered for duplicate detection.
    #[serde(default = "default_dedup_horizon", with = "humantime_serde")]
    pub dedup_horizon: Duration,

    /// Upper bound on remembered fragments.
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,

    /// How long an incomplete message waits for its missing fragments.
    #[serde(default = "default_reassembly_timeout", with = "humantime_serde")]
    pub reassembly_timeout: Duration,

    /// Upper bound on concurrently incomplete messages.
    #[serde(default = "default_max_reassembly_buffers")]
    pub max_reassembly_buffers: usize,

    /// Minimum spacing between acks for the same already-completed message.
    #[serde(default = "default_reack_interval", with = "humantime_serde")]
    pub reack_interval: Duration,
}

fn default_max_payload_size() -> usize { DEFAULT_MAX_PAYLOAD_SIZE }
fn default_max_retries() -> u32 { 3 }
fn default_ttl() -> Duration { Duration::from_secs(1) }
fn default_dedup_horizon() -> Duration { Duration::from_secs(5) }
fn default_dedup_capacity() -> usize { 65_536 }
fn default_reassembly_timeout() -> Duration { Duration::from_secs(3) }
fn default_max_reassembly_buffers() -> usize { 1024 }
fn default_reack_interval() -> Duration { Duration::from_millis(50) }

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_payload_size: default_max_payload_size(),
            max_retries: default_max_retries(),
            retry_policy: RetryPolicy::default(),
            ttl: default_ttl(),
            dedup_horizon: default_dedup_horizon(),
            dedup_capacity: default_dedup_capacity(),
            reassembly_timeout: default_reassembly_timeout(),
            max_reassembly_buffers: default_max_reassembly_buffers(),
            reack_interval: default_reack_interval(),
        }
    }
}

impl ProtocolConfig {
    pub fn validate(&self) -> Result<()> {
        if !(MIN_PAYLOAD_SIZE..=u16::MAX as usize).contains(&self.max_payload_size) {
            return Err(Error::InvalidConfig(format!(
                "max_payload_size must be within [{MIN_PAYLOAD_SIZE}, {}], got {}",
                u16::MAX,
                self.max_payload_size
            )));
        }
        if !self.retry_policy.is_valid() {
            return Err(Error::InvalidConfig(format!(
                "Invalid retry policy: {:?}",
                self.retry_policy
            )));
        }
        if self.ttl.is_zero() {
            return Err(Error::InvalidConfig("ttl must be non-zero".into()));
        }
        for (name, value) in [
            ("ttl", self.ttl),
            ("dedup_horizon", self.dedup_horizon),
            ("reassembly_timeout", self.reassembly_timeout),
            ("reack_interval", self.reack_interval),
        ] {
            if value > MAX_TIMER_DURATION {
                return Err(Error::InvalidConfig(format!(
                    "{name} {value:?} exceeds the {MAX_TIMER_DURATION:?} limit"
                )));
            }
        }
        if self.dedup_horizon.is_zero() || self.dedup_capacity == 0 {
            return Err(Error::InvalidConfig(
                "Dedup window needs a non-zero horizon and capacity".into(),
            ));
        }
        if self.reassembly_timeout.is_zero() || self.max_reassembly_buffers == 0 {
            return Err(Error::InvalidConfig(
                "Reassembly needs a non-zero timeout and buffer limit".into(),
            ));
        }
        Ok(())
    }

    pub fn reliability(&self) -> ReliabilityConfig {
        ReliabilityConfig {
            max_retries: self.max_retries,
            ttl: self.ttl,
            policy: self.retry_policy,
        }
    }

    pub fn reassembler(&self) -> ReassemblerConfig {
        ReassemblerConfig {
            timeout: self.reassembly_timeout,
            dedup_horizon: self.dedup_horizon,
            dedup_capacity: self.dedup_capacity,
            max_buffers: self.max_reassembly_buffers,
            reack_interval: self.reack_interval,
        }
    }
}

/// One UDP link to the peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Name used in logs.
    pub name: String,

    /// Local address, usually pinned to one interface.
    pub bind: SocketAddr,

    /// Peer address reached over this link.
    pub peer: SocketAddr,

    /// Largest datagram sent on this link.
    #[serde(default = "default_mtu")]
    pub mtu: usize,

    /// Optional impairments, for testing over real sockets.
    #[serde(default)]
    pub simulator: Option<SimulatorConfig>,
}

fn default_mtu() -> usize { DEFAULT_MTU }

impl LinkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidConfig("Link name must not be empty".into()));
        }
        if self.mtu <= HEADER_SIZE {
            return Err(Error::InvalidConfig(format!(
                "Link '{}' mtu {} leaves no room for payload",
                self.name, self.mtu
            )));
        }
        if let Some(simulator) = &self.simulator {
            simulator.validate()?;
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text or json).
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable colored output.
    #[serde(default = "default_color")]
    pub color: bool,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}
fn default_color() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            color: default_color(),
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.format.as_str(), "text" | "json") {
            return Err(Error::InvalidConfig(format!(
                "log format must be \"text\" or \"json\", got {:?}",
                self.format
            )));
        }
        self.filter().map(drop)
    }

    /// Filter built from `level`. Bare level names apply to this crate
    /// only, so dependencies stay quiet unless named explicitly.
    fn filter(&self) -> Result<tracing_subscriber::EnvFilter> {
        let level = self.level.trim();
        let directives = if level.parse::<tracing::Level>().is_ok() {
            format!("{}={level}", env!("CARGO_CRATE_NAME"))
        } else {
            level.to_string()
        };
        tracing_subscriber::EnvFilter::try_new(&directives)
            .map_err(|e| Error::InvalidConfig(format!("log level {:?}: {e}", self.level)))
    }
}

/// Install the global tracing subscriber. `RUST_LOG` overrides the
/// configured level. Fails if a subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => config.filter()?,
    };
    let registry = tracing_subscriber::registry().with(filter);

    let installed = if config.format == "json" {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer().with_ansi(config.color)).try_init()
    };
    installed.map_err(|e| Error::Config(format!("Failed to init logging: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_toml_str("").unwrap();
        let protocol = &config.protocol;
        assert_eq!(protocol.max_payload_size, 1200);
        assert_eq!(protocol.max_retries, 3);
        assert_eq!(
            protocol.retry_policy,
            RetryPolicy::Fixed {
                interval: Duration::from_millis(100)
            }
        );
        assert_eq!(protocol.ttl, Duration::from_secs(1));
        assert_eq!(protocol.dedup_horizon, Duration::from_secs(5));
        assert_eq!(protocol.reassembly_timeout, Duration::from_secs(3));
        assert!(config.links.is_empty());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_full_config() {
        let config = Config::from_toml_str(
            r#"
            [protocol]
            max_payload_size = 512
            max_retries = 5
            ttl = "2s"
            retry_policy = { type = "exponential", initial = "50ms", multiplier = 2.0, max = "400ms" }

            [[links]]
            name = "wifi"
            bind = "0.0.0.0:7000"
            peer = "10.0.0.2:7000"

            [[links]]
            name = "lte"
            bind = "0.0.0.0:7001"
            peer = "10.0.0.2:7001"
            mtu = 1400

            [links.simulator]
            loss_rate = 0.1
            min_latency = "20ms"
            max_latency = "60ms"
            seed = 7

            [logging]
            level = "debug"
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.protocol.max_payload_size, 512);
        assert_eq!(config.protocol.reliability().max_retries, 5);
        assert_eq!(config.protocol.reliability().ttl, Duration::from_secs(2));
        assert_eq!(config.links.len(), 2);
        assert_eq!(config.links[0].mtu, DEFAULT_MTU);
        assert!(config.links[0].simulator.is_none());

        let sim = config.links[1].simulator.as_ref().unwrap();
        assert_eq!(sim.loss_rate, 0.1);
        assert_eq!(sim.max_latency, Duration::from_millis(60));
        assert_eq!(sim.seed, 7);
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_invalid_payload_size() {
        let err = Config::from_toml_str("[protocol]\nmax_payload_size = 1\n").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_timers_beyond_limit_rejected() {
        let err = Config::from_toml_str("[protocol]\nttl = \"2days\"\n").unwrap_err();
        assert!(err.to_string().contains("ttl"));

        let err = Config::from_toml_str(
            "[protocol]\nretry_policy = { type = \"fixed\", interval = \"400years\" }\n",
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        assert!(Config::from_toml_str("[protocol]\nttl = \"24h\"\n").is_ok());
    }

    #[test]
    fn test_logging_settings_validated() {
        let err = Config::from_toml_str("[logging]\nformat = \"xml\"\n").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        let err = Config::from_toml_str("[logging]\nlevel = \"ogp=loud\"\n").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        let config = Config::from_toml_str("[logging]\nlevel = \"ogp=trace,tokio=warn\"\n");
        assert!(config.is_ok());
    }

    #[test]
    fn test_init_logging_only_once() {
        let config = LoggingConfig {
            level: "debug".into(),
            ..LoggingConfig::default()
        };
        // The first call may lose to another test in this binary.
        let _ = init_logging(&config);
        assert!(matches!(init_logging(&config), Err(Error::Config(_))));

        let broken = LoggingConfig {
            level: "ogp=loud".into(),
            ..LoggingConfig::default()
        };
        assert!(init_logging(&broken).is_err());
    }

    #[test]
    fn test_invalid_simulator_rates() {
        let err = Config::from_toml_str(
            r#"
            [[links]]
            name = "bad"
            bind = "127.0.0.1:0"
            peer = "127.0.0.1:9"
            [links.simulator]
            loss_rate = 2.0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_duplicate_link_names() {
        let err = Config::from_toml_str(
            r#"
            [[links]]
            name = "wifi"
            bind = "127.0.0.1:0"
            peer = "127.0.0.1:9"
            [[links]]
            name = "wifi"
            bind = "127.0.0.1:0"
            peer = "127.0.0.1:10"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Duplicate link name"));
    }

    #[test]
    fn test_parse_errors_are_config_errors() {
        assert!(matches!(
            Config::from_toml_str("protocol = 5"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("ogp-config-{}.toml", std::process::id()));
        let mut config = Config::default();
        config.protocol.max_retries = 9;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.protocol.max_retries, 9);
        let _ = std::fs::remove_file(&path);
    }
}
