use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

use crate::codec::DEFAULT_MAX_FRAME_BYTES;
use crate::gateway::GatewayOptions;
use crate::instrument::{Instrument, InstrumentManager};
use crate::session::{Credentials, SessionConfig};
use crate::transport::Endpoint;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    /// Per-frame `wire` target logs (very verbose)
    #[serde(default)]
    pub enable_tracing: bool,
    pub session: SessionSection,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub instruments: Vec<Instrument>,
    /// Instruments subscribed on start
    #[serde(default)]
    pub subscriptions: Vec<String>,
}

/// Exchange front and login identity
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SessionSection {
    /// `tcp://host:port`, `ws://...` or `wss://...`
    pub endpoint: String,
    pub broker_id: String,
    pub user_id: String,
    pub password: String,
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub auth_code: String,
    #[serde(default)]
    pub confirm_settlement: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TimeoutConfig {
    pub connect_ms: u64,
    pub login_ms: u64,
    /// Wait for one heartbeat ack
    pub heartbeat_ms: u64,
    /// One receive wait; bounds how fast shutdown is observed
    pub receive_ms: u64,
    /// One frame write; a stalled peer forces a reconnect
    pub send_ms: u64,
    pub reconcile_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 5_000,
            login_ms: 10_000,
            heartbeat_ms: 5_000,
            receive_ms: 500,
            send_ms: 2_000,
            reconcile_ms: 10_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    pub missed_before_degraded: u32,
    pub extra_missed_before_reconnect: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            missed_before_degraded: 3,
            extra_missed_before_reconnect: 2,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Omit to retry forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            max_attempts: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ProtocolConfig {
    pub max_frame_bytes: usize,
    pub max_consecutive_protocol_errors: u32,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_consecutive_protocol_errors: 5,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LedgerConfig {
    /// How long terminal orders are kept for late duplicates
    pub retention_ms: u64,
    pub command_queue_size: usize,
    pub shutdown_timeout_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            retention_ms: 300_000,
            command_queue_size: 4096,
            shutdown_timeout_ms: 3_000,
        }
    }
}

impl AppConfig {
    /// Load `config/{env}.yaml`
    pub fn load(env: &str) -> Result<Self, ConfigError> {
        Self::from_file(&format!("config/{}.yaml", env))
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parse and validate
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig =
            serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.session;
        if s.endpoint.parse::<Endpoint>().is_err() {
            return Err(ConfigError::Invalid(format!("bad endpoint '{}'", s.endpoint)));
        }
        for (field, value) in [
            ("broker_id", &s.broker_id),
            ("user_id", &s.user_id),
            ("password", &s.password),
        ] {
            if value.is_empty() {
                return Err(ConfigError::Invalid(format!("session.{} is empty", field)));
            }
        }
        if self.timeouts.send_ms == 0 {
            return Err(ConfigError::Invalid("timeouts.send_ms must be positive".to_string()));
        }
        if self.heartbeat.interval_ms == 0 || self.timeouts.heartbeat_ms == 0 {
            return Err(ConfigError::Invalid("heartbeat timings must be positive".to_string()));
        }
        if self.heartbeat.missed_before_degraded == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat.missed_before_degraded must be positive".to_string(),
            ));
        }
        if self.ledger.command_queue_size == 0 {
            return Err(ConfigError::Invalid("ledger.command_queue_size must be positive".to_string()));
        }

        let instruments = self.instrument_manager()?;
        if let Some(unknown) = self
            .subscriptions
            .iter()
            .find(|name| instruments.get_id(name).is_none())
        {
            return Err(ConfigError::Invalid(format!(
                "subscription to unknown instrument '{}'",
                unknown
            )));
        }
        Ok(())
    }

    pub fn instrument_manager(&self) -> Result<InstrumentManager, ConfigError> {
        InstrumentManager::from_instruments(self.instruments.iter().cloned())
            .map_err(ConfigError::Invalid)
    }

    pub fn session_config(&self) -> Result<SessionConfig, ConfigError> {
        let s = &self.session;
        let endpoint: Endpoint = s
            .endpoint
            .parse()
            .map_err(|e: crate::transport::TransportError| ConfigError::Invalid(e.to_string()))?;
        let credentials = Credentials {
            broker_id: s.broker_id.clone(),
            user_id: s.user_id.clone(),
            password: s.password.clone(),
            app_id: s.app_id.clone(),
            auth_code: s.auth_code.clone(),
        };

        let mut cfg = SessionConfig::new(endpoint, credentials);
        cfg.confirm_settlement = s.confirm_settlement;
        cfg.connect_timeout = Duration::from_millis(self.timeouts.connect_ms);
        cfg.login_timeout = Duration::from_millis(self.timeouts.login_ms);
        cfg.heartbeat_timeout = Duration::from_millis(self.timeouts.heartbeat_ms);
        cfg.receive_timeout = Duration::from_millis(self.timeouts.receive_ms);
        cfg.send_timeout = Duration::from_millis(self.timeouts.send_ms);
        cfg.reconcile_timeout = Duration::from_millis(self.timeouts.reconcile_ms);
        cfg.heartbeat_interval = Duration::from_millis(self.heartbeat.interval_ms);
        cfg.missed_before_degraded = self.heartbeat.missed_before_degraded;
        cfg.extra_missed_before_reconnect = self.heartbeat.extra_missed_before_reconnect;
        cfg.initial_backoff = Duration::from_millis(self.reconnect.initial_backoff_ms);
        cfg.max_backoff = Duration::from_millis(self.reconnect.max_backoff_ms);
        cfg.max_reconnect_attempts = self.reconnect.max_attempts;
        cfg.max_frame_bytes = self.protocol.max_frame_bytes;
        cfg.max_consecutive_protocol_errors = self.protocol.max_consecutive_protocol_errors;
        Ok(cfg)
    }

    pub fn gateway_options(&self) -> GatewayOptions {
        GatewayOptions {
            command_queue_size: self.ledger.command_queue_size,
            retention: Duration::from_millis(self.ledger.retention_ms),
            shutdown_timeout: Duration::from_millis(self.ledger.shutdown_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
log_level: info
log_dir: ./logs
log_file: gateway.log
use_json: false
rotation: daily
session:
  endpoint: tcp://180.168.146.187:10130
  broker_id: "9999"
  user_id: "000001"
  password: secret
  confirm_settlement: true
heartbeat:
  interval_ms: 2000
reconnect:
  max_attempts: 10
instruments:
  - name: rb2410
    exchange: SHFE
    tick_size: "1"
    multiplier: 10
  - name: IF2409
    exchange: CFFEX
    tick_size: "0.2"
    multiplier: 300
subscriptions: [rb2410]
"#;

    #[test]
    fn test_parse_with_defaults() {
        let cfg = AppConfig::from_yaml_str(YAML).unwrap();
        assert!(cfg.session.confirm_settlement);
        assert_eq!(cfg.heartbeat.interval_ms, 2000);
        assert_eq!(cfg.heartbeat.missed_before_degraded, 3);
        assert_eq!(cfg.protocol.max_consecutive_protocol_errors, 5);
        assert_eq!(cfg.instruments[0].lot_size, 1);

        let session = cfg.session_config().unwrap();
        assert_eq!(session.heartbeat_interval, Duration::from_secs(2));
        assert_eq!(session.send_timeout, Duration::from_secs(2));
        assert_eq!(session.max_reconnect_attempts, Some(10));
        assert_eq!(session.missed_before_reconnect(), 5);
        assert_eq!(
            session.endpoint,
            Endpoint::Tcp("180.168.146.187:10130".to_string())
        );
        assert_eq!(cfg.instrument_manager().unwrap().len(), 2);
    }

    #[test]
    fn test_rejects_unknown_subscription() {
        let yaml = YAML.replace("subscriptions: [rb2410]", "subscriptions: [cu2410]");
        let err = AppConfig::from_yaml_str(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref m) if m.contains("cu2410")));
    }

    #[test]
    fn test_rejects_empty_password() {
        let yaml = YAML.replace("password: secret", "password: \"\"");
        assert!(matches!(
            AppConfig::from_yaml_str(&yaml),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_rejects_bad_endpoint() {
        let yaml = YAML.replace("tcp://180.168.146.187:10130", "udp://x:1");
        assert!(AppConfig::from_yaml_str(&yaml).is_err());
    }

    #[test]
    fn test_shipped_profiles_load() {
        for env in ["dev", "ci"] {
            let cfg = AppConfig::load(env).unwrap();
            assert!(cfg.session_config().is_ok(), "{}", env);
            assert_eq!(cfg.subscriptions, vec!["rb2410", "IF2409"]);
        }
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            AppConfig::load("does-not-exist"),
            Err(ConfigError::Read { .. })
        ));
    }
}
