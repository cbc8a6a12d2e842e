use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [broker]
//                    enabled = true
//
//   env var:         WEB_REMOTE_BROKER__ENABLED=true   (double underscore = nesting)
//
//   (single underscore stays within field names: WEB_REMOTE_LINK__MAX_BACKOFF_MS)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub link: LinkFileConfig,
    #[serde(default)]
    pub broker: BrokerFileConfig,
}

/// HTTP/WebSocket server knobs (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_public_dir")]
    pub public_dir: PathBuf,
    #[serde(default = "default_remotes_dir")]
    pub remotes_dir: PathBuf,
    /// Outbound frames buffered per front-end session before frames are dropped.
    #[serde(default = "default_session_queue")]
    pub session_queue: usize,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_dir: default_public_dir(),
            remotes_dir: default_remotes_dir(),
            session_queue: default_session_queue(),
        }
    }
}

/// Outbound WebSocket links to instances (lives under `[link]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LinkFileConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Start over from `initial_backoff_ms` once a connection succeeds.
    #[serde(default = "default_reset_backoff_on_connect")]
    pub reset_backoff_on_connect: bool,
}

impl Default for LinkFileConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            urls: Vec::new(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            reset_backoff_on_connect: default_reset_backoff_on_connect(),
        }
    }
}

/// MQTT broker link (lives under `[broker]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrokerFileConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_broker_url")]
    pub url: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_send_topic")]
    pub send_topic: String,
    #[serde(default = "default_receive_topic")]
    pub receive_topic: String,
    #[serde(default = "default_status_topic")]
    pub status_topic: String,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
}

impl Default for BrokerFileConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_broker_url(),
            client_id: default_client_id(),
            send_topic: default_send_topic(),
            receive_topic: default_receive_topic(),
            status_topic: default_status_topic(),
            keep_alive_secs: default_keep_alive_secs(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_public_dir() -> PathBuf {
    PathBuf::from("public")
}
fn default_remotes_dir() -> PathBuf {
    PathBuf::from("config/remotes")
}
fn default_session_queue() -> usize {
    crate::hub::DEFAULT_SESSION_QUEUE
}
fn default_initial_backoff_ms() -> u64 {
    1000
}
fn default_max_backoff_ms() -> u64 {
    300_000
}
fn default_reset_backoff_on_connect() -> bool {
    true
}
fn default_broker_url() -> String {
    "mqtt://localhost:1883".to_string()
}
fn default_client_id() -> String {
    "web-remote".to_string()
}
fn default_send_topic() -> String {
    "ir/send".to_string()
}
fn default_receive_topic() -> String {
    "ir/receive".to_string()
}
fn default_status_topic() -> String {
    "ir/status/#".to_string()
}
fn default_keep_alive_secs() -> u64 {
    30
}
fn default_reconnect_delay_secs() -> u64 {
    5
}

/// Build a figment that layers: defaults → config.toml → WEB_REMOTE_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `WEB_REMOTE_BROKER__URL=mqtt://pi:1883`  →  `broker.url = "mqtt://pi:1883"`
///   `WEB_REMOTE_SERVER__PORT=8080`  →  `server.port = 8080`
pub fn load_config(config_path: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_path))
        .merge(Env::prefixed("WEB_REMOTE_").split("__"))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid broker url {0:?}: expected mqtt://host[:port] or tcp://host[:port]")]
    InvalidBrokerUrl(String),
}

// =============================================================================
// Runtime config structs (derived from FileConfig, used throughout the relay)
// =============================================================================

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub public_dir: PathBuf,
    pub remotes_dir: PathBuf,
    pub session_queue: usize,
}

impl ServerConfig {
    pub fn from_file(fc: &ServerFileConfig) -> Self {
        Self {
            host: fc.host.clone(),
            port: fc.port,
            public_dir: fc.public_dir.clone(),
            remotes_dir: fc.remotes_dir.clone(),
            session_queue: fc.session_queue.max(1),
        }
    }
}

#[derive(Clone, Debug)]
pub struct LinkConfig {
    /// Target URLs; empty when links are disabled.
    pub urls: Vec<String>,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub reset_backoff_on_connect: bool,
}

impl LinkConfig {
    pub fn from_file(fc: &LinkFileConfig) -> Self {
        let initial_backoff = Duration::from_millis(fc.initial_backoff_ms.max(1));
        Self {
            urls: if fc.enabled { fc.urls.clone() } else { Vec::new() },
            initial_backoff,
            max_backoff: Duration::from_millis(fc.max_backoff_ms).max(initial_backoff),
            reset_backoff_on_connect: fc.reset_backoff_on_connect,
        }
    }
}

#[derive(Clone, Debug)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub send_topic: String,
    pub receive_topic: String,
    pub status_topic: String,
    pub keep_alive: Duration,
    pub reconnect_delay: Duration,
}

impl BrokerConfig {
    /// `None` when the broker is disabled.
    pub fn from_file(fc: &BrokerFileConfig) -> Result<Option<Self>, ConfigError> {
        if !fc.enabled {
            return Ok(None);
        }
        let (host, port) = parse_broker_url(&fc.url)?;
        Ok(Some(Self {
            host,
            port,
            client_id: match fc.client_id.trim() {
                "" => default_client_id(),
                id => id.to_string(),
            },
            send_topic: fc.send_topic.clone(),
            receive_topic: fc.receive_topic.clone(),
            status_topic: fc.status_topic.clone(),
            keep_alive: Duration::from_secs(fc.keep_alive_secs.max(5)),
            reconnect_delay: Duration::from_secs(fc.reconnect_delay_secs),
        }))
    }
}

const DEFAULT_MQTT_PORT: u16 = 1883;

/// Split `mqtt://host[:port]` into host and port (default 1883). IPv6
/// literals must be bracketed: `mqtt://[::1]:1883`.
pub fn parse_broker_url(url: &str) -> Result<(String, u16), ConfigError> {
    let invalid = || ConfigError::InvalidBrokerUrl(url.to_string());

    let rest = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .ok_or_else(invalid)?;
    let authority = rest.trim_end_matches('/');

    let parse_port = |port: &str| port.parse::<u16>().map_err(|_| invalid());

    // `[v6]` or `[v6]:port`; the brackets are not part of the host.
    let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, tail) = bracketed.split_once(']').ok_or_else(invalid)?;
        let port = match tail {
            "" => DEFAULT_MQTT_PORT,
            _ => parse_port(tail.strip_prefix(':').ok_or_else(invalid)?)?,
        };
        (host, port)
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, parse_port(port)?),
            None => (authority, DEFAULT_MQTT_PORT),
        }
    };
    if host.is_empty() || host.contains('/') || host.contains('[') || host.contains(']') {
        return Err(invalid());
    }
    // Unbracketed v6 literals are ambiguous with a port.
    if !authority.starts_with('[') && host.contains(':') {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}

/// Everything the relay needs at start-up.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub link: LinkConfig,
    pub broker: Option<BrokerConfig>,
}

impl RelayConfig {
    pub fn from_file(fc: &FileConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            server: ServerConfig::from_file(&fc.server),
            link: LinkConfig::from_file(&fc.link),
            broker: BrokerConfig::from_file(&fc.broker)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_file_config_defaults() {
        let fc = ServerFileConfig::default();
        assert_eq!(fc.host, "0.0.0.0");
        assert_eq!(fc.port, 3000);
        assert_eq!(fc.remotes_dir, PathBuf::from("config/remotes"));
        assert_eq!(fc.session_queue, 100);
    }

    #[test]
    fn test_link_config_disabled_has_no_urls() {
        let fc = LinkFileConfig {
            urls: vec!["ws://irremote.local:81/".to_string()],
            ..Default::default()
        };
        let config = LinkConfig::from_file(&fc);
        assert!(config.urls.is_empty());
        assert_eq!(config.initial_backoff, Duration::from_secs(1));
        assert_eq!(config.max_backoff, Duration::from_secs(300));
        assert!(config.reset_backoff_on_connect);
    }

    #[test]
    fn test_link_config_max_never_below_initial() {
        let fc = LinkFileConfig {
            enabled: true,
            initial_backoff_ms: 5000,
            max_backoff_ms: 10,
            ..Default::default()
        };
        let config = LinkConfig::from_file(&fc);
        assert_eq!(config.max_backoff, config.initial_backoff);
    }

    #[test]
    fn test_broker_disabled_is_none() {
        let config = BrokerConfig::from_file(&BrokerFileConfig::default()).unwrap();
        assert!(config.is_none());
    }

    #[test]
    fn test_parse_broker_url() {
        assert_eq!(
            parse_broker_url("mqtt://localhost:1883").unwrap(),
            ("localhost".to_string(), 1883)
        );
        assert_eq!(
            parse_broker_url("tcp://10.0.0.5").unwrap(),
            ("10.0.0.5".to_string(), 1883)
        );
        assert_eq!(
            parse_broker_url("mqtt://broker.lan:8883/").unwrap(),
            ("broker.lan".to_string(), 8883)
        );
        assert!(parse_broker_url("http://localhost").is_err());
        assert!(parse_broker_url("mqtt://").is_err());
        assert!(parse_broker_url("mqtt://host:notaport").is_err());
    }

    #[test]
    fn test_parse_broker_url_ipv6() {
        assert_eq!(
            parse_broker_url("mqtt://[::1]:1884").unwrap(),
            ("::1".to_string(), 1884)
        );
        assert_eq!(
            parse_broker_url("tcp://[fd00::5]/").unwrap(),
            ("fd00::5".to_string(), 1883)
        );
        assert!(parse_broker_url("mqtt://[::1").is_err());
        assert!(parse_broker_url("mqtt://[::1]x").is_err());
        assert!(parse_broker_url("mqtt://[]:1883").is_err());
        assert!(parse_broker_url("mqtt://::1:1883").is_err());
    }

    #[test]
    fn test_load_config_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: FileConfig = load_config(&tmp.path().join("config.toml"))
            .extract()
            .unwrap();
        assert!(!fc.link.enabled);
        assert!(!fc.broker.enabled);
        assert_eq!(fc.broker.status_topic, "ir/status/#");
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            "[server]\nport = 8080\n\n[link]\nenabled = true\nurls = [\"ws://a:81/\", \"ws://b:81/\"]\nreset_backoff_on_connect = false\n\n[broker]\nenabled = true\nurl = \"mqtt://pi.lan\"\nsend_topic = \"home/ir/send\"\n",
        )
        .unwrap();

        let fc: FileConfig = load_config(&path).extract().unwrap();
        let config = RelayConfig::from_file(&fc).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.link.urls.len(), 2);
        assert!(!config.link.reset_backoff_on_connect);

        let broker = config.broker.unwrap();
        assert_eq!(broker.host, "pi.lan");
        assert_eq!(broker.port, 1883);
        assert_eq!(broker.send_topic, "home/ir/send");
        assert_eq!(broker.receive_topic, "ir/receive");
    }

    #[test]
    fn test_invalid_broker_url_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[broker]\nenabled = true\nurl = \"ws://nope\"\n").unwrap();

        let fc: FileConfig = load_config(&path).extract().unwrap();
        assert!(matches!(
            RelayConfig::from_file(&fc),
            Err(ConfigError::InvalidBrokerUrl(_))
        ));
    }
}
