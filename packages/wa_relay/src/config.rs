use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use wa_session::{AutoReplySettings, BatchSettings, ReconnectPolicy, SessionTimings};

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [responder]
//                    endpoint = "http://php/whatsapp.php"
//
//   env var:         WA_RELAY_RESPONDER__ENDPOINT=...   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub sessions: SessionsFileConfig,
    #[serde(default)]
    pub responder: ResponderFileConfig,
    #[serde(default)]
    pub send: SendFileConfig,
    #[serde(default)]
    pub bridge: BridgeFileConfig,
    #[serde(default)]
    pub sse: SseFileConfig,
}

/// Lives under `[server]` in config.toml.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory holding the dashboard and QR pages.
    #[serde(default)]
    pub public_dir: Option<PathBuf>,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_dir: None,
        }
    }
}

/// Lives under `[sessions]` in config.toml.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionsFileConfig {
    /// Sessions started at boot. Others start on first reference.
    #[serde(default = "default_agents")]
    pub agents: Vec<String>,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_reconnect_multiplier")]
    pub reconnect_multiplier: f64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    /// Unset retries forever.
    #[serde(default)]
    pub reconnect_max_attempts: Option<u32>,
    #[serde(default = "default_teardown_grace_ms")]
    pub teardown_grace_ms: u64,
    /// Per-agent lists of numbers that get automatic replies.
    #[serde(default)]
    pub whitelist: HashMap<String, Vec<String>>,
    #[serde(default = "default_true")]
    pub auto_reply: bool,
    /// Upper bound on running sessions, boot agents included.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for SessionsFileConfig {
    fn default() -> Self {
        Self {
            agents: default_agents(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            reconnect_multiplier: default_reconnect_multiplier(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            reconnect_max_attempts: None,
            teardown_grace_ms: default_teardown_grace_ms(),
            whitelist: HashMap::new(),
            auto_reply: true,
            max_sessions: default_max_sessions(),
        }
    }
}

impl SessionsFileConfig {
    pub fn timings(&self) -> SessionTimings {
        SessionTimings {
            reconnect: ReconnectPolicy {
                delay: Duration::from_millis(self.reconnect_delay_ms),
                multiplier: self.reconnect_multiplier,
                max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
                max_attempts: self.reconnect_max_attempts,
            },
            teardown_grace: Duration::from_millis(self.teardown_grace_ms),
        }
    }

    /// Configured boot agents always fit under the cap.
    pub fn session_limit(&self) -> usize {
        self.max_sessions.max(self.agents.len())
    }

    pub fn auto_reply_settings(&self) -> AutoReplySettings {
        let whitelists = self
            .whitelist
            .iter()
            .map(|(agent, numbers)| {
                let numbers: HashSet<String> = numbers
                    .iter()
                    .map(|n| n.chars().filter(char::is_ascii_digit).collect::<String>())
                    .filter(|n| !n.is_empty())
                    .collect();
                (agent.clone(), numbers)
            })
            .filter(|(_, numbers)| !numbers.is_empty())
            .collect();
        AutoReplySettings {
            enabled: self.auto_reply,
            whitelists,
        }
    }
}

/// Lives under `[responder]` in config.toml.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResponderFileConfig {
    #[serde(default = "default_responder_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_responder_secret")]
    pub secret: String,
    #[serde(default = "default_responder_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ResponderFileConfig {
    fn default() -> Self {
        Self {
            endpoint: default_responder_endpoint(),
            secret: default_responder_secret(),
            timeout_secs: default_responder_timeout_secs(),
        }
    }
}

/// Lives under `[send]` in config.toml.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SendFileConfig {
    #[serde(default = "default_rate_ms")]
    pub rate_ms: u64,
    #[serde(default = "default_text")]
    pub default_text: String,
    /// Recipient of `GET /send-batch-demo`.
    #[serde(default)]
    pub demo_recipient: Option<String>,
    #[serde(default)]
    pub default_country_code: Option<String>,
    #[serde(default)]
    pub templates: HashMap<String, String>,
}

impl Default for SendFileConfig {
    fn default() -> Self {
        Self {
            rate_ms: default_rate_ms(),
            default_text: default_text(),
            demo_recipient: None,
            default_country_code: None,
            templates: HashMap::new(),
        }
    }
}

impl SendFileConfig {
    pub fn batch_settings(&self) -> BatchSettings {
        BatchSettings {
            rate: Duration::from_millis(self.rate_ms),
            default_text: self.default_text.clone(),
            templates: self.templates.clone(),
            default_country_code: self.default_country_code.clone(),
        }
    }
}

/// Lives under `[bridge]` in config.toml.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BridgeFileConfig {
    #[serde(default = "default_bridge_url")]
    pub url: String,
}

impl Default for BridgeFileConfig {
    fn default() -> Self {
        Self {
            url: default_bridge_url(),
        }
    }
}

/// Lives under `[sse]` in config.toml.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SseFileConfig {
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    #[serde(default = "default_retry_ms")]
    pub retry_ms: u64,
}

impl Default for SseFileConfig {
    fn default() -> Self {
        Self {
            keepalive_secs: default_keepalive_secs(),
            retry_ms: default_retry_ms(),
        }
    }
}

/// Push channel timing (runtime view).
#[derive(Clone, Debug)]
pub struct SseConfig {
    pub keepalive: Duration,
    pub retry: Duration,
}

impl SseConfig {
    pub fn from_file(fc: &SseFileConfig) -> Self {
        Self {
            keepalive: Duration::from_secs(fc.keepalive_secs.max(1)),
            retry: Duration::from_millis(fc.retry_ms),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_agents() -> Vec<String> {
    vec!["default".to_string()]
}
fn default_reconnect_delay_ms() -> u64 {
    750
}
fn default_reconnect_multiplier() -> f64 {
    1.0
}
fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}
fn default_teardown_grace_ms() -> u64 {
    600
}
fn default_max_sessions() -> usize {
    16
}
fn default_true() -> bool {
    true
}
fn default_responder_endpoint() -> String {
    "http://php/whatsapp.php".to_string()
}
fn default_responder_secret() -> String {
    "change-this-secret".to_string()
}
fn default_responder_timeout_secs() -> u64 {
    30
}
fn default_rate_ms() -> u64 {
    800
}
fn default_text() -> String {
    "Mensaje de prueba".to_string()
}
fn default_bridge_url() -> String {
    "ws://127.0.0.1:8787/bridge".to_string()
}
fn default_keepalive_secs() -> u64 {
    15
}
fn default_retry_ms() -> u64 {
    5000
}

/// Build a figment that layers: defaults → config.toml → WA_RELAY_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `WA_RELAY_SERVER__PORT=8080`  →  `server.port = 8080`
///   `WA_RELAY_SESSIONS__WHITELIST__SALES=["34600000000"]`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("WA_RELAY_").split("__"))
}

// =============================================================================
// Directory layout config (not tunable via figment, derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct RelayPaths {
    pub data_dir: PathBuf,
    /// One credential directory per session lives under here.
    pub auth_dir: PathBuf,
    pub events_path: PathBuf,
}

impl RelayPaths {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".wa-relay"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let auth_dir = data_dir.join("auth");
        std::fs::create_dir_all(&auth_dir)
            .with_context(|| format!("Failed to create auth directory: {:?}", auth_dir))?;

        let log_dir = data_dir.join("data");
        std::fs::create_dir_all(&log_dir)
            .with_context(|| format!("Failed to create log directory: {:?}", log_dir))?;

        info!("Data directory: {}", data_dir.display());

        Ok(Self {
            events_path: log_dir.join("events.ndjson"),
            data_dir,
            auth_dir,
        })
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_config_defaults() {
        let fc = FileConfig::default();
        assert_eq!(fc.server.port, 3000);
        assert_eq!(fc.sessions.agents, vec!["default"]);
        assert_eq!(fc.send.rate_ms, 800);
        assert_eq!(fc.sse.retry_ms, 5000);
        assert!(fc.sessions.auto_reply);
        assert_eq!(fc.sessions.max_sessions, 16);
    }

    #[test]
    fn test_session_limit_covers_boot_agents() {
        let fc = SessionsFileConfig {
            agents: vec!["a".into(), "b".into(), "c".into()],
            max_sessions: 1,
            ..Default::default()
        };
        assert_eq!(fc.session_limit(), 3);
        assert_eq!(SessionsFileConfig::default().session_limit(), 16);
    }

    #[test]
    fn test_default_timings_reproduce_fixed_delay() {
        let timings = SessionsFileConfig::default().timings();
        assert_eq!(timings.reconnect.delay, Duration::from_millis(750));
        assert_eq!(timings.reconnect.delay_for(50), Some(Duration::from_millis(750)));
        assert_eq!(timings.teardown_grace, Duration::from_millis(600));
    }

    #[test]
    fn test_whitelist_numbers_are_normalized() {
        let fc = SessionsFileConfig {
            whitelist: HashMap::from([
                ("sales".to_string(), vec!["+34 600-000-000".to_string()]),
                ("empty".to_string(), vec!["".to_string()]),
            ]),
            ..Default::default()
        };
        let settings = fc.auto_reply_settings();
        assert!(settings.whitelists["sales"].contains("34600000000"));
        assert!(!settings.whitelists.contains_key("empty"));
    }

    #[test]
    fn test_sse_keepalive_never_zero() {
        let sse = SseConfig::from_file(&SseFileConfig {
            keepalive_secs: 0,
            retry_ms: 100,
        });
        assert_eq!(sse.keepalive, Duration::from_secs(1));
    }

    #[test]
    fn test_relay_paths_with_custom_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = RelayPaths::new(Some(tmp.path().to_path_buf())).unwrap();
        assert!(paths.auth_dir.is_dir());
        assert_eq!(paths.events_path, tmp.path().join("data/events.ndjson"));
        assert_eq!(paths.config_toml_path(), tmp.path().join("config.toml"));
    }

    #[test]
    fn test_load_config_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.server.host, "127.0.0.1");
        assert_eq!(fc.responder.timeout_secs, 30);
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("config.toml"),
            "[server]\nport = 8080\n\n[sessions]\nagents = [\"sales\", \"support\"]\nreconnect_max_attempts = 5\n\n[send.templates]\ngreeting = \"Hola {{ nombre }}\"\n",
        )
        .unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.server.port, 8080);
        assert_eq!(fc.sessions.agents, vec!["sales", "support"]);
        assert_eq!(fc.sessions.reconnect_max_attempts, Some(5));
        assert_eq!(fc.send.templates["greeting"], "Hola {{ nombre }}");
        assert_eq!(fc.send.rate_ms, 800);
    }
}
