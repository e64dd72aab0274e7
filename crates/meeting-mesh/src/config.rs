use std::env;
use std::time::Duration;

use serde::Deserialize;

pub const FALLBACK_STUN_URLS: [&str; 2] = [
    "stun:stun.l.google.com:19302?transport=udp",
    "stun:stun.l.google.com:19302?transport=tcp",
];

const TURN_CANDIDATE_POOL_SIZE: u8 = 10;

/// Timing and channel parameters for a single peer link.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub heartbeat_interval_ms: u64,
    pub control_open_timeout_ms: u64,
    /// Silence on an operational control channel longer than this resets the link.
    pub liveness_timeout_ms: u64,
    pub bitrate_interval_ms: u64,
    pub bitrate_window_ms: u64,
    pub report_bitrates: bool,
    pub control_label: String,
    pub control_channel_id: u16,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1_000,
            control_open_timeout_ms: 15_000,
            liveness_timeout_ms: 10_000,
            bitrate_interval_ms: 500,
            bitrate_window_ms: 5_000,
            report_bitrates: true,
            control_label: "control".to_string(),
            control_channel_id: 0,
        }
    }
}

impl LinkConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn control_open_timeout(&self) -> Duration {
        Duration::from_millis(self.control_open_timeout_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn bitrate_interval(&self) -> Duration {
        Duration::from_millis(self.bitrate_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TurnCredentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    pub servers: Vec<IceServer>,
    pub candidate_pool_size: u8,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self::fallback()
    }
}

impl IceConfig {
    /// Public STUN only, used when no TURN relay is available.
    pub fn fallback() -> Self {
        Self {
            servers: vec![IceServer {
                urls: FALLBACK_STUN_URLS.iter().map(|url| url.to_string()).collect(),
                username: None,
                credential: None,
            }],
            candidate_pool_size: 0,
        }
    }

    pub fn from_turn(urls: &[String], credentials: Option<&TurnCredentials>) -> Self {
        match credentials {
            Some(credentials) if !urls.is_empty() => {
                tracing::info!(target = "mesh", urls = urls.len(), "using turn relay with credentials");
                Self {
                    servers: vec![IceServer {
                        urls: urls.to_vec(),
                        username: Some(credentials.username.clone()),
                        credential: Some(credentials.password.clone()),
                    }],
                    candidate_pool_size: TURN_CANDIDATE_POOL_SIZE,
                }
            }
            _ => {
                tracing::info!(target = "mesh", "turn relay unavailable, using fallback stun");
                Self::fallback()
            }
        }
    }

    /// Host candidates only.
    pub fn local_only() -> Self {
        Self {
            servers: Vec::new(),
            candidate_pool_size: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub link: LinkConfig,
    pub ice: IceConfig,
}

impl MeshConfig {
    /// Load configuration from `MESH_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut link = LinkConfig::default();
        if let Some(value) = env_u64("MESH_HEARTBEAT_MS") {
            link.heartbeat_interval_ms = value;
        }
        if let Some(value) = env_u64("MESH_CONTROL_TIMEOUT_MS") {
            link.control_open_timeout_ms = value;
        }
        if let Some(value) = env_u64("MESH_LIVENESS_TIMEOUT_MS") {
            link.liveness_timeout_ms = value;
        }
        if let Some(value) = env_u64("MESH_BITRATE_INTERVAL_MS") {
            link.bitrate_interval_ms = value;
        }
        if let Some(value) = env_u64("MESH_BITRATE_WINDOW_MS") {
            link.bitrate_window_ms = value;
        }
        if let Some(value) = normalize_opt(env::var("MESH_REPORT_BITRATES").ok()) {
            link.report_bitrates = !matches!(value.as_str(), "0" | "false" | "no" | "off");
        }

        let urls = normalize_opt(env::var("MESH_TURN_URLS").ok())
            .map(|raw| split_urls(&raw))
            .unwrap_or_default();
        let username = normalize_opt(env::var("MESH_TURN_USERNAME").ok());
        let password = normalize_opt(env::var("MESH_TURN_PASSWORD").ok());
        let credentials = match (username, password) {
            (Some(username), Some(password)) => Some(TurnCredentials { username, password }),
            _ => None,
        };
        let ice = if env::var("MESH_LOCAL_ONLY").is_ok() {
            IceConfig::local_only()
        } else {
            IceConfig::from_turn(&urls, credentials.as_ref())
        };

        Self { link, ice }
    }
}

fn split_urls(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_u64(key: &str) -> Option<u64> {
    let raw = normalize_opt(env::var(key).ok())?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(target = "mesh", key, value = %raw, error = %err, "ignoring invalid numeric setting");
            None
        }
    }
}

fn normalize_opt(value: Option<String>) -> Option<String> {
    value.and_then(|s| {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const KEYS: [&str; 6] = [
        "MESH_HEARTBEAT_MS",
        "MESH_TURN_URLS",
        "MESH_TURN_USERNAME",
        "MESH_TURN_PASSWORD",
        "MESH_LOCAL_ONLY",
        "MESH_REPORT_BITRATES",
    ];

    fn clear_env() {
        for key in KEYS {
            env::remove_var(key);
        }
    }

    #[test]
    fn defaults_match_link_timings() {
        let config = LinkConfig::default();
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(1));
        assert_eq!(config.control_open_timeout(), Duration::from_secs(15));
        assert_eq!(config.bitrate_interval(), Duration::from_millis(500));
        assert_eq!(config.bitrate_window_ms, 5_000);
        assert_eq!(config.control_label, "control");
        assert_eq!(config.control_channel_id, 0);
    }

    #[test]
    fn turn_requires_credentials_and_urls() {
        let credentials = TurnCredentials {
            username: "user".into(),
            password: "secret".into(),
        };
        let urls = vec!["turn:turn.example.com:3478".to_string()];

        let turn = IceConfig::from_turn(&urls, Some(&credentials));
        assert_eq!(turn.candidate_pool_size, 10);
        assert_eq!(turn.servers[0].username.as_deref(), Some("user"));
        assert_eq!(turn.servers[0].credential.as_deref(), Some("secret"));

        assert_eq!(IceConfig::from_turn(&[], Some(&credentials)), IceConfig::fallback());
        assert_eq!(IceConfig::from_turn(&urls, None), IceConfig::fallback());
    }

    #[test]
    fn from_env_reads_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        env::set_var("MESH_HEARTBEAT_MS", "250");
        env::set_var("MESH_TURN_URLS", "turn:a.example:3478, turns:b.example:5349");
        env::set_var("MESH_TURN_USERNAME", "alice");
        env::set_var("MESH_TURN_PASSWORD", "pw");
        env::set_var("MESH_REPORT_BITRATES", "off");

        let config = MeshConfig::from_env();
        assert_eq!(config.link.heartbeat_interval_ms, 250);
        assert!(!config.link.report_bitrates);
        assert_eq!(config.ice.servers[0].urls.len(), 2);
        assert_eq!(config.ice.candidate_pool_size, 10);
        clear_env();
    }

    #[test]
    fn from_env_ignores_garbage() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        env::set_var("MESH_HEARTBEAT_MS", "soon");
        let config = MeshConfig::from_env();
        assert_eq!(config.link.heartbeat_interval_ms, 1_000);
        assert_eq!(config.ice, IceConfig::fallback());
        clear_env();
    }

    #[test]
    fn deserializes_partial_config() {
        let config: MeshConfig =
            serde_json::from_str(r#"{"link":{"heartbeat_interval_ms":200}}"#).unwrap();
        assert_eq!(config.link.heartbeat_interval_ms, 200);
        assert_eq!(config.link.control_open_timeout_ms, 15_000);
        assert_eq!(config.ice, IceConfig::fallback());
    }
}
