//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Node configuration. File: ~/.config/asap/config.toml or /etc/asap/config.toml.
/// Env overrides: ASAP_OWNER, ASAP_ROOT, ASAP_LISTEN_PORT, ASAP_MAX_EXECUTION_TIME_MS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Local peer name (default: $USER, else "asap").
    #[serde(default = "default_owner")]
    pub owner: String,
    /// Storage root folder (default ~/.local/share/asap).
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Application format served by this node.
    #[serde(default = "default_format")]
    pub format: String,
    /// TCP listen port (default 7070).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Peer addresses (host:port) dialed at startup.
    #[serde(default)]
    pub peers: Vec<String>,
    /// Soft deadline for reading and dispatching one PDU (default 30000 ms).
    #[serde(default = "default_max_execution_time_ms")]
    pub max_execution_time_ms: u64,
    /// Relay content received from one peer to the others.
    #[serde(default)]
    pub send_received: bool,
}

fn default_owner() -> String {
    std::env::var("USER")
        .ok()
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| "asap".into())
}
fn default_root() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(h) => PathBuf::from(h).join(".local/share/asap"),
        None => PathBuf::from("/var/lib/asap"),
    }
}
fn default_format() -> String {
    "application/x-asap-chat".into()
}
fn default_listen_port() -> u16 {
    7070
}
fn default_max_execution_time_ms() -> u64 {
    30_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            owner: default_owner(),
            root: default_root(),
            format: default_format(),
            listen_port: default_listen_port(),
            peers: Vec::new(),
            max_execution_time_ms: default_max_execution_time_ms(),
            send_received: false,
        }
    }
}

impl Config {
    pub fn max_execution_time(&self) -> Duration {
        Duration::from_millis(self.max_execution_time_ms)
    }

    /// Folder of the storage for this node's format.
    pub fn storage_root(&self) -> PathBuf {
        self.root
            .join(asap_core::util::escape_file_name(&self.owner))
            .join(asap_core::util::escape_file_name(&self.format))
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("ASAP_OWNER").filter(|s| !s.is_empty()) {
        c.owner = s;
    }
    if let Some(s) = var("ASAP_ROOT").filter(|s| !s.is_empty()) {
        c.root = PathBuf::from(s);
    }
    if let Some(p) = var("ASAP_LISTEN_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.listen_port = p;
    }
    if let Some(ms) = var("ASAP_MAX_EXECUTION_TIME_MS").and_then(|s| s.parse::<u64>().ok()) {
        c.max_execution_time_ms = ms;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/asap/config.toml"));
    }
    out.push(PathBuf::from("/etc/asap/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    let text = match std::fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "could not read config, using defaults");
            return None;
        }
    };
    match toml::from_str::<Config>(&text) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "invalid config, using defaults");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn file_fields_and_defaults() {
        let c: Config = toml::from_str(
            r#"
            owner = "Alice"
            root = "/tmp/asap"
            peers = ["10.0.0.2:7070"]
            send_received = true
            "#,
        )
        .unwrap();
        assert_eq!(c.owner, "Alice");
        assert_eq!(c.root, PathBuf::from("/tmp/asap"));
        assert_eq!(c.peers, vec!["10.0.0.2:7070".to_string()]);
        assert!(c.send_received);
        assert_eq!(c.listen_port, 7070);
        assert_eq!(c.max_execution_time(), Duration::from_secs(30));
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128").is_err());
    }

    #[test]
    fn env_overrides_file() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("ASAP_OWNER", "Bob"),
            ("ASAP_LISTEN_PORT", "9000"),
            ("ASAP_MAX_EXECUTION_TIME_MS", "not a number"),
        ]);
        let mut c = Config::default();
        apply_env(&mut c, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.owner, "Bob");
        assert_eq!(c.listen_port, 9000);
        assert_eq!(c.max_execution_time_ms, 30_000);
    }

    #[test]
    fn storage_root_is_per_owner_and_format() {
        let c = Config {
            owner: "Alice".into(),
            root: PathBuf::from("/data"),
            format: "chat/v1".into(),
            ..Config::default()
        };
        assert_eq!(c.storage_root(), PathBuf::from("/data/Alice/chat%2Fv1"));
    }
}
