//! Load config from file and environment.

use std::path::PathBuf;

use serde::Deserialize;

/// Daemon configuration. File: ~/.config/weft/config.toml or
/// /etc/weft/config.toml. Env overrides: WEFT_LISTEN_PORT.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Transport TCP listen port (default 45710).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Tracing filter, e.g. "info" or "weft_core=debug". RUST_LOG wins.
    #[serde(default)]
    pub log_filter: Option<String>,
    /// Peers to register at startup.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

/// A statically configured peer: its stable device id plus where the TCP
/// driver can dial it.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerConfig {
    pub device_id: String,
    pub addr: String,
}

fn default_listen_port() -> u16 {
    45710
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            log_filter: None,
            peers: Vec::new(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("WEFT_LISTEN_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.listen_port = p;
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/weft/config.toml"));
    }
    out.push(PathBuf::from("/etc/weft/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(err) => {
                        tracing::warn!(path = %p.display(), error = %err, "ignoring invalid config file");
                    }
                },
                Err(err) => {
                    tracing::warn!(path = %p.display(), error = %err, "could not read config file");
                }
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.listen_port, 45710);
        assert!(c.peers.is_empty());
    }

    #[test]
    fn parse_with_peers() {
        let c: Config = toml::from_str(
            r#"
            listen_port = 5000

            [[peers]]
            device_id = "00112233445566778899aabbccddeeff"
            addr = "192.168.1.20:45710"
            "#,
        )
        .unwrap();
        assert_eq!(c.listen_port, 5000);
        assert_eq!(c.peers.len(), 1);
        assert_eq!(c.peers[0].addr, "192.168.1.20:45710");
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(toml::from_str::<Config>("bogus = 1").is_err());
    }
}
