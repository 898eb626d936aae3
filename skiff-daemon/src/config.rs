//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

/// Daemon configuration. File: ~/.config/skiff/config.toml or /etc/skiff/config.toml.
/// Env overrides: SKIFF_DISCOVERY_PORT, SKIFF_TRANSPORT_PORT, SKIFF_DISPLAY_NAME,
/// SKIFF_DOWNLOAD_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Discovery UDP port (default 47701).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Transport TCP port (default 47702).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    /// Name shown to other devices.
    #[serde(default = "default_display_name")]
    pub display_name: String,
    /// Where received files land.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
}

fn default_discovery_port() -> u16 {
    47701
}
fn default_transport_port() -> u16 {
    47702
}
fn default_display_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "skiff".to_string())
}
fn default_download_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".local/share/skiff/incoming"),
        None => PathBuf::from("/tmp/skiff-incoming"),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_port: default_discovery_port(),
            transport_port: default_transport_port(),
            display_name: default_display_name(),
            download_dir: default_download_dir(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_else(Config::default);
    if let Ok(s) = std::env::var("SKIFF_DISCOVERY_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.discovery_port = p;
        }
    }
    if let Ok(s) = std::env::var("SKIFF_TRANSPORT_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.transport_port = p;
        }
    }
    if let Ok(s) = std::env::var("SKIFF_DISPLAY_NAME") {
        if !s.is_empty() {
            c.display_name = s;
        }
    }
    if let Ok(s) = std::env::var("SKIFF_DOWNLOAD_DIR") {
        if !s.is_empty() {
            c.download_dir = PathBuf::from(s);
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/skiff/config.toml"));
    }
    out.push(PathBuf::from("/etc/skiff/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = toml::from_str::<Config>(&s) {
                    return Some(c);
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
    fn empty_file_uses_defaults() {
        let c: Config = toml::from_str("").unwrap();
        assert_eq!(c.discovery_port, 47701);
        assert_eq!(c.transport_port, 47702);
    }

    #[test]
    fn file_values_override_defaults() {
        let c: Config = toml::from_str(
            "discovery_port = 50001\ntransport_port = 50002\ndisplay_name = \"den pc\"\n",
        )
        .unwrap();
        assert_eq!(c.discovery_port, 50001);
        assert_eq!(c.transport_port, 50002);
        assert_eq!(c.display_name, "den pc");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 1\n").is_err());
    }
}
