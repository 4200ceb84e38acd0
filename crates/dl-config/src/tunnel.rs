use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TunnelMode {
    /// Ephemeral `*.trycloudflare.com` URL scraped from process output.
    #[default]
    Quick,
    /// Persistent tunnel with a fixed hostname.
    Named,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelConfig {
    #[serde(default)]
    pub mode: TunnelMode,
    #[serde(default = "default_binary")]
    pub binary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_binary() -> String {
    "cloudflared".to_string()
}

fn default_startup_timeout_secs() -> u64 {
    30
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            mode: TunnelMode::default(),
            binary: default_binary(),
            name: None,
            domain: None,
            startup_timeout_secs: default_startup_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl TunnelConfig {
    pub fn named(name: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            mode: TunnelMode::Named,
            name: Some(name.into()),
            domain: Some(domain.into()),
            ..Self::default()
        }
    }
}
