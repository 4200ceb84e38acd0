use serde::{Deserialize, Serialize};
use std::env;
use std::net::{IpAddr, Ipv4Addr};

use crate::paths::ConfigPaths;
use crate::ports::PortConfig;
use crate::runtime::RuntimeConfig;
use crate::specialist::SpecialistConfig;
use crate::tunnel::{TunnelConfig, TunnelMode};

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_port() -> u16 {
    7400
}

fn default_allowed_origins() -> Vec<String> {
    match env::var("DEVLOOP_ALLOWED_ORIGINS") {
        Ok(val) => val
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    /// Port the agent server listens on.
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
    #[serde(default)]
    pub ports: PortConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub specialists: Vec<SpecialistConfig>,
    #[serde(skip)]
    paths: Option<ConfigPaths>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            allowed_origins: default_allowed_origins(),
            ports: PortConfig::default(),
            tunnel: TunnelConfig::default(),
            runtime: RuntimeConfig::default(),
            specialists: Vec::new(),
            paths: None,
        }
    }
}

impl DaemonConfig {
    /// Returns the `ConfigPaths` for this config. If paths haven't been set,
    /// creates the default paths (may fail if `$HOME` is unset).
    pub fn paths(&self) -> anyhow::Result<ConfigPaths> {
        match &self.paths {
            Some(p) => Ok(p.clone()),
            None => ConfigPaths::new(),
        }
    }

    pub fn set_paths(&mut self, paths: ConfigPaths) {
        self.paths = Some(paths);
    }

    /// Load config from the default location (`~/.devloop/config.toml`).
    pub fn load() -> anyhow::Result<Self> {
        let paths = ConfigPaths::new()?;
        Self::load_from(&paths)
    }

    pub fn load_from(paths: &ConfigPaths) -> anyhow::Result<Self> {
        let config_file = paths.config_path();
        let mut config = if config_file.exists() {
            let content = std::fs::read_to_string(&config_file)?;
            let config: DaemonConfig = toml::from_str(&content)?;
            config
        } else {
            Self::default()
        };
        config.paths = Some(paths.clone());
        config.validate()?;
        Ok(config)
    }

    /// Validate config values. Called automatically by `load` / `load_from`.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ports.range_start > self.ports.range_end {
            anyhow::bail!(
                "ports.range_start ({}) must not exceed ports.range_end ({})",
                self.ports.range_start,
                self.ports.range_end
            );
        }
        if self.ports.max_attempts == 0 {
            anyhow::bail!("ports.max_attempts must be greater than 0");
        }
        if self.tunnel.binary.is_empty() {
            anyhow::bail!("tunnel.binary must not be empty");
        }
        if self.tunnel.mode == TunnelMode::Named
            && (self.tunnel.name.is_none() || self.tunnel.domain.is_none())
        {
            anyhow::bail!("tunnel.name and tunnel.domain are required for named tunnels");
        }
        if self.runtime.binary.is_empty() {
            anyhow::bail!("runtime.binary must not be empty");
        }
        if self.runtime.startup_timeout_secs == 0 {
            anyhow::bail!("runtime.startup_timeout_secs must be greater than 0");
        }
        let mut seen = std::collections::HashSet::new();
        for specialist in &self.specialists {
            if !seen.insert(specialist.id.as_str()) {
                anyhow::bail!("duplicate specialist id '{}'", specialist.id);
            }
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_paths() -> ConfigPaths {
        let dir = tempfile::tempdir().unwrap();
        ConfigPaths::with_base(dir.keep())
    }

    #[test]
    fn default_produces_expected_values() {
        let config = DaemonConfig::default();
        assert_eq!(config.host, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.port, 7400);
        assert_eq!(config.ports.default_port, 8081);
        assert_eq!(config.tunnel.mode, TunnelMode::Quick);
        assert_eq!(config.runtime.startup_timeout_secs, 10);
        assert!(config.specialists.is_empty());
    }

    #[test]
    fn bind_addr_formats_correctly() {
        let mut config = DaemonConfig::default();
        config.port = 8080;
        assert_eq!(config.bind_addr(), "127.0.0.1:8080");
    }

    #[test]
    fn load_with_no_file_returns_default() {
        let paths = test_paths();
        paths.ensure_config_dir().unwrap();
        let config = DaemonConfig::load_from(&paths).unwrap();
        assert_eq!(config.port, 7400);
    }

    #[test]
    fn load_with_sections() {
        let paths = test_paths();
        paths.ensure_config_dir().unwrap();
        std::fs::write(
            paths.config_path(),
            r#"
port = 7500

[ports]
default_port = 19000

[tunnel]
mode = "named"
name = "dev-box"
domain = "dev.example.com"

[runtime]
binary = "/opt/opencode/bin/opencode"
startup_timeout_secs = 20

[[specialists]]
id = "reviewer"
name = "Code Reviewer"
prompt = "Review the diff."
"#,
        )
        .unwrap();
        let config = DaemonConfig::load_from(&paths).unwrap();
        assert_eq!(config.port, 7500);
        assert_eq!(config.ports.default_port, 19000);
        assert_eq!(config.ports.range_end, 9999);
        assert_eq!(config.tunnel.mode, TunnelMode::Named);
        assert_eq!(config.tunnel.domain.as_deref(), Some("dev.example.com"));
        assert_eq!(config.runtime.startup_timeout_secs, 20);
        assert_eq!(config.specialists.len(), 1);
        assert_eq!(config.specialists[0].id, "reviewer");
    }

    #[test]
    fn load_with_invalid_toml_returns_error() {
        let paths = test_paths();
        paths.ensure_config_dir().unwrap();
        std::fs::write(paths.config_path(), "not valid {{{{ toml").unwrap();
        assert!(DaemonConfig::load_from(&paths).is_err());
    }

    #[test]
    fn validate_rejects_inverted_range() {
        let mut config = DaemonConfig::default();
        config.ports.range_start = 9000;
        config.ports.range_end = 8000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_named_tunnel_without_domain() {
        let mut config = DaemonConfig::default();
        config.tunnel.mode = TunnelMode::Named;
        config.tunnel.name = Some("dev".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_runtime_timeout() {
        let mut config = DaemonConfig::default();
        config.runtime.startup_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_duplicate_specialists() {
        let mut config = DaemonConfig::default();
        let specialist = SpecialistConfig {
            id: "dup".to_string(),
            name: "Dup".to_string(),
            description: None,
            prompt: "x".to_string(),
        };
        config.specialists = vec![specialist.clone(), specialist];
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_roundtrip() {
        let config = DaemonConfig::default();
        let serialized = toml::to_string(&config).unwrap();
        let deserialized: DaemonConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(deserialized.port, config.port);
        assert_eq!(deserialized.host, config.host);
        assert_eq!(deserialized.tunnel.binary, config.tunnel.binary);
    }

    #[test]
    fn set_paths_is_used_by_paths_accessor() {
        let mut config = DaemonConfig::default();
        let base = PathBuf::from("/custom/base");
        config.set_paths(ConfigPaths::with_base(base.clone()));
        let paths = config.paths().unwrap();
        assert_eq!(paths.config_dir(), base.as_path());
    }
}
