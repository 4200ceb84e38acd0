use serde::{Deserialize, Serialize};

/// Port reservation policy for development sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfig {
    /// Conventional dev-server port, tried first.
    #[serde(default = "default_port")]
    pub default_port: u16,
    #[serde(default = "default_range_start")]
    pub range_start: u16,
    #[serde(default = "default_range_end")]
    pub range_end: u16,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
}

fn default_port() -> u16 {
    8081
}

fn default_range_start() -> u16 {
    8082
}

fn default_range_end() -> u16 {
    9999
}

fn default_max_attempts() -> usize {
    10
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            default_port: default_port(),
            range_start: default_range_start(),
            range_end: default_range_end(),
            max_attempts: default_max_attempts(),
        }
    }
}
