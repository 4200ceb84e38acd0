use serde::{Deserialize, Serialize};

/// How the backing agent runtime (`opencode serve`) is launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Executable name (looked up on `PATH`) or absolute path.
    #[serde(default = "default_binary")]
    pub binary: String,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
}

fn default_binary() -> String {
    "opencode".to_string()
}

fn default_hostname() -> String {
    "127.0.0.1".to_string()
}

fn default_startup_timeout_secs() -> u64 {
    10
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            hostname: default_hostname(),
            startup_timeout_secs: default_startup_timeout_secs(),
        }
    }
}
