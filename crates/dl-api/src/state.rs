use std::sync::Arc;

use dl_agent::AgentBridge;
use dl_config::DaemonConfig;

#[derive(Clone)]
pub struct AppState {
    pub config: DaemonConfig,
    pub bridge: Arc<AgentBridge>,
    pub version: &'static str,
}

impl AppState {
    pub fn new(config: DaemonConfig, bridge: Arc<AgentBridge>) -> Self {
        Self {
            config,
            bridge,
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}
