pub mod daemon;
pub mod paths;
pub mod ports;
pub mod runtime;
pub mod specialist;
pub mod tunnel;

pub use daemon::DaemonConfig;
pub use paths::{ConfigPaths, WorkspacePaths};
pub use ports::PortConfig;
pub use runtime::RuntimeConfig;
pub use specialist::SpecialistConfig;
pub use tunnel::{TunnelConfig, TunnelMode};
