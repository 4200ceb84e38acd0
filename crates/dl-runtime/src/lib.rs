//! Supervision of the backing agent runtime (`opencode serve`) for a
//! workspace, plus the process helpers shared with the tunnel manager.

pub mod process;
mod record;
mod resolver;
mod supervisor;

pub use record::{read_record, remove_record, write_record, RuntimeRecord};
pub use resolver::{find_in_path, PathResolver, ResolvedRuntime, RuntimeResolver};
pub use supervisor::{parse_listening_url, ProcessSupervisor, RuntimeStatus, RuntimeSupervisor};
