//! Development session lifecycle: port reservation, git worktrees, public
//! tunnels, and the durable session registry that ties them together.

pub mod orchestrator;
pub mod port;
pub mod registry;
pub mod tunnel;
pub mod worktree;

pub use orchestrator::{
    CreateSessionRequest, SessionEndpoint, SessionOrchestrator, TunnelRequest, WorktreeRequest,
};
pub use port::PortAllocator;
pub use registry::{
    FileSessionRegistry, InMemorySessionRegistry, SessionRecord, SessionRegistry, SessionState,
    WorktreeAssociation,
};
pub use tunnel::{AttachRequest, TunnelInfo, TunnelManager, TunnelProvider, TunnelState, Tunnels};
pub use worktree::{
    parse_porcelain, CleanupRequest, GitWorktreeManager, ProvisionRequest, WorktreeInfo, Worktrees,
};
