//! The agent bridge: agent metadata and transcripts on disk, and the
//! per-agent streaming state machine that relays the backing runtime's
//! event stream to connected clients.

mod bridge;
pub mod client;
pub mod frames;
pub mod specialist;
pub mod sse;
pub mod store;

pub use bridge::{AgentBridge, ConnectionId, CreateAgentRequest, TurnPhase};
pub use client::{EventStream, HttpRuntimeClient, ModelRef, PromptPart, PromptRequest, RuntimeClient};
pub use frames::{parse_client_frame, ClientFrame, ServerFrame};
pub use specialist::{ConfigSpecialists, Specialist, SpecialistCatalog};
pub use store::{AgentMetadata, AgentStore, ConversationLog, ConversationMessage, MessageRole};
