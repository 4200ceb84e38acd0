pub mod error;
pub mod rest;
pub mod router;
pub mod server_info;
pub mod state;
pub mod ws;

pub use router::build_router;
pub use server_info::{read_server_info, remove_server_info, write_server_info, ServerInfo};
pub use state::AppState;
