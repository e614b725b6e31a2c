//! HTTP and WebSocket surface of the duel engine.

pub mod bootstrap;
pub mod dto;
pub mod error;
pub mod fanout;
pub mod logging;
pub mod protocol;
pub mod rooms;
pub mod routes;
pub mod ws;

pub use bootstrap::{build_app, run_server, DuelApp, ServerConfig};
pub use error::ApiError;
pub use protocol::{ClientMessage, ServerMessage};
pub use routes::{DuelServer, ServerContext};
