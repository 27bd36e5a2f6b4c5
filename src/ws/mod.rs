//! WebSocket layer: server plus wire protocol.
//!
//! Browser clients connect with a query string naming a target; the
//! orchestrator answers with `StatusChanged` pushes as compiles progress.

pub mod protocol;
pub mod server;

pub use server::{PortChoice, SocketId, WsData, WsEvent, WsServer};
