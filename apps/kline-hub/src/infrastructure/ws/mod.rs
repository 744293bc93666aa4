//! Subscriber WebSocket Layer
//!
//! - **protocol**: JSON frames exchanged with subscribers
//! - **outbound**: bounded drop-oldest send queue
//! - **connection**: per-socket state
//! - **manager**: admission, requests, heartbeats, writer loop
//! - **server**: axum `/ws` endpoint

pub mod connection;
pub mod manager;
pub mod outbound;
pub mod protocol;
pub mod server;

pub use connection::{ClientConnection, CloseReason, ConnectionState};
pub use manager::{AdmissionError, ConnectionManager};
pub use outbound::{OutboundQueue, PushOutcome};
pub use protocol::{ClientMessage, ErrorCode, ExchangeStatus, ServerMessage};
pub use server::{ServerError, WsServer, WsServerState};
