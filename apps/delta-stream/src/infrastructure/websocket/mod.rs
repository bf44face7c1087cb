//! Delta WebSocket
//!
//! Wire protocol and the axum WebSocket endpoint.

pub mod protocol;
pub mod server;

pub use protocol::{ClientRequest, Rejection, RequestError, ServerMessage};
pub use server::{WsServer, WsServerError, router};
