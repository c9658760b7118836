//! Gateway: HTTP + WebSocket front end for the terminal gatekeeper.
//!
//! Single port serves HTTP and WebSocket. Protocol: first request must be `connect`;
//! then requests (req/res) and events.

mod protocol;
mod server;

pub use protocol::{
    ConnectAuth, ConnectClient, ConnectParams, ExecuteParams, HelloOk, SessionParams, WsRequest,
    WsResponse,
};
pub use server::{run_gateway, GatewayState};
