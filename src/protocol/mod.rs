//! Request/response protocol spoken between the router and MCP servers.
//!
//! Architecture:
//! - `types`: wire envelopes, handshake payloads, correlation ids
//! - `correlator`: task-owned map of pending requests with per-request timeouts
//! - `handlers`: method → handler dispatch table
//! - `tools`: tool catalog served by `tools/list`
//! - `client`: outbound connection lifecycle (connect → handshake → ready)
//! - `server`: inbound dispatch, handshake validation, connection serving

pub mod client;
pub mod correlator;
pub mod handlers;
pub mod server;
pub mod tools;
pub mod types;

pub use client::{ClientEvent, ClientProtocol, ClientSettings, ClientState};
pub use correlator::{PendingResponse, ResponseCorrelator};
pub use handlers::{handler_fn, MessageHandler, MessageHandlerRegistry};
pub use server::{ServerProtocol, SocketServer};
pub use tools::{ToolCatalog, ToolRegistry};
pub use types::{
    methods, next_request_id, HandshakeInfo, HandshakeReply, Message, RequestMessage,
    ResponseMessage, ToolDescriptor, ToolsListResult,
};
