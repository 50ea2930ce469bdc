//! Transport layer for interactive subprocess sessions: spawns a coding tool
//! as either a pty-backed or JSON-RPC-backed subprocess and exposes a single
//! write/read/resize surface regardless of which transport was chosen.

pub mod core;
pub mod rpc;

pub use core::{
    AISession, SessionConfig, SessionError, SessionId, SessionManager, SessionResult,
    SessionStatus, TransportHandle, TransportKind,
};
pub use rpc::{JsonRpcRequest, JsonRpcResponse, RpcHandle};
