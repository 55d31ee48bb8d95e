//! The Broker↔Agent transport (C1): a shared length-prefixed JSON codec,
//! the Broker-side reconnecting client, and the Agent-side Unix-socket
//! server.

pub mod client;
pub mod codec;
pub mod server;

pub use client::{ConnectionState, IpcClient};
pub use server::{register_reserved_operations, run as run_agent, AgentSocketConfig};
