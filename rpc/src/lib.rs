//! JSON-RPC access to the chain node.
//!
//! [`rpc_client::RpcClient`] issues one request at a time and validates every response
//! before handing back a typed result from [`rpc_types`].

pub mod rpc_client;
pub mod rpc_types;
