#![allow(clippy::result_large_err)]

pub mod connection_manager;
pub mod errors;
pub mod rpc_connection;
pub mod solana_rpc;
pub mod subscriber;

pub use connection_manager::{ConnectionManager, Layer};
pub use errors::RpcError;
pub use rpc_connection::{AccountUpdate, AccountUpdateHandler, LayerRpc};
pub use solana_rpc::{retry_transient, LayerEndpointConfig, RetryConfig, SolanaLayerRpc};
pub use subscriber::ReconnectConfig;
