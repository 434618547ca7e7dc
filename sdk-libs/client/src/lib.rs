pub mod accounts;
pub mod address;
pub mod client;
pub mod config;
pub mod constants;
pub mod delegation;
pub mod errors;
pub mod instructions;
pub mod pipeline;
pub mod reconciler;
pub mod rpc;
pub mod signer;
pub mod store;

pub use client::{LastError, TypingSyncClient};
pub use config::SyncConfig;
pub use delegation::{DelegationStateMachine, DelegationStatus};
pub use errors::{ErrorKind, SyncError};
pub use pipeline::{ConfirmationReceipt, PipelineError, RereadMode};
pub use rpc::{ConnectionManager, Layer, LayerRpc, RpcError};
pub use store::AccountStateStore;
