use std::time::Duration;

use solana_client::{client_error::ClientError, client_error::ClientErrorKind};
use solana_sdk::{pubkey::Pubkey, signature::Signature, transaction::TransactionError};
use thiserror::Error;

use crate::accounts::DecodeError;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("ClientError: {0}")]
    ClientError(#[from] Box<ClientError>),

    #[error("TransactionError: {0}")]
    TransactionError(#[from] Box<TransactionError>),

    #[error("PubsubError: {0}")]
    PubsubError(String),

    #[error("Failed to decode account {address}: {error}")]
    Decode { address: Pubkey, error: DecodeError },

    #[error("Confirmation of {signature} not observed within {timeout:?}")]
    ConfirmationTimeout {
        signature: Signature,
        timeout: Duration,
    },

    #[error("Error: `{0}`")]
    CustomError(String),
}

impl From<ClientError> for RpcError {
    fn from(err: ClientError) -> Self {
        RpcError::ClientError(Box::new(err))
    }
}

impl From<TransactionError> for RpcError {
    fn from(err: TransactionError) -> Self {
        RpcError::TransactionError(Box::new(err))
    }
}

impl RpcError {
    /// Transport-level failures that are safe to retry for reads.
    pub fn is_transient(&self) -> bool {
        match self {
            RpcError::ClientError(err) => matches!(
                err.kind(),
                ClientErrorKind::Io(_) | ClientErrorKind::Reqwest(_) | ClientErrorKind::RpcError(_)
            ) && err.get_transaction_error().is_none(),
            RpcError::PubsubError(_) => true,
            _ => false,
        }
    }

    /// The ledger-level failure carried by this error, if any.
    pub fn transaction_error(&self) -> Option<TransactionError> {
        match self {
            RpcError::TransactionError(err) => Some((**err).clone()),
            RpcError::ClientError(err) => err.get_transaction_error(),
            _ => None,
        }
    }
}
