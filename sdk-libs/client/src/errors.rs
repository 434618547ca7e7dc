use std::fmt::{Display, Formatter};

use solana_sdk::{instruction::InstructionError, pubkey::Pubkey, transaction::TransactionError};
use thiserror::Error;

use crate::{
    accounts::DecodeError,
    address::AddressError,
    delegation::DelegationStatus,
    instructions::RemoteCall,
    pipeline::PipelineError,
    rpc::{Layer, RpcError},
    signer::SignerChoice,
};

/// Error codes raised by the typing-session program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingProgramError {
    SessionNotActive,
    SessionAlreadyEnded,
    InvalidAuth,
    MaxAttemptsReached,
    SessionStillActive,
}

impl TypingProgramError {
    const FIRST_CODE: u32 = 6000;

    pub fn from_code(code: u32) -> Option<Self> {
        match code.checked_sub(Self::FIRST_CODE)? {
            0 => Some(Self::SessionNotActive),
            1 => Some(Self::SessionAlreadyEnded),
            2 => Some(Self::InvalidAuth),
            3 => Some(Self::MaxAttemptsReached),
            4 => Some(Self::SessionStillActive),
            _ => None,
        }
    }

    pub fn from_transaction_error(err: &TransactionError) -> Option<Self> {
        match err {
            TransactionError::InstructionError(_, InstructionError::Custom(code)) => {
                Self::from_code(*code)
            }
            _ => None,
        }
    }
}

impl Display for TypingProgramError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let message = match self {
            Self::SessionNotActive => "Session is not active",
            Self::SessionAlreadyEnded => "Session already ended",
            Self::InvalidAuth => "Invalid authentication",
            Self::MaxAttemptsReached => "Maximum attempts reached (30)",
            Self::SessionStillActive => "Session is still active",
        };
        write!(f, "{}", message)
    }
}

/// Caller-facing classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Schema mismatch. Not retried automatically.
    Decode,
    /// Wrong signer or layer for the current delegation status.
    Authorization,
    /// Transient. Reads may be retried; writes need a state re-check first.
    Network,
    /// Ambiguous outcome. Re-probe before retrying.
    ConfirmationTimeout,
    /// The call was refused before or during execution.
    Rejected,
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Address error: {0}")]
    Address(#[from] AddressError),

    #[error("Failed to decode account {address}: {error}")]
    Decode { address: Pubkey, error: DecodeError },

    #[error(
        "Authorization error: {reason}. {call} requires the {required_signer} signer on the {required_layer} layer"
    )]
    Authorization {
        call: RemoteCall,
        required_layer: Layer,
        required_signer: SignerChoice,
        reason: String,
    },

    #[error("Network error: {0}")]
    Network(RpcError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("{call} is not allowed while the session is {status}")]
    InvalidState {
        call: RemoteCall,
        status: DelegationStatus,
    },

    #[error("Delegation not confirmed: {reason}")]
    DelegationNotConfirmed { reason: String },

    #[error("Undelegation not confirmed: {reason}")]
    UndelegationNotConfirmed { reason: String },

    #[error("No player is tracked; call start() first")]
    NotTracking,
}

impl From<RpcError> for SyncError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Decode { address, error } => SyncError::Decode { address, error },
            other => SyncError::Network(other),
        }
    }
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Decode { .. } => ErrorKind::Decode,
            SyncError::Authorization { .. } => ErrorKind::Authorization,
            SyncError::Network(_) => ErrorKind::Network,
            SyncError::Pipeline(err) => err.kind(),
            SyncError::DelegationNotConfirmed { .. }
            | SyncError::UndelegationNotConfirmed { .. } => ErrorKind::ConfirmationTimeout,
            SyncError::Address(_) | SyncError::InvalidState { .. } | SyncError::NotTracking => {
                ErrorKind::Rejected
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_codes_map_to_names() {
        assert_eq!(
            TypingProgramError::from_code(6000),
            Some(TypingProgramError::SessionNotActive)
        );
        assert_eq!(
            TypingProgramError::from_code(6003),
            Some(TypingProgramError::MaxAttemptsReached)
        );
        assert_eq!(TypingProgramError::from_code(6005), None);
        assert_eq!(TypingProgramError::from_code(42), None);

        let err = TransactionError::InstructionError(0, InstructionError::Custom(6002));
        assert_eq!(
            TypingProgramError::from_transaction_error(&err),
            Some(TypingProgramError::InvalidAuth)
        );
        assert_eq!(
            TypingProgramError::from_transaction_error(&TransactionError::BlockhashNotFound),
            None
        );
    }

    #[test]
    fn decode_failures_keep_their_kind() {
        let err = SyncError::from(RpcError::Decode {
            address: Pubkey::new_unique(),
            error: DecodeError::TooShort { len: 2 },
        });
        assert_eq!(err.kind(), ErrorKind::Decode);
        assert_eq!(
            SyncError::from(RpcError::PubsubError("closed".into())).kind(),
            ErrorKind::Network
        );
    }
}
