use thiserror::Error;
use typing_sync_client::SyncError;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("{command} needs --keypair; only read-only commands accept --player alone")]
    WalletRequired { command: String },
}

#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Invalid pubkey for {field}: {value}")]
    InvalidPubkey { field: &'static str, value: String },

    #[error("Failed to read keypair {path}: {reason}")]
    Keypair { path: String, reason: String },

    #[error("Unknown commitment level: {0}")]
    Commitment(String),

    #[error("Session token expired at {valid_until}; pass a future --session-valid-until")]
    SessionExpired { valid_until: i64 },
}
