use solana_sdk::{pubkey, pubkey::Pubkey};

/// Typing-session program deployed on devnet.
pub const TYPING_PROGRAM_ID: Pubkey = pubkey!("EuVuXeF5BjXoJi4FzcS6jMK4q6b17kAmcnBzVbLqg1Yn");

/// Owner of every account currently delegated to an ephemeral rollup.
pub const DELEGATION_PROGRAM_ID: Pubkey = pubkey!("DELeGGvXpWV2fqJUhqcF5ZSYMS4JTLjteaAMARRSaeSh");

pub const MAGIC_PROGRAM_ID: Pubkey = pubkey!("Magic11111111111111111111111111111111111111");

pub const MAGIC_CONTEXT_ID: Pubkey = pubkey!("MagicContext1111111111111111111111111111111");

pub const SYSTEM_PROGRAM_ID: Pubkey = pubkey!("11111111111111111111111111111111");

pub const PERSONAL_RECORD_SEED: &[u8] = b"personal_record";

pub const DELEGATE_BUFFER_SEED: &[u8] = b"buffer";
pub const DELEGATION_RECORD_SEED: &[u8] = b"delegation";
pub const DELEGATION_METADATA_SEED: &[u8] = b"delegation-metadata";

/// Attempt history length enforced by the program.
pub const MAX_ATTEMPTS: u32 = 30;

pub const ACCOUNT_DISCRIMINATOR_LEN: usize = 8;

pub const DEFAULT_BASE_RPC_URL: &str = "https://api.devnet.solana.com";
pub const DEFAULT_BASE_WS_URL: &str = "wss://api.devnet.solana.com";
pub const DEFAULT_ROLLUP_RPC_URL: &str = "https://devnet.magicblock.app";
pub const DEFAULT_ROLLUP_WS_URL: &str = "wss://devnet.magicblock.app";
