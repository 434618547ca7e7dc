use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Print delegation status and both layers' views of the session.
    Status,
    /// Start a fresh session and create the personal record if missing.
    Init,
    Delegate,
    /// Record words in order, e.g. `type true false true`.
    Type(TypeArgs),
    Commit,
    Undelegate,
    End,
    Save,
    /// Stream store events until interrupted.
    Watch(WatchArgs),
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct TypeArgs {
    #[arg(required = true, action = clap::ArgAction::Append)]
    pub words: Vec<bool>,
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct WatchArgs {
    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[arg(long)]
    pub seconds: Option<u64>,
}

#[derive(Args, Clone, Debug)]
pub struct ConnectionArgs {
    #[arg(
        long,
        env = "TYPING_SYNC_BASE_RPC_URL",
        default_value = "https://api.devnet.solana.com"
    )]
    pub base_rpc_url: String,

    #[arg(
        long,
        env = "TYPING_SYNC_BASE_WS_URL",
        default_value = "wss://api.devnet.solana.com"
    )]
    pub base_ws_url: String,

    #[arg(
        long,
        env = "TYPING_SYNC_ROLLUP_RPC_URL",
        default_value = "https://devnet.magicblock.app"
    )]
    pub rollup_rpc_url: String,

    #[arg(
        long,
        env = "TYPING_SYNC_ROLLUP_WS_URL",
        default_value = "wss://devnet.magicblock.app"
    )]
    pub rollup_ws_url: String,

    #[arg(long, env = "TYPING_SYNC_PROGRAM_ID")]
    pub program_id: Option<String>,

    #[arg(long, env = "TYPING_SYNC_ROLLUP_VALIDATOR")]
    pub rollup_validator: Option<String>,

    /// Wallet keypair file. Required for every command that writes.
    #[arg(long, env = "TYPING_SYNC_KEYPAIR")]
    pub keypair: Option<String>,

    /// Track another player read-only instead of the wallet owner.
    #[arg(long, env = "TYPING_SYNC_PLAYER")]
    pub player: Option<String>,

    #[arg(long, env = "TYPING_SYNC_SESSION_KEYPAIR", requires = "session_token")]
    pub session_keypair: Option<String>,

    #[arg(
        long,
        env = "TYPING_SYNC_SESSION_TOKEN",
        requires = "session_keypair",
        requires = "session_valid_until"
    )]
    pub session_token: Option<String>,

    /// Unix timestamp after which the session token is rejected.
    #[arg(long, env = "TYPING_SYNC_SESSION_VALID_UNTIL", requires = "session_token")]
    pub session_valid_until: Option<i64>,

    #[arg(long, env = "TYPING_SYNC_COMMITMENT", default_value = "confirmed")]
    pub commitment: String,

    #[arg(long, env = "TYPING_SYNC_CONFIRM_TIMEOUT_MS", default_value = "30000")]
    pub confirm_timeout_ms: u64,

    #[arg(long, env = "TYPING_SYNC_PROPAGATION_DELAY_MS", default_value = "2000")]
    pub propagation_delay_ms: u64,

    #[arg(long, env = "TYPING_SYNC_MAX_RETRIES", default_value = "5")]
    pub max_retries: u32,

    #[arg(long, env = "TYPING_SYNC_RETRY_DELAY_MS", default_value = "500")]
    pub retry_delay_ms: u64,

    #[arg(long, env = "TYPING_SYNC_RETRY_TIMEOUT_MS", default_value = "20000")]
    pub retry_timeout_ms: u64,

    /// Run preflight simulation before submitting.
    #[arg(long, env = "TYPING_SYNC_PREFLIGHT")]
    pub preflight: bool,
}

impl Commands {
    pub fn name(&self) -> &'static str {
        match self {
            Commands::Status => "status",
            Commands::Init => "init",
            Commands::Delegate => "delegate",
            Commands::Type(_) => "type",
            Commands::Commit => "commit",
            Commands::Undelegate => "undelegate",
            Commands::End => "end",
            Commands::Save => "save",
            Commands::Watch(_) => "watch",
        }
    }

    pub fn writes(&self) -> bool {
        !matches!(self, Commands::Status | Commands::Watch(_))
    }
}

#[cfg(test)]
mod tests {
    use solana_sdk::pubkey::Pubkey;

    use super::*;

    #[test]
    fn parses_word_sequence() {
        let cli = Cli::try_parse_from([
            "session-runner",
            "--keypair",
            "id.json",
            "type",
            "true",
            "false",
            "true",
        ])
        .unwrap();
        assert_eq!(
            cli.command,
            Commands::Type(TypeArgs {
                words: vec![true, false, true]
            })
        );
        assert_eq!(cli.connection.keypair.as_deref(), Some("id.json"));
        assert!(!cli.connection.preflight);
        assert!(cli.command.writes());
    }

    #[test]
    fn session_key_needs_its_token() {
        let result = Cli::try_parse_from([
            "session-runner",
            "--session-keypair",
            "session.json",
            "status",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn session_token_needs_its_expiry() {
        let token = Pubkey::new_unique().to_string();
        let result = Cli::try_parse_from([
            "session-runner",
            "--session-keypair",
            "session.json",
            "--session-token",
            &token,
            "status",
        ]);
        assert!(result.is_err());

        let cli = Cli::try_parse_from([
            "session-runner",
            "--session-keypair",
            "session.json",
            "--session-token",
            &token,
            "--session-valid-until",
            "1900000000",
            "status",
        ])
        .unwrap();
        assert_eq!(cli.connection.session_valid_until, Some(1_900_000_000));
    }

    #[test]
    fn status_is_read_only() {
        let cli = Cli::try_parse_from(["session-runner", "status"]).unwrap();
        assert!(!cli.command.writes());
        assert_eq!(cli.connection.confirm_timeout_ms, 30000);
    }
}
