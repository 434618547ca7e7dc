use std::{str::FromStr, time::Duration};

use solana_sdk::{
    commitment_config::CommitmentConfig,
    pubkey::Pubkey,
    signature::{read_keypair_file, Keypair},
};
use typing_sync_client::{
    rpc::{LayerEndpointConfig, RetryConfig},
    signer::{unix_timestamp, SessionCredential},
    SyncConfig,
};

use crate::{cli::ConnectionArgs, errors::ConfigurationError};

pub fn sync_config(args: &ConnectionArgs) -> Result<SyncConfig, ConfigurationError> {
    let commitment = parse_commitment(&args.commitment)?;
    let defaults = SyncConfig::default();
    let program_id = match &args.program_id {
        Some(value) => parse_pubkey("program_id", value)?,
        None => defaults.program_id,
    };
    let rollup_validator = args
        .rollup_validator
        .as_deref()
        .map(|value| parse_pubkey("rollup_validator", value))
        .transpose()?;

    Ok(SyncConfig {
        base: LayerEndpointConfig {
            rpc_url: args.base_rpc_url.clone(),
            ws_url: args.base_ws_url.clone(),
            commitment,
        },
        rollup: LayerEndpointConfig {
            rpc_url: args.rollup_rpc_url.clone(),
            ws_url: args.rollup_ws_url.clone(),
            commitment,
        },
        program_id,
        rollup_validator,
        commitment,
        confirm_timeout: Duration::from_millis(args.confirm_timeout_ms),
        skip_preflight: !args.preflight,
        propagation_delay: Duration::from_millis(args.propagation_delay_ms),
        retry: RetryConfig {
            max_retries: args.max_retries,
            retry_delay: Duration::from_millis(args.retry_delay_ms),
            timeout: Duration::from_millis(args.retry_timeout_ms),
        },
        ..defaults
    })
}

pub fn parse_pubkey(field: &'static str, value: &str) -> Result<Pubkey, ConfigurationError> {
    Pubkey::from_str(value).map_err(|_| ConfigurationError::InvalidPubkey {
        field,
        value: value.to_string(),
    })
}

pub fn read_keypair(path: &str) -> Result<Keypair, ConfigurationError> {
    read_keypair_file(path).map_err(|e| ConfigurationError::Keypair {
        path: path.to_string(),
        reason: e.to_string(),
    })
}

pub fn session_credential(
    args: &ConnectionArgs,
) -> Result<Option<SessionCredential>, ConfigurationError> {
    let (Some(path), Some(token)) = (&args.session_keypair, &args.session_token) else {
        return Ok(None);
    };
    let valid_until = args.session_valid_until.unwrap_or_default();
    if valid_until <= unix_timestamp() {
        return Err(ConfigurationError::SessionExpired { valid_until });
    }
    Ok(Some(SessionCredential::new(
        read_keypair(path)?,
        parse_pubkey("session_token", token)?,
        valid_until,
    )))
}

fn parse_commitment(level: &str) -> Result<CommitmentConfig, ConfigurationError> {
    match level {
        "processed" => Ok(CommitmentConfig::processed()),
        "confirmed" => Ok(CommitmentConfig::confirmed()),
        "finalized" => Ok(CommitmentConfig::finalized()),
        other => Err(ConfigurationError::Commitment(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::cli::Cli;

    fn args(extra: &[&str]) -> ConnectionArgs {
        let mut argv = vec!["session-runner"];
        argv.extend_from_slice(extra);
        argv.push("status");
        Cli::try_parse_from(argv).unwrap().connection
    }

    #[test]
    fn defaults_match_library_defaults() {
        let config = sync_config(&args(&[])).unwrap();
        let defaults = SyncConfig::default();
        assert_eq!(config.program_id, defaults.program_id);
        assert_eq!(config.base.rpc_url, defaults.base.rpc_url);
        assert_eq!(config.rollup.ws_url, defaults.rollup.ws_url);
        assert_eq!(config.confirm_timeout, Duration::from_secs(30));
        assert!(config.skip_preflight);
        assert_eq!(config.rollup_validator, None);
    }

    #[test]
    fn overrides_are_applied() {
        let validator = Pubkey::new_unique();
        let config = sync_config(&args(&[
            "--rollup-validator",
            &validator.to_string(),
            "--commitment",
            "finalized",
            "--preflight",
            "--max-retries",
            "9",
        ]))
        .unwrap();
        assert_eq!(config.rollup_validator, Some(validator));
        assert_eq!(config.commitment, CommitmentConfig::finalized());
        assert_eq!(config.base.commitment, CommitmentConfig::finalized());
        assert!(!config.skip_preflight);
        assert_eq!(config.retry.max_retries, 9);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(matches!(
            sync_config(&args(&["--program-id", "not-a-key"])),
            Err(ConfigurationError::InvalidPubkey {
                field: "program_id",
                ..
            })
        ));
        assert!(matches!(
            sync_config(&args(&["--commitment", "eventually"])),
            Err(ConfigurationError::Commitment(_))
        ));
        assert!(matches!(
            read_keypair("/nonexistent/id.json"),
            Err(ConfigurationError::Keypair { .. })
        ));
    }

    #[test]
    fn expired_session_token_is_rejected() {
        let token = Pubkey::new_unique().to_string();
        let session_args = |valid_until: &str| {
            args(&[
                "--session-keypair",
                "/nonexistent/session.json",
                "--session-token",
                &token,
                "--session-valid-until",
                valid_until,
            ])
        };
        assert!(matches!(
            session_credential(&session_args("0")),
            Err(ConfigurationError::SessionExpired { valid_until: 0 })
        ));
        let in_an_hour = (unix_timestamp() + 3600).to_string();
        assert!(matches!(
            session_credential(&session_args(&in_an_hour)),
            Err(ConfigurationError::Keypair { .. })
        ));
        assert!(matches!(session_credential(&args(&[])), Ok(None)));
    }
}
