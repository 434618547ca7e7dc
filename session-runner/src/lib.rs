pub mod cli;
pub mod config;
pub mod errors;
pub mod telemetry;

use std::{sync::Arc, time::Duration};

use solana_sdk::signature::Signer;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use typing_sync_client::{
    rpc::LayerRpc,
    signer::{InMemorySessionKeys, SessionKeyProvider},
    store::StoreEvent,
    ConfirmationReceipt, TypingSyncClient,
};

use crate::{
    cli::{Cli, Commands},
    config::{parse_pubkey, read_keypair, session_credential, sync_config},
    errors::RunnerError,
};

pub async fn run(cli: Cli) -> Result<(), RunnerError> {
    let args = &cli.connection;
    let config = sync_config(args)?;
    let session_keys = Arc::new(InMemorySessionKeys::new());
    if let Some(credential) = session_credential(args)? {
        session_keys.install(credential);
    }
    let wallet = args.keypair.as_deref().map(read_keypair).transpose()?;
    if wallet.is_none() && (cli.command.writes() || args.player.is_none()) {
        return Err(RunnerError::WalletRequired {
            command: cli.command.name().to_string(),
        });
    }

    let connections = config.connect();
    let client = TypingSyncClient::new(config, connections, session_keys);
    if let Some(wallet) = wallet {
        info!("Using wallet {}", wallet.pubkey());
        client.connect_wallet(Arc::new(wallet));
    }
    let status = match &args.player {
        Some(player) => client.track(parse_pubkey("player", player)?).await?,
        None => client.start().await?,
    };
    info!("Session status: {}", status);

    let result = execute(&client, &cli.command).await;
    print_summary(&client);
    client.stop();
    result
}

async fn execute<R: LayerRpc>(
    client: &TypingSyncClient<R>,
    command: &Commands,
) -> Result<(), RunnerError> {
    match command {
        Commands::Status => {}
        Commands::Init => {
            report(client.initialize_session().await?);
            if client.record().is_none() {
                report(client.initialize_record().await?);
            }
        }
        Commands::Delegate => report(client.delegate().await?),
        Commands::Type(args) => {
            for &is_correct in &args.words {
                report(client.record_word(is_correct).await?);
            }
        }
        Commands::Commit => report(client.commit().await?),
        Commands::Undelegate => report(client.undelegate().await?),
        Commands::End => report(client.end_session().await?),
        Commands::Save => report(client.save_to_record().await?),
        Commands::Watch(args) => watch(client, args.seconds.map(Duration::from_secs)).await,
    }
    Ok(())
}

fn report(receipt: ConfirmationReceipt) {
    info!(
        "{} confirmed on {}: {} (signed by {} {})",
        receipt.call, receipt.layer, receipt.signature, receipt.signer, receipt.signer_pubkey
    );
}

fn print_summary<R: LayerRpc>(client: &TypingSyncClient<R>) {
    println!("status:  {}", client.status());
    match client.session() {
        Some(session) => println!(
            "session: {} words, {} correct, {} errors, {} wpm, {}% accuracy, {}",
            session.words_typed,
            session.correct_words,
            session.errors,
            session.wpm,
            session.accuracy,
            if session.is_active { "active" } else { "ended" }
        ),
        None => println!("session: none"),
    }
    match client.record() {
        Some(record) => println!(
            "record:  {} attempts, best {} wpm, best {}% accuracy",
            record.attempt_count, record.best_wpm, record.best_accuracy
        ),
        None => println!("record:  none"),
    }
    if let Some(error) = client.last_error() {
        println!("last error ({}, {:?}): {}", error.action, error.kind, error.message);
    }
}

async fn watch<R: LayerRpc>(client: &TypingSyncClient<R>, limit: Option<Duration>) {
    let mut events = client.events();
    let deadline = async {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(deadline, interrupted);

    loop {
        tokio::select! {
            _ = &mut interrupted => break,
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Ok(StoreEvent::StatusChanged { from, to, .. }) => {
                    info!("Status {} -> {}", from, to);
                }
                Ok(StoreEvent::AccountChanged { address, layer, present }) => {
                    let change = if present { "updated" } else { "cleared" };
                    info!("{} view of {} {}", layer, address, change);
                    print_summary(client);
                }
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {} store events", skipped),
                Err(RecvError::Closed) => break,
            },
        }
    }
}
