use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use solana_account_decoder::{UiAccount, UiAccountEncoding};
use solana_client::{
    nonblocking::pubsub_client::PubsubClient, rpc_config::RpcAccountInfoConfig,
    rpc_response::Response as RpcResponse,
};
use solana_sdk::{account::Account, commitment_config::CommitmentConfig, pubkey::Pubkey};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::{
    errors::RpcError,
    rpc_connection::{AccountUpdate, AccountUpdateHandler},
    Layer,
};

/// Backoff between websocket reconnects. The delay starts at
/// `initial_delay` and is multiplied by `backoff_multiplier` after each
/// failed attempt, up to `max_delay`.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl ReconnectConfig {
    pub fn next_delay(&self, current: Duration) -> Duration {
        Duration::from_secs_f64(
            (current.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }
}

/// How one websocket session ended. Errors are returned separately.
enum ConnectionResult {
    Shutdown,
    StreamClosed,
}

/// Websocket subscription to a single account on one layer.
/// Reconnects with exponential backoff until shut down.
pub struct AccountSubscriber {
    ws_url: String,
    layer: Layer,
    address: Pubkey,
    handler: Arc<dyn AccountUpdateHandler>,
    commitment: CommitmentConfig,
    reconnect_config: ReconnectConfig,
    ready: Option<oneshot::Sender<()>>,
    shutdown_rx: oneshot::Receiver<()>,
}

impl AccountSubscriber {
    pub fn new(
        ws_url: String,
        layer: Layer,
        address: Pubkey,
        handler: Arc<dyn AccountUpdateHandler>,
        shutdown_rx: oneshot::Receiver<()>,
    ) -> Self {
        Self {
            ws_url,
            layer,
            address,
            handler,
            commitment: CommitmentConfig::confirmed(),
            reconnect_config: ReconnectConfig::default(),
            ready: None,
            shutdown_rx,
        }
    }

    pub fn with_commitment(mut self, commitment: CommitmentConfig) -> Self {
        self.commitment = commitment;
        self
    }

    /// Fired after the first `accountSubscribe` is acknowledged.
    pub fn with_ready_signal(mut self, ready: oneshot::Sender<()>) -> Self {
        self.ready = Some(ready);
        self
    }

    pub fn with_reconnect_config(mut self, reconnect_config: ReconnectConfig) -> Self {
        self.reconnect_config = reconnect_config;
        self
    }

    pub async fn run(mut self) -> Result<(), RpcError> {
        info!(
            "Starting {} subscription for {} at {}",
            self.layer, self.address, self.ws_url
        );

        let mut current_delay = self.reconnect_config.initial_delay;
        let mut attempt: u32 = 0;

        loop {
            match self.run_connection().await {
                Ok(ConnectionResult::Shutdown) => {
                    info!("{} subscription for {} stopped", self.layer, self.address);
                    return Ok(());
                }
                Ok(ConnectionResult::StreamClosed) => {
                    attempt += 1;
                    warn!(
                        "{} subscription for {} lost (attempt {}), reconnecting in {:?}...",
                        self.layer, self.address, attempt, current_delay
                    );
                }
                Err(e) => {
                    attempt += 1;
                    warn!(
                        "{} subscription for {} failed (attempt {}): {:?}, reconnecting in {:?}...",
                        self.layer, self.address, attempt, e, current_delay
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(current_delay) => {}
                _ = &mut self.shutdown_rx => {
                    info!(
                        "{} subscription for {} shut down during reconnect backoff",
                        self.layer, self.address
                    );
                    return Ok(());
                }
            }

            current_delay = self.reconnect_config.next_delay(current_delay);
        }
    }

    async fn run_connection(&mut self) -> Result<ConnectionResult, RpcError> {
        let pubsub_client = PubsubClient::new(&self.ws_url)
            .await
            .map_err(|e| RpcError::PubsubError(format!("Failed to connect to WebSocket: {}", e)))?;

        let (mut subscription, unsubscribe) = pubsub_client
            .account_subscribe(
                &self.address,
                Some(RpcAccountInfoConfig {
                    encoding: Some(UiAccountEncoding::Base64),
                    commitment: Some(self.commitment),
                    data_slice: None,
                    min_context_slot: None,
                }),
            )
            .await
            .map_err(|e| RpcError::PubsubError(format!("Failed to subscribe to account: {}", e)))?;

        debug!("{} subscription established for {}", self.layer, self.address);
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(());
        }

        loop {
            let next = tokio::select! {
                result = subscription.next() => result,
                _ = &mut self.shutdown_rx => {
                    unsubscribe().await;
                    return Ok(ConnectionResult::Shutdown);
                }
            };
            match next {
                Some(response) => self.handle_account_update(response).await,
                None => {
                    error!(
                        "{} subscription stream for {} closed unexpectedly",
                        self.layer, self.address
                    );
                    unsubscribe().await;
                    return Ok(ConnectionResult::StreamClosed);
                }
            }
        }
    }

    async fn handle_account_update(&self, response: RpcResponse<UiAccount>) {
        let Some(account) = response.value.decode::<Account>() else {
            error!(
                "Failed to decode {} account update for {} at slot {}",
                self.layer, self.address, response.context.slot
            );
            return;
        };

        self.handler
            .handle_update(AccountUpdate {
                layer: self.layer,
                address: self.address,
                slot: response.context.slot,
                account,
            })
            .await;
    }
}
