use std::{
    fmt::{Debug, Display, Formatter},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use solana_client::{nonblocking::rpc_client::RpcClient, rpc_config::RpcSendTransactionConfig};
use solana_sdk::{
    account::Account,
    commitment_config::CommitmentConfig,
    hash::Hash,
    pubkey::Pubkey,
    signature::Signature,
    transaction::{Transaction, TransactionError},
};
use tokio::{
    sync::oneshot,
    time::{sleep, Instant},
};
use tracing::warn;

use super::{
    errors::RpcError,
    rpc_connection::{AccountUpdateHandler, LayerRpc},
    subscriber::{AccountSubscriber, ReconnectConfig},
    Layer,
};
use crate::constants::{
    DEFAULT_BASE_RPC_URL, DEFAULT_BASE_WS_URL, DEFAULT_ROLLUP_RPC_URL, DEFAULT_ROLLUP_WS_URL,
};

pub enum SolanaRpcUrl {
    Devnet,
    Localnet,
    EphemeralDevnet,
    EphemeralLocalnet,
    Custom(String),
}

impl Display for SolanaRpcUrl {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let str = match self {
            SolanaRpcUrl::Devnet => DEFAULT_BASE_RPC_URL.to_string(),
            SolanaRpcUrl::Localnet => "http://localhost:8899".to_string(),
            SolanaRpcUrl::EphemeralDevnet => DEFAULT_ROLLUP_RPC_URL.to_string(),
            SolanaRpcUrl::EphemeralLocalnet => "http://localhost:7799".to_string(),
            SolanaRpcUrl::Custom(url) => url.clone(),
        };
        write!(f, "{}", str)
    }
}

#[derive(Clone, Debug, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Upper bound on the time spent retrying a single read.
    pub timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: 5,
            retry_delay: Duration::from_millis(500),
            timeout: Duration::from_secs(20),
        }
    }
}

/// Retries `operation` while it fails with a transient error. Only used for
/// reads; writes are never resubmitted blindly.
pub async fn retry_transient<F, Fut, T>(config: &RetryConfig, operation: F) -> Result<T, RpcError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, RpcError>>,
{
    let mut attempts = 0;
    let start_time = Instant::now();
    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_transient() => {
                attempts += 1;
                if attempts >= config.max_retries || start_time.elapsed() >= config.timeout {
                    return Err(e);
                }
                warn!(
                    "Operation failed, retrying in {:?} (attempt {}/{}): {:?}",
                    config.retry_delay, attempts, config.max_retries, e
                );
                tokio::task::yield_now().await;
                sleep(config.retry_delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LayerEndpointConfig {
    pub rpc_url: String,
    pub ws_url: String,
    pub commitment: CommitmentConfig,
}

impl LayerEndpointConfig {
    pub fn base_devnet() -> Self {
        Self {
            rpc_url: DEFAULT_BASE_RPC_URL.to_string(),
            ws_url: DEFAULT_BASE_WS_URL.to_string(),
            commitment: CommitmentConfig::confirmed(),
        }
    }

    pub fn rollup_devnet() -> Self {
        Self {
            rpc_url: DEFAULT_ROLLUP_RPC_URL.to_string(),
            ws_url: DEFAULT_ROLLUP_WS_URL.to_string(),
            commitment: CommitmentConfig::confirmed(),
        }
    }
}

pub struct SolanaLayerRpc {
    pub client: RpcClient,
    pub ws_url: String,
    pub commitment: CommitmentConfig,
    pub retry_config: RetryConfig,
    pub reconnect_config: ReconnectConfig,
}

impl Debug for SolanaLayerRpc {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SolanaLayerRpc {{ client: {:?}, ws: {:?} }}",
            self.client.url(),
            self.ws_url
        )
    }
}

impl SolanaLayerRpc {
    pub fn new(config: LayerEndpointConfig) -> Self {
        Self::new_with_retry(config, None, None)
    }

    pub fn new_with_retry(
        config: LayerEndpointConfig,
        retry_config: Option<RetryConfig>,
        reconnect_config: Option<ReconnectConfig>,
    ) -> Self {
        let client = RpcClient::new_with_commitment(config.rpc_url, config.commitment);
        Self {
            client,
            ws_url: config.ws_url,
            commitment: config.commitment,
            retry_config: retry_config.unwrap_or_default(),
            reconnect_config: reconnect_config.unwrap_or_default(),
        }
    }
}

#[async_trait]
impl LayerRpc for SolanaLayerRpc {
    fn url(&self) -> String {
        self.client.url()
    }

    async fn health(&self) -> Result<(), RpcError> {
        let client = &self.client;
        retry_transient(&self.retry_config, || async move {
            client.get_health().await.map_err(RpcError::from)
        })
        .await
    }

    async fn get_account(&self, address: &Pubkey) -> Result<Option<Account>, RpcError> {
        let client = &self.client;
        let commitment = self.commitment;
        retry_transient(&self.retry_config, || async move {
            client
                .get_account_with_commitment(address, commitment)
                .await
                .map(|response| response.value)
                .map_err(RpcError::from)
        })
        .await
    }

    async fn get_latest_blockhash(&self) -> Result<Hash, RpcError> {
        let client = &self.client;
        retry_transient(&self.retry_config, || async move {
            client
                .get_latest_blockhash()
                .await
                .map_err(RpcError::from)
        })
        .await
    }

    async fn send_transaction(
        &self,
        transaction: &Transaction,
        skip_preflight: bool,
    ) -> Result<Signature, RpcError> {
        self.client
            .send_transaction_with_config(
                transaction,
                RpcSendTransactionConfig {
                    skip_preflight,
                    preflight_commitment: Some(self.commitment.commitment),
                    ..Default::default()
                },
            )
            .await
            .map_err(RpcError::from)
    }

    async fn get_signature_status(
        &self,
        signature: &Signature,
        commitment: CommitmentConfig,
    ) -> Result<Option<Result<(), TransactionError>>, RpcError> {
        self.client
            .get_signature_status_with_commitment(signature, commitment)
            .await
            .map_err(RpcError::from)
    }

    async fn subscribe_account(
        &self,
        layer: Layer,
        address: Pubkey,
        handler: Arc<dyn AccountUpdateHandler>,
        ready: oneshot::Sender<()>,
        shutdown: oneshot::Receiver<()>,
    ) -> Result<(), RpcError> {
        AccountSubscriber::new(self.ws_url.clone(), layer, address, handler, shutdown)
            .with_ready_signal(ready)
            .with_commitment(self.commitment)
            .with_reconnect_config(self.reconnect_config.clone())
            .run()
            .await
    }
}
