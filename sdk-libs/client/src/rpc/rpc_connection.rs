use std::{fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
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
use tracing::{debug, warn};

use super::{errors::RpcError, Layer};
use crate::accounts::AnchorAccount;

/// A raw account mutation pushed by a subscription.
#[derive(Debug, Clone)]
pub struct AccountUpdate {
    pub layer: Layer,
    pub address: Pubkey,
    pub slot: u64,
    pub account: Account,
}

#[async_trait]
pub trait AccountUpdateHandler: Send + Sync {
    async fn handle_update(&self, update: AccountUpdate);
}

/// One ledger endpoint. The endpoint itself does not know which layer it
/// serves; callers pass the layer explicitly through [`super::ConnectionManager`].
#[async_trait]
pub trait LayerRpc: Send + Sync + Debug + 'static {
    fn url(&self) -> String;

    async fn health(&self) -> Result<(), RpcError>;

    async fn get_account(&self, address: &Pubkey) -> Result<Option<Account>, RpcError>;

    async fn get_latest_blockhash(&self) -> Result<Hash, RpcError>;

    async fn send_transaction(
        &self,
        transaction: &Transaction,
        skip_preflight: bool,
    ) -> Result<Signature, RpcError>;

    /// `None` while the signature has not reached `commitment`.
    async fn get_signature_status(
        &self,
        signature: &Signature,
        commitment: CommitmentConfig,
    ) -> Result<Option<Result<(), TransactionError>>, RpcError>;

    /// Pushes every mutation of `address` to `handler` until `shutdown`
    /// resolves or its sender is dropped. `ready` fires once the endpoint
    /// is listening; no mutation after that point is missed.
    async fn subscribe_account(
        &self,
        layer: Layer,
        address: Pubkey,
        handler: Arc<dyn AccountUpdateHandler>,
        ready: oneshot::Sender<()>,
        shutdown: oneshot::Receiver<()>,
    ) -> Result<(), RpcError>;

    /// A missing account is `Ok(None)`; undecodable data is an error.
    async fn get_anchor_account<T: AnchorAccount + Send>(
        &self,
        address: &Pubkey,
    ) -> Result<Option<T>, RpcError>
    where
        Self: Sized,
    {
        match self.get_account(address).await? {
            Some(account) if !account.data.is_empty() => T::try_from_account_data(&account.data)
                .map(Some)
                .map_err(|error| RpcError::Decode {
                    address: *address,
                    error,
                }),
            _ => Ok(None),
        }
    }

    async fn confirm_transaction(
        &self,
        signature: &Signature,
        commitment: CommitmentConfig,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<(), RpcError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.get_signature_status(signature, commitment).await {
                Ok(Some(Ok(()))) => {
                    debug!("Transaction {} reached {:?}", signature, commitment.commitment);
                    return Ok(());
                }
                Ok(Some(Err(err))) => return Err(RpcError::from(err)),
                Ok(None) => {}
                Err(e) if e.is_transient() => {
                    warn!("Signature status lookup for {} failed: {:?}", signature, e);
                }
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(RpcError::ConfirmationTimeout {
                    signature: *signature,
                    timeout,
                });
            }
            sleep(poll_interval.min(deadline - now)).await;
        }
    }
}
