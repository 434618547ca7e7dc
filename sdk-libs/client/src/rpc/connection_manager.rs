use std::{
    fmt::{Display, Formatter},
    sync::Arc,
    time::Duration,
};

use dashmap::{mapref::entry::Entry, DashMap};
use solana_sdk::{
    account::Account, commitment_config::CommitmentConfig, hash::Hash, pubkey::Pubkey,
    signature::Signature, transaction::Transaction,
};
use tokio::{
    sync::{oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, error};

use super::{
    errors::RpcError,
    rpc_connection::{AccountUpdateHandler, LayerRpc},
    solana_rpc::{LayerEndpointConfig, RetryConfig, SolanaLayerRpc},
    subscriber::ReconnectConfig,
};
use crate::accounts::AnchorAccount;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layer {
    /// Durable ledger where accounts live while undelegated.
    Base,
    /// Ephemeral rollup the session account is delegated to.
    Rollup,
}

impl Display for Layer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Layer::Base => write!(f, "base"),
            Layer::Rollup => write!(f, "rollup"),
        }
    }
}

struct SubscriptionHandle {
    shutdown: Option<oneshot::Sender<()>>,
    listening: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// Owns both endpoints and every live push subscription. The layer is an
/// explicit argument on every call.
pub struct ConnectionManager<R: LayerRpc> {
    base: Arc<R>,
    rollup: Arc<R>,
    subscriptions: DashMap<(Layer, Pubkey), SubscriptionHandle>,
}

impl<R: LayerRpc> ConnectionManager<R> {
    pub fn new(base: R, rollup: R) -> Self {
        Self::from_shared(Arc::new(base), Arc::new(rollup))
    }

    pub fn from_shared(base: Arc<R>, rollup: Arc<R>) -> Self {
        Self {
            base,
            rollup,
            subscriptions: DashMap::new(),
        }
    }

    pub fn endpoint(&self, layer: Layer) -> &Arc<R> {
        match layer {
            Layer::Base => &self.base,
            Layer::Rollup => &self.rollup,
        }
    }

    pub async fn health(&self, layer: Layer) -> Result<(), RpcError> {
        self.endpoint(layer).health().await
    }

    pub async fn get_account(
        &self,
        layer: Layer,
        address: &Pubkey,
    ) -> Result<Option<Account>, RpcError> {
        self.endpoint(layer).get_account(address).await
    }

    pub async fn get_anchor_account<T: AnchorAccount + Send>(
        &self,
        layer: Layer,
        address: &Pubkey,
    ) -> Result<Option<T>, RpcError> {
        self.endpoint(layer).get_anchor_account::<T>(address).await
    }

    pub async fn get_latest_blockhash(&self, layer: Layer) -> Result<Hash, RpcError> {
        self.endpoint(layer).get_latest_blockhash().await
    }

    pub async fn send_transaction(
        &self,
        layer: Layer,
        transaction: &Transaction,
        skip_preflight: bool,
    ) -> Result<Signature, RpcError> {
        self.endpoint(layer)
            .send_transaction(transaction, skip_preflight)
            .await
    }

    pub async fn confirm_transaction(
        &self,
        layer: Layer,
        signature: &Signature,
        commitment: CommitmentConfig,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<(), RpcError> {
        self.endpoint(layer)
            .confirm_transaction(signature, commitment, timeout, poll_interval)
            .await
    }

    /// Starts a push subscription unless one is already live for
    /// `(layer, address)`. Returns whether a new subscription was started.
    pub fn subscribe(
        &self,
        layer: Layer,
        address: Pubkey,
        handler: Arc<dyn AccountUpdateHandler>,
    ) -> bool {
        match self.subscriptions.entry((layer, address)) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_finished() {
                    return false;
                }
                occupied.insert(self.spawn_subscription(layer, address, handler));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(self.spawn_subscription(layer, address, handler));
            }
        }
        debug!("Subscribed to {} account {}", layer, address);
        true
    }

    /// Waits until the subscription for `(layer, address)` is listening.
    /// Returns `false` if there is none, it ended first, or `timeout` elapsed.
    pub async fn wait_listening(&self, layer: Layer, address: &Pubkey, timeout: Duration) -> bool {
        let Some(mut listening) = self
            .subscriptions
            .get(&(layer, *address))
            .map(|handle| handle.listening.clone())
        else {
            return false;
        };
        let listened = matches!(
            tokio::time::timeout(timeout, listening.wait_for(|listening| *listening)).await,
            Ok(Ok(_))
        );
        listened
    }

    pub fn unsubscribe(&self, layer: Layer, address: &Pubkey) -> bool {
        let removed = self.subscriptions.remove(&(layer, *address)).is_some();
        if removed {
            debug!("Unsubscribed from {} account {}", layer, address);
        }
        removed
    }

    pub fn unsubscribe_all(&self) {
        self.subscriptions.clear();
    }

    pub fn is_subscribed(&self, layer: Layer, address: &Pubkey) -> bool {
        self.subscriptions
            .get(&(layer, *address))
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    fn spawn_subscription(
        &self,
        layer: Layer,
        address: Pubkey,
        handler: Arc<dyn AccountUpdateHandler>,
    ) -> SubscriptionHandle {
        let (shutdown, shutdown_rx) = oneshot::channel();
        let (ready, ready_rx) = oneshot::channel();
        let (listening_tx, listening) = watch::channel(false);
        let endpoint = self.endpoint(layer).clone();
        let task = tokio::spawn(async move {
            let subscription =
                endpoint.subscribe_account(layer, address, handler, ready, shutdown_rx);
            tokio::pin!(subscription);
            let ended_early = tokio::select! {
                result = &mut subscription => Some(result),
                Ok(()) = ready_rx => None,
            };
            let result = match ended_early {
                Some(result) => result,
                None => {
                    let _ = listening_tx.send(true);
                    subscription.await
                }
            };
            if let Err(e) = result {
                error!("{} subscription for {} ended: {:?}", layer, address, e);
            }
        });
        SubscriptionHandle {
            shutdown: Some(shutdown),
            listening,
            task,
        }
    }
}

impl ConnectionManager<SolanaLayerRpc> {
    pub fn connect(
        base: LayerEndpointConfig,
        rollup: LayerEndpointConfig,
        retry_config: RetryConfig,
        reconnect_config: ReconnectConfig,
    ) -> Self {
        Self::new(
            SolanaLayerRpc::new_with_retry(base, Some(retry_config), Some(reconnect_config.clone())),
            SolanaLayerRpc::new_with_retry(rollup, Some(retry_config), Some(reconnect_config)),
        )
    }
}
