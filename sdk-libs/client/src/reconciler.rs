use std::{
    sync::{Arc, RwLock, Weak},
    time::Duration,
};

use async_trait::async_trait;
use solana_sdk::{account::Account, pubkey::Pubkey};
use tracing::{debug, info, trace, warn};

use crate::{
    accounts::TrackedAccount,
    address::TrackedAddresses,
    delegation::{DelegationObserver, DelegationStateMachine, DelegationStatus, ProbeMode},
    errors::SyncError,
    rpc::{AccountUpdate, AccountUpdateHandler, ConnectionManager, Layer, LayerRpc, RpcError},
    store::AccountStateStore,
};

/// Upper bound on waiting for a new subscription to start listening before
/// the read-through goes ahead anyway.
const LISTEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Keeps the store in step with both layers.
///
/// Base subscriptions cover every tracked address for as long as tracking
/// runs. The rollup subscription on the session address exists only while the
/// session is `Delegated`; it is driven by delegation transitions.
pub struct SubscriptionReconciler<R: LayerRpc> {
    connections: Arc<ConnectionManager<R>>,
    store: Arc<AccountStateStore>,
    delegation: Arc<DelegationStateMachine<R>>,
    tracked: RwLock<Option<TrackedAddresses>>,
    this: Weak<Self>,
}

impl<R: LayerRpc> SubscriptionReconciler<R> {
    /// Registers itself as a delegation observer.
    pub fn new(
        connections: Arc<ConnectionManager<R>>,
        store: Arc<AccountStateStore>,
        delegation: Arc<DelegationStateMachine<R>>,
    ) -> Arc<Self> {
        let reconciler = Arc::new_cyclic(|this| Self {
            connections,
            store,
            delegation: delegation.clone(),
            tracked: RwLock::new(None),
            this: this.clone(),
        });
        let observer: Arc<dyn DelegationObserver> = reconciler.clone();
        delegation.register_observer(Arc::downgrade(&observer));
        reconciler
    }

    pub fn tracked(&self) -> Option<TrackedAddresses> {
        *self.tracked.read().unwrap_or_else(|e| e.into_inner())
    }

    fn handler(&self) -> Option<Arc<dyn AccountUpdateHandler>> {
        self.this
            .upgrade()
            .map(|this| this as Arc<dyn AccountUpdateHandler>)
    }

    /// Base push subscriptions, read-through once they listen, status probe.
    pub async fn start(&self, addresses: TrackedAddresses) -> Result<DelegationStatus, SyncError> {
        if let Some(previous) = self.tracked() {
            if previous != addresses {
                self.stop();
            }
        }
        *self.tracked.write().unwrap_or_else(|e| e.into_inner()) = Some(addresses);

        if let Some(handler) = self.handler() {
            for address in addresses.all() {
                self.connections
                    .subscribe(Layer::Base, address, handler.clone());
            }
        }
        for address in addresses.all() {
            self.await_listening(Layer::Base, address).await;
        }

        self.refresh(Layer::Base, &addresses.all()).await?;
        let status = self
            .delegation
            .probe(&addresses.session, ProbeMode::Active)
            .await?;

        // A probe that found no change fires no transition.
        self.sync_rollup_subscription(addresses.session, status);

        info!(
            "Tracking {} (session {}, record {}), status {}",
            addresses.owner, addresses.session, addresses.record, status
        );
        Ok(status)
    }

    pub fn stop(&self) {
        let tracked = self.tracked.write().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(addresses) = tracked {
            for address in addresses.all() {
                self.connections.unsubscribe(Layer::Base, &address);
                self.connections.unsubscribe(Layer::Rollup, &address);
            }
            info!("Stopped tracking {}", addresses.owner);
        }
    }

    /// One-shot read of `addresses` on `layer`. Decode failures are surfaced.
    pub async fn refresh(&self, layer: Layer, addresses: &[Pubkey]) -> Result<(), SyncError> {
        for address in addresses {
            if layer == Layer::Rollup && !self.accepts_rollup(address) {
                trace!("Skipping rollup read of undelegated {}", address);
                continue;
            }
            let account = self.connections.get_account(layer, address).await?;
            match account {
                Some(account) if !account.data.is_empty() => {
                    let decoded = TrackedAccount::decode(&account.data).map_err(|error| {
                        SyncError::from(RpcError::Decode {
                            address: *address,
                            error,
                        })
                    })?;
                    self.store.set(*address, layer, decoded);
                }
                _ => self.store.clear(address, layer),
            }
        }
        Ok(())
    }

    async fn await_listening(&self, layer: Layer, address: Pubkey) {
        if !self
            .connections
            .wait_listening(layer, &address, LISTEN_TIMEOUT)
            .await
        {
            warn!(
                "{} subscription for {} not listening, reading through anyway",
                layer, address
            );
        }
    }

    fn accepts_rollup(&self, address: &Pubkey) -> bool {
        self.store.delegation_status(address).read_layer() == Layer::Rollup
    }

    fn is_session(&self, address: &Pubkey) -> bool {
        self.tracked()
            .is_some_and(|addresses| addresses.session == *address)
    }

    fn apply(&self, layer: Layer, address: Pubkey, account: &Account) {
        if account.data.is_empty() || account.lamports == 0 {
            self.store.clear(&address, layer);
            return;
        }
        match TrackedAccount::decode(&account.data) {
            Ok(decoded) => self.store.set(address, layer, decoded),
            Err(e) => warn!(
                "Dropping undecodable {} update for {}: {}",
                layer, address, e
            ),
        }
    }

    fn sync_rollup_subscription(&self, session: Pubkey, status: DelegationStatus) {
        if status == DelegationStatus::Delegated {
            let Some(handler) = self.handler() else {
                return;
            };
            self.connections.subscribe(Layer::Rollup, session, handler);
            if let Some(this) = self.this.upgrade() {
                tokio::spawn(async move {
                    this.await_listening(Layer::Rollup, session).await;
                    if let Err(e) = this.refresh(Layer::Rollup, &[session]).await {
                        warn!("Rollup read-through of {} failed: {}", session, e);
                    }
                });
            }
        } else {
            self.connections.unsubscribe(Layer::Rollup, &session);
        }
    }
}

#[async_trait]
impl<R: LayerRpc> AccountUpdateHandler for SubscriptionReconciler<R> {
    async fn handle_update(&self, update: AccountUpdate) {
        let AccountUpdate {
            layer,
            address,
            slot,
            account,
        } = update;
        trace!("{} update for {} at slot {}", layer, address, slot);

        match layer {
            Layer::Base => {
                self.apply(layer, address, &account);
                if self.is_session(&address) {
                    if let Err(e) = self.delegation.probe(&address, ProbeMode::Passive).await {
                        warn!("Passive probe of {} failed: {}", address, e);
                    }
                }
            }
            Layer::Rollup => {
                let status = self.store.delegation_status(&address);
                if status != DelegationStatus::Delegated {
                    debug!("Ignoring rollup update for {} while {}", address, status);
                    return;
                }
                self.apply(layer, address, &account);
            }
        }
    }
}

impl<R: LayerRpc> DelegationObserver for SubscriptionReconciler<R> {
    fn on_transition(&self, address: Pubkey, from: DelegationStatus, to: DelegationStatus) {
        if !self.is_session(&address) {
            return;
        }
        if to == DelegationStatus::Delegated || from == DelegationStatus::Delegated {
            self.sync_rollup_subscription(address, to);
        }
    }
}
