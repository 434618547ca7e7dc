//! User-level actions over the synchronization engine.

use std::{
    future::Future,
    sync::{Arc, RwLock},
};

use solana_sdk::{pubkey::Pubkey, signature::Keypair};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::{
    accounts::{PersonalRecord, TypingSession},
    address::TrackedAddresses,
    config::SyncConfig,
    delegation::{DelegationStateMachine, DelegationStatus, ProbeMode},
    errors::{ErrorKind, SyncError},
    instructions::RemoteCall,
    pipeline::{ConfirmationReceipt, PipelineError, TransactionPipeline},
    reconciler::SubscriptionReconciler,
    rpc::{ConnectionManager, Layer, LayerRpc},
    signer::{SessionKeyProvider, SignerChoice, SignerRouter},
    store::{AccountStateStore, LayerViews, StoreEvent},
};

/// The failure of the most recent action, kept until cleared or superseded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastError {
    pub action: &'static str,
    pub kind: ErrorKind,
    pub message: String,
}

pub struct TypingSyncClient<R: LayerRpc> {
    config: SyncConfig,
    connections: Arc<ConnectionManager<R>>,
    store: Arc<AccountStateStore>,
    router: Arc<SignerRouter>,
    delegation: Arc<DelegationStateMachine<R>>,
    reconciler: Arc<SubscriptionReconciler<R>>,
    pipeline: TransactionPipeline<R>,
    last_error: RwLock<Option<LastError>>,
}

impl<R: LayerRpc> TypingSyncClient<R> {
    pub fn new(
        config: SyncConfig,
        connections: ConnectionManager<R>,
        session_keys: Arc<dyn SessionKeyProvider>,
    ) -> Self {
        let connections = Arc::new(connections);
        let store = Arc::new(AccountStateStore::new());
        let router = Arc::new(SignerRouter::new(session_keys));
        let delegation = Arc::new(DelegationStateMachine::new(
            connections.clone(),
            store.clone(),
            config.delegation_config(),
        ));
        let reconciler =
            SubscriptionReconciler::new(connections.clone(), store.clone(), delegation.clone());
        let pipeline = TransactionPipeline::new(
            connections.clone(),
            router.clone(),
            store.clone(),
            reconciler.clone(),
            config.pipeline_config(),
        );
        Self {
            config,
            connections,
            store,
            router,
            delegation,
            reconciler,
            pipeline,
            last_error: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn connections(&self) -> &Arc<ConnectionManager<R>> {
        &self.connections
    }

    pub fn store(&self) -> &Arc<AccountStateStore> {
        &self.store
    }

    pub fn router(&self) -> &Arc<SignerRouter> {
        &self.router
    }

    pub fn events(&self) -> broadcast::Receiver<StoreEvent> {
        self.store.subscribe_events()
    }

    pub fn connect_wallet(&self, wallet: Arc<Keypair>) {
        self.router.connect_wallet(wallet);
    }

    /// Drops the wallet and every subscription.
    pub fn disconnect_wallet(&self) {
        self.reconciler.stop();
        self.router.disconnect_wallet();
    }

    pub fn addresses(&self) -> Result<TrackedAddresses, SyncError> {
        self.reconciler.tracked().ok_or(SyncError::NotTracking)
    }

    /// Starts tracking the connected wallet's accounts.
    pub async fn start(&self) -> Result<DelegationStatus, SyncError> {
        self.run("start", async {
            let owner = self.router.wallet_pubkey().ok_or_else(|| {
                SyncError::from(PipelineError::NotConnected {
                    reason: "connect a wallet before tracking".to_string(),
                })
            })?;
            self.reconciler
                .start(TrackedAddresses::new(owner, self.config.program_id))
                .await
        })
        .await
    }

    /// Read-only tracking of any owner's accounts.
    pub async fn track(&self, owner: Pubkey) -> Result<DelegationStatus, SyncError> {
        self.run("track", async {
            self.reconciler
                .start(TrackedAddresses::new(owner, self.config.program_id))
                .await
        })
        .await
    }

    /// Repeats the read-through and status probe for the tracked owner.
    pub async fn resync(&self) -> Result<DelegationStatus, SyncError> {
        self.run("resync", async {
            let addresses = self.addresses()?;
            self.reconciler.start(addresses).await
        })
        .await
    }

    pub fn stop(&self) {
        self.reconciler.stop();
    }

    pub fn status(&self) -> DelegationStatus {
        self.reconciler
            .tracked()
            .map(|addresses| self.delegation.status(&addresses.session))
            .unwrap_or_default()
    }

    pub async fn refresh_status(&self) -> Result<DelegationStatus, SyncError> {
        self.run("refresh_status", async {
            let addresses = self.addresses()?;
            self.delegation
                .probe(&addresses.session, ProbeMode::Active)
                .await
        })
        .await
    }

    /// Session as seen through the authoritative layer.
    pub fn session(&self) -> Option<TypingSession> {
        let addresses = self.reconciler.tracked()?;
        self.store.effective_session(&addresses.session)
    }

    pub fn session_views(&self) -> Option<LayerViews> {
        let addresses = self.reconciler.tracked()?;
        Some(self.store.views(&addresses.session))
    }

    /// The record is never delegated.
    pub fn record(&self) -> Option<PersonalRecord> {
        let addresses = self.reconciler.tracked()?;
        self.store.record(&addresses.record)
    }

    pub fn is_write_in_flight(&self) -> bool {
        self.reconciler
            .tracked()
            .is_some_and(|addresses| self.pipeline.is_write_in_flight(&addresses.session))
    }

    pub fn last_error(&self) -> Option<LastError> {
        self.last_error
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn clear_error(&self) {
        *self.last_error.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    async fn run<T, F>(&self, action: &'static str, operation: F) -> Result<T, SyncError>
    where
        F: Future<Output = Result<T, SyncError>>,
    {
        self.clear_error();
        let result = operation.await;
        if let Err(e) = &result {
            warn!("{} failed: {}", action, e);
            *self.last_error.write().unwrap_or_else(|e| e.into_inner()) = Some(LastError {
                action,
                kind: e.kind(),
                message: e.to_string(),
            });
        }
        result
    }

    /// Current status, probing first when it is unknown. Transitional states
    /// reject the call.
    async fn settled_status(
        &self,
        addresses: &TrackedAddresses,
        call: RemoteCall,
    ) -> Result<DelegationStatus, SyncError> {
        let mut status = self.delegation.status(&addresses.session);
        if status == DelegationStatus::Unknown {
            status = self
                .delegation
                .probe(&addresses.session, ProbeMode::Active)
                .await?;
        }
        if status.is_transitional() {
            return Err(SyncError::InvalidState { call, status });
        }
        Ok(status)
    }

    /// Base-layer write that touches the session account.
    async fn undelegated_write(&self, call: RemoteCall) -> Result<ConfirmationReceipt, SyncError> {
        let addresses = self.addresses()?;
        if self.settled_status(&addresses, call).await? == DelegationStatus::Delegated {
            return Err(SyncError::Authorization {
                call,
                required_layer: Layer::Base,
                required_signer: SignerChoice::Wallet,
                reason: "the session is delegated to the rollup; undelegate first".to_string(),
            });
        }
        Ok(self.pipeline.execute(&addresses, Layer::Base, call).await?)
    }

    /// Session write routed by delegation status.
    async fn session_write(&self, call: RemoteCall) -> Result<ConfirmationReceipt, SyncError> {
        let addresses = self.addresses()?;
        let status = self.settled_status(&addresses, call).await?;
        let layer = status
            .write_layer()
            .ok_or(SyncError::InvalidState { call, status })?;

        match self.pipeline.execute(&addresses, layer, call).await {
            Ok(receipt) => Ok(receipt),
            Err(e @ PipelineError::SubmitFailed { .. }) if layer == Layer::Rollup => {
                // The rollup may have refused because ownership moved back.
                let observed = self
                    .delegation
                    .probe(&addresses.session, ProbeMode::Active)
                    .await?;
                if observed == DelegationStatus::Delegated {
                    return Err(e.into());
                }
                Err(SyncError::Authorization {
                    call,
                    required_layer: Layer::Base,
                    required_signer: SignerChoice::Wallet,
                    reason: format!("the session is no longer delegated ({})", e),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn initialize_session(&self) -> Result<ConfirmationReceipt, SyncError> {
        self.run("initialize_session", self.undelegated_write(RemoteCall::InitializeSession))
            .await
    }

    pub async fn initialize_record(&self) -> Result<ConfirmationReceipt, SyncError> {
        self.run("initialize_record", async {
            let addresses = self.addresses()?;
            Ok(self
                .pipeline
                .execute(&addresses, Layer::Base, RemoteCall::InitializeRecord)
                .await?)
        })
        .await
    }

    pub async fn record_word(&self, is_correct: bool) -> Result<ConfirmationReceipt, SyncError> {
        self.run(
            "record_word",
            self.session_write(RemoteCall::RecordWord { is_correct }),
        )
        .await
    }

    pub async fn end_session(&self) -> Result<ConfirmationReceipt, SyncError> {
        self.run("end_session", self.session_write(RemoteCall::EndSession))
            .await
    }

    pub async fn save_to_record(&self) -> Result<ConfirmationReceipt, SyncError> {
        self.run("save_to_record", self.undelegated_write(RemoteCall::SaveToRecord))
            .await
    }

    pub async fn delegate(&self) -> Result<ConfirmationReceipt, SyncError> {
        self.run("delegate", async {
            let addresses = self.addresses()?;
            self.settled_status(&addresses, RemoteCall::Delegate).await?;
            let receipt = self.delegation.delegate(&self.pipeline, &addresses).await?;
            info!("Session {} delegated", addresses.session);
            Ok(receipt)
        })
        .await
    }

    pub async fn commit(&self) -> Result<ConfirmationReceipt, SyncError> {
        self.run("commit", async {
            let addresses = self.addresses()?;
            self.settled_status(&addresses, RemoteCall::Commit).await?;
            self.delegation.commit(&self.pipeline, &addresses).await
        })
        .await
    }

    pub async fn undelegate(&self) -> Result<ConfirmationReceipt, SyncError> {
        self.run("undelegate", async {
            let addresses = self.addresses()?;
            self.settled_status(&addresses, RemoteCall::Undelegate).await?;
            let receipt = self.delegation.undelegate(&self.pipeline, &addresses).await?;
            info!("Session {} returned to the base layer", addresses.session);
            Ok(receipt)
        })
        .await
    }
}
