//! Delegation lifecycle of the session account.
//!
//! The machine is the only writer of [`DelegationStatus`]. Observers are
//! notified synchronously on every transition, which is how the reconciler
//! starts and stops the rollup subscription.

use std::{
    fmt::{Display, Formatter},
    sync::{Arc, RwLock, Weak},
    time::Duration,
};

use solana_sdk::pubkey::Pubkey;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::{
    accounts::TypingSession,
    address::TrackedAddresses,
    constants::DELEGATION_PROGRAM_ID,
    errors::SyncError,
    instructions::RemoteCall,
    pipeline::{ConfirmationReceipt, PipelineError, TransactionPipeline},
    rpc::{retry_transient, ConnectionManager, Layer, LayerRpc, RetryConfig},
    store::AccountStateStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DelegationStatus {
    #[default]
    Unknown,
    Undelegated,
    Delegating,
    Delegated,
    Committing,
    Undelegating,
}

impl DelegationStatus {
    /// Layer whose view is authoritative in this state.
    pub fn read_layer(&self) -> Layer {
        match self {
            DelegationStatus::Delegated
            | DelegationStatus::Committing
            | DelegationStatus::Undelegating => Layer::Rollup,
            DelegationStatus::Unknown
            | DelegationStatus::Undelegated
            | DelegationStatus::Delegating => Layer::Base,
        }
    }

    /// Layer that accepts session writes, `None` while nothing does.
    pub fn write_layer(&self) -> Option<Layer> {
        match self {
            DelegationStatus::Undelegated => Some(Layer::Base),
            DelegationStatus::Delegated => Some(Layer::Rollup),
            _ => None,
        }
    }

    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            DelegationStatus::Delegating
                | DelegationStatus::Committing
                | DelegationStatus::Undelegating
        )
    }
}

impl Display for DelegationStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DelegationStatus::Unknown => "unknown",
            DelegationStatus::Undelegated => "undelegated",
            DelegationStatus::Delegating => "delegating",
            DelegationStatus::Delegated => "delegated",
            DelegationStatus::Committing => "committing",
            DelegationStatus::Undelegating => "undelegating",
        };
        write!(f, "{}", name)
    }
}

pub trait DelegationObserver: Send + Sync {
    fn on_transition(&self, address: Pubkey, from: DelegationStatus, to: DelegationStatus);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMode {
    /// Requested by the caller or a lifecycle operation. Always recorded.
    Active,
    /// Triggered by a push update. Never overrides a transitional state.
    Passive,
}

#[derive(Debug, Clone)]
pub struct DelegationConfig {
    /// Wait between a confirmed ownership change and the confirming probe.
    pub propagation_delay: Duration,
    pub confirm_probe_attempts: u32,
    pub probe_retry: RetryConfig,
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            propagation_delay: Duration::from_secs(2),
            confirm_probe_attempts: 5,
            probe_retry: RetryConfig::default(),
        }
    }
}

pub struct DelegationStateMachine<R: LayerRpc> {
    connections: Arc<ConnectionManager<R>>,
    store: Arc<AccountStateStore>,
    observers: RwLock<Vec<Weak<dyn DelegationObserver>>>,
    config: DelegationConfig,
}

impl<R: LayerRpc> DelegationStateMachine<R> {
    pub fn new(
        connections: Arc<ConnectionManager<R>>,
        store: Arc<AccountStateStore>,
        config: DelegationConfig,
    ) -> Self {
        Self {
            connections,
            store,
            observers: RwLock::new(Vec::new()),
            config,
        }
    }

    pub fn config(&self) -> &DelegationConfig {
        &self.config
    }

    pub fn status(&self, address: &Pubkey) -> DelegationStatus {
        self.store.delegation_status(address)
    }

    pub fn register_observer(&self, observer: Weak<dyn DelegationObserver>) {
        let mut observers = self.observers.write().unwrap_or_else(|e| e.into_inner());
        observers.retain(|o| o.strong_count() > 0);
        observers.push(observer);
    }

    fn transition(&self, address: Pubkey, to: DelegationStatus) -> DelegationStatus {
        let from = self.store.set_delegation_status(address, to);
        if to == DelegationStatus::Undelegated {
            self.store.clear(&address, Layer::Rollup);
        }
        if from != to {
            info!("Delegation status of {}: {} -> {}", address, from, to);
            let observers: Vec<Arc<dyn DelegationObserver>> = self
                .observers
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .filter_map(Weak::upgrade)
                .collect();
            for observer in observers {
                observer.on_transition(address, from, to);
            }
        }
        from
    }

    /// Reads base-layer ownership without recording anything.
    async fn observe(&self, address: &Pubkey) -> Result<DelegationStatus, SyncError> {
        let connections = &self.connections;
        let account = retry_transient(&self.config.probe_retry, || async move {
            connections.get_account(Layer::Base, address).await
        })
        .await?;
        Ok(match account {
            Some(account) if account.owner == DELEGATION_PROGRAM_ID => DelegationStatus::Delegated,
            _ => DelegationStatus::Undelegated,
        })
    }

    /// Rollup state is fetched best-effort once delegation is observed.
    async fn fetch_rollup_view(&self, address: &Pubkey) {
        match self
            .connections
            .get_anchor_account::<TypingSession>(Layer::Rollup, address)
            .await
        {
            Ok(Some(session)) => {
                if self.status(address) == DelegationStatus::Delegated {
                    self.store.set(*address, Layer::Rollup, session.into());
                }
            }
            Ok(None) => debug!("{} not yet present on the rollup", address),
            Err(e) => warn!("Rollup read of {} failed: {}", address, e),
        }
    }

    /// Determines the status from base-layer ownership. Idempotent;
    /// concurrent probes are last-write-wins.
    pub async fn probe(
        &self,
        address: &Pubkey,
        mode: ProbeMode,
    ) -> Result<DelegationStatus, SyncError> {
        let observed = self.observe(address).await?;

        let current = self.status(address);
        if mode == ProbeMode::Passive && current.is_transitional() {
            debug!(
                "Passive probe of {} observed {} during {}; left to the lifecycle operation",
                address, observed, current
            );
            return Ok(current);
        }

        self.transition(*address, observed);
        if observed == DelegationStatus::Delegated {
            self.fetch_rollup_view(address).await;
        }
        Ok(observed)
    }

    /// Re-probes until `expected` is observed or the attempts run out.
    async fn confirm_ownership(
        &self,
        address: &Pubkey,
        expected: DelegationStatus,
    ) -> Result<DelegationStatus, SyncError> {
        let attempts = self.config.confirm_probe_attempts.max(1);
        let mut observed = DelegationStatus::Unknown;
        for attempt in 1..=attempts {
            sleep(self.config.propagation_delay).await;
            observed = self.observe(address).await?;
            if observed == expected {
                break;
            }
            debug!(
                "Probe {}/{} of {} observed {}, expected {}",
                attempt, attempts, address, observed, expected
            );
        }
        Ok(observed)
    }

    /// The write already landed; a failed re-read leaves the push
    /// subscription to catch up.
    async fn reread_base(pipeline: &TransactionPipeline<R>, session: Pubkey) {
        if let Err(e) = pipeline.reconciler().refresh(Layer::Base, &[session]).await {
            warn!("Base re-read of {} after write failed: {}", session, e);
        }
    }

    fn require(
        &self,
        address: &Pubkey,
        call: RemoteCall,
        allowed: &[DelegationStatus],
    ) -> Result<DelegationStatus, SyncError> {
        let status = self.status(address);
        if allowed.contains(&status) {
            Ok(status)
        } else {
            Err(SyncError::InvalidState { call, status })
        }
    }

    pub async fn delegate(
        &self,
        pipeline: &TransactionPipeline<R>,
        addresses: &TrackedAddresses,
    ) -> Result<ConfirmationReceipt, SyncError> {
        let session = addresses.session;
        self.require(
            &session,
            RemoteCall::Delegate,
            &[DelegationStatus::Unknown, DelegationStatus::Undelegated],
        )?;
        self.transition(session, DelegationStatus::Delegating);

        let receipt = match pipeline.execute(addresses, Layer::Base, RemoteCall::Delegate).await {
            Ok(receipt) => receipt,
            Err(e @ PipelineError::ConfirmTimeout { .. }) => {
                // Landed or not, only a later probe can tell.
                self.transition(session, DelegationStatus::Unknown);
                return Err(e.into());
            }
            Err(e) => {
                self.transition(session, DelegationStatus::Undelegated);
                return Err(e.into());
            }
        };

        match self
            .confirm_ownership(&session, DelegationStatus::Delegated)
            .await
        {
            Ok(DelegationStatus::Delegated) => {
                self.transition(session, DelegationStatus::Delegated);
                self.fetch_rollup_view(&session).await;
                Ok(receipt)
            }
            Ok(observed) => {
                self.transition(session, DelegationStatus::Undelegated);
                Err(SyncError::DelegationNotConfirmed {
                    reason: format!(
                        "{} confirmed as {} but the session is still {}",
                        receipt.call, receipt.signature, observed
                    ),
                })
            }
            Err(e) => {
                self.transition(session, DelegationStatus::Unknown);
                Err(e)
            }
        }
    }

    pub async fn commit(
        &self,
        pipeline: &TransactionPipeline<R>,
        addresses: &TrackedAddresses,
    ) -> Result<ConfirmationReceipt, SyncError> {
        let session = addresses.session;
        self.require(&session, RemoteCall::Commit, &[DelegationStatus::Delegated])?;
        self.transition(session, DelegationStatus::Committing);

        let result = pipeline.execute(addresses, Layer::Rollup, RemoteCall::Commit).await;
        self.transition(session, DelegationStatus::Delegated);
        let receipt = result?;

        sleep(self.config.propagation_delay).await;
        Self::reread_base(pipeline, session).await;
        Ok(receipt)
    }

    pub async fn undelegate(
        &self,
        pipeline: &TransactionPipeline<R>,
        addresses: &TrackedAddresses,
    ) -> Result<ConfirmationReceipt, SyncError> {
        let session = addresses.session;
        self.require(&session, RemoteCall::Undelegate, &[DelegationStatus::Delegated])?;
        self.transition(session, DelegationStatus::Undelegating);

        let receipt = match pipeline
            .execute(addresses, Layer::Rollup, RemoteCall::Undelegate)
            .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                match self.observe(&session).await {
                    Ok(observed) => {
                        self.transition(session, observed);
                    }
                    Err(probe_error) => {
                        warn!("Re-probe after failed undelegate: {}", probe_error);
                        self.transition(session, DelegationStatus::Unknown);
                    }
                }
                return Err(e.into());
            }
        };

        match self
            .confirm_ownership(&session, DelegationStatus::Undelegated)
            .await
        {
            Ok(DelegationStatus::Undelegated) => {
                self.transition(session, DelegationStatus::Undelegated);
                Self::reread_base(pipeline, session).await;
                Ok(receipt)
            }
            Ok(observed) => {
                self.transition(session, observed);
                Err(SyncError::UndelegationNotConfirmed {
                    reason: format!(
                        "{} confirmed as {} but the session is still {}",
                        receipt.call, receipt.signature, observed
                    ),
                })
            }
            Err(e) => {
                self.transition(session, DelegationStatus::Unknown);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_follow_ownership() {
        assert_eq!(DelegationStatus::Unknown.read_layer(), Layer::Base);
        assert_eq!(DelegationStatus::Delegating.read_layer(), Layer::Base);
        assert_eq!(DelegationStatus::Delegated.read_layer(), Layer::Rollup);
        assert_eq!(DelegationStatus::Committing.read_layer(), Layer::Rollup);
        assert_eq!(DelegationStatus::Undelegating.read_layer(), Layer::Rollup);
        assert_eq!(DelegationStatus::Undelegated.read_layer(), Layer::Base);
    }

    #[test]
    fn only_settled_states_accept_writes() {
        assert_eq!(DelegationStatus::Undelegated.write_layer(), Some(Layer::Base));
        assert_eq!(DelegationStatus::Delegated.write_layer(), Some(Layer::Rollup));
        for status in [
            DelegationStatus::Unknown,
            DelegationStatus::Delegating,
            DelegationStatus::Committing,
            DelegationStatus::Undelegating,
        ] {
            assert_eq!(status.write_layer(), None);
        }
        assert!(!DelegationStatus::Unknown.is_transitional());
        assert!(DelegationStatus::Committing.is_transitional());
    }
}
