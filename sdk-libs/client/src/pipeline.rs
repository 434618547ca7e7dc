use std::{sync::Arc, time::Duration};

use dashmap::{mapref::entry::Entry, DashMap};
use solana_sdk::{
    commitment_config::CommitmentConfig,
    pubkey::Pubkey,
    signature::{Keypair, Signature},
    transaction::Transaction,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    accounts::TrackedAccount,
    address::TrackedAddresses,
    errors::{ErrorKind, TypingProgramError},
    instructions::{BuildError, CallContext, RemoteCall},
    reconciler::SubscriptionReconciler,
    rpc::{ConnectionManager, Layer, LayerRpc, RpcError},
    signer::{SignerChoice, SignerError, SignerRouter},
    store::AccountStateStore,
};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Not connected: {reason}")]
    NotConnected { reason: String },

    #[error("Build failed: {0}")]
    BuildFailed(#[from] BuildError),

    #[error("Failed to sign {call} with the {signer}: {reason}")]
    SignFailed {
        call: RemoteCall,
        signer: SignerChoice,
        reason: String,
    },

    #[error("{call} rejected by the {layer} layer: {cause}")]
    SubmitFailed {
        call: RemoteCall,
        layer: Layer,
        cause: String,
        program_error: Option<TypingProgramError>,
        #[source]
        source: RpcError,
    },

    #[error(
        "{call} submitted as {signature} on the {layer} layer but not confirmed within {timeout:?}; re-probe before retrying"
    )]
    ConfirmTimeout {
        call: RemoteCall,
        layer: Layer,
        signature: Signature,
        timeout: Duration,
    },

    #[error("Another write to {address} is still in flight ({pending})")]
    WriteInFlight { address: Pubkey, pending: RemoteCall },
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::SignFailed { .. } => ErrorKind::Authorization,
            PipelineError::SubmitFailed {
                program_error: Some(TypingProgramError::InvalidAuth),
                ..
            } => ErrorKind::Authorization,
            PipelineError::SubmitFailed { source, .. } if source.is_transient() => {
                ErrorKind::Network
            }
            PipelineError::ConfirmTimeout { .. } => ErrorKind::ConfirmationTimeout,
            PipelineError::NotConnected { .. }
            | PipelineError::BuildFailed(_)
            | PipelineError::SubmitFailed { .. }
            | PipelineError::WriteInFlight { .. } => ErrorKind::Rejected,
        }
    }

    fn submit_failed(call: RemoteCall, layer: Layer, source: RpcError) -> Self {
        let program_error = source
            .transaction_error()
            .as_ref()
            .and_then(TypingProgramError::from_transaction_error);
        let cause = match program_error {
            Some(program_error) => program_error.to_string(),
            None => source.to_string(),
        };
        PipelineError::SubmitFailed {
            call,
            layer,
            cause,
            program_error,
            source,
        }
    }
}

impl From<SignerError> for PipelineError {
    fn from(err: SignerError) -> Self {
        PipelineError::NotConnected {
            reason: err.to_string(),
        }
    }
}

/// How the post-confirmation re-read relates to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RereadMode {
    Await,
    Detached,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub commitment: CommitmentConfig,
    pub confirm_timeout: Duration,
    pub confirm_poll_interval: Duration,
    pub skip_preflight: bool,
    pub reread: RereadMode,
    pub rollup_validator: Option<Pubkey>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            commitment: CommitmentConfig::confirmed(),
            confirm_timeout: Duration::from_secs(30),
            confirm_poll_interval: Duration::from_millis(400),
            skip_preflight: true,
            reread: RereadMode::Await,
            rollup_validator: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfirmationReceipt {
    pub call: RemoteCall,
    pub layer: Layer,
    pub signature: Signature,
    pub signer: SignerChoice,
    pub signer_pubkey: Pubkey,
}

struct InFlightGuard<'a> {
    in_flight: &'a DashMap<Pubkey, RemoteCall>,
    address: Pubkey,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.address);
    }
}

/// Build, sign, submit, confirm, re-read. One write per address at a time.
pub struct TransactionPipeline<R: LayerRpc> {
    connections: Arc<ConnectionManager<R>>,
    router: Arc<SignerRouter>,
    store: Arc<AccountStateStore>,
    reconciler: Arc<SubscriptionReconciler<R>>,
    config: PipelineConfig,
    in_flight: DashMap<Pubkey, RemoteCall>,
}

impl<R: LayerRpc> TransactionPipeline<R> {
    pub fn new(
        connections: Arc<ConnectionManager<R>>,
        router: Arc<SignerRouter>,
        store: Arc<AccountStateStore>,
        reconciler: Arc<SubscriptionReconciler<R>>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            connections,
            router,
            store,
            reconciler,
            config,
            in_flight: DashMap::new(),
        }
    }

    pub fn reconciler(&self) -> &Arc<SubscriptionReconciler<R>> {
        &self.reconciler
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn is_write_in_flight(&self, address: &Pubkey) -> bool {
        self.in_flight.contains_key(address)
    }

    fn acquire(
        &self,
        address: Pubkey,
        call: RemoteCall,
    ) -> Result<InFlightGuard<'_>, PipelineError> {
        match self.in_flight.entry(address) {
            Entry::Occupied(occupied) => Err(PipelineError::WriteInFlight {
                address,
                pending: *occupied.get(),
            }),
            Entry::Vacant(vacant) => {
                vacant.insert(call);
                Ok(InFlightGuard {
                    in_flight: &self.in_flight,
                    address,
                })
            }
        }
    }

    pub async fn execute(
        &self,
        addresses: &TrackedAddresses,
        layer: Layer,
        call: RemoteCall,
    ) -> Result<ConfirmationReceipt, PipelineError> {
        let _guard = self.acquire(call.write_target(addresses), call)?;

        let signer = self.router.resolve(layer, call.signer_policy())?;
        self.check_preconditions(addresses, layer, call).await?;

        let instruction = call.build(&CallContext {
            addresses,
            signer: signer.pubkey(),
            session_token: signer.session_token,
            rollup_validator: self.config.rollup_validator,
        })?;

        let blockhash = self
            .connections
            .get_latest_blockhash(layer)
            .await
            .map_err(|e| PipelineError::submit_failed(call, layer, e))?;

        let mut transaction = Transaction::new_with_payer(&[instruction], Some(&signer.pubkey()));
        let signers: Vec<&Keypair> = vec![signer.keypair.as_ref()];
        transaction
            .try_sign(&signers, blockhash)
            .map_err(|e| PipelineError::SignFailed {
                call,
                signer: signer.choice,
                reason: e.to_string(),
            })?;

        let signature = self
            .connections
            .send_transaction(layer, &transaction, self.config.skip_preflight)
            .await
            .map_err(|e| PipelineError::submit_failed(call, layer, e))?;
        debug!(
            "Submitted {} on {} layer as {} (signer: {})",
            call, layer, signature, signer.choice
        );

        match self
            .connections
            .confirm_transaction(
                layer,
                &signature,
                self.config.commitment,
                self.config.confirm_timeout,
                self.config.confirm_poll_interval,
            )
            .await
        {
            Ok(()) => {}
            Err(e) if e.transaction_error().is_some() => {
                return Err(PipelineError::submit_failed(call, layer, e));
            }
            Err(e) => {
                warn!("Confirmation of {} ({}) failed: {:?}", call, signature, e);
                return Err(PipelineError::ConfirmTimeout {
                    call,
                    layer,
                    signature,
                    timeout: self.config.confirm_timeout,
                });
            }
        }

        info!(
            "{} confirmed on {} layer: {} (signed by {} {})",
            call,
            layer,
            signature,
            signer.choice,
            signer.pubkey()
        );

        self.reread(layer, call.affected_accounts(addresses)).await;

        Ok(ConfirmationReceipt {
            call,
            layer,
            signature,
            signer: signer.choice,
            signer_pubkey: signer.pubkey(),
        })
    }

    async fn reread(&self, layer: Layer, affected: Vec<Pubkey>) {
        match self.config.reread {
            RereadMode::Await => {
                if let Err(e) = self.reconciler.refresh(layer, &affected).await {
                    warn!("Re-read after write failed: {}", e);
                }
            }
            RereadMode::Detached => {
                let reconciler = self.reconciler.clone();
                tokio::spawn(async move {
                    if let Err(e) = reconciler.refresh(layer, &affected).await {
                        warn!("Re-read after write failed: {}", e);
                    }
                });
            }
        }
    }

    /// Rejects calls the program is known to refuse. The store is consulted
    /// first; a failing check is re-evaluated against a fresh read.
    async fn check_preconditions(
        &self,
        addresses: &TrackedAddresses,
        layer: Layer,
        call: RemoteCall,
    ) -> Result<(), PipelineError> {
        if self.evaluate_preconditions(addresses, layer, call).is_ok() {
            return Ok(());
        }
        let required = match call {
            RemoteCall::SaveToRecord => addresses.all().to_vec(),
            _ => vec![addresses.session],
        };
        if let Err(e) = self.reconciler.refresh(layer, &required).await {
            warn!("Precondition re-read for {} failed: {}", call, e);
        }
        self.evaluate_preconditions(addresses, layer, call)
            .map_err(PipelineError::from)
    }

    fn evaluate_preconditions(
        &self,
        addresses: &TrackedAddresses,
        layer: Layer,
        call: RemoteCall,
    ) -> Result<(), BuildError> {
        let session = || match self.store.get(&addresses.session, layer) {
            Some(TrackedAccount::Session(session)) => Ok(session),
            _ => Err(BuildError::MissingAccount {
                call,
                name: "session",
                address: addresses.session,
            }),
        };

        match call {
            RemoteCall::InitializeSession | RemoteCall::InitializeRecord => Ok(()),
            RemoteCall::RecordWord { .. } | RemoteCall::EndSession => {
                if !session()?.is_active {
                    return Err(BuildError::Precondition {
                        call,
                        reason: "session is not active".to_string(),
                    });
                }
                Ok(())
            }
            RemoteCall::SaveToRecord => {
                if session()?.is_active {
                    return Err(BuildError::Precondition {
                        call,
                        reason: "session is still active".to_string(),
                    });
                }
                match self.store.get(&addresses.record, layer) {
                    Some(TrackedAccount::Record(record)) if record.is_full() => {
                        Err(BuildError::Precondition {
                            call,
                            reason: "attempt history is full".to_string(),
                        })
                    }
                    Some(TrackedAccount::Record(_)) => Ok(()),
                    _ => Err(BuildError::MissingAccount {
                        call,
                        name: "personal record",
                        address: addresses.record,
                    }),
                }
            }
            RemoteCall::Delegate => session().map(|_| ()),
            // The delegated account always exists on the base layer.
            RemoteCall::Commit | RemoteCall::Undelegate => {
                match self.store.get(&addresses.session, Layer::Base) {
                    Some(_) => Ok(()),
                    None => Err(BuildError::MissingAccount {
                        call,
                        name: "session",
                        address: addresses.session,
                    }),
                }
            }
        }
    }
}
