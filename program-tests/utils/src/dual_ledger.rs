use std::{
    collections::{HashMap, HashSet},
    fmt::{Debug, Formatter},
    io,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use solana_client::client_error::ClientError;
use solana_sdk::{
    account::Account,
    commitment_config::CommitmentConfig,
    hash::Hash,
    pubkey::Pubkey,
    signature::Signature,
    transaction::{Transaction, TransactionError},
};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use typing_sync_client::{
    accounts::{AnchorAccount, PersonalRecord, TypingSession},
    constants::TYPING_PROGRAM_ID,
    instructions::instruction_discriminator,
    rpc::{AccountUpdate, AccountUpdateHandler, ConnectionManager, Layer, LayerRpc, RpcError},
    signer::unix_timestamp,
};

use crate::program::{session_account, LedgerAccounts, SessionTokenEntry};

/// One-shot misbehavior for the next matching transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Refused at submission.
    RejectSubmit(TransactionError),
    /// Accepted but never executed or confirmed.
    Drop,
    /// Executed, but its status is never reported.
    WithholdConfirmation,
}

#[derive(Default)]
struct LedgerState {
    ledger: LedgerAccounts,
    slot: u64,
    statuses: HashMap<Signature, (Layer, Result<(), TransactionError>)>,
    withheld: HashSet<Signature>,
    faults: HashMap<(Layer, &'static str), Fault>,
    /// Per layer: reads still allowed through, then reads that fail.
    failing_reads: HashMap<Layer, (u32, u32)>,
    subscribers: HashMap<(Layer, Pubkey), Vec<mpsc::UnboundedSender<AccountUpdate>>>,
    submitted: Vec<(Layer, Signature, Pubkey)>,
}

/// In-memory base layer and rollup sharing one clock, which starts at wall
/// time so session credentials validate on both sides. Each layer is exposed
/// as a [`LedgerEndpoint`] so a [`ConnectionManager`] can drive both.
#[derive(Clone)]
pub struct DualLedger {
    state: Arc<Mutex<LedgerState>>,
    program_id: Pubkey,
}

impl Debug for DualLedger {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "DualLedger {{ program_id: {} }}", self.program_id)
    }
}

impl Default for DualLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl DualLedger {
    pub fn new() -> Self {
        Self::with_program_id(TYPING_PROGRAM_ID)
    }

    pub fn with_program_id(program_id: Pubkey) -> Self {
        let mut state = LedgerState::default();
        state.ledger.unix_timestamp = unix_timestamp();
        Self {
            state: Arc::new(Mutex::new(state)),
            program_id,
        }
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn endpoint(&self, layer: Layer) -> LedgerEndpoint {
        LedgerEndpoint {
            layer,
            ledger: self.clone(),
        }
    }

    pub fn connection_manager(&self) -> ConnectionManager<LedgerEndpoint> {
        ConnectionManager::new(self.endpoint(Layer::Base), self.endpoint(Layer::Rollup))
    }

    pub fn unix_timestamp(&self) -> i64 {
        self.state().ledger.unix_timestamp
    }

    pub fn advance_clock(&self, seconds: i64) {
        self.state().ledger.unix_timestamp += seconds;
    }

    pub fn account(&self, layer: Layer, address: &Pubkey) -> Option<Account> {
        self.state().ledger.accounts.get(&(layer, *address)).cloned()
    }

    pub fn session(&self, layer: Layer, address: &Pubkey) -> Option<TypingSession> {
        self.account(layer, address)
            .and_then(|account| TypingSession::try_from_account_data(&account.data).ok())
    }

    pub fn record(&self, address: &Pubkey) -> Option<PersonalRecord> {
        self.account(Layer::Base, address)
            .and_then(|account| PersonalRecord::try_from_account_data(&account.data).ok())
    }

    pub fn delegated_validator(&self, address: &Pubkey) -> Option<Option<Pubkey>> {
        self.state().ledger.delegated_validators.get(address).copied()
    }

    /// Overwrites an account and notifies subscribers.
    pub fn set_account(&self, layer: Layer, address: Pubkey, account: Account) {
        let mut state = self.state();
        state.ledger.accounts.insert((layer, address), account);
        Self::notify(&mut state, &[(layer, address)]);
    }

    /// The validator returns the session to the base layer out of band.
    /// Subscribers are not notified, as if the push was lost.
    pub fn revert_delegation(&self, address: &Pubkey) {
        let mut state = self.state();
        let Some(rollup) = state.ledger.accounts.remove(&(Layer::Rollup, *address)) else {
            return;
        };
        let session = TypingSession::try_from_account_data(&rollup.data).ok();
        if let Some(session) = session {
            state
                .ledger
                .accounts
                .insert((Layer::Base, *address), session_account(&session, self.program_id));
        }
        state.ledger.delegated_validators.remove(address);
    }

    /// Registers an on-ledger session token and returns its address.
    pub fn register_session_token(&self, authority: Pubkey, signer: Pubkey, valid_until: i64) -> Pubkey {
        let token = Pubkey::new_unique();
        self.state().ledger.session_tokens.insert(
            token,
            SessionTokenEntry {
                authority,
                signer,
                valid_until,
            },
        );
        token
    }

    pub fn inject_fault(&self, layer: Layer, instruction: &'static str, fault: Fault) {
        self.state().faults.insert((layer, instruction), fault);
    }

    /// The next `count` reads on `layer` fail with a transport error.
    pub fn fail_reads(&self, layer: Layer, count: u32) {
        self.fail_reads_after(layer, 0, count);
    }

    /// The next `passing` reads on `layer` succeed, then `count` fail.
    pub fn fail_reads_after(&self, layer: Layer, passing: u32, count: u32) {
        self.state().failing_reads.insert(layer, (passing, count));
    }

    /// Withheld transactions start reporting their status.
    pub fn release_withheld(&self) {
        self.state().withheld.clear();
    }

    pub fn submitted(&self, layer: Layer) -> Vec<(Signature, Pubkey)> {
        self.state()
            .submitted
            .iter()
            .filter(|(l, _, _)| *l == layer)
            .map(|(_, signature, payer)| (*signature, *payer))
            .collect()
    }

    pub fn subscriber_count(&self, layer: Layer, address: &Pubkey) -> usize {
        self.state()
            .subscribers
            .get(&(layer, *address))
            .map(|senders| senders.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or_default()
    }

    fn notify(state: &mut LedgerState, changed: &[(Layer, Pubkey)]) {
        state.slot += 1;
        let slot = state.slot;
        for (layer, address) in changed {
            let account = state
                .ledger
                .accounts
                .get(&(*layer, *address))
                .cloned()
                .unwrap_or_default();
            if let Some(senders) = state.subscribers.get_mut(&(*layer, *address)) {
                senders.retain(|sender| {
                    sender
                        .send(AccountUpdate {
                            layer: *layer,
                            address: *address,
                            slot,
                            account: account.clone(),
                        })
                        .is_ok()
                });
            }
        }
    }

    fn take_fault(state: &mut LedgerState, layer: Layer, transaction: &Transaction) -> Option<Fault> {
        let data = transaction.message.instructions.first()?.data.get(..8)?;
        let key = state
            .faults
            .keys()
            .find(|(l, name)| *l == layer && instruction_discriminator(name) == data)
            .copied()?;
        state.faults.remove(&key)
    }

    fn failing_read(&self, layer: Layer) -> Result<(), RpcError> {
        let mut state = self.state();
        if let Some((passing, remaining)) = state.failing_reads.get_mut(&layer) {
            if *passing > 0 {
                *passing -= 1;
            } else if *remaining > 0 {
                *remaining -= 1;
                return Err(RpcError::from(ClientError::from(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    format!("{} endpoint reset the connection", layer),
                ))));
            }
        }
        Ok(())
    }

    fn submit(
        &self,
        layer: Layer,
        transaction: &Transaction,
        skip_preflight: bool,
    ) -> Result<Signature, RpcError> {
        transaction.verify().map_err(RpcError::from)?;
        let signature = transaction
            .signatures
            .first()
            .copied()
            .ok_or(RpcError::from(TransactionError::MissingSignatureForFee))?;
        let payer = transaction
            .message
            .account_keys
            .first()
            .copied()
            .unwrap_or_default();

        let mut state = self.state();
        match Self::take_fault(&mut state, layer, transaction) {
            Some(Fault::RejectSubmit(error)) => return Err(RpcError::from(error)),
            Some(Fault::Drop) => {
                debug!("Dropping {} on {}", signature, layer);
                state.submitted.push((layer, signature, payer));
                return Ok(signature);
            }
            Some(Fault::WithholdConfirmation) => {
                state.withheld.insert(signature);
            }
            None => {}
        }

        state.submitted.push((layer, signature, payer));
        let result = state.ledger.process(layer, transaction, &self.program_id);
        match result {
            Ok(changed) => {
                state.statuses.insert(signature, (layer, Ok(())));
                Self::notify(&mut state, &changed);
                Ok(signature)
            }
            Err(error) if skip_preflight => {
                state.statuses.insert(signature, (layer, Err(error)));
                Ok(signature)
            }
            Err(error) => Err(RpcError::from(error)),
        }
    }
}

/// A [`DualLedger`] viewed through one layer.
#[derive(Clone)]
pub struct LedgerEndpoint {
    layer: Layer,
    ledger: DualLedger,
}

impl Debug for LedgerEndpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "LedgerEndpoint {{ layer: {} }}", self.layer)
    }
}

impl LedgerEndpoint {
    pub fn layer(&self) -> Layer {
        self.layer
    }
}

#[async_trait]
impl LayerRpc for LedgerEndpoint {
    fn url(&self) -> String {
        format!("memory://{}", self.layer)
    }

    async fn health(&self) -> Result<(), RpcError> {
        Ok(())
    }

    async fn get_account(&self, address: &Pubkey) -> Result<Option<Account>, RpcError> {
        self.ledger.failing_read(self.layer)?;
        Ok(self.ledger.account(self.layer, address))
    }

    async fn get_latest_blockhash(&self) -> Result<Hash, RpcError> {
        Ok(Hash::new_unique())
    }

    async fn send_transaction(
        &self,
        transaction: &Transaction,
        skip_preflight: bool,
    ) -> Result<Signature, RpcError> {
        self.ledger.submit(self.layer, transaction, skip_preflight)
    }

    async fn get_signature_status(
        &self,
        signature: &Signature,
        _commitment: CommitmentConfig,
    ) -> Result<Option<Result<(), TransactionError>>, RpcError> {
        let state = self.ledger.state();
        if state.withheld.contains(signature) {
            return Ok(None);
        }
        Ok(state
            .statuses
            .get(signature)
            .filter(|(layer, _)| *layer == self.layer)
            .map(|(_, result)| result.clone()))
    }

    async fn subscribe_account(
        &self,
        layer: Layer,
        address: Pubkey,
        handler: Arc<dyn AccountUpdateHandler>,
        ready: oneshot::Sender<()>,
        mut shutdown: oneshot::Receiver<()>,
    ) -> Result<(), RpcError> {
        let (sender, mut updates) = mpsc::unbounded_channel();
        self.ledger
            .state()
            .subscribers
            .entry((self.layer, address))
            .or_default()
            .push(sender);
        let _ = ready.send(());

        loop {
            tokio::select! {
                _ = &mut shutdown => return Ok(()),
                update = updates.recv() => match update {
                    Some(mut update) => {
                        update.layer = layer;
                        handler.handle_update(update).await;
                    }
                    None => {
                        return Err(RpcError::PubsubError(format!(
                            "{} subscription for {} closed",
                            layer, address
                        )))
                    }
                },
            }
        }
    }
}
