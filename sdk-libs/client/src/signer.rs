use std::{
    fmt::{Debug, Display, Formatter},
    sync::{Arc, RwLock},
    time::{SystemTime, UNIX_EPOCH},
};

use solana_sdk::{
    pubkey::Pubkey,
    signature::{Keypair, Signer},
};
use thiserror::Error;
use tracing::{debug, info};

use crate::{instructions::SignerPolicy, rpc::Layer};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignerError {
    #[error("No wallet connected")]
    NotConnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignerChoice {
    Wallet,
    SessionCredential,
}

impl Display for SignerChoice {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SignerChoice::Wallet => write!(f, "wallet"),
            SignerChoice::SessionCredential => write!(f, "session credential"),
        }
    }
}

/// Time-boxed signing capability issued out of band.
pub struct SessionCredential {
    pub signer: Arc<Keypair>,
    /// On-ledger token account that authorizes `signer` for the owner.
    pub token: Pubkey,
    /// Unix timestamp after which the token is rejected.
    pub valid_until: i64,
}

impl Debug for SessionCredential {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SessionCredential {{ signer: {}, token: {}, valid_until: {} }}",
            self.signer.pubkey(),
            self.token,
            self.valid_until
        )
    }
}

impl SessionCredential {
    pub fn new(signer: Keypair, token: Pubkey, valid_until: i64) -> Self {
        Self {
            signer: Arc::new(signer),
            token,
            valid_until,
        }
    }

    pub fn is_valid_at(&self, now: i64) -> bool {
        now < self.valid_until
    }
}

/// Source of the optional session credential.
pub trait SessionKeyProvider: Send + Sync + Debug {
    /// The credential, if one is installed and still valid at `now`.
    fn active(&self, now: i64) -> Option<Arc<SessionCredential>>;

    fn install(&self, credential: SessionCredential);

    fn revoke(&self) -> Option<Arc<SessionCredential>>;
}

#[derive(Debug, Default)]
pub struct InMemorySessionKeys {
    credential: RwLock<Option<Arc<SessionCredential>>>,
}

impl InMemorySessionKeys {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionKeyProvider for InMemorySessionKeys {
    fn active(&self, now: i64) -> Option<Arc<SessionCredential>> {
        let guard = self.credential.read().unwrap_or_else(|e| e.into_inner());
        guard
            .as_ref()
            .filter(|credential| credential.is_valid_at(now))
            .cloned()
    }

    fn install(&self, credential: SessionCredential) {
        info!("Installed {:?}", credential);
        let mut guard = self.credential.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(Arc::new(credential));
    }

    fn revoke(&self) -> Option<Arc<SessionCredential>> {
        let mut guard = self.credential.write().unwrap_or_else(|e| e.into_inner());
        guard.take()
    }
}

pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// The credential chosen for one call.
#[derive(Clone)]
pub struct ResolvedSigner {
    pub choice: SignerChoice,
    pub keypair: Arc<Keypair>,
    pub session_token: Option<Pubkey>,
}

impl ResolvedSigner {
    pub fn pubkey(&self) -> Pubkey {
        self.keypair.pubkey()
    }
}

impl Debug for ResolvedSigner {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ResolvedSigner {{ choice: {}, signer: {}, session_token: {:?} }}",
            self.choice,
            self.keypair.pubkey(),
            self.session_token
        )
    }
}

/// Picks the credential for a call. Base-layer calls and wallet-only calls
/// always use the wallet; rollup calls prefer a valid session credential.
pub struct SignerRouter {
    wallet: RwLock<Option<Arc<Keypair>>>,
    session_keys: Arc<dyn SessionKeyProvider>,
    clock: fn() -> i64,
}

impl Debug for SignerRouter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SignerRouter {{ wallet: {:?}, session_keys: {:?} }}",
            self.wallet_pubkey(),
            self.session_keys
        )
    }
}

impl SignerRouter {
    pub fn new(session_keys: Arc<dyn SessionKeyProvider>) -> Self {
        Self {
            wallet: RwLock::new(None),
            session_keys,
            clock: unix_timestamp,
        }
    }

    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    pub fn connect_wallet(&self, wallet: Arc<Keypair>) {
        info!("Wallet {} connected", wallet.pubkey());
        let mut guard = self.wallet.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(wallet);
    }

    pub fn disconnect_wallet(&self) {
        let mut guard = self.wallet.write().unwrap_or_else(|e| e.into_inner());
        *guard = None;
    }

    pub fn wallet_pubkey(&self) -> Option<Pubkey> {
        self.wallet().map(|wallet| wallet.pubkey())
    }

    pub fn session_keys(&self) -> &Arc<dyn SessionKeyProvider> {
        &self.session_keys
    }

    fn wallet(&self) -> Option<Arc<Keypair>> {
        self.wallet
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn resolve(&self, layer: Layer, policy: SignerPolicy) -> Result<ResolvedSigner, SignerError> {
        let wallet = self.wallet().ok_or(SignerError::NotConnected)?;

        let session = match (layer, policy) {
            (Layer::Rollup, SignerPolicy::WalletOrSession) => {
                self.session_keys.active((self.clock)())
            }
            _ => None,
        };

        let resolved = match session {
            Some(credential) => ResolvedSigner {
                choice: SignerChoice::SessionCredential,
                keypair: credential.signer.clone(),
                session_token: Some(credential.token),
            },
            None => ResolvedSigner {
                choice: SignerChoice::Wallet,
                keypair: wallet,
                session_token: None,
            },
        };
        debug!(
            "Resolved {} signer {} for {} layer ({:?})",
            resolved.choice,
            resolved.pubkey(),
            layer,
            policy
        );
        Ok(resolved)
    }
}
