use std::{sync::Arc, time::Duration};

use solana_sdk::{
    pubkey::Pubkey,
    signature::{Keypair, Signer},
};
use typing_sync_client::{
    address::TrackedAddresses,
    rpc::{ReconnectConfig, RetryConfig},
    signer::{InMemorySessionKeys, SessionCredential, SessionKeyProvider},
    SyncConfig, TypingSyncClient,
};

use crate::dual_ledger::{DualLedger, LedgerEndpoint};

/// Short timeouts so failure paths resolve quickly against the in-memory ledger.
pub fn test_sync_config() -> SyncConfig {
    SyncConfig {
        confirm_timeout: Duration::from_millis(200),
        confirm_poll_interval: Duration::from_millis(5),
        propagation_delay: Duration::from_millis(10),
        confirm_probe_attempts: 3,
        retry: RetryConfig {
            max_retries: 3,
            retry_delay: Duration::from_millis(5),
            timeout: Duration::from_secs(1),
        },
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
        },
        ..SyncConfig::default()
    }
}

pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

/// Polls `condition` until it holds, panicking after two seconds.
pub async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub struct TestEnv {
    pub ledger: DualLedger,
    pub client: TypingSyncClient<LedgerEndpoint>,
    pub wallet: Arc<Keypair>,
    pub session_keys: Arc<InMemorySessionKeys>,
}

impl TestEnv {
    /// Connected wallet, tracking started, no accounts on either layer.
    pub async fn new() -> Self {
        Self::with_config(test_sync_config()).await
    }

    pub async fn with_config(config: SyncConfig) -> Self {
        init_test_logging();
        let ledger = DualLedger::with_program_id(config.program_id);
        let session_keys = Arc::new(InMemorySessionKeys::new());
        let client =
            TypingSyncClient::new(config, ledger.connection_manager(), session_keys.clone());
        let wallet = Arc::new(Keypair::new());
        client.connect_wallet(wallet.clone());
        client.start().await.unwrap();
        Self {
            ledger,
            client,
            wallet,
            session_keys,
        }
    }

    /// Session and record initialized on the base layer.
    pub async fn initialized() -> Self {
        let env = Self::new().await;
        env.client.initialize_session().await.unwrap();
        env.client.initialize_record().await.unwrap();
        env
    }

    /// Initialized and delegated to the rollup.
    pub async fn delegated() -> Self {
        let env = Self::initialized().await;
        env.client.delegate().await.unwrap();
        env
    }

    pub fn addresses(&self) -> TrackedAddresses {
        self.client.addresses().unwrap()
    }

    /// Issues a session credential valid for `valid_for` seconds and returns
    /// its signer.
    pub fn install_session_key(&self, valid_for: i64) -> Pubkey {
        let signer = Keypair::new();
        let signer_pubkey = signer.pubkey();
        let valid_until = self.ledger.unix_timestamp() + valid_for;
        let token =
            self.ledger
                .register_session_token(self.wallet.pubkey(), signer_pubkey, valid_until);
        self.session_keys
            .install(SessionCredential::new(signer, token, valid_until));
        signer_pubkey
    }
}
