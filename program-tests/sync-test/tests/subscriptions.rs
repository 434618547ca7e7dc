use std::sync::Arc;

use solana_sdk::signature::Signer;
use sync_test::assert_tally;
use typing_sync_client::{
    accounts::TypingSession,
    signer::{InMemorySessionKeys, SignerChoice},
    store::StoreEvent,
    DelegationStatus, Layer, PipelineError, SyncError, TypingSyncClient,
};
use typing_sync_test_utils::{program::session_account, wait_until, TestEnv};

#[tokio::test]
async fn base_pushes_reach_the_store() {
    let env = TestEnv::initialized().await;
    let addresses = env.addresses();
    wait_until("base subscriptions", || {
        env.ledger.subscriber_count(Layer::Base, &addresses.session) == 1
            && env.ledger.subscriber_count(Layer::Base, &addresses.record) == 1
    })
    .await;

    let mut session = env.client.session().unwrap();
    session.words_typed = 7;
    session.correct_words = 7;
    env.ledger.set_account(
        Layer::Base,
        addresses.session,
        session_account(&session, env.client.config().program_id),
    );
    wait_until("pushed session", || {
        env.client.session().is_some_and(|s| s.words_typed == 7)
    })
    .await;
    assert_eq!(env.client.status(), DelegationStatus::Undelegated);
}

#[tokio::test]
async fn mutation_right_after_start_is_not_lost() {
    let env = TestEnv::new().await;
    let addresses = env.addresses();
    assert_eq!(env.client.session(), None);
    // Listening by the time start returns.
    assert_eq!(env.ledger.subscriber_count(Layer::Base, &addresses.session), 1);
    assert_eq!(env.ledger.subscriber_count(Layer::Base, &addresses.record), 1);

    let session = TypingSession {
        player: env.wallet.pubkey(),
        words_typed: 3,
        correct_words: 2,
        errors: 1,
        wpm: 0,
        accuracy: 66,
        is_active: true,
        started_at: env.ledger.unix_timestamp(),
        ended_at: None,
    };
    env.ledger.set_account(
        Layer::Base,
        addresses.session,
        session_account(&session, env.client.config().program_id),
    );
    wait_until("session created after start", || {
        env.client.session().as_ref() == Some(&session)
    })
    .await;
    assert_eq!(env.client.status(), DelegationStatus::Undelegated);
}

#[tokio::test]
async fn rollup_pushes_tracked_only_while_delegated() {
    let env = TestEnv::delegated().await;
    let addresses = env.addresses();
    wait_until("rollup subscription", || {
        env.ledger.subscriber_count(Layer::Rollup, &addresses.session) == 1
    })
    .await;

    let mut session = env.client.session().unwrap();
    session.words_typed = 5;
    session.errors = 5;
    env.ledger.set_account(
        Layer::Rollup,
        addresses.session,
        session_account(&session, env.client.config().program_id),
    );
    wait_until("pushed rollup session", || {
        env.client.session().is_some_and(|s| s.errors == 5)
    })
    .await;
    let views = env.client.session_views().unwrap();
    assert_ne!(views.base, views.rollup);
}

#[tokio::test]
async fn subscriptions_follow_delegation_lifecycle() {
    let env = TestEnv::initialized().await;
    let session = env.addresses().session;
    let rollup_subscribers = || env.ledger.subscriber_count(Layer::Rollup, &session);
    assert_eq!(rollup_subscribers(), 0);

    env.client.delegate().await.unwrap();
    wait_until("subscribed after delegate", || rollup_subscribers() == 1).await;
    env.client.commit().await.unwrap();
    wait_until("subscribed after commit", || rollup_subscribers() == 1).await;
    env.client.undelegate().await.unwrap();
    wait_until("unsubscribed after undelegate", || rollup_subscribers() == 0).await;
    assert_eq!(env.ledger.subscriber_count(Layer::Base, &session), 1);

    env.client.stop();
    wait_until("base unsubscribed after stop", || {
        env.ledger.subscriber_count(Layer::Base, &session) == 0
    })
    .await;
}

#[tokio::test]
async fn tracking_another_player_is_read_only() {
    let player = TestEnv::delegated().await;
    player.client.record_word(true).await.unwrap();

    let observer_client = TypingSyncClient::new(
        player.client.config().clone(),
        player.ledger.connection_manager(),
        Arc::new(InMemorySessionKeys::new()),
    );
    let status = observer_client.track(player.wallet.pubkey()).await.unwrap();
    assert_eq!(status, DelegationStatus::Delegated);
    assert_tally(&observer_client.session().unwrap(), 1, 1, 0);
    let err = observer_client.record_word(true).await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Pipeline(PipelineError::NotConnected { .. })
    ));
    assert_tally(&player.client.session().unwrap(), 1, 1, 0);
}

#[tokio::test]
async fn account_events_emitted_for_reads() {
    let env = TestEnv::initialized().await;
    let addresses = env.addresses();
    let mut events = env.client.events();

    env.client.record_word(true).await.unwrap();
    let mut saw_session = false;
    while let Ok(event) = events.try_recv() {
        match event {
            StoreEvent::AccountChanged {
                address,
                layer: Layer::Base,
                present: true,
            } => saw_session |= address == addresses.session,
            StoreEvent::AccountChanged { .. } => {}
            StoreEvent::StatusChanged { from, to, .. } => {
                panic!("unexpected status change {} -> {}", from, to)
            }
        }
    }
    assert!(saw_session);
}

#[tokio::test]
async fn session_key_signs_rollup_words_only() {
    let env = TestEnv::delegated().await;
    let signer = env.install_session_key(3600);

    let receipt = env.client.record_word(true).await.unwrap();
    assert_eq!(receipt.signer, SignerChoice::SessionCredential);
    assert_eq!(receipt.signer_pubkey, signer);
    assert_eq!(
        env.ledger.submitted(Layer::Rollup).last().map(|(_, payer)| *payer),
        Some(signer)
    );

    let receipt = env.client.commit().await.unwrap();
    assert_eq!(receipt.signer, SignerChoice::Wallet);
    assert_eq!(receipt.signer_pubkey, env.wallet.pubkey());
}

#[tokio::test]
async fn base_words_signed_by_wallet() {
    let env = TestEnv::initialized().await;
    env.install_session_key(3600);

    let receipt = env.client.record_word(true).await.unwrap();
    assert_eq!(receipt.layer, Layer::Base);
    assert_eq!(receipt.signer, SignerChoice::Wallet);
}

#[tokio::test]
async fn expired_session_key_falls_back_to_wallet() {
    let env = TestEnv::delegated().await;
    env.install_session_key(-10);

    let receipt = env.client.record_word(false).await.unwrap();
    assert_eq!(receipt.signer, SignerChoice::Wallet);
    assert_tally(&env.client.session().unwrap(), 1, 0, 1);
}
