use solana_sdk::{account::Account, transaction::TransactionError};
use sync_test::assert_tally;
use typing_sync_client::{
    constants::TYPING_PROGRAM_ID,
    instructions::{BuildError, RemoteCall},
    signer::SignerChoice,
    DelegationStatus, ErrorKind, Layer, PipelineError, SyncError,
};
use typing_sync_test_utils::{wait_until, Fault, TestEnv};

use DelegationStatus::*;

#[tokio::test]
async fn dropped_delegate_never_reports_delegated() {
    let env = TestEnv::initialized().await;
    env.ledger.inject_fault(Layer::Base, "delegate", Fault::Drop);

    let err = env.client.delegate().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfirmationTimeout);
    assert!(matches!(
        err,
        SyncError::Pipeline(PipelineError::ConfirmTimeout {
            call: RemoteCall::Delegate,
            ..
        })
    ));
    assert_eq!(env.client.status(), Unknown);
    let last_error = env.client.last_error().unwrap();
    assert_eq!(last_error.action, "delegate");
    assert_eq!(last_error.kind, ErrorKind::ConfirmationTimeout);

    assert_eq!(env.client.refresh_status().await.unwrap(), Undelegated);
    env.client.delegate().await.unwrap();
    assert_eq!(env.client.status(), Delegated);
}

#[tokio::test]
async fn unconfirmed_delegate_resolves_by_probe() {
    let env = TestEnv::initialized().await;
    let session = env.addresses().session;
    env.ledger
        .inject_fault(Layer::Base, "delegate", Fault::WithholdConfirmation);

    let err = env.client.delegate().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfirmationTimeout);
    assert_ne!(env.client.status(), Delegated);

    assert_eq!(env.client.refresh_status().await.unwrap(), Delegated);
    wait_until("rollup subscription", || {
        env.ledger.subscriber_count(Layer::Rollup, &session) == 1
    })
    .await;
    env.client.record_word(true).await.unwrap();
    assert_tally(&env.client.session().unwrap(), 1, 1, 0);
}

#[tokio::test]
async fn rejected_delegate_stays_undelegated() {
    let env = TestEnv::initialized().await;
    env.ledger.inject_fault(
        Layer::Base,
        "delegate",
        Fault::RejectSubmit(TransactionError::AccountInUse),
    );

    let err = env.client.delegate().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Rejected);
    assert_eq!(env.client.status(), Undelegated);
    assert_eq!(
        env.ledger
            .account(Layer::Base, &env.addresses().session)
            .unwrap()
            .owner,
        TYPING_PROGRAM_ID
    );
    assert_eq!(env.client.session_views().unwrap().rollup, None);
}

#[tokio::test]
async fn failed_commit_keeps_delegation() {
    let env = TestEnv::delegated().await;
    env.ledger.inject_fault(
        Layer::Rollup,
        "commit",
        Fault::RejectSubmit(TransactionError::AccountInUse),
    );

    assert!(env.client.commit().await.is_err());
    assert_eq!(env.client.status(), Delegated);
    env.client.record_word(true).await.unwrap();
}

#[tokio::test]
async fn failed_undelegate_reprobes_ownership() {
    let env = TestEnv::delegated().await;
    env.ledger.inject_fault(
        Layer::Rollup,
        "undelegate",
        Fault::RejectSubmit(TransactionError::AccountInUse),
    );

    let err = env.client.undelegate().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Rejected);
    assert_eq!(env.client.status(), Delegated);
    assert!(env.client.session_views().unwrap().rollup.is_some());

    env.client.undelegate().await.unwrap();
    assert_eq!(env.client.status(), Undelegated);
}

#[tokio::test]
async fn rollup_write_after_silent_return_requires_base() {
    let env = TestEnv::delegated().await;
    let session = env.addresses().session;
    env.client.record_word(true).await.unwrap();

    env.ledger.revert_delegation(&session);
    let err = env.client.record_word(true).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authorization);
    match err {
        SyncError::Authorization {
            call,
            required_layer,
            required_signer,
            ..
        } => {
            assert_eq!(call, RemoteCall::RecordWord { is_correct: true });
            assert_eq!(required_layer, Layer::Base);
            assert_eq!(required_signer, SignerChoice::Wallet);
        }
        other => panic!("expected an authorization error, got {:?}", other),
    }
    assert_eq!(env.client.status(), Undelegated);
    assert_eq!(env.client.session_views().unwrap().rollup, None);

    let receipt = env.client.record_word(true).await.unwrap();
    assert_eq!(receipt.layer, Layer::Base);
    assert_tally(&env.ledger.session(Layer::Base, &session).unwrap(), 2, 2, 0);
}

#[tokio::test]
async fn transient_reads_retry_then_surface() {
    let env = TestEnv::initialized().await;

    env.ledger.fail_reads(Layer::Base, 2);
    assert_eq!(env.client.refresh_status().await.unwrap(), Undelegated);

    env.ledger.fail_reads(Layer::Base, 10);
    let err = env.client.refresh_status().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Network);
    assert_eq!(env.client.last_error().unwrap().kind, ErrorKind::Network);

    env.ledger.fail_reads(Layer::Base, 0);
    assert_eq!(env.client.refresh_status().await.unwrap(), Undelegated);
    assert_eq!(env.client.last_error(), None);
}

#[tokio::test]
async fn confirmed_commit_survives_failed_base_reread() {
    let env = TestEnv::delegated().await;
    let addresses = env.addresses();
    env.client.record_word(true).await.unwrap();

    env.ledger.fail_reads(Layer::Base, 100);
    let receipt = env.client.commit().await.unwrap();
    assert_eq!(receipt.call, RemoteCall::Commit);
    assert_eq!(env.client.status(), Delegated);
    assert_eq!(env.client.last_error(), None);
    assert_eq!(
        env.ledger.session(Layer::Base, &addresses.session),
        env.ledger.session(Layer::Rollup, &addresses.session)
    );
    env.ledger.fail_reads(Layer::Base, 0);
}

#[tokio::test]
async fn confirmed_undelegate_survives_failed_base_reread() {
    let env = TestEnv::delegated().await;
    let addresses = env.addresses();
    env.client.record_word(true).await.unwrap();

    // Ownership confirmation and the passive check on the pushed base
    // update still read; the re-read after them fails.
    env.ledger.fail_reads_after(Layer::Base, 2, 100);
    let receipt = env.client.undelegate().await.unwrap();
    assert_eq!(receipt.call, RemoteCall::Undelegate);
    assert_eq!(env.client.status(), Undelegated);
    assert_eq!(env.client.last_error(), None);
    assert_eq!(
        env.ledger.account(Layer::Base, &addresses.session).unwrap().owner,
        TYPING_PROGRAM_ID
    );
    assert_tally(&env.ledger.session(Layer::Base, &addresses.session).unwrap(), 1, 1, 0);
    env.ledger.fail_reads(Layer::Base, 0);

    // Retrying is refused: the session is already back on the base layer.
    assert!(matches!(
        env.client.undelegate().await,
        Err(SyncError::InvalidState {
            call: RemoteCall::Undelegate,
            status: Undelegated
        })
    ));
}

#[tokio::test]
async fn undecodable_push_is_dropped_but_read_through_fails() {
    let env = TestEnv::initialized().await;
    let addresses = env.addresses();
    let record = env.client.record();
    assert!(record.is_some());

    let garbage = Account {
        lamports: 1_000_000,
        data: vec![7; 16],
        owner: env.client.config().program_id,
        ..Account::default()
    };
    env.ledger
        .set_account(Layer::Base, addresses.record, garbage);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(env.client.record(), record);

    let err = env.client.resync().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Decode);
    assert!(matches!(err, SyncError::Decode { address, .. } if address == addresses.record));
}

#[tokio::test]
async fn second_write_refused_while_first_in_flight() {
    let env = TestEnv::delegated().await;
    let session = env.addresses().session;
    env.ledger
        .inject_fault(Layer::Rollup, "type_word", Fault::WithholdConfirmation);

    let first = env.client.record_word(true);
    let second = async {
        wait_until("first write in flight", || env.client.is_write_in_flight()).await;
        let result = env.client.record_word(true).await;
        env.ledger.release_withheld();
        result
    };
    let (first, second) = tokio::join!(first, second);

    first.unwrap();
    assert!(matches!(
        second,
        Err(SyncError::Pipeline(PipelineError::WriteInFlight { address, .. })) if address == session
    ));
    assert!(!env.client.is_write_in_flight());
    assert_tally(&env.ledger.session(Layer::Rollup, &session).unwrap(), 1, 1, 0);
}

#[tokio::test]
async fn preconditions_checked_before_submission() {
    let env = TestEnv::initialized().await;

    let submitted = env.ledger.submitted(Layer::Base).len();
    let err = env.client.save_to_record().await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Pipeline(PipelineError::BuildFailed(BuildError::Precondition { .. }))
    ));

    env.client.end_session().await.unwrap();
    let err = env.client.end_session().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Rejected);
    let err = env.client.record_word(true).await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Pipeline(PipelineError::BuildFailed(BuildError::Precondition {
            call: RemoteCall::RecordWord { .. },
            ..
        }))
    ));
    // Only the one successful end_session reached the ledger.
    assert_eq!(env.ledger.submitted(Layer::Base).len(), submitted + 1);
}

#[tokio::test]
async fn last_error_kept_until_cleared_or_superseded() {
    let env = TestEnv::initialized().await;
    env.client.end_session().await.unwrap();
    assert_eq!(env.client.last_error(), None);

    env.client.record_word(true).await.unwrap_err();
    let last_error = env.client.last_error().unwrap();
    assert_eq!(last_error.action, "record_word");
    assert_eq!(last_error.kind, ErrorKind::Rejected);
    assert!(!last_error.message.is_empty());

    let _ = env.client.session();
    assert_eq!(env.client.last_error(), Some(last_error));
    env.client.clear_error();
    assert_eq!(env.client.last_error(), None);

    env.client.record_word(false).await.unwrap_err();
    assert!(env.client.last_error().is_some());
    env.client.initialize_session().await.unwrap();
    assert_eq!(env.client.last_error(), None);
}

#[tokio::test]
async fn actions_require_tracking() {
    let env = TestEnv::initialized().await;
    env.client.stop();

    assert!(matches!(
        env.client.record_word(true).await,
        Err(SyncError::NotTracking)
    ));
    assert_eq!(env.client.session(), None);
    assert_eq!(env.client.status(), Unknown);
}
