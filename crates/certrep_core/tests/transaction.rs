//! Transaction lifecycle tests against the mock provider.

use certrep_core::{
    ClientError, ClientMode, ClientState, Key, KeyType, MemoryStorage, MockProvider,
    ProviderError, ReplError, Seqno, ServerConfig, ServerState, TransactionId, TransactionState,
};
use proptest::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct Fixture {
    server: Arc<ServerState>,
    provider: Arc<MockProvider>,
    storage: Arc<MemoryStorage>,
    client: Arc<ClientState>,
}

fn fixture(mode: ClientMode) -> Fixture {
    fixture_with(ServerConfig::new().name("test"), mode)
}

fn fixture_with(config: ServerConfig, mode: ClientMode) -> Fixture {
    let provider = Arc::new(MockProvider::new());
    let server = ServerState::new(config, provider.clone());
    let storage = Arc::new(MemoryStorage::new());
    let client = server.open_client(mode, storage.clone()).unwrap();
    Fixture {
        server,
        provider,
        storage,
        client,
    }
}

fn row_key(row: &str) -> Key {
    Key::new(KeyType::Exclusive).with_part("t1").with_part(row.to_string())
}

fn assert_history_legal(client: &ClientState) {
    let trx = client.transaction();
    let mut states = trx.history().to_vec();
    states.push(trx.state());
    for pair in states.windows(2) {
        assert!(
            pair[0].can_transition_to(pair[1]),
            "{} -> {} in {:?}",
            pair[0],
            pair[1],
            states
        );
    }
}

#[test]
fn replicated_commit_releases_once() {
    let f = fixture(ClientMode::Replicating);
    let client = &f.client;

    client.before_command().unwrap();
    client.before_statement().unwrap();
    client.start_transaction(TransactionId::new(7)).unwrap();
    client.append_key(&row_key("1")).unwrap();
    client.append_data(b"value").unwrap();

    f.provider.set_next_seqno(Seqno::new(42));
    client.before_commit().unwrap();
    assert_eq!(client.transaction_state(), TransactionState::Committing);
    assert_eq!(client.transaction().seqno(), Seqno::new(42));
    assert!(client.transaction().ordered());
    assert!(client.transaction().certified());

    client.ordered_commit().unwrap();
    client.after_commit().unwrap();
    assert_eq!(client.transaction_state(), TransactionState::Committed);
    assert_eq!(f.provider.release_count(TransactionId::new(7)), 1);
    assert_eq!(f.server.stats().commits, 1);
    assert_history_legal(client);

    client.after_statement().unwrap();
    assert!(!client.transaction().active());
    assert_eq!(f.provider.release_count(TransactionId::new(7)), 1);
    assert_eq!(client.last_written_gtid().seqno, Seqno::new(42));
    assert_eq!(f.provider.keys(TransactionId::new(7)).len(), 1);
    assert_eq!(f.provider.data(TransactionId::new(7)), b"value");
}

#[test]
fn certification_failure_aborts_without_replay() {
    let f = fixture(ClientMode::Replicating);
    let client = &f.client;

    client.before_command().unwrap();
    client.start_transaction(TransactionId::new(8)).unwrap();
    client.append_key(&row_key("1")).unwrap();

    f.provider
        .set_certify_result(Some(ProviderError::CertificationFailed));
    let err = client.before_commit().unwrap_err();
    assert!(err.is_deadlock());
    assert_eq!(client.transaction_state(), TransactionState::CertFailed);
    assert!(!client.transaction().ordered());

    client.rollback().unwrap();
    assert_eq!(client.transaction_state(), TransactionState::Aborted);
    assert_history_legal(client);

    let err = client.after_statement().unwrap_err();
    assert!(err.is_deadlock());

    let stats = f.server.stats();
    assert_eq!(stats.rollbacks, 1);
    assert_eq!(stats.cert_failures, 1);
    assert_eq!(stats.replays, 0);
    assert_eq!(f.provider.replay_count(), 0);
    assert_eq!(f.provider.release_count(TransactionId::new(8)), 1);
    assert_eq!(f.storage.rollbacks(), 1);
}

#[test]
fn bf_abort_before_commit_order_replays() {
    let f = fixture(ClientMode::Replicating);
    let client = &f.client;

    let fired = Arc::new(AtomicBool::new(false));
    let accepted = Arc::new(AtomicBool::new(false));
    let victim = Arc::downgrade(client);
    {
        let fired = Arc::clone(&fired);
        let accepted = Arc::clone(&accepted);
        f.provider
            .set_before_commit_order_enter_hook(Some(Arc::new(move || {
                if fired.swap(true, Ordering::SeqCst) {
                    return;
                }
                if let Some(victim) = victim.upgrade() {
                    accepted.store(victim.bf_abort(Seqno::new(5)), Ordering::SeqCst);
                }
            })));
    }

    client.before_command().unwrap();
    client.start_transaction(TransactionId::new(9)).unwrap();
    client.append_key(&row_key("1")).unwrap();
    f.storage.stage(b"payload");
    f.provider.set_next_seqno(Seqno::new(10));

    let err = client.commit().unwrap_err();
    assert!(err.is_deadlock());
    assert!(accepted.load(Ordering::SeqCst));
    assert_eq!(client.transaction_state(), TransactionState::MustReplay);
    assert_eq!(
        client.transaction().bf_abort_state(),
        TransactionState::Committing
    );

    client.after_statement().unwrap();
    assert_eq!(client.transaction_state(), TransactionState::Committed);
    assert!(!client.transaction().active());
    assert_eq!(client.current_error(), ClientError::Success);

    assert_eq!(f.provider.replay_count(), 1);
    assert_eq!(f.server.stats().replays, 1);
    assert_eq!(f.server.stats().bf_aborts, 1);
    assert_eq!(f.provider.release_count(TransactionId::new(9)), 1);
    assert_eq!(f.storage.applied(), vec![b"payload".to_vec()]);
    assert_eq!(client.mode(), ClientMode::Replicating);
}

#[test]
fn bf_abort_during_certification_replays() {
    let f = fixture(ClientMode::Replicating);
    let client = &f.client;
    let victim = Arc::downgrade(client);
    f.provider.set_after_certify_hook(Some(Arc::new(move || {
        if let Some(victim) = victim.upgrade() {
            assert!(victim.bf_abort(Seqno::new(1)));
        }
    })));

    client.before_command().unwrap();
    client.start_transaction(TransactionId::new(11)).unwrap();
    client.append_key(&row_key("2")).unwrap();
    f.provider.set_next_seqno(Seqno::new(20));

    let err = client.before_commit().unwrap_err();
    f.provider.set_after_certify_hook(None);
    assert!(err.is_deadlock());
    assert_eq!(client.transaction_state(), TransactionState::MustReplay);
    assert!(client.transaction().certified());

    client.rollback().unwrap();
    client.after_statement().unwrap();
    assert_eq!(client.transaction_state(), TransactionState::Committed);
    assert_eq!(f.provider.release_count(TransactionId::new(11)), 1);
    assert_eq!(f.server.stats().replays, 1);
}

#[test]
fn bf_abort_boundary_on_seqno() {
    let f = fixture(ClientMode::Replicating);
    let client = &f.client;

    client.before_command().unwrap();
    client.start_transaction(TransactionId::new(12)).unwrap();
    f.provider.set_next_seqno(Seqno::new(3));
    client.before_commit().unwrap();
    assert_eq!(client.transaction().seqno(), Seqno::new(3));

    // Victim at 3 is ordered before an aborter at 9.
    assert!(!client.bf_abort(Seqno::new(9)));
    assert!(!client.bf_abort(Seqno::new(4)));
    assert_eq!(client.transaction_state(), TransactionState::Committing);

    // Equal seqno is not "earlier".
    assert!(client.bf_abort(Seqno::new(3)));
    assert_eq!(client.transaction_state(), TransactionState::MustAbort);

    client.rollback().unwrap();
    assert_eq!(client.transaction_state(), TransactionState::MustReplay);
    client.after_statement().unwrap();
    assert_eq!(f.provider.release_count(TransactionId::new(12)), 1);
}

#[test]
fn bf_abort_accepts_later_victim() {
    let f = fixture(ClientMode::Replicating);
    let client = &f.client;

    client.before_command().unwrap();
    client.start_transaction(TransactionId::new(13)).unwrap();
    f.provider.set_next_seqno(Seqno::new(9));
    client.before_commit().unwrap();

    assert!(client.bf_abort(Seqno::new(3)));
    assert_eq!(client.transaction_state(), TransactionState::MustAbort);
    assert_eq!(f.server.stats().bf_aborts, 1);

    // Already aborted: a second abort is a no-op.
    assert!(!client.bf_abort(Seqno::new(3)));
    assert_eq!(f.server.stats().bf_aborts, 1);
}

#[test]
fn bf_abort_ignores_inactive_and_applier_connections() {
    let f = fixture(ClientMode::Replicating);
    assert!(!f.client.bf_abort(Seqno::new(1)));

    let applier = f
        .server
        .open_client(ClientMode::Applier, f.storage.clone())
        .unwrap();
    assert!(!applier.bf_abort(Seqno::new(1)));
}

#[test]
fn executing_transaction_bf_aborted_mid_statement() {
    let f = fixture(ClientMode::Replicating);
    let client = &f.client;

    client.before_command().unwrap();
    client.start_transaction(TransactionId::new(14)).unwrap();
    client.append_key(&row_key("3")).unwrap();
    assert!(client.bf_abort(Seqno::new(2)));

    let err = client.before_statement().unwrap_err();
    assert!(err.is_deadlock());

    let err = client.after_statement().unwrap_err();
    assert!(err.is_deadlock());
    assert_eq!(client.transaction_state(), TransactionState::Aborted);
    assert!(!client.transaction().active());
    assert_eq!(f.provider.release_count(TransactionId::new(14)), 1);
    assert_eq!(f.provider.certify_count(), 0);
}

#[test]
fn voluntary_rollback_passes_through_must_abort() {
    let f = fixture(ClientMode::Replicating);
    let client = &f.client;

    client.before_command().unwrap();
    client.start_transaction(TransactionId::new(15)).unwrap();
    client.rollback().unwrap();

    let trx = client.transaction();
    assert_eq!(
        trx.history(),
        &[TransactionState::Executing, TransactionState::MustAbort, TransactionState::Aborting]
    );
    assert_eq!(trx.state(), TransactionState::Aborted);
    client.after_statement().unwrap();
    assert_eq!(f.provider.release_count(TransactionId::new(15)), 1);
}

#[test]
fn two_phase_commit_certifies_in_prepare() {
    let f = fixture(ClientMode::Replicating);
    let client = &f.client;

    client.before_command().unwrap();
    client.start_transaction(TransactionId::new(16)).unwrap();
    client.before_prepare().unwrap();
    assert_eq!(client.transaction_state(), TransactionState::Preparing);
    client.after_prepare().unwrap();
    assert_eq!(client.transaction_state(), TransactionState::Committing);
    assert_eq!(f.provider.certify_count(), 1);

    client.commit().unwrap();
    assert_eq!(f.provider.certify_count(), 1);
    assert_eq!(f.provider.commit_order_enter_count(), 1);
    assert_eq!(f.provider.commit_order_leave_count(), 1);
    assert_eq!(client.transaction_state(), TransactionState::Committed);
    client.after_statement().unwrap();
    assert_eq!(f.storage.commits(), 1);
}

#[test]
fn local_commit_bypasses_provider() {
    let f = fixture(ClientMode::Local);
    let client = &f.client;

    client.before_command().unwrap();
    let id = client.begin().unwrap();
    client.append_key(&row_key("1")).unwrap();
    client.append_data(b"row").unwrap();
    client.commit().unwrap();
    client.after_statement().unwrap();

    assert_eq!(f.provider.certify_count(), 0);
    assert_eq!(f.provider.commit_order_enter_count(), 0);
    assert_eq!(f.provider.release_count(id), 0);
    assert!(!f.provider.was_started(id));
    assert!(f.provider.keys(id).is_empty());
    assert!(f.provider.data(id).is_empty());
    assert!(client.last_written_gtid().seqno.is_undefined());
    assert_eq!(f.server.stats().commits, 1);
}

#[test]
fn local_commit_takes_commit_order_when_configured() {
    let f = fixture_with(
        ServerConfig::new().order_local_commits(true),
        ClientMode::Local,
    );
    let client = &f.client;

    client.before_command().unwrap();
    let id = client.begin().unwrap();
    f.provider.set_next_seqno(Seqno::new(5));
    client.before_commit().unwrap();
    assert_eq!(client.transaction_state(), TransactionState::Committing);
    assert_eq!(client.transaction().seqno(), Seqno::new(5));
    assert!(client.transaction().certified());
    assert!(!client.bf_abort(Seqno::new(9)));

    client.ordered_commit().unwrap();
    client.after_commit().unwrap();
    assert_history_legal(client);
    client.after_statement().unwrap();

    assert!(f.provider.was_started(id));
    assert_eq!(f.provider.certify_count(), 1);
    assert_eq!(f.provider.commit_order_enter_count(), 1);
    assert_eq!(f.provider.commit_order_leave_count(), 1);
    assert_eq!(f.provider.release_count(id), 1);
    assert_eq!(client.last_written_gtid().seqno, Seqno::new(5));
    assert_eq!(f.server.stats().commits, 1);
}

#[test]
fn local_two_phase_commit_is_ordered_in_prepare() {
    let f = fixture_with(
        ServerConfig::new().order_local_commits(true),
        ClientMode::Local,
    );
    let client = &f.client;

    client.before_command().unwrap();
    let id = client.begin().unwrap();
    client.before_prepare().unwrap();
    client.after_prepare().unwrap();
    assert!(client.transaction().ordered());
    client.commit().unwrap();
    client.after_statement().unwrap();

    assert_eq!(f.provider.certify_count(), 1);
    assert_eq!(f.provider.commit_order_enter_count(), 1);
    assert_eq!(f.provider.release_count(id), 1);
}

#[test]
fn failed_local_ordering_rolls_back() {
    let f = fixture_with(
        ServerConfig::new().order_local_commits(true),
        ClientMode::Local,
    );
    let client = &f.client;

    client.before_command().unwrap();
    let id = client.begin().unwrap();
    f.provider.set_certify_result(Some(ProviderError::ConnectionFailed));
    let err = client.commit().unwrap_err();
    assert_eq!(err.client_error(), Some(ClientError::ErrorDuringCommit));
    assert_eq!(client.transaction_state(), TransactionState::Aborted);
    assert!(!client.transaction().ordered());
    assert!(client.after_statement().is_err());

    assert_eq!(f.storage.rollbacks(), 1);
    assert_eq!(f.provider.commit_order_enter_count(), 0);
    assert_eq!(f.provider.release_count(id), 1);
}

#[test]
fn failed_release_after_commit_is_reported() {
    let f = fixture(ClientMode::Replicating);
    let client = &f.client;

    client.before_command().unwrap();
    let id = client.begin().unwrap();
    f.provider.set_release_result(Some(ProviderError::ConnectionFailed));
    let err = client.commit().unwrap_err();
    assert!(matches!(
        err,
        ReplError::Provider(ProviderError::ConnectionFailed)
    ));
    assert_eq!(client.transaction_state(), TransactionState::Committed);
    assert_eq!(f.storage.commits(), 1);

    client.after_statement().unwrap();
    assert!(!client.transaction().active());
    assert_eq!(f.provider.release_count(id), 1);
}

#[test]
fn failed_release_after_rollback_is_reported() {
    let f = fixture(ClientMode::Replicating);
    let client = &f.client;

    client.before_command().unwrap();
    let id = client.begin().unwrap();
    f.provider
        .set_certify_result(Some(ProviderError::CertificationFailed));
    f.provider.set_release_result(Some(ProviderError::Warning));
    assert!(client.commit().is_err());
    assert_eq!(client.transaction_state(), TransactionState::Aborted);

    let err = client.after_statement().unwrap_err();
    assert!(matches!(err, ReplError::Provider(ProviderError::Warning)));
    assert!(!client.transaction().active());
    assert_eq!(f.provider.release_count(id), 1);
}

#[test]
fn rejected_write_set_stays_unordered() {
    let f = fixture(ClientMode::Replicating);
    let client = &f.client;

    client.before_command().unwrap();
    client.begin().unwrap();
    f.provider
        .set_certify_result(Some(ProviderError::CertificationFailed));
    f.provider.set_failed_certify_seqno(Some(Seqno::new(3)));
    let err = client.before_commit().unwrap_err();
    assert!(err.is_deadlock());

    let trx = client.transaction();
    assert!(!trx.certified());
    assert!(!trx.ordered());
    assert!(trx.seqno().is_undefined());
}

#[test]
fn transient_provider_errors_map_to_commit_error() {
    for error in [
        ProviderError::Warning,
        ProviderError::TransactionMissing,
        ProviderError::ConnectionFailed,
        ProviderError::ProviderFailed,
        ProviderError::NotAllowed,
    ] {
        let f = fixture(ClientMode::Replicating);
        let client = &f.client;
        client.before_command().unwrap();
        let id = client.begin().unwrap();
        f.provider.set_certify_result(Some(error));

        let err = client.commit().unwrap_err();
        assert_eq!(
            err.client_error(),
            Some(ClientError::ErrorDuringCommit),
            "{error}"
        );
        assert_eq!(client.transaction_state(), TransactionState::Aborted);
        assert!(client.after_statement().is_err());
        assert_eq!(f.provider.release_count(id), 1);
        assert!(!client.is_aborted());
    }
}

#[test]
fn size_exceeded_is_reported() {
    let f = fixture(ClientMode::Replicating);
    f.client.before_command().unwrap();
    f.client.begin().unwrap();
    f.provider.set_certify_result(Some(ProviderError::SizeExceeded));
    let err = f.client.commit().unwrap_err();
    assert_eq!(err.client_error(), Some(ClientError::SizeExceeded));
}

#[test]
fn fatal_certification_stops_connection() {
    let f = fixture(ClientMode::Replicating);
    let client = &f.client;
    client.before_command().unwrap();
    client.begin().unwrap();
    f.provider.set_certify_result(Some(ProviderError::Fatal));

    let err = client.before_commit().unwrap_err();
    assert!(matches!(err, ReplError::Fatal(_)));
    assert!(client.is_aborted());
    assert_eq!(client.transaction_state(), TransactionState::MustAbort);
}

#[test]
fn commit_order_failure_is_fatal() {
    let f = fixture(ClientMode::Replicating);
    let client = &f.client;
    client.before_command().unwrap();
    client.begin().unwrap();
    f.provider
        .set_commit_order_enter_result(Some(ProviderError::ConnectionFailed));

    let err = client.commit().unwrap_err();
    assert!(err.is_fatal());
    assert!(client.is_aborted());
}

#[test]
fn killed_connection_is_interrupted() {
    let f = fixture(ClientMode::Replicating);
    let client = &f.client;
    client.before_command().unwrap();
    client.begin().unwrap();
    client.kill();

    let err = client.commit().unwrap_err();
    assert_eq!(err.client_error(), Some(ClientError::Interrupted));
    assert_eq!(f.provider.certify_count(), 0);
    assert_eq!(client.transaction_state(), TransactionState::Aborted);
}

#[test]
fn prepare_failure_aborts() {
    let f = fixture(ClientMode::Replicating);
    f.storage.fail_prepare(true);
    f.client.before_command().unwrap();
    f.client.begin().unwrap();

    let err = f.client.commit().unwrap_err();
    assert_eq!(err.client_error(), Some(ClientError::ErrorDuringCommit));
    assert_eq!(f.client.transaction_state(), TransactionState::Aborted);
}

#[test]
fn unsupported_paths_are_unimplemented() {
    let f = fixture(ClientMode::Replicating);
    for result in [
        f.client.enter_toi(),
        f.client.enable_streaming(),
        f.client.adopt_transaction(&f.client.transaction()),
    ] {
        let err = result.unwrap_err();
        assert!(matches!(err, ReplError::Unimplemented(_)));
        assert!(err.is_fatal());
    }
}

#[test]
fn second_start_is_rejected() {
    let f = fixture(ClientMode::Replicating);
    f.client.before_command().unwrap();
    f.client.begin().unwrap();
    assert!(matches!(
        f.client.begin(),
        Err(ReplError::InvalidOperation { .. })
    ));
}

#[derive(Debug, Clone, Copy)]
enum Injection {
    None,
    AfterCertify,
    BeforeCommitOrder,
}

fn outcome_strategy() -> impl Strategy<Value = Option<ProviderError>> {
    prop_oneof![
        3 => Just(None),
        1 => Just(Some(ProviderError::Warning)),
        1 => Just(Some(ProviderError::TransactionMissing)),
        1 => Just(Some(ProviderError::CertificationFailed)),
        1 => Just(Some(ProviderError::BfAbort)),
        1 => Just(Some(ProviderError::SizeExceeded)),
        1 => Just(Some(ProviderError::ConnectionFailed)),
        1 => Just(Some(ProviderError::ProviderFailed)),
        1 => Just(Some(ProviderError::NotImplemented)),
        1 => Just(Some(ProviderError::NotAllowed)),
    ]
}

fn injection_strategy() -> impl Strategy<Value = Injection> {
    prop_oneof![
        Just(Injection::None),
        Just(Injection::AfterCertify),
        Just(Injection::BeforeCommitOrder),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn every_lifecycle_releases_exactly_once(
        outcome in outcome_strategy(),
        injection in injection_strategy(),
        seqno in 1i64..100,
        aborter in 1i64..100,
    ) {
        let f = fixture(ClientMode::Replicating);
        let client = &f.client;
        let victim = Arc::downgrade(client);
        let hook: certrep_core::MockHook = Arc::new(move || {
            if let Some(victim) = victim.upgrade() {
                victim.bf_abort(Seqno::new(aborter));
            }
        });
        match injection {
            Injection::None => {}
            Injection::AfterCertify => f.provider.set_after_certify_hook(Some(hook)),
            Injection::BeforeCommitOrder => {
                f.provider.set_before_commit_order_enter_hook(Some(hook))
            }
        }

        client.before_command().unwrap();
        let id = client.begin().unwrap();
        client.append_key(&row_key("1")).unwrap();
        f.provider.set_next_seqno(Seqno::new(seqno));
        f.provider.set_certify_result(outcome);

        let committed = client.commit().is_ok();
        f.provider.set_after_certify_hook(None);
        f.provider.set_before_commit_order_enter_hook(None);
        assert_history_legal(client);
        let _ = client.after_statement();
        assert_history_legal(client);

        let final_state = client.transaction_state();
        prop_assert!(
            final_state == TransactionState::Committed || final_state == TransactionState::Aborted,
            "final state {final_state}"
        );
        prop_assert!(!client.transaction().active());
        prop_assert_eq!(f.provider.release_count(id), 1);
        if committed {
            prop_assert_eq!(final_state, TransactionState::Committed);
        }
        if outcome.is_some() {
            prop_assert_eq!(final_state, TransactionState::Aborted);
            prop_assert_eq!(f.provider.replay_count(), 0);
        }
    }
}
