use sequencer_core::{
    OutcomeStatus, RegistrationCoordinator, RegistrationError, Resolution, SequencerConfig,
    SigningKeyRef, SimulatedChain, SqliteStore, StepOutcome, Store, TxPayload, WalletState,
    WatchBehavior,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn test_config(dir: &TempDir) -> SequencerConfig {
    let mut config = SequencerConfig::default();
    config.store.path = dir
        .path()
        .join("sequencer.db")
        .to_string_lossy()
        .into_owned();
    config.pool.acquire_wait_ms = 10;
    config.retry.base_delay_ms = 1;
    config.retry.jitter = false;
    config.chain.poll_interval_ms = 1;
    config.worker.scan_interval_ms = 2;
    config
}

fn payload(tourist: &str) -> TxPayload {
    TxPayload::registration(serde_json::json!({ "tourist_id": tourist }))
}

async fn open(
    config: &SequencerConfig,
    chain: Arc<SimulatedChain>,
) -> (Arc<SqliteStore>, RegistrationCoordinator) {
    let store = Arc::new(SqliteStore::open(&config.store.path).await.unwrap());
    let coordinator = RegistrationCoordinator::open(config.clone(), store.clone(), chain)
        .await
        .unwrap();
    (store, coordinator)
}

#[tokio::test]
async fn test_queued_registration_survives_restart() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let chain = Arc::new(SimulatedChain::new());

    {
        let (store, coordinator) = open(&config, chain.clone()).await;
        coordinator
            .pool()
            .provision("0xaaa", SigningKeyRef::new("key-a"))
            .await
            .unwrap();
        let result = coordinator
            .request_registration("req-1", payload("t-1"))
            .await;
        assert!(matches!(result, Err(RegistrationError::Pending { .. })));
        store.close().await;
    }

    let (store, coordinator) = open(&config, chain.clone()).await;
    let stats = coordinator.pool().stats().await;
    assert_eq!(stats.total, 1);
    assert_eq!(stats.leased, 1);
    assert_eq!(
        coordinator.reconciler().outcome("req-1").await.unwrap().status,
        OutcomeStatus::Pending
    );

    // Still idempotent across the restart
    let again = coordinator
        .request_registration("req-1", payload("t-1"))
        .await;
    assert!(matches!(again, Err(RegistrationError::Pending { .. })));

    let report = coordinator
        .dispatcher()
        .run_until_idle(Duration::from_secs(5))
        .await;
    assert_eq!(report.confirmed, 1);
    coordinator
        .await_registration("req-1", Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(
        coordinator.pool().state_of("0xaaa").await,
        Some(WalletState::Free)
    );

    // The restored nonce counter continues where it left off
    coordinator
        .request_registration("req-2", payload("t-2"))
        .await
        .unwrap_err();
    coordinator
        .dispatcher()
        .run_until_idle(Duration::from_secs(5))
        .await;
    assert_eq!(chain.confirmed_nonces("0xaaa"), vec![0, 1]);

    let outcomes = store.load_outcomes().await.unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes
        .iter()
        .all(|o| o.status == OutcomeStatus::Completed && o.transaction_hash.is_some()));
    store.close().await;
}

#[tokio::test]
async fn test_purge_reseeds_pool_from_inventory() {
    let dir = TempDir::new().unwrap();
    let inventory = dir.path().join("wallets.csv");
    std::fs::write(&inventory, "# address,key_ref\n0xaaa,key-a\n0xbbb,key-b\n").unwrap();

    let mut config = test_config(&dir);
    config.pool.inventory_path = Some(inventory.to_string_lossy().into_owned());
    let chain = Arc::new(SimulatedChain::new());

    let (store, coordinator) = open(&config, chain).await;
    assert_eq!(coordinator.pool().stats().await.total, 2);

    coordinator
        .request_registration("req-1", payload("t-1"))
        .await
        .unwrap_err();
    assert_eq!(coordinator.pool().stats().await.leased, 1);

    let report = coordinator.purge().await.unwrap();
    assert_eq!(report.wallets, 2);
    assert_eq!(report.entries, 1);

    let stats = coordinator.pool().stats().await;
    assert_eq!(stats.total, 2);
    assert_eq!(stats.free, 2);
    assert_eq!(coordinator.queue().status().await.total, 0);
    assert_eq!(store.load_entries().await.unwrap().len(), 0);

    // Outcome rows survive the purge; the orphaned one is settled as failed
    let outcome = coordinator.reconciler().outcome("req-1").await.unwrap();
    assert_eq!(outcome.status, OutcomeStatus::Failed);
    store.close().await;
}

#[tokio::test]
async fn test_send_mined_while_down_completes_after_restart() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.chain.max_polls = 2;
    let chain = Arc::new(SimulatedChain::new());

    let original = {
        let (store, coordinator) = open(&config, chain.clone()).await;
        coordinator
            .pool()
            .provision("0xaaa", SigningKeyRef::new("key-a"))
            .await
            .unwrap();
        chain.script_watch("0xaaa", [WatchBehavior::Pending; 2]);
        coordinator
            .request_registration("req-1", payload("t-1"))
            .await
            .unwrap_err();

        let step = coordinator.submitter().step("0xaaa").await.unwrap();
        assert!(matches!(
            step,
            StepOutcome::Resolved(Resolution::Requeued { nonce: 0, .. })
        ));
        store.close().await;
        chain.submissions()[0].tx_hash.clone()
    };

    // Mined while the process is down
    assert!(chain.mine(&original));

    let (store, coordinator) = open(&config, chain.clone()).await;
    let entry = coordinator.queue().entries_for("0xaaa").await.remove(0);
    assert_eq!(entry.accepted_hashes, vec![original.clone()]);
    assert!(
        coordinator
            .queue()
            .sequencer()
            .consumed_on_chain("0xaaa", 0)
            .await
    );

    let report = coordinator
        .dispatcher()
        .run_until_idle(Duration::from_secs(5))
        .await;
    assert_eq!(report.confirmed, 1);
    assert_eq!(report.failed, 0);

    let receipt = coordinator
        .await_registration("req-1", Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(receipt.transaction_hash, original);
    assert_eq!(chain.submissions().len(), 1);
    assert_eq!(chain.confirmed_nonces("0xaaa"), vec![0]);
    assert_eq!(
        coordinator.pool().state_of("0xaaa").await,
        Some(WalletState::Free)
    );

    // Nonce 0 is spent, the next registration moves on
    coordinator
        .request_registration("req-2", payload("t-2"))
        .await
        .unwrap_err();
    let next = coordinator
        .queue()
        .entries_for("0xaaa")
        .await
        .into_iter()
        .find(|e| e.owner_request_id == "req-2")
        .unwrap();
    assert_eq!(next.nonce, 1);
    store.close().await;
}
