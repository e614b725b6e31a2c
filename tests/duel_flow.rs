use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use duel_engine::cache::{
    ChallengeStore, DuelStateCache, InMemoryChallengeStore, InMemoryDuelCache,
};
use duel_engine::config::EngineConfig;
use duel_engine::engine::duel::{
    ConnectionStatus, DuelId, FinishReason, LiveDuelState, Phase, PlayerAction, PlayerId,
};
use duel_engine::game::{DuelCoordinator, DuelError, DuelRuntime};
use duel_engine::ledger::{DuelLedger, DuelStatus};

const START_BALANCE: u64 = 1_000;

async fn runtime(config: EngineConfig) -> DuelRuntime {
    let cache = Arc::new(InMemoryDuelCache::new(config.live_state_ttl()));
    let ledger = DuelLedger::in_memory();
    for player in 1..=2 {
        ledger.open_account(player, START_BALANCE, 5).await.unwrap();
    }
    DuelRuntime::spawn(Arc::new(DuelCoordinator::new(cache, ledger, config)))
}

fn seeded(seed: u64) -> EngineConfig {
    EngineConfig {
        rng_seed: Some(seed),
        ..EngineConfig::default()
    }
}

async fn balance(coordinator: &DuelCoordinator, player: PlayerId) -> u64 {
    coordinator.ledger().account(player).await.unwrap().balance
}

async fn accepted_duel(runtime: &DuelRuntime, wager: u64) -> LiveDuelState {
    let negotiator = runtime.negotiator();
    let request = negotiator.propose(1, 2, wager).await.unwrap();
    negotiator.accept(request.id, 2).await.unwrap()
}

async fn ready_both(coordinator: &DuelCoordinator, duel_id: DuelId) -> LiveDuelState {
    for player in [1, 2] {
        coordinator
            .submit_action(duel_id, player, PlayerAction::Ready)
            .await
            .unwrap();
    }
    coordinator.load(duel_id).await.unwrap()
}

#[tokio::test]
async fn challenge_to_settlement_conserves_funds() {
    let runtime = runtime(seeded(21)).await;
    let coordinator = runtime.coordinator();

    let state = accepted_duel(&runtime, 200).await;
    let duel_id = state.duel_id;
    assert_eq!(balance(&coordinator, 1).await, 800);
    assert_eq!(balance(&coordinator, 2).await, 800);

    let mut state = ready_both(&coordinator, duel_id).await;
    let mut last_version = state.state_version;
    for _ in 0..100 {
        if state.is_finished() {
            break;
        }
        assert_eq!(state.phase, Phase::HoldDiscard);
        let player = state.current_turn.expect("hold_discard always has a turn");
        coordinator
            .submit_action(duel_id, player, PlayerAction::hold_all())
            .await
            .unwrap();
        state = coordinator.load(duel_id).await.unwrap();
        assert!(state.state_version > last_version);
        last_version = state.state_version;
    }

    let outcome = state.outcome.expect("duel finished");
    let settlement = state.settlement.expect("finished duels are settled");
    assert_eq!(settlement.winner, outcome.winner);

    let (a, b) = (balance(&coordinator, 1).await, balance(&coordinator, 2).await);
    assert_eq!(a + b, 2 * START_BALANCE);
    match outcome.winner {
        Some(1) => assert_eq!((a, b), (1_200, 800)),
        Some(2) => assert_eq!((a, b), (800, 1_200)),
        None => assert_eq!((a, b), (1_000, 1_000)),
        Some(other) => panic!("winner {other} is not a participant"),
    }
    let record = coordinator.ledger().duel(duel_id).await.unwrap();
    assert_eq!(record.status, DuelStatus::Resolved);
    assert_eq!(record.winner, outcome.winner);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn settlement_is_idempotent() {
    let runtime = runtime(seeded(22)).await;
    let coordinator = runtime.coordinator();
    let duel_id = accepted_duel(&runtime, 200).await.duel_id;

    coordinator
        .submit_action(duel_id, 2, PlayerAction::Forfeit)
        .await
        .unwrap();
    let state = coordinator.load(duel_id).await.unwrap();
    assert_eq!(state.outcome.map(|o| o.reason), Some(FinishReason::Forfeit));
    assert_eq!(balance(&coordinator, 1).await, 1_200);
    assert_eq!(balance(&coordinator, 2).await, 800);

    let escrow = coordinator.ledger().escrow();
    let again = escrow.settle(duel_id, Some(1), Utc::now()).await.unwrap();
    assert!(again.already_final);
    let refund = escrow.refund(duel_id, Utc::now()).await.unwrap();
    assert!(refund.already_final);
    coordinator.settle(&state).await.unwrap();

    assert_eq!(balance(&coordinator, 1).await, 1_200);
    assert_eq!(balance(&coordinator, 2).await, 800);
    assert_eq!(
        coordinator.ledger().duel(duel_id).await.unwrap().status,
        DuelStatus::Resolved
    );

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn disconnect_without_reconnect_forfeits() {
    let mut config = seeded(23);
    config.rules.reconnect_grace = Duration::from_millis(50);
    let runtime = runtime(config).await;
    let coordinator = runtime.coordinator();
    let duel_id = accepted_duel(&runtime, 200).await.duel_id;
    ready_both(&coordinator, duel_id).await;

    runtime
        .monitor()
        .participant_disconnected(duel_id, 2)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let state = coordinator.load(duel_id).await.unwrap();
    let outcome = state.outcome.expect("grace expiry finishes the duel");
    assert_eq!(outcome.reason, FinishReason::DisconnectTimeout);
    assert_eq!(outcome.winner, Some(1));
    assert_eq!(balance(&coordinator, 1).await, 1_200);
    assert_eq!(balance(&coordinator, 2).await, 800);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn reconnect_within_grace_resumes_unchanged() {
    let mut config = seeded(24);
    config.rules.reconnect_grace = Duration::from_millis(150);
    let runtime = runtime(config).await;
    let coordinator = runtime.coordinator();
    let duel_id = accepted_duel(&runtime, 200).await.duel_id;
    let before = ready_both(&coordinator, duel_id).await;

    let monitor = runtime.monitor();
    monitor.participant_disconnected(duel_id, 2).await.unwrap();
    let resumed = monitor
        .participant_reconnected(duel_id, 2)
        .await
        .unwrap()
        .into_state();
    assert_eq!(monitor.pending_timers(), 0);
    tokio::time::sleep(Duration::from_millis(400)).await;

    let after = coordinator.load(duel_id).await.unwrap();
    assert_eq!(after.state_version, resumed.state_version);
    assert!(!after.is_finished());
    assert_eq!(after.phase, before.phase);
    assert_eq!(after.round, before.round);
    assert_eq!(after.current_turn, before.current_turn);
    assert_eq!(after.turn_deadline, before.turn_deadline);
    for (old, new) in before.participants.iter().zip(after.participants.iter()) {
        assert_eq!(old.hand, new.hand);
        assert_eq!(new.connection, ConnectionStatus::Connected);
        assert_eq!(new.disconnect_deadline, None);
    }

    runtime.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_commit_once_per_version() {
    let runtime = runtime(seeded(25)).await;
    let coordinator = runtime.coordinator();
    let duel_id = accepted_duel(&runtime, 200).await.duel_id;
    let dealt = ready_both(&coordinator, duel_id).await;
    let player = dealt.current_turn.unwrap();

    let mut feed = coordinator.cache().subscribe();
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let coordinator = Arc::clone(&coordinator);
        tasks.push(tokio::spawn(async move {
            coordinator
                .submit_action(duel_id, player, PlayerAction::hold_all())
                .await
        }));
    }
    let mut committed = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(outcome) => {
                assert!(outcome.is_committed());
                committed += 1;
            }
            Err(DuelError::Action(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(committed, 1);

    let state = coordinator.load(duel_id).await.unwrap();
    assert_ne!(state.current_turn, Some(player));
    let mut versions = Vec::new();
    while let Ok(update) = feed.try_recv() {
        versions.push(update.version);
    }
    assert!(!versions.is_empty());
    assert!(versions.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(versions.last().copied(), Some(state.state_version));

    runtime.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_forfeits_settle_once() {
    let runtime = runtime(seeded(26)).await;
    let coordinator = runtime.coordinator();
    let duel_id = accepted_duel(&runtime, 300).await.duel_id;

    let tasks: Vec<_> = [1, 2]
        .into_iter()
        .map(|player| {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .submit_action(duel_id, player, PlayerAction::Forfeit)
                    .await
            })
        })
        .collect();
    let mut ok = 0;
    for task in tasks {
        if task.await.unwrap().is_ok() {
            ok += 1;
        }
    }
    assert_eq!(ok, 1);

    let state = coordinator.load(duel_id).await.unwrap();
    let winner = state.outcome.and_then(|o| o.winner).unwrap();
    let loser = if winner == 1 { 2 } else { 1 };
    assert_eq!(balance(&coordinator, winner).await, 1_300);
    assert_eq!(balance(&coordinator, loser).await, 700);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn challenge_crosses_runtimes_sharing_stores() {
    let config = seeded(27);
    let cache: Arc<dyn DuelStateCache> =
        Arc::new(InMemoryDuelCache::new(config.live_state_ttl()));
    let challenges: Arc<dyn ChallengeStore> = Arc::new(InMemoryChallengeStore::new());
    let ledger = DuelLedger::in_memory();
    for player in 1..=2 {
        ledger.open_account(player, START_BALANCE, 5).await.unwrap();
    }
    let spawn_node = || {
        let coordinator = DuelCoordinator::new(Arc::clone(&cache), ledger.clone(), config.clone());
        DuelRuntime::spawn_with_challenges(Arc::new(coordinator), Arc::clone(&challenges))
    };
    let west = spawn_node();
    let east = spawn_node();

    let request = west.negotiator().propose(1, 2, 150).await.unwrap();
    let pending = east.negotiator().pending_for(2).await.unwrap();
    assert_eq!(pending.iter().map(|r| r.id).collect::<Vec<_>>(), vec![request.id]);

    let started = east.negotiator().accept(request.id, 2).await.unwrap();
    assert!(west.negotiator().get(request.id).await.unwrap().is_none());

    // either node drives the duel
    west.coordinator()
        .submit_action(started.duel_id, 1, PlayerAction::Forfeit)
        .await
        .unwrap();
    let state = east.coordinator().load(started.duel_id).await.unwrap();
    assert_eq!(state.outcome.and_then(|o| o.winner), Some(2));
    assert_eq!(balance(&east.coordinator(), 2).await, 1_150);
    assert_eq!(balance(&west.coordinator(), 1).await, 850);

    west.shutdown().await.unwrap();
    east.shutdown().await.unwrap();
}
