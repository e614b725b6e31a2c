//! Turns committed cache updates and challenge events into socket messages
//! for the participants connected to this process.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::DuelUpdate;
use crate::engine::duel::{LiveDuelState, PlayerId};
use crate::game::challenge::ChallengeEvent;
use crate::tokio_tools::spawn_named_task;

use super::dto::DuelView;
use super::protocol::{ChallengeClosedReason, ServerMessage};
use super::rooms::RoomRegistry;

const LOG_TARGET: &str = "server::fanout";

pub struct DuelFanout {
    rooms: Arc<RoomRegistry>,
}

impl DuelFanout {
    pub fn new(rooms: Arc<RoomRegistry>) -> Self {
        Self { rooms }
    }

    /// Forwards the announced version itself, so transient phases (`draw`,
    /// `resolve_round`) reach the room even when a later commit already
    /// replaced them in the cache.
    pub fn handle_update(&self, update: DuelUpdate) {
        let duel_id = update.duel_id;
        if let Some(room) = self.rooms.room(duel_id) {
            if room.last_version >= update.version {
                return;
            }
        }
        let state = update.state.as_ref();

        let participants = state.player_ids();
        if self.rooms.room(duel_id).is_none() {
            if !self.rooms.any_connected(&participants) || state.settlement.is_some() {
                return;
            }
            if self.rooms.join(duel_id, participants, 0) {
                for player in participants {
                    let opponent = state.opponent_of(player).unwrap_or_default();
                    self.rooms.send_to_player(
                        player,
                        &ServerMessage::Started {
                            duel_id,
                            opponent,
                            wager: state.wager,
                        },
                    );
                }
            }
        }

        if !self.rooms.advance(duel_id, state.state_version) {
            return;
        }
        self.broadcast_state(state);

        if let Some(settlement) = state.settlement {
            let resolved = ServerMessage::Resolved {
                duel_id,
                winner: settlement.winner,
                payout: settlement.payout,
            };
            for player in participants {
                self.rooms.send_to_player(player, &resolved);
            }
            self.rooms.leave(duel_id);
        }
    }

    /// Sends each participant their own redacted view.
    pub fn broadcast_state(&self, state: &LiveDuelState) {
        for player in state.player_ids() {
            self.send_state(state, player);
        }
    }

    pub fn send_state(&self, state: &LiveDuelState, player: PlayerId) -> usize {
        match DuelView::for_player(state, player) {
            Some(view) => self.rooms.send_to_player(player, &ServerMessage::State(view)),
            None => 0,
        }
    }

    pub fn handle_challenge(&self, event: ChallengeEvent) {
        match event {
            ChallengeEvent::Proposed(request) => {
                let message = ServerMessage::ChallengeReceived {
                    request: request.clone(),
                };
                self.rooms.send_to_player(request.target, &message);
                self.rooms.send_to_player(request.challenger, &message);
            }
            ChallengeEvent::Accepted { request, .. } => {
                self.close_challenge(&[request.challenger, request.target], request.id, ChallengeClosedReason::Accepted);
            }
            ChallengeEvent::Declined(request) => {
                self.close_challenge(&[request.challenger, request.target], request.id, ChallengeClosedReason::Declined);
            }
            ChallengeEvent::Expired(request) => {
                self.close_challenge(&[request.challenger, request.target], request.id, ChallengeClosedReason::Expired);
            }
        }
    }

    fn close_challenge(
        &self,
        players: &[PlayerId],
        request_id: crate::game::challenge::ChallengeId,
        reason: ChallengeClosedReason,
    ) {
        let message = ServerMessage::ChallengeClosed { request_id, reason };
        for player in players {
            self.rooms.send_to_player(*player, &message);
        }
    }

    /// Follows both feeds until cancelled.
    pub fn spawn(
        self: Arc<Self>,
        mut updates: broadcast::Receiver<DuelUpdate>,
        mut challenges: broadcast::Receiver<ChallengeEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        spawn_named_task("duel-fanout", async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = updates.recv() => match received {
                        Ok(update) => self.handle_update(update),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(target = LOG_TARGET, skipped, "update feed lagged; rooms resync on next update");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    received = challenges.recv() => match received {
                        Ok(event) => self.handle_challenge(event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(target = LOG_TARGET, skipped, "challenge feed lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!(target = LOG_TARGET, "fanout stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{DuelStateCache, InMemoryDuelCache};
    use crate::game::coordinator::DuelCoordinator;
    use crate::config::EngineConfig;
    use crate::engine::duel::{Phase, PlayerAction};
    use crate::ledger::DuelLedger;
    use chrono::Utc;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    #[tokio::test]
    async fn participants_get_started_state_and_resolved() {
        let config = EngineConfig {
            rng_seed: Some(4),
            ..EngineConfig::default()
        };
        let cache = Arc::new(InMemoryDuelCache::new(config.live_state_ttl()));
        let ledger = DuelLedger::in_memory();
        ledger.open_account(1, 1_000, 1).await.unwrap();
        ledger.open_account(2, 1_000, 1).await.unwrap();
        let coordinator = Arc::new(DuelCoordinator::new(cache, ledger, config));
        let rooms = Arc::new(RoomRegistry::new());
        let fanout = DuelFanout::new(Arc::clone(&rooms));

        let (tx, mut rx) = mpsc::channel(64);
        rooms.register(2, tx);
        let mut feed = coordinator.cache().subscribe();

        let record = coordinator
            .ledger()
            .create_duel(Uuid::new_v4(), 1, 2, 100, Utc::now())
            .await
            .unwrap();
        coordinator.start_duel(&record, Utc::now()).await.unwrap();
        fanout.handle_update(feed.recv().await.unwrap());

        assert_eq!(
            rx.recv().await,
            Some(ServerMessage::Started {
                duel_id: record.id,
                opponent: 1,
                wager: 100
            })
        );
        match rx.recv().await {
            Some(ServerMessage::State(view)) => {
                assert_eq!(view.version, 1);
                assert_eq!(view.you.player_id, 2);
            }
            other => panic!("expected duel.state, got {other:?}"),
        }

        coordinator
            .submit_action(record.id, 1, PlayerAction::Forfeit)
            .await
            .unwrap();
        // forfeit, then the settlement marker
        for _ in 0..2 {
            fanout.handle_update(feed.recv().await.unwrap());
        }
        let mut saw_resolved = false;
        while let Ok(message) = rx.try_recv() {
            if let ServerMessage::Resolved { winner, payout, .. } = message {
                assert_eq!(winner, Some(1));
                assert_eq!(payout, 200);
                saw_resolved = true;
            }
        }
        assert!(saw_resolved);
        assert_eq!(rooms.room_count(), 0);
    }

    #[tokio::test]
    async fn every_committed_version_reaches_the_room() {
        let config = EngineConfig {
            rng_seed: Some(9),
            ..EngineConfig::default()
        };
        let cache = Arc::new(InMemoryDuelCache::new(config.live_state_ttl()));
        let ledger = DuelLedger::in_memory();
        ledger.open_account(1, 1_000, 1).await.unwrap();
        ledger.open_account(2, 1_000, 1).await.unwrap();
        let coordinator = Arc::new(DuelCoordinator::new(cache, ledger, config));
        let rooms = Arc::new(RoomRegistry::new());
        let fanout = DuelFanout::new(Arc::clone(&rooms));

        let (tx, mut rx) = mpsc::channel(64);
        rooms.register(1, tx);
        let mut feed = coordinator.cache().subscribe();

        let record = coordinator
            .ledger()
            .create_duel(Uuid::new_v4(), 1, 2, 100, Utc::now())
            .await
            .unwrap();
        coordinator.start_duel(&record, Utc::now()).await.unwrap();
        for player in [1, 2] {
            coordinator
                .submit_action(record.id, player, PlayerAction::Ready)
                .await
                .unwrap();
        }
        // the cache already holds the dealt hand; the draw commit is history
        let latest = coordinator.load(record.id).await.unwrap();
        assert_eq!(latest.phase, Phase::HoldDiscard);
        while let Ok(update) = feed.try_recv() {
            fanout.handle_update(update);
        }

        let mut views = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let ServerMessage::State(view) = message {
                views.push((view.version, view.phase));
            }
        }
        let expected: Vec<_> = (1..=latest.state_version).collect();
        assert_eq!(views.iter().map(|(v, _)| *v).collect::<Vec<_>>(), expected);
        assert!(views.contains(&(3, Phase::Draw)));
        assert_eq!(views.last().map(|(_, phase)| *phase), Some(Phase::HoldDiscard));
    }

    #[tokio::test]
    async fn stale_and_foreign_updates_are_ignored() {
        let rooms = Arc::new(RoomRegistry::new());
        let fanout = DuelFanout::new(Arc::clone(&rooms));

        let state = crate::test_utils::live_state(5, 6, Utc::now());
        fanout.handle_update(DuelUpdate::committed(&state));
        assert_eq!(rooms.room_count(), 0);

        let (tx, mut rx) = mpsc::channel(8);
        rooms.register(5, tx);
        fanout.handle_update(DuelUpdate::committed(&state));
        assert!(matches!(rx.try_recv(), Ok(ServerMessage::Started { .. })));
        assert!(matches!(rx.try_recv(), Ok(ServerMessage::State(_))));
        // a replay of the same version sends nothing
        fanout.handle_update(DuelUpdate::committed(&state));
        assert!(rx.try_recv().is_err());
    }
}
