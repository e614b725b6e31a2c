#![cfg(test)]

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::{rngs::StdRng, SeedableRng};
use uuid::Uuid;

use super::*;
use crate::config::DuelRules;
use crate::game::card_ranking::evaluate_hand;

const A: PlayerId = 11;
const B: PlayerId = 22;

struct Harness {
    state: LiveDuelState,
    rules: DuelRules,
    now: DateTime<Utc>,
    rng: StdRng,
}

impl Harness {
    fn new() -> Self {
        Self::with_rules(DuelRules::default())
    }

    fn with_rules(rules: DuelRules) -> Self {
        let now = Utc::now();
        let state = LiveDuelState::new(Uuid::new_v4(), 100, A, B, &rules, now);
        Self {
            state,
            rules,
            now,
            rng: StdRng::seed_from_u64(7),
        }
    }

    /// Applies `input` and bumps the version the way a committed write does.
    fn input(&mut self, input: DuelInput) -> Result<Transition, RuleError> {
        let mut ctx = RuleContext {
            rules: &self.rules,
            now: self.now,
            rng: &mut self.rng,
        };
        let mut next = self.state.clone();
        let transition = apply(&mut next, &input, &mut ctx)?;
        if let Transition::Applied { .. } = transition {
            next.state_version = self.state.state_version + 1;
            self.state = next;
        }
        Ok(transition)
    }

    fn act(&mut self, player_id: PlayerId, action: PlayerAction) -> Result<Transition, RuleError> {
        self.input(DuelInput::Player { player_id, action })
    }

    fn settle_transients(&mut self) {
        while self.state.phase.is_transient() {
            self.input(DuelInput::Advance).unwrap();
        }
    }

    fn start(&mut self) {
        self.act(A, PlayerAction::Ready).unwrap();
        self.act(B, PlayerAction::Ready).unwrap();
        self.settle_transients();
        assert_eq!(self.state.phase, Phase::HoldDiscard);
    }

    fn elapse(&mut self, by: ChronoDuration) {
        self.now += by;
    }
}

#[test]
fn both_ready_moves_to_draw_then_deals() {
    let mut h = Harness::new();
    h.act(A, PlayerAction::Ready).unwrap();
    assert_eq!(h.state.phase, Phase::AwaitingReady);
    assert_eq!(
        h.act(A, PlayerAction::Ready).unwrap_err(),
        RuleError::Action(ActionError::AlreadyReady)
    );

    h.act(B, PlayerAction::Ready).unwrap();
    assert_eq!(h.state.phase, Phase::Draw);
    assert_eq!(h.state.turn_deadline, Some(h.now));

    let t = h.input(DuelInput::Advance).unwrap();
    assert_eq!(
        t,
        Transition::applied(vec![
            DuelEvent::Dealt { round: 1 },
            DuelEvent::TurnPassed { to: A }
        ])
    );
    assert_eq!(h.state.phase, Phase::HoldDiscard);
    assert_eq!(h.state.current_turn, Some(A));
    assert!(h.state.participants.iter().all(|p| p.hand.len() == 5));
    assert_eq!(h.state.deck.len(), 42);
}

#[test]
fn advance_outside_transient_phase_is_noop() {
    let mut h = Harness::new();
    let t = h.input(DuelInput::Advance).unwrap();
    assert!(matches!(t, Transition::Noop { .. }));
    assert_eq!(h.state.state_version, 1);
}

#[test]
fn turns_alternate_and_each_acts_once() {
    let mut h = Harness::new();
    h.start();

    assert_eq!(
        h.act(B, PlayerAction::hold_all()).unwrap_err(),
        RuleError::Action(ActionError::NotYourTurn)
    );

    h.act(A, PlayerAction::hold_all()).unwrap();
    assert_eq!(h.state.current_turn, Some(B));
    assert_eq!(
        h.act(A, PlayerAction::hold_all()).unwrap_err(),
        RuleError::Action(ActionError::NotYourTurn)
    );

    h.act(B, PlayerAction::hold_all()).unwrap();
    assert_eq!(h.state.phase, Phase::ResolveRound);
    assert_eq!(h.state.current_turn, None);

    h.settle_transients();
    assert_eq!(h.state.round, 2);
    // second round opens with the other participant
    assert_eq!(h.state.current_turn, Some(B));
}

#[test]
fn discard_replaces_only_listed_cards() {
    let mut h = Harness::new();
    h.start();
    let before = h.state.participants[0].hand.clone();
    let top_of_deck = h.state.deck[..2].to_vec();

    let t = h
        .act(
            A,
            PlayerAction::Discard {
                card_indices: vec![1, 3],
            },
        )
        .unwrap();
    assert_eq!(
        t,
        Transition::applied(vec![
            DuelEvent::CardsReplaced {
                player_id: A,
                replaced: 2
            },
            DuelEvent::TurnPassed { to: B }
        ])
    );

    let after = &h.state.participants[0];
    assert_eq!(after.hand[0], before[0]);
    assert_eq!(after.hand[2], before[2]);
    assert_eq!(after.hand[4], before[4]);
    assert_eq!(after.hand[1], top_of_deck[0]);
    assert_eq!(after.hand[3], top_of_deck[1]);
    assert_eq!(after.held_card_indices, vec![0, 2, 4]);
    assert_eq!(h.state.validate_invariants(), Ok(()));
}

#[test]
fn malformed_card_indices_are_rejected() {
    let mut h = Harness::new();
    h.start();
    assert_eq!(
        h.act(
            A,
            PlayerAction::Hold {
                card_indices: vec![5]
            }
        )
        .unwrap_err(),
        RuleError::Action(ActionError::InvalidCardIndex(5))
    );
    assert_eq!(
        h.act(
            A,
            PlayerAction::Discard {
                card_indices: vec![2, 2]
            }
        )
        .unwrap_err(),
        RuleError::Action(ActionError::DuplicateCardIndex(2))
    );
    assert_eq!(h.state.current_turn, Some(A));
}

#[test]
fn outsiders_and_wrong_phase_are_rejected() {
    let mut h = Harness::new();
    assert_eq!(
        h.act(99, PlayerAction::Ready).unwrap_err(),
        RuleError::Action(ActionError::NotParticipant)
    );
    assert_eq!(
        h.act(A, PlayerAction::hold_all()).unwrap_err(),
        RuleError::Action(ActionError::WrongPhase(Phase::AwaitingReady))
    );
}

#[test]
fn turn_timeout_holds_all_for_the_idle_player() {
    let mut h = Harness::new();
    h.start();
    let hand = h.state.participants[0].hand.clone();
    let observed = h.state.state_version;

    h.elapse(ChronoDuration::seconds(10));
    let early = h
        .input(DuelInput::DeadlineElapsed {
            observed_version: observed,
        })
        .unwrap();
    assert!(matches!(early, Transition::Noop { .. }));

    h.elapse(ChronoDuration::seconds(25));
    let t = h
        .input(DuelInput::DeadlineElapsed {
            observed_version: observed,
        })
        .unwrap();
    match t {
        Transition::Applied { events } => {
            assert_eq!(events[0], DuelEvent::DefaultActionApplied { player_id: A })
        }
        other => panic!("expected applied, got {other:?}"),
    }
    assert_eq!(h.state.participants[0].hand, hand);
    assert_eq!(h.state.current_turn, Some(B));
}

#[test]
fn stale_timer_is_a_noop() {
    let mut h = Harness::new();
    h.start();
    let observed = h.state.state_version;
    h.act(A, PlayerAction::hold_all()).unwrap();

    h.elapse(ChronoDuration::seconds(120));
    let t = h
        .input(DuelInput::DeadlineElapsed {
            observed_version: observed,
        })
        .unwrap();
    assert!(matches!(t, Transition::Noop { .. }));
    assert_eq!(h.state.current_turn, Some(B));
}

#[test]
fn ready_timeout_forfeits_the_unready_side() {
    let mut h = Harness::new();
    h.act(B, PlayerAction::Ready).unwrap();
    h.elapse(ChronoDuration::seconds(31));
    let observed = h.state.state_version;
    h.input(DuelInput::DeadlineElapsed {
        observed_version: observed,
    })
    .unwrap();
    assert_eq!(
        h.state.outcome,
        Some(DuelOutcome {
            winner: Some(B),
            reason: FinishReason::ReadyTimeout
        })
    );
}

#[test]
fn ready_timeout_with_nobody_ready_is_a_draw() {
    let mut h = Harness::new();
    h.elapse(ChronoDuration::seconds(31));
    h.input(DuelInput::DeadlineElapsed {
        observed_version: 1,
    })
    .unwrap();
    assert!(h.state.is_finished());
    assert_eq!(h.state.outcome.map(|o| o.winner), Some(None));
}

#[test]
fn forfeit_awards_the_opponent() {
    let mut h = Harness::new();
    h.start();
    h.act(B, PlayerAction::Forfeit).unwrap();
    assert_eq!(
        h.state.outcome,
        Some(DuelOutcome {
            winner: Some(A),
            reason: FinishReason::Forfeit
        })
    );
    assert_eq!(
        h.act(A, PlayerAction::hold_all()).unwrap_err(),
        RuleError::Action(ActionError::DuelFinished)
    );
}

#[test]
fn disconnect_and_reconnect_leave_progress_alone() {
    let mut h = Harness::new();
    h.start();
    let phase = h.state.phase;
    let turn = h.state.current_turn;
    let deadline = h.state.turn_deadline;

    h.input(DuelInput::Disconnected { player_id: A }).unwrap();
    let p = h.state.participant(A).unwrap();
    assert_eq!(p.connection, ConnectionStatus::Disconnected);
    assert_eq!(
        p.disconnect_deadline,
        Some(h.now + ChronoDuration::seconds(20))
    );
    assert_eq!(
        (h.state.phase, h.state.current_turn, h.state.turn_deadline),
        (phase, turn, deadline)
    );

    let again = h.input(DuelInput::Disconnected { player_id: A }).unwrap();
    assert!(matches!(again, Transition::Noop { .. }));

    h.input(DuelInput::Reconnected { player_id: A }).unwrap();
    let p = h.state.participant(A).unwrap();
    assert_eq!(p.connection, ConnectionStatus::Connected);
    assert_eq!(p.disconnect_deadline, None);
    assert_eq!(
        (h.state.phase, h.state.current_turn, h.state.turn_deadline),
        (phase, turn, deadline)
    );
}

#[test]
fn grace_expiry_forfeits_unless_reconnected() {
    let mut h = Harness::new();
    h.start();
    h.input(DuelInput::Disconnected { player_id: B }).unwrap();
    let observed_deadline = h.state.participant(B).unwrap().disconnect_deadline.unwrap();

    let early = h
        .input(DuelInput::GraceExpired {
            player_id: B,
            observed_deadline,
        })
        .unwrap();
    assert!(matches!(early, Transition::Noop { .. }));

    h.elapse(ChronoDuration::seconds(21));
    h.input(DuelInput::GraceExpired {
        player_id: B,
        observed_deadline,
    })
    .unwrap();
    assert_eq!(
        h.state.outcome,
        Some(DuelOutcome {
            winner: Some(A),
            reason: FinishReason::DisconnectTimeout
        })
    );
    assert_eq!(h.state.participant(B).unwrap().disconnect_deadline, None);
}

#[test]
fn grace_expiry_after_reconnect_is_ignored() {
    let mut h = Harness::new();
    h.start();
    h.input(DuelInput::Disconnected { player_id: B }).unwrap();
    let observed_deadline = h.state.participant(B).unwrap().disconnect_deadline.unwrap();
    h.input(DuelInput::Reconnected { player_id: B }).unwrap();

    h.elapse(ChronoDuration::seconds(60));
    let t = h
        .input(DuelInput::GraceExpired {
            player_id: B,
            observed_deadline,
        })
        .unwrap();
    assert!(matches!(t, Transition::Noop { .. }));
    assert!(!h.state.is_finished());
}

#[test]
fn mulligan_keeps_the_turn_and_is_single_use() {
    let mut h = Harness::new();
    h.start();
    let before = h.state.participants[0].hand.clone();
    h.act(
        A,
        PlayerAction::Ability {
            ability: Ability::Mulligan,
        },
    )
    .unwrap();
    assert_ne!(h.state.participants[0].hand, before);
    assert_eq!(h.state.current_turn, Some(A));
    assert!(!h.state.participants[0].acted_this_round);
    assert_eq!(h.state.validate_invariants(), Ok(()));

    assert_eq!(
        h.act(
            A,
            PlayerAction::Ability {
                ability: Ability::Mulligan
            }
        )
        .unwrap_err(),
        RuleError::Action(ActionError::AbilityUsed(Ability::Mulligan))
    );
}

#[test]
fn focus_doubles_that_rounds_damage() {
    let mut h = Harness::new();
    h.start();
    h.act(
        A,
        PlayerAction::Ability {
            ability: Ability::Focus,
        },
    )
    .unwrap();
    h.act(A, PlayerAction::hold_all()).unwrap();
    h.act(B, PlayerAction::hold_all()).unwrap();

    let a_mult = evaluate_hand(&h.state.participants[0].hand)
        .unwrap()
        .multiplier;
    let b_mult = evaluate_hand(&h.state.participants[1].hand)
        .unwrap()
        .multiplier;
    h.input(DuelInput::Advance).unwrap();

    let summary = h.state.last_round.clone().unwrap();
    assert_eq!(summary.round, 1);
    assert_eq!(summary.results[0].damage, 10 * a_mult * 2);
    assert_eq!(summary.results[1].damage, 10 * b_mult);
    assert_eq!(
        h.state.participants[0].cumulative_damage_dealt,
        10 * a_mult * 2
    );
}

#[test]
fn duel_finishes_at_the_round_limit_with_higher_damage_winning() {
    let mut h = Harness::with_rules(DuelRules {
        max_rounds: 3,
        damage_threshold: u32::MAX,
        ..DuelRules::default()
    });
    h.start();
    let mut versions = vec![h.state.state_version];

    while !h.state.is_finished() {
        let turn = h.state.current_turn.unwrap();
        h.act(turn, PlayerAction::hold_all()).unwrap();
        versions.push(h.state.state_version);
        h.settle_transients();
    }

    assert!(versions.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(h.state.round, 3);
    let outcome = h.state.outcome.unwrap();
    assert_eq!(outcome.reason, FinishReason::RoundLimit);

    let [a, b] = &h.state.participants;
    let expected = match a.cumulative_damage_dealt.cmp(&b.cumulative_damage_dealt) {
        std::cmp::Ordering::Greater => Some(A),
        std::cmp::Ordering::Less => Some(B),
        std::cmp::Ordering::Equal => None,
    };
    assert_eq!(outcome.winner, expected);
    assert_eq!(h.state.validate_invariants(), Ok(()));
}

#[test]
fn damage_threshold_ends_the_duel_early() {
    let mut h = Harness::with_rules(DuelRules {
        damage_threshold: 1,
        ..DuelRules::default()
    });
    h.start();
    h.act(A, PlayerAction::hold_all()).unwrap();
    h.act(B, PlayerAction::hold_all()).unwrap();
    h.settle_transients();
    assert!(h.state.is_finished());
    assert_eq!(h.state.round, 1);
    assert_eq!(
        h.state.outcome.map(|o| o.reason),
        Some(FinishReason::DamageThreshold)
    );
}

#[test]
fn settlement_marker_requires_finish_and_is_idempotent() {
    let mut h = Harness::new();
    let settlement = Settlement {
        winner: Some(A),
        payout: 200,
    };
    assert!(matches!(
        h.input(DuelInput::MarkSettled { settlement }),
        Err(RuleError::State(StateError::InvalidTransition(_)))
    ));

    h.act(B, PlayerAction::Forfeit).unwrap();
    h.input(DuelInput::MarkSettled { settlement }).unwrap();
    assert_eq!(h.state.settlement, Some(settlement));
    let version = h.state.state_version;

    let again = h.input(DuelInput::MarkSettled { settlement }).unwrap();
    assert!(matches!(again, Transition::Noop { .. }));
    assert_eq!(h.state.state_version, version);
}

#[test]
fn idle_duel_always_terminates_through_timers() {
    let mut h = Harness::new();
    h.act(A, PlayerAction::Ready).unwrap();
    h.act(B, PlayerAction::Ready).unwrap();

    // nobody acts again; only overdue timer inputs drive the duel
    for _ in 0..100 {
        if h.state.is_finished() {
            break;
        }
        h.elapse(ChronoDuration::seconds(31));
        for input in h.state.overdue_inputs(h.now) {
            h.input(input).unwrap();
        }
    }
    assert!(h.state.is_finished());
}
