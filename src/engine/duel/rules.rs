//! Pure transition function of the duel state machine.
//!
//! `apply` mutates a private copy of the live state; the caller commits the
//! copy with a compare-and-swap on `state_version`. Nothing here performs I/O,
//! so a timer, a socket handler and a reconciliation sweep all share one path.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rand::Rng;

use super::actions::PlayerAction;
use super::errors::{ActionError, InvariantCheck, RuleError, StateError};
use super::events::{DuelEvent, DuelInput, Transition};
use super::state::LiveDuelState;
use super::types::*;
use crate::config::DuelRules;
use crate::game::card_ranking::{evaluate_hand, shuffled_deck, Card, HAND_SIZE};

pub struct RuleContext<'a, R: Rng + ?Sized> {
    pub rules: &'a DuelRules,
    pub now: DateTime<Utc>,
    pub rng: &'a mut R,
}

/// Checks a player action against the state without touching it.
pub fn validate_action(
    state: &LiveDuelState,
    player_id: PlayerId,
    action: &PlayerAction,
) -> Result<(), ActionError> {
    let participant = state
        .participant(player_id)
        .ok_or(ActionError::NotParticipant)?;

    if state.is_finished() {
        return Err(ActionError::DuelFinished);
    }

    match action {
        PlayerAction::Forfeit => Ok(()),
        PlayerAction::Ready => {
            if state.phase != Phase::AwaitingReady {
                return Err(ActionError::WrongPhase(state.phase));
            }
            if participant.ready {
                return Err(ActionError::AlreadyReady);
            }
            Ok(())
        }
        PlayerAction::Hold { card_indices } | PlayerAction::Discard { card_indices } => {
            ensure_own_turn(state, player_id)?;
            if participant.acted_this_round {
                return Err(ActionError::AlreadyActed);
            }
            let mut seen = HashSet::new();
            for &idx in card_indices {
                if idx >= participant.hand.len() {
                    return Err(ActionError::InvalidCardIndex(idx));
                }
                if !seen.insert(idx) {
                    return Err(ActionError::DuplicateCardIndex(idx));
                }
            }
            Ok(())
        }
        PlayerAction::Ability { ability } => {
            ensure_own_turn(state, player_id)?;
            if participant.has_used(*ability) {
                return Err(ActionError::AbilityUsed(*ability));
            }
            Ok(())
        }
    }
}

fn ensure_own_turn(state: &LiveDuelState, player_id: PlayerId) -> Result<(), ActionError> {
    if state.phase != Phase::HoldDiscard {
        return Err(ActionError::WrongPhase(state.phase));
    }
    if state.current_turn != Some(player_id) {
        return Err(ActionError::NotYourTurn);
    }
    Ok(())
}

pub fn apply<R: Rng + ?Sized>(
    state: &mut LiveDuelState,
    input: &DuelInput,
    ctx: &mut RuleContext<'_, R>,
) -> Result<Transition, RuleError> {
    let transition = match input {
        DuelInput::Player { player_id, action } => {
            validate_action(state, *player_id, action)?;
            apply_player_action(state, *player_id, action, ctx)?
        }
        DuelInput::Advance => advance(state, ctx)?,
        DuelInput::DeadlineElapsed { observed_version } => {
            deadline_elapsed(state, *observed_version, ctx)?
        }
        DuelInput::Disconnected { player_id } => disconnected(state, *player_id, ctx)?,
        DuelInput::Reconnected { player_id } => reconnected(state, *player_id)?,
        DuelInput::GraceExpired {
            player_id,
            observed_deadline,
        } => grace_expired(state, *player_id, *observed_deadline, ctx)?,
        DuelInput::MarkSettled { settlement } => mark_settled(state, *settlement)?,
    };

    if let Transition::Applied { .. } = transition {
        state.updated_at = ctx.now;
        state.validate_invariants()?;
    }
    Ok(transition)
}

fn apply_player_action<R: Rng + ?Sized>(
    state: &mut LiveDuelState,
    player_id: PlayerId,
    action: &PlayerAction,
    ctx: &mut RuleContext<'_, R>,
) -> Result<Transition, RuleError> {
    if let Some(participant) = state.participant_mut(player_id) {
        participant.last_action_at = Some(ctx.now);
    }

    let events = match action {
        PlayerAction::Forfeit => {
            let winner = state.opponent_of(player_id);
            finish(state, winner, FinishReason::Forfeit)
        }
        PlayerAction::Ready => ready(state, player_id, ctx),
        PlayerAction::Hold { card_indices } => {
            let held: Vec<usize> = card_indices.clone();
            hold_discard(state, player_id, held, ctx)?
        }
        PlayerAction::Discard { card_indices } => {
            let hand_len = state
                .participant(player_id)
                .map(|p| p.hand.len())
                .unwrap_or(HAND_SIZE);
            let held: Vec<usize> = (0..hand_len)
                .filter(|idx| !card_indices.contains(idx))
                .collect();
            hold_discard(state, player_id, held, ctx)?
        }
        PlayerAction::Ability { ability } => use_ability(state, player_id, *ability)?,
    };
    Ok(Transition::applied(events))
}

fn ready<R: Rng + ?Sized>(
    state: &mut LiveDuelState,
    player_id: PlayerId,
    ctx: &mut RuleContext<'_, R>,
) -> Vec<DuelEvent> {
    let mut events = vec![DuelEvent::PlayerReady { player_id }];
    if let Some(participant) = state.participant_mut(player_id) {
        participant.ready = true;
    }
    if state.participants.iter().all(|p| p.ready) {
        state.phase = Phase::Draw;
        state.turn_deadline = Some(ctx.now);
    }
    events
}

fn draw_cards(deck: &mut Vec<Card>, count: usize) -> Result<Vec<Card>, StateError> {
    if deck.len() < count {
        return Err(StateError::DeckExhausted);
    }
    Ok(deck.drain(..count).collect())
}

fn hold_discard<R: Rng + ?Sized>(
    state: &mut LiveDuelState,
    player_id: PlayerId,
    mut held: Vec<usize>,
    ctx: &mut RuleContext<'_, R>,
) -> Result<Vec<DuelEvent>, RuleError> {
    held.sort_unstable();
    held.dedup();

    let idx = state
        .index_of(player_id)
        .ok_or(ActionError::NotParticipant)?;
    let hand_len = state.participants[idx].hand.len();
    let replaced = hand_len - held.len();
    let mut fresh = draw_cards(&mut state.deck, replaced)?.into_iter();

    let participant = &mut state.participants[idx];
    for slot in 0..hand_len {
        if !held.contains(&slot) {
            if let Some(card) = fresh.next() {
                participant.hand[slot] = card;
            }
        }
    }
    participant.held_card_indices = held;
    participant.acted_this_round = true;

    let mut events = vec![DuelEvent::CardsReplaced {
        player_id,
        replaced,
    }];
    events.extend(pass_turn(state, player_id, ctx));
    Ok(events)
}

/// Hands the turn to the other participant, or closes the round once both acted.
fn pass_turn<R: Rng + ?Sized>(
    state: &mut LiveDuelState,
    player_id: PlayerId,
    ctx: &mut RuleContext<'_, R>,
) -> Vec<DuelEvent> {
    let next = state
        .participants
        .iter()
        .find(|p| p.player_id != player_id && !p.acted_this_round)
        .map(|p| p.player_id);

    match next {
        Some(to) => {
            state.current_turn = Some(to);
            state.turn_deadline = Some(deadline_after(ctx.now, ctx.rules.turn_timeout));
            vec![DuelEvent::TurnPassed { to }]
        }
        None => {
            state.current_turn = None;
            state.phase = Phase::ResolveRound;
            state.turn_deadline = Some(ctx.now);
            Vec::new()
        }
    }
}

fn use_ability(
    state: &mut LiveDuelState,
    player_id: PlayerId,
    ability: Ability,
) -> Result<Vec<DuelEvent>, RuleError> {
    let idx = state
        .index_of(player_id)
        .ok_or(ActionError::NotParticipant)?;
    match ability {
        Ability::Mulligan => {
            let fresh = draw_cards(&mut state.deck, HAND_SIZE)?;
            state.participants[idx].hand = fresh;
        }
        Ability::Focus => {
            state.participants[idx].focus_round = Some(state.round);
        }
    }
    state.participants[idx].abilities_used.push(ability);
    Ok(vec![DuelEvent::AbilityUsed { player_id, ability }])
}

fn advance<R: Rng + ?Sized>(
    state: &mut LiveDuelState,
    ctx: &mut RuleContext<'_, R>,
) -> Result<Transition, RuleError> {
    match state.phase {
        Phase::Draw => Ok(Transition::applied(deal(state, ctx)?)),
        Phase::ResolveRound => Ok(Transition::applied(resolve_round(state, ctx)?)),
        _ => Ok(Transition::Noop {
            reason: "phase does not advance on its own",
        }),
    }
}

fn deal<R: Rng + ?Sized>(
    state: &mut LiveDuelState,
    ctx: &mut RuleContext<'_, R>,
) -> Result<Vec<DuelEvent>, RuleError> {
    state.deck = shuffled_deck(ctx.rng);
    for idx in 0..state.participants.len() {
        let hand = draw_cards(&mut state.deck, HAND_SIZE)?;
        let participant = &mut state.participants[idx];
        participant.hand = hand;
        participant.held_card_indices.clear();
        participant.acted_this_round = false;
    }
    let starter = state.round_starter();
    state.phase = Phase::HoldDiscard;
    state.current_turn = Some(starter);
    state.turn_deadline = Some(deadline_after(ctx.now, ctx.rules.turn_timeout));
    Ok(vec![
        DuelEvent::Dealt { round: state.round },
        DuelEvent::TurnPassed { to: starter },
    ])
}

fn resolve_round<R: Rng + ?Sized>(
    state: &mut LiveDuelState,
    ctx: &mut RuleContext<'_, R>,
) -> Result<Vec<DuelEvent>, RuleError> {
    let mut results = Vec::with_capacity(state.participants.len());
    for participant in &state.participants {
        let evaluation = evaluate_hand(&participant.hand).map_err(StateError::from)?;
        let focus = if participant.focus_round == Some(state.round) {
            2
        } else {
            1
        };
        results.push(RoundResult {
            player_id: participant.player_id,
            category: evaluation.category,
            damage: ctx.rules.base_damage * evaluation.multiplier * focus,
        });
    }
    for (participant, result) in state.participants.iter_mut().zip(&results) {
        participant.cumulative_damage_dealt =
            participant.cumulative_damage_dealt.saturating_add(result.damage);
    }

    let summary = RoundSummary {
        round: state.round,
        results,
    };
    state.last_round = Some(summary.clone());
    let mut events = vec![DuelEvent::RoundResolved(summary)];

    let threshold_met = state
        .participants
        .iter()
        .any(|p| p.cumulative_damage_dealt >= ctx.rules.damage_threshold);

    if threshold_met || state.round >= state.max_rounds {
        let [a, b] = &state.participants;
        let winner = match a.cumulative_damage_dealt.cmp(&b.cumulative_damage_dealt) {
            std::cmp::Ordering::Greater => Some(a.player_id),
            std::cmp::Ordering::Less => Some(b.player_id),
            std::cmp::Ordering::Equal => None,
        };
        let reason = if threshold_met {
            FinishReason::DamageThreshold
        } else {
            FinishReason::RoundLimit
        };
        events.extend(finish(state, winner, reason));
    } else {
        state.round += 1;
        state.phase = Phase::Draw;
        state.turn_deadline = Some(ctx.now);
    }
    Ok(events)
}

fn deadline_elapsed<R: Rng + ?Sized>(
    state: &mut LiveDuelState,
    observed_version: StateVersion,
    ctx: &mut RuleContext<'_, R>,
) -> Result<Transition, RuleError> {
    if state.state_version != observed_version {
        return Ok(Transition::Noop {
            reason: "timer observed an older version",
        });
    }
    match state.turn_deadline {
        Some(deadline) if deadline <= ctx.now => {}
        _ => {
            return Ok(Transition::Noop {
                reason: "deadline not reached",
            })
        }
    }

    match state.phase {
        Phase::AwaitingReady => {
            let unready: Vec<PlayerId> = state
                .participants
                .iter()
                .filter(|p| !p.ready)
                .map(|p| p.player_id)
                .collect();
            let winner = match unready.as_slice() {
                [absent] => state.opponent_of(*absent),
                _ => None,
            };
            Ok(Transition::applied(finish(
                state,
                winner,
                FinishReason::ReadyTimeout,
            )))
        }
        Phase::HoldDiscard => {
            let Some(player_id) = state.current_turn else {
                return Err(StateError::InvalidTransition("hold/discard without a turn").into());
            };
            let mut events = vec![DuelEvent::DefaultActionApplied { player_id }];
            let held = (0..HAND_SIZE).collect();
            events.extend(hold_discard(state, player_id, held, ctx)?);
            Ok(Transition::applied(events))
        }
        Phase::Draw | Phase::ResolveRound => advance(state, ctx),
        Phase::Finished => Ok(Transition::Noop {
            reason: "duel already finished",
        }),
    }
}

fn disconnected<R: Rng + ?Sized>(
    state: &mut LiveDuelState,
    player_id: PlayerId,
    ctx: &mut RuleContext<'_, R>,
) -> Result<Transition, RuleError> {
    if state.is_finished() {
        return Ok(Transition::Noop {
            reason: "duel already finished",
        });
    }
    let participant = state
        .participant_mut(player_id)
        .ok_or(ActionError::NotParticipant)?;
    if participant.connection == ConnectionStatus::Disconnected {
        return Ok(Transition::Noop {
            reason: "already disconnected",
        });
    }
    let deadline = deadline_after(ctx.now, ctx.rules.reconnect_grace);
    participant.connection = ConnectionStatus::Disconnected;
    participant.disconnect_deadline = Some(deadline);
    Ok(Transition::applied(vec![
        DuelEvent::ParticipantDisconnected {
            player_id,
            deadline,
        },
    ]))
}

fn reconnected(state: &mut LiveDuelState, player_id: PlayerId) -> Result<Transition, RuleError> {
    let participant = state
        .participant_mut(player_id)
        .ok_or(ActionError::NotParticipant)?;
    if participant.connection == ConnectionStatus::Connected {
        return Ok(Transition::Noop {
            reason: "already connected",
        });
    }
    participant.connection = ConnectionStatus::Connected;
    participant.disconnect_deadline = None;
    Ok(Transition::applied(vec![
        DuelEvent::ParticipantReconnected { player_id },
    ]))
}

fn grace_expired<R: Rng + ?Sized>(
    state: &mut LiveDuelState,
    player_id: PlayerId,
    observed_deadline: DateTime<Utc>,
    ctx: &mut RuleContext<'_, R>,
) -> Result<Transition, RuleError> {
    if state.is_finished() {
        return Ok(Transition::Noop {
            reason: "duel already finished",
        });
    }
    let participant = state
        .participant(player_id)
        .ok_or(ActionError::NotParticipant)?;
    if participant.disconnect_deadline != Some(observed_deadline) {
        return Ok(Transition::Noop {
            reason: "participant reconnected",
        });
    }
    if observed_deadline > ctx.now {
        return Ok(Transition::Noop {
            reason: "grace period still running",
        });
    }
    let winner = state.opponent_of(player_id);
    Ok(Transition::applied(finish(
        state,
        winner,
        FinishReason::DisconnectTimeout,
    )))
}

fn mark_settled(
    state: &mut LiveDuelState,
    settlement: Settlement,
) -> Result<Transition, RuleError> {
    if !state.is_finished() {
        return Err(StateError::InvalidTransition("settlement before finish").into());
    }
    if state.settlement.is_some() {
        return Ok(Transition::Noop {
            reason: "already settled",
        });
    }
    state.settlement = Some(settlement);
    Ok(Transition::applied(vec![DuelEvent::Settled(settlement)]))
}

fn finish(
    state: &mut LiveDuelState,
    winner: Option<PlayerId>,
    reason: FinishReason,
) -> Vec<DuelEvent> {
    let outcome = DuelOutcome { winner, reason };
    state.phase = Phase::Finished;
    state.current_turn = None;
    state.turn_deadline = None;
    for participant in state.participants.iter_mut() {
        participant.disconnect_deadline = None;
    }
    state.outcome = Some(outcome);
    vec![DuelEvent::Finished(outcome)]
}
