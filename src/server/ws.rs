//! Per-player WebSocket session.
//!
//! Inbound frames become negotiator or coordinator calls; failures go back to
//! this socket only as `duel.error`. Outbound traffic arrives through the
//! room registry, fed by the fanout.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::Query;
use axum::response::Response;
use axum::Extension;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::engine::duel::{LiveDuelState, PlayerId};
use crate::ledger::DuelStatus;
use crate::tokio_tools::spawn_named_task;

use super::dto::DuelView;
use super::error::ApiError;
use super::protocol::{ClientMessage, ServerMessage};
use super::routes::ServerContext;

const LOG_TARGET: &str = "server::ws";

pub const OUTBOUND_CAPACITY: usize = 64;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub player_id: PlayerId,
}

pub async fn duel_ws(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    Extension(ctx): Extension<Arc<ServerContext>>,
) -> Result<Response, ApiError> {
    // unknown players never get a socket
    ctx.coordinator.ledger().account(query.player_id).await?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, ctx, query.player_id)))
}

async fn handle_socket(socket: WebSocket, ctx: Arc<ServerContext>, player_id: PlayerId) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(OUTBOUND_CAPACITY);
    let connection_id = ctx.rooms.register(player_id, tx.clone());
    info!(target = LOG_TARGET, player_id, connection_id, "socket opened");

    let writer = spawn_named_task(format!("ws-writer-{player_id}-{connection_id}"), async move {
        while let Some(message) = rx.recv().await {
            let payload = match serde_json::to_string(&message) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(target = LOG_TARGET, player_id, error = %err, "failed to encode message");
                    continue;
                }
            };
            if sink.send(Message::Text(payload)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    resume(&ctx, player_id, &tx).await;

    while let Some(received) = stream.next().await {
        match received {
            Ok(Message::Text(text)) => handle_text(&ctx, player_id, &tx, &text).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(target = LOG_TARGET, player_id, error = %err, "socket read failed");
                break;
            }
        }
    }

    let last = ctx.rooms.unregister(player_id, connection_id);
    drop(tx);
    writer.abort();
    info!(target = LOG_TARGET, player_id, connection_id, "socket closed");
    if last {
        mark_disconnected(&ctx, player_id).await;
    }
}

fn reply(tx: &mpsc::Sender<ServerMessage>, message: ServerMessage) {
    if let Err(err) = tx.try_send(message) {
        debug!(target = LOG_TARGET, error = %err, "reply dropped");
    }
}

fn send_view(tx: &mpsc::Sender<ServerMessage>, state: &LiveDuelState, player_id: PlayerId) {
    if let Some(view) = DuelView::for_player(state, player_id) {
        reply(tx, ServerMessage::State(view));
    }
}

/// Replays what a fresh socket missed: open challenges and the running duel.
async fn resume(ctx: &ServerContext, player_id: PlayerId, tx: &mpsc::Sender<ServerMessage>) {
    match ctx.negotiator.pending_for(player_id).await {
        Ok(pending) => {
            for request in pending {
                reply(tx, ServerMessage::ChallengeReceived { request });
            }
        }
        Err(err) => {
            warn!(target = LOG_TARGET, player_id, error = %err, "pending challenge lookup failed");
        }
    }

    let record = match ctx.coordinator.ledger().open_duel_for(player_id).await {
        Ok(Some(record)) if record.status == DuelStatus::Active => record,
        Ok(_) => return,
        Err(err) => {
            warn!(target = LOG_TARGET, player_id, error = %err, "open duel lookup failed");
            return;
        }
    };

    match ctx.monitor.participant_reconnected(record.id, player_id).await {
        Ok(outcome) => {
            let state = outcome.into_state();
            if state.settlement.is_none() {
                ctx.rooms
                    .join(state.duel_id, state.player_ids(), state.state_version);
            }
            send_view(tx, &state, player_id);
        }
        Err(err) => {
            let err = ApiError::from(err);
            reply(tx, ServerMessage::error(err.code, err.message, Some(record.id)));
        }
    }
}

async fn mark_disconnected(ctx: &ServerContext, player_id: PlayerId) {
    match ctx.coordinator.ledger().open_duel_for(player_id).await {
        Ok(Some(record)) if record.status == DuelStatus::Active => {
            if let Err(err) = ctx.monitor.participant_disconnected(record.id, player_id).await {
                warn!(
                    target = LOG_TARGET,
                    duel_id = %record.id,
                    player_id,
                    error = %err,
                    "failed to record disconnect"
                );
            }
        }
        Ok(_) => {}
        Err(err) => {
            warn!(target = LOG_TARGET, player_id, error = %err, "open duel lookup failed");
        }
    }
}

async fn handle_text(
    ctx: &ServerContext,
    player_id: PlayerId,
    tx: &mpsc::Sender<ServerMessage>,
    text: &str,
) {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(err) => {
            reply(tx, ServerMessage::error("malformed", err.to_string(), None));
            return;
        }
    };
    let duel_id = message.duel_id();
    if let Err(err) = dispatch(ctx, player_id, tx, message).await {
        debug!(
            target = LOG_TARGET,
            player_id,
            code = err.code,
            message = %err.message,
            "client message rejected"
        );
        reply(tx, ServerMessage::error(err.code, err.message, duel_id));
    }
}

async fn dispatch(
    ctx: &ServerContext,
    player_id: PlayerId,
    tx: &mpsc::Sender<ServerMessage>,
    message: ClientMessage,
) -> Result<(), ApiError> {
    match message {
        ClientMessage::ProposeChallenge { target, wager } => {
            ctx.negotiator.propose(player_id, target, wager).await?;
        }
        ClientMessage::AcceptChallenge { request_id } => {
            ctx.negotiator.accept(request_id, player_id).await?;
        }
        ClientMessage::DeclineChallenge { request_id } => {
            ctx.negotiator.decline(request_id, player_id).await?;
        }
        ClientMessage::Sync { duel_id } => {
            let state = ctx.coordinator.load(duel_id).await?;
            if state.index_of(player_id).is_none() {
                return Err(ApiError::forbidden("not a participant of this duel"));
            }
            send_view(tx, &state, player_id);
        }
        other => {
            if let Some((duel_id, action)) = other.duel_action() {
                ctx.coordinator
                    .submit_action(duel_id, player_id, action)
                    .await?;
            }
        }
    }
    Ok(())
}
