use std::sync::Arc;

use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::middleware;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;

use crate::engine::duel::{DuelId, PlayerId};
use crate::game::challenge::{ChallengeId, ChallengeNegotiator};
use crate::game::coordinator::{DuelCoordinator, DuelRuntime};
use crate::game::monitor::DisconnectMonitor;

use super::dto::{
    AccountResponse, ChallengeAnswerRequest, ChallengeResponse, DuelStartedResponse, DuelView,
    HealthResponse, HistoryQuery, HistoryResponse, ProposeChallengeRequest, StateQuery,
};
use super::error::ApiError;
use super::logging::log_requests;
use super::rooms::RoomRegistry;
use super::ws::duel_ws;

pub const DEFAULT_HISTORY_PAGE_SIZE: u64 = 20;

/// Everything a request handler or socket session needs, shared through an
/// `Extension` layer.
#[derive(Clone)]
pub struct ServerContext {
    pub coordinator: Arc<DuelCoordinator>,
    pub negotiator: Arc<ChallengeNegotiator>,
    pub monitor: Arc<DisconnectMonitor>,
    pub rooms: Arc<RoomRegistry>,
}

impl ServerContext {
    pub fn from_runtime(runtime: &DuelRuntime, rooms: Arc<RoomRegistry>) -> Self {
        Self {
            coordinator: runtime.coordinator(),
            negotiator: runtime.negotiator(),
            monitor: runtime.monitor(),
            rooms,
        }
    }
}

pub struct DuelServer {
    router: Router,
}

impl DuelServer {
    pub fn new(context: Arc<ServerContext>) -> Self {
        let router = Router::new()
            .route("/health", get(health))
            .route("/challenges", post(propose_challenge))
            .route("/challenges/:request_id/accept", post(accept_challenge))
            .route("/challenges/:request_id/decline", post(decline_challenge))
            .route("/players/:player_id/challenges", get(pending_challenges))
            .route("/players/:player_id/duels", get(duel_history))
            .route("/players/:player_id/account", get(player_account))
            .route("/duels/:duel_id/state", get(duel_state))
            .route("/ws", get(duel_ws))
            .layer(
                ServiceBuilder::new()
                    .layer(middleware::from_fn(log_requests))
                    .layer(CorsLayer::permissive())
                    .layer(Extension(context)),
            );

        Self { router }
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn into_router(self) -> Router {
        self.router
    }
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn propose_challenge(
    Extension(ctx): Extension<Arc<ServerContext>>,
    Json(body): Json<ProposeChallengeRequest>,
) -> Result<(StatusCode, Json<ChallengeResponse>), ApiError> {
    let request = ctx
        .negotiator
        .propose(body.challenger, body.target, body.wager)
        .await?;
    Ok((StatusCode::CREATED, Json(request.into())))
}

async fn accept_challenge(
    Extension(ctx): Extension<Arc<ServerContext>>,
    Path(request_id): Path<ChallengeId>,
    Json(body): Json<ChallengeAnswerRequest>,
) -> Result<Json<DuelStartedResponse>, ApiError> {
    let state = ctx.negotiator.accept(request_id, body.player_id).await?;
    let view = DuelView::for_player(&state, body.player_id)
        .ok_or_else(|| ApiError::internal("accepted duel does not include the accepting player"))?;
    Ok(Json(DuelStartedResponse {
        duel_id: state.duel_id,
        state: view,
    }))
}

async fn decline_challenge(
    Extension(ctx): Extension<Arc<ServerContext>>,
    Path(request_id): Path<ChallengeId>,
    Json(body): Json<ChallengeAnswerRequest>,
) -> Result<Json<ChallengeResponse>, ApiError> {
    let request = ctx.negotiator.decline(request_id, body.player_id).await?;
    Ok(Json(request.into()))
}

async fn pending_challenges(
    Extension(ctx): Extension<Arc<ServerContext>>,
    Path(player_id): Path<PlayerId>,
) -> Result<Json<Vec<ChallengeResponse>>, ApiError> {
    let pending = ctx.negotiator.pending_for(player_id).await?;
    Ok(Json(
        pending.into_iter().map(ChallengeResponse::from).collect(),
    ))
}

async fn duel_history(
    Extension(ctx): Extension<Arc<ServerContext>>,
    Path(player_id): Path<PlayerId>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let page = ctx
        .coordinator
        .ledger()
        .history(
            player_id,
            query.page.unwrap_or(1),
            query.per_page.unwrap_or(DEFAULT_HISTORY_PAGE_SIZE),
        )
        .await?;
    Ok(Json(HistoryResponse::from_page(page, player_id)))
}

async fn player_account(
    Extension(ctx): Extension<Arc<ServerContext>>,
    Path(player_id): Path<PlayerId>,
) -> Result<Json<AccountResponse>, ApiError> {
    let account = ctx.coordinator.ledger().account(player_id).await?;
    Ok(Json(account.into()))
}

async fn duel_state(
    Extension(ctx): Extension<Arc<ServerContext>>,
    Path(duel_id): Path<DuelId>,
    Query(query): Query<StateQuery>,
) -> Result<Json<DuelView>, ApiError> {
    let state = ctx.coordinator.load(duel_id).await?;
    DuelView::for_player(&state, query.player_id)
        .map(Json)
        .ok_or_else(|| ApiError::forbidden("not a participant of this duel"))
}
