use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

use crate::game::challenge::ChallengeError;
use crate::game::error::{ledger_code, DuelError};
use crate::ledger::LedgerError;

const LOG_TARGET: &str = "server::error";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: &'a str,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "not_participant", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        let status = match &err {
            LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
            LedgerError::Conflict(_) | LedgerError::InvalidState { .. } => StatusCode::CONFLICT,
            LedgerError::Validation(_) | LedgerError::InsufficientBalance { .. } => {
                StatusCode::BAD_REQUEST
            }
            LedgerError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, ledger_code(&err), err.to_string())
    }
}

impl From<DuelError> for ApiError {
    fn from(err: DuelError) -> Self {
        let status = match err {
            DuelError::Ledger(inner) => return inner.into(),
            DuelError::Action(_) => StatusCode::BAD_REQUEST,
            DuelError::StateLost(_) => StatusCode::NOT_FOUND,
            DuelError::Contention { .. } => StatusCode::CONFLICT,
            DuelError::Cache(_) => StatusCode::SERVICE_UNAVAILABLE,
            DuelError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.code(), err.to_string())
    }
}

impl From<ChallengeError> for ApiError {
    fn from(err: ChallengeError) -> Self {
        let status = match err {
            ChallengeError::Ledger(inner) => return inner.into(),
            ChallengeError::Duel(inner) => return inner.into(),
            ChallengeError::Cache(inner) => return DuelError::Cache(inner).into(),
            ChallengeError::SelfChallenge
            | ChallengeError::WagerTooSmall { .. }
            | ChallengeError::WagerAboveLimit { .. }
            | ChallengeError::LevelGap { .. }
            | ChallengeError::InsufficientBalance { .. } => StatusCode::BAD_REQUEST,
            ChallengeError::Busy(_) | ChallengeError::Expired(_) => StatusCode::CONFLICT,
            ChallengeError::NotFound(_) => StatusCode::NOT_FOUND,
            ChallengeError::NotTarget => StatusCode::FORBIDDEN,
        };
        Self::new(status, err.code(), err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(
                target = LOG_TARGET,
                status = self.status.as_u16(),
                code = self.code,
                message = %self.message,
                "request failed"
            );
        }
        let body = Json(ErrorBody {
            code: self.code,
            message: &self.message,
        });
        (self.status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::duel::ActionError;
    use uuid::Uuid;

    #[test]
    fn statuses_follow_the_error_kind() {
        let err = ApiError::from(DuelError::Action(ActionError::NotYourTurn));
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.code, "not_your_turn");

        let err = ApiError::from(DuelError::StateLost(Uuid::new_v4()));
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let err = ApiError::from(ChallengeError::Busy(4));
        assert_eq!((err.status, err.code), (StatusCode::CONFLICT, "player_busy"));

        let err = ApiError::from(ChallengeError::Ledger(LedgerError::InsufficientBalance {
            player_id: 1,
            available: 10,
            required: 50,
        }));
        assert_eq!(
            (err.status, err.code),
            (StatusCode::BAD_REQUEST, "insufficient_balance")
        );

        let err = ApiError::from(ChallengeError::NotTarget);
        assert_eq!(err.status, StatusCode::FORBIDDEN);
    }
}
