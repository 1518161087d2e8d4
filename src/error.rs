use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the messaging core.
///
/// Validation errors are terminal: they are returned to the caller
/// immediately and never retried. `Store` errors may be transient
/// (`SQLITE_BUSY`, pool exhaustion, I/O) in which case the write paths retry
/// them a bounded number of times before giving up.
#[derive(Debug, Error)]
pub enum CourierError {
    #[error("a conversation requires two distinct participants")]
    InvalidParticipants,

    #[error("message content is empty")]
    EmptyMessage,

    #[error("display name is empty")]
    EmptyDisplayName,

    #[error("user {0} is not a participant of this conversation")]
    NotAParticipant(Uuid),

    #[error("conversation {0} not found")]
    ConversationNotFound(Uuid),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

impl CourierError {
    /// Whether retrying the failed operation could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(err) => match err {
                // SQLITE_BUSY (5) and SQLITE_LOCKED (6)
                sqlx::Error::Database(db) => matches!(db.code().as_deref(), Some("5") | Some("6")),
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
                _ => false,
            },
            _ => false,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidParticipants | Self::EmptyMessage | Self::EmptyDisplayName => {
                StatusCode::BAD_REQUEST
            }
            Self::NotAParticipant(_) => StatusCode::FORBIDDEN,
            Self::ConversationNotFound(_) => StatusCode::NOT_FOUND,
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for CourierError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("request failed: {self}");
        }
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(
            CourierError::InvalidParticipants.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            CourierError::EmptyMessage.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            CourierError::EmptyDisplayName.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            CourierError::NotAParticipant(Uuid::new_v4()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            CourierError::ConversationNotFound(Uuid::new_v4()).status_code(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_validation_errors_are_not_transient() {
        assert!(!CourierError::InvalidParticipants.is_transient());
        assert!(!CourierError::EmptyMessage.is_transient());
        assert!(!CourierError::EmptyDisplayName.is_transient());
        assert!(!CourierError::NotAParticipant(Uuid::new_v4()).is_transient());
        assert!(!CourierError::ConversationNotFound(Uuid::new_v4()).is_transient());
    }

    #[test]
    fn test_row_not_found_is_not_transient() {
        assert!(!CourierError::Store(sqlx::Error::RowNotFound).is_transient());
    }

    #[test]
    fn test_pool_timeout_is_transient() {
        assert!(CourierError::Store(sqlx::Error::PoolTimedOut).is_transient());
    }
}
