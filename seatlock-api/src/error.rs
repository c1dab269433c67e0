use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use seatlock_core::BookingError;
use serde_json::json;

#[derive(Debug)]
pub enum AppError {
    ValidationError(String),
    NotFoundError(String),
    ConflictError(String),
    InternalServerError(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::NotFoundError(_) => StatusCode::NOT_FOUND,
            AppError::ConflictError(_) => StatusCode::CONFLICT,
            AppError::InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to return to the caller. Internal failures are logged and
    /// replaced with a generic message.
    pub fn public_message(&self) -> String {
        match self {
            AppError::ValidationError(msg) | AppError::NotFoundError(msg) | AppError::ConflictError(msg) => {
                msg.clone()
            }
            AppError::InternalServerError(msg) => {
                tracing::error!("Internal Server Error: {}", msg);
                "Internal Server Error".to_string()
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.public_message(),
        }));

        (status, body).into_response()
    }
}

impl From<BookingError> for AppError {
    fn from(err: BookingError) -> Self {
        let msg = err.to_string();
        match err {
            BookingError::InvalidInput(_) => AppError::ValidationError(msg),
            BookingError::NotFound(_) => AppError::NotFoundError(msg),
            BookingError::SeatsUnavailable { .. }
            | BookingError::OptimisticConflict { .. }
            | BookingError::LockContention { .. }
            | BookingError::ConcurrentModification { .. } => AppError::ConflictError(msg),
            BookingError::TransactionError(_) => AppError::InternalServerError(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seatlock_core::{SeatId, SessionId, StoreError};

    #[test]
    fn test_booking_error_status_codes() {
        let cases = [
            (BookingError::InvalidInput("x".into()), StatusCode::BAD_REQUEST),
            (BookingError::NotFound(SessionId::from("s")), StatusCode::NOT_FOUND),
            (BookingError::OptimisticConflict { seat_id: SeatId(1) }, StatusCode::CONFLICT),
            (BookingError::ConcurrentModification { seat_id: SeatId(1) }, StatusCode::CONFLICT),
            (BookingError::TransactionError(StoreError::Finished), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(AppError::from(err).status_code(), expected);
        }
    }

    #[test]
    fn test_internal_details_are_hidden() {
        let err = AppError::from(BookingError::TransactionError(StoreError::Finished));
        assert_eq!(err.public_message(), "Internal Server Error");
    }
}
