use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::AppError;
use crate::state::AppState;
use seatlock_core::{PaymentStatus, ReservationRequest, SeatId, SessionId, SessionStatus, ShowId, UserId};

#[derive(Debug, Deserialize)]
pub struct BookRequest {
    pub user_id: i64,
    pub show_id: i64,
    pub seat_ids: Vec<i64>,
    pub method: String,
}

#[derive(Debug, Serialize)]
pub struct BookingResponse {
    pub booking_id: SessionId,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_redirect_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub booking_id: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/book", post(book_seats))
        .route("/api/booking-status", get(booking_status))
}

/// POST /api/book
/// Places a pending hold on the requested seats with the chosen method.
async fn book_seats(State(state): State<AppState>, Json(req): Json<BookRequest>) -> Response {
    let user = UserId(req.user_id);
    let booking_id = SessionId::generate(user);
    info!(
        "Booking request - BookingID: {}, UserID: {}, ShowID: {}, Seats: {:?}, Method: {}",
        booking_id, req.user_id, req.show_id, req.seat_ids, req.method
    );

    let request = ReservationRequest::new(
        user,
        ShowId(req.show_id),
        req.seat_ids.into_iter().map(SeatId).collect(),
        booking_id.clone(),
    );

    match state.coordinator.book(&req.method, &request).await {
        Ok(reservation) => {
            info!("Booking pending payment - BookingID: {}", booking_id);
            let body = BookingResponse {
                booking_id,
                status: PaymentStatus::Pending.as_str(),
                payment_redirect_url: Some(reservation.redirect_url),
                error: None,
            };
            (StatusCode::ACCEPTED, Json(body)).into_response()
        }
        Err(err) => {
            warn!("Booking failed - BookingID: {}, UserID: {}, Error: {}", booking_id, req.user_id, err);
            let err = AppError::from(err);
            let body = BookingResponse {
                booking_id,
                status: PaymentStatus::Failed.as_str(),
                payment_redirect_url: None,
                error: Some(err.public_message()),
            };
            (err.status_code(), Json(body)).into_response()
        }
    }
}

/// GET /api/booking-status?booking_id=...
async fn booking_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<BookingResponse>, AppError> {
    let booking_id = query
        .booking_id
        .filter(|id| !id.is_empty())
        .map(SessionId)
        .ok_or_else(|| AppError::ValidationError("Booking ID is required".to_string()))?;

    match state.coordinator.status(&booking_id).await? {
        SessionStatus::NotFound => Err(AppError::NotFoundError("Booking not found".to_string())),
        SessionStatus::Found(status) => {
            info!("Status for BookingID {}: {}", booking_id, status);
            Ok(Json(BookingResponse {
                booking_id,
                status: status.as_str(),
                payment_redirect_url: None,
                error: None,
            }))
        }
    }
}
