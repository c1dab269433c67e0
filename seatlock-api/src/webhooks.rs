use axum::{extract::State, routing::post, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::AppError;
use crate::state::AppState;
use seatlock_core::{PaymentOutcome, SessionId};

#[derive(Debug, Deserialize)]
pub struct PaymentWebhook {
    pub session_id: String,
    pub status: String,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/webhook/payment", post(handle_payment_webhook))
}

/// POST /webhook/payment
/// Receives the terminal payment outcome for a booking session.
async fn handle_payment_webhook(
    State(state): State<AppState>,
    Json(payload): Json<PaymentWebhook>,
) -> Result<Json<Value>, AppError> {
    tracing::info!("Received payment webhook for session {}: {}", payload.session_id, payload.status);

    let outcome: PaymentOutcome = payload.status.parse()?;
    let session = SessionId(payload.session_id);
    let settlement = state.reconciler.apply(&session, outcome).await?;

    tracing::info!(
        "Session {} settled as {} for seats {:?}",
        settlement.session,
        settlement.status,
        settlement.seats
    );
    Ok(Json(json!({ "status": "success" })))
}
