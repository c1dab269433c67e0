use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use seatlock_core::{
    holder_token, seat_lock_key, BookingError, BookingResult, IsolationLevel, LockService, PaymentOutcome,
    PaymentStatus, PendingSeat, SeatId, SeatStore, SeatTransaction, SessionId,
};

use crate::discard;

/// Result of applying one payment outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Settlement {
    pub session: SessionId,
    pub status: PaymentStatus,
    pub seats: Vec<SeatId>,
}

/// Applies webhook-delivered payment outcomes to pending seats.
///
/// A session is finalized exactly once. Replaying the webhook for a session
/// that is no longer pending yields `NotFound`, which callers treat as
/// already handled.
pub struct PaymentReconciler {
    store: Arc<dyn SeatStore>,
    locks: Arc<dyn LockService>,
}

impl PaymentReconciler {
    pub fn new(store: Arc<dyn SeatStore>, locks: Arc<dyn LockService>) -> Self {
        Self { store, locks }
    }

    pub async fn apply(&self, session: &SessionId, outcome: PaymentOutcome) -> BookingResult<Settlement> {
        let status = outcome.status();
        info!("Processing payment - SessionID: {}, Status: {}", session, status);

        let mut tx = self.store.begin(IsolationLevel::ReadCommitted).await?;
        let finalized = Self::finalize(tx.as_mut(), session, outcome).await;
        let seats = match finalized {
            Ok(seats) => seats,
            Err(err) => {
                discard(tx.as_mut(), &err).await;
                return Err(err);
            }
        };
        tx.commit().await?;

        let released = self.release_locks(&seats).await;
        info!(
            "Processed payment - SessionID: {}, Status: {}, Seats: {}, Locks released: {}",
            session,
            status,
            seats.len(),
            released
        );

        Ok(Settlement {
            session: session.clone(),
            status,
            seats: seats.into_iter().map(|seat| seat.seat_id).collect(),
        })
    }

    async fn finalize(
        tx: &mut dyn SeatTransaction,
        session: &SessionId,
        outcome: PaymentOutcome,
    ) -> BookingResult<Vec<PendingSeat>> {
        let pending = tx.pending_for_session(session).await?;
        if pending.is_empty() {
            return Err(BookingError::NotFound(session.clone()));
        }

        for seat in &pending {
            let changed = tx.finalize_if_version(seat.seat_id, seat.version, outcome).await?;
            if changed == 0 {
                warn!(
                    "Concurrent modification on seat {} (version {}) for session {}",
                    seat.seat_id, seat.version, session
                );
                return Err(BookingError::ConcurrentModification { seat_id: seat.seat_id });
            }
        }

        Ok(pending)
    }

    // The seat rows are already durable; a lock left behind only expires later.
    async fn release_locks(&self, seats: &[PendingSeat]) -> usize {
        let mut released = 0;
        for seat in seats {
            let key = seat_lock_key(seat.seat_id);
            match self.locks.release_if_held(&key, &holder_token(seat.occupant)).await {
                Ok(true) => {
                    released += 1;
                    info!("Released seat lock - SeatID: {}, UserID: {}, LockKey: {}", seat.seat_id, seat.occupant, key);
                }
                Ok(false) => debug!("No seat lock held for {} by user {}", key, seat.occupant),
                Err(e) => warn!("Failed to release seat lock {}: {}", key, e),
            }
        }
        released
    }
}
