use std::sync::Arc;
use tracing::info;

use seatlock_core::{
    BookingResult, LockService, LockStrategy, Reservation, ReservationRequest, SeatStore, SessionId, SessionStatus,
};

use crate::reservation::{DistributedLockBooker, HoldSettings, OptimisticLocker, PessimisticLocker};

/// Routes each booking request to exactly one locker.
///
/// There is no state shared between strategies and no fallback from one to
/// another: the request's method alone decides which locker runs.
pub struct BookingCoordinator {
    store: Arc<dyn SeatStore>,
    pessimistic: PessimisticLocker,
    optimistic: OptimisticLocker,
    distributed: DistributedLockBooker,
}

impl BookingCoordinator {
    pub fn new(store: Arc<dyn SeatStore>, locks: Arc<dyn LockService>, settings: HoldSettings) -> Self {
        Self {
            pessimistic: PessimisticLocker::pessimistic(store.clone(), settings.clone()),
            optimistic: OptimisticLocker::optimistic(store.clone(), settings.clone()),
            distributed: DistributedLockBooker::distributed(store.clone(), locks, settings),
            store,
        }
    }

    /// Books with the strategy named by `method`; an unknown name fails before
    /// the store is touched.
    pub async fn book(&self, method: &str, request: &ReservationRequest) -> BookingResult<Reservation> {
        let strategy: LockStrategy = method.parse()?;
        self.book_with(strategy, request).await
    }

    pub async fn book_with(&self, strategy: LockStrategy, request: &ReservationRequest) -> BookingResult<Reservation> {
        info!("Dispatching booking {} to {} locker", request.session, strategy);
        match strategy {
            LockStrategy::Pessimistic => self.pessimistic.reserve(request).await,
            LockStrategy::Optimistic => self.optimistic.reserve(request).await,
            LockStrategy::Distributed => self.distributed.reserve(request).await,
        }
    }

    /// Least-advanced payment status across the session's seats.
    pub async fn status(&self, session: &SessionId) -> BookingResult<SessionStatus> {
        Ok(self.store.session_status(session).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seatlock_core::{BookingError, MemoryLockService, MemorySeatStore, PaymentStatus, SeatId, ShowId, UserId};

    fn coordinator(store: &MemorySeatStore) -> BookingCoordinator {
        BookingCoordinator::new(
            Arc::new(store.clone()),
            Arc::new(MemoryLockService::new()),
            HoldSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_unknown_method_is_invalid_input() {
        let store = MemorySeatStore::new();
        store.provision(ShowId(1), [1]);
        let coordinator = coordinator(&store);

        let req = ReservationRequest::new(UserId(1), ShowId(1), vec![SeatId(1)], SessionId::generate(UserId(1)));
        let err = coordinator.book("first-come", &req).await.unwrap_err();
        assert!(matches!(err, BookingError::InvalidInput(_)));
        assert_eq!(store.get(SeatId(1)).unwrap().version, 0);
    }

    #[tokio::test]
    async fn test_each_method_reaches_its_locker() {
        let store = MemorySeatStore::new();
        store.provision(ShowId(1), [1, 2, 3]);
        let coordinator = coordinator(&store);

        for (method, seat, expected) in [
            ("pessimistic", 1, LockStrategy::Pessimistic),
            ("optimistic", 2, LockStrategy::Optimistic),
            ("current", 3, LockStrategy::Distributed),
        ] {
            let req = ReservationRequest::new(UserId(5), ShowId(1), vec![SeatId(seat)], SessionId::generate(UserId(5)));
            let reservation = coordinator.book(method, &req).await.unwrap();
            assert_eq!(reservation.strategy, expected);
            assert_eq!(
                coordinator.status(&req.session).await.unwrap(),
                SessionStatus::Found(PaymentStatus::Pending)
            );
        }
    }

    #[tokio::test]
    async fn test_unknown_session_status() {
        let store = MemorySeatStore::new();
        let coordinator = coordinator(&store);
        let status = coordinator.status(&SessionId::from("book_missing")).await.unwrap();
        assert_eq!(status, SessionStatus::NotFound);
    }
}
