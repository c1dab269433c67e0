use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use seatlock_core::{
    BookingError, Hold, IsolationLevel, LockService, MemoryLockService, MemorySeatStore, PaymentOutcome, PaymentStatus,
    ReservationRequest, SeatId, SeatState, SeatStore, SessionId, SessionStatus, ShowId, UserId,
};
use seatlock_engine::{BookingCoordinator, HoldSettings, PaymentReconciler, TimeoutSweeper};

const SHOW: ShowId = ShowId(1);

struct Harness {
    store: MemorySeatStore,
    locks: Arc<MemoryLockService>,
    coordinator: Arc<BookingCoordinator>,
    reconciler: PaymentReconciler,
    sweeper: TimeoutSweeper,
}

fn harness(seats: &[i64]) -> Harness {
    let store = MemorySeatStore::with_lock_wait(Duration::from_secs(2));
    store.provision(SHOW, seats.iter().copied());
    let locks = Arc::new(MemoryLockService::new());

    Harness {
        coordinator: Arc::new(BookingCoordinator::new(
            Arc::new(store.clone()),
            locks.clone(),
            HoldSettings::default(),
        )),
        reconciler: PaymentReconciler::new(Arc::new(store.clone()), locks.clone()),
        sweeper: TimeoutSweeper::new(Arc::new(store.clone()), locks.clone(), Duration::from_secs(60)),
        store,
        locks,
    }
}

fn request(user: i64, seats: &[i64]) -> ReservationRequest {
    ReservationRequest::new(
        UserId(user),
        SHOW,
        seats.iter().copied().map(SeatId).collect(),
        SessionId::generate(UserId(user)),
    )
}

fn foreign_hold(user: i64) -> Hold {
    Hold {
        occupant: UserId(user),
        session: SessionId::generate(UserId(user)),
        redirect_url: "https://pay.test/other".to_string(),
        deadline: Utc::now() + chrono::Duration::minutes(1),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overlapping_pessimistic_requests_have_one_winner() {
    let h = harness(&[1, 2, 3]);

    let mut tasks = Vec::new();
    for user in 1..=8 {
        let coordinator = h.coordinator.clone();
        tasks.push(tokio::spawn(async move {
            let req = request(user, &[1, 2]);
            coordinator.book("pessimistic", &req).await.map(|_| req)
        }));
    }

    let mut winners = Vec::new();
    for task in tasks {
        match task.await.unwrap() {
            Ok(req) => winners.push(req),
            Err(err) => assert!(matches!(err, BookingError::SeatsUnavailable { .. }), "unexpected error: {err}"),
        }
    }

    assert_eq!(winners.len(), 1);
    let winner = &winners[0];
    for id in [1, 2] {
        let seat = h.store.get(SeatId(id)).unwrap();
        assert_eq!(seat.version, 1);
        assert_eq!(seat.state.session(), Some(&winner.session));
    }
    assert!(h.store.get(SeatId(3)).unwrap().is_bookable());
}

#[tokio::test]
async fn test_optimistic_reservation_bumps_versions() {
    let h = harness(&[1, 2]);
    let req = request(10, &[1, 2]);

    h.coordinator.book("optimistic", &req).await.unwrap();

    for id in [1, 2] {
        let seat = h.store.get(SeatId(id)).unwrap();
        assert_eq!(seat.version, 1);
        assert!(matches!(seat.state, SeatState::Pending { occupant: UserId(10), .. }));
    }
    assert_eq!(
        h.coordinator.status(&req.session).await.unwrap(),
        SessionStatus::Found(PaymentStatus::Pending)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_optimistic_loser_leaves_row_untouched() {
    let h = harness(&[1, 2]);

    // A competing writer holds seat 2 with an uncommitted reservation.
    let mut rival = h.store.begin(IsolationLevel::ReadCommitted).await.unwrap();
    assert_eq!(rival.reserve_if_version(SeatId(2), 0, &foreign_hold(20)).await.unwrap(), 1);

    let coordinator = h.coordinator.clone();
    let contender = tokio::spawn(async move { coordinator.book("optimistic", &request(21, &[2])).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    rival.commit().await.unwrap();

    let err = contender.await.unwrap().unwrap_err();
    assert!(
        matches!(err, BookingError::OptimisticConflict { seat_id: SeatId(2) }),
        "unexpected error: {err}"
    );

    let seat = h.store.get(SeatId(2)).unwrap();
    assert_eq!(seat.version, 1);
    assert_eq!(seat.state.occupant(), Some(UserId(20)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_optimistic_conflict_on_one_seat_reserves_none() {
    let h = harness(&[1, 2]);

    let mut rival = h.store.begin(IsolationLevel::ReadCommitted).await.unwrap();
    assert_eq!(rival.reserve_if_version(SeatId(2), 0, &foreign_hold(22)).await.unwrap(), 1);

    let coordinator = h.coordinator.clone();
    let req = request(23, &[1, 2]);
    let session = req.session.clone();
    let contender = tokio::spawn(async move { coordinator.book("optimistic", &req).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!contender.is_finished());
    rival.commit().await.unwrap();

    let err = contender.await.unwrap().unwrap_err();
    assert!(
        matches!(err, BookingError::OptimisticConflict { seat_id: SeatId(2) }),
        "unexpected error: {err}"
    );

    let first = h.store.get(SeatId(1)).unwrap();
    assert!(first.is_bookable());
    assert_eq!(first.version, 0);
    let second = h.store.get(SeatId(2)).unwrap();
    assert_eq!(second.version, 1);
    assert_eq!(second.state.occupant(), Some(UserId(22)));
    assert_eq!(h.coordinator.status(&session).await.unwrap(), SessionStatus::NotFound);
}

#[tokio::test]
async fn test_partial_availability_reserves_nothing() {
    let h = harness(&[1, 2]);
    let mut taken = h.store.get(SeatId(2)).unwrap();
    taken.state = SeatState::Confirmed { session: SessionId::from("earlier"), occupant: UserId(30) };
    taken.version = 2;
    h.store.put(taken);

    for method in ["pessimistic", "optimistic", "current"] {
        let req = request(31, &[1, 2]);
        let err = h.coordinator.book(method, &req).await.unwrap_err();
        assert!(matches!(err, BookingError::SeatsUnavailable { requested: 2, available: 1 }));

        let seat = h.store.get(SeatId(1)).unwrap();
        assert!(seat.is_bookable());
        assert_eq!(seat.version, 0);
        assert_eq!(h.coordinator.status(&req.session).await.unwrap(), SessionStatus::NotFound);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pessimistic_contender_waits_for_row_lock() {
    let h = harness(&[5]);

    let mut first = h.store.begin(IsolationLevel::Serializable).await.unwrap();
    let locked = first.lock_bookable(SHOW, &[SeatId(5)]).await.unwrap();
    assert_eq!(first.reserve_all(&locked, &foreign_hold(40)).await.unwrap(), 1);

    let coordinator = h.coordinator.clone();
    let second = tokio::spawn(async move { coordinator.book("pessimistic", &request(41, &[5])).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!second.is_finished());

    first.commit().await.unwrap();
    let err = second.await.unwrap().unwrap_err();
    assert!(matches!(err, BookingError::SeatsUnavailable { requested: 1, available: 0 }));
    assert_eq!(h.store.get(SeatId(5)).unwrap().state.occupant(), Some(UserId(40)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mixed_strategies_never_double_book() {
    let h = harness(&[7]);

    let mut tasks = Vec::new();
    for (user, method) in [(50, "pessimistic"), (51, "optimistic"), (52, "current"), (53, "optimistic")] {
        let coordinator = h.coordinator.clone();
        tasks.push(tokio::spawn(async move {
            let req = request(user, &[7]);
            coordinator.book(method, &req).await.map(|_| req)
        }));
    }

    let mut sessions = Vec::new();
    for task in tasks {
        if let Ok(req) = task.await.unwrap() {
            sessions.push(req.session);
        }
    }
    assert_eq!(sessions.len(), 1);

    let mut confirmed = 0;
    for session in &sessions {
        if h.reconciler.apply(session, PaymentOutcome::Confirmed).await.is_ok() {
            confirmed += 1;
        }
    }
    assert_eq!(confirmed, 1);
    assert!(matches!(h.store.get(SeatId(7)).unwrap().state, SeatState::Confirmed { .. }));
}

#[tokio::test]
async fn test_repeated_webhook_is_idempotent() {
    let h = harness(&[1, 2]);
    let req = request(60, &[1, 2]);
    h.coordinator.book("current", &req).await.unwrap();

    let settlement = h.reconciler.apply(&req.session, PaymentOutcome::Confirmed).await.unwrap();
    assert_eq!(settlement.status, PaymentStatus::Completed);
    let after_first = [h.store.get(SeatId(1)).unwrap(), h.store.get(SeatId(2)).unwrap()];

    let err = h.reconciler.apply(&req.session, PaymentOutcome::Confirmed).await.unwrap_err();
    assert!(matches!(err, BookingError::NotFound(_)));
    assert_eq!([h.store.get(SeatId(1)).unwrap(), h.store.get(SeatId(2)).unwrap()], after_first);
    assert_eq!(
        h.coordinator.status(&req.session).await.unwrap(),
        SessionStatus::Found(PaymentStatus::Completed)
    );
}

#[tokio::test]
async fn test_failed_payment_frees_seats_for_rebooking() {
    let h = harness(&[3]);
    let first = request(70, &[3]);
    h.coordinator.book("pessimistic", &first).await.unwrap();
    h.reconciler.apply(&first.session, PaymentOutcome::Failed).await.unwrap();
    assert_eq!(
        h.coordinator.status(&first.session).await.unwrap(),
        SessionStatus::Found(PaymentStatus::Failed)
    );

    let second = request(71, &[3]);
    h.coordinator.book("optimistic", &second).await.unwrap();
    let seat = h.store.get(SeatId(3)).unwrap();
    assert_eq!(seat.version, 3);
    assert_eq!(seat.state.occupant(), Some(UserId(71)));
}

#[tokio::test]
async fn test_expired_hold_is_reclaimed_before_late_payment() {
    let h = harness(&[8, 9]);
    let req = request(80, &[8, 9]);
    h.coordinator.book("current", &req).await.unwrap();

    let report = h
        .sweeper
        .sweep_at(Utc::now() + chrono::Duration::minutes(2))
        .await
        .unwrap();
    assert_eq!(report.reclaimed, vec![SeatId(8), SeatId(9)]);
    assert_eq!(h.locks.holder("seat_lock:8").await.unwrap(), None);

    let err = h.reconciler.apply(&req.session, PaymentOutcome::Confirmed).await.unwrap_err();
    assert!(matches!(err, BookingError::NotFound(_)));
    for id in [8, 9] {
        let seat = h.store.get(SeatId(id)).unwrap();
        assert!(seat.is_bookable());
        assert_eq!(seat.state.occupant(), None);
    }

    // reclaimed seats are bookable again
    h.coordinator.book("current", &request(81, &[8, 9])).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_payment_racing_sweep_loses_version_check() {
    let h = harness(&[1]);
    let req = request(85, &[1]);
    h.coordinator.book("pessimistic", &req).await.unwrap();

    // An in-flight sweep has already reset the row but not committed.
    let mut sweep = h.store.begin(IsolationLevel::Serializable).await.unwrap();
    let expired = sweep.expired_pending(Utc::now() + chrono::Duration::minutes(2)).await.unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(sweep.release_expired(SeatId(1)).await.unwrap(), 1);

    let reconciler = PaymentReconciler::new(Arc::new(h.store.clone()), h.locks.clone());
    let session = req.session.clone();
    let payment = tokio::spawn(async move { reconciler.apply(&session, PaymentOutcome::Confirmed).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!payment.is_finished());
    sweep.commit().await.unwrap();

    let err = payment.await.unwrap().unwrap_err();
    assert!(
        matches!(err, BookingError::ConcurrentModification { seat_id: SeatId(1) }),
        "unexpected error: {err}"
    );

    let seat = h.store.get(SeatId(1)).unwrap();
    assert_eq!(seat.state, SeatState::Failed { session: None, occupant: None });
    assert_eq!(seat.version, 2);
}

#[tokio::test]
async fn test_confirmed_booking_survives_later_sweep() {
    let h = harness(&[4]);
    let req = request(90, &[4]);
    h.coordinator.book("optimistic", &req).await.unwrap();
    h.reconciler.apply(&req.session, PaymentOutcome::Confirmed).await.unwrap();

    let report = h
        .sweeper
        .sweep_at(Utc::now() + chrono::Duration::hours(1))
        .await
        .unwrap();
    assert!(report.reclaimed.is_empty());
    assert!(matches!(
        h.store.get(SeatId(4)).unwrap().state,
        SeatState::Confirmed { occupant: UserId(90), .. }
    ));
}

#[tokio::test]
async fn test_distributed_lock_blocks_second_booker() {
    let h = harness(&[6]);
    h.coordinator.book("current", &request(100, &[6])).await.unwrap();

    let err = h.coordinator.book("current", &request(101, &[6])).await.unwrap_err();
    match err {
        BookingError::LockContention { key, holder } => {
            assert_eq!(key, "seat_lock:6");
            assert_eq!(holder.as_deref(), Some("user:100"));
        }
        other => panic!("unexpected error: {other}"),
    }
}
