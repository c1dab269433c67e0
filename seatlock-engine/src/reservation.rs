//! Seat reservation: one transaction skeleton shared by every strategy.
//!
//! A reservation validates its input, lets the policy admit it, opens a
//! transaction at the policy's isolation level, asks the policy for the
//! candidate rows, checks that every requested seat is a candidate, writes the
//! hold and commits. Any failure rolls the transaction back, so a multi-seat
//! request either holds every seat or none of them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use seatlock_core::{
    holder_token, seat_lock_key, BookingError, BookingResult, Hold, IsolationLevel, LockService, LockStrategy,
    Reservation, ReservationRequest, SeatId, SeatStore, SeatTransaction, StoreError,
};

use crate::discard;

/// Hold parameters applied to every reservation.
#[derive(Debug, Clone)]
pub struct HoldSettings {
    /// How long a pending seat waits for payment before the sweeper reclaims it.
    pub hold_window: chrono::Duration,
    /// Lifetime of the external seat lock taken by the distributed booker.
    pub lock_ttl: Duration,
    pub payment_gateway_url: String,
}

impl Default for HoldSettings {
    fn default() -> Self {
        Self {
            hold_window: chrono::Duration::minutes(1),
            lock_ttl: Duration::from_secs(60),
            payment_gateway_url: "https://payment-gateway.example.com/pay".to_string(),
        }
    }
}

impl HoldSettings {
    pub fn redirect_url(&self, request: &ReservationRequest) -> String {
        format!("{}/{}", self.payment_gateway_url.trim_end_matches('/'), request.session)
    }

    pub fn hold_for(&self, request: &ReservationRequest, now: DateTime<Utc>) -> Hold {
        Hold {
            occupant: request.user_id,
            session: request.session.clone(),
            redirect_url: self.redirect_url(request),
            deadline: now + self.hold_window,
        }
    }
}

/// Rows a policy found eligible for the hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidates {
    /// Rows already exclusively locked by the transaction.
    Locked(Vec<SeatId>),
    /// Unlocked rows with the version each was read at.
    Versioned(Vec<(SeatId, i64)>),
}

impl Candidates {
    pub fn len(&self) -> usize {
        match self {
            Candidates::Locked(ids) => ids.len(),
            Candidates::Versioned(versions) => versions.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How a strategy keeps concurrent reservations of the same seat apart.
#[async_trait]
pub trait ConflictPolicy: Send + Sync {
    fn strategy(&self) -> LockStrategy;

    fn isolation(&self) -> IsolationLevel;

    /// Runs before any transaction is opened.
    async fn admit(&self, _request: &ReservationRequest) -> BookingResult<()> {
        Ok(())
    }

    /// Undoes `admit` after the reservation itself failed.
    async fn abandon(&self, _request: &ReservationRequest) {}

    async fn candidates(
        &self,
        tx: &mut dyn SeatTransaction,
        request: &ReservationRequest,
    ) -> BookingResult<Candidates>;
}

/// A row taken by a concurrent writer while we waited for its lock surfaces
/// as a serialization conflict; to the caller that seat is simply unavailable.
async fn locked_candidates(tx: &mut dyn SeatTransaction, request: &ReservationRequest) -> BookingResult<Candidates> {
    let locked = match tx.lock_bookable(request.show_id, &request.seat_ids).await {
        Ok(locked) => locked,
        Err(StoreError::SerializationConflict) => {
            info!(
                "Seats {:?} changed by a concurrent booking while user {} waited",
                request.seat_ids, request.user_id
            );
            Vec::new()
        }
        Err(e) => return Err(e.into()),
    };
    debug!("Locked {}/{} seats for user {}", locked.len(), request.seat_ids.len(), request.user_id);
    Ok(Candidates::Locked(locked))
}

/// Exclusive row locks under serializable isolation; contenders wait.
#[derive(Debug, Clone, Copy, Default)]
pub struct RowLockPolicy;

#[async_trait]
impl ConflictPolicy for RowLockPolicy {
    fn strategy(&self) -> LockStrategy {
        LockStrategy::Pessimistic
    }

    fn isolation(&self) -> IsolationLevel {
        IsolationLevel::Serializable
    }

    async fn candidates(
        &self,
        tx: &mut dyn SeatTransaction,
        request: &ReservationRequest,
    ) -> BookingResult<Candidates> {
        locked_candidates(tx, request).await
    }
}

/// Unlocked version reads followed by per-seat conditional writes.
#[derive(Debug, Clone, Copy, Default)]
pub struct VersionCheckPolicy;

#[async_trait]
impl ConflictPolicy for VersionCheckPolicy {
    fn strategy(&self) -> LockStrategy {
        LockStrategy::Optimistic
    }

    fn isolation(&self) -> IsolationLevel {
        IsolationLevel::ReadCommitted
    }

    async fn candidates(
        &self,
        tx: &mut dyn SeatTransaction,
        request: &ReservationRequest,
    ) -> BookingResult<Candidates> {
        let versions: HashMap<SeatId, i64> = tx
            .bookable_versions(request.show_id, &request.seat_ids)
            .await?
            .into_iter()
            .collect();

        // Write in request order.
        let ordered = request
            .seat_ids
            .iter()
            .filter_map(|id| versions.get(id).map(|version| (*id, *version)))
            .collect();
        Ok(Candidates::Versioned(ordered))
    }
}

/// External set-if-absent lock on the request's first seat, then the
/// row-lock path as a second check.
///
/// Only the first seat is locked externally; the other seats of a multi-seat
/// request are guarded by the row-lock re-check alone. On success the lock
/// is left in place as a soft hold until it expires or the payment is
/// reconciled.
pub struct ExternalMutexPolicy {
    locks: Arc<dyn LockService>,
    ttl: Duration,
}

impl ExternalMutexPolicy {
    pub fn new(locks: Arc<dyn LockService>, ttl: Duration) -> Self {
        Self { locks, ttl }
    }

    fn lock_key(request: &ReservationRequest) -> Option<String> {
        request.seat_ids.first().map(|seat| seat_lock_key(*seat))
    }
}

#[async_trait]
impl ConflictPolicy for ExternalMutexPolicy {
    fn strategy(&self) -> LockStrategy {
        LockStrategy::Distributed
    }

    fn isolation(&self) -> IsolationLevel {
        IsolationLevel::Serializable
    }

    async fn admit(&self, request: &ReservationRequest) -> BookingResult<()> {
        let key = Self::lock_key(request)
            .ok_or_else(|| BookingError::InvalidInput("no seat IDs provided".to_string()))?;
        let holder = holder_token(request.user_id);

        if self.locks.try_acquire(&key, &holder, self.ttl).await? {
            info!("Acquired seat lock {} for user {}", key, request.user_id);
            return Ok(());
        }

        let current = match self.locks.holder(&key).await {
            Ok(current) => current,
            Err(e) => {
                warn!("Could not read holder of {}: {}", key, e);
                None
            }
        };
        info!("Seat lock {} is held by {:?}, rejecting user {}", key, current, request.user_id);
        Err(BookingError::LockContention { key, holder: current })
    }

    async fn abandon(&self, request: &ReservationRequest) {
        let Some(key) = Self::lock_key(request) else {
            return;
        };
        match self.locks.release_if_held(&key, &holder_token(request.user_id)).await {
            Ok(released) => debug!("Released seat lock {} after failed reservation: {}", key, released),
            Err(e) => warn!("Failed to release seat lock {}: {}", key, e),
        }
    }

    async fn candidates(
        &self,
        tx: &mut dyn SeatTransaction,
        request: &ReservationRequest,
    ) -> BookingResult<Candidates> {
        locked_candidates(tx, request).await
    }
}

/// Reserves a seat set all-or-nothing using conflict policy `P`.
pub struct SeatLocker<P> {
    store: Arc<dyn SeatStore>,
    policy: P,
    settings: HoldSettings,
}

pub type PessimisticLocker = SeatLocker<RowLockPolicy>;
pub type OptimisticLocker = SeatLocker<VersionCheckPolicy>;
pub type DistributedLockBooker = SeatLocker<ExternalMutexPolicy>;

impl SeatLocker<RowLockPolicy> {
    pub fn pessimistic(store: Arc<dyn SeatStore>, settings: HoldSettings) -> Self {
        Self::new(store, RowLockPolicy, settings)
    }
}

impl SeatLocker<VersionCheckPolicy> {
    pub fn optimistic(store: Arc<dyn SeatStore>, settings: HoldSettings) -> Self {
        Self::new(store, VersionCheckPolicy, settings)
    }
}

impl SeatLocker<ExternalMutexPolicy> {
    pub fn distributed(store: Arc<dyn SeatStore>, locks: Arc<dyn LockService>, settings: HoldSettings) -> Self {
        let policy = ExternalMutexPolicy::new(locks, settings.lock_ttl);
        Self::new(store, policy, settings)
    }
}

impl<P: ConflictPolicy> SeatLocker<P> {
    pub fn new(store: Arc<dyn SeatStore>, policy: P, settings: HoldSettings) -> Self {
        Self { store, policy, settings }
    }

    pub fn strategy(&self) -> LockStrategy {
        self.policy.strategy()
    }

    pub async fn reserve(&self, request: &ReservationRequest) -> BookingResult<Reservation> {
        request.validate()?;
        let strategy = self.policy.strategy();
        info!(
            "Starting {} reservation - UserID: {}, Seats: {:?}, SessionID: {}",
            strategy, request.user_id, request.seat_ids, request.session
        );

        self.policy.admit(request).await?;

        let hold = self.settings.hold_for(request, Utc::now());
        if let Err(err) = self.hold_seats(request, &hold).await {
            warn!(
                "{} reservation failed - UserID: {}, SessionID: {}, Error: {}",
                strategy, request.user_id, request.session, err
            );
            self.policy.abandon(request).await;
            return Err(err);
        }

        info!(
            "{} reservation pending payment - UserID: {}, SessionID: {}",
            strategy, request.user_id, request.session
        );
        Ok(Reservation {
            session: hold.session,
            seat_ids: request.seat_ids.clone(),
            strategy,
            redirect_url: hold.redirect_url,
            deadline: hold.deadline,
        })
    }

    async fn hold_seats(&self, request: &ReservationRequest, hold: &Hold) -> BookingResult<()> {
        let mut tx = self.store.begin(self.policy.isolation()).await?;

        let claimed = self.claim(tx.as_mut(), request, hold).await;
        if let Err(err) = claimed {
            discard(tx.as_mut(), &err).await;
            return Err(err);
        }

        tx.commit().await?;
        Ok(())
    }

    async fn claim(&self, tx: &mut dyn SeatTransaction, request: &ReservationRequest, hold: &Hold) -> BookingResult<()> {
        let requested = request.seat_ids.len();
        let candidates = self.policy.candidates(&mut *tx, request).await?;
        if candidates.len() != requested {
            return Err(BookingError::SeatsUnavailable {
                requested,
                available: candidates.len(),
            });
        }

        match candidates {
            Candidates::Locked(ids) => {
                let changed = tx.reserve_all(&ids, hold).await? as usize;
                if changed != requested {
                    return Err(BookingError::SeatsUnavailable {
                        requested,
                        available: changed,
                    });
                }
            }
            Candidates::Versioned(versions) => {
                for (seat_id, version) in versions {
                    if tx.reserve_if_version(seat_id, version, hold).await? == 0 {
                        return Err(BookingError::OptimisticConflict { seat_id });
                    }
                }
            }
        }

        Ok(())
    }
}
