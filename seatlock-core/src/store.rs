use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{Hold, PaymentOutcome, SeatId, SessionId, SessionStatus, ShowId, UserId};
use crate::StoreResult;

/// Isolation level a transaction is opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadCommitted,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// A pending seat captured by the payment reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSeat {
    pub seat_id: SeatId,
    pub occupant: UserId,
    pub version: i64,
}

/// A pending seat whose payment deadline has passed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredSeat {
    pub seat_id: SeatId,
    pub show_id: ShowId,
    pub occupant: Option<UserId>,
}

/// Transactional storage of seat rows.
#[async_trait]
pub trait SeatStore: Send + Sync {
    async fn begin(&self, isolation: IsolationLevel) -> StoreResult<Box<dyn SeatTransaction>>;

    /// Aggregated payment status of every seat carrying `session`.
    async fn session_status(&self, session: &SessionId) -> StoreResult<SessionStatus>;

}

/// One open transaction against the seat store.
///
/// Every write reports the number of rows it changed so callers can detect a
/// lost race. Dropping a transaction that was neither committed nor rolled
/// back discards its writes.
#[async_trait]
pub trait SeatTransaction: Send {
    /// Exclusively locks the bookable rows among `ids` for `show`, waiting for
    /// contending writers, and returns the ids actually locked.
    ///
    /// Under `Serializable`, a row changed by a writer that committed while this
    /// transaction waited yields `StoreError::SerializationConflict`.
    async fn lock_bookable(&mut self, show: ShowId, ids: &[SeatId]) -> StoreResult<Vec<SeatId>>;

    /// Reads the versions of the bookable rows among `ids` without locking.
    async fn bookable_versions(&mut self, show: ShowId, ids: &[SeatId]) -> StoreResult<Vec<(SeatId, i64)>>;

    async fn reserve_all(&mut self, ids: &[SeatId], hold: &Hold) -> StoreResult<u64>;

    /// Reserves `id` only if its version is still `expected_version` and it is still bookable.
    async fn reserve_if_version(&mut self, id: SeatId, expected_version: i64, hold: &Hold) -> StoreResult<u64>;

    async fn pending_for_session(&mut self, session: &SessionId) -> StoreResult<Vec<PendingSeat>>;

    async fn finalize_if_version(
        &mut self,
        id: SeatId,
        expected_version: i64,
        outcome: PaymentOutcome,
    ) -> StoreResult<u64>;

    /// Locks and returns every pending seat whose deadline is before `now`.
    /// Fails with `SerializationConflict` like `lock_bookable`.
    async fn expired_pending(&mut self, now: DateTime<Utc>) -> StoreResult<Vec<ExpiredSeat>>;

    /// Clears an expired hold back to a bookable failed seat, if still pending.
    async fn release_expired(&mut self, id: SeatId) -> StoreResult<u64>;

    async fn commit(&mut self) -> StoreResult<()>;

    async fn rollback(&mut self) -> StoreResult<()>;
}
