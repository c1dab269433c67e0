//! In-process seat store with row locks and per-transaction write sets.
//!
//! Writes are buffered in the transaction and applied on commit. Rows touched
//! by a locking select or a write stay locked by that transaction until it
//! commits or rolls back; other transactions wanting those rows wait, up to
//! the configured lock wait. Reads see committed rows overlaid with the
//! transaction's own writes. A serializable transaction that waited for a row
//! lock fails with `SerializationConflict` if the row changed meanwhile, as
//! Postgres does for `SELECT ... FOR UPDATE`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::model::{Hold, PaymentOutcome, Seat, SeatId, SeatState, SessionId, SessionStatus, ShowId};
use crate::store::{ExpiredSeat, IsolationLevel, PendingSeat, SeatStore, SeatTransaction};
use crate::{StoreError, StoreResult};

const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Table {
    seats: BTreeMap<SeatId, Seat>,
    row_locks: HashMap<SeatId, u64>,
}

struct Shared {
    table: Mutex<Table>,
    released: Notify,
    next_tx: AtomicU64,
    lock_wait: Duration,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release_locks(&self, tx_id: u64) {
        self.table().row_locks.retain(|_, owner| *owner != tx_id);
        self.released.notify_waiters();
    }
}

#[derive(Clone)]
pub struct MemorySeatStore {
    shared: Arc<Shared>,
}

impl MemorySeatStore {
    pub fn new() -> Self {
        Self::with_lock_wait(DEFAULT_LOCK_WAIT)
    }

    /// A store whose row-lock waits give up after `lock_wait`.
    pub fn with_lock_wait(lock_wait: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                table: Mutex::new(Table::default()),
                released: Notify::new(),
                next_tx: AtomicU64::new(1),
                lock_wait,
            }),
        }
    }

    /// Inserts or replaces a seat row as committed state.
    pub fn put(&self, seat: Seat) {
        self.shared.table().seats.insert(seat.id, seat);
    }

    /// Provisions available seats `ids` for `show`.
    pub fn provision(&self, show: ShowId, ids: impl IntoIterator<Item = i64>) {
        let mut table = self.shared.table();
        for id in ids {
            let seat = Seat::available(SeatId(id), show, format!("S{}", id));
            table.seats.insert(seat.id, seat);
        }
    }

    /// Committed copy of a seat row.
    pub fn get(&self, id: SeatId) -> Option<Seat> {
        self.shared.table().seats.get(&id).cloned()
    }
}

impl Default for MemorySeatStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SeatStore for MemorySeatStore {
    async fn begin(&self, isolation: IsolationLevel) -> StoreResult<Box<dyn SeatTransaction>> {
        let id = self.shared.next_tx.fetch_add(1, Ordering::Relaxed);
        debug!("memory tx {} opened at {}", id, isolation.as_sql());
        Ok(Box::new(MemoryTransaction {
            id,
            isolation,
            shared: Arc::clone(&self.shared),
            writes: BTreeMap::new(),
            locked: BTreeSet::new(),
            finished: false,
        }))
    }

    async fn session_status(&self, session: &SessionId) -> StoreResult<SessionStatus> {
        let table = self.shared.table();
        let statuses = table
            .seats
            .values()
            .filter(|seat| seat.state.session() == Some(session))
            .filter_map(|seat| seat.state.payment_status());
        Ok(SessionStatus::aggregate(statuses))
    }
}

pub struct MemoryTransaction {
    id: u64,
    isolation: IsolationLevel,
    shared: Arc<Shared>,
    writes: BTreeMap<SeatId, Seat>,
    locked: BTreeSet<SeatId>,
    finished: bool,
}

impl MemoryTransaction {
    fn ensure_open(&self) -> StoreResult<()> {
        if self.finished {
            return Err(StoreError::Finished);
        }
        Ok(())
    }

    fn view(&self, table: &Table, id: SeatId) -> Option<Seat> {
        self.writes.get(&id).or_else(|| table.seats.get(&id)).cloned()
    }

    fn visible(&self, table: &Table) -> Vec<Seat> {
        table
            .seats
            .keys()
            .filter_map(|id| self.view(table, *id))
            .collect()
    }

    /// Waits until none of `ids` is locked by another transaction, then locks
    /// and returns those whose current row satisfies `keep`.
    async fn acquire<F>(&mut self, ids: &[SeatId], keep: F) -> StoreResult<Vec<Seat>>
    where
        F: Fn(&Seat) -> bool + Send,
    {
        let shared = Arc::clone(&self.shared);
        let deadline = Instant::now() + shared.lock_wait;
        // Row versions seen when this transaction first had to wait.
        let mut before_wait: Option<HashMap<SeatId, i64>> = None;

        loop {
            let released = shared.released.notified();
            let blocked_on = {
                let mut table = shared.table();
                let blocked = ids
                    .iter()
                    .copied()
                    .find(|id| table.row_locks.get(id).is_some_and(|owner| *owner != self.id));

                if blocked.is_none() {
                    if let Some(seen) = &before_wait {
                        let changed = ids.iter().any(|id| {
                            self.view(&table, *id).map(|seat| seat.version) != seen.get(id).copied()
                        });
                        if changed && self.isolation == IsolationLevel::Serializable {
                            return Err(StoreError::SerializationConflict);
                        }
                    }

                    let mut granted = Vec::new();
                    for id in ids {
                        if let Some(seat) = self.view(&table, *id).filter(|seat| keep(seat)) {
                            table.row_locks.insert(*id, self.id);
                            self.locked.insert(*id);
                            granted.push(seat);
                        }
                    }
                    return Ok(granted);
                }
                if before_wait.is_none() {
                    before_wait = Some(
                        ids.iter()
                            .filter_map(|id| self.view(&table, *id).map(|seat| (*id, seat.version)))
                            .collect(),
                    );
                }
                blocked
            };

            if let Some(seat_id) = blocked_on {
                debug!("memory tx {} waiting for row lock on seat {}", self.id, seat_id);
                if tokio::time::timeout_at(deadline, released).await.is_err() {
                    return Err(StoreError::LockTimeout(seat_id));
                }
            }
        }
    }

    fn stage(&mut self, seat: Seat) {
        self.writes.insert(seat.id, seat);
    }
}

#[async_trait]
impl SeatTransaction for MemoryTransaction {
    async fn lock_bookable(&mut self, show: ShowId, ids: &[SeatId]) -> StoreResult<Vec<SeatId>> {
        self.ensure_open()?;
        let seats = self
            .acquire(ids, |seat| seat.show_id == show && seat.is_bookable())
            .await?;
        Ok(seats.into_iter().map(|seat| seat.id).collect())
    }

    async fn bookable_versions(&mut self, show: ShowId, ids: &[SeatId]) -> StoreResult<Vec<(SeatId, i64)>> {
        self.ensure_open()?;
        let table = self.shared.table();
        Ok(ids
            .iter()
            .filter_map(|id| self.view(&table, *id))
            .filter(|seat| seat.show_id == show && seat.is_bookable())
            .map(|seat| (seat.id, seat.version))
            .collect())
    }

    async fn reserve_all(&mut self, ids: &[SeatId], hold: &Hold) -> StoreResult<u64> {
        self.ensure_open()?;
        let seats = self.acquire(ids, Seat::is_bookable).await?;
        let changed = seats.len() as u64;
        for mut seat in seats {
            seat.apply_hold(hold);
            self.stage(seat);
        }
        Ok(changed)
    }

    async fn reserve_if_version(&mut self, id: SeatId, expected_version: i64, hold: &Hold) -> StoreResult<u64> {
        self.ensure_open()?;
        let seats = self
            .acquire(&[id], |seat| seat.version == expected_version && seat.is_bookable())
            .await?;
        let changed = seats.len() as u64;
        for mut seat in seats {
            seat.apply_hold(hold);
            self.stage(seat);
        }
        Ok(changed)
    }

    async fn pending_for_session(&mut self, session: &SessionId) -> StoreResult<Vec<PendingSeat>> {
        self.ensure_open()?;
        let table = self.shared.table();
        Ok(self
            .visible(&table)
            .into_iter()
            .filter_map(|seat| match seat.state {
                SeatState::Pending {
                    session: ref held,
                    occupant,
                    ..
                } if held == session => Some(PendingSeat {
                    seat_id: seat.id,
                    occupant,
                    version: seat.version,
                }),
                _ => None,
            })
            .collect())
    }

    async fn finalize_if_version(
        &mut self,
        id: SeatId,
        expected_version: i64,
        outcome: PaymentOutcome,
    ) -> StoreResult<u64> {
        self.ensure_open()?;
        let seats = self.acquire(&[id], |seat| seat.version == expected_version).await?;
        let changed = seats.len() as u64;
        for mut seat in seats {
            seat.apply_outcome(outcome);
            self.stage(seat);
        }
        Ok(changed)
    }

    async fn expired_pending(&mut self, now: DateTime<Utc>) -> StoreResult<Vec<ExpiredSeat>> {
        self.ensure_open()?;
        let is_expired = move |seat: &Seat| seat.state.deadline().is_some_and(|deadline| deadline < now);
        let candidates: Vec<SeatId> = {
            let table = self.shared.table();
            self.visible(&table)
                .into_iter()
                .filter(|seat| is_expired(seat))
                .map(|seat| seat.id)
                .collect()
        };

        let seats = self.acquire(&candidates, is_expired).await?;
        Ok(seats
            .into_iter()
            .map(|seat| ExpiredSeat {
                seat_id: seat.id,
                show_id: seat.show_id,
                occupant: seat.state.occupant(),
            })
            .collect())
    }

    async fn release_expired(&mut self, id: SeatId) -> StoreResult<u64> {
        self.ensure_open()?;
        let seats = self
            .acquire(&[id], |seat| matches!(seat.state, SeatState::Pending { .. }))
            .await?;
        let changed = seats.len() as u64;
        for mut seat in seats {
            seat.reclaim();
            self.stage(seat);
        }
        Ok(changed)
    }

    async fn commit(&mut self) -> StoreResult<()> {
        self.ensure_open()?;
        {
            let mut table = self.shared.table();
            for (id, seat) in std::mem::take(&mut self.writes) {
                table.seats.insert(id, seat);
            }
        }
        self.finished = true;
        self.locked.clear();
        self.shared.release_locks(self.id);
        debug!("memory tx {} committed", self.id);
        Ok(())
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        self.ensure_open()?;
        self.writes.clear();
        self.finished = true;
        self.locked.clear();
        self.shared.release_locks(self.id);
        debug!("memory tx {} rolled back", self.id);
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.shared.release_locks(self.id);
        }
    }
}
