use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use seatlock_core::{
    holder_token, seat_lock_key, BookingError, BookingResult, ExpiredSeat, IsolationLevel, LockService, SeatId, SeatStore,
    SeatTransaction, StoreError,
};

use crate::discard;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub reclaimed: Vec<SeatId>,
    pub locks_released: usize,
}

/// Background reclamation of pending seats whose payment deadline passed.
///
/// Each reset is guarded by the row still being pending, so a payment
/// confirmation that committed first is never overwritten. A confirmation
/// racing an in-flight sweep loses its version check instead.
pub struct TimeoutSweeper {
    store: Arc<dyn SeatStore>,
    locks: Arc<dyn LockService>,
    interval: Duration,
}

const MIN_INTERVAL: Duration = Duration::from_secs(1);

impl TimeoutSweeper {
    /// An interval shorter than one second is raised to one second.
    pub fn new(store: Arc<dyn SeatStore>, locks: Arc<dyn LockService>, interval: Duration) -> Self {
        if interval < MIN_INTERVAL {
            warn!("Sweep interval {:?} too short, using {:?}", interval, MIN_INTERVAL);
        }
        Self {
            store,
            locks,
            interval: interval.max(MIN_INTERVAL),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Sweeps forever, one cycle per interval. A failed cycle is logged and
    /// skipped.
    pub async fn run(&self) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Timeout sweeper started, interval {:?}", self.interval);

        loop {
            ticker.tick().await;
            match self.sweep_once().await {
                Ok(report) if !report.reclaimed.is_empty() => info!(
                    "Reclaimed {} expired seats {:?}, released {} locks",
                    report.reclaimed.len(),
                    report.reclaimed,
                    report.locks_released
                ),
                Ok(_) => debug!("No expired pending seats"),
                Err(e) => error!("Timeout sweep skipped: {}", e),
            }
        }
    }

    pub async fn sweep_once(&self) -> BookingResult<SweepReport> {
        self.sweep_at(Utc::now()).await
    }

    /// Runs one cycle treating `now` as the current time.
    ///
    /// Seats a concurrent payment finalized while the sweep waited for their row
    /// locks are left alone; the cycle reclaims nothing and the next one retries.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> BookingResult<SweepReport> {
        let mut tx = self.store.begin(IsolationLevel::Serializable).await?;

        let reclaimed = Self::reclaim(tx.as_mut(), now).await;
        let expired = match reclaimed {
            Ok(expired) => expired,
            Err(err) if matches!(err, BookingError::TransactionError(StoreError::SerializationConflict)) => {
                discard(tx.as_mut(), &err).await;
                debug!("Expired seats changed concurrently, sweep deferred to next cycle");
                return Ok(SweepReport::default());
            }
            Err(err) => {
                discard(tx.as_mut(), &err).await;
                return Err(err);
            }
        };
        tx.commit().await?;

        let mut locks_released = 0;
        for seat in &expired {
            if self.release_lock(seat).await {
                locks_released += 1;
            }
        }

        Ok(SweepReport {
            reclaimed: expired.into_iter().map(|seat| seat.seat_id).collect(),
            locks_released,
        })
    }

    async fn reclaim(tx: &mut dyn SeatTransaction, now: DateTime<Utc>) -> BookingResult<Vec<ExpiredSeat>> {
        let expired = tx.expired_pending(now).await?;
        let mut reclaimed = Vec::with_capacity(expired.len());

        for seat in expired {
            if tx.release_expired(seat.seat_id).await? == 0 {
                debug!("Seat {} left pending state before it could be reclaimed", seat.seat_id);
                continue;
            }
            reclaimed.push(seat);
        }

        Ok(reclaimed)
    }

    async fn release_lock(&self, seat: &ExpiredSeat) -> bool {
        let key = seat_lock_key(seat.seat_id);
        let released = match seat.occupant {
            Some(occupant) => self.locks.release_if_held(&key, &holder_token(occupant)).await,
            None => self.locks.release(&key).await,
        };

        match released {
            Ok(released) => released,
            Err(e) => {
                warn!("Failed to release seat lock {} for show {}: {}", key, seat.show_id, e);
                false
            }
        }
    }
}
