pub mod reservation;
pub mod coordinator;
pub mod reconciler;
pub mod sweeper;

pub use coordinator::BookingCoordinator;
pub use reconciler::{PaymentReconciler, Settlement};
pub use reservation::{
    Candidates, ConflictPolicy, DistributedLockBooker, ExternalMutexPolicy, HoldSettings, OptimisticLocker,
    PessimisticLocker, RowLockPolicy, SeatLocker, VersionCheckPolicy,
};
pub use sweeper::{SweepReport, TimeoutSweeper};

use seatlock_core::SeatTransaction;
use tracing::warn;

/// Rolls back a transaction that is being abandoned because of `cause`.
/// A failed rollback is only logged; the store discards the work regardless.
pub(crate) async fn discard(tx: &mut dyn SeatTransaction, cause: &seatlock_core::BookingError) {
    if let Err(e) = tx.rollback().await {
        warn!("Rollback after '{}' failed: {}", cause, e);
    }
}
