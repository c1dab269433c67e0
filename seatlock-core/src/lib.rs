pub mod model;
pub mod store;
pub mod lock;
pub mod memory;

pub use lock::{holder_token, seat_lock_key, LockService, MemoryLockService};
pub use memory::MemorySeatStore;
pub use model::{
    Hold, LockStrategy, PaymentOutcome, PaymentStatus, Reservation, ReservationRequest, Seat, SeatId,
    SeatState, SessionId, SessionStatus, ShowId, UserId,
};
pub use store::{ExpiredSeat, IsolationLevel, PendingSeat, SeatStore, SeatTransaction};

/// Failures raised by the seat store or the lock service.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Lock wait timed out on seat {0}")]
    LockTimeout(SeatId),
    /// A serializable transaction tried to lock a row that a concurrent
    /// transaction changed and committed after this one started.
    #[error("Could not serialize access due to concurrent update")]
    SerializationConflict,
    #[error("Lock service error: {0}")]
    LockService(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Corrupt seat row {seat_id}: {reason}")]
    CorruptRow { seat_id: SeatId, reason: String },
    #[error("Transaction already finished")]
    Finished,
}

impl StoreError {
    pub fn database<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StoreError::Database(Box::new(err))
    }

    pub fn lock_service<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StoreError::LockService(Box::new(err))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcomes a booking, webhook or sweep can fail with.
#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Seats unavailable: requested {requested}, available {available}")]
    SeatsUnavailable { requested: usize, available: usize },
    #[error("Optimistic lock conflict on seat {seat_id}")]
    OptimisticConflict { seat_id: SeatId },
    #[error("Seat lock {key} is already held{}", held_by(.holder))]
    LockContention { key: String, holder: Option<String> },
    #[error("Transaction failed: {0}")]
    TransactionError(#[from] StoreError),
    #[error("Concurrent modification detected on seat {seat_id}")]
    ConcurrentModification { seat_id: SeatId },
    #[error("No pending seats found for session {0}")]
    NotFound(SessionId),
}

pub type BookingResult<T> = Result<T, BookingError>;

fn held_by(holder: &Option<String>) -> String {
    holder.as_deref().map(|h| format!(" by {}", h)).unwrap_or_default()
}
