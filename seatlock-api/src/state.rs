use std::sync::Arc;

use seatlock_core::{LockService, SeatStore};
use seatlock_engine::{BookingCoordinator, HoldSettings, PaymentReconciler};

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<BookingCoordinator>,
    pub reconciler: Arc<PaymentReconciler>,
}

impl AppState {
    pub fn new(store: Arc<dyn SeatStore>, locks: Arc<dyn LockService>, settings: HoldSettings) -> Self {
        Self {
            coordinator: Arc::new(BookingCoordinator::new(store.clone(), locks.clone(), settings)),
            reconciler: Arc::new(PaymentReconciler::new(store, locks)),
        }
    }
}
