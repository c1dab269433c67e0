use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::{BookingError, StoreError};

macro_rules! numeric_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }
    };
}

numeric_id!(SeatId);
numeric_id!(ShowId);
numeric_id!(UserId);

/// Opaque token correlating one booking attempt with its later payment outcome.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// Fresh token for a booking attempt by `user`.
    pub fn generate(user: UserId) -> Self {
        Self(format!("book_{}_{}", user, Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Payment status as seen on the wire and in status queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Completed => "COMPLETED",
            PaymentStatus::Failed => "FAILED",
        }
    }

    // Lower rank means less advanced.
    fn rank(&self) -> u8 {
        match self {
            PaymentStatus::Pending => 0,
            PaymentStatus::Failed => 1,
            PaymentStatus::Completed => 2,
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal payment outcome delivered by the payment webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentOutcome {
    Confirmed,
    Failed,
}

impl PaymentOutcome {
    pub fn status(&self) -> PaymentStatus {
        match self {
            PaymentOutcome::Confirmed => PaymentStatus::Completed,
            PaymentOutcome::Failed => PaymentStatus::Failed,
        }
    }
}

impl FromStr for PaymentOutcome {
    type Err = BookingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "COMPLETED" | "SUCCESS" | "SUCCEEDED" => Ok(PaymentOutcome::Confirmed),
            "FAILED" => Ok(PaymentOutcome::Failed),
            other => Err(BookingError::InvalidInput(format!(
                "unsupported payment status: {}",
                other
            ))),
        }
    }
}

/// Aggregated status of every seat grouped under one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Found(PaymentStatus),
    NotFound,
}

impl SessionStatus {
    /// Least-advanced status across the session's seats (`PENDING < FAILED < COMPLETED`).
    pub fn aggregate<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = PaymentStatus>,
    {
        statuses
            .into_iter()
            .min_by_key(PaymentStatus::rank)
            .map_or(SessionStatus::NotFound, SessionStatus::Found)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Found(status) => status.as_str(),
            SessionStatus::NotFound => "NOT_FOUND",
        }
    }
}

/// Reservation state of a seat.
///
/// `Available` and `Failed` are the two bookable states; a failed payment
/// hands the seat back to the pool while keeping the attempt's session so
/// status queries can still report it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SeatState {
    Available,
    Pending {
        session: SessionId,
        occupant: UserId,
        deadline: DateTime<Utc>,
    },
    Confirmed {
        session: SessionId,
        occupant: UserId,
    },
    Failed {
        session: Option<SessionId>,
        occupant: Option<UserId>,
    },
}

impl SeatState {
    pub const AVAILABLE: &'static str = "AVAILABLE";
    pub const PENDING: &'static str = "PENDING";
    pub const COMPLETED: &'static str = "COMPLETED";
    pub const FAILED: &'static str = "FAILED";

    pub fn is_bookable(&self) -> bool {
        matches!(self, SeatState::Available | SeatState::Failed { .. })
    }

    pub fn payment_status(&self) -> Option<PaymentStatus> {
        match self {
            SeatState::Available => None,
            SeatState::Pending { .. } => Some(PaymentStatus::Pending),
            SeatState::Confirmed { .. } => Some(PaymentStatus::Completed),
            SeatState::Failed { .. } => Some(PaymentStatus::Failed),
        }
    }

    /// Storage label of the state column.
    pub fn label(&self) -> &'static str {
        match self {
            SeatState::Available => Self::AVAILABLE,
            SeatState::Pending { .. } => Self::PENDING,
            SeatState::Confirmed { .. } => Self::COMPLETED,
            SeatState::Failed { .. } => Self::FAILED,
        }
    }

    pub fn session(&self) -> Option<&SessionId> {
        match self {
            SeatState::Available => None,
            SeatState::Pending { session, .. } | SeatState::Confirmed { session, .. } => Some(session),
            SeatState::Failed { session, .. } => session.as_ref(),
        }
    }

    pub fn occupant(&self) -> Option<UserId> {
        match self {
            SeatState::Available => None,
            SeatState::Pending { occupant, .. } | SeatState::Confirmed { occupant, .. } => Some(*occupant),
            SeatState::Failed { occupant, .. } => *occupant,
        }
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        match self {
            SeatState::Pending { deadline, .. } => Some(*deadline),
            _ => None,
        }
    }

    /// Rebuilds a state from its column encoding.
    pub fn from_columns(
        seat_id: SeatId,
        label: &str,
        session: Option<SessionId>,
        occupant: Option<UserId>,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<Self, StoreError> {
        let corrupt = |reason: &str| StoreError::CorruptRow {
            seat_id,
            reason: reason.to_string(),
        };

        match label {
            Self::AVAILABLE => Ok(SeatState::Available),
            Self::PENDING => Ok(SeatState::Pending {
                session: session.ok_or_else(|| corrupt("pending seat without session"))?,
                occupant: occupant.ok_or_else(|| corrupt("pending seat without occupant"))?,
                deadline: deadline.ok_or_else(|| corrupt("pending seat without deadline"))?,
            }),
            Self::COMPLETED => Ok(SeatState::Confirmed {
                session: session.ok_or_else(|| corrupt("completed seat without session"))?,
                occupant: occupant.ok_or_else(|| corrupt("completed seat without occupant"))?,
            }),
            Self::FAILED => Ok(SeatState::Failed { session, occupant }),
            other => Err(corrupt(&format!("unknown state {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seat {
    pub id: SeatId,
    pub show_id: ShowId,
    pub seat_number: String,
    #[serde(flatten)]
    pub state: SeatState,
    pub redirect_url: Option<String>,
    pub version: i64,
}

impl Seat {
    /// A freshly provisioned, bookable seat.
    pub fn available(id: SeatId, show_id: ShowId, seat_number: impl Into<String>) -> Self {
        Self {
            id,
            show_id,
            seat_number: seat_number.into(),
            state: SeatState::Available,
            redirect_url: None,
            version: 0,
        }
    }

    pub fn is_bookable(&self) -> bool {
        self.state.is_bookable()
    }

    pub fn apply_hold(&mut self, hold: &Hold) {
        self.state = SeatState::Pending {
            session: hold.session.clone(),
            occupant: hold.occupant,
            deadline: hold.deadline,
        };
        self.redirect_url = Some(hold.redirect_url.clone());
        self.version += 1;
    }

    pub fn apply_outcome(&mut self, outcome: PaymentOutcome) {
        let session = self.state.session().cloned();
        let occupant = self.state.occupant();
        self.state = match (outcome, session, occupant) {
            (PaymentOutcome::Confirmed, Some(session), Some(occupant)) => SeatState::Confirmed { session, occupant },
            (_, session, occupant) => SeatState::Failed { session, occupant },
        };
        self.version += 1;
    }

    /// Reclaims an expired hold: failed, with every hold field cleared.
    pub fn reclaim(&mut self) {
        self.state = SeatState::Failed {
            session: None,
            occupant: None,
        };
        self.redirect_url = None;
        self.version += 1;
    }
}

/// Seat-level write applied by every locker when a reservation succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hold {
    pub occupant: UserId,
    pub session: SessionId,
    pub redirect_url: String,
    pub deadline: DateTime<Utc>,
}

/// Inputs common to every reservation strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRequest {
    pub user_id: UserId,
    pub show_id: ShowId,
    pub seat_ids: Vec<SeatId>,
    pub session: SessionId,
}

impl ReservationRequest {
    pub fn new(user_id: UserId, show_id: ShowId, seat_ids: Vec<SeatId>, session: SessionId) -> Self {
        Self {
            user_id,
            show_id,
            seat_ids,
            session,
        }
    }

    /// Rejects empty and duplicated seat lists.
    pub fn validate(&self) -> Result<(), BookingError> {
        if self.seat_ids.is_empty() {
            return Err(BookingError::InvalidInput("no seat IDs provided".to_string()));
        }

        let mut seen = std::collections::HashSet::with_capacity(self.seat_ids.len());
        if let Some(dup) = self.seat_ids.iter().find(|id| !seen.insert(**id)) {
            return Err(BookingError::InvalidInput(format!("seat {} requested more than once", dup)));
        }

        Ok(())
    }
}

/// Which conflict-resolution strategy a booking request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockStrategy {
    Pessimistic,
    Optimistic,
    #[serde(rename = "current", alias = "distributed")]
    Distributed,
}

impl LockStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockStrategy::Pessimistic => "pessimistic",
            LockStrategy::Optimistic => "optimistic",
            LockStrategy::Distributed => "current",
        }
    }
}

impl fmt::Display for LockStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LockStrategy {
    type Err = BookingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pessimistic" => Ok(LockStrategy::Pessimistic),
            "optimistic" => Ok(LockStrategy::Optimistic),
            "current" | "distributed" => Ok(LockStrategy::Distributed),
            other => Err(BookingError::InvalidInput(format!(
                "invalid concurrency control method: {}",
                other
            ))),
        }
    }
}

/// A successfully placed reservation, still awaiting payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reservation {
    pub session: SessionId,
    pub seat_ids: Vec<SeatId>,
    pub strategy: LockStrategy,
    pub redirect_url: String,
    pub deadline: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn pending(user: i64) -> SeatState {
        SeatState::Pending {
            session: SessionId::from("book_1"),
            occupant: UserId(user),
            deadline: Utc::now() + Duration::minutes(1),
        }
    }

    #[test]
    fn test_bookability() {
        assert!(SeatState::Available.is_bookable());
        assert!(SeatState::Failed { session: None, occupant: None }.is_bookable());
        assert!(!pending(1).is_bookable());
        assert!(!SeatState::Confirmed { session: SessionId::from("s"), occupant: UserId(1) }.is_bookable());
    }

    #[test]
    fn test_state_column_decoding() {
        let seat = SeatId(4);
        let decoded = SeatState::from_columns(seat, "FAILED", None, None, None).unwrap();
        assert!(decoded.is_bookable());

        let err = SeatState::from_columns(seat, "PENDING", Some(SessionId::from("s")), Some(UserId(1)), None);
        assert!(matches!(err, Err(StoreError::CorruptRow { .. })));

        let err = SeatState::from_columns(seat, "RESERVED", None, None, None);
        assert!(matches!(err, Err(StoreError::CorruptRow { .. })));
    }

    #[test]
    fn test_session_aggregation() {
        use PaymentStatus::*;
        assert_eq!(SessionStatus::aggregate(vec![]), SessionStatus::NotFound);
        assert_eq!(SessionStatus::aggregate(vec![Completed, Pending]), SessionStatus::Found(Pending));
        assert_eq!(SessionStatus::aggregate(vec![Completed, Failed]), SessionStatus::Found(Failed));
        assert_eq!(SessionStatus::aggregate(vec![Completed, Completed]).as_str(), "COMPLETED");
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("pessimistic".parse::<LockStrategy>().unwrap(), LockStrategy::Pessimistic);
        assert_eq!("current".parse::<LockStrategy>().unwrap(), LockStrategy::Distributed);
        assert!(matches!("fastest".parse::<LockStrategy>(), Err(BookingError::InvalidInput(_))));
    }

    #[test]
    fn test_request_validation() {
        let session = SessionId::from("book_x");
        let empty = ReservationRequest::new(UserId(1), ShowId(1), vec![], session.clone());
        assert!(matches!(empty.validate(), Err(BookingError::InvalidInput(_))));

        let dup = ReservationRequest::new(UserId(1), ShowId(1), vec![SeatId(1), SeatId(1)], session.clone());
        assert!(matches!(dup.validate(), Err(BookingError::InvalidInput(_))));

        let ok = ReservationRequest::new(UserId(1), ShowId(1), vec![SeatId(1), SeatId(2)], session);
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_outcome_keeps_attempt_on_failure() {
        let mut seat = Seat::available(SeatId(1), ShowId(1), "A1");
        seat.state = pending(7);
        seat.version = 1;

        seat.apply_outcome(PaymentOutcome::Failed);
        assert_eq!(seat.version, 2);
        assert!(seat.is_bookable());
        assert_eq!(seat.state.occupant(), Some(UserId(7)));
        assert_eq!(seat.state.payment_status(), Some(PaymentStatus::Failed));
    }

    #[test]
    fn test_seat_json_flattens_state() {
        let mut seat = Seat::available(SeatId(2), ShowId(1), "A2");
        seat.state = SeatState::Confirmed { session: SessionId::from("book_3_x"), occupant: UserId(3) };

        let value = serde_json::to_value(&seat).unwrap();
        assert_eq!(value["state"], "CONFIRMED");
        assert_eq!(value["session"], "book_3_x");
        assert_eq!(value["occupant"], 3);
        assert_eq!(serde_json::from_value::<Seat>(value).unwrap(), seat);
    }
}
