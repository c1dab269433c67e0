use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgConnection;
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;
use tracing::debug;

use seatlock_core::{
    ExpiredSeat, Hold, IsolationLevel, PaymentOutcome, PaymentStatus, PendingSeat, Seat, SeatId, SeatState,
    SeatStore, SeatTransaction, SessionId, SessionStatus, ShowId, StoreError, StoreResult, UserId,
};

const BOOKABLE: &str = "state IN ('AVAILABLE', 'FAILED')";
const SEAT_COLUMNS: &str = "id, show_id, seat_number, state, occupant_id, session_id, redirect_url, deadline, version";
// SQLSTATE serialization_failure
const SERIALIZATION_FAILURE: &str = "40001";

/// Postgres-backed seat store.
pub struct PgSeatStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgSeatStore {
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }
}

#[derive(sqlx::FromRow)]
struct SeatRow {
    id: i64,
    show_id: i64,
    seat_number: String,
    state: String,
    occupant_id: Option<i64>,
    session_id: Option<String>,
    redirect_url: Option<String>,
    deadline: Option<DateTime<Utc>>,
    version: i64,
}

impl TryFrom<SeatRow> for Seat {
    type Error = StoreError;

    fn try_from(row: SeatRow) -> Result<Self, Self::Error> {
        let id = SeatId(row.id);
        let state = SeatState::from_columns(
            id,
            &row.state,
            row.session_id.map(SessionId),
            row.occupant_id.map(UserId),
            row.deadline,
        )?;

        Ok(Seat {
            id,
            show_id: ShowId(row.show_id),
            seat_number: row.seat_number,
            state,
            redirect_url: row.redirect_url,
            version: row.version,
        })
    }
}

fn status_of(label: &str) -> Option<PaymentStatus> {
    match label {
        SeatState::PENDING => Some(PaymentStatus::Pending),
        SeatState::COMPLETED => Some(PaymentStatus::Completed),
        SeatState::FAILED => Some(PaymentStatus::Failed),
        _ => None,
    }
}

fn is_serialization_failure(code: Option<&str>) -> bool {
    code == Some(SERIALIZATION_FAILURE)
}

fn store_error(err: sqlx::Error) -> StoreError {
    let code = err
        .as_database_error()
        .and_then(|db| db.code())
        .map(|code| code.into_owned());
    if is_serialization_failure(code.as_deref()) {
        return StoreError::SerializationConflict;
    }
    StoreError::database(err)
}

fn raw_ids(ids: &[SeatId]) -> Vec<i64> {
    ids.iter().map(|id| id.0).collect()
}

#[async_trait]
impl SeatStore for PgSeatStore {
    async fn begin(&self, isolation: IsolationLevel) -> StoreResult<Box<dyn SeatTransaction>> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;

        let set_isolation = format!("SET TRANSACTION ISOLATION LEVEL {}", isolation.as_sql());
        sqlx::query(&set_isolation)
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;

        let set_lock_timeout = format!("SET LOCAL lock_timeout = '{}ms'", self.lock_timeout.as_millis());
        sqlx::query(&set_lock_timeout)
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;

        Ok(Box::new(PgSeatTransaction { tx: Some(tx) }))
    }

    async fn session_status(&self, session: &SessionId) -> StoreResult<SessionStatus> {
        let labels: Vec<String> = sqlx::query_scalar("SELECT state FROM seats WHERE session_id = $1")
            .bind(session.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;

        Ok(SessionStatus::aggregate(labels.iter().filter_map(|label| status_of(label))))
    }
}

pub struct PgSeatTransaction {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgSeatTransaction {
    fn conn(&mut self) -> StoreResult<&mut PgConnection> {
        self.tx.as_deref_mut().ok_or(StoreError::Finished)
    }
}

#[async_trait]
impl SeatTransaction for PgSeatTransaction {
    async fn lock_bookable(&mut self, show: ShowId, ids: &[SeatId]) -> StoreResult<Vec<SeatId>> {
        let query = format!(
            "SELECT id FROM seats WHERE id = ANY($1) AND show_id = $2 AND {} FOR UPDATE",
            BOOKABLE
        );
        let locked: Vec<i64> = sqlx::query_scalar(&query)
            .bind(raw_ids(ids))
            .bind(show.0)
            .fetch_all(self.conn()?)
            .await
            .map_err(store_error)?;

        Ok(locked.into_iter().map(SeatId).collect())
    }

    async fn bookable_versions(&mut self, show: ShowId, ids: &[SeatId]) -> StoreResult<Vec<(SeatId, i64)>> {
        let query = format!(
            "SELECT id, version FROM seats WHERE id = ANY($1) AND show_id = $2 AND {}",
            BOOKABLE
        );
        let rows: Vec<(i64, i64)> = sqlx::query_as(&query)
            .bind(raw_ids(ids))
            .bind(show.0)
            .fetch_all(self.conn()?)
            .await
            .map_err(store_error)?;

        Ok(rows.into_iter().map(|(id, version)| (SeatId(id), version)).collect())
    }

    async fn reserve_all(&mut self, ids: &[SeatId], hold: &Hold) -> StoreResult<u64> {
        let query = format!(
            r#"
            UPDATE seats
            SET state = 'PENDING',
                occupant_id = $1,
                session_id = $2,
                redirect_url = $3,
                deadline = $4,
                version = version + 1,
                updated_at = NOW()
            WHERE id = ANY($5) AND {}
            "#,
            BOOKABLE
        );
        let result = sqlx::query(&query)
            .bind(hold.occupant.0)
            .bind(hold.session.as_str())
            .bind(&hold.redirect_url)
            .bind(hold.deadline)
            .bind(raw_ids(ids))
            .execute(self.conn()?)
            .await
            .map_err(store_error)?;

        Ok(result.rows_affected())
    }

    async fn reserve_if_version(&mut self, id: SeatId, expected_version: i64, hold: &Hold) -> StoreResult<u64> {
        let query = format!(
            r#"
            UPDATE seats
            SET state = 'PENDING',
                occupant_id = $1,
                session_id = $2,
                redirect_url = $3,
                deadline = $4,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $5 AND version = $6 AND {}
            "#,
            BOOKABLE
        );
        let result = sqlx::query(&query)
            .bind(hold.occupant.0)
            .bind(hold.session.as_str())
            .bind(&hold.redirect_url)
            .bind(hold.deadline)
            .bind(id.0)
            .bind(expected_version)
            .execute(self.conn()?)
            .await
            .map_err(store_error)?;

        Ok(result.rows_affected())
    }

    async fn pending_for_session(&mut self, session: &SessionId) -> StoreResult<Vec<PendingSeat>> {
        let query = format!(
            "SELECT {} FROM seats WHERE session_id = $1 AND state = 'PENDING'",
            SEAT_COLUMNS
        );
        let rows: Vec<SeatRow> = sqlx::query_as(&query)
            .bind(session.as_str())
            .fetch_all(self.conn()?)
            .await
            .map_err(store_error)?;

        rows.into_iter()
            .map(|row| {
                let seat = Seat::try_from(row)?;
                let occupant = seat.state.occupant().ok_or_else(|| StoreError::CorruptRow {
                    seat_id: seat.id,
                    reason: "pending seat without occupant".to_string(),
                })?;
                Ok(PendingSeat {
                    seat_id: seat.id,
                    occupant,
                    version: seat.version,
                })
            })
            .collect()
    }

    async fn finalize_if_version(
        &mut self,
        id: SeatId,
        expected_version: i64,
        outcome: PaymentOutcome,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE seats
            SET state = $1,
                deadline = NULL,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $2 AND version = $3
            "#,
        )
        .bind(outcome.status().as_str())
        .bind(id.0)
        .bind(expected_version)
        .execute(self.conn()?)
        .await
        .map_err(store_error)?;

        Ok(result.rows_affected())
    }

    async fn expired_pending(&mut self, now: DateTime<Utc>) -> StoreResult<Vec<ExpiredSeat>> {
        let query = format!(
            "SELECT {} FROM seats WHERE state = 'PENDING' AND deadline < $1 FOR UPDATE",
            SEAT_COLUMNS
        );
        let rows: Vec<SeatRow> = sqlx::query_as(&query)
            .bind(now)
            .fetch_all(self.conn()?)
            .await
            .map_err(store_error)?;

        rows.into_iter()
            .map(|row| {
                let seat = Seat::try_from(row)?;
                Ok(ExpiredSeat {
                    seat_id: seat.id,
                    show_id: seat.show_id,
                    occupant: seat.state.occupant(),
                })
            })
            .collect()
    }

    async fn release_expired(&mut self, id: SeatId) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE seats
            SET state = 'FAILED',
                occupant_id = NULL,
                session_id = NULL,
                redirect_url = NULL,
                deadline = NULL,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND state = 'PENDING'
            "#,
        )
        .bind(id.0)
        .execute(self.conn()?)
        .await
        .map_err(store_error)?;

        Ok(result.rows_affected())
    }

    async fn commit(&mut self) -> StoreResult<()> {
        let tx = self.tx.take().ok_or(StoreError::Finished)?;
        tx.commit().await.map_err(store_error)?;
        debug!("seat transaction committed");
        Ok(())
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        let tx = self.tx.take().ok_or(StoreError::Finished)?;
        tx.rollback().await.map_err(store_error)?;
        debug!("seat transaction rolled back");
        Ok(())
    }
}
