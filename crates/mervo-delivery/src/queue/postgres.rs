//! PostgreSQL delivery queue.
//!
//! `dequeue_ready` claims rows with `FOR UPDATE SKIP LOCKED` inside a
//! transaction, so any number of workers across any number of processes can
//! poll the same table without handing one delivery to two of them. Status
//! changes are conditional `UPDATE`s on `status = 'in-flight'`; a zero-row
//! result is reported as an invalid transition instead of overwriting.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use mervo_core::{
    error::{CoreError, Result},
    Clock, Delivery, DeliveryId, DeliveryStatus, NewDelivery,
};
use sqlx::{types::Json, PgPool};

use super::{memory::check_in_flight, DeliveryQueue, QueueFuture, Resolution};

const DELIVERY_COLUMNS: &str = "id, url, payload, secret, attempt_count, status, next_attempt, \
                                diagnostic, event_type, connector_id, created_at, updated_at, \
                                last_attempt_at, delivered_at";

#[derive(Debug, sqlx::FromRow)]
struct DeliveryRow {
    id: DeliveryId,
    url: String,
    payload: Json<serde_json::Value>,
    secret: Option<String>,
    attempt_count: i32,
    status: DeliveryStatus,
    next_attempt: DateTime<Utc>,
    diagnostic: Option<String>,
    event_type: Option<String>,
    connector_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_attempt_at: Option<DateTime<Utc>>,
    delivered_at: Option<DateTime<Utc>>,
}

impl TryFrom<DeliveryRow> for Delivery {
    type Error = CoreError;

    fn try_from(row: DeliveryRow) -> Result<Self> {
        let attempt_count = u32::try_from(row.attempt_count).map_err(|_| {
            CoreError::InvalidInput(format!(
                "delivery {} has negative attempt_count {}",
                row.id, row.attempt_count
            ))
        })?;

        Ok(Self {
            id: row.id,
            url: row.url,
            payload: row.payload.0,
            secret: row.secret,
            attempt_count,
            status: row.status,
            next_attempt: row.next_attempt,
            diagnostic: row.diagnostic,
            event_type: row.event_type,
            connector_id: row.connector_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            last_attempt_at: row.last_attempt_at,
            delivered_at: row.delivered_at,
        })
    }
}

fn attempt_count_param(delivery: &Delivery) -> Result<i32> {
    i32::try_from(delivery.attempt_count).map_err(|_| {
        CoreError::InvalidInput(format!(
            "attempt_count {} out of range for delivery {}",
            delivery.attempt_count, delivery.id
        ))
    })
}

/// Delivery queue backed by a `deliveries` table.
#[derive(Debug, Clone)]
pub struct PostgresDeliveryQueue {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PostgresDeliveryQueue {
    /// Creates a queue over `pool`, timestamping records with `clock`.
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Returns the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the `deliveries` table and its indexes if missing.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if any statement fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS deliveries (
                id UUID PRIMARY KEY,
                seq BIGSERIAL NOT NULL,
                url TEXT NOT NULL,
                payload JSONB NOT NULL,
                secret TEXT,
                attempt_count INTEGER NOT NULL DEFAULT 0 CHECK (attempt_count >= 0),
                status TEXT NOT NULL CHECK (
                    status IN ('pending', 'in-flight', 'delivered', 'dead-letter', 'cancelled')
                ),
                next_attempt TIMESTAMPTZ NOT NULL,
                diagnostic TEXT,
                event_type TEXT,
                connector_id TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                last_attempt_at TIMESTAMPTZ,
                delivered_at TIMESTAMPTZ
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_deliveries_ready
                ON deliveries (next_attempt, seq)
                WHERE status = 'pending'
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_deliveries_status_seq ON deliveries (status, seq)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fetch(&self, id: DeliveryId) -> Result<Option<Delivery>> {
        let sql = format!("SELECT {DELIVERY_COLUMNS} FROM deliveries WHERE id = $1");
        sqlx::query_as::<_, DeliveryRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Delivery::try_from)
            .transpose()
    }

    /// Explains why a conditional update matched no row.
    async fn transition_error(&self, incoming: &Delivery, operation: &str) -> CoreError {
        match self.fetch(incoming.id).await {
            Ok(Some(stored)) => check_in_flight(&stored, incoming, operation).err().unwrap_or_else(
                || {
                    CoreError::invalid_transition(
                        stored.id,
                        stored.status,
                        format!("concurrent update while trying to {operation}"),
                    )
                },
            ),
            Ok(None) => CoreError::NotFound(format!("delivery {}", incoming.id)),
            Err(error) => error,
        }
    }
}

impl DeliveryQueue for PostgresDeliveryQueue {
    fn enqueue(&self, new: NewDelivery) -> QueueFuture<'_, Delivery> {
        Box::pin(async move {
            new.validate().map_err(|e| CoreError::InvalidInput(e.to_string()))?;

            let delivery = Delivery::from_new(new, self.clock.now_utc());
            let sql = format!(
                "INSERT INTO deliveries ({DELIVERY_COLUMNS}) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) \
                 RETURNING {DELIVERY_COLUMNS}"
            );

            let row = sqlx::query_as::<_, DeliveryRow>(&sql)
                .bind(delivery.id)
                .bind(&delivery.url)
                .bind(Json(&delivery.payload))
                .bind(&delivery.secret)
                .bind(attempt_count_param(&delivery)?)
                .bind(delivery.status)
                .bind(delivery.next_attempt)
                .bind(&delivery.diagnostic)
                .bind(&delivery.event_type)
                .bind(&delivery.connector_id)
                .bind(delivery.created_at)
                .bind(delivery.updated_at)
                .bind(delivery.last_attempt_at)
                .bind(delivery.delivered_at)
                .fetch_one(&self.pool)
                .await?;

            Delivery::try_from(row)
        })
    }

    fn dequeue_ready(&self, now: DateTime<Utc>) -> QueueFuture<'_, Option<Delivery>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await?;

            let id: Option<DeliveryId> = sqlx::query_scalar(
                r"
                SELECT id FROM deliveries
                WHERE status = 'pending' AND next_attempt <= $1
                ORDER BY next_attempt ASC, seq ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
                ",
            )
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(id) = id else {
                tx.rollback().await?;
                return Ok(None);
            };

            let sql = format!(
                "UPDATE deliveries SET status = 'in-flight', updated_at = $2 \
                 WHERE id = $1 RETURNING {DELIVERY_COLUMNS}"
            );
            let row = sqlx::query_as::<_, DeliveryRow>(&sql)
                .bind(id)
                .bind(self.clock.now_utc())
                .fetch_one(&mut *tx)
                .await?;

            tx.commit().await?;
            Delivery::try_from(row).map(Some)
        })
    }

    fn requeue(
        &self,
        delivery: Delivery,
        next_attempt: DateTime<Utc>,
    ) -> QueueFuture<'_, Delivery> {
        Box::pin(async move {
            let sql = format!(
                "UPDATE deliveries \
                 SET status = 'pending', attempt_count = $2, next_attempt = $3, \
                     last_attempt_at = $4, updated_at = $5 \
                 WHERE id = $1 AND status = 'in-flight' AND attempt_count <= $2 \
                 RETURNING {DELIVERY_COLUMNS}"
            );

            let row = sqlx::query_as::<_, DeliveryRow>(&sql)
                .bind(delivery.id)
                .bind(attempt_count_param(&delivery)?)
                .bind(next_attempt)
                .bind(delivery.last_attempt_at)
                .bind(self.clock.now_utc())
                .fetch_optional(&self.pool)
                .await?;

            match row {
                Some(row) => Delivery::try_from(row),
                None => Err(self.transition_error(&delivery, "requeue").await),
            }
        })
    }

    fn finalize(&self, delivery: Delivery, resolution: Resolution) -> QueueFuture<'_, Delivery> {
        Box::pin(async move {
            let now = self.clock.now_utc();
            let (delivered_at, diagnostic) = match &resolution {
                Resolution::Delivered => (Some(now), None),
                Resolution::DeadLetter { diagnostic } => (None, Some(diagnostic.as_str())),
            };

            let sql = format!(
                "UPDATE deliveries \
                 SET status = $3, attempt_count = $2, last_attempt_at = $4, updated_at = $5, \
                     delivered_at = $6, diagnostic = COALESCE(diagnostic, $7) \
                 WHERE id = $1 AND status = 'in-flight' AND attempt_count <= $2 \
                 RETURNING {DELIVERY_COLUMNS}"
            );

            let row = sqlx::query_as::<_, DeliveryRow>(&sql)
                .bind(delivery.id)
                .bind(attempt_count_param(&delivery)?)
                .bind(resolution.status())
                .bind(delivery.last_attempt_at)
                .bind(now)
                .bind(delivered_at)
                .bind(diagnostic)
                .fetch_optional(&self.pool)
                .await?;

            match row {
                Some(row) => Delivery::try_from(row),
                None => Err(self.transition_error(&delivery, "finalize").await),
            }
        })
    }

    fn cancel(&self, id: DeliveryId) -> QueueFuture<'_, Delivery> {
        Box::pin(async move {
            let sql = format!(
                "UPDATE deliveries SET status = 'cancelled', updated_at = $2 \
                 WHERE id = $1 AND status = 'pending' \
                 RETURNING {DELIVERY_COLUMNS}"
            );

            let row = sqlx::query_as::<_, DeliveryRow>(&sql)
                .bind(id)
                .bind(self.clock.now_utc())
                .fetch_optional(&self.pool)
                .await?;

            match row {
                Some(row) => Delivery::try_from(row),
                None => match self.fetch(id).await? {
                    Some(stored) => Err(CoreError::invalid_transition(
                        id,
                        stored.status,
                        "only pending deliveries can be cancelled",
                    )),
                    None => Err(CoreError::NotFound(format!("delivery {id}"))),
                },
            }
        })
    }

    fn find(&self, id: DeliveryId) -> QueueFuture<'_, Option<Delivery>> {
        Box::pin(self.fetch(id))
    }

    fn list(
        &self,
        status: Option<DeliveryStatus>,
        limit: usize,
    ) -> QueueFuture<'_, Vec<Delivery>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {DELIVERY_COLUMNS} FROM deliveries \
                 WHERE ($1::TEXT IS NULL OR status = $1) \
                 ORDER BY seq ASC \
                 LIMIT $2"
            );

            let rows = sqlx::query_as::<_, DeliveryRow>(&sql)
                .bind(status.map(DeliveryStatus::as_str))
                .bind(i64::try_from(limit).unwrap_or(i64::MAX))
                .fetch_all(&self.pool)
                .await?;

            rows.into_iter().map(Delivery::try_from).collect()
        })
    }
}
