use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use common::{HistoryId, OrderId, PaymentId, PaymentMethodId, UserId, WebhookEventId};
use domain::{
    DeliveryClaim, DeliveryStatus, PaymentStatus, PaymentStatusHistory, PaymentTransaction,
    WebhookEvent,
};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::{
    RepositoryError, Result, WebhookEventQuery,
    store::{ClaimedWebhookEvent, PaymentRepository, TransitionRecord},
};

const ONE_COMPLETED_PER_ORDER: &str = "payment_transactions_one_completed_per_order";

const PAYMENT_COLUMNS: &str = "id, order_id, user_id, payment_method_id, method_type, amount, \
     currency, description, status, gateway_id, gateway_transaction_id, failure_reason, \
     error_code, attempt_count, created_at, updated_at, processed_at";

const WEBHOOK_COLUMNS: &str = "id, payment_id, event_type, payload, endpoint_url, \
     delivery_status, attempts, max_attempts, last_attempt_at, next_retry_at, delivered_at, \
     last_status_code, last_error, claim_token, claim_expires_at, created_at, updated_at";

/// PostgreSQL-backed repository implementation.
#[derive(Clone)]
pub struct PostgresPaymentRepository {
    pool: PgPool,
}

impl PostgresPaymentRepository {
    /// Creates a new PostgreSQL repository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_payment(row: PgRow) -> Result<PaymentTransaction> {
        let method_type: String = row.try_get("method_type")?;
        let status: String = row.try_get("status")?;

        Ok(PaymentTransaction {
            id: PaymentId::from_uuid(row.try_get::<Uuid, _>("id")?),
            order_id: OrderId::from_uuid(row.try_get::<Uuid, _>("order_id")?),
            user_id: UserId::from_uuid(row.try_get::<Uuid, _>("user_id")?),
            payment_method_id: PaymentMethodId::from_uuid(
                row.try_get::<Uuid, _>("payment_method_id")?,
            ),
            method_type: method_type.parse()?,
            amount: row.try_get("amount")?,
            currency: row.try_get::<String, _>("currency")?.trim().to_string(),
            description: row.try_get("description")?,
            status: status.parse()?,
            gateway_id: row.try_get("gateway_id")?,
            gateway_transaction_id: row.try_get("gateway_transaction_id")?,
            failure_reason: row.try_get("failure_reason")?,
            error_code: row.try_get("error_code")?,
            attempt_count: to_u32("attempt_count", row.try_get("attempt_count")?)?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            processed_at: row.try_get("processed_at")?,
        })
    }

    fn row_to_history(row: PgRow) -> Result<PaymentStatusHistory> {
        let previous: String = row.try_get("previous_status")?;
        let new: String = row.try_get("new_status")?;

        Ok(PaymentStatusHistory {
            id: HistoryId::from_uuid(row.try_get::<Uuid, _>("id")?),
            payment_id: PaymentId::from_uuid(row.try_get::<Uuid, _>("payment_id")?),
            previous_status: previous.parse()?,
            new_status: new.parse()?,
            reason: row.try_get("reason")?,
            context: row.try_get("context")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn row_to_webhook(row: PgRow) -> Result<WebhookEvent> {
        let event_type: String = row.try_get("event_type")?;
        let delivery_status: String = row.try_get("delivery_status")?;
        let last_status_code: Option<i32> = row.try_get("last_status_code")?;

        Ok(WebhookEvent {
            id: WebhookEventId::from_uuid(row.try_get::<Uuid, _>("id")?),
            payment_id: PaymentId::from_uuid(row.try_get::<Uuid, _>("payment_id")?),
            event_type: event_type.parse()?,
            payload: row.try_get("payload")?,
            endpoint_url: row.try_get("endpoint_url")?,
            delivery_status: delivery_status.parse()?,
            attempts: to_u32("attempts", row.try_get("attempts")?)?,
            max_attempts: to_u32("max_attempts", row.try_get("max_attempts")?)?,
            last_attempt_at: row.try_get("last_attempt_at")?,
            next_retry_at: row.try_get("next_retry_at")?,
            delivered_at: row.try_get("delivered_at")?,
            last_status_code: last_status_code
                .map(|code| {
                    u16::try_from(code).map_err(|e| RepositoryError::Decode {
                        column: "last_status_code",
                        reason: e.to_string(),
                    })
                })
                .transpose()?,
            last_error: row.try_get("last_error")?,
            claim_token: row.try_get("claim_token")?,
            claim_expires_at: row.try_get("claim_expires_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn map_completion_conflict(err: sqlx::Error, order_id: OrderId) -> RepositoryError {
        if let sqlx::Error::Database(ref db_err) = err
            && db_err.constraint() == Some(ONE_COMPLETED_PER_ORDER)
        {
            return RepositoryError::OrderAlreadyPaid { order_id };
        }
        RepositoryError::Database(err)
    }

    async fn insert_webhook_events_in(
        tx: &mut Transaction<'_, Postgres>,
        events: &[WebhookEvent],
    ) -> Result<()> {
        for event in events {
            sqlx::query(
                r#"
                INSERT INTO webhook_events (id, payment_id, event_type, payload, endpoint_url,
                    delivery_status, attempts, max_attempts, last_attempt_at, next_retry_at,
                    delivered_at, last_status_code, last_error, claim_token, claim_expires_at,
                    created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
                "#,
            )
            .bind(event.id.as_uuid())
            .bind(event.payment_id.as_uuid())
            .bind(event.event_type.as_str())
            .bind(&event.payload)
            .bind(&event.endpoint_url)
            .bind(event.delivery_status.as_str())
            .bind(to_i32(event.attempts))
            .bind(to_i32(event.max_attempts))
            .bind(event.last_attempt_at)
            .bind(event.next_retry_at)
            .bind(event.delivered_at)
            .bind(event.last_status_code.map(i32::from))
            .bind(&event.last_error)
            .bind(event.claim_token)
            .bind(event.claim_expires_at)
            .bind(event.created_at)
            .bind(event.updated_at)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }
}

fn to_u32(column: &'static str, value: i32) -> Result<u32> {
    u32::try_from(value).map_err(|e| RepositoryError::Decode {
        column,
        reason: e.to_string(),
    })
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[async_trait]
impl PaymentRepository for PostgresPaymentRepository {
    #[tracing::instrument(skip(self, payment), fields(payment_id = %payment.id))]
    async fn insert_payment(&self, payment: &PaymentTransaction) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let already_paid: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM payment_transactions WHERE order_id = $1 AND status = 'COMPLETED')",
        )
        .bind(payment.order_id.as_uuid())
        .fetch_one(&mut *tx)
        .await?;

        if already_paid {
            return Err(RepositoryError::OrderAlreadyPaid {
                order_id: payment.order_id,
            });
        }

        sqlx::query(
            r#"
            INSERT INTO payment_transactions (id, order_id, user_id, payment_method_id, method_type,
                amount, currency, description, status, gateway_id, gateway_transaction_id,
                failure_reason, error_code, attempt_count, created_at, updated_at, processed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(payment.id.as_uuid())
        .bind(payment.order_id.as_uuid())
        .bind(payment.user_id.as_uuid())
        .bind(payment.payment_method_id.as_uuid())
        .bind(payment.method_type.as_str())
        .bind(payment.amount)
        .bind(&payment.currency)
        .bind(&payment.description)
        .bind(payment.status.as_str())
        .bind(&payment.gateway_id)
        .bind(&payment.gateway_transaction_id)
        .bind(&payment.failure_reason)
        .bind(&payment.error_code)
        .bind(to_i32(payment.attempt_count))
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .bind(payment.processed_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::map_completion_conflict(e, payment.order_id))?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_payment(&self, id: PaymentId) -> Result<Option<PaymentTransaction>> {
        let row = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payment_transactions WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_payment).transpose()
    }

    async fn find_payments_by_order(&self, order_id: OrderId) -> Result<Vec<PaymentTransaction>> {
        let rows = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payment_transactions WHERE order_id = $1 ORDER BY created_at ASC"
        ))
        .bind(order_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_payment).collect()
    }

    async fn list_payments_by_status(
        &self,
        status: PaymentStatus,
        limit: usize,
    ) -> Result<Vec<PaymentTransaction>> {
        let rows = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payment_transactions WHERE status = $1 ORDER BY created_at ASC LIMIT $2"
        ))
        .bind(status.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_payment).collect()
    }

    #[tracing::instrument(
        skip(self, record),
        fields(payment_id = %record.payment.id, to = %record.payment.status)
    )]
    async fn commit_transition(&self, record: TransitionRecord) -> Result<()> {
        let payment = &record.payment;
        let expected = record.expected_status();

        // Dropping `tx` on any early return rolls the whole unit back.
        let mut tx = self.pool.begin().await?;

        let current: Option<String> = sqlx::query_scalar(
            "SELECT status FROM payment_transactions WHERE id = $1 FOR UPDATE",
        )
        .bind(payment.id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?;

        let actual: PaymentStatus = current
            .ok_or_else(|| RepositoryError::payment_not_found(payment.id))?
            .parse()?;

        if actual != expected {
            return Err(RepositoryError::ConcurrencyConflict {
                payment_id: payment.id,
                expected,
                actual,
            });
        }

        sqlx::query(
            r#"
            UPDATE payment_transactions SET
                status = $2,
                gateway_id = $3,
                gateway_transaction_id = $4,
                failure_reason = $5,
                error_code = $6,
                attempt_count = $7,
                updated_at = $8,
                processed_at = $9
            WHERE id = $1
            "#,
        )
        .bind(payment.id.as_uuid())
        .bind(payment.status.as_str())
        .bind(&payment.gateway_id)
        .bind(&payment.gateway_transaction_id)
        .bind(&payment.failure_reason)
        .bind(&payment.error_code)
        .bind(to_i32(payment.attempt_count))
        .bind(payment.updated_at)
        .bind(payment.processed_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::map_completion_conflict(e, payment.order_id))?;

        let history = &record.history;
        sqlx::query(
            r#"
            INSERT INTO payment_status_history (id, payment_id, previous_status, new_status, reason, context, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(history.id.as_uuid())
        .bind(history.payment_id.as_uuid())
        .bind(history.previous_status.as_str())
        .bind(history.new_status.as_str())
        .bind(&history.reason)
        .bind(&history.context)
        .bind(history.created_at)
        .execute(&mut *tx)
        .await?;

        Self::insert_webhook_events_in(&mut tx, &record.webhook_events).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_history(&self, payment_id: PaymentId) -> Result<Vec<PaymentStatusHistory>> {
        let rows = sqlx::query(
            r#"
            SELECT id, payment_id, previous_status, new_status, reason, context, created_at
            FROM payment_status_history
            WHERE payment_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(payment_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_history).collect()
    }

    async fn insert_webhook_events(&self, events: &[WebhookEvent]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::insert_webhook_events_in(&mut tx, events).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_webhook_event(&self, id: WebhookEventId) -> Result<Option<WebhookEvent>> {
        let row = sqlx::query(&format!(
            "SELECT {WEBHOOK_COLUMNS} FROM webhook_events WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_webhook).transpose()
    }

    async fn list_webhook_events(&self, query: WebhookEventQuery) -> Result<Vec<WebhookEvent>> {
        let mut sql = format!("SELECT {WEBHOOK_COLUMNS} FROM webhook_events WHERE 1=1");
        let mut param_count = 0;

        // Build dynamic query
        if query.payment_id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND payment_id = ${param_count}"));
        }
        if query.delivery_status.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND delivery_status = ${param_count}"));
        }
        if query.event_type.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND event_type = ${param_count}"));
        }

        sql.push_str(" ORDER BY created_at ASC, id ASC");

        if query.limit.is_some() {
            param_count += 1;
            sql.push_str(&format!(" LIMIT ${param_count}"));
        }
        if query.offset.is_some() {
            param_count += 1;
            sql.push_str(&format!(" OFFSET ${param_count}"));
        }

        let mut sqlx_query = sqlx::query(&sql);

        if let Some(payment_id) = query.payment_id {
            sqlx_query = sqlx_query.bind(payment_id.as_uuid());
        }
        if let Some(status) = query.delivery_status {
            sqlx_query = sqlx_query.bind(status.as_str());
        }
        if let Some(event_type) = query.event_type {
            sqlx_query = sqlx_query.bind(event_type.as_str());
        }
        if let Some(limit) = query.limit {
            sqlx_query = sqlx_query.bind(limit as i64);
        }
        if let Some(offset) = query.offset {
            sqlx_query = sqlx_query.bind(offset as i64);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_webhook).collect()
    }

    #[tracing::instrument(skip(self))]
    async fn claim_due_webhook_events(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: TimeDelta,
    ) -> Result<Vec<ClaimedWebhookEvent>> {
        let claim = DeliveryClaim::new(now + lease);

        // SKIP LOCKED keeps concurrent sweeps from blocking on, or
        // double-claiming, the same rows.
        let rows = sqlx::query(&format!(
            r#"
            WITH due AS (
                SELECT id FROM webhook_events
                WHERE delivery_status = 'PENDING'
                  AND next_retry_at <= $1
                  AND attempts < max_attempts
                  AND (claim_expires_at IS NULL OR claim_expires_at <= $1)
                ORDER BY next_retry_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE webhook_events w
            SET claim_token = $3, claim_expires_at = $4, updated_at = $1
            FROM due
            WHERE w.id = due.id
            RETURNING {}
            "#,
            qualified_webhook_columns()
        ))
        .bind(now)
        .bind(limit as i64)
        .bind(claim.token)
        .bind(claim.expires_at)
        .fetch_all(&self.pool)
        .await?;

        let mut claimed = rows
            .into_iter()
            .map(|row| Ok(ClaimedWebhookEvent {
                event: Self::row_to_webhook(row)?,
                claim,
            }))
            .collect::<Result<Vec<_>>>()?;
        claimed.sort_by_key(|c| c.event.next_retry_at);
        Ok(claimed)
    }

    async fn claim_webhook_event(
        &self,
        id: WebhookEventId,
        now: DateTime<Utc>,
        lease: TimeDelta,
    ) -> Result<Option<ClaimedWebhookEvent>> {
        let claim = DeliveryClaim::new(now + lease);

        let row = sqlx::query(&format!(
            r#"
            UPDATE webhook_events
            SET claim_token = $2, claim_expires_at = $3, updated_at = $4
            WHERE id = $1
              AND delivery_status = 'PENDING'
              AND next_retry_at <= $4
              AND attempts < max_attempts
              AND (claim_expires_at IS NULL OR claim_expires_at <= $4)
            RETURNING {WEBHOOK_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(claim.token)
        .bind(claim.expires_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(ClaimedWebhookEvent {
                event: Self::row_to_webhook(row)?,
                claim,
            })),
            None => match self.get_webhook_event(id).await? {
                Some(_) => Ok(None),
                None => Err(RepositoryError::webhook_event_not_found(id)),
            },
        }
    }

    #[tracing::instrument(skip(self, event), fields(event_id = %event.id))]
    async fn complete_delivery_attempt(
        &self,
        event: &WebhookEvent,
        claim_token: Uuid,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_events SET
                delivery_status = $3,
                attempts = $4,
                last_attempt_at = $5,
                next_retry_at = $6,
                delivered_at = $7,
                last_status_code = $8,
                last_error = $9,
                claim_token = NULL,
                claim_expires_at = NULL,
                updated_at = $10
            WHERE id = $1 AND claim_token = $2 AND delivery_status = 'PENDING'
            "#,
        )
        .bind(event.id.as_uuid())
        .bind(claim_token)
        .bind(event.delivery_status.as_str())
        .bind(to_i32(event.attempts))
        .bind(event.last_attempt_at)
        .bind(event.next_retry_at)
        .bind(event.delivered_at)
        .bind(event.last_status_code.map(i32::from))
        .bind(&event.last_error)
        .bind(event.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::ClaimLost { event_id: event.id });
        }
        Ok(())
    }

    async fn cancel_pending_webhook_events(
        &self,
        payment_id: PaymentId,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_events
            SET delivery_status = $2, next_retry_at = NULL, claim_token = NULL,
                claim_expires_at = NULL, updated_at = $3
            WHERE payment_id = $1 AND delivery_status = 'PENDING'
            "#,
        )
        .bind(payment_id.as_uuid())
        .bind(DeliveryStatus::Cancelled.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

fn qualified_webhook_columns() -> String {
    WEBHOOK_COLUMNS
        .split(", ")
        .map(|c| format!("w.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}
