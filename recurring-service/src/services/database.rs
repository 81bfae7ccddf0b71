//! Database service for recurring-service.

use crate::generation::{RunReport, ScheduleOutcome};
use crate::models::{
    CreateSchedule, GenerationRun, GenerationRunResult, Invoice, InvoiceDraft, InvoiceLineItem,
    LineItemTemplate, RecurringSchedule, RUN_STATUS_COMPLETED,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::numbering::{format_invoice_number, InvoiceNumberAllocator};
use crate::services::store::{
    usage_period, CommitOutcome, ScheduleAdvance, ScheduleClaim, ScheduleStore,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use service_core::error::AppError;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Unique index guaranteeing one invoice per schedule per anchor date.
const SCHEDULE_ANCHOR_CONSTRAINT: &str = "uq_invoices_schedule_anchor";

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "recurring-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    // =========================================================================
    // Schedule Operations
    // =========================================================================

    /// Create a recurring schedule with its line templates.
    #[instrument(skip(self, input), fields(tenant_id = %input.tenant_id))]
    pub async fn create_schedule(&self, input: CreateSchedule) -> Result<RecurringSchedule, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_schedule"])
            .start_timer();

        let new_schedule = input.into_schedule(Utc::now());

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let mut schedule = sqlx::query_as::<_, RecurringSchedule>(
            r#"
            INSERT INTO recurring_schedules (schedule_id, tenant_id, client_id, frequency, next_generate_date, end_date, tax_percent, discount_amount, currency, template, notes)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING schedule_id, tenant_id, client_id, frequency, next_generate_date, end_date, is_active, tax_percent, discount_amount, currency, template, notes, total_generated, last_generated_utc, created_utc, updated_utc
            "#,
        )
        .bind(new_schedule.schedule_id)
        .bind(new_schedule.tenant_id)
        .bind(new_schedule.client_id)
        .bind(&new_schedule.frequency)
        .bind(new_schedule.next_generate_date)
        .bind(new_schedule.end_date)
        .bind(new_schedule.tax_percent)
        .bind(new_schedule.discount_amount)
        .bind(&new_schedule.currency)
        .bind(&new_schedule.template)
        .bind(&new_schedule.notes)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_check_violation() => {
                AppError::BadRequest(anyhow::anyhow!("Invalid schedule: {}", db_err.message()))
            }
            _ => AppError::DatabaseError(anyhow::anyhow!("Failed to create schedule: {}", e)),
        })?;

        for item in &new_schedule.line_items {
            let inserted = sqlx::query_as::<_, LineItemTemplate>(
                r#"
                INSERT INTO recurring_line_item_templates (template_item_id, schedule_id, product_id, description, quantity, unit_price, sort_order)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                RETURNING template_item_id, schedule_id, product_id, description, quantity, unit_price, sort_order
                "#,
            )
            .bind(item.template_item_id)
            .bind(item.schedule_id)
            .bind(item.product_id)
            .bind(&item.description)
            .bind(item.quantity)
            .bind(item.unit_price)
            .bind(item.sort_order)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to create line template: {}", e))
            })?;
            schedule.line_items.push(inserted);
        }

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        info!(
            schedule_id = %schedule.schedule_id,
            frequency = %schedule.frequency,
            next_generate_date = %schedule.next_generate_date,
            "Schedule created"
        );

        Ok(schedule)
    }

    /// Get a schedule by ID, with its line templates.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, schedule_id = %schedule_id))]
    pub async fn get_schedule(
        &self,
        tenant_id: Uuid,
        schedule_id: Uuid,
    ) -> Result<Option<RecurringSchedule>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_schedule"])
            .start_timer();

        let schedule = sqlx::query_as::<_, RecurringSchedule>(
            r#"
            SELECT schedule_id, tenant_id, client_id, frequency, next_generate_date, end_date, is_active, tax_percent, discount_amount, currency, template, notes, total_generated, last_generated_utc, created_utc, updated_utc
            FROM recurring_schedules
            WHERE tenant_id = $1 AND schedule_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(schedule_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get schedule: {}", e)))?;

        timer.observe_duration();

        match schedule {
            Some(mut schedule) => {
                let mut lines = self.load_line_templates(&[schedule.schedule_id]).await?;
                schedule.line_items = lines.remove(&schedule.schedule_id).unwrap_or_default();
                Ok(Some(schedule))
            }
            None => Ok(None),
        }
    }

    /// Line templates for the given schedules, grouped and in sort order.
    async fn load_line_templates(
        &self,
        schedule_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, Vec<LineItemTemplate>>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["load_line_templates"])
            .start_timer();

        let items = sqlx::query_as::<_, LineItemTemplate>(
            r#"
            SELECT template_item_id, schedule_id, product_id, description, quantity, unit_price, sort_order
            FROM recurring_line_item_templates
            WHERE schedule_id = ANY($1)
            ORDER BY schedule_id, sort_order, template_item_id
            "#,
        )
        .bind(schedule_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to load line templates: {}", e))
        })?;

        timer.observe_duration();

        let mut grouped: HashMap<Uuid, Vec<LineItemTemplate>> = HashMap::new();
        for item in items {
            grouped.entry(item.schedule_id).or_default().push(item);
        }
        Ok(grouped)
    }

    // =========================================================================
    // Invoice Operations
    // =========================================================================

    /// Create an invoice by direct tenant action.
    ///
    /// Shares the allocator and period counter with generated invoices.
    #[instrument(skip(self, draft), fields(tenant_id = %draft.tenant_id))]
    pub async fn create_invoice(&self, draft: &InvoiceDraft) -> Result<Invoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_invoice"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        // Usage row before the sequence row, matching commit_generation's lock order
        increment_period_usage(&mut *tx, draft.tenant_id, usage_period(draft.issue_date), None).await?;
        let invoice_number = allocate_invoice_number(&mut *tx, draft.tenant_id).await?;
        let invoice = insert_invoice(&mut *tx, draft, invoice_number, Utc::now())
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create invoice: {}", e)))?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        info!(invoice_id = %invoice.invoice_id, invoice_number = %invoice.invoice_number, "Invoice created");

        Ok(invoice)
    }

    /// Get an invoice by ID, including soft-deleted ones.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    pub async fn get_invoice(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT invoice_id, tenant_id, client_id, invoice_number, status, issue_date, due_date, currency, subtotal, tax_percent, tax_amount, discount_amount, total, notes, template, recurring_schedule_id, schedule_anchor_date, created_utc, deleted_utc
            FROM invoices
            WHERE tenant_id = $1 AND invoice_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get invoice: {}", e)))?;

        timer.observe_duration();

        Ok(invoice)
    }

    /// Line items of an invoice in order.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    pub async fn get_invoice_line_items(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Vec<InvoiceLineItem>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice_line_items"])
            .start_timer();

        let items = sqlx::query_as::<_, InvoiceLineItem>(
            r#"
            SELECT line_item_id, invoice_id, tenant_id, product_id, description, quantity, unit_price, total, sort_order
            FROM invoice_line_items
            WHERE tenant_id = $1 AND invoice_id = $2
            ORDER BY sort_order
            "#,
        )
        .bind(tenant_id)
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get invoice line items: {}", e))
        })?;

        timer.observe_duration();

        Ok(items)
    }

    /// Invoices generated from a schedule, oldest first.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, schedule_id = %schedule_id))]
    pub async fn list_schedule_invoices(
        &self,
        tenant_id: Uuid,
        schedule_id: Uuid,
    ) -> Result<Vec<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_schedule_invoices"])
            .start_timer();

        let invoices = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT invoice_id, tenant_id, client_id, invoice_number, status, issue_date, due_date, currency, subtotal, tax_percent, tax_amount, discount_amount, total, notes, template, recurring_schedule_id, schedule_anchor_date, created_utc, deleted_utc
            FROM invoices
            WHERE tenant_id = $1 AND recurring_schedule_id = $2
            ORDER BY schedule_anchor_date, created_utc
            "#,
        )
        .bind(tenant_id)
        .bind(schedule_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list schedule invoices: {}", e))
        })?;

        timer.observe_duration();

        Ok(invoices)
    }

    /// Soft-delete an invoice. Its number stays reserved.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    pub async fn soft_delete_invoice(&self, tenant_id: Uuid, invoice_id: Uuid) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["soft_delete_invoice"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE invoices
            SET deleted_utc = NOW()
            WHERE tenant_id = $1 AND invoice_id = $2 AND deleted_utc IS NULL
            "#,
        )
        .bind(tenant_id)
        .bind(invoice_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to delete invoice: {}", e)))?;

        timer.observe_duration();

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Tenant Plan Operations
    // =========================================================================

    /// Create or replace a tenant's plan capabilities.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn set_tenant_plan(
        &self,
        tenant_id: Uuid,
        plan: &str,
        recurring_enabled: bool,
        monthly_invoice_limit: Option<i32>,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_tenant_plan"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO tenant_plans (tenant_id, plan, recurring_enabled, monthly_invoice_limit)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (tenant_id) DO UPDATE
            SET plan = EXCLUDED.plan,
                recurring_enabled = EXCLUDED.recurring_enabled,
                monthly_invoice_limit = EXCLUDED.monthly_invoice_limit,
                updated_utc = NOW()
            "#,
        )
        .bind(tenant_id)
        .bind(plan)
        .bind(recurring_enabled)
        .bind(monthly_invoice_limit)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to set tenant plan: {}", e)))?;

        timer.observe_duration();
        info!(plan = %plan, recurring_enabled, "Tenant plan updated");

        Ok(())
    }

    /// Invoices counted against the tenant in the period containing `date`.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn get_period_usage(&self, tenant_id: Uuid, date: NaiveDate) -> Result<i32, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_period_usage"])
            .start_timer();

        let count = sqlx::query_scalar::<_, i32>(
            r#"
            SELECT invoice_count
            FROM tenant_invoice_usage
            WHERE tenant_id = $1 AND period_start = $2
            "#,
        )
        .bind(tenant_id)
        .bind(usage_period(date))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get usage: {}", e)))?;

        timer.observe_duration();

        Ok(count.unwrap_or(0))
    }

    // =========================================================================
    // Generation Run Operations
    // =========================================================================

    /// Get a generation run by ID.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn get_generation_run(&self, run_id: Uuid) -> Result<Option<GenerationRun>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_generation_run"])
            .start_timer();

        let run = sqlx::query_as::<_, GenerationRun>(
            r#"
            SELECT run_id, run_date, status, started_utc, completed_utc, schedules_selected, invoices_generated, schedules_skipped, schedules_errored
            FROM generation_runs
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get generation run: {}", e)))?;

        timer.observe_duration();

        Ok(run)
    }

    /// Per-schedule results of a generation run.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn get_generation_run_results(
        &self,
        run_id: Uuid,
    ) -> Result<Vec<GenerationRunResult>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_generation_run_results"])
            .start_timer();

        let results = sqlx::query_as::<_, GenerationRunResult>(
            r#"
            SELECT result_id, run_id, schedule_id, tenant_id, ordinal, status, reason, invoice_id, error_message, created_utc
            FROM generation_run_results
            WHERE run_id = $1
            ORDER BY ordinal
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get generation run results: {}", e))
        })?;

        timer.observe_duration();

        Ok(results)
    }
}

/// Next invoice number for a tenant, inside the caller's transaction.
///
/// The upsert takes the row lock on the tenant's sequence, which is held until
/// the transaction ends. A new row is seeded from the highest `INV-` suffix
/// already issued, soft-deleted invoices included; an existing row never moves
/// below that suffix either.
async fn allocate_invoice_number(conn: &mut PgConnection, tenant_id: Uuid) -> Result<String, AppError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["allocate_invoice_number"])
        .start_timer();

    let sequence = sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO invoice_sequences (tenant_id, last_value)
        SELECT $1, COALESCE(MAX(CAST(SUBSTRING(invoice_number FROM 5) AS BIGINT)), 0) + 1
        FROM invoices
        WHERE tenant_id = $1 AND invoice_number ~ '^INV-[0-9]+$'
        ON CONFLICT (tenant_id) DO UPDATE
        SET last_value = GREATEST(invoice_sequences.last_value + 1, EXCLUDED.last_value),
            updated_utc = NOW()
        RETURNING last_value
        "#,
    )
    .bind(tenant_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to allocate invoice number: {}", e)))?;

    timer.observe_duration();

    Ok(format_invoice_number(sequence))
}

/// Insert the invoice header and lines for `draft`.
async fn insert_invoice(
    conn: &mut PgConnection,
    draft: &InvoiceDraft,
    invoice_number: String,
    now: DateTime<Utc>,
) -> Result<Invoice, sqlx::Error> {
    let row = draft.to_invoice(invoice_number, now);

    let invoice = sqlx::query_as::<_, Invoice>(
        r#"
        INSERT INTO invoices (invoice_id, tenant_id, client_id, invoice_number, status, issue_date, due_date, currency, subtotal, tax_percent, tax_amount, discount_amount, total, notes, template, recurring_schedule_id, schedule_anchor_date, created_utc)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
        RETURNING invoice_id, tenant_id, client_id, invoice_number, status, issue_date, due_date, currency, subtotal, tax_percent, tax_amount, discount_amount, total, notes, template, recurring_schedule_id, schedule_anchor_date, created_utc, deleted_utc
        "#,
    )
    .bind(row.invoice_id)
    .bind(row.tenant_id)
    .bind(row.client_id)
    .bind(&row.invoice_number)
    .bind(&row.status)
    .bind(row.issue_date)
    .bind(row.due_date)
    .bind(&row.currency)
    .bind(row.subtotal)
    .bind(row.tax_percent)
    .bind(row.tax_amount)
    .bind(row.discount_amount)
    .bind(row.total)
    .bind(&row.notes)
    .bind(&row.template)
    .bind(row.recurring_schedule_id)
    .bind(row.schedule_anchor_date)
    .bind(row.created_utc)
    .fetch_one(&mut *conn)
    .await?;

    for item in draft.to_line_items(invoice.invoice_id) {
        sqlx::query(
            r#"
            INSERT INTO invoice_line_items (line_item_id, invoice_id, tenant_id, product_id, description, quantity, unit_price, total, sort_order)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(item.line_item_id)
        .bind(item.invoice_id)
        .bind(item.tenant_id)
        .bind(item.product_id)
        .bind(&item.description)
        .bind(item.quantity)
        .bind(item.unit_price)
        .bind(item.total)
        .bind(item.sort_order)
        .execute(&mut *conn)
        .await?;
    }

    Ok(invoice)
}

/// Count one invoice against the period. Returns false, writing nothing, when
/// the count already reached `limit`.
async fn increment_period_usage(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    period_start: NaiveDate,
    limit: Option<i32>,
) -> Result<bool, AppError> {
    let counted = sqlx::query_scalar::<_, i32>(
        r#"
        INSERT INTO tenant_invoice_usage (tenant_id, period_start, invoice_count)
        SELECT $1, $2, 1
        WHERE $3::INT IS NULL OR $3::INT > 0
        ON CONFLICT (tenant_id, period_start) DO UPDATE
        SET invoice_count = tenant_invoice_usage.invoice_count + 1
        WHERE $3::INT IS NULL OR tenant_invoice_usage.invoice_count < $3::INT
        RETURNING invoice_count
        "#,
    )
    .bind(tenant_id)
    .bind(period_start)
    .bind(limit)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to increment usage: {}", e)))?;

    Ok(counted.is_some())
}

fn is_schedule_anchor_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.is_unique_violation() && db_err.constraint() == Some(SCHEDULE_ANCHOR_CONSTRAINT)
        }
        _ => false,
    }
}

#[async_trait]
impl ScheduleStore for Database {
    #[instrument(skip(self))]
    async fn find_due(&self, today: NaiveDate) -> Result<Vec<RecurringSchedule>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_due"])
            .start_timer();

        let mut schedules = sqlx::query_as::<_, RecurringSchedule>(
            r#"
            SELECT schedule_id, tenant_id, client_id, frequency, next_generate_date, end_date, is_active, tax_percent, discount_amount, currency, template, notes, total_generated, last_generated_utc, created_utc, updated_utc
            FROM recurring_schedules
            WHERE is_active = TRUE
              AND next_generate_date <= $1
              AND (end_date IS NULL OR end_date >= $1)
            ORDER BY next_generate_date, schedule_id
            "#,
        )
        .bind(today)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to find due schedules: {}", e)))?;

        timer.observe_duration();

        if !schedules.is_empty() {
            let ids: Vec<Uuid> = schedules.iter().map(|s| s.schedule_id).collect();
            let mut lines = self.load_line_templates(&ids).await?;
            for schedule in &mut schedules {
                schedule.line_items = lines.remove(&schedule.schedule_id).unwrap_or_default();
            }
        }

        Ok(schedules)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, schedule_id = %schedule_id))]
    async fn deactivate(
        &self,
        tenant_id: Uuid,
        schedule_id: Uuid,
        reason: &str,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["deactivate_schedule"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE recurring_schedules
            SET is_active = FALSE, updated_utc = NOW()
            WHERE tenant_id = $1 AND schedule_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(schedule_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to deactivate schedule: {}", e)))?;

        timer.observe_duration();
        info!(reason = %reason, "Schedule deactivated");

        Ok(())
    }

    #[instrument(
        skip(self, draft, advance),
        fields(tenant_id = %claim.tenant_id, schedule_id = %claim.schedule_id, anchor = %claim.anchor)
    )]
    async fn commit_generation(
        &self,
        claim: &ScheduleClaim,
        draft: &InvoiceDraft,
        advance: &ScheduleAdvance,
    ) -> Result<CommitOutcome, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["commit_generation"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        // Claim: the row lock serialises competing runs on this schedule
        let claimed = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT schedule_id
            FROM recurring_schedules
            WHERE schedule_id = $1 AND tenant_id = $2 AND is_active = TRUE AND next_generate_date = $3
            FOR UPDATE
            "#,
        )
        .bind(claim.schedule_id)
        .bind(claim.tenant_id)
        .bind(claim.anchor)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to claim schedule: {}", e)))?;

        if claimed.is_none() {
            tx.rollback().await.ok();
            timer.observe_duration();
            return Ok(CommitOutcome::ClaimLost);
        }

        let period = usage_period(draft.issue_date);
        if !increment_period_usage(&mut *tx, claim.tenant_id, period, claim.invoice_limit).await? {
            info!(limit = ?claim.invoice_limit, "Invoice quota reached at commit");
            tx.rollback().await.ok();
            timer.observe_duration();
            return Ok(CommitOutcome::QuotaExceeded);
        }

        let invoice_number = allocate_invoice_number(&mut *tx, claim.tenant_id).await?;

        let invoice = match insert_invoice(&mut *tx, draft, invoice_number, advance.generated_at).await {
            Ok(invoice) => invoice,
            Err(ref e) if is_schedule_anchor_violation(e) => {
                warn!("Invoice already exists for this anchor date");
                tx.rollback().await.ok();
                timer.observe_duration();
                return Ok(CommitOutcome::ClaimLost);
            }
            Err(e) => {
                return Err(AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to insert invoice: {}",
                    e
                )));
            }
        };

        sqlx::query(
            r#"
            UPDATE recurring_schedules
            SET next_generate_date = $3,
                is_active = is_active AND NOT $4,
                total_generated = total_generated + 1,
                last_generated_utc = $5,
                updated_utc = NOW()
            WHERE schedule_id = $1 AND tenant_id = $2
            "#,
        )
        .bind(claim.schedule_id)
        .bind(claim.tenant_id)
        .bind(advance.next_generate_date)
        .bind(advance.deactivate)
        .bind(advance.generated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to advance schedule: {}", e)))?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        info!(
            invoice_id = %invoice.invoice_id,
            invoice_number = %invoice.invoice_number,
            next_generate_date = %advance.next_generate_date,
            deactivated = advance.deactivate,
            "Invoice generated"
        );

        Ok(CommitOutcome::Generated(invoice))
    }

    #[instrument(skip(self, report), fields(run_id = %report.run_id))]
    async fn record_run(&self, report: &RunReport) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_run"])
            .start_timer();

        let breakdown = report.breakdown();
        let summary = report.summary();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        sqlx::query(
            r#"
            INSERT INTO generation_runs (run_id, run_date, status, started_utc, completed_utc, schedules_selected, invoices_generated, schedules_skipped, schedules_errored)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(report.run_id)
        .bind(report.run_date)
        .bind(RUN_STATUS_COMPLETED)
        .bind(report.started_utc)
        .bind(report.completed_utc)
        .bind(report.selected() as i32)
        .bind(summary.generated as i32)
        .bind(summary.skipped as i32)
        .bind(breakdown.errored as i32)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to record run: {}", e)))?;

        for (ordinal, result) in report.results.iter().enumerate() {
            let (status, reason, error_message) = match &result.outcome {
                ScheduleOutcome::Generated(_) => ("generated", None, None),
                ScheduleOutcome::Deactivated(_) => ("deactivated", None, None),
                ScheduleOutcome::Skipped(reason) => {
                    ("skipped", Some(reason.as_str()), None)
                }
                ScheduleOutcome::Errored(message) => {
                    ("errored", None, Some(message.as_str()))
                }
            };

            sqlx::query(
                r#"
                INSERT INTO generation_run_results (result_id, run_id, schedule_id, tenant_id, ordinal, status, reason, invoice_id, error_message)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(report.run_id)
            .bind(result.schedule_id)
            .bind(result.tenant_id)
            .bind(ordinal as i32)
            .bind(status)
            .bind(reason)
            .bind(result.outcome.invoice().map(|i| i.invoice_id))
            .bind(error_message)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to record run result: {}", e))
            })?;
        }

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();

        Ok(())
    }
}

#[async_trait]
impl InvoiceNumberAllocator for Database {
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn allocate(&self, tenant_id: Uuid) -> Result<String, AppError> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let invoice_number = allocate_invoice_number(&mut *tx, tenant_id).await?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        Ok(invoice_number)
    }
}
