//! Common test utilities for recurring-service integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use recurring_service::generation::{RecurringEngine, RunReport};
use recurring_service::models::{
    CreateLineItemTemplate, CreateSchedule, DraftLineItem, Frequency, InvoiceDraft,
    InvoiceStatus, RecurringSchedule,
};
use recurring_service::services::{
    CommitOutcome, Database, InMemoryStore, ScheduleAdvance, ScheduleClaim, ScheduleStore,
    StaticAdmissionGate,
};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};
use uuid::Uuid;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,recurring_service=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Noon UTC on `day`, used as the run timestamp.
pub fn noon(day: NaiveDate) -> chrono::DateTime<Utc> {
    Utc.from_utc_datetime(&day.and_hms_opt(12, 0, 0).unwrap())
}

pub fn line(description: &str, quantity: i64, unit_price: i64) -> CreateLineItemTemplate {
    CreateLineItemTemplate {
        product_id: None,
        description: description.to_string(),
        quantity: Decimal::from(quantity),
        unit_price: Decimal::from(unit_price),
    }
}

/// Monthly schedule with two lines (2 @ 100, 1 @ 50), 10% tax and 20 discount.
pub fn monthly_schedule(tenant_id: Uuid, anchor: NaiveDate) -> CreateSchedule {
    CreateSchedule {
        tenant_id,
        client_id: Uuid::new_v4(),
        frequency: Frequency::Monthly,
        next_generate_date: anchor,
        end_date: None,
        tax_percent: Decimal::from(10),
        discount_amount: Decimal::from(20),
        currency: "USD".to_string(),
        template: "default".to_string(),
        notes: Some("Monthly retainer".to_string()),
        line_items: vec![line("Hosting", 2, 100), line("Support", 1, 50)],
    }
}

/// Invoice a tenant creates by hand, outside any schedule.
pub fn manual_draft(tenant_id: Uuid, issue_date: NaiveDate) -> InvoiceDraft {
    InvoiceDraft {
        tenant_id,
        client_id: Uuid::new_v4(),
        status: InvoiceStatus::Draft,
        issue_date,
        due_date: issue_date,
        currency: "USD".to_string(),
        tax_percent: Decimal::ZERO,
        discount_amount: Decimal::ZERO,
        notes: None,
        template: "default".to_string(),
        recurring_schedule_id: None,
        schedule_anchor_date: None,
        line_items: vec![DraftLineItem::new(
            None,
            "One-off work".to_string(),
            Decimal::ONE,
            Decimal::from(75),
        )],
    }
}

/// In-memory backend, static gate and an engine over them.
pub struct MemoryHarness {
    pub store: Arc<InMemoryStore>,
    pub gate: Arc<StaticAdmissionGate>,
    pub engine: RecurringEngine,
}

impl MemoryHarness {
    pub fn new() -> Self {
        init_tracing();
        let store = Arc::new(InMemoryStore::new());
        let gate = Arc::new(StaticAdmissionGate::allow_all().with_usage(store.clone()));
        let engine = RecurringEngine::new(store.clone(), gate.clone());
        Self {
            store,
            gate,
            engine,
        }
    }

    pub async fn run_on(&self, today: NaiveDate) -> RunReport {
        self.engine
            .run_generation_on(today, noon(today))
            .await
            .expect("generation run failed")
    }

    pub async fn schedule(&self, tenant_id: Uuid, schedule_id: Uuid) -> RecurringSchedule {
        self.store
            .get_schedule(tenant_id, schedule_id)
            .await
            .expect("schedule missing")
    }
}

/// Store wrapper that fails the next N commits for chosen schedules before
/// anything is written, as a transaction rolled back mid-flight would.
pub struct FlakyStore {
    inner: Arc<InMemoryStore>,
    failures: Mutex<HashMap<Uuid, usize>>,
}

impl FlakyStore {
    pub fn new(inner: Arc<InMemoryStore>) -> Self {
        Self {
            inner,
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn fail_commits(&self, schedule_id: Uuid, times: usize) {
        self.failures.lock().unwrap().insert(schedule_id, times);
    }

    fn take_failure(&self, schedule_id: Uuid) -> bool {
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(&schedule_id) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl ScheduleStore for FlakyStore {
    async fn find_due(&self, today: NaiveDate) -> Result<Vec<RecurringSchedule>, AppError> {
        self.inner.find_due(today).await
    }

    async fn deactivate(
        &self,
        tenant_id: Uuid,
        schedule_id: Uuid,
        reason: &str,
    ) -> Result<(), AppError> {
        self.inner.deactivate(tenant_id, schedule_id, reason).await
    }

    async fn commit_generation(
        &self,
        claim: &ScheduleClaim,
        draft: &InvoiceDraft,
        advance: &ScheduleAdvance,
    ) -> Result<CommitOutcome, AppError> {
        if self.take_failure(claim.schedule_id) {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "lock timeout while committing"
            )));
        }
        self.inner.commit_generation(claim, draft, advance).await
    }
}

/// Migrated PostgreSQL schema unique to one test.
pub struct TestDatabase {
    pub db: Database,
    admin: PgPool,
    schema: String,
}

impl TestDatabase {
    /// Connect using `TEST_DATABASE_URL`; `None` when it is not set.
    pub async fn connect() -> Option<Self> {
        init_tracing();
        let url = std::env::var("TEST_DATABASE_URL").ok()?;

        let admin = PgPoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await
            .expect("Failed to connect to TEST_DATABASE_URL");

        let schema = format!("recurring_test_{}", Uuid::new_v4().simple());
        admin
            .execute(format!("CREATE SCHEMA {}", schema).as_str())
            .await
            .expect("Failed to create test schema");

        let search_path = schema.clone();
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .after_connect(move |conn, _meta| {
                let statement = format!("SET search_path TO {}", search_path);
                Box::pin(async move {
                    conn.execute(statement.as_str()).await?;
                    Ok(())
                })
            })
            .connect(&url)
            .await
            .expect("Failed to connect test pool");

        let db = Database::from_pool(pool);
        db.run_migrations().await.expect("Failed to run migrations");

        Some(Self { db, admin, schema })
    }

    pub fn pool(&self) -> &PgPool {
        self.db.pool()
    }

    /// Drop the schema and everything in it.
    pub async fn cleanup(self) {
        self.db.pool().close().await;
        self.admin
            .execute(format!("DROP SCHEMA {} CASCADE", self.schema).as_str())
            .await
            .ok();
    }
}
