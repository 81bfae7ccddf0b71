//! Generation run model.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Status recorded for a run whose results were all written.
pub const RUN_STATUS_COMPLETED: &str = "completed";

/// One batch pass over the due set.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct GenerationRun {
    pub run_id: Uuid,
    pub run_date: NaiveDate,
    pub status: String,
    pub started_utc: DateTime<Utc>,
    pub completed_utc: Option<DateTime<Utc>>,
    pub schedules_selected: i32,
    pub invoices_generated: i32,
    pub schedules_skipped: i32,
    pub schedules_errored: i32,
}

/// Outcome row for one schedule within a run.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct GenerationRunResult {
    pub result_id: Uuid,
    pub run_id: Uuid,
    pub schedule_id: Uuid,
    pub tenant_id: Uuid,
    /// Position of the schedule in the run's due-set order.
    pub ordinal: i32,
    pub status: String,
    pub reason: Option<String>,
    pub invoice_id: Option<Uuid>,
    pub error_message: Option<String>,
    pub created_utc: DateTime<Utc>,
}
