//! Generation run controller.

use chrono::{DateTime, NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use rust_decimal::prelude::ToPrimitive;
use service_core::error::AppError;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::generation::report::{
    GeneratedInvoice, GenerationSummary, RunReport, ScheduleOutcome, ScheduleResult, SkipReason,
};
use crate::models::{RecurringSchedule, RUN_STATUS_COMPLETED};
use crate::services::assembler::assemble;
use crate::services::metrics::{
    record_error, record_generation_run, record_invoice_generated, record_schedule_outcome,
};
use crate::services::{AdmissionGate, CommitOutcome, ScheduleAdvance, ScheduleClaim, ScheduleStore};

pub const DEFAULT_CONCURRENCY: usize = 4;

/// Runs batch passes over due recurring schedules.
///
/// Each schedule is processed as its own unit of work with its own
/// transaction; a failure in one never affects the others.
#[derive(Clone)]
pub struct RecurringEngine {
    store: Arc<dyn ScheduleStore>,
    gate: Arc<dyn AdmissionGate>,
    concurrency: usize,
}

impl RecurringEngine {
    pub fn new(store: Arc<dyn ScheduleStore>, gate: Arc<dyn AdmissionGate>) -> Self {
        Self {
            store,
            gate,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    /// Bound on schedules processed at once; at least one.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Run one generation pass for the current date.
    pub async fn run_generation(&self) -> Result<GenerationSummary, AppError> {
        let now = Utc::now();
        let report = self.run_generation_on(now.date_naive(), now).await?;
        Ok(report.summary())
    }

    /// Run one generation pass as of `today`, stamping generated work with `now`.
    ///
    /// Fails only if the due set cannot be read.
    #[instrument(skip(self, now), fields(today = %today))]
    pub async fn run_generation_on(
        &self,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<RunReport, AppError> {
        let start = Instant::now();
        let run_id = Uuid::new_v4();

        let due = self.store.find_due(today).await.map_err(|e| {
            record_error(e.kind(), "find_due");
            record_generation_run("failed", start.elapsed().as_secs_f64());
            error!(run_id = %run_id, error = %e, "Generation run could not read due schedules");
            e
        })?;

        info!(run_id = %run_id, due = due.len(), "Generation run started");

        let mut indexed: Vec<(usize, ScheduleResult)> = stream::iter(due.into_iter().enumerate())
            .map(|(index, schedule)| {
                let engine = self.clone();
                async move { (index, engine.spawn_schedule(schedule, today, now).await) }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        indexed.sort_by_key(|(index, _)| *index);

        let report = RunReport {
            run_id,
            run_date: today,
            started_utc: now,
            completed_utc: Utc::now(),
            results: indexed.into_iter().map(|(_, result)| result).collect(),
        };

        for result in &report.results {
            record_schedule_outcome(result.outcome.label());
            if let Some(invoice) = result.outcome.invoice() {
                if let Some(amount) = invoice.total.to_f64() {
                    record_invoice_generated(&invoice.currency, amount);
                }
            }
        }

        if let Err(e) = self.store.record_run(&report).await {
            record_error(e.kind(), "record_run");
            warn!(run_id = %run_id, error = %e, "Failed to record generation run");
        }

        record_generation_run(RUN_STATUS_COMPLETED, start.elapsed().as_secs_f64());

        let summary = report.summary();
        let breakdown = report.breakdown();
        info!(
            run_id = %run_id,
            generated = summary.generated,
            skipped = summary.skipped,
            deactivated_by_end_date = breakdown.deactivated_by_end_date,
            feature_denied = breakdown.feature_denied,
            quota_exceeded = breakdown.quota_exceeded,
            claim_lost = breakdown.claim_lost,
            errored = breakdown.errored,
            duration_ms = start.elapsed().as_millis() as u64,
            "Generation run completed"
        );

        Ok(report)
    }

    /// Process one schedule on its own task so a panic is contained to it.
    async fn spawn_schedule(
        self,
        schedule: RecurringSchedule,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> ScheduleResult {
        let schedule_id = schedule.schedule_id;
        let tenant_id = schedule.tenant_id;

        let outcome = match tokio::spawn(async move { self.process_schedule(schedule, today, now).await }).await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                record_error("panic", "process_schedule");
                error!(schedule_id = %schedule_id, error = %e, "Schedule worker task failed");
                ScheduleOutcome::errored(format!("worker task failed: {}", e))
            }
        };

        ScheduleResult {
            schedule_id,
            tenant_id,
            outcome,
        }
    }

    #[instrument(
        skip(self, schedule, now),
        fields(schedule_id = %schedule.schedule_id, tenant_id = %schedule.tenant_id)
    )]
    async fn process_schedule(
        &self,
        schedule: RecurringSchedule,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> ScheduleOutcome {
        let schedule_id = schedule.schedule_id;
        let tenant_id = schedule.tenant_id;

        match self.gate.can_use_recurring(tenant_id).await {
            Ok(true) => {}
            Ok(false) => {
                let reason = SkipReason::FeatureNotPermitted;
                return match self.store.deactivate(tenant_id, schedule_id, reason.as_str()).await {
                    Ok(()) => {
                        info!("Recurring invoices not permitted on plan, schedule deactivated");
                        ScheduleOutcome::skipped(reason)
                    }
                    Err(e) => failed(schedule_id, "deactivate", &e),
                };
            }
            Err(e) => return failed(schedule_id, "can_use_recurring", &e),
        }

        match self.gate.can_create_invoice(tenant_id, today).await {
            Ok(true) => {}
            Ok(false) => {
                info!("Invoice quota reached, schedule left for the next run");
                return ScheduleOutcome::skipped(SkipReason::QuotaExceeded);
            }
            Err(e) => return failed(schedule_id, "can_create_invoice", &e),
        }
        let limit = match self.gate.invoice_limit(tenant_id).await {
            Ok(limit) => limit,
            Err(e) => return failed(schedule_id, "invoice_limit", &e),
        };

        let advance = match ScheduleAdvance::after(&schedule, now) {
            Ok(advance) => advance,
            Err(e) => {
                let e = AppError::BadRequest(anyhow::Error::new(e));
                return failed(schedule_id, "next_generate_date", &e);
            }
        };

        let claim = ScheduleClaim::for_schedule(&schedule).with_invoice_limit(limit);
        let draft = assemble(&schedule, today);

        match self.store.commit_generation(&claim, &draft, &advance).await {
            Ok(CommitOutcome::Generated(invoice)) => {
                let generated = GeneratedInvoice {
                    invoice_id: invoice.invoice_id,
                    invoice_number: invoice.invoice_number,
                    currency: invoice.currency,
                    total: invoice.total,
                };
                if advance.deactivate {
                    info!(end_date = ?schedule.end_date, "Final invoice generated, schedule ended");
                    ScheduleOutcome::Deactivated(generated)
                } else {
                    ScheduleOutcome::Generated(generated)
                }
            }
            Ok(CommitOutcome::ClaimLost) => {
                info!(anchor = %claim.anchor, "Schedule already generated for this anchor date");
                ScheduleOutcome::skipped(SkipReason::AlreadyGenerated)
            }
            Ok(CommitOutcome::QuotaExceeded) => {
                info!(limit = ?claim.invoice_limit, "Invoice quota filled by a concurrent generation");
                ScheduleOutcome::skipped(SkipReason::QuotaExceeded)
            }
            Err(e) => failed(schedule_id, "commit_generation", &e),
        }
    }
}

fn failed(schedule_id: Uuid, operation: &str, e: &AppError) -> ScheduleOutcome {
    record_error(e.kind(), operation);
    error!(
        schedule_id = %schedule_id,
        operation = %operation,
        error = %e,
        "Recurring invoice generation failed"
    );
    ScheduleOutcome::errored(e.to_string())
}
