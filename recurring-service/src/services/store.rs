//! Storage seam for the generation engine.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use service_core::error::AppError;
use uuid::Uuid;

use crate::generation::RunReport;
use crate::models::{next_generate_date, Invoice, InvoiceDraft, RecurringSchedule, ScheduleRuleError};

/// Identifies the schedule and anchor date a generation is for.
///
/// A commit succeeds only if the schedule is still active and still anchored
/// at `anchor` when the store takes its lock, and the tenant's period counter
/// is still below `invoice_limit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleClaim {
    pub schedule_id: Uuid,
    pub tenant_id: Uuid,
    pub anchor: NaiveDate,
    /// Invoices allowed per period; `None` is unlimited.
    pub invoice_limit: Option<i32>,
}

impl ScheduleClaim {
    pub fn for_schedule(schedule: &RecurringSchedule) -> Self {
        Self {
            schedule_id: schedule.schedule_id,
            tenant_id: schedule.tenant_id,
            anchor: schedule.next_generate_date,
            invoice_limit: None,
        }
    }

    pub fn with_invoice_limit(mut self, limit: Option<i32>) -> Self {
        self.invoice_limit = limit;
        self
    }

    /// Whether one more invoice fits after `used` in the period.
    pub fn admits(&self, used: i32) -> bool {
        self.invoice_limit.is_none_or(|limit| used < limit)
    }
}

/// Schedule state written in the same transaction as the invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleAdvance {
    pub next_generate_date: NaiveDate,
    /// Next date falls after the end date; stop future generation.
    pub deactivate: bool,
    pub generated_at: DateTime<Utc>,
}

impl ScheduleAdvance {
    /// Advance for `schedule` after generating at `now`.
    pub fn after(
        schedule: &RecurringSchedule,
        now: DateTime<Utc>,
    ) -> Result<Self, ScheduleRuleError> {
        let next = next_generate_date(schedule.next_generate_date, &schedule.frequency)?;
        Ok(Self {
            next_generate_date: next,
            deactivate: schedule.end_date.is_some_and(|end| next > end),
            generated_at: now,
        })
    }
}

/// Result of an atomic generation commit.
#[derive(Debug, Clone)]
pub enum CommitOutcome {
    Generated(Invoice),
    /// Schedule was no longer active at the claimed anchor; nothing was written.
    ClaimLost,
    /// The period counter reached the claim's limit; nothing was written.
    QuotaExceeded,
}

/// First day of the usage period containing `date`.
pub fn usage_period(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// Schedule persistence used by the run controller.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Active schedules with `next_generate_date <= today` whose end date has not passed,
    /// each with its line templates in order.
    async fn find_due(&self, today: NaiveDate) -> Result<Vec<RecurringSchedule>, AppError>;

    /// Stop future generation for a schedule.
    async fn deactivate(&self, tenant_id: Uuid, schedule_id: Uuid, reason: &str)
        -> Result<(), AppError>;

    /// Atomically claim the schedule, bump the tenant's period counter within the
    /// claim's limit, allocate a number, persist the invoice and its lines, and
    /// advance or terminate the schedule. Either all of it happens or none of it does.
    async fn commit_generation(
        &self,
        claim: &ScheduleClaim,
        draft: &InvoiceDraft,
        advance: &ScheduleAdvance,
    ) -> Result<CommitOutcome, AppError>;

    /// Persist a finished run. Stores without run history ignore it.
    async fn record_run(&self, _report: &RunReport) -> Result<(), AppError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CreateSchedule, Frequency};
    use rust_decimal::Decimal;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn schedule(frequency: Frequency, next: NaiveDate, end: Option<NaiveDate>) -> RecurringSchedule {
        CreateSchedule {
            tenant_id: Uuid::new_v4(),
            client_id: Uuid::new_v4(),
            frequency,
            next_generate_date: next,
            end_date: end,
            tax_percent: Decimal::ZERO,
            discount_amount: Decimal::ZERO,
            currency: "USD".to_string(),
            template: "default".to_string(),
            notes: None,
            line_items: vec![],
        }
        .into_schedule(Utc::now())
    }

    #[test]
    fn advance_past_end_date_deactivates() {
        let t = date(2024, 3, 1);
        let s = schedule(Frequency::Monthly, t, Some(date(2024, 3, 16)));
        let advance = ScheduleAdvance::after(&s, Utc::now()).unwrap();

        assert_eq!(advance.next_generate_date, date(2024, 4, 1));
        assert!(advance.deactivate);
    }

    #[test]
    fn advance_landing_on_end_date_stays_active() {
        let s = schedule(Frequency::Weekly, date(2024, 3, 1), Some(date(2024, 3, 8)));
        let advance = ScheduleAdvance::after(&s, Utc::now()).unwrap();
        assert!(!advance.deactivate);
    }

    #[test]
    fn corrupt_frequency_is_an_error() {
        let mut s = schedule(Frequency::Monthly, date(2024, 3, 1), None);
        s.frequency = "daily".to_string();
        assert!(ScheduleAdvance::after(&s, Utc::now()).is_err());
    }

    #[test]
    fn claim_limit_is_exclusive() {
        let s = schedule(Frequency::Monthly, date(2024, 3, 1), None);
        let unlimited = ScheduleClaim::for_schedule(&s);
        assert!(unlimited.admits(10_000));

        let limited = unlimited.with_invoice_limit(Some(2));
        assert!(limited.admits(1));
        assert!(!limited.admits(2));
        assert!(!ScheduleClaim::for_schedule(&s).with_invoice_limit(Some(0)).admits(0));
    }

    #[test]
    fn usage_period_is_the_first_of_the_month() {
        assert_eq!(usage_period(date(2024, 2, 29)), date(2024, 2, 1));
    }
}
