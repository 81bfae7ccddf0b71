//! Per-schedule outcomes and run reporting.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

/// Why a selected schedule produced no invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Tenant plan no longer includes recurring invoices; the schedule was deactivated.
    FeatureNotPermitted,
    /// Tenant reached its period invoice limit; retried next run.
    QuotaExceeded,
    /// Another run already generated for this anchor date.
    AlreadyGenerated,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::FeatureNotPermitted => "feature_not_permitted",
            SkipReason::QuotaExceeded => "quota_exceeded",
            SkipReason::AlreadyGenerated => "already_generated",
        }
    }
}

/// Invoice produced for a schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeneratedInvoice {
    pub invoice_id: Uuid,
    pub invoice_number: String,
    pub currency: String,
    pub total: Decimal,
}

/// Terminal state of one schedule within one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum ScheduleOutcome {
    /// Invoice generated and the schedule advanced.
    Generated(GeneratedInvoice),
    /// Final invoice generated; the next date passed the end date so the schedule stopped.
    Deactivated(GeneratedInvoice),
    Skipped(SkipReason),
    /// Processing failed; the schedule is unchanged.
    Errored(String),
}

impl ScheduleOutcome {
    pub fn skipped(reason: SkipReason) -> Self {
        ScheduleOutcome::Skipped(reason)
    }

    pub fn errored(message: impl Into<String>) -> Self {
        ScheduleOutcome::Errored(message.into())
    }

    /// Metric and storage label.
    pub fn label(&self) -> &'static str {
        match self {
            ScheduleOutcome::Generated(_) => "generated",
            ScheduleOutcome::Deactivated(_) => "deactivated",
            ScheduleOutcome::Skipped(reason) => reason.as_str(),
            ScheduleOutcome::Errored(_) => "errored",
        }
    }

    pub fn invoice(&self) -> Option<&GeneratedInvoice> {
        match self {
            ScheduleOutcome::Generated(invoice) | ScheduleOutcome::Deactivated(invoice) => {
                Some(invoice)
            }
            _ => None,
        }
    }

    pub fn is_generated(&self) -> bool {
        self.invoice().is_some()
    }
}

/// Outcome for one schedule.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleResult {
    pub schedule_id: Uuid,
    pub tenant_id: Uuid,
    pub outcome: ScheduleOutcome,
}

/// The simple run summary; errored schedules count as skipped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GenerationSummary {
    pub generated: usize,
    pub skipped: usize,
}

/// Counts broken out by outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunBreakdown {
    pub generated: usize,
    pub deactivated_by_end_date: usize,
    pub feature_denied: usize,
    pub quota_exceeded: usize,
    pub claim_lost: usize,
    pub errored: usize,
}

/// Full record of one generation run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub run_date: NaiveDate,
    pub started_utc: DateTime<Utc>,
    pub completed_utc: DateTime<Utc>,
    pub results: Vec<ScheduleResult>,
}

impl RunReport {
    pub fn summary(&self) -> GenerationSummary {
        let generated = self.results.iter().filter(|r| r.outcome.is_generated()).count();
        GenerationSummary {
            generated,
            skipped: self.results.len() - generated,
        }
    }

    pub fn breakdown(&self) -> RunBreakdown {
        let mut breakdown = RunBreakdown::default();
        for result in &self.results {
            match &result.outcome {
                ScheduleOutcome::Generated(_) => breakdown.generated += 1,
                // A terminated schedule still produced its final invoice
                ScheduleOutcome::Deactivated(_) => {
                    breakdown.generated += 1;
                    breakdown.deactivated_by_end_date += 1;
                }
                ScheduleOutcome::Skipped(reason) => match reason {
                    SkipReason::FeatureNotPermitted => breakdown.feature_denied += 1,
                    SkipReason::QuotaExceeded => breakdown.quota_exceeded += 1,
                    SkipReason::AlreadyGenerated => breakdown.claim_lost += 1,
                },
                ScheduleOutcome::Errored(_) => breakdown.errored += 1,
            }
        }
        breakdown
    }

    pub fn selected(&self) -> usize {
        self.results.len()
    }

    /// Result for a given schedule, if it was selected in this run.
    pub fn outcome_for(&self, schedule_id: Uuid) -> Option<&ScheduleOutcome> {
        self.results
            .iter()
            .find(|r| r.schedule_id == schedule_id)
            .map(|r| &r.outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invoice(n: u32) -> GeneratedInvoice {
        GeneratedInvoice {
            invoice_id: Uuid::new_v4(),
            invoice_number: format!("INV-{:04}", n),
            currency: "USD".to_string(),
            total: Decimal::from(100),
        }
    }

    fn report(outcomes: Vec<ScheduleOutcome>) -> RunReport {
        let now = Utc::now();
        RunReport {
            run_id: Uuid::new_v4(),
            run_date: now.date_naive(),
            started_utc: now,
            completed_utc: now,
            results: outcomes
                .into_iter()
                .map(|outcome| ScheduleResult {
                    schedule_id: Uuid::new_v4(),
                    tenant_id: Uuid::new_v4(),
                    outcome,
                })
                .collect(),
        }
    }

    #[test]
    fn summary_merges_every_non_generated_outcome_into_skipped() {
        let report = report(vec![
            ScheduleOutcome::Generated(invoice(1)),
            ScheduleOutcome::Deactivated(invoice(2)),
            ScheduleOutcome::skipped(SkipReason::FeatureNotPermitted),
            ScheduleOutcome::skipped(SkipReason::QuotaExceeded),
            ScheduleOutcome::errored("connection reset"),
        ]);

        assert_eq!(
            report.summary(),
            GenerationSummary {
                generated: 2,
                skipped: 3
            }
        );
    }

    #[test]
    fn breakdown_counts_each_reason() {
        let report = report(vec![
            ScheduleOutcome::Generated(invoice(1)),
            ScheduleOutcome::Deactivated(invoice(2)),
            ScheduleOutcome::skipped(SkipReason::AlreadyGenerated),
            ScheduleOutcome::skipped(SkipReason::QuotaExceeded),
            ScheduleOutcome::errored("boom"),
            ScheduleOutcome::errored("boom again"),
        ]);

        let breakdown = report.breakdown();
        assert_eq!(breakdown.generated, 2);
        assert_eq!(breakdown.deactivated_by_end_date, 1);
        assert_eq!(breakdown.claim_lost, 1);
        assert_eq!(breakdown.quota_exceeded, 1);
        assert_eq!(breakdown.feature_denied, 0);
        assert_eq!(breakdown.errored, 2);
    }

    #[test]
    fn empty_run_reports_zeroes() {
        let report = report(vec![]);
        assert_eq!(report.summary(), GenerationSummary::default());
        assert_eq!(report.selected(), 0);
    }

    #[test]
    fn labels_name_the_skip_reason() {
        assert_eq!(
            ScheduleOutcome::skipped(SkipReason::QuotaExceeded).label(),
            "quota_exceeded"
        );
        assert_eq!(ScheduleOutcome::errored("x").label(), "errored");
    }
}
