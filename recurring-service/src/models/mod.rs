//! Domain models for recurring-service.

pub mod frequency;
pub mod generation_run;
pub mod invoice;
pub mod schedule;

pub use frequency::{next_generate_date, Frequency, ScheduleRuleError};
pub use generation_run::{GenerationRun, GenerationRunResult, RUN_STATUS_COMPLETED};
pub use invoice::{
    line_total, round_money, DraftLineItem, Invoice, InvoiceDraft, InvoiceLineItem, InvoiceStatus,
    InvoiceTotals,
};
pub use schedule::{CreateLineItemTemplate, CreateSchedule, LineItemTemplate, RecurringSchedule};
