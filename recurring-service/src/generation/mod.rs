//! Generation runs: the controller, its reporting types and the periodic trigger.

pub mod controller;
pub mod report;
pub mod scheduler;

pub use controller::{RecurringEngine, DEFAULT_CONCURRENCY};
pub use report::{
    GeneratedInvoice, GenerationSummary, RunBreakdown, RunReport, ScheduleOutcome, ScheduleResult,
    SkipReason,
};
pub use scheduler::GenerationScheduler;
