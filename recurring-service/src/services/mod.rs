//! Services for recurring-service.

pub mod admission;
pub mod assembler;
pub mod database;
pub mod memory;
pub mod metrics;
pub mod numbering;
pub mod store;

pub use admission::{AdmissionGate, PlanAdmissionGate, StaticAdmissionGate, TenantPolicy};
pub use assembler::{assemble, DUE_DATE_OFFSET_DAYS};
pub use database::Database;
pub use memory::InMemoryStore;
pub use metrics::{get_metrics, init_metrics};
pub use numbering::{format_invoice_number, InvoiceNumberAllocator, INVOICE_NUMBER_PREFIX};
pub use store::{CommitOutcome, ScheduleAdvance, ScheduleClaim, ScheduleStore};
