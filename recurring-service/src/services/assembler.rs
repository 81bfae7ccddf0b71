//! Builds unsaved invoices from recurring schedules.

use chrono::{Days, NaiveDate};

use crate::models::{DraftLineItem, InvoiceDraft, InvoiceStatus, RecurringSchedule};

/// Days between generation and payment due date.
pub const DUE_DATE_OFFSET_DAYS: u64 = 30;

/// Assemble a draft invoice for `schedule`, generated on `generation_date`.
///
/// Header fields are copied from the schedule. Line totals are recomputed from
/// quantity and unit price. The draft records the anchor it was generated for.
pub fn assemble(schedule: &RecurringSchedule, generation_date: NaiveDate) -> InvoiceDraft {
    let mut templates: Vec<_> = schedule.line_items.iter().collect();
    templates.sort_by_key(|item| item.sort_order);

    let line_items = templates
        .into_iter()
        .map(|item| {
            DraftLineItem::new(
                item.product_id,
                item.description.clone(),
                item.quantity,
                item.unit_price,
            )
        })
        .collect();

    InvoiceDraft {
        tenant_id: schedule.tenant_id,
        client_id: schedule.client_id,
        status: InvoiceStatus::Draft,
        issue_date: generation_date,
        due_date: generation_date
            .checked_add_days(Days::new(DUE_DATE_OFFSET_DAYS))
            .unwrap_or(NaiveDate::MAX),
        currency: schedule.currency.clone(),
        tax_percent: schedule.tax_percent,
        discount_amount: schedule.discount_amount,
        notes: schedule.notes.clone(),
        template: schedule.template.clone(),
        recurring_schedule_id: Some(schedule.schedule_id),
        schedule_anchor_date: Some(schedule.next_generate_date),
        line_items,
    }
}
