//! In-process storage backend.
//!
//! All state for a tenant lives behind one `tokio::sync::Mutex`, so number
//! allocation, claims and commits are serialised per tenant while different
//! tenants proceed independently. Suitable for single-process deployments and
//! tests; nothing is durable.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::models::{
    CreateSchedule, Invoice, InvoiceDraft, InvoiceLineItem, RecurringSchedule,
};
use crate::services::numbering::{format_invoice_number, next_sequence, InvoiceNumberAllocator};
use crate::services::store::{
    usage_period, CommitOutcome, ScheduleAdvance, ScheduleClaim, ScheduleStore,
};

#[derive(Debug, Default)]
struct TenantBook {
    schedules: HashMap<Uuid, RecurringSchedule>,
    invoices: Vec<Invoice>,
    line_items: Vec<InvoiceLineItem>,
    last_sequence: i64,
    usage: HashMap<NaiveDate, i32>,
}

impl TenantBook {
    fn allocate(&mut self) -> String {
        let issued = next_sequence(self.invoices.iter().map(|i| i.invoice_number.as_str()));
        self.last_sequence = (self.last_sequence + 1).max(issued);
        format_invoice_number(self.last_sequence)
    }

    fn persist(&mut self, draft: &InvoiceDraft, invoice_number: String) -> Invoice {
        let invoice = draft.to_invoice(invoice_number, Utc::now());
        self.line_items.extend(draft.to_line_items(invoice.invoice_id));
        *self.usage.entry(usage_period(draft.issue_date)).or_insert(0) += 1;
        self.invoices.push(invoice.clone());
        invoice
    }

    fn has_invoice_for(&self, schedule_id: Uuid, anchor: NaiveDate) -> bool {
        self.invoices.iter().any(|i| {
            i.recurring_schedule_id == Some(schedule_id) && i.schedule_anchor_date == Some(anchor)
        })
    }
}

/// Per-tenant in-memory store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tenants: DashMap<Uuid, Arc<Mutex<TenantBook>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn book(&self, tenant_id: Uuid) -> Arc<Mutex<TenantBook>> {
        self.tenants.entry(tenant_id).or_default().clone()
    }

    fn books(&self) -> Vec<Arc<Mutex<TenantBook>>> {
        self.tenants.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Create a schedule from tenant input.
    pub async fn create_schedule(&self, input: CreateSchedule) -> RecurringSchedule {
        let schedule = input.into_schedule(Utc::now());
        self.put_schedule(schedule.clone()).await;
        schedule
    }

    /// Store a schedule record as-is, replacing any with the same id.
    pub async fn put_schedule(&self, schedule: RecurringSchedule) {
        let book = self.book(schedule.tenant_id);
        let mut book = book.lock().await;
        book.schedules.insert(schedule.schedule_id, schedule);
    }

    pub async fn get_schedule(&self, tenant_id: Uuid, schedule_id: Uuid) -> Option<RecurringSchedule> {
        let book = self.book(tenant_id);
        let book = book.lock().await;
        book.schedules.get(&schedule_id).cloned()
    }

    /// Create an invoice by direct tenant action.
    pub async fn create_invoice(&self, draft: &InvoiceDraft) -> Invoice {
        let book = self.book(draft.tenant_id);
        let mut book = book.lock().await;
        let number = book.allocate();
        book.persist(draft, number)
    }

    /// Soft-delete an invoice. Its number stays reserved.
    pub async fn soft_delete_invoice(&self, tenant_id: Uuid, invoice_id: Uuid) -> bool {
        let book = self.book(tenant_id);
        let mut book = book.lock().await;
        match book
            .invoices
            .iter_mut()
            .find(|i| i.invoice_id == invoice_id && i.deleted_utc.is_none())
        {
            Some(invoice) => {
                invoice.deleted_utc = Some(Utc::now());
                true
            }
            None => false,
        }
    }

    /// All invoices of a tenant in creation order, soft-deleted included.
    pub async fn list_invoices(&self, tenant_id: Uuid) -> Vec<Invoice> {
        let book = self.book(tenant_id);
        let book = book.lock().await;
        book.invoices.clone()
    }

    pub async fn get_invoice_line_items(&self, tenant_id: Uuid, invoice_id: Uuid) -> Vec<InvoiceLineItem> {
        let book = self.book(tenant_id);
        let book = book.lock().await;
        let mut items: Vec<_> = book
            .line_items
            .iter()
            .filter(|l| l.invoice_id == invoice_id)
            .cloned()
            .collect();
        items.sort_by_key(|l| l.sort_order);
        items
    }

    /// Invoices counted against the tenant in the period containing `date`.
    pub async fn period_invoice_count(&self, tenant_id: Uuid, date: NaiveDate) -> i32 {
        let book = self.book(tenant_id);
        let book = book.lock().await;
        book.usage.get(&usage_period(date)).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ScheduleStore for InMemoryStore {
    async fn find_due(&self, today: NaiveDate) -> Result<Vec<RecurringSchedule>, AppError> {
        let mut due = Vec::new();
        for book in self.books() {
            let book = book.lock().await;
            due.extend(book.schedules.values().filter(|s| s.is_due(today)).cloned());
        }
        due.sort_by_key(|s| (s.next_generate_date, s.schedule_id));
        Ok(due)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, schedule_id = %schedule_id))]
    async fn deactivate(
        &self,
        tenant_id: Uuid,
        schedule_id: Uuid,
        reason: &str,
    ) -> Result<(), AppError> {
        let book = self.book(tenant_id);
        let mut book = book.lock().await;
        let schedule = book
            .schedules
            .get_mut(&schedule_id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Schedule {} not found", schedule_id)))?;
        schedule.is_active = false;
        schedule.updated_utc = Utc::now();
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
        let book = self.book(claim.tenant_id);
        let mut book = book.lock().await;

        let still_due = book
            .schedules
            .get(&claim.schedule_id)
            .is_some_and(|s| s.is_active && s.next_generate_date == claim.anchor);
        if !still_due || book.has_invoice_for(claim.schedule_id, claim.anchor) {
            return Ok(CommitOutcome::ClaimLost);
        }
        let used = book.usage.get(&usage_period(draft.issue_date)).copied().unwrap_or(0);
        if !claim.admits(used) {
            info!(used, limit = ?claim.invoice_limit, "Invoice quota reached at commit");
            return Ok(CommitOutcome::QuotaExceeded);
        }

        let number = book.allocate();
        let invoice = book.persist(draft, number);

        if let Some(schedule) = book.schedules.get_mut(&claim.schedule_id) {
            schedule.next_generate_date = advance.next_generate_date;
            schedule.is_active = schedule.is_active && !advance.deactivate;
            schedule.total_generated += 1;
            schedule.last_generated_utc = Some(advance.generated_at);
            schedule.updated_utc = advance.generated_at;
        }

        info!(
            invoice_id = %invoice.invoice_id,
            invoice_number = %invoice.invoice_number,
            next_generate_date = %advance.next_generate_date,
            deactivated = advance.deactivate,
            "Invoice generated"
        );

        Ok(CommitOutcome::Generated(invoice))
    }
}

#[async_trait]
impl InvoiceNumberAllocator for InMemoryStore {
    async fn allocate(&self, tenant_id: Uuid) -> Result<String, AppError> {
        let book = self.book(tenant_id);
        let mut book = book.lock().await;
        Ok(book.allocate())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        CreateLineItemTemplate, CreateSchedule, DraftLineItem, Frequency, InvoiceStatus,
    };
    use rust_decimal::Decimal;

    fn draft(tenant_id: Uuid) -> InvoiceDraft {
        let day = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap();
        InvoiceDraft {
            tenant_id,
            client_id: Uuid::new_v4(),
            status: InvoiceStatus::Draft,
            issue_date: day,
            due_date: day,
            currency: "EUR".to_string(),
            tax_percent: Decimal::ZERO,
            discount_amount: Decimal::ZERO,
            notes: None,
            template: "default".to_string(),
            recurring_schedule_id: None,
            schedule_anchor_date: None,
            line_items: vec![DraftLineItem::new(
                None,
                "Consulting".to_string(),
                Decimal::ONE,
                Decimal::from(90),
            )],
        }
    }

    #[tokio::test]
    async fn numbers_are_scoped_per_tenant() {
        let store = InMemoryStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        assert_eq!(store.allocate(a).await.unwrap(), "INV-0001");
        assert_eq!(store.allocate(a).await.unwrap(), "INV-0002");
        assert_eq!(store.allocate(b).await.unwrap(), "INV-0001");
    }

    #[tokio::test]
    async fn manual_invoice_counts_toward_period_usage() {
        let store = InMemoryStore::new();
        let tenant = Uuid::new_v4();

        let invoice = store.create_invoice(&draft(tenant)).await;

        assert_eq!(invoice.invoice_number, "INV-0001");
        assert_eq!(invoice.total, Decimal::from(90));
        let june = NaiveDate::from_ymd_opt(2024, 6, 30).unwrap();
        assert_eq!(store.period_invoice_count(tenant, june).await, 1);
        assert_eq!(store.get_invoice_line_items(tenant, invoice.invoice_id).await.len(), 1);
    }

    #[tokio::test]
    async fn soft_delete_only_applies_once() {
        let store = InMemoryStore::new();
        let tenant = Uuid::new_v4();
        let invoice = store.create_invoice(&draft(tenant)).await;

        assert!(store.soft_delete_invoice(tenant, invoice.invoice_id).await);
        assert!(!store.soft_delete_invoice(tenant, invoice.invoice_id).await);
    }

    #[tokio::test]
    async fn commit_refuses_once_period_limit_is_reached() {
        let store = InMemoryStore::new();
        let tenant = Uuid::new_v4();
        let day = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap();
        store.create_invoice(&draft(tenant)).await;
        let schedule = store
            .create_schedule(CreateSchedule {
                tenant_id: tenant,
                client_id: Uuid::new_v4(),
                frequency: Frequency::Monthly,
                next_generate_date: day,
                end_date: None,
                tax_percent: Decimal::ZERO,
                discount_amount: Decimal::ZERO,
                currency: "EUR".to_string(),
                template: "default".to_string(),
                notes: None,
                line_items: vec![CreateLineItemTemplate {
                    product_id: None,
                    description: "Retainer".to_string(),
                    quantity: Decimal::ONE,
                    unit_price: Decimal::from(40),
                }],
            })
            .await;
        let advance = ScheduleAdvance::after(&schedule, Utc::now()).unwrap();
        let claim = ScheduleClaim::for_schedule(&schedule).with_invoice_limit(Some(1));

        let outcome = store.commit_generation(&claim, &draft(tenant), &advance).await.unwrap();

        assert!(matches!(outcome, CommitOutcome::QuotaExceeded));
        assert_eq!(store.period_invoice_count(tenant, day).await, 1);
        assert_eq!(store.get_schedule(tenant, schedule.schedule_id).await.unwrap().next_generate_date, day);
        assert_eq!(store.allocate(tenant).await.unwrap(), "INV-0002");
    }
}
