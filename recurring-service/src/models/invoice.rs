//! Invoice model for recurring-service.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Status of an invoice created here. Later lifecycle states belong to the
/// invoicing service that sends and settles it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
        }
    }
}

/// Round a monetary amount to cents for storage.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Stored total of one line: `quantity × unit_price` in cents.
pub fn line_total(quantity: Decimal, unit_price: Decimal) -> Decimal {
    round_money(quantity * unit_price)
}

/// Persisted invoice header.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub tenant_id: Uuid,
    pub client_id: Uuid,
    pub invoice_number: String,
    pub status: String,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
    pub currency: String,
    pub subtotal: Decimal,
    pub tax_percent: Decimal,
    pub tax_amount: Decimal,
    pub discount_amount: Decimal,
    pub total: Decimal,
    pub notes: Option<String>,
    pub template: String,
    pub recurring_schedule_id: Option<Uuid>,
    pub schedule_anchor_date: Option<NaiveDate>,
    pub created_utc: DateTime<Utc>,
    pub deleted_utc: Option<DateTime<Utc>>,
}

/// Persisted invoice line.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InvoiceLineItem {
    pub line_item_id: Uuid,
    pub invoice_id: Uuid,
    pub tenant_id: Uuid,
    pub product_id: Option<Uuid>,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub total: Decimal,
    pub sort_order: i32,
}

/// Unsaved line produced by the assembler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DraftLineItem {
    pub product_id: Option<Uuid>,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub total: Decimal,
}

impl DraftLineItem {
    pub fn new(
        product_id: Option<Uuid>,
        description: String,
        quantity: Decimal,
        unit_price: Decimal,
    ) -> Self {
        Self {
            product_id,
            description,
            quantity,
            unit_price,
            total: line_total(quantity, unit_price),
        }
    }
}

/// Invoice amounts as stored, all in cents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InvoiceTotals {
    pub subtotal: Decimal,
    pub tax_amount: Decimal,
    pub discount_amount: Decimal,
    pub total: Decimal,
}

/// Unsaved invoice with its lines; the number is allocated on persist.
#[derive(Debug, Clone, Serialize)]
pub struct InvoiceDraft {
    pub tenant_id: Uuid,
    pub client_id: Uuid,
    pub status: InvoiceStatus,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
    pub currency: String,
    pub tax_percent: Decimal,
    pub discount_amount: Decimal,
    pub notes: Option<String>,
    pub template: String,
    pub recurring_schedule_id: Option<Uuid>,
    pub schedule_anchor_date: Option<NaiveDate>,
    pub line_items: Vec<DraftLineItem>,
}

impl InvoiceDraft {
    /// Lines are rounded first and summed into the subtotal; tax is rounded
    /// from that subtotal. The stored header then always satisfies
    /// `subtotal = Σ line totals` and `total = subtotal + tax − discount`.
    pub fn totals(&self) -> InvoiceTotals {
        let subtotal: Decimal = self
            .line_items
            .iter()
            .map(|l| line_total(l.quantity, l.unit_price))
            .sum();
        let tax_amount = round_money(subtotal * self.tax_percent / Decimal::ONE_HUNDRED);
        let discount_amount = round_money(self.discount_amount);
        InvoiceTotals {
            subtotal,
            tax_amount,
            discount_amount,
            total: subtotal + tax_amount - discount_amount,
        }
    }

    /// Stored header for this draft under an allocated number.
    pub fn to_invoice(&self, invoice_number: String, now: DateTime<Utc>) -> Invoice {
        let totals = self.totals();
        Invoice {
            invoice_id: Uuid::new_v4(),
            tenant_id: self.tenant_id,
            client_id: self.client_id,
            invoice_number,
            status: self.status.as_str().to_string(),
            issue_date: self.issue_date,
            due_date: self.due_date,
            currency: self.currency.clone(),
            subtotal: totals.subtotal,
            tax_percent: self.tax_percent,
            tax_amount: totals.tax_amount,
            discount_amount: totals.discount_amount,
            total: totals.total,
            notes: self.notes.clone(),
            template: self.template.clone(),
            recurring_schedule_id: self.recurring_schedule_id,
            schedule_anchor_date: self.schedule_anchor_date,
            created_utc: now,
            deleted_utc: None,
        }
    }

    /// Stored lines for this draft under `invoice_id`.
    pub fn to_line_items(&self, invoice_id: Uuid) -> Vec<InvoiceLineItem> {
        self.line_items
            .iter()
            .enumerate()
            .map(|(i, line)| InvoiceLineItem {
                line_item_id: Uuid::new_v4(),
                invoice_id,
                tenant_id: self.tenant_id,
                product_id: line.product_id,
                description: line.description.clone(),
                quantity: line.quantity,
                unit_price: line.unit_price,
                total: line_total(line.quantity, line.unit_price),
                sort_order: i as i32,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(lines: Vec<(i64, i64)>, tax: i64, discount: i64) -> InvoiceDraft {
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        InvoiceDraft {
            tenant_id: Uuid::new_v4(),
            client_id: Uuid::new_v4(),
            status: InvoiceStatus::Draft,
            issue_date: day,
            due_date: day,
            currency: "USD".to_string(),
            tax_percent: Decimal::from(tax),
            discount_amount: Decimal::from(discount),
            notes: None,
            template: "default".to_string(),
            recurring_schedule_id: None,
            schedule_anchor_date: None,
            line_items: lines
                .into_iter()
                .map(|(q, p)| DraftLineItem::new(None, "line".into(), q.into(), p.into()))
                .collect(),
        }
    }

    #[test]
    fn totals_apply_tax_then_discount() {
        let totals = draft(vec![(2, 100), (1, 50)], 10, 20).totals();
        assert_eq!(totals.subtotal, Decimal::from(250));
        assert_eq!(totals.tax_amount, Decimal::from(25));
        assert_eq!(totals.total, Decimal::from(255));
    }

    #[test]
    fn tax_is_taken_from_the_rounded_subtotal() {
        // 3 × 33.335 = 100.005 -> 100.01; tax 7% of 100.01 = 7.0007 -> 7.00
        let mut d = draft(vec![], 7, 0);
        d.line_items.push(DraftLineItem::new(
            None,
            "fractional".into(),
            Decimal::from(3),
            Decimal::new(33335, 3),
        ));

        let invoice = d.to_invoice("INV-0001".to_string(), Utc::now());
        assert_eq!(invoice.subtotal, Decimal::new(10001, 2));
        assert_eq!(invoice.tax_amount, Decimal::new(700, 2));
        assert_eq!(invoice.total, Decimal::new(10701, 2));
    }

    #[test]
    fn stored_header_matches_stored_lines() {
        // Each line is 0.005 -> 0.01; summing first would give 0.01 instead of 0.02
        let mut d = draft(vec![], 50, 0);
        for _ in 0..2 {
            d.line_items.push(DraftLineItem::new(
                None,
                "half cent".into(),
                Decimal::ONE,
                Decimal::new(5, 3),
            ));
        }
        d.line_items.push(DraftLineItem::new(
            None,
            "metered".into(),
            Decimal::new(12345, 4),
            Decimal::new(33333, 4),
        ));
        d.discount_amount = Decimal::new(1234, 3);

        let invoice = d.to_invoice("INV-0001".to_string(), Utc::now());
        let lines = d.to_line_items(invoice.invoice_id);
        let line_sum: Decimal = lines.iter().map(|l| l.total).sum();

        assert_eq!(lines[0].total, Decimal::new(1, 2));
        assert_eq!(lines[2].total, Decimal::new(411, 2));
        assert_eq!(invoice.subtotal, line_sum);
        assert_eq!(invoice.subtotal, Decimal::new(413, 2));
        assert_eq!(invoice.tax_amount, Decimal::new(207, 2));
        assert_eq!(invoice.discount_amount, Decimal::new(123, 2));
        assert_eq!(
            invoice.total,
            invoice.subtotal + invoice.tax_amount - invoice.discount_amount
        );
        assert_eq!(invoice.total, Decimal::new(497, 2));
    }

    #[test]
    fn empty_draft_totals_to_minus_discount() {
        let totals = draft(vec![], 10, 5).totals();
        assert_eq!(totals.subtotal, Decimal::ZERO);
        assert_eq!(totals.total, Decimal::from(-5));
    }
}
