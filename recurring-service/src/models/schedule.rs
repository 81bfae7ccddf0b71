//! Recurring schedule model.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::Frequency;

/// Standing instruction to produce invoices on a cadence.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RecurringSchedule {
    pub schedule_id: Uuid,
    pub tenant_id: Uuid,
    pub client_id: Uuid,
    pub frequency: String,
    pub next_generate_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub is_active: bool,
    pub tax_percent: Decimal,
    pub discount_amount: Decimal,
    pub currency: String,
    pub template: String,
    pub notes: Option<String>,
    pub total_generated: i32,
    pub last_generated_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
    #[sqlx(skip)]
    #[serde(default)]
    pub line_items: Vec<LineItemTemplate>,
}

impl RecurringSchedule {
    /// Selection predicate for a generation run on `today`.
    pub fn is_due(&self, today: NaiveDate) -> bool {
        self.is_active
            && self.next_generate_date <= today
            && self.end_date.is_none_or(|end| end >= today)
    }
}

/// Line on a schedule; totals are recomputed at generation time.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LineItemTemplate {
    pub template_item_id: Uuid,
    pub schedule_id: Uuid,
    pub product_id: Option<Uuid>,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub sort_order: i32,
}

/// Input for creating a schedule.
#[derive(Debug, Clone)]
pub struct CreateSchedule {
    pub tenant_id: Uuid,
    pub client_id: Uuid,
    pub frequency: Frequency,
    pub next_generate_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub tax_percent: Decimal,
    pub discount_amount: Decimal,
    pub currency: String,
    pub template: String,
    pub notes: Option<String>,
    pub line_items: Vec<CreateLineItemTemplate>,
}

/// Input for a schedule line.
#[derive(Debug, Clone)]
pub struct CreateLineItemTemplate {
    pub product_id: Option<Uuid>,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
}

impl CreateSchedule {
    /// Build the stored form, assigning ids and preserving line order.
    pub fn into_schedule(self, now: DateTime<Utc>) -> RecurringSchedule {
        let schedule_id = Uuid::new_v4();
        let line_items = self
            .line_items
            .into_iter()
            .enumerate()
            .map(|(i, item)| LineItemTemplate {
                template_item_id: Uuid::new_v4(),
                schedule_id,
                product_id: item.product_id,
                description: item.description,
                quantity: item.quantity,
                unit_price: item.unit_price,
                sort_order: i as i32,
            })
            .collect();

        RecurringSchedule {
            schedule_id,
            tenant_id: self.tenant_id,
            client_id: self.client_id,
            frequency: self.frequency.as_str().to_string(),
            next_generate_date: self.next_generate_date,
            end_date: self.end_date,
            is_active: true,
            tax_percent: self.tax_percent,
            discount_amount: self.discount_amount,
            currency: self.currency,
            template: self.template,
            notes: self.notes,
            total_generated: 0,
            last_generated_utc: None,
            created_utc: now,
            updated_utc: now,
            line_items,
        }
    }
}
