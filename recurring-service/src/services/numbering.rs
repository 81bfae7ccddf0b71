//! Per-tenant invoice identifiers.
//!
//! Identifiers have the form `INV-` followed by the sequence number, zero-padded
//! to four digits (wider numbers are not truncated). Each tenant has its own
//! monotonic counter; an identifier is never issued twice for a tenant, including
//! after the invoice that carried it has been soft-deleted.

use async_trait::async_trait;
use service_core::error::AppError;
use uuid::Uuid;

pub const INVOICE_NUMBER_PREFIX: &str = "INV-";

/// Render a sequence value as an invoice identifier.
pub fn format_invoice_number(sequence: i64) -> String {
    format!("{}{:04}", INVOICE_NUMBER_PREFIX, sequence)
}

/// Numeric suffix of an identifier in the `INV-` scheme, if it has one.
pub fn parse_invoice_sequence(invoice_number: &str) -> Option<i64> {
    let digits = invoice_number.strip_prefix(INVOICE_NUMBER_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Next sequence value given the identifiers already issued to a tenant.
pub fn next_sequence<'a>(existing: impl IntoIterator<Item = &'a str>) -> i64 {
    existing
        .into_iter()
        .filter_map(parse_invoice_sequence)
        .max()
        .unwrap_or(0)
        + 1
}

/// Hands out invoice identifiers; allocation is a per-tenant critical section.
#[async_trait]
pub trait InvoiceNumberAllocator: Send + Sync {
    async fn allocate(&self, tenant_id: Uuid) -> Result<String, AppError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_to_four_digits() {
        assert_eq!(format_invoice_number(1), "INV-0001");
        assert_eq!(format_invoice_number(42), "INV-0042");
        assert_eq!(format_invoice_number(12345), "INV-12345");
    }

    #[test]
    fn foreign_identifiers_have_no_sequence() {
        assert_eq!(parse_invoice_sequence("INV-0007"), Some(7));
        assert_eq!(parse_invoice_sequence("INV-"), None);
        assert_eq!(parse_invoice_sequence("INV-12a"), None);
        assert_eq!(parse_invoice_sequence("CUSTOM-0009"), None);
        assert_eq!(parse_invoice_sequence("INV--3"), None);
    }

    #[test]
    fn next_sequence_follows_the_maximum_not_the_count() {
        assert_eq!(next_sequence([]), 1);
        assert_eq!(next_sequence(["INV-0001", "INV-0009", "INV-0003"]), 10);
        assert_eq!(next_sequence(["MANUAL-77", "INV-0002"]), 3);
        // 10000 sorts below 9999 as text
        assert_eq!(next_sequence(["INV-9999", "INV-10000"]), 10001);
    }
}
