//! Patient billing models.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::lab_test::LabTest;

/// Violations of the billing invariants carried by every stored patient.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordViolation {
    #[error("Record has an empty id")]
    EmptyId,

    #[error("Serial must be positive")]
    ZeroSerial,

    #[error("Serial {0} is beyond the largest storable serial")]
    SerialOutOfRange(u64),

    #[error("Sum of test prices overflows")]
    AmountOverflow,

    #[error("Total {actual} does not match sum of test prices {expected}")]
    TotalMismatch { expected: u64, actual: u64 },

    #[error("Discount {discount} exceeds total {total}")]
    DiscountExceedsTotal { discount: u64, total: u64 },

    #[error("Final amount {actual} does not match total minus discount {expected}")]
    FinalAmountMismatch { expected: u64, actual: u64 },

    #[error("Serial is immutable ({stored} -> {requested})")]
    SerialChanged { stored: u64, requested: u64 },

    #[error("Creation date is immutable")]
    DateChanged,
}

/// Discount as entered at the front desk.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Discount {
    /// Absolute amount in the smallest currency unit
    Flat(u64),
    /// Whole percentage of the total (0-100)
    Percent(u8),
}

impl Default for Discount {
    fn default() -> Self {
        Discount::Flat(0)
    }
}

impl Discount {
    /// Resolve to an absolute amount, never exceeding `total`.
    ///
    /// Percentages round half-up to the nearest unit.
    pub fn resolve(&self, total: u64) -> u64 {
        let amount = match *self {
            Discount::Flat(amount) => amount,
            Discount::Percent(pct) => {
                let pct = u64::from(pct.min(100));
                total.saturating_mul(pct).saturating_add(50) / 100
            }
        };
        amount.min(total)
    }

    /// Reconstruct the entry form of a stored discount.
    ///
    /// A discount that is an exact whole percentage of the total is shown as a
    /// percentage, anything else as a flat amount.
    pub fn infer(total: u64, discount: u64) -> Self {
        match discount.checked_mul(100) {
            Some(scaled) if discount > 0 && discount <= total && scaled % total == 0 => {
                Discount::Percent((scaled / total) as u8)
            }
            _ => Discount::Flat(discount),
        }
    }
}

/// Front-desk form state for a new billing transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BillingDraft {
    pub name: String,
    pub phone: String,
    pub age: Option<u32>,
    pub gender: Option<String>,
    pub address: Option<String>,
    /// Selected tests, in selection order
    pub tests: Vec<LabTest>,
    pub discount: Discount,
}

impl BillingDraft {
    /// Create a draft with the required contact fields.
    pub fn new(name: String, phone: String) -> Self {
        Self {
            name,
            phone,
            age: None,
            gender: None,
            address: None,
            tests: Vec::new(),
            discount: Discount::default(),
        }
    }

    /// Add a test to the selection (by value).
    pub fn with_test(mut self, test: &LabTest) -> Self {
        self.tests.push(test.clone());
        self
    }

    /// Set the discount.
    pub fn with_discount(mut self, discount: Discount) -> Self {
        self.discount = discount;
        self
    }

    /// Sum of selected test prices.
    pub fn total(&self) -> Result<u64, RecordViolation> {
        sum_prices(&self.tests)
    }
}

/// A single billing transaction (one receipt).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Patient {
    /// Internal unique record ID
    pub id: String,
    /// Clinic-visible receipt number, assigned once and never reused
    pub serial: u64,
    pub name: String,
    pub phone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Snapshot of each billed test at billing time
    pub tests: Vec<LabTest>,
    /// Absolute discount (already resolved from any percentage)
    pub discount: u64,
    /// Sum of test prices
    pub total: u64,
    /// `total - discount`
    pub final_amount: u64,
    /// Creation timestamp (RFC 3339), immutable
    pub date: String,
    /// Public-facing receipt identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_id: Option<String>,
    /// Integrity digest over the billing-relevant fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_hash: Option<String>,
}

impl Patient {
    /// Build a patient from a billing draft, resolving amounts.
    pub fn from_draft(draft: BillingDraft, serial: u64) -> Result<Self, RecordViolation> {
        let total = draft.total()?;
        let discount = draft.discount.resolve(total);
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            serial,
            name: draft.name,
            phone: draft.phone,
            age: draft.age,
            gender: draft.gender,
            address: draft.address,
            tests: draft.tests,
            discount,
            total,
            final_amount: total - discount,
            date: chrono::Utc::now().to_rfc3339(),
            receipt_id: None,
            receipt_hash: None,
        })
    }

    /// Replace the billed tests and discount, recomputing all amounts.
    ///
    /// On `AmountOverflow` the patient is left unchanged.
    pub fn rebill(
        &mut self,
        tests: Vec<LabTest>,
        discount: Discount,
    ) -> Result<(), RecordViolation> {
        let total = sum_prices(&tests)?;
        self.total = total;
        self.tests = tests;
        self.discount = discount.resolve(total);
        self.final_amount = total - self.discount;
        Ok(())
    }

    /// Check the amount invariants.
    pub fn validate(&self) -> Result<(), RecordViolation> {
        if self.id.is_empty() {
            return Err(RecordViolation::EmptyId);
        }
        if self.serial == 0 {
            return Err(RecordViolation::ZeroSerial);
        }
        if self.serial > MAX_SERIAL {
            return Err(RecordViolation::SerialOutOfRange(self.serial));
        }

        let expected_total = sum_prices(&self.tests)?;
        if self.total != expected_total {
            return Err(RecordViolation::TotalMismatch {
                expected: expected_total,
                actual: self.total,
            });
        }
        if self.discount > self.total {
            return Err(RecordViolation::DiscountExceedsTotal {
                discount: self.discount,
                total: self.total,
            });
        }

        let expected_final = self.total - self.discount;
        if self.final_amount != expected_final {
            return Err(RecordViolation::FinalAmountMismatch {
                expected: expected_final,
                actual: self.final_amount,
            });
        }
        Ok(())
    }

    /// Receipt identifier shown to the customer (falls back to the record ID).
    pub fn receipt_id(&self) -> &str {
        self.receipt_id.as_deref().unwrap_or(&self.id)
    }
}

/// Largest serial the store can hold (serials are SQLite integers).
pub const MAX_SERIAL: u64 = i64::MAX as u64;

fn sum_prices(tests: &[LabTest]) -> Result<u64, RecordViolation> {
    tests
        .iter()
        .try_fold(0u64, |sum, t| sum.checked_add(t.price))
        .ok_or(RecordViolation::AmountOverflow)
}
