//! Receipt integrity digests.
//!
//! A receipt hash is SHA-256 over the canonical JSON of the billing-relevant
//! fields `{serial, name, phone, tests, total, finalAmount, date}`. Anyone
//! holding a shared receipt can recompute it to detect tampering.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::models::{LabTest, Patient};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReceiptFields<'a> {
    serial: u64,
    name: &'a str,
    phone: &'a str,
    tests: &'a [LabTest],
    total: u64,
    final_amount: u64,
    date: &'a str,
}

/// Serialize the hashed subset in fixed field order.
pub fn canonical_receipt_json(patient: &Patient) -> Result<String, serde_json::Error> {
    serde_json::to_string(&ReceiptFields {
        serial: patient.serial,
        name: &patient.name,
        phone: &patient.phone,
        tests: &patient.tests,
        total: patient.total,
        final_amount: patient.final_amount,
        date: &patient.date,
    })
}

/// Compute the receipt hash for a patient.
pub fn compute_receipt_hash(patient: &Patient) -> Result<String, serde_json::Error> {
    let canonical = canonical_receipt_json(patient)?;
    Ok(hash_data(canonical.as_bytes()))
}

/// Check a stored hash against the record. A record without a hash fails.
pub fn verify_receipt(patient: &Patient) -> Result<bool, serde_json::Error> {
    match &patient.receipt_hash {
        Some(stored) => Ok(*stored == compute_receipt_hash(patient)?),
        None => Ok(false),
    }
}

/// Hash data using SHA-256, hex encoded.
pub fn hash_data(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    hex::encode(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BillingDraft;

    fn make_patient() -> Patient {
        let draft = BillingDraft::new("Karim".into(), "01711111111".into())
            .with_test(&LabTest::new("HbA1c".into(), 600));
        Patient::from_draft(draft, 1001).unwrap()
    }

    #[test]
    fn test_hash_deterministic() {
        let patient = make_patient();
        let h1 = compute_receipt_hash(&patient).unwrap();
        let h2 = compute_receipt_hash(&patient.clone()).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn test_hash_covers_billing_fields() {
        let patient = make_patient();
        let original = compute_receipt_hash(&patient).unwrap();

        let mut tampered = patient.clone();
        tampered.final_amount = 1;
        assert_ne!(compute_receipt_hash(&tampered).unwrap(), original);

        let mut tampered = patient.clone();
        tampered.phone = "01999999999".into();
        assert_ne!(compute_receipt_hash(&tampered).unwrap(), original);
    }

    #[test]
    fn test_hash_ignores_non_billing_fields() {
        let patient = make_patient();
        let original = compute_receipt_hash(&patient).unwrap();

        let mut edited = patient.clone();
        edited.address = Some("Dhaka".into());
        edited.receipt_id = Some("R-1".into());
        assert_eq!(compute_receipt_hash(&edited).unwrap(), original);
    }

    #[test]
    fn test_verify_receipt() {
        let mut patient = make_patient();
        assert!(!verify_receipt(&patient).unwrap());

        patient.receipt_hash = Some(compute_receipt_hash(&patient).unwrap());
        assert!(verify_receipt(&patient).unwrap());

        patient.name = "Someone Else".into();
        assert!(!verify_receipt(&patient).unwrap());
    }

    #[test]
    fn test_hash_data_known_vector() {
        assert_eq!(
            hash_data(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
