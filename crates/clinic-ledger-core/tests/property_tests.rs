//! Property tests for serial allocation and billing amounts.

use clinic_ledger_core::models::{BillingDraft, Discount, LabTest, Patient};
use clinic_ledger_core::notify::ChangeHub;
use clinic_ledger_core::receipt::verify_receipt;
use clinic_ledger_core::{Repository, StoreConfig};
use proptest::prelude::*;

fn discount_strategy() -> impl Strategy<Value = Discount> {
    prop_oneof![
        (0u64..2_000_000).prop_map(Discount::Flat),
        (0u8..=150).prop_map(Discount::Percent),
    ]
}

fn draft_strategy() -> impl Strategy<Value = BillingDraft> {
    (
        prop::collection::vec(0u64..100_000, 0..8),
        discount_strategy(),
    )
        .prop_map(|(prices, discount)| {
            prices
                .into_iter()
                .enumerate()
                .fold(
                    BillingDraft::new("Patient".into(), "01700000000".into()),
                    |draft, (i, price)| draft.with_test(&LabTest::new(format!("T{}", i), price)),
                )
                .with_discount(discount)
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn amounts_always_consistent(draft in draft_strategy()) {
        let expected_total: u64 = draft.tests.iter().map(|t| t.price).sum();
        let patient = Patient::from_draft(draft, 1001).unwrap();

        prop_assert!(patient.validate().is_ok());
        prop_assert_eq!(patient.total, expected_total);
        prop_assert!(patient.discount <= patient.total);
        prop_assert_eq!(patient.final_amount, patient.total - patient.discount);
    }

    #[test]
    fn stored_patients_keep_invariants(draft in draft_strategy()) {
        let repo = Repository::open_in_memory(StoreConfig::default(), &ChangeHub::new()).unwrap();
        let created = repo.create_patient(draft).unwrap();
        let stored = repo.get_patient(&created.id).unwrap().unwrap();

        prop_assert!(stored.validate().is_ok());
        prop_assert!(verify_receipt(&stored).unwrap());
        prop_assert_eq!(stored, created);
    }

    /// `true` bills a patient, `false` deletes the newest one still stored.
    #[test]
    fn serials_strictly_increase(ops in prop::collection::vec(any::<bool>(), 1..30)) {
        let repo = Repository::open_in_memory(StoreConfig::default(), &ChangeHub::new()).unwrap();
        let mut issued: Vec<u64> = Vec::new();

        for create in ops {
            let live = repo.get_patients().unwrap();
            match live.last() {
                Some(newest) if !create => repo.delete_patient(&newest.id).unwrap(),
                _ => {
                    let draft = BillingDraft::new("P".into(), "017".into());
                    let serial = repo.create_patient(draft).unwrap().serial;
                    if let Some(&last) = issued.last() {
                        prop_assert!(serial > last);
                    } else {
                        prop_assert_eq!(serial, 1001);
                    }
                    issued.push(serial);
                }
            }
        }

        let stored: Vec<u64> = repo.get_patients().unwrap().iter().map(|p| p.serial).collect();
        prop_assert!(stored.windows(2).all(|w| w[0] < w[1]));
    }
}
