//! History search and revenue figures over patient records.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::models::Patient;

/// Patients matching `term` by name (case-insensitive), phone or serial,
/// newest first. An empty term matches everything.
pub fn search_patients(patients: &[Patient], term: &str) -> Vec<Patient> {
    let term = term.trim();
    let needle = term.to_lowercase();

    let mut matches: Vec<Patient> = patients
        .iter()
        .filter(|p| {
            term.is_empty()
                || p.name.to_lowercase().contains(&needle)
                || p.phone.contains(term)
                || p.serial.to_string().contains(term)
        })
        .cloned()
        .collect();

    matches.sort_by(|a, b| parse_date(&b.date).cmp(&parse_date(&a.date)));
    matches
}

/// Patient count and collected amount over one period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodTotals {
    pub patients: usize,
    /// Sum of final amounts
    pub revenue: u64,
}

impl PeriodTotals {
    fn add(&mut self, patient: &Patient) {
        self.patients += 1;
        self.revenue = self.revenue.saturating_add(patient.final_amount);
    }
}

/// Today / this month / this year figures (UTC calendar).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevenueSummary {
    pub today: PeriodTotals,
    pub month: PeriodTotals,
    pub year: PeriodTotals,
}

impl RevenueSummary {
    /// Aggregate records relative to `now`. Records with unparseable dates are skipped.
    pub fn compute(patients: &[Patient], now: DateTime<Utc>) -> Self {
        let mut summary = Self::default();
        for patient in patients {
            let Some(date) = parse_date(&patient.date) else {
                continue;
            };
            if date.year() != now.year() {
                continue;
            }
            summary.year.add(patient);
            if date.month() == now.month() {
                summary.month.add(patient);
                if date.day() == now.day() {
                    summary.today.add(patient);
                }
            }
        }
        summary
    }
}

fn parse_date(date: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(date)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}
