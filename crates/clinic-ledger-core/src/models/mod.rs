//! Domain models for the clinic ledger.

mod backup;
mod patient;
mod pending;

pub use backup::*;
pub use lab_test::*;
pub use patient::*;
pub use pending::*;
