//! timeclock-store — Employee registry and punch log.
//!
//! Enrolled employees (one embedding each) and their clock-in / clock-out
//! punches live in a single SQLite database accessed through
//! `tokio-rusqlite`.

pub mod punch;
pub mod store;

pub use punch::{Punch, PunchKind};
pub use store::{Employee, Store, StoreError};
