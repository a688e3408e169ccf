//! Data layer module
//!
//! Handles all data persistence:
//! - Linked account registry
//! - Read cursors
//! - Delivery dedup ledger

mod database;
mod models;

pub use database::{ClaimOutcome, Database};
pub use models::*;

#[cfg(test)]
mod database_test;
