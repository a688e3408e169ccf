//! Service layer
//!
//! Contains business logic separated from HTTP handlers.
//! Services orchestrate the registry, feed, ledger, and push gateway.

mod fetcher;
mod ledger;
mod registry;
mod scheduler;

pub use fetcher::FetcherService;
pub use ledger::{FilterOutcome, LedgerService};
pub use registry::RegistryService;
pub use scheduler::{CycleReport, CycleTrigger, RelayScheduler};
