//! Source feed module
//!
//! Handles:
//! - The activity feed client (HTTP)
//! - Normalization of raw activity records into `FeedEvent`

mod client;
mod events;

pub use client::{ActivityFeed, HttpFeedClient};
pub use events::{EventKind, FeedEvent, RawActivity, normalize_activity, parse_event_timestamp};

#[cfg(test)]
pub use client::MockActivityFeed;
