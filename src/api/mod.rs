//! API layer
//!
//! HTTP handlers for:
//! - Link management (token-protected)
//! - Relay control (token-protected)
//! - Sink webhook (HMAC-signed)
//! - Metrics (Prometheus)

mod auth;
mod dto;
mod links;
pub mod metrics;
mod relay;
mod webhook;

pub use dto::*;

pub use auth::require_api_token;
pub use links::links_router;
pub use metrics::metrics_router;
pub use relay::relay_router;
pub use webhook::{SIGNATURE_HEADER, webhook_router};
