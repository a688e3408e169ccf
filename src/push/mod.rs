//! Sink push module
//!
//! Handles:
//! - Batch delivery to sink callback endpoints
//! - Webhook payload signatures (HMAC-SHA256)

mod gateway;
mod signature;

pub use gateway::{
    BatchReceipt, HttpPushGateway, Notification, PushGateway, MAX_BODY_CHARS, MAX_TITLE_CHARS,
};
pub use signature::{
    compute_signature, format_signature_header, parse_signature_header, verify_signature,
};

#[cfg(test)]
pub use gateway::MockPushGateway;
