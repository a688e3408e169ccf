//! Feed event normalization
//!
//! The source platform's activity API returns loosely-shaped JSON.
//! Everything is normalized into the fixed `FeedEvent` shape here, at
//! the fetch boundary, so downstream code never touches raw payloads.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use sha2::{Digest, Sha256};

/// Activity kinds the relay understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Vote,
    Comment,
    Reply,
    Follow,
    Mention,
    Reshare,
    Transfer,
    /// Anything the source emits that we do not recognize.
    /// Unknown kinds are forwarded, never dropped.
    Generic,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vote => "vote",
            Self::Comment => "comment",
            Self::Reply => "reply",
            Self::Follow => "follow",
            Self::Mention => "mention",
            Self::Reshare => "reshare",
            Self::Transfer => "transfer",
            Self::Generic => "generic",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "vote" => Self::Vote,
            "comment" => Self::Comment,
            "reply" | "reply_comment" => Self::Reply,
            "follow" => Self::Follow,
            "mention" => Self::Mention,
            "reshare" | "reblog" => Self::Reshare,
            "transfer" => Self::Transfer,
            _ => Self::Generic,
        }
    }

    /// Push copy headline for this kind
    pub fn title(&self) -> &'static str {
        match self {
            Self::Vote => "New vote",
            Self::Comment => "New comment",
            Self::Reply => "New reply",
            Self::Follow => "New follower",
            Self::Mention => "You were mentioned",
            Self::Reshare => "Post reshared",
            Self::Transfer => "Transfer received",
            Self::Generic => "New activity",
        }
    }
}

/// One record from the source activity API, as loosely shaped as the
/// platform sends it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawActivity {
    /// Source-side numeric event id, when the platform assigns one
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    /// Timestamp; RFC 3339, or the source's offset-less variant
    #[serde(default)]
    pub date: Option<String>,
    /// Pre-rendered human text, e.g. "@carol voted on your post"
    #[serde(default)]
    pub msg: Option<String>,
    /// Path into the source's web frontend
    #[serde(default)]
    pub url: Option<String>,
}

/// A normalized activity event (ephemeral; never persisted as-is)
#[derive(Debug, Clone, PartialEq)]
pub struct FeedEvent {
    pub source_handle: String,
    pub kind: EventKind,
    pub occurred_at: DateTime<Utc>,
    /// Stable identifier: a pure function of the source data, so the
    /// same underlying event maps to the same id on every fetch
    pub source_event_id: String,
    pub title: String,
    pub body: String,
    pub target_url: String,
}

/// Normalize one raw activity record.
///
/// Returns `None` only for records that cannot identify an underlying
/// event at all (no parseable timestamp); unknown kinds fall back to
/// [`EventKind::Generic`] instead of being dropped.
pub fn normalize_activity(
    source_handle: &str,
    raw: &RawActivity,
    web_base_url: &str,
) -> Option<FeedEvent> {
    let kind = raw
        .kind
        .as_deref()
        .map(EventKind::parse)
        .unwrap_or(EventKind::Generic);

    let Some(occurred_at) = raw.date.as_deref().and_then(parse_event_timestamp) else {
        tracing::warn!(
            handle = %source_handle,
            "Dropping activity record without a parseable timestamp"
        );
        return None;
    };

    let source_event_id = match raw.id {
        Some(id) => format!("{}#{}", kind.as_str(), id),
        None => format!("{}#{}", kind.as_str(), fallback_event_digest(raw)),
    };

    let body = raw
        .msg
        .as_deref()
        .map(|msg| html_escape::decode_html_entities(msg).into_owned())
        .unwrap_or_else(|| kind.title().to_string());

    Some(FeedEvent {
        source_handle: source_handle.to_string(),
        kind,
        occurred_at,
        source_event_id,
        title: kind.title().to_string(),
        body,
        target_url: target_url(web_base_url, raw.url.as_deref()),
    })
}

/// Parse a source timestamp.
///
/// The activity API serves RFC 3339 on some endpoints and an
/// offset-less "%Y-%m-%dT%H:%M:%S" on others; the latter is UTC.
pub fn parse_event_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Digest-based event id for records the source does not number.
///
/// Keyed on the fields that identify the underlying event, never on
/// fetch time, so repeated fetches of the same event agree.
fn fallback_event_digest(raw: &RawActivity) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.kind.as_deref().unwrap_or_default());
    hasher.update(b"|");
    hasher.update(raw.msg.as_deref().unwrap_or_default());
    hasher.update(b"|");
    hasher.update(raw.url.as_deref().unwrap_or_default());
    hasher.update(b"|");
    hasher.update(raw.date.as_deref().unwrap_or_default());
    hex::encode(&hasher.finalize()[..8])
}

fn target_url(web_base_url: &str, path: Option<&str>) -> String {
    match path {
        Some(path) if path.starts_with("http://") || path.starts_with("https://") => {
            path.to_string()
        }
        Some(path) => format!(
            "{}/{}",
            web_base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        ),
        None => web_base_url.to_string(),
    }
}
