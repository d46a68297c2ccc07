use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A scraped announcement as stored. The id is a content address over
/// (site_id, url); title and publish_date reflect the first-ever observation
/// and are never updated by later re-renders of the same listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notice {
    pub id: String,
    pub site_id: String,
    pub title: String,
    pub url: String,
    pub publish_date: String,
    pub first_seen: DateTime<Utc>,
    pub notified: bool,
    pub notified_at: Option<DateTime<Utc>>,
}

/// An extracted candidate before it has been checked against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNotice {
    pub site_id: String,
    pub title: String,
    pub url: String,
    pub publish_date: String,
}

impl NewNotice {
    pub fn id(&self) -> String {
        notice_id(&self.site_id, &self.url)
    }
}

/// Stable content address for a notice. Two fetches of the same URL under the
/// same site always yield the same id regardless of title drift.
pub fn notice_id(site_id: &str, url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(site_id.as_bytes());
    hasher.update(b"_");
    hasher.update(url.as_bytes());
    hex_digest(&hasher.finalize())
}

pub(crate) fn hex_digest(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}
