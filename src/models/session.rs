use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Expired,
    Invalid,
}

/// One authenticated cookie set per subject. Owned exclusively by the session
/// manager; the timetable client only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub subject_id: String,
    pub cookies: HashMap<String, String>,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: SessionStatus,
}

impl Session {
    pub fn new(subject_id: String, cookies: HashMap<String, String>, ttl_secs: i64) -> Self {
        let now = Utc::now();
        Self {
            subject_id,
            cookies,
            acquired_at: now,
            expires_at: now + Duration::seconds(ttl_secs),
            status: SessionStatus::Active,
        }
    }

    /// Whether the session is still inside its freshness window at `now`.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.status == SessionStatus::Active && now < self.expires_at
    }

    /// Transitions an aged-out session from Active to Expired. Invalidated
    /// sessions keep their status.
    pub fn refresh_status(&mut self, now: DateTime<Utc>) {
        if self.status == SessionStatus::Active && now >= self.expires_at {
            self.status = SessionStatus::Expired;
        }
    }

    /// The cookie set rendered as a `Cookie` request header value.
    pub fn cookie_header(&self) -> String {
        let mut pairs: Vec<_> = self
            .cookies
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        pairs.sort();
        pairs.join("; ")
    }
}
