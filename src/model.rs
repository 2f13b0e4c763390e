// src/model.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The three kinds of discussion sources we harvest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Issue,
    Forum,
    Mail,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Issue => "issue",
            SourceKind::Forum => "forum",
            SourceKind::Mail => "mail",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "issue" => Ok(SourceKind::Issue),
            "forum" => Ok(SourceKind::Forum),
            "mail" => Ok(SourceKind::Mail),
            other => Err(format!("unknown source kind: {other}")),
        }
    }
}

/// A loosely shaped item as a collector hands it over. Only `id`, `title`
/// and `body` are required downstream; the cleaner skips items missing them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawItem {
    pub id: Option<String>,
    pub title: Option<String>,
    pub body: Option<String>,
    pub url: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    /// Upstream lifecycle state, "open" or "closed".
    pub state: Option<String>,
    /// Backend "resolved" flag (solved topic, accepted answer).
    pub closed: Option<bool>,
    pub history: Option<serde_json::Value>,
}

/// The cleaner's output, ready for upsert. Same shape as a stored record
/// minus storage-only fields.
#[derive(Debug, Clone, Serialize)]
pub struct NormalizedRecord {
    pub source_id: String,
    pub source_type: SourceKind,
    pub title: String,
    pub body: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Sanitized LLM output; empty when enrichment was skipped.
    pub clean_data: String,
    pub topic_summary: String,
    pub topic_closed: bool,
    pub source_closed: bool,
    pub history: serde_json::Value,
}

/// A row of the `discussion` table.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct DiscussionRecord {
    pub id: i64,
    pub source_id: String,
    pub source_type: String,
    pub title: String,
    pub body: String,
    pub url: String,
    pub clean_data: String,
    pub topic_summary: String,
    pub topic_closed: bool,
    pub source_closed: bool,
    pub is_deleted: bool,
    pub history: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_kind_round_trips_through_str() {
        for kind in [SourceKind::Issue, SourceKind::Forum, SourceKind::Mail] {
            assert_eq!(kind.as_str().parse::<SourceKind>().unwrap(), kind);
        }
        assert!("wiki".parse::<SourceKind>().is_err());
    }
}
