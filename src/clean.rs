// src/clean.rs
//! Normalization and enrichment of raw collector items. One item at a time:
//! required-field check, community inclusion predicate, timestamp
//! normalization, then LLM enrichment unless an earlier run already derived
//! content for the same identity. Item-level failures are logged and skipped
//! so one bad item never aborts the stream.

use chrono::{DateTime, NaiveDateTime, Utc};
use metrics::counter;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use crate::error::{HarvestError, Result};
use crate::llm::ChatClient;
use crate::model::{NormalizedRecord, RawItem, SourceKind};
use crate::strategy::Strategy;

/// The fixed timestamp format used across collectors and the store.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const SUMMARY_CHARS: usize = 100;

static RE_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").unwrap());
static RE_DISALLOWED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\u{4e00}-\u{9fa5}a-zA-Z0-9，。！？；：、]").unwrap());
static RE_MAIL_HEADERS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*(发件人|发送日期|收件人)：.*$").unwrap());

/// Deterministic sanitization applied to LLM output: strip HTML tags, then
/// replace every character outside {CJK ideographs, ASCII alphanumerics, a
/// fixed set of CJK punctuation} with a single space, then trim.
pub fn basic_clean(text: &str) -> String {
    let text = RE_TAGS.replace_all(text, "");
    let text = RE_DISALLOWED.replace_all(&text, " ");
    text.trim().to_string()
}

/// Drop the forwarded-mail header lines archives prepend to thread bodies.
pub fn strip_mail_headers(text: &str) -> String {
    RE_MAIL_HEADERS.replace_all(text, "").to_string()
}

fn summarize(text: &str) -> String {
    let mut summary: String = text.chars().take(SUMMARY_CHARS).collect();
    if text.chars().count() > SUMMARY_CHARS {
        summary.push_str("...");
    }
    summary
}

/// Parse an upstream timestamp, falling back to `fallback` (capture time).
pub fn normalize_time(raw: Option<&str>, fallback: DateTime<Utc>) -> DateTime<Utc> {
    let Some(raw) = raw else { return fallback };
    if let Ok(t) = NaiveDateTime::parse_from_str(raw, TIME_FORMAT) {
        return DateTime::from_naive_utc_and_offset(t, Utc);
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return t.with_timezone(&Utc);
    }
    fallback
}

/// Lookup into already-persisted derived content, used to skip duplicate
/// LLM work on re-observed records.
#[async_trait::async_trait]
pub trait DerivedIndex: Send + Sync {
    async fn has_clean_data(&self, kind: SourceKind, source_id: &str) -> anyhow::Result<bool>;
}

pub struct Cleaner<'a> {
    strategy: &'a Strategy,
    chat: &'a dyn ChatClient,
    index: &'a dyn DerivedIndex,
}

impl<'a> Cleaner<'a> {
    pub fn new(strategy: &'a Strategy, chat: &'a dyn ChatClient, index: &'a dyn DerivedIndex) -> Self {
        Self {
            strategy,
            chat,
            index,
        }
    }

    /// Run every raw item through the per-item pipeline, strictly in order.
    /// Item-level failures (missing fields, excluded content, exhausted LLM
    /// retries) are logged and skipped; anything else aborts the stream.
    pub async fn process(&self, items: Vec<RawItem>) -> Result<Vec<NormalizedRecord>> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match self.build_record(&item).await {
                Ok(record) => out.push(record),
                Err(e) if e.is_item_level() => {
                    warn!(
                        id = item.id.as_deref().unwrap_or("?"),
                        community = %self.strategy.community,
                        kind = %self.strategy.kind,
                        error = %e,
                        "skipping item"
                    );
                    counter!("clean_skipped_total").increment(1);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    async fn build_record(&self, raw: &RawItem) -> Result<NormalizedRecord> {
        let (Some(id), Some(title), Some(body)) = (&raw.id, &raw.title, &raw.body) else {
            return Err(HarvestError::Validation(
                "missing required field (id/title/body)".into(),
            ));
        };
        if !self.strategy.accepts(title, body) {
            return Err(HarvestError::Validation(format!(
                "excluded by content filter: {id}"
            )));
        }

        let now = Utc::now();
        let created_at = normalize_time(raw.created_at.as_deref(), now);
        let updated_at = normalize_time(raw.updated_at.as_deref(), created_at);

        // Re-emitted unchanged records still refresh title/body/closed-state
        // downstream; only the derived text is skipped.
        let already_enriched = self.index.has_clean_data(self.strategy.kind, id).await?;
        let (clean_data, topic_summary) = if already_enriched {
            (String::new(), String::new())
        } else {
            let output = self.enrich(title, body).await?;
            (basic_clean(&output), summarize(&output))
        };

        Ok(NormalizedRecord {
            source_id: id.clone(),
            source_type: self.strategy.kind,
            title: title.clone(),
            body: body.clone(),
            url: raw.url.clone().unwrap_or_default(),
            created_at,
            updated_at,
            clean_data,
            topic_summary,
            topic_closed: raw.closed.unwrap_or(false),
            source_closed: raw.state.as_deref() == Some("closed"),
            history: raw
                .history
                .clone()
                .unwrap_or_else(|| serde_json::Value::Array(Vec::new())),
        })
    }

    async fn enrich(&self, title: &str, body: &str) -> Result<String> {
        let body = if self.strategy.strip_mail_headers {
            strip_mail_headers(body)
        } else {
            body.to_string()
        };
        let content = format!("{title}\n{body}");
        counter!("llm_calls_total").increment(1);
        self.chat
            .complete(&self.strategy.system_prompt, &content)
            .await
            .map_err(|e| HarvestError::Llm(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn basic_clean_strips_tags_and_disallowed_chars() {
        assert_eq!(basic_clean("<p>Hello</p>"), "Hello");
        assert_eq!(basic_clean("中文Test123!@#"), "中文Test123");
        assert_eq!(basic_clean(""), "");
        assert_eq!(basic_clean("问题：为什么？<br/>答案"), "问题：为什么？答案");
        assert_eq!(basic_clean("a\nb"), "a b");
    }

    #[test]
    fn mail_headers_are_dropped_before_enrichment() {
        let body = "发件人：someone <a@b.c>\n发送日期：2025-02-08 22:17:47\n收件人：contact@example.org\n安装扩展失败";
        let stripped = strip_mail_headers(body);
        assert!(!stripped.contains("发件人"));
        assert!(!stripped.contains("收件人"));
        assert!(stripped.contains("安装扩展失败"));
    }

    #[test]
    fn summaries_truncate_at_100_chars() {
        assert_eq!(summarize("short"), "short");
        let long = "x".repeat(250);
        let summary = summarize(&long);
        assert_eq!(summary.chars().count(), 103);
        assert!(summary.ends_with("..."));
    }

    #[test]
    fn timestamps_parse_fixed_format_then_rfc3339_then_fall_back() {
        let fallback = Utc::now();
        let t = normalize_time(Some("2024-01-01 12:00:00"), fallback);
        assert_eq!(t.hour(), 12);
        let t = normalize_time(Some("2024-01-01T12:00:00+00:00"), fallback);
        assert_eq!(t.hour(), 12);
        assert_eq!(normalize_time(Some("not a time"), fallback), fallback);
        assert_eq!(normalize_time(None, fallback), fallback);
    }
}
