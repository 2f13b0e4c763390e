// src/collect/forum.rs
//! Forum topic crawlers. Two families: section-paged boards that report a
//! total count up front, and cursor-paged (Discourse-like) boards where a
//! short page signals exhaustion. Both need a secondary detail fetch per
//! topic for the full body text and a canonical permalink, and both treat a
//! failed page as "skip and continue", never as a fatal error.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use metrics::counter;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::{error, info};

use crate::clean::TIME_FORMAT;
use crate::collect::{Collector, PAGE_DELAY, PAGE_SIZE};
use crate::error::Result;
use crate::model::{RawItem, SourceKind};
use crate::net::HttpSession;
use crate::settings::ForumEndpoints;

/// Timestamp format of section-paged boards (`20240101120000`).
pub(crate) const COMPACT_TIME_FORMAT: &str = "%Y%m%d%H%M%S";
/// Timestamp format of cursor-paged boards (`2024-01-01T12:00:00.000Z`).
pub(crate) const ISO_MILLIS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.fZ";

/// A cursor page with fewer topics than this is the last one.
const CURSOR_FULL_PAGE: usize = 30;

fn parse_compact(ts: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(ts, COMPACT_TIME_FORMAT)
        .ok()
        .map(|t| DateTime::from_naive_utc_and_offset(t, Utc))
}

fn parse_iso_millis(ts: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(ts, ISO_MILLIS_FORMAT)
        .ok()
        .map(|t| DateTime::from_naive_utc_and_offset(t, Utc))
}

fn reformat(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(|t| t.format(TIME_FORMAT).to_string())
}

/// Topic ids arrive as strings on some boards and numbers on others.
fn id_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

static RE_HTML_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)</?[^>]+>").unwrap());
static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Decode entities, strip markup and collapse whitespace from a post body.
pub(crate) fn html_to_text(html: &str) -> String {
    let decoded = html_escape::decode_html_entities(html).to_string();
    let stripped = RE_HTML_TAGS.replace_all(&decoded, " ");
    RE_WS.replace_all(&stripped, " ").trim().to_string()
}

// ---------------------------------------------------------------------------
// Section-paged family
// ---------------------------------------------------------------------------

pub struct SectionForumCollector {
    http: HttpSession,
    listing_api: String,
    detail_api: String,
    sections: Vec<String>,
    topic_url_template: String,
}

/// Topics on a section page whose last activity is at or after `watermark`.
pub(crate) fn recent_section_topics<'a>(
    page: &'a Value,
    watermark: DateTime<Utc>,
) -> Vec<&'a Value> {
    page.get("resultList")
        .and_then(Value::as_array)
        .map(|topics| {
            topics
                .iter()
                .filter(|t| {
                    t.get("lastPostTime")
                        .and_then(Value::as_str)
                        .and_then(parse_compact)
                        .is_some_and(|ts| watermark <= ts)
                })
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn section_page_count(total: u64) -> u64 {
    total.div_ceil(PAGE_SIZE as u64)
}

impl SectionForumCollector {
    pub fn new(endpoints: &ForumEndpoints) -> Self {
        Self {
            http: HttpSession::new(Some("https://www.hiascend.com")),
            listing_api: endpoints.listing_api.clone(),
            detail_api: endpoints.detail_api.clone(),
            sections: endpoints.sections.clone(),
            topic_url_template: endpoints.topic_url_template.clone(),
        }
    }

    async fn fetch_page(&self, section_id: &str, page: u64) -> Option<Value> {
        let body = self
            .http
            .get_json(
                &self.listing_api,
                &[
                    ("sectionId", section_id.to_string()),
                    ("filterCondition", "1".to_string()),
                    ("pageIndex", page.to_string()),
                    ("pageSize", PAGE_SIZE.to_string()),
                ],
                &[],
            )
            .await?;
        body.get("data").cloned()
    }

    async fn parse_topics(&self, page: &Value, watermark: DateTime<Utc>) -> Vec<RawItem> {
        let mut out = Vec::new();
        for topic in recent_section_topics(page, watermark) {
            out.push(self.parse_topic(topic).await);
        }
        out
    }

    async fn parse_topic(&self, topic: &Value) -> RawItem {
        let topic_id = id_string(topic.get("topicId")).unwrap_or_default();
        let solved = topic.get("solved").and_then(Value::as_i64) == Some(1);
        RawItem {
            id: Some(topic_id.clone()),
            title: id_string(topic.get("title")),
            url: Some(self.topic_url_template.replace("{id}", &topic_id)),
            body: Some(self.topic_content(&topic_id).await),
            created_at: reformat(
                topic
                    .get("createTime")
                    .and_then(Value::as_str)
                    .and_then(parse_compact),
            ),
            updated_at: reformat(
                topic
                    .get("lastPostTime")
                    .and_then(Value::as_str)
                    .and_then(parse_compact),
            ),
            closed: Some(solved),
            ..Default::default()
        }
    }

    async fn topic_content(&self, topic_id: &str) -> String {
        let Some(body) = self
            .http
            .get_json(&self.detail_api, &[("topicId", topic_id.to_string())], &[])
            .await
        else {
            return String::new();
        };
        body.pointer("/data/result/content")
            .and_then(Value::as_str)
            .map(html_to_text)
            .unwrap_or_default()
    }
}

#[async_trait]
impl Collector for SectionForumCollector {
    fn kind(&self) -> SourceKind {
        SourceKind::Forum
    }

    async fn collect(&self, watermark: DateTime<Utc>) -> Result<Vec<RawItem>> {
        let mut all = Vec::new();
        for section in &self.sections {
            let Some(first) = self.fetch_page(section, 1).await else {
                error!(section = %section, "first page fetch failed, skipping section");
                counter!("collect_page_errors_total").increment(1);
                continue;
            };
            let total = first.get("totalCount").and_then(Value::as_u64).unwrap_or(0);
            all.extend(self.parse_topics(&first, watermark).await);

            for page in 2..=section_page_count(total) {
                if let Some(data) = self.fetch_page(section, page).await {
                    all.extend(self.parse_topics(&data, watermark).await);
                } else {
                    counter!("collect_page_errors_total").increment(1);
                }
                tokio::time::sleep(PAGE_DELAY).await;
            }
        }
        info!(topics = all.len(), "section forum collection finished");
        counter!("collect_items_total").increment(all.len() as u64);
        Ok(all)
    }
}

// ---------------------------------------------------------------------------
// Cursor-paged family
// ---------------------------------------------------------------------------

pub struct CursorForumCollector {
    http: HttpSession,
    listing_api: String,
    detail_api: String,
    site_base: String,
    excluded_categories: Vec<i64>,
}

/// Topics on a cursor page that pass the category and freshness filters.
pub(crate) fn eligible_cursor_topics<'a>(
    topic_list: &'a Value,
    excluded: &[i64],
    watermark: DateTime<Utc>,
) -> Vec<&'a Value> {
    topic_list
        .get("topics")
        .and_then(Value::as_array)
        .map(|topics| {
            topics
                .iter()
                .filter(|t| {
                    let category = t.get("category_id").and_then(Value::as_i64);
                    let recent = t
                        .get("last_posted_at")
                        .and_then(Value::as_str)
                        .and_then(parse_iso_millis)
                        .is_some_and(|ts| watermark <= ts);
                    recent && !category.is_some_and(|c| excluded.contains(&c))
                })
                .collect()
        })
        .unwrap_or_default()
}

impl CursorForumCollector {
    pub fn new(endpoints: &ForumEndpoints) -> Self {
        Self {
            http: HttpSession::new(None),
            listing_api: endpoints.listing_api.clone(),
            detail_api: endpoints.detail_api.clone(),
            site_base: endpoints.site_base.trim_end_matches('/').to_string(),
            excluded_categories: endpoints.excluded_categories.clone(),
        }
    }

    async fn fetch_page(&self, page: u64) -> Option<Value> {
        let body = self
            .http
            .get_json(
                &self.listing_api,
                &[
                    ("page", page.to_string()),
                    ("no_definitions", "true".to_string()),
                ],
                &[],
            )
            .await?;
        body.get("topic_list").cloned()
    }

    async fn parse_topic(&self, topic: &Value) -> RawItem {
        let topic_id = id_string(topic.get("id")).unwrap_or_default();
        let accepted = topic.get("has_accepted_answer").and_then(Value::as_bool) == Some(true);
        let (body, url) = self.topic_detail(&topic_id).await;
        RawItem {
            id: Some(topic_id),
            title: id_string(topic.get("title")),
            url: Some(url),
            body: Some(body),
            created_at: reformat(
                topic
                    .get("created_at")
                    .and_then(Value::as_str)
                    .and_then(parse_iso_millis),
            ),
            updated_at: reformat(
                topic
                    .get("last_posted_at")
                    .and_then(Value::as_str)
                    .and_then(parse_iso_millis),
            ),
            closed: Some(accepted),
            ..Default::default()
        }
    }

    /// Fetch the first post of a topic: its cooked HTML becomes the body,
    /// its post_url the canonical permalink.
    async fn topic_detail(&self, topic_id: &str) -> (String, String) {
        let url = self.detail_api.replace("{topic_id}", topic_id);
        let Some(detail) = self.http.get_json(&url, &[], &[]).await else {
            return (String::new(), String::new());
        };
        let Some(first_post) = detail.pointer("/post_stream/posts/0") else {
            return (String::new(), String::new());
        };
        let body = first_post
            .get("cooked")
            .and_then(Value::as_str)
            .map(html_to_text)
            .unwrap_or_default();
        let permalink = first_post
            .get("post_url")
            .and_then(Value::as_str)
            .map(|p| format!("{}/{}", self.site_base, p.trim_start_matches('/')))
            .unwrap_or_default();
        (body, permalink)
    }
}

#[async_trait]
impl Collector for CursorForumCollector {
    fn kind(&self) -> SourceKind {
        SourceKind::Forum
    }

    async fn collect(&self, watermark: DateTime<Utc>) -> Result<Vec<RawItem>> {
        let mut all = Vec::new();
        let mut page = 1u64;
        loop {
            let Some(topic_list) = self.fetch_page(page).await else {
                break;
            };
            for topic in eligible_cursor_topics(&topic_list, &self.excluded_categories, watermark)
            {
                all.push(self.parse_topic(topic).await);
            }
            let fetched = topic_list
                .get("topics")
                .and_then(Value::as_array)
                .map_or(0, |a| a.len());
            if fetched < CURSOR_FULL_PAGE {
                break;
            }
            page += 1;
            tokio::time::sleep(PAGE_DELAY).await;
        }
        info!(topics = all.len(), "cursor forum collection finished");
        counter!("collect_items_total").increment(all.len() as u64);
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn watermark() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn excluded_category_is_dropped_from_a_cursor_page() {
        let topic_list = json!({
            "topics": [
                {"id": 1, "category_id": 40, "last_posted_at": "2024-01-01T12:00:00.000Z"},
                {"id": 2, "category_id": 30, "last_posted_at": "2024-01-01T12:00:00.000Z"}
            ]
        });
        let kept = eligible_cursor_topics(&topic_list, &[40], watermark());
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0]["category_id"], 30);
    }

    #[test]
    fn stale_cursor_topics_are_dropped() {
        let topic_list = json!({
            "topics": [
                {"id": 1, "category_id": 30, "last_posted_at": "2023-12-31T23:59:59.000Z"},
                {"id": 2, "category_id": 30, "last_posted_at": "2024-01-01T00:00:00.000Z"}
            ]
        });
        let kept = eligible_cursor_topics(&topic_list, &[], watermark());
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0]["id"], 2);
    }

    #[test]
    fn section_topics_filter_on_last_post_time() {
        let page = json!({
            "totalCount": 250,
            "resultList": [
                {"topicId": "1", "lastPostTime": "20240102120000"},
                {"topicId": "2", "lastPostTime": "20231231120000"}
            ]
        });
        let kept = recent_section_topics(&page, watermark());
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0]["topicId"], "1");
    }

    #[test]
    fn section_page_count_rounds_up() {
        assert_eq!(section_page_count(0), 0);
        assert_eq!(section_page_count(100), 1);
        assert_eq!(section_page_count(101), 2);
        assert_eq!(section_page_count(250), 3);
    }

    #[test]
    fn html_to_text_mirrors_a_plain_text_extraction() {
        let html = "<p>openGauss 6.0.0&nbsp;安装失败</p><pre>ERROR: no such file</pre>";
        assert_eq!(html_to_text(html), "openGauss 6.0.0 安装失败 ERROR: no such file");
    }

    #[test]
    fn compact_and_iso_timestamps_parse() {
        assert!(parse_compact("20240101120000").is_some());
        assert!(parse_compact("2024-01-01").is_none());
        assert!(parse_iso_millis("2024-01-01T12:00:00.000Z").is_some());
        assert!(parse_iso_millis("20240101120000").is_none());
    }
}
