// src/collect/stats.rs
//! Collectors backed by the community statistics API: one session-token
//! login, then a filtered, uuid-ordered page walk that accumulates every
//! page into memory. Issues and mailing-list threads share the walk and
//! differ only in query shape and row mapping.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde_json::{json, Value};
use tracing::info;

use crate::clean::TIME_FORMAT;
use crate::collect::{Collector, PAGE_DELAY, PAGE_SIZE};
use crate::error::{HarvestError, Result};
use crate::model::{RawItem, SourceKind};
use crate::net::{HttpSession, SessionAuthenticator};
use crate::settings::SecretConfig;
use crate::validate::SourceValidator;

const STATS_REFERER: &str = "https://beta.datastat.osinfra.cn/index-dict";

/// What a statistics-API query asks for, per source kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsQuery {
    Issues,
    Mail,
}

impl StatsQuery {
    pub fn kind(&self) -> SourceKind {
        match self {
            StatsQuery::Issues => SourceKind::Issue,
            StatsQuery::Mail => SourceKind::Mail,
        }
    }

    fn dims(&self) -> &'static [&'static str] {
        match self {
            StatsQuery::Issues => &[
                "uuid",
                "html_url",
                "title",
                "body",
                "created_at",
                "updated_at",
                "state",
            ],
            StatsQuery::Mail => &["uuid", "email_id", "subject", "created_at", "content"],
        }
    }

    fn filters(&self, watermark: DateTime<Utc>) -> Value {
        let cutoff = watermark.format(TIME_FORMAT).to_string();
        match self {
            StatsQuery::Issues => json!([
                {"column": "is_issue", "operator": "=", "value": "1"},
                {"column": "updated_at", "operator": ">", "value": cutoff},
                {"column": "private", "operator": "=", "value": "false"},
                {"column": "is_hide", "operator": "is", "value": "null"},
                {"column": "is_removed", "operator": "is", "value": "null"},
            ]),
            StatsQuery::Mail => json!([
                {"column": "created_at", "operator": ">", "value": cutoff},
            ]),
        }
    }

    /// Column whose value the live-validity filter probes.
    fn validity_target(&self) -> &'static str {
        match self {
            StatsQuery::Issues => "html_url",
            StatsQuery::Mail => "uuid",
        }
    }
}

/// Map one API row into the cleaner's raw shape.
pub(crate) fn map_row(query: StatsQuery, row: &Value) -> RawItem {
    let text = |key: &str| row.get(key).and_then(Value::as_str).map(str::to_string);
    match query {
        StatsQuery::Issues => RawItem {
            // uuid is "<repo-uuid>-<number>"; the suffix is the stable id
            id: text("uuid").map(|u| u.rsplit('-').next().unwrap_or(&u).to_string()),
            url: text("html_url"),
            title: text("title"),
            body: text("body"),
            created_at: text("created_at"),
            updated_at: text("updated_at"),
            state: text("state"),
            ..Default::default()
        },
        StatsQuery::Mail => RawItem {
            // the archive uuid doubles as the permalink
            url: text("uuid"),
            id: text("email_id"),
            title: text("subject"),
            body: text("content"),
            created_at: text("created_at"),
            ..Default::default()
        },
    }
}

pub struct StatsCollector {
    http: HttpSession,
    auth: SessionAuthenticator,
    data_api: String,
    community: String,
    dws_name: String,
    query: StatsQuery,
    validator: Box<dyn SourceValidator>,
}

impl StatsCollector {
    pub fn new(
        secret: &SecretConfig,
        query: StatsQuery,
        validator: Box<dyn SourceValidator>,
    ) -> Self {
        let dws_name = match query {
            StatsQuery::Issues => secret.dws_name.clone(),
            StatsQuery::Mail => secret.mail_dws_name.clone(),
        };
        Self {
            http: HttpSession::new(Some(STATS_REFERER)),
            auth: SessionAuthenticator::new(secret),
            data_api: secret.data_api.replace("{community}", &secret.community),
            community: secret.community.clone(),
            dws_name,
            query,
            validator,
        }
    }

    async fn keep_valid(&self, rows: &[Value]) -> Vec<Value> {
        let mut kept = Vec::with_capacity(rows.len());
        for row in rows {
            let target = row
                .get(self.query.validity_target())
                .and_then(Value::as_str)
                .unwrap_or("");
            if self.validator.validate(target).await {
                kept.push(row.clone());
            }
        }
        kept
    }
}

#[async_trait]
impl Collector for StatsCollector {
    fn kind(&self) -> SourceKind {
        self.query.kind()
    }

    async fn collect(&self, watermark: DateTime<Utc>) -> Result<Vec<RawItem>> {
        let token = self.auth.login().await.ok_or_else(|| {
            HarvestError::Auth(format!(
                "statistics API login failed for community {}",
                self.community
            ))
        })?;

        let mut rows: Vec<Value> = Vec::new();
        let mut page = 1u64;
        loop {
            let body = json!({
                "community": self.community,
                "dim": self.query.dims(),
                "name": self.dws_name,
                "page": page,
                "page_size": PAGE_SIZE,
                "filters": self.query.filters(watermark),
                // upstream spells it this way
                "conditonsLogic": "AND",
                "order_field": "uuid",
                "order_dir": "ASC",
            });
            let Some(resp) = self
                .http
                .post_json(
                    &self.data_api,
                    &[
                        ("page", page.to_string()),
                        ("page_size", PAGE_SIZE.to_string()),
                    ],
                    &[("token", token.as_str())],
                    &body,
                )
                .await
            else {
                break;
            };
            let page_rows = resp
                .get("data")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            if page_rows.is_empty() {
                break;
            }
            rows.extend(self.keep_valid(&page_rows).await);
            page += 1;
            tokio::time::sleep(PAGE_DELAY).await;
        }

        info!(
            community = %self.community,
            kind = %self.query.kind(),
            rows = rows.len(),
            "statistics collection finished"
        );
        counter!("collect_items_total").increment(rows.len() as u64);
        Ok(rows.iter().map(|row| map_row(self.query, row)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_rows_take_the_uuid_suffix_as_id() {
        let row = json!({
            "uuid": "repo-abc-123",
            "html_url": "https://gitee.com/o/r/issues/123",
            "title": "Test Issue",
            "body": "Issue content",
            "created_at": "2024-01-01 12:00:00",
            "updated_at": "2024-01-02 12:00:00",
            "state": "open"
        });
        let item = map_row(StatsQuery::Issues, &row);
        assert_eq!(item.id.as_deref(), Some("123"));
        assert_eq!(item.url.as_deref(), Some("https://gitee.com/o/r/issues/123"));
        assert_eq!(item.state.as_deref(), Some("open"));
        assert_eq!(item.title.as_deref(), Some("Test Issue"));
    }

    #[test]
    fn mail_rows_map_archive_fields() {
        let row = json!({
            "uuid": "https://mailweb.example.org/archives/list/x/thread/Y/",
            "email_id": "abc@example.org",
            "subject": "安装扩展失败",
            "created_at": "2025-02-08 22:17:47",
            "content": "详细描述"
        });
        let item = map_row(StatsQuery::Mail, &row);
        assert_eq!(item.id.as_deref(), Some("abc@example.org"));
        assert_eq!(item.title.as_deref(), Some("安装扩展失败"));
        assert_eq!(item.body.as_deref(), Some("详细描述"));
        assert!(item.url.as_deref().unwrap().starts_with("https://mailweb"));
        assert!(item.state.is_none());
    }

    #[test]
    fn issue_filters_carry_the_watermark_cutoff() {
        let watermark = DateTime::parse_from_rfc3339("2024-01-05T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let filters = StatsQuery::Issues.filters(watermark);
        let filters = filters.as_array().unwrap();
        assert!(filters.iter().any(|f| {
            f["column"] == "updated_at" && f["value"] == "2024-01-05 00:00:00"
        }));
        assert!(filters.iter().any(|f| f["column"] == "is_issue"));

        let mail = StatsQuery::Mail.filters(watermark);
        assert_eq!(mail.as_array().unwrap().len(), 1);
    }
}
