// src/collect/mod.rs
pub mod forum;
pub mod stats;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{HarvestError, Result};
use crate::model::{RawItem, SourceKind};
use crate::settings::Settings;
use crate::strategy::{forum_family, ForumFamily};
use crate::validate::{IssueValidator, MailValidator};

/// Fixed inter-page delay; upstream endpoints throttle aggressive crawlers,
/// so this is a hard constraint, not tuning.
pub(crate) const PAGE_DELAY: std::time::Duration = std::time::Duration::from_millis(500);

pub(crate) const PAGE_SIZE: usize = 100;

#[async_trait]
pub trait Collector: Send + Sync {
    /// Fetch all raw items created or updated after `watermark`. Partial
    /// results are acceptable; a failed page is skipped, not fatal.
    async fn collect(&self, watermark: DateTime<Utc>) -> Result<Vec<RawItem>>;

    fn kind(&self) -> SourceKind;
}

/// Collector for the configured community and source kind.
pub fn build_collector(settings: &Settings, kind: SourceKind) -> Result<Box<dyn Collector>> {
    let secret = &settings.secret;
    match kind {
        SourceKind::Issue => Ok(Box::new(stats::StatsCollector::new(
            secret,
            stats::StatsQuery::Issues,
            Box::new(IssueValidator::new()),
        ))),
        SourceKind::Mail => Ok(Box::new(stats::StatsCollector::new(
            secret,
            stats::StatsQuery::Mail,
            Box::new(MailValidator),
        ))),
        SourceKind::Forum => {
            let community = secret.community.as_str();
            let endpoints = secret.forums.get(community).ok_or_else(|| {
                HarvestError::Config(format!(
                    "no forum endpoints configured for community: {community}"
                ))
            })?;
            match forum_family(community)? {
                ForumFamily::SectionPaged => {
                    Ok(Box::new(forum::SectionForumCollector::new(endpoints)))
                }
                ForumFamily::CursorPaged => {
                    Ok(Box::new(forum::CursorForumCollector::new(endpoints)))
                }
            }
        }
    }
}
