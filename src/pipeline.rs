// src/pipeline.rs
//! Run orchestration: watermark computation, the deletion sweep, and the
//! per-kind collect → clean → store drive for the configured community.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc, Weekday};
use metrics::{counter, gauge};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::clean::Cleaner;
use crate::collect::build_collector;
use crate::error::Result;
use crate::llm::ChatClient;
use crate::model::{NormalizedRecord, SourceKind};
use crate::settings::Settings;
use crate::store::{DiscussionStore, MergePolicy};
use crate::strategy::{strategy_for, supported_kinds};
use crate::validate::{forum_validator, IssueValidator, SourceValidator};

/// Collection cutoff: the most recent past Friday at 00:00. A run on a
/// Friday reaches back a full week, so the overlap window is never empty.
pub fn last_friday(now: DateTime<Utc>) -> DateTime<Utc> {
    let today = now.date_naive();
    let mut back = (today.weekday().num_days_from_monday() as i64 + 7
        - Weekday::Fri.num_days_from_monday() as i64)
        % 7;
    if back == 0 {
        back = 7;
    }
    let date = today - Duration::days(back);
    DateTime::from_naive_utc_and_offset(date.and_time(NaiveTime::MIN), Utc)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RunSummary {
    pub collected: usize,
    pub stored: usize,
    pub flagged_deleted: usize,
}

pub struct Pipeline {
    settings: Arc<Settings>,
    store: DiscussionStore,
    chat: Arc<dyn ChatClient>,
    policy: MergePolicy,
    run_lock: Mutex<()>,
}

impl Pipeline {
    pub fn new(settings: Arc<Settings>, store: DiscussionStore, chat: Arc<dyn ChatClient>) -> Self {
        Self {
            settings,
            store,
            chat,
            policy: MergePolicy::default(),
            run_lock: Mutex::new(()),
        }
    }

    pub fn with_policy(mut self, policy: MergePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Run unless another invocation is already in flight; overlapping runs
    /// would race on upserts, so the second caller is turned away.
    pub async fn try_run(&self) -> Option<Result<RunSummary>> {
        let Ok(_guard) = self.run_lock.try_lock() else {
            warn!("pipeline run already in flight, skipping");
            return None;
        };
        Some(self.run_once().await)
    }

    /// One full invocation: sweep, then collect → clean per source kind,
    /// then a single batched store of the concatenated records.
    async fn run_once(&self) -> Result<RunSummary> {
        let community = self.settings.secret.community.clone();
        let mut summary = RunSummary {
            flagged_deleted: self.sweep_deleted(&community).await?,
            ..Default::default()
        };

        let watermark = last_friday(Utc::now());
        info!(%community, %watermark, "starting collection");

        let mut records: Vec<NormalizedRecord> = Vec::new();
        for kind in supported_kinds(&community)? {
            let strategy = strategy_for(&self.settings.base, &community, *kind)?;
            let collector = build_collector(&self.settings, *kind)?;
            let raw = collector.collect(watermark).await?;
            let cleaner = Cleaner::new(&strategy, self.chat.as_ref(), &self.store);
            records.extend(cleaner.process(raw).await?);
        }

        summary.collected = records.len();
        summary.stored = self.store.store(&records, self.policy).await?;

        gauge!("pipeline_last_run_ts").set(Utc::now().timestamp() as f64);
        counter!("pipeline_runs_total").increment(1);
        info!(
            collected = summary.collected,
            stored = summary.stored,
            flagged = summary.flagged_deleted,
            "pipeline run complete"
        );
        Ok(summary)
    }

    /// Whole-table revalidation pass, independent of the watermark: any
    /// active record whose URL no longer resolves upstream is soft-deleted.
    /// Only `is_deleted` changes.
    async fn sweep_deleted(&self, community: &str) -> Result<usize> {
        let issue_validator = IssueValidator::new();
        let forum_validator: Option<Box<dyn SourceValidator>> =
            forum_validator(community, &self.settings.secret).ok();

        let mut flagged = 0;
        for (id, source_type, url) in self.store.active_identities().await? {
            let valid = match source_type.parse::<SourceKind>() {
                Ok(SourceKind::Issue) => issue_validator.validate(&url).await,
                Ok(SourceKind::Forum) => match &forum_validator {
                    Some(v) => v.validate(&url).await,
                    None => true,
                },
                Ok(SourceKind::Mail) => true,
                Err(_) => {
                    warn!(%source_type, row = id, "unknown source_type in store");
                    true
                }
            };
            if !valid {
                self.store.mark_deleted(id).await?;
                flagged += 1;
            }
        }
        if flagged > 0 {
            info!(flagged, "sweep flagged records missing upstream");
        }
        counter!("sweep_flagged_total").increment(flagged as u64);
        Ok(flagged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn watermark_is_the_previous_friday_midnight() {
        // 2024-01-06 is a Saturday
        assert_eq!(
            last_friday(utc("2024-01-06T10:30:00Z")),
            utc("2024-01-05T00:00:00Z")
        );
        // Thursday reaches back six days
        assert_eq!(
            last_friday(utc("2024-01-11T23:59:59Z")),
            utc("2024-01-05T00:00:00Z")
        );
    }

    #[test]
    fn a_friday_run_reaches_back_a_full_week() {
        // 2024-01-05 is a Friday
        assert_eq!(
            last_friday(utc("2024-01-05T00:00:00Z")),
            utc("2023-12-29T00:00:00Z")
        );
        assert_eq!(
            last_friday(utc("2024-01-05T18:00:00Z")),
            utc("2023-12-29T00:00:00Z")
        );
    }
}
