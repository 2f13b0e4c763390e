// tests/clean_pipeline.rs
//
// Cleaner behavior with a stubbed chat client and an in-memory derived
// index: the end-to-end happy path, required-field skips, filter skips, and
// the enrichment idempotence guarantee.

use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Timelike;

use discussion_harvester::clean::{Cleaner, DerivedIndex};
use discussion_harvester::llm::{ChatClient, RetryingChat};
use discussion_harvester::model::{RawItem, SourceKind};
use discussion_harvester::settings::BaseConfig;
use discussion_harvester::strategy::{strategy_for, Strategy};

struct StubChat {
    reply: &'static str,
    calls: AtomicUsize,
}

impl StubChat {
    fn new(reply: &'static str) -> Self {
        Self {
            reply,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ChatClient for StubChat {
    async fn complete(&self, _system: &str, _user: &str) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.reply.to_string())
    }
    fn name(&self) -> &'static str {
        "stub"
    }
}

struct FailingChat {
    calls: std::sync::Arc<AtomicUsize>,
}

impl FailingChat {
    fn new() -> (Self, std::sync::Arc<AtomicUsize>) {
        let calls = std::sync::Arc::new(AtomicUsize::new(0));
        (
            Self {
                calls: calls.clone(),
            },
            calls,
        )
    }
}

#[async_trait]
impl ChatClient for FailingChat {
    async fn complete(&self, _system: &str, _user: &str) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(anyhow!("model unavailable"))
    }
    fn name(&self) -> &'static str {
        "failing"
    }
}

/// Derived-content index with a fixed answer.
struct FixedIndex(bool);

#[async_trait]
impl DerivedIndex for FixedIndex {
    async fn has_clean_data(&self, _kind: SourceKind, _id: &str) -> anyhow::Result<bool> {
        Ok(self.0)
    }
}

fn base_config() -> BaseConfig {
    serde_yaml::from_str(
        r#"
llm: { api_url: "http://llm.example.test", model: "test" }
prompts:
  "cann.issue": "整理issue内容"
filters:
  "cann.issue":
    title: ["训练营"]
"#,
    )
    .unwrap()
}

fn issue_strategy() -> Strategy {
    strategy_for(&base_config(), "cann", SourceKind::Issue).unwrap()
}

fn sample_issue() -> RawItem {
    RawItem {
        id: Some("123".to_string()),
        title: Some("Test Issue".to_string()),
        body: Some("Issue content".to_string()),
        url: Some("https://gitee.com/o/r/issues/123".to_string()),
        created_at: Some("2024-01-01 12:00:00".to_string()),
        state: Some("open".to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn a_fresh_issue_is_enriched_and_normalized() {
    let strategy = issue_strategy();
    let chat = StubChat::new("Cleaned content");
    let index = FixedIndex(false);
    let cleaner = Cleaner::new(&strategy, &chat, &index);

    let out = cleaner.process(vec![sample_issue()]).await.unwrap();
    assert_eq!(out.len(), 1);

    let record = &out[0];
    assert_eq!(record.source_id, "123");
    assert_eq!(record.source_type, SourceKind::Issue);
    assert_eq!(record.clean_data, "Cleaned content");
    assert_eq!(record.topic_summary, "Cleaned content");
    assert!(!record.source_closed);
    assert!(!record.topic_closed);
    assert_eq!(record.created_at.hour(), 12);
    assert_eq!(chat.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn items_missing_required_fields_are_skipped_not_fatal() {
    let strategy = issue_strategy();
    let chat = StubChat::new("unused");
    let index = FixedIndex(false);
    let cleaner = Cleaner::new(&strategy, &chat, &index);

    let incomplete = RawItem {
        id: Some("456".to_string()),
        title: Some("无效标题".to_string()),
        ..Default::default()
    };
    let out = cleaner
        .process(vec![incomplete, sample_issue()])
        .await
        .unwrap();

    assert_eq!(out.len(), 1, "good item survives a bad neighbor");
    assert_eq!(out[0].source_id, "123");
    assert_eq!(chat.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn filtered_titles_never_reach_the_llm() {
    let strategy = issue_strategy();
    let chat = StubChat::new("unused");
    let index = FixedIndex(false);
    let cleaner = Cleaner::new(&strategy, &chat, &index);

    let excluded = RawItem {
        id: Some("789".to_string()),
        title: Some("训练营资料".to_string()),
        body: Some("报名链接".to_string()),
        ..Default::default()
    };
    let out = cleaner.process(vec![excluded]).await.unwrap();
    assert!(out.is_empty());
    assert_eq!(chat.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn existing_derived_content_skips_the_enrichment_call() {
    let strategy = issue_strategy();
    let chat = StubChat::new("should not be called");
    let index = FixedIndex(true);
    let cleaner = Cleaner::new(&strategy, &chat, &index);

    let out = cleaner.process(vec![sample_issue()]).await.unwrap();

    // The record is still re-emitted so title/body/closed-state refresh,
    // but with empty derived text and no LLM call.
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].clean_data, "");
    assert_eq!(out[0].topic_summary, "");
    assert_eq!(out[0].title, "Test Issue");
    assert_eq!(chat.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn exhausted_retries_cost_only_the_one_item() {
    let strategy = issue_strategy();
    let (failing, calls) = FailingChat::new();
    let chat = RetryingChat::with_policy(failing, 3, std::time::Duration::ZERO);
    let index = FixedIndex(false);
    let cleaner = Cleaner::new(&strategy, &chat, &index);

    let mut second = sample_issue();
    second.id = Some("124".to_string());
    let out = cleaner
        .process(vec![sample_issue(), second])
        .await
        .unwrap();

    // Both items fail enrichment and are skipped; the stream itself succeeds,
    // and each item got the full retry budget.
    assert!(out.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn an_always_failing_enrichment_is_attempted_exactly_three_times() {
    let (failing, calls) = FailingChat::new();
    let chat = RetryingChat::with_policy(failing, 3, std::time::Duration::ZERO);
    let err = chat.complete("sys", "user").await.unwrap_err();
    assert!(err.to_string().contains("model unavailable"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn closed_state_maps_from_upstream_fields() {
    let strategy = issue_strategy();
    let chat = StubChat::new("Cleaned content");
    let index = FixedIndex(false);
    let cleaner = Cleaner::new(&strategy, &chat, &index);

    let mut closed_issue = sample_issue();
    closed_issue.state = Some("closed".to_string());
    closed_issue.closed = Some(true);

    let out = cleaner.process(vec![closed_issue]).await.unwrap();
    assert!(out[0].source_closed);
    assert!(out[0].topic_closed);
}
