// src/strategy.rs
//! Per-(community, source-kind) strategy bundles. What a strategy holds is
//! configuration, not behavior: a system prompt, exclusion patterns tuned by
//! the community's moderators, and routing data for picking the collector
//! and validator variants. A factory maps (community, kind) to a bundle and
//! rejects unknown input explicitly.

use regex::Regex;

use crate::error::{HarvestError, Result};
use crate::model::SourceKind;
use crate::settings::BaseConfig;

/// Which crawl family a community's forum uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForumFamily {
    /// Fixed section list, total-count paging.
    SectionPaged,
    /// Discourse-style listing, short page ends pagination.
    CursorPaged,
}

#[derive(Debug)]
pub struct Strategy {
    pub community: String,
    pub kind: SourceKind,
    pub system_prompt: String,
    pub strip_mail_headers: bool,
    title_exclude: Vec<Regex>,
    body_exclude: Vec<Regex>,
}

impl Strategy {
    /// Inclusion predicate: a hit on any exclusion pattern drops the item.
    pub fn accepts(&self, title: &str, body: &str) -> bool {
        !self.title_exclude.iter().any(|re| re.is_match(title))
            && !self.body_exclude.iter().any(|re| re.is_match(body))
    }
}

/// Source kinds collected for a community.
pub fn supported_kinds(community: &str) -> Result<&'static [SourceKind]> {
    use SourceKind::*;
    Ok(match community {
        "cann" => &[Forum, Issue],
        "openubmc" => &[Forum, Issue],
        "mindspore" => &[Forum, Issue],
        "opengauss" => &[Issue, Mail],
        "openeuler" => &[Forum, Issue, Mail],
        other => {
            return Err(HarvestError::Config(format!(
                "unsupported community: {other}"
            )))
        }
    })
}

pub fn forum_family(community: &str) -> Result<ForumFamily> {
    match community {
        "cann" => Ok(ForumFamily::SectionPaged),
        "openubmc" | "mindspore" | "openeuler" => Ok(ForumFamily::CursorPaged),
        other => Err(HarvestError::Config(format!(
            "unsupported community: {other}"
        ))),
    }
}

pub fn strategy_for(base: &BaseConfig, community: &str, kind: SourceKind) -> Result<Strategy> {
    let kinds = supported_kinds(community)?;
    if !kinds.contains(&kind) {
        return Err(HarvestError::Config(format!(
            "source kind '{kind}' is not collected for community '{community}'"
        )));
    }
    let key = format!("{community}.{kind}");
    let patterns = base.filters.get(&key).cloned().unwrap_or_default();
    Ok(Strategy {
        community: community.to_string(),
        kind,
        system_prompt: base.prompts.get(&key).cloned().unwrap_or_default(),
        strip_mail_headers: kind == SourceKind::Mail,
        title_exclude: compile(&patterns.title)?,
        body_exclude: compile(&patterns.body)?,
    })
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p)
                .map_err(|e| HarvestError::Config(format!("bad filter pattern {p:?}: {e}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> BaseConfig {
        serde_yaml::from_str(
            r#"
llm: { api_url: "http://llm.example.test", model: "test" }
prompts:
  "cann.forum": "clean forum posts"
filters:
  "cann.forum":
    title: ["教程", "学习笔记", "训练营"]
  "opengauss.mail":
    title: ["例会", "通知"]
    body: ["会议主题"]
"#,
        )
        .unwrap()
    }

    #[test]
    fn unknown_community_fails_the_factory() {
        let err = strategy_for(&base(), "nope", SourceKind::Forum).unwrap_err();
        assert!(err.to_string().contains("unsupported community"));
        assert!(supported_kinds("nope").is_err());
    }

    #[test]
    fn kind_not_collected_for_community_is_rejected() {
        let err = strategy_for(&base(), "cann", SourceKind::Mail).unwrap_err();
        assert!(err.to_string().contains("not collected"));
    }

    #[test]
    fn forum_title_filters_drop_course_advertisements() {
        let strategy = strategy_for(&base(), "cann", SourceKind::Forum).unwrap();
        assert!(strategy.accepts("Valid Title", "any body"));
        assert!(!strategy.accepts("从入门到精通教程", "any body"));
        assert!(!strategy.accepts("学习笔记分享", "any body"));
        assert!(!strategy.accepts("训练营资料", "any body"));
    }

    #[test]
    fn mail_filters_check_both_title_and_body() {
        let strategy = strategy_for(&base(), "opengauss", SourceKind::Mail).unwrap();
        assert!(strategy.strip_mail_headers);
        assert!(strategy.accepts("正常问题", "详细描述"));
        assert!(!strategy.accepts("例会通知", "内容"));
        assert!(!strategy.accepts("升级通知", ""));
        assert!(!strategy.accepts("测试邮件", "包含会议主题"));
    }

    #[test]
    fn missing_filter_key_means_no_filter() {
        let strategy = strategy_for(&base(), "openubmc", SourceKind::Forum).unwrap();
        assert!(strategy.accepts("任何标题", "任何内容"));
        assert!(strategy.system_prompt.is_empty());
    }
}
