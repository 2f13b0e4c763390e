// src/validate.rs
//! Live existence checks for stored discussion URLs, polymorphic per source
//! kind and forum backend. All checks fail closed: a network error, an
//! unexpected payload or an unparseable URL means "not valid". Callers use
//! the verdict to flip the soft-delete flag; nothing is mutated here.

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::error::{HarvestError, Result};
use crate::net::HttpSession;
use crate::settings::SecretConfig;

#[async_trait]
pub trait SourceValidator: Send + Sync {
    async fn validate(&self, target: &str) -> bool;
}

// ---------------------------------------------------------------------------
// Issue trackers
// ---------------------------------------------------------------------------

const GITCODE_REFERER: (&str, &str) = ("Referer", "https://gitcode.com");

/// Checks issue URLs against the hosting backend. gitcode needs two API
/// probes (project visibility, then the issue object); gitee answers a plain
/// GET on the project page. Unknown hosts are invalid.
pub struct IssueValidator {
    http: HttpSession,
}

impl IssueValidator {
    pub fn new() -> Self {
        Self {
            http: HttpSession::new(None),
        }
    }
}

impl Default for IssueValidator {
    fn default() -> Self {
        Self::new()
    }
}

fn path_segments(url: &str) -> Vec<&str> {
    let without_scheme = url.splitn(2, "://").nth(1).unwrap_or(url);
    let without_query = without_scheme.split('?').next().unwrap_or(without_scheme);
    let mut parts = without_query.splitn(2, '/');
    let _host = parts.next();
    parts
        .next()
        .map(|path| path.split('/').filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

pub(crate) fn gitcode_owner_repo(url: &str) -> Option<(String, String)> {
    let segments = path_segments(url);
    match segments.as_slice() {
        [owner, repo, ..] => Some((owner.to_string(), repo.to_string())),
        _ => None,
    }
}

pub(crate) fn gitcode_issue_id(url: &str) -> Option<String> {
    let segments = path_segments(url);
    segments
        .windows(2)
        .find(|pair| pair[0] == "issues")
        .map(|pair| pair[1].to_string())
}

#[async_trait]
impl SourceValidator for IssueValidator {
    async fn validate(&self, target: &str) -> bool {
        if target.contains("gitcode.com") {
            let Some((owner, repo)) = gitcode_owner_repo(target) else {
                return false;
            };
            let project_api =
                format!("https://web-api.gitcode.com/api/v2/projects/{owner}%2F{repo}/simple");
            let Some(meta) = self.http.get_json(&project_api, &[], &[GITCODE_REFERER]).await
            else {
                return false;
            };
            if meta.get("visibility").and_then(Value::as_str) == Some("private") {
                return false;
            }
            let Some(issue_id) = gitcode_issue_id(target) else {
                return false;
            };
            let issue_api = format!(
                "https://web-api.gitcode.com/issuepr/api/v1/issue/{owner}%2F{repo}/issues/{issue_id}"
            );
            self.http.get_ok(&issue_api, &[GITCODE_REFERER]).await
        } else if target.contains("gitee.com") {
            let project_url = target.split("/issues").next().unwrap_or(target);
            self.http.get_ok(project_url, &[]).await
        } else {
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Forums
// ---------------------------------------------------------------------------

/// Plain-GET family: the permalink answering 2xx is proof enough.
pub struct UrlProbeValidator {
    http: HttpSession,
}

impl UrlProbeValidator {
    pub fn new() -> Self {
        Self {
            http: HttpSession::new(None),
        }
    }
}

impl Default for UrlProbeValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceValidator for UrlProbeValidator {
    async fn validate(&self, target: &str) -> bool {
        self.http.get_ok(target, &[]).await
    }
}

/// The detail API's "topic does not exist" error code.
const TOPIC_GONE_CODE: &str = "HD.65120026";

/// Topic id embedded in a thread permalink, e.g. `thread-12345-1-1.html`.
pub(crate) fn topic_id_from_url(target: &str) -> Option<&str> {
    let after_dash = target.split('-').nth(1)?;
    after_dash.split('/').next()
}

/// Detail-API family: a live topic id must not come back with the backend's
/// "not found" error code.
pub struct TopicApiValidator {
    http: HttpSession,
    detail_api: String,
}

impl TopicApiValidator {
    pub fn new(detail_api: &str) -> Self {
        Self {
            http: HttpSession::new(None),
            detail_api: detail_api.to_string(),
        }
    }
}

#[async_trait]
impl SourceValidator for TopicApiValidator {
    async fn validate(&self, target: &str) -> bool {
        let Some(topic_id) = topic_id_from_url(target) else {
            warn!(%target, "no topic id in forum url");
            return false;
        };
        let Some(body) = self
            .http
            .get_json(&self.detail_api, &[("topicId", topic_id.to_string())], &[])
            .await
        else {
            return false;
        };
        match body.get("data") {
            Some(data) if data.get("error_code").and_then(Value::as_str) == Some(TOPIC_GONE_CODE) => {
                false
            }
            _ => true,
        }
    }
}

/// Routed family for communities whose topics live on two hosts: native
/// forum links probe directly, cross-posted topics go through the detail API.
pub struct RoutedForumValidator {
    native_host: String,
    probe: UrlProbeValidator,
    topic: TopicApiValidator,
}

impl RoutedForumValidator {
    pub fn new(native_host: &str, detail_api: &str) -> Self {
        Self {
            native_host: native_host.to_string(),
            probe: UrlProbeValidator::new(),
            topic: TopicApiValidator::new(detail_api),
        }
    }
}

#[async_trait]
impl SourceValidator for RoutedForumValidator {
    async fn validate(&self, target: &str) -> bool {
        if target.contains(&self.native_host) {
            self.probe.validate(target).await
        } else {
            self.topic.validate(target).await
        }
    }
}

// ---------------------------------------------------------------------------
// Mail
// ---------------------------------------------------------------------------

/// Mailing-list archives have no upstream deletion model; every archived
/// thread counts as present. A policy choice, not a guarantee.
pub struct MailValidator;

#[async_trait]
impl SourceValidator for MailValidator {
    async fn validate(&self, _target: &str) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Forum validator for a community, or an explicit error on unknown input.
pub fn forum_validator(
    community: &str,
    secret: &SecretConfig,
) -> Result<Box<dyn SourceValidator>> {
    let detail_api = |c: &str| -> Result<String> {
        secret
            .forums
            .get(c)
            .map(|f| f.detail_api.clone())
            .ok_or_else(|| {
                HarvestError::Config(format!("no forum endpoints configured for community: {c}"))
            })
    };
    match community {
        "openubmc" | "openeuler" => Ok(Box::new(UrlProbeValidator::new())),
        "cann" => Ok(Box::new(TopicApiValidator::new(&detail_api("cann")?))),
        // mindspore topics are split between the native Discourse and the
        // hiascend board; route by host.
        "mindspore" => Ok(Box::new(RoutedForumValidator::new(
            "discuss.mindspore.cn",
            &detail_api("cann")?,
        ))),
        other => Err(HarvestError::Config(format!(
            "unsupported community: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gitcode_urls_parse_into_owner_repo_and_issue() {
        let url = "https://gitcode.com/owner/repo/issues/123";
        assert_eq!(
            gitcode_owner_repo(url),
            Some(("owner".to_string(), "repo".to_string()))
        );
        assert_eq!(gitcode_issue_id(url), Some("123".to_string()));

        assert_eq!(gitcode_owner_repo("https://gitcode.com/owner"), None);
        assert_eq!(gitcode_issue_id("https://gitcode.com/owner/repo"), None);
    }

    #[test]
    fn topic_id_comes_from_the_first_dash_segment() {
        assert_eq!(
            topic_id_from_url("https://www.hiascend.com/forum/thread-12345-1-1.html"),
            Some("12345")
        );
        assert_eq!(
            topic_id_from_url("http://forum.com/topic-12345/123.htm"),
            Some("12345")
        );
        assert_eq!(topic_id_from_url("https://forum.example/plain"), None);
    }

    #[tokio::test]
    async fn mail_targets_are_always_valid() {
        assert!(MailValidator.validate("anything").await);
        assert!(MailValidator.validate("").await);
    }

    #[test]
    fn unknown_community_is_an_explicit_error() {
        let secret: crate::settings::SecretConfig = serde_yaml::from_str(
            r#"
app_env: "test"
community: "cann"
account: "a"
password: "p"
client_id: "c"
one_id_api: "https://id.example.test"
data_api: "https://stats.example.test/{community}"
dws_name: "dws"
llm_api_key: "k"
db: { user: u, password: p, host: h, port: 5432, name: n }
"#,
        )
        .unwrap();
        let err = forum_validator("unknown", &secret).err().unwrap();
        assert!(err.to_string().contains("unsupported community"));
    }
}
