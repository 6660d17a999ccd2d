//! The `ForgeClient` collaborator: sub-issue/blocked-by lookups, comment
//! posting, and branch-state queries against whatever issue tracker backs a
//! session, plus the retry/cache wrapper and branch naming helpers shared by
//! every implementation.

use crate::cancellation::CancellationToken;
use crate::errors::ForgeError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::LazyLock;
use std::time::Duration;

/// One related-item reference as returned by `sub_issues`/`blocked_by`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelatedIssue {
    pub number: u64,
    pub state: String,
}

/// Where a task's branch currently stands relative to the default branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchState {
    Merged { branch: String },
    Open { branch: String },
    None,
}

#[async_trait]
pub trait ForgeClient: Send + Sync {
    async fn sub_issues(
        &self,
        issue_number: u64,
        cancellation: &CancellationToken,
    ) -> Result<Vec<RelatedIssue>, ForgeError>;

    async fn blocked_by(
        &self,
        issue_number: u64,
        cancellation: &CancellationToken,
    ) -> Result<Vec<RelatedIssue>, ForgeError>;

    async fn post_comment(
        &self,
        issue_number: u64,
        body: &str,
        cancellation: &CancellationToken,
    ) -> Result<(), ForgeError>;

    async fn branch_state(
        &self,
        issue_number: u64,
        cancellation: &CancellationToken,
    ) -> Result<BranchState, ForgeError>;
}

/// Only `OPEN` (case-insensitive) related issues are retained.
fn retain_open(mut issues: Vec<RelatedIssue>) -> Vec<RelatedIssue> {
    issues.retain(|i| i.state.eq_ignore_ascii_case("open"));
    issues
}

/// Exponential backoff schedule used by every retrying forge call.
const RETRY_SCHEDULE_SECS: [u64; 6] = [0, 1, 2, 4, 8, 16];

/// Retry an API call against the fixed `{0s,1s,2s,4s,8s,16s}` schedule,
/// honoring cancellation on every attempt and every sleep.
pub async fn with_retry<T, F, Fut>(
    cancellation: &CancellationToken,
    mut attempt: F,
) -> Result<T, ForgeError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ForgeError>>,
{
    let mut last_err = None;
    for (idx, &delay) in RETRY_SCHEDULE_SECS.iter().enumerate() {
        if cancellation.is_cancelled() {
            return Err(ForgeError::Cancelled);
        }
        if delay > 0
            && cancellation
                .cancellable_sleep(Duration::from_secs(delay))
                .await
                .is_err()
        {
            return Err(ForgeError::Cancelled);
        }
        match attempt().await {
            Ok(v) => return Ok(v),
            Err(ForgeError::Transient(msg)) => last_err = Some(msg),
            Err(other) => return Err(other),
        }
        let _ = idx;
    }
    Err(ForgeError::RetriesExhausted {
        attempts: RETRY_SCHEDULE_SECS.len() as u32,
        message: last_err.unwrap_or_else(|| "unknown transient failure".to_string()),
    })
}

/// Wraps any `ForgeClient`, caching `sub_issues`/`blocked_by` lookups per
/// issue id for the life of the session and routing every call through
/// `with_retry`. Built on top of, rather than folded into, `ForgeClient`
/// implementations so the cache applies uniformly regardless of which
/// concrete client backs a session.
pub struct ForgeCache {
    inner: Arc<dyn ForgeClient>,
    sub_issues_cache: Mutex<HashMap<u64, Vec<RelatedIssue>>>,
    blocked_by_cache: Mutex<HashMap<u64, Vec<RelatedIssue>>>,
}

impl ForgeCache {
    pub fn new(inner: Arc<dyn ForgeClient>) -> Self {
        Self {
            inner,
            sub_issues_cache: Mutex::new(HashMap::new()),
            blocked_by_cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn cached_sub_issues(
        &self,
        issue_number: u64,
        cancellation: &CancellationToken,
    ) -> Result<Vec<RelatedIssue>, ForgeError> {
        if let Some(cached) = self.sub_issues_cache.lock().expect("mutex poisoned").get(&issue_number) {
            return Ok(cached.clone());
        }
        let result = with_retry(cancellation, || self.inner.sub_issues(issue_number, cancellation)).await?;
        self.sub_issues_cache
            .lock()
            .expect("mutex poisoned")
            .insert(issue_number, result.clone());
        Ok(result)
    }

    pub async fn cached_blocked_by(
        &self,
        issue_number: u64,
        cancellation: &CancellationToken,
    ) -> Result<Vec<RelatedIssue>, ForgeError> {
        if let Some(cached) = self.blocked_by_cache.lock().expect("mutex poisoned").get(&issue_number) {
            return Ok(cached.clone());
        }
        let result = with_retry(cancellation, || self.inner.blocked_by(issue_number, cancellation)).await?;
        self.blocked_by_cache
            .lock()
            .expect("mutex poisoned")
            .insert(issue_number, result.clone());
        Ok(result)
    }
}

/// No dependencies, no branches, comments accepted and discarded. Used when a
/// session runs with no forge integration at all.
#[derive(Debug, Default)]
pub struct NullForgeClient;

#[async_trait]
impl ForgeClient for NullForgeClient {
    async fn sub_issues(
        &self,
        _issue_number: u64,
        _cancellation: &CancellationToken,
    ) -> Result<Vec<RelatedIssue>, ForgeError> {
        Ok(Vec::new())
    }

    async fn blocked_by(
        &self,
        _issue_number: u64,
        _cancellation: &CancellationToken,
    ) -> Result<Vec<RelatedIssue>, ForgeError> {
        Ok(Vec::new())
    }

    async fn post_comment(
        &self,
        _issue_number: u64,
        _body: &str,
        _cancellation: &CancellationToken,
    ) -> Result<(), ForgeError> {
        Ok(())
    }

    async fn branch_state(
        &self,
        _issue_number: u64,
        _cancellation: &CancellationToken,
    ) -> Result<BranchState, ForgeError> {
        Ok(BranchState::None)
    }
}

/// In-memory test fake with per-id canned responses. Holds no cache itself —
/// `sub_issues_calls` exists so tests can assert how many times the
/// underlying client was actually hit through a `ForgeCache` wrapper.
#[derive(Default)]
pub struct FakeForgeClient {
    pub sub_issues: HashMap<u64, Vec<RelatedIssue>>,
    pub blocked_by: HashMap<u64, Vec<RelatedIssue>>,
    pub branch_states: HashMap<u64, BranchState>,
    pub posted_comments: Mutex<Vec<(u64, String)>>,
    pub sub_issues_calls: Mutex<u32>,
}

#[async_trait]
impl ForgeClient for FakeForgeClient {
    async fn sub_issues(
        &self,
        issue_number: u64,
        _cancellation: &CancellationToken,
    ) -> Result<Vec<RelatedIssue>, ForgeError> {
        *self.sub_issues_calls.lock().expect("mutex poisoned") += 1;
        Ok(retain_open(
            self.sub_issues.get(&issue_number).cloned().unwrap_or_default(),
        ))
    }

    async fn blocked_by(
        &self,
        issue_number: u64,
        _cancellation: &CancellationToken,
    ) -> Result<Vec<RelatedIssue>, ForgeError> {
        Ok(retain_open(
            self.blocked_by.get(&issue_number).cloned().unwrap_or_default(),
        ))
    }

    async fn post_comment(
        &self,
        issue_number: u64,
        body: &str,
        _cancellation: &CancellationToken,
    ) -> Result<(), ForgeError> {
        self.posted_comments
            .lock()
            .expect("mutex poisoned")
            .push((issue_number, body.to_string()));
        Ok(())
    }

    async fn branch_state(
        &self,
        issue_number: u64,
        _cancellation: &CancellationToken,
    ) -> Result<BranchState, ForgeError> {
        Ok(self
            .branch_states
            .get(&issue_number)
            .cloned()
            .unwrap_or(BranchState::None))
    }
}

static NON_SLUG_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"[^a-z0-9-]+").expect("static regex is valid"));
static DASH_RUN_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"-{2,}").expect("static regex is valid"));

fn slugify(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let replaced = NON_SLUG_RE.replace_all(&lowered, "-");
    let collapsed = DASH_RUN_RE.replace_all(&replaced, "-");
    collapsed.trim_matches('-').to_string()
}

/// Derive a branch prefix from the first label name; falls back to
/// `"feature"` when the slugified result is empty.
pub fn branch_prefix(first_label: Option<&str>) -> String {
    match first_label.map(slugify) {
        Some(slug) if !slug.is_empty() => slug,
        _ => "feature".to_string(),
    }
}

/// Build the full branch name `<prefix>/issue-<id>-<short-slug>`.
pub fn branch_name(first_label: Option<&str>, id: u64, title: &str) -> String {
    let prefix = branch_prefix(first_label);
    let short_slug = slugify(title);
    let short_slug: String = short_slug.chars().take(40).collect();
    let short_slug = short_slug.trim_end_matches('-');
    if short_slug.is_empty() {
        format!("{prefix}/issue-{id}")
    } else {
        format!("{prefix}/issue-{id}-{short_slug}")
    }
}

/// Whether `branch` (after stripping any leading `origin/`) belongs to issue
/// `id`, i.e. contains the literal `/issue-<id>-`.
pub fn branch_belongs_to(branch: &str, id: u64) -> bool {
    let stripped = branch.strip_prefix("origin/").unwrap_or(branch);
    stripped.contains(&format!("/issue-{id}-"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_client_reports_no_dependencies_or_branches() {
        let client = NullForgeClient;
        let token = CancellationToken::new();
        assert!(client.sub_issues(1, &token).await.unwrap().is_empty());
        assert!(client.blocked_by(1, &token).await.unwrap().is_empty());
        assert_eq!(client.branch_state(1, &token).await.unwrap(), BranchState::None);
    }

    #[tokio::test]
    async fn fake_client_filters_to_open_state_only() {
        let mut client = FakeForgeClient::default();
        client.sub_issues.insert(
            1,
            vec![
                RelatedIssue { number: 2, state: "OPEN".to_string() },
                RelatedIssue { number: 3, state: "closed".to_string() },
            ],
        );
        let token = CancellationToken::new();
        let open = client.sub_issues(1, &token).await.unwrap();
        assert_eq!(open, vec![RelatedIssue { number: 2, state: "OPEN".to_string() }]);
    }

    #[tokio::test]
    async fn fake_client_records_posted_comments() {
        let client = FakeForgeClient::default();
        let token = CancellationToken::new();
        client.post_comment(5, "hello", &token).await.unwrap();
        let posted = client.posted_comments.lock().unwrap();
        assert_eq!(posted[0], (5, "hello".to_string()));
    }

    #[tokio::test]
    async fn forge_cache_hits_underlying_client_only_once_per_id() {
        let mut fake = FakeForgeClient::default();
        fake.sub_issues.insert(1, vec![RelatedIssue { number: 2, state: "OPEN".to_string() }]);
        let fake = Arc::new(fake);
        let cache = ForgeCache::new(fake.clone());
        let token = CancellationToken::new();

        let first = cache.cached_sub_issues(1, &token).await.unwrap();
        let second = cache.cached_sub_issues(1, &token).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(*fake.sub_issues_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn with_retry_succeeds_on_first_try_without_sleeping() {
        let token = CancellationToken::new();
        let result: Result<u32, ForgeError> = with_retry(&token, || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn with_retry_exhausts_after_all_transient_failures() {
        let token = CancellationToken::new();
        let result: Result<u32, ForgeError> = with_retry(&token, || async {
            Err(ForgeError::Transient("boom".to_string()))
        })
        .await;
        assert!(matches!(result, Err(ForgeError::RetriesExhausted { attempts: 6, .. })));
    }

    #[tokio::test]
    async fn with_retry_propagates_non_transient_errors_immediately() {
        let token = CancellationToken::new();
        let result: Result<u32, ForgeError> =
            with_retry(&token, || async { Err(ForgeError::Cancelled) }).await;
        assert!(matches!(result, Err(ForgeError::Cancelled)));
    }

    #[tokio::test]
    async fn with_retry_observes_cancellation_before_first_attempt() {
        let token = CancellationToken::new();
        token.cancel();
        let result: Result<u32, ForgeError> = with_retry(&token, || async { Ok(1) }).await;
        assert!(matches!(result, Err(ForgeError::Cancelled)));
    }

    #[test]
    fn branch_prefix_falls_back_to_feature_when_label_is_unusable() {
        assert_eq!(branch_prefix(None), "feature");
        assert_eq!(branch_prefix(Some("!!!")), "feature");
    }

    #[test]
    fn branch_prefix_slugifies_label() {
        assert_eq!(branch_prefix(Some("Bug Fix")), "bug-fix");
        assert_eq!(branch_prefix(Some("--Weird__Label--")), "weird-label");
    }

    #[test]
    fn branch_name_matches_expected_shape() {
        let name = branch_name(Some("Feature"), 42, "Add login flow");
        assert_eq!(name, "feature/issue-42-add-login-flow");
    }

    #[test]
    fn branch_name_without_slugifiable_title_omits_slug() {
        let name = branch_name(Some("Feature"), 42, "!!!");
        assert_eq!(name, "feature/issue-42");
    }

    #[test]
    fn branch_belongs_to_strips_origin_prefix() {
        assert!(branch_belongs_to("origin/feature/issue-42-add-login", 42));
        assert!(branch_belongs_to("feature/issue-42-add-login", 42));
        assert!(!branch_belongs_to("feature/issue-420-add-login", 42));
        assert!(!branch_belongs_to("feature/issue-4-add-login", 42));
    }
}
