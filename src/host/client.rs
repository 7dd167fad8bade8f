//! Octocrab-backed host client scoped to a single repository.
//!
//! All operations target the repository the client was constructed with.
//! Transient failures are retried with exponential backoff before being
//! surfaced to callers.
//!
//! Endpoints octocrab does not model (combined status, branch merges,
//! required status checks) are called through its raw REST methods with
//! local wire types.

use chrono::{DateTime, Utc};
use octocrab::Octocrab;
use serde::{Deserialize, Serialize};

use crate::events::CheckState;
use crate::types::{Branch, CommentId, MergeableState, PrNumber, PullRequest, PullRequestMetadata, RepoId};

use super::error::HostError;
use super::retry::{RetryConfig, retry_with_backoff};
use super::{
    BranchMergeOutcome, CommitStatus, HostClient, IssueComment, RequiredStatusChecks, StatusCheck,
};

/// Page size for paginated list endpoints.
const PAGE_SIZE: usize = 100;

/// A host client backed by octocrab, scoped to a single repository.
#[derive(Clone)]
pub struct OctocrabHost {
    client: Octocrab,
    repo: RepoId,
    retry: RetryConfig,
}

impl OctocrabHost {
    /// Creates a client scoped to the given repository.
    pub fn new(client: Octocrab, repo: RepoId) -> Self {
        Self {
            client,
            repo,
            retry: RetryConfig::DEFAULT,
        }
    }

    /// Creates a client from a personal access token.
    pub fn from_token(token: impl Into<String>, repo: RepoId) -> Result<Self, octocrab::Error> {
        let client = Octocrab::builder().personal_token(token.into()).build()?;
        Ok(Self::new(client, repo))
    }

    /// Overrides the retry configuration.
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Returns the repository this client is scoped to.
    pub fn repo(&self) -> &RepoId {
        &self.repo
    }

    fn route(&self, rest: impl AsRef<str>) -> String {
        format!("/repos/{}/{}{}", self.repo.owner, self.repo.repo, rest.as_ref())
    }
}

impl std::fmt::Debug for OctocrabHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OctocrabHost")
            .field("repo", &self.repo)
            .finish_non_exhaustive()
    }
}

// ─── Wire Types ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct PullRequestWire {
    number: u64,
    title: Option<String>,
    user: Option<UserWire>,
    labels: Option<Vec<LabelWire>>,
    head: RefWire,
    base: RefWire,
    merged: Option<bool>,
    merged_at: Option<DateTime<Utc>>,
    mergeable_state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefWire {
    #[serde(rename = "ref")]
    ref_field: String,
}

#[derive(Debug, Deserialize)]
struct UserWire {
    id: u64,
    login: String,
}

#[derive(Debug, Deserialize)]
struct LabelWire {
    name: String,
}

#[derive(Debug, Deserialize)]
struct CommentWire {
    id: u64,
    user: Option<UserWire>,
    body: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct StatusWire {
    context: String,
    state: String,
}

#[derive(Debug, Deserialize)]
struct CombinedStatusWire {
    state: String,
    statuses: Vec<StatusWire>,
}

#[derive(Debug, Deserialize)]
struct RequiredChecksWire {
    contexts: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct MergeResultWire {
    merged: bool,
    message: Option<String>,
}

impl PullRequestWire {
    fn into_metadata(self) -> PullRequestMetadata {
        let is_merged = self.merged.unwrap_or(false) || self.merged_at.is_some();
        let merge_state = self
            .mergeable_state
            .as_deref()
            .map(parse_mergeable_state)
            .unwrap_or(MergeableState::Unknown);

        PullRequestMetadata {
            pull_request: PullRequest {
                number: PrNumber(self.number),
                source: Branch::new(self.head.ref_field),
                target: Branch::new(self.base.ref_field),
                author: self.user.map(|u| u.login).unwrap_or_default(),
                title: self.title.unwrap_or_default(),
                labels: self
                    .labels
                    .unwrap_or_default()
                    .into_iter()
                    .map(|l| l.name)
                    .collect(),
            },
            is_merged,
            merge_state,
        }
    }
}

/// Parses the host's `mergeable_state` string.
fn parse_mergeable_state(state: &str) -> MergeableState {
    match state {
        "clean" => MergeableState::Clean,
        "behind" => MergeableState::Behind,
        "blocked" => MergeableState::Blocked,
        "unstable" => MergeableState::Unstable,
        "dirty" => MergeableState::Dirty,
        "unknown" => MergeableState::Unknown,
        other => {
            tracing::warn!(state = other, "Unrecognized mergeable_state, treating as unknown");
            MergeableState::Unknown
        }
    }
}

/// Parses a status check state string.
///
/// The host reports `error` as a distinct state; the queue treats it as a
/// failure.
fn parse_check_state(state: &str) -> CheckState {
    match state {
        "pending" => CheckState::Pending,
        "success" => CheckState::Success,
        "failure" | "error" => CheckState::Failure,
        other => {
            tracing::warn!(state = other, "Unrecognized check state, treating as pending");
            CheckState::Pending
        }
    }
}

// ─── HostClient Implementation ────────────────────────────────────────────────

impl HostClient for OctocrabHost {
    async fn fetch_pull_request(&self, number: PrNumber) -> Result<PullRequestMetadata, HostError> {
        let route = self.route(format!("/pulls/{}", number.0));
        let wire: PullRequestWire = retry_with_backoff(self.retry, || async {
            self.client
                .get(&route, None::<&()>)
                .await
                .map_err(HostError::from_octocrab)
        })
        .await?;
        Ok(wire.into_metadata())
    }

    async fn fetch_open_pull_requests(
        &self,
        label: &str,
    ) -> Result<Vec<PullRequestMetadata>, HostError> {
        let mut page = 1u32;
        let mut all = Vec::new();

        loop {
            let route = self.route(format!(
                "/pulls?state=open&per_page={}&page={}",
                PAGE_SIZE, page
            ));
            let items: Vec<PullRequestWire> = retry_with_backoff(self.retry, || async {
                self.client
                    .get(&route, None::<&()>)
                    .await
                    .map_err(HostError::from_octocrab)
            })
            .await?;

            let is_last_page = items.len() < PAGE_SIZE;
            all.extend(
                items
                    .into_iter()
                    .map(PullRequestWire::into_metadata)
                    .filter(|meta| meta.pull_request.has_label(label)),
            );

            if is_last_page {
                break;
            }
            page += 1;
        }

        Ok(all)
    }

    async fn fetch_issue_comments(&self, number: PrNumber) -> Result<Vec<IssueComment>, HostError> {
        let mut page = 1u32;
        let mut all = Vec::new();

        loop {
            let route = self.route(format!(
                "/issues/{}/comments?per_page={}&page={}",
                number.0, PAGE_SIZE, page
            ));
            let items: Vec<CommentWire> = retry_with_backoff(self.retry, || async {
                self.client
                    .get(&route, None::<&()>)
                    .await
                    .map_err(HostError::from_octocrab)
            })
            .await?;

            let is_last_page = items.len() < PAGE_SIZE;
            all.extend(items.into_iter().map(|c| IssueComment {
                id: CommentId(c.id),
                author_id: c.user.map(|u| u.id).unwrap_or(0),
                body: c.body.unwrap_or_default(),
                created_at: c.created_at,
            }));

            if is_last_page {
                break;
            }
            page += 1;
        }

        Ok(all)
    }

    async fn fetch_all_status_checks(&self, branch: &Branch) -> Result<Vec<StatusCheck>, HostError> {
        let route = self.route(format!(
            "/commits/{}/statuses?per_page={}",
            branch.as_str(),
            PAGE_SIZE
        ));
        let items: Vec<StatusWire> = retry_with_backoff(self.retry, || async {
            self.client
                .get(&route, None::<&()>)
                .await
                .map_err(HostError::from_octocrab)
        })
        .await?;

        Ok(items
            .into_iter()
            .map(|s| StatusCheck {
                context: s.context,
                state: parse_check_state(&s.state),
            })
            .collect())
    }

    async fn fetch_commit_status(&self, branch: &Branch) -> Result<CommitStatus, HostError> {
        let route = self.route(format!("/commits/{}/status", branch.as_str()));
        let wire: CombinedStatusWire = retry_with_backoff(self.retry, || async {
            self.client
                .get(&route, None::<&()>)
                .await
                .map_err(HostError::from_octocrab)
        })
        .await?;

        Ok(CommitStatus {
            state: parse_check_state(&wire.state),
            statuses: wire
                .statuses
                .into_iter()
                .map(|s| StatusCheck {
                    context: s.context,
                    state: parse_check_state(&s.state),
                })
                .collect(),
        })
    }

    async fn fetch_required_status_checks(
        &self,
        branch: &Branch,
    ) -> Result<RequiredStatusChecks, HostError> {
        let route = self.route(format!(
            "/branches/{}/protection/required_status_checks",
            branch.as_str()
        ));
        let wire: RequiredChecksWire = retry_with_backoff(self.retry, || async {
            self.client
                .get(&route, None::<&()>)
                .await
                .map_err(HostError::from_octocrab)
        })
        .await?;

        Ok(RequiredStatusChecks {
            contexts: wire.contexts,
        })
    }

    async fn post_comment(&self, number: PrNumber, body: &str) -> Result<(), HostError> {
        retry_with_backoff(self.retry, || async {
            self.client
                .issues(self.repo.owner.as_str(), self.repo.repo.as_str())
                .create_comment(number.0, body)
                .await
                .map(|_| ())
                .map_err(HostError::from_octocrab)
        })
        .await
    }

    async fn remove_label(&self, number: PrNumber, label: &str) -> Result<(), HostError> {
        let route = self.route(format!("/issues/{}/labels/{}", number.0, label));
        retry_with_backoff(self.retry, || async {
            self.client
                .delete::<Vec<LabelWire>, _, ()>(&route, None)
                .await
                .map(|_| ())
                .map_err(HostError::from_octocrab)
        })
        .await
    }

    async fn merge_pull_request(&self, number: PrNumber) -> Result<(), HostError> {
        let route = self.route(format!("/pulls/{}/merge", number.0));

        #[derive(Serialize)]
        struct MergeRequest {
            merge_method: &'static str,
        }

        let result: MergeResultWire = retry_with_backoff(self.retry, || async {
            self.client
                .put(
                    &route,
                    Some(&MergeRequest {
                        merge_method: "merge",
                    }),
                )
                .await
                .map_err(HostError::from_octocrab)
        })
        .await?;

        if result.merged {
            Ok(())
        } else {
            Err(HostError::permanent(format!(
                "merge request returned merged=false: {}",
                result.message.as_deref().unwrap_or("unknown reason")
            )))
        }
    }

    async fn merge_into_branch(
        &self,
        base: &Branch,
        head: &Branch,
    ) -> Result<BranchMergeOutcome, HostError> {
        let route = self.route("/merges");

        #[derive(Serialize)]
        struct BranchMergeRequest<'a> {
            base: &'a str,
            head: &'a str,
        }

        let body = BranchMergeRequest {
            base: base.as_str(),
            head: head.as_str(),
        };

        // The merges endpoint distinguishes its outcomes by status code
        // (201 merged, 204 already up to date, 409 conflict), so it goes
        // through the raw request path instead of the deserializing one.
        retry_with_backoff(self.retry, || async {
            match self.client._post(route.as_str(), Some(&body)).await {
                Ok(response) => match response.status().as_u16() {
                    201 => Ok(BranchMergeOutcome::Success),
                    204 => Ok(BranchMergeOutcome::UpToDate),
                    409 => Ok(BranchMergeOutcome::Conflict),
                    status => Err(HostError::from_status(
                        status,
                        format!("unexpected response merging {} into {}", head, base),
                    )),
                },
                Err(err) => {
                    let err = HostError::from_octocrab(err);
                    if err.status_code == Some(409) {
                        Ok(BranchMergeOutcome::Conflict)
                    } else {
                        Err(err)
                    }
                }
            }
        })
        .await
    }

    async fn delete_branch(&self, branch: &Branch) -> Result<(), HostError> {
        let route = self.route(format!("/git/refs/heads/{}", branch.as_str()));
        retry_with_backoff(self.retry, || async {
            let response = self
                .client
                ._delete(route.as_str(), None::<&()>)
                .await
                .map_err(HostError::from_octocrab)?;
            if response.status().is_success() {
                Ok(())
            } else {
                Err(HostError::from_status(
                    response.status().as_u16(),
                    format!("failed to delete branch {}", branch),
                ))
            }
        })
        .await
    }
}
