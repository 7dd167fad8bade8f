//! Shared test utilities: builders, arbitrary generators, and a mock host
//! client with programmable responses and recorded calls.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use proptest::prelude::*;

use crate::host::{
    BranchMergeOutcome, CommitStatus, HostClient, HostError, IssueComment, RequiredStatusChecks,
    StatusCheck,
};
use crate::types::{
    Branch, CommentId, MergeableState, PrNumber, PullRequest, PullRequestMetadata,
};

// ─── Builders ─────────────────────────────────────────────────────────────────

/// Builds a pull request snapshot.
pub fn pr(number: u64, source: &str, target: &str, labels: &[&str]) -> PullRequest {
    PullRequest {
        number: PrNumber(number),
        source: Branch::from(source),
        target: Branch::from(target),
        author: format!("author-{number}"),
        title: format!("Pull request {number}"),
        labels: labels.iter().map(|l| l.to_string()).collect(),
    }
}

/// Wraps a pull request in metadata with the given merge state.
pub fn meta(pull_request: PullRequest, merge_state: MergeableState) -> PullRequestMetadata {
    PullRequestMetadata {
        pull_request,
        is_merged: false,
        merge_state,
    }
}

/// Builds an issue comment.
pub fn comment(id: u64, author_id: u64, body: &str, created_at: DateTime<Utc>) -> IssueComment {
    IssueComment {
        id: CommentId(id),
        author_id,
        body: body.to_string(),
        created_at,
    }
}

// ─── Arbitrary Generators ─────────────────────────────────────────────────────

pub fn arb_branch_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9/-]{0,30}".prop_map(String::from)
}

pub fn arb_mergeable_state() -> impl Strategy<Value = MergeableState> {
    prop_oneof![
        Just(MergeableState::Clean),
        Just(MergeableState::Behind),
        Just(MergeableState::Blocked),
        Just(MergeableState::Unstable),
        Just(MergeableState::Dirty),
        Just(MergeableState::Unknown),
    ]
}

pub fn arb_pull_request() -> impl Strategy<Value = PullRequest> {
    (
        1u64..100_000,
        arb_branch_name(),
        arb_branch_name(),
        "[a-z]{3,12}",
        ".{0,40}",
        prop::collection::vec("[a-z-]{1,15}", 0..4),
    )
        .prop_map(|(number, source, target, author, title, labels)| PullRequest {
            number: PrNumber(number),
            source: Branch::new(source),
            target: Branch::new(target),
            author,
            title,
            labels,
        })
}

pub fn arb_metadata() -> impl Strategy<Value = PullRequestMetadata> {
    (arb_pull_request(), any::<bool>(), arb_mergeable_state()).prop_map(
        |(pull_request, is_merged, merge_state)| PullRequestMetadata {
            pull_request,
            is_merged,
            merge_state,
        },
    )
}

// ─── Mock Host ────────────────────────────────────────────────────────────────

/// A mock host client with programmable responses and call recording.
///
/// Programmed pull request responses form a queue per PR number: each fetch
/// consumes one response, and the last one sticks. This lets tests model a
/// PR whose merge state changes across re-fetches.
#[derive(Clone, Default)]
pub struct MockHost {
    inner: Arc<MockHostInner>,
}

#[derive(Default)]
struct MockHostInner {
    pull_requests: Mutex<HashMap<PrNumber, VecDeque<PullRequestMetadata>>>,
    open_pull_requests: Mutex<Vec<PullRequestMetadata>>,
    issue_comments: Mutex<HashMap<PrNumber, Vec<IssueComment>>>,
    status_checks: Mutex<HashMap<Branch, Vec<StatusCheck>>>,
    commit_statuses: Mutex<HashMap<Branch, VecDeque<CommitStatus>>>,
    required_checks: Mutex<HashMap<Branch, RequiredStatusChecks>>,
    branch_merge_outcomes: Mutex<HashMap<Branch, BranchMergeOutcome>>,
    failing_merges: Mutex<HashSet<PrNumber>>,
    fail_comments: Mutex<bool>,
    fail_label_removal: Mutex<bool>,

    posted_comments: Mutex<Vec<(PrNumber, String)>>,
    removed_labels: Mutex<Vec<(PrNumber, String)>>,
    merged_pull_requests: Mutex<Vec<PrNumber>>,
    deleted_branches: Mutex<Vec<Branch>>,
    branch_merges: Mutex<Vec<(Branch, Branch)>>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Programming ──

    /// Queues a fetch response for a PR. The last queued response repeats.
    pub fn set_pull_request(&self, metadata: PullRequestMetadata) {
        self.inner
            .pull_requests
            .lock()
            .unwrap()
            .entry(metadata.number())
            .or_default()
            .push_back(metadata);
    }

    pub fn set_open_pull_requests(&self, prs: Vec<PullRequestMetadata>) {
        *self.inner.open_pull_requests.lock().unwrap() = prs;
    }

    pub fn set_issue_comments(&self, number: PrNumber, comments: Vec<IssueComment>) {
        self.inner
            .issue_comments
            .lock()
            .unwrap()
            .insert(number, comments);
    }

    pub fn set_status_checks(&self, branch: Branch, checks: Vec<StatusCheck>) {
        self.inner
            .status_checks
            .lock()
            .unwrap()
            .insert(branch, checks);
    }

    /// Queues a commit status for a branch. The last queued status repeats.
    pub fn set_commit_status(&self, branch: Branch, status: CommitStatus) {
        self.inner
            .commit_statuses
            .lock()
            .unwrap()
            .entry(branch)
            .or_default()
            .push_back(status);
    }

    pub fn set_required_checks(&self, branch: Branch, contexts: Vec<&str>) {
        self.inner.required_checks.lock().unwrap().insert(
            branch,
            RequiredStatusChecks {
                contexts: contexts.iter().map(|c| c.to_string()).collect(),
            },
        );
    }

    pub fn set_branch_merge_outcome(&self, base: Branch, outcome: BranchMergeOutcome) {
        self.inner
            .branch_merge_outcomes
            .lock()
            .unwrap()
            .insert(base, outcome);
    }

    pub fn fail_merge(&self, number: PrNumber) {
        self.inner.failing_merges.lock().unwrap().insert(number);
    }

    pub fn fail_comments(&self) {
        *self.inner.fail_comments.lock().unwrap() = true;
    }

    pub fn fail_label_removal(&self) {
        *self.inner.fail_label_removal.lock().unwrap() = true;
    }

    // ── Recorded calls ──

    pub fn posted_comments(&self) -> Vec<(PrNumber, String)> {
        self.inner.posted_comments.lock().unwrap().clone()
    }

    pub fn removed_labels(&self) -> Vec<(PrNumber, String)> {
        self.inner.removed_labels.lock().unwrap().clone()
    }

    pub fn merged_pull_requests(&self) -> Vec<PrNumber> {
        self.inner.merged_pull_requests.lock().unwrap().clone()
    }

    pub fn deleted_branches(&self) -> Vec<Branch> {
        self.inner.deleted_branches.lock().unwrap().clone()
    }

    /// Recorded `(base, head)` branch merges.
    pub fn branch_merges(&self) -> Vec<(Branch, Branch)> {
        self.inner.branch_merges.lock().unwrap().clone()
    }
}

impl HostClient for MockHost {
    async fn fetch_pull_request(&self, number: PrNumber) -> Result<PullRequestMetadata, HostError> {
        let mut responses = self.inner.pull_requests.lock().unwrap();
        match responses.get_mut(&number) {
            Some(queue) if queue.len() > 1 => Ok(queue.pop_front().unwrap()),
            Some(queue) if !queue.is_empty() => Ok(queue.front().unwrap().clone()),
            _ => Err(HostError::permanent(format!(
                "no programmed response for PR {number}"
            ))),
        }
    }

    async fn fetch_open_pull_requests(
        &self,
        label: &str,
    ) -> Result<Vec<PullRequestMetadata>, HostError> {
        Ok(self
            .inner
            .open_pull_requests
            .lock()
            .unwrap()
            .iter()
            .filter(|meta| meta.pull_request.has_label(label))
            .cloned()
            .collect())
    }

    async fn fetch_issue_comments(&self, number: PrNumber) -> Result<Vec<IssueComment>, HostError> {
        Ok(self
            .inner
            .issue_comments
            .lock()
            .unwrap()
            .get(&number)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_all_status_checks(
        &self,
        branch: &Branch,
    ) -> Result<Vec<StatusCheck>, HostError> {
        Ok(self
            .inner
            .status_checks
            .lock()
            .unwrap()
            .get(branch)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_commit_status(&self, branch: &Branch) -> Result<CommitStatus, HostError> {
        let mut statuses = self.inner.commit_statuses.lock().unwrap();
        match statuses.get_mut(branch) {
            Some(queue) if queue.len() > 1 => Ok(queue.pop_front().unwrap()),
            Some(queue) if !queue.is_empty() => Ok(queue.front().unwrap().clone()),
            _ => Err(HostError::permanent(format!(
                "no programmed commit status for branch {branch}"
            ))),
        }
    }

    async fn fetch_required_status_checks(
        &self,
        branch: &Branch,
    ) -> Result<RequiredStatusChecks, HostError> {
        Ok(self
            .inner
            .required_checks
            .lock()
            .unwrap()
            .get(branch)
            .cloned()
            .unwrap_or(RequiredStatusChecks { contexts: vec![] }))
    }

    async fn post_comment(&self, number: PrNumber, body: &str) -> Result<(), HostError> {
        if *self.inner.fail_comments.lock().unwrap() {
            return Err(HostError::transient("comment rejected"));
        }
        self.inner
            .posted_comments
            .lock()
            .unwrap()
            .push((number, body.to_string()));
        Ok(())
    }

    async fn remove_label(&self, number: PrNumber, label: &str) -> Result<(), HostError> {
        if *self.inner.fail_label_removal.lock().unwrap() {
            return Err(HostError::transient("label removal rejected"));
        }
        self.inner
            .removed_labels
            .lock()
            .unwrap()
            .push((number, label.to_string()));
        Ok(())
    }

    async fn merge_pull_request(&self, number: PrNumber) -> Result<(), HostError> {
        if self.inner.failing_merges.lock().unwrap().contains(&number) {
            return Err(HostError::permanent(format!("merge of {number} rejected")));
        }
        self.inner.merged_pull_requests.lock().unwrap().push(number);
        Ok(())
    }

    async fn merge_into_branch(
        &self,
        base: &Branch,
        head: &Branch,
    ) -> Result<BranchMergeOutcome, HostError> {
        self.inner
            .branch_merges
            .lock()
            .unwrap()
            .push((base.clone(), head.clone()));
        Ok(self
            .inner
            .branch_merge_outcomes
            .lock()
            .unwrap()
            .get(base)
            .copied()
            .unwrap_or(BranchMergeOutcome::UpToDate))
    }

    async fn delete_branch(&self, branch: &Branch) -> Result<(), HostError> {
        self.inner
            .deleted_branches
            .lock()
            .unwrap()
            .push(branch.clone());
        Ok(())
    }
}
