//! Shared machinery of merge jobs.
//!
//! Both the single-MR job and the batch job are driven through [`MergeJob`]:
//! mergeability gates, the fuse-and-push sequence, trailer tagging, CI and
//! merge-status polling, and reapproval. `merge_status` and approvals are
//! eventually consistent on the server, which is why every gate starts from
//! a refetch.

use std::collections::HashSet;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};

use crate::api::Api;
use crate::approvals::Approvals;
use crate::branch::Branch;
use crate::git::{GitError, Repo};
use crate::interval::IntervalUnion;
use crate::merge_request::{MergeRequest, RebaseError};
use crate::pipeline::Pipeline;
use crate::project::Project;
use crate::user::User;

const CI_POLL_CADENCE: Duration = Duration::from_secs(10);
const MERGE_STATUS_ATTEMPTS: u32 = 3;
const MERGE_STATUS_CADENCE: Duration = Duration::from_secs(5);
const APPROVAL_POLL_CADENCE: Duration = Duration::from_secs(5);

/// How the source branch is brought up to date with the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fusion {
    Merge,
    Rebase,
    GitlabRebase,
}

#[derive(Debug, Clone)]
pub struct MergeJobOptions {
    pub add_tested: bool,
    pub add_part_of: bool,
    pub add_reviewers: bool,
    pub reapprove: bool,
    pub approval_timeout: Duration,
    pub embargo: IntervalUnion,
    pub ci_timeout: Duration,
    pub fusion: Fusion,
    pub use_no_ff_batches: bool,
    pub use_merge_commit_batches: bool,
    pub skip_ci_batches: bool,
    pub guarantee_final_pipeline: bool,
}

impl Default for MergeJobOptions {
    fn default() -> Self {
        Self {
            add_tested: false,
            add_part_of: false,
            add_reviewers: false,
            reapprove: false,
            approval_timeout: Duration::ZERO,
            embargo: IntervalUnion::empty(),
            ci_timeout: Duration::from_secs(15 * 60),
            fusion: Fusion::Rebase,
            use_no_ff_batches: false,
            use_merge_commit_batches: false,
            skip_ci_batches: false,
            guarantee_final_pipeline: false,
        }
    }
}

impl MergeJobOptions {
    pub fn requests_commit_tagging(&self) -> bool {
        self.add_tested || self.add_part_of || self.add_reviewers
    }

    /// Reapproval and reviewer lookups impersonate other users, which only
    /// works with an admin token; refuse the combination up front.
    pub fn validate_for(&self, user: &User) -> Result<()> {
        if !user.is_admin() {
            if self.reapprove {
                bail!(
                    "{} is not an admin, can't impersonate approvers for reapproval",
                    user.username()?
                );
            }
            if self.add_reviewers {
                bail!(
                    "{} is not an admin, can't look up reviewer e-mail addresses",
                    user.username()?
                );
            }
        }
        Ok(())
    }
}

/// Job-boundary outcome. `CannotMerge` is commented on the merge request;
/// `SkipMerge` defers silently. Everything else propagates to the sweep.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("{0}")]
    CannotMerge(String),
    #[error("{0}")]
    SkipMerge(String),
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub(crate) fn cannot_merge(reason: impl Into<String>) -> JobError {
    JobError::CannotMerge(reason.into())
}

pub(crate) fn skip_merge(reason: impl Into<String>) -> JobError {
    JobError::SkipMerge(reason.into())
}

/// Poll `probe` at `cadence` until it yields a value, fails, or `budget`
/// runs out (`Ok(None)`). The probe always runs at least once.
pub(crate) fn poll_until<T, E>(
    cadence: Duration,
    budget: Duration,
    mut probe: impl FnMut() -> Result<Option<T>, E>,
) -> Result<Option<T>, E> {
    let deadline = Instant::now() + budget;
    loop {
        if let Some(value) = probe()? {
            return Ok(Some(value));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(cadence);
    }
}

/// Result of bringing a source branch up to date with its target.
#[derive(Debug, Clone)]
pub struct Fused {
    /// Tip of `origin/<target>` the update ran against.
    pub target_sha: String,
    /// Head right after the fuse, before any trailer rewriting.
    pub updated_sha: String,
    /// Head after trailer rewriting; what must end up merged.
    pub final_sha: String,
}

pub struct MergeJob<'a> {
    api: &'a Api,
    user: &'a User,
    project: &'a Project,
    repo: &'a Repo,
    options: &'a MergeJobOptions,
}

impl<'a> MergeJob<'a> {
    pub fn new(
        api: &'a Api,
        user: &'a User,
        project: &'a Project,
        repo: &'a Repo,
        options: &'a MergeJobOptions,
    ) -> MergeJob<'a> {
        MergeJob {
            api,
            user,
            project,
            repo,
            options,
        }
    }

    pub fn api(&self) -> &Api {
        self.api
    }

    pub fn user(&self) -> &User {
        self.user
    }

    pub fn project(&self) -> &Project {
        self.project
    }

    pub fn repo(&self) -> &Repo {
        self.repo
    }

    pub fn options(&self) -> &MergeJobOptions {
        self.options
    }

    /// Refetch and run every merge precondition.
    pub fn ensure_mergeable_mr(&self, merge_request: &mut MergeRequest) -> Result<(), JobError> {
        merge_request.refetch_info()?;
        info!(iid = merge_request.iid().ok(), "ensuring the merge request is mergeable");

        if merge_request.work_in_progress() {
            return Err(cannot_merge(
                "Sorry, I can't merge requests marked as drafts!",
            ));
        }

        if merge_request.squash() && self.options.requests_commit_tagging() {
            return Err(cannot_merge(
                "Sorry, merging requests marked for auto-squash would ruin my commit tagging!",
            ));
        }

        let approvals = merge_request.fetch_approvals()?;
        if !approvals.sufficient() {
            return Err(cannot_merge(format!(
                "Insufficient approvals (have: {:?} missing: {})",
                approvals.approver_usernames(),
                approvals.approvals_left()
            )));
        }

        if !merge_request.blocking_discussions_resolved() {
            return Err(cannot_merge(
                "Sorry, I can't merge requests which have unresolved discussions!",
            ));
        }

        let state = merge_request.state()?;
        match state.as_str() {
            "opened" | "reopened" | "locked" => {}
            "merged" | "closed" => {
                return Err(skip_merge(format!("The merge request is already {state}!")));
            }
            other => {
                return Err(cannot_merge(format!(
                    "The merge request is in an unknown state: {other}"
                )));
            }
        }

        if self.during_merge_embargo() {
            return Err(skip_merge("Merge embargo!"));
        }

        if !merge_request.assignee_ids().contains(&self.user.id()?) {
            return Err(skip_merge("It is not assigned to me anymore!"));
        }

        Ok(())
    }

    pub fn during_merge_embargo(&self) -> bool {
        self.options.embargo.covers(Utc::now().naive_utc())
    }

    /// Resolve the project the source branch lives in. For a cross-fork
    /// merge request, the fork is registered and fetched as the `source`
    /// remote and its URL is returned.
    pub fn fetch_source_project(
        &self,
        merge_request: &MergeRequest,
    ) -> Result<(Project, Option<String>), JobError> {
        if merge_request.source_project_id()? == self.project.id()? {
            return Ok((self.project.clone(), None));
        }
        let source_project = Project::fetch_by_id(merge_request.source_project_id()?, self.api)?;
        let remote_url = source_project.ssh_url_to_repo()?;
        self.repo.fetch_from_url("source", &remote_url)?;
        Ok((source_project, Some(remote_url)))
    }

    /// Apply the configured fusion strategy. A platform-side rebase is still
    /// rebased locally first, to know the sha we expect to see remotely.
    pub fn fuse(
        &self,
        source: &str,
        target: &str,
        source_repo_url: Option<&str>,
        local: bool,
    ) -> Result<String, GitError> {
        match self.options.fusion {
            Fusion::Merge => self.repo.merge(source, target, &[], source_repo_url, local),
            Fusion::Rebase | Fusion::GitlabRebase => {
                self.repo.rebase(source, target, source_repo_url, local)
            }
        }
    }

    /// Update `source_branch` onto the fresh target tip, tag trailers, and
    /// synchronize the result back to the merge request (force-push, or the
    /// platform rebase for [`Fusion::GitlabRebase`]).
    pub fn update_from_target_branch_and_push(
        &self,
        merge_request: &mut MergeRequest,
        source_repo_url: Option<&str>,
        skip_ci: bool,
    ) -> Result<Fused, JobError> {
        let source_branch = merge_request.source_branch()?;
        let target_branch = merge_request.target_branch()?;
        if source_repo_url.is_none() && source_branch == target_branch {
            return Err(cannot_merge("source and target branch seem to coincide!"));
        }

        let mut branch_update_done = false;
        let mut commits_rewrite_done = false;
        let outcome = self.update_and_push_inner(
            merge_request,
            source_repo_url,
            skip_ci,
            &mut branch_update_done,
            &mut commits_rewrite_done,
        );
        match outcome {
            Err(JobError::Git(err)) => {
                // Drop the local source branch so the next job starts from a
                // clean checkout instead of whatever the failure left behind.
                let default_branch = self.project.default_branch()?;
                if source_branch != default_branch {
                    let _ = self
                        .repo
                        .checkout_branch(&default_branch, Some(&format!("origin/{default_branch}")));
                    let _ = self.repo.remove_branch(&source_branch);
                }
                if !branch_update_done {
                    return Err(cannot_merge("got conflicts while rebasing, your problem now..."));
                }
                if !commits_rewrite_done {
                    return Err(cannot_merge("failed on commit rewriting; check my logs!"));
                }
                Err(JobError::Git(err))
            }
            other => other,
        }
    }

    fn update_and_push_inner(
        &self,
        merge_request: &mut MergeRequest,
        source_repo_url: Option<&str>,
        skip_ci: bool,
        branch_update_done: &mut bool,
        commits_rewrite_done: &mut bool,
    ) -> Result<Fused, JobError> {
        let source_branch = merge_request.source_branch()?;
        let target_branch = merge_request.target_branch()?;
        let initial_mr_sha = merge_request.sha()?;

        let updated_sha = self.fuse(&source_branch, &target_branch, source_repo_url, false)?;
        *branch_update_done = true;

        // The fuse just refetched origin, so the remote target tip is fresh.
        let target_sha = self.repo.get_commit_hash(&format!("origin/{target_branch}"))?;
        if updated_sha == target_sha {
            return Err(cannot_merge(format!(
                "these changes already exist in branch `{target_branch}`"
            )));
        }

        let final_sha = self
            .add_trailers(merge_request)?
            .unwrap_or_else(|| updated_sha.clone());
        *commits_rewrite_done = true;

        let branch_was_modified = final_sha != initial_mr_sha;
        self.synchronize_mr_with_local_changes(
            merge_request,
            branch_was_modified,
            &final_sha,
            source_repo_url,
            skip_ci,
        )?;
        Ok(Fused {
            target_sha,
            updated_sha,
            final_sha,
        })
    }

    /// Tag the configured trailers onto the commits the merge request adds.
    /// Returns the head after the last rewrite, `None` when nothing was
    /// tagged.
    pub fn add_trailers(&self, merge_request: &MergeRequest) -> Result<Option<String>, JobError> {
        let source_branch = merge_request.source_branch()?;
        let target_origin = format!("origin/{}", merge_request.target_branch()?);
        let mut sha = None;

        let should_add_reviewers =
            self.options.add_reviewers && self.options.fusion != Fusion::GitlabRebase;
        if should_add_reviewers {
            let reviewers = self.reviewer_names_and_emails(merge_request)?;
            sha = Some(self.repo.tag_with_trailer(
                "Reviewed-by",
                &reviewers,
                &source_branch,
                &target_origin,
            )?);
        }

        // Tested-by goes on the head commit only: that is the tree that
        // actually ran CI, and a rebase keeps it the head.
        let should_add_tested = self.options.add_tested
            && self.project.only_allow_merge_if_pipeline_succeeds()?
            && self.options.fusion == Fusion::Rebase;
        if should_add_tested {
            let tested_by = vec![format!(
                "{} <{}>",
                self.user.name()?,
                merge_request.web_url()?
            )];
            sha = Some(self.repo.tag_with_trailer(
                "Tested-by",
                &tested_by,
                &source_branch,
                &format!("{source_branch}^"),
            )?);
        }

        let should_add_part_of =
            self.options.add_part_of && self.options.fusion != Fusion::GitlabRebase;
        if should_add_part_of {
            let part_of = vec![format!("<{}>", merge_request.web_url()?)];
            sha = Some(self.repo.tag_with_trailer(
                "Part-of",
                &part_of,
                &source_branch,
                &target_origin,
            )?);
        }

        Ok(sha)
    }

    /// `"Name <email>"` for each approver. Fails when the only approver also
    /// authored commits under review.
    fn reviewer_names_and_emails(
        &self,
        merge_request: &MergeRequest,
    ) -> Result<Vec<String>, JobError> {
        let commits = merge_request.fetch_commits()?;
        let approvals = merge_request.fetch_approvals()?;
        let reviewers = approvals
            .approver_ids()
            .iter()
            .map(|uid| User::fetch_by_id(*uid, self.api))
            .collect::<Result<Vec<User>>>()?;

        let author_emails: HashSet<String> = commits
            .iter()
            .filter_map(|commit| commit.get("author_email").and_then(Value::as_str))
            .map(str::to_string)
            .collect();
        let reviewer_emails: HashSet<String> =
            reviewers.iter().filter_map(User::email).collect();
        let self_reviewed = author_emails.intersection(&reviewer_emails).next().is_some();
        if self_reviewed && reviewers.len() <= 1 {
            return Err(cannot_merge(
                "Commits require at least one independent reviewer.",
            ));
        }

        let lines = reviewers
            .iter()
            .map(|reviewer| {
                Ok(format!(
                    "{} <{}>",
                    reviewer.name()?,
                    reviewer
                        .email()
                        .context("approver e-mail is not visible; is the bot an admin?")?
                ))
            })
            .collect::<Result<Vec<String>>>()?;
        Ok(lines)
    }

    fn synchronize_mr_with_local_changes(
        &self,
        merge_request: &mut MergeRequest,
        branch_was_modified: bool,
        expected_sha: &str,
        source_repo_url: Option<&str>,
        skip_ci: bool,
    ) -> Result<(), JobError> {
        if self.options.fusion == Fusion::GitlabRebase {
            self.synchronize_using_gitlab_rebase(merge_request, expected_sha)
        } else {
            self.push_force_to_mr(merge_request, branch_was_modified, source_repo_url, skip_ci)
        }
    }

    pub fn push_force_to_mr(
        &self,
        merge_request: &MergeRequest,
        branch_was_modified: bool,
        source_repo_url: Option<&str>,
        skip_ci: bool,
    ) -> Result<(), JobError> {
        let source_branch = merge_request.source_branch()?;
        if let Err(err) = self.repo.push(&source_branch, source_repo_url, true, skip_ci) {
            warn!(error = %err, "failed to push the updated source branch");
            if branch_was_modified {
                let branch = Branch::fetch_by_name(
                    merge_request.source_project_id()?,
                    &source_branch,
                    self.api,
                )?;
                if branch.protected() {
                    return Err(cannot_merge("Sorry, I can't modify protected branches!"));
                }
            }
            let change_type = if self.options.fusion == Fusion::Merge {
                "merged"
            } else {
                "rebased"
            };
            return Err(cannot_merge(format!(
                "Failed to push {change_type} changes, check my logs!"
            )));
        }
        Ok(())
    }

    /// Hand the rebase to the platform and assert the remote ended up at the
    /// sha we computed locally; a mismatch means a concurrent actor moved
    /// the branch and the result must not be merged.
    pub fn synchronize_using_gitlab_rebase(
        &self,
        merge_request: &mut MergeRequest,
        expected_sha: &str,
    ) -> Result<(), JobError> {
        match merge_request.rebase() {
            Ok(()) => {}
            Err(RebaseError::Failed(message)) => {
                return Err(cannot_merge(format!(
                    "GitLab failed to rebase the branch saying: {message}"
                )));
            }
            Err(RebaseError::Timeout) => {
                return Err(cannot_merge(
                    "GitLab was taking too long to rebase the branch...",
                ));
            }
            Err(RebaseError::Api(err)) => {
                let branch = Branch::fetch_by_name(
                    merge_request.source_project_id()?,
                    &merge_request.source_branch()?,
                    self.api,
                )?;
                if branch.protected() {
                    return Err(cannot_merge("Sorry, I can't modify protected branches!"));
                }
                return Err(JobError::Other(err.into()));
            }
            Err(RebaseError::Other(err)) => return Err(JobError::Other(err)),
        }

        let remote_sha = merge_request.sha()?;
        if remote_sha != expected_sha {
            return Err(cannot_merge(format!(
                "GitLab rebase ended up with a different commit: \
                 I expected {expected_sha} but they got {remote_sha}"
            )));
        }
        Ok(())
    }

    fn mr_pipelines(&self, merge_request: &MergeRequest) -> Result<Vec<Pipeline>, JobError> {
        let pipelines = if self.api.version()?.has_mr_pipelines() {
            Pipeline::pipelines_by_merge_request(
                merge_request.target_project_id()?,
                merge_request.iid()?,
                self.api,
            )?
        } else {
            Pipeline::pipelines_by_branch(
                merge_request.source_project_id()?,
                &merge_request.source_branch()?,
                self.api,
            )?
        };
        Ok(pipelines)
    }

    /// Wait for a pipeline on `commit_sha` of this merge request to pass.
    pub fn wait_for_ci_to_pass(
        &self,
        merge_request: &MergeRequest,
        commit_sha: &str,
    ) -> Result<(), JobError> {
        info!(iid = merge_request.iid().ok(), sha = commit_sha, "waiting for CI");
        self.wait_for_ci(commit_sha, || self.mr_pipelines(merge_request))
    }

    /// CI gate over whatever pipeline listing `fetch_pipelines` provides.
    pub fn wait_for_ci(
        &self,
        commit_sha: &str,
        mut fetch_pipelines: impl FnMut() -> Result<Vec<Pipeline>, JobError>,
    ) -> Result<(), JobError> {
        let mut last_message = "No pipeline associated.".to_string();
        let passed = poll_until(CI_POLL_CADENCE, self.options.ci_timeout, || {
            let pipelines = fetch_pipelines()?;
            let (status, message) = status_for_sha(&pipelines, commit_sha)?;
            last_message = message;
            match status.as_deref() {
                Some("success") => {
                    info!(sha = commit_sha, "CI passed. {last_message}");
                    Ok(Some(()))
                }
                Some("skipped") => {
                    info!(sha = commit_sha, "CI skipped. {last_message}");
                    Ok(Some(()))
                }
                Some("failed") => Err(cannot_merge(format!("CI failed! {last_message}"))),
                Some("canceled") => {
                    Err(cannot_merge(format!("Someone canceled the CI. {last_message}")))
                }
                None | Some("pending") | Some("running") => Ok(None),
                Some(status) => {
                    warn!(status, "suspicious CI status. {last_message}");
                    Ok(None)
                }
            }
        })?;
        if passed.is_none() {
            return Err(cannot_merge(format!("CI is taking too long. {last_message}")));
        }
        Ok(())
    }

    /// `merge_status` is computed asynchronously; give the server a few
    /// chances to resolve it. A lingering `unchecked` proceeds
    /// optimistically, since the accept call re-validates anyway.
    pub fn wait_for_merge_status_to_resolve(
        &self,
        merge_request: &mut MergeRequest,
    ) -> Result<(), JobError> {
        for attempt in 0..MERGE_STATUS_ATTEMPTS {
            merge_request.refetch_info()?;
            match merge_request.merge_status()?.as_str() {
                "can_be_merged" => {
                    info!(attempt, "merge status resolved to can_be_merged");
                    return Ok(());
                }
                "cannot_be_merged" => {
                    return Err(cannot_merge(
                        "GitLab believes this merge request cannot be merged.",
                    ));
                }
                status => {
                    info!(attempt, status, "merge status not resolved yet");
                }
            }
            if attempt + 1 < MERGE_STATUS_ATTEMPTS {
                thread::sleep(MERGE_STATUS_CADENCE);
            }
        }
        Ok(())
    }

    /// Re-instate approvals the force-push may have dropped. Waits for the
    /// reset to actually land first; approving is not idempotent.
    pub fn maybe_reapprove(
        &self,
        merge_request: &MergeRequest,
        approvals: &Approvals,
    ) -> Result<(), JobError> {
        if !self.options.reapprove {
            return Ok(());
        }
        info!("checking if approvals have reset");
        let reset = poll_until(APPROVAL_POLL_CADENCE, self.options.approval_timeout, || {
            let current = merge_request.fetch_approvals()?;
            Ok::<_, JobError>((!current.sufficient()).then_some(()))
        })?;
        if reset.is_some() {
            approvals.reapprove()?;
        }
        Ok(())
    }

    /// Hand the merge request back: to its author when that is somebody
    /// else, otherwise clear the assignee.
    pub fn unassign_from_mr(&self, merge_request: &MergeRequest) -> Result<()> {
        info!(iid = merge_request.iid().ok(), "unassigning");
        let author_id = merge_request.author_id()?;
        if author_id != self.user.id()? {
            merge_request.assign_to(author_id)?;
        } else {
            merge_request.unassign()?;
        }
        Ok(())
    }
}

/// Status and a human-readable pointer for the pipeline matching `sha`.
pub(crate) fn status_for_sha(
    pipelines: &[Pipeline],
    sha: &str,
) -> Result<(Option<String>, String)> {
    for pipeline in pipelines {
        if pipeline.sha()? == sha {
            return Ok((
                Some(pipeline.status()?),
                format!("See pipeline {}.", pipeline.web_url()?),
            ));
        }
    }
    warn!(sha, "no pipeline listed for commit");
    Ok((None, "No pipeline associated.".to_string()))
}
