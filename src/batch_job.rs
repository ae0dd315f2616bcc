//! Speculative batch merging.
//!
//! Candidates that pass the single-MR gates are stacked onto one
//! integration branch so a single pipeline covers the cumulative result;
//! the merge requests are then accepted in stacking order, each pinned to
//! its own integration tip. Anything that breaks the stack abandons the
//! batch (`CannotBatch`) and the supervisor falls back to the single-MR
//! job; the optimization is strictly optional.

use anyhow::Result;
use tracing::{info, warn};

use crate::api::Api;
use crate::branch::Branch;
use crate::git::{GitError, Repo};
use crate::job::{JobError, MergeJob, MergeJobOptions, cannot_merge};
use crate::merge_request::MergeRequest;
use crate::pipeline::Pipeline;
use crate::project::Project;
use crate::user::User;

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    /// The batch as a whole is off; fall back to single-MR processing.
    #[error("cannot batch: {0}")]
    CannotBatch(String),
    #[error(transparent)]
    Job(#[from] JobError),
}

impl From<anyhow::Error> for BatchError {
    fn from(err: anyhow::Error) -> Self {
        BatchError::Job(JobError::Other(err))
    }
}

impl From<GitError> for BatchError {
    fn from(err: GitError) -> Self {
        BatchError::Job(JobError::Git(err))
    }
}

fn cannot_batch(reason: impl Into<String>) -> BatchError {
    BatchError::CannotBatch(reason.into())
}

pub struct BatchMergeJob<'a> {
    job: MergeJob<'a>,
    merge_requests: Vec<MergeRequest>,
    batch_branch_name: &'a str,
}

impl<'a> BatchMergeJob<'a> {
    pub fn new(
        api: &'a Api,
        user: &'a User,
        project: &'a Project,
        merge_requests: Vec<MergeRequest>,
        repo: &'a Repo,
        options: &'a MergeJobOptions,
        batch_branch_name: &'a str,
    ) -> BatchMergeJob<'a> {
        BatchMergeJob {
            job: MergeJob::new(api, user, project, repo, options),
            merge_requests,
            batch_branch_name,
        }
    }

    pub fn execute(mut self) -> Result<(), BatchError> {
        let candidates = self.gather_candidates()?;
        if candidates.len() < 2 {
            return Err(cannot_batch(
                "not enough mergeable merge requests to justify a batch",
            ));
        }
        info!(
            count = candidates.len(),
            branch = self.batch_branch_name,
            "stacking merge requests into a batch"
        );

        let stacked = self.stack(candidates)?;
        self.job.repo().push(
            self.batch_branch_name,
            None,
            true,
            self.job.options().skip_ci_batches,
        )?;

        if self.job.project().only_allow_merge_if_pipeline_succeeds()?
            && !self.job.options().skip_ci_batches
        {
            // The cumulative tip is the last stacked one.
            if let Some((_, batch_tip)) = stacked.last() {
                self.wait_for_batch_ci(batch_tip)?;
            }
        }

        self.finalize(stacked)?;
        self.remove_remote_batch_branch();
        Ok(())
    }

    /// Leftover integration branches confuse humans browsing the repo; the
    /// next batch force-pushes over them anyway, so failures only warrant a
    /// warning.
    fn remove_remote_batch_branch(&self) {
        let Ok(project_id) = self.job.project().id() else {
            return;
        };
        if let Err(err) =
            Branch::delete_by_name(project_id, self.batch_branch_name, self.job.api())
        {
            warn!(error = %err, "could not remove the remote integration branch");
        }
    }

    /// Merge requests sharing the first one's target branch that pass the
    /// single-MR gates. A `CannotMerge` here is disposed of exactly like a
    /// single job would (comment and unassign) and the request is excluded.
    fn gather_candidates(&mut self) -> Result<Vec<MergeRequest>, BatchError> {
        let merge_requests = std::mem::take(&mut self.merge_requests);
        let Some(first) = merge_requests.first() else {
            return Ok(Vec::new());
        };
        let target_branch = first.target_branch()?;

        let mut candidates = Vec::new();
        for mut merge_request in merge_requests {
            if merge_request.target_branch()? != target_branch {
                continue;
            }
            let iid = merge_request.iid()?;
            match self.job.ensure_mergeable_mr(&mut merge_request) {
                Ok(()) => candidates.push(merge_request),
                Err(JobError::SkipMerge(reason)) => {
                    info!(iid, %reason, "leaving merge request out of the batch");
                }
                Err(JobError::CannotMerge(reason)) => {
                    warn!(iid, %reason, "merge request cannot be merged, excluding");
                    self.job.unassign_from_mr(&merge_request)?;
                    merge_request
                        .comment(&format!("I couldn't merge this branch: {reason}"))?;
                }
                Err(other) => return Err(other.into()),
            }
        }
        Ok(candidates)
    }

    /// Stack every candidate onto the integration branch, in order,
    /// recording the integration tip each one lands on.
    fn stack(
        &mut self,
        candidates: Vec<MergeRequest>,
    ) -> Result<Vec<(MergeRequest, String)>, BatchError> {
        let target_branch = candidates[0].target_branch()?;
        self.job.repo().fetch("origin")?;
        self.job.repo().checkout_branch(
            self.batch_branch_name,
            Some(&format!("origin/{target_branch}")),
        )?;
        let mut tip = self.job.repo().get_commit_hash("HEAD")?;

        let mut stacked = Vec::new();
        for merge_request in candidates {
            let iid = merge_request.iid()?;
            let source_branch = merge_request.source_branch()?;
            let (_source_project, source_repo_url) =
                self.job.fetch_source_project(&merge_request)?;
            let source_start = match source_repo_url {
                Some(_) => format!("source/{source_branch}"),
                None => format!("origin/{source_branch}"),
            };
            self.job
                .repo()
                .checkout_branch(&source_branch, Some(&source_start))?;

            let new_tip = match self.stack_one(&source_branch) {
                Ok(new_tip) => new_tip,
                Err(err) => {
                    warn!(iid, error = %err, "could not stack merge request");
                    return Err(cannot_batch(format!(
                        "!{iid} conflicts with the batch and cannot be stacked"
                    )));
                }
            };
            if new_tip == tip {
                return Err(cannot_batch(format!(
                    "!{iid} adds no changes on top of the batch"
                )));
            }

            self.job
                .repo()
                .checkout_branch(self.batch_branch_name, Some(&new_tip))?;
            tip = new_tip.clone();
            stacked.push((merge_request, new_tip));
        }
        Ok(stacked)
    }

    fn stack_one(&self, source_branch: &str) -> Result<String, GitError> {
        let options = self.job.options();
        if options.use_merge_commit_batches || options.use_no_ff_batches {
            // A merge commit keeps the merge request visible as a unit in
            // the integration history; --no-ff forces one even for
            // fast-forwardable branches.
            let flags: &[&str] = if options.use_no_ff_batches {
                &["--no-ff"]
            } else {
                &[]
            };
            self.job
                .repo()
                .merge(self.batch_branch_name, source_branch, flags, None, true)
        } else {
            self.job
                .repo()
                .rebase(source_branch, self.batch_branch_name, None, true)
        }
    }

    fn wait_for_batch_ci(&self, batch_tip: &str) -> Result<(), JobError> {
        info!(
            branch = self.batch_branch_name,
            sha = batch_tip,
            "waiting for the integration pipeline"
        );
        let api = self.job.api();
        let project_id = self.job.project().id()?;
        self.job.wait_for_ci(batch_tip, || {
            Ok(Pipeline::pipelines_by_branch(
                project_id,
                self.batch_branch_name,
                api,
            )?)
        })
    }

    /// Accept every stacked merge request in order. A failure aborts the
    /// remainder; the already-merged prefix is final and is not rolled back.
    fn finalize(&mut self, stacked: Vec<(MergeRequest, String)>) -> Result<(), BatchError> {
        for (mut merge_request, tip) in stacked {
            let iid = merge_request.iid()?;
            if let Err(err) = self.accept_one(&mut merge_request, &tip) {
                if let JobError::CannotMerge(reason) = &err {
                    warn!(iid, %reason, "batched merge request failed, aborting the rest");
                    self.job.unassign_from_mr(&merge_request)?;
                    merge_request
                        .comment(&format!("I couldn't merge this branch: {reason}"))?;
                }
                return Err(err.into());
            }
            info!(iid, sha = %tip, "merged from the batch");
        }
        Ok(())
    }

    fn accept_one(&self, merge_request: &mut MergeRequest, tip: &str) -> Result<(), JobError> {
        self.job.ensure_mergeable_mr(merge_request)?;
        let approvals = merge_request.fetch_approvals()?;

        // Move the remote source branch to its integration tip, so the
        // accept merges exactly the stacked state. The batch pipeline
        // already covered the cumulative tip, so skip per-branch CI.
        let source_branch = merge_request.source_branch()?;
        let (_source_project, source_repo_url) = self.job.fetch_source_project(merge_request)?;
        self.job.repo().checkout_branch(&source_branch, Some(tip))?;
        self.job
            .push_force_to_mr(merge_request, true, source_repo_url.as_deref(), true)?;
        merge_request.update_sha(tip);

        self.job.wait_for_merge_status_to_resolve(merge_request)?;
        self.job.maybe_reapprove(merge_request, &approvals)?;

        match merge_request.accept(merge_request.force_remove_source_branch(), tip) {
            Ok(_) => Ok(()),
            Err(err) => Err(cannot_merge(format!(
                "GitLab refused to merge this batched request: {err}"
            ))),
        }
    }
}
