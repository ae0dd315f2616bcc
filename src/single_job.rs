//! The per-merge-request state machine.
//!
//! One pass: gate, fuse onto the fresh target, tag trailers, push, gate CI
//! and merge status, reapprove, accept with the exact head we produced. The
//! expected-sha argument to accept is the race protection: if anyone moves
//! the branch after our push, the server rejects and we loop back to the
//! gates instead of merging the wrong head.

use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::api::{Api, ApiError, FailureKind};
use crate::git::Repo;
use crate::job::{JobError, MergeJob, MergeJobOptions, cannot_merge, poll_until};
use crate::merge_request::MergeRequest;
use crate::project::Project;
use crate::user::User;

const MERGED_POLL_CADENCE: Duration = Duration::from_secs(10);
const MERGE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

enum AcceptOutcome {
    /// The request ended up merged (possibly by someone else).
    Merged,
    /// The head moved underneath us; run the loop again.
    Retry,
}

pub struct SingleMergeJob<'a> {
    job: MergeJob<'a>,
    merge_request: MergeRequest,
}

impl<'a> SingleMergeJob<'a> {
    pub fn new(
        api: &'a Api,
        user: &'a User,
        project: &'a Project,
        merge_request: MergeRequest,
        repo: &'a Repo,
        options: &'a MergeJobOptions,
    ) -> SingleMergeJob<'a> {
        SingleMergeJob {
            job: MergeJob::new(api, user, project, repo, options),
            merge_request,
        }
    }

    /// Drive the merge request to completion. Gate failures are disposed of
    /// here (comment and unassign for `CannotMerge`, silence for
    /// `SkipMerge`); anything else propagates and ends the sweep.
    pub fn execute(mut self) -> Result<()> {
        let iid = self.merge_request.iid()?;
        info!(
            iid,
            title = %self.merge_request.title().unwrap_or_default(),
            "processing merge request"
        );

        match self.update_merge_request_and_accept() {
            Ok(()) => {
                info!(iid, "merged successfully");
                Ok(())
            }
            Err(JobError::SkipMerge(reason)) => {
                warn!(iid, %reason, "deferring merge request");
                Ok(())
            }
            Err(JobError::CannotMerge(reason)) => {
                warn!(iid, %reason, "cannot merge");
                self.job.unassign_from_mr(&self.merge_request)?;
                self.merge_request
                    .comment(&format!("I couldn't merge this branch: {reason}"))?;
                Ok(())
            }
            Err(JobError::Git(err)) => {
                warn!(iid, error = %err, "unexpected git failure");
                let _ = self
                    .merge_request
                    .comment("Something seems broken on my local git repo; check my logs!");
                Err(err.into())
            }
            Err(JobError::Other(err)) => {
                warn!(iid, error = %err, "unexpected failure");
                let _ = self
                    .merge_request
                    .comment("I seem to have hit an internal error, check my logs!");
                let _ = self.job.unassign_from_mr(&self.merge_request);
                Err(err)
            }
        }
    }

    fn update_merge_request_and_accept(&mut self) -> Result<(), JobError> {
        loop {
            self.job.ensure_mergeable_mr(&mut self.merge_request)?;
            let approvals = self.merge_request.fetch_approvals()?;
            let (_source_project, source_repo_url) =
                self.job.fetch_source_project(&self.merge_request)?;

            let fused = self.job.update_from_target_branch_and_push(
                &mut self.merge_request,
                source_repo_url.as_deref(),
                false,
            )?;
            self.merge_request.update_sha(&fused.final_sha);

            if self.job.options().guarantee_final_pipeline {
                info!("triggering a fresh pipeline for the final head");
                self.merge_request.trigger_pipeline()?;
            }
            let needs_green_ci = self.job.project().only_allow_merge_if_pipeline_succeeds()?
                || self.job.options().guarantee_final_pipeline;
            if needs_green_ci {
                self.job
                    .wait_for_ci_to_pass(&self.merge_request, &fused.final_sha)?;
            }

            self.job
                .wait_for_merge_status_to_resolve(&mut self.merge_request)?;
            self.job.maybe_reapprove(&self.merge_request, &approvals)?;

            match self.merge_request.accept(
                self.merge_request.force_remove_source_branch(),
                &fused.final_sha,
            ) {
                Ok(_) => return self.wait_for_branch_to_be_merged(),
                Err(err) => match self.handle_accept_failure(err, &fused.final_sha)? {
                    AcceptOutcome::Merged => return Ok(()),
                    AcceptOutcome::Retry => continue,
                },
            }
        }
    }

    fn handle_accept_failure(
        &mut self,
        err: ApiError,
        final_sha: &str,
    ) -> Result<AcceptOutcome, JobError> {
        match err.kind() {
            Some(FailureKind::NotAcceptable) | Some(FailureKind::Conflict) => {
                info!(error = %err, "the branch moved while merging, retrying");
                Ok(AcceptOutcome::Retry)
            }
            Some(FailureKind::Unauthorized) => {
                Err(cannot_merge("My user cannot accept merge requests!"))
            }
            Some(FailureKind::NotFound) => {
                self.merge_request.refetch_info()?;
                if self.merge_request.state()? == "merged" {
                    info!("someone was faster than me!");
                    Ok(AcceptOutcome::Merged)
                } else {
                    Err(cannot_merge("The merge request seems to have disappeared!"))
                }
            }
            Some(FailureKind::MethodNotAllowed) => {
                self.merge_request.refetch_info()?;
                if self.merge_request.work_in_progress() {
                    return Err(cannot_merge(
                        "The request was marked as a draft as I was processing it. \
                         Maybe a draft commit?",
                    ));
                }
                match self.merge_request.state()?.as_str() {
                    "merged" => {
                        info!("already merged, someone was faster!");
                        Ok(AcceptOutcome::Merged)
                    }
                    "reopened" => Err(cannot_merge(
                        "GitLab refused to merge this branch. I suspect that a Push Rule \
                         or a git-hook rejected it.",
                    )),
                    "closed" => Err(cannot_merge(
                        "Someone closed the merge request while I was attempting to merge it.",
                    )),
                    _ => {
                        if self.job.project().only_allow_merge_if_pipeline_succeeds()? {
                            // Check whether CI regressed on the final head.
                            self.job
                                .wait_for_ci_to_pass(&self.merge_request, final_sha)?;
                        }
                        Err(cannot_merge(
                            "GitLab refused to merge this request and I don't know why!",
                        ))
                    }
                }
            }
            _ => Err(JobError::Other(err.into())),
        }
    }

    /// `merge_when_pipeline_succeeds` means the accept can come back before
    /// the actual merge; hang around until the state flips.
    fn wait_for_branch_to_be_merged(&mut self) -> Result<(), JobError> {
        let merge_request = &mut self.merge_request;
        let merged = poll_until(MERGED_POLL_CADENCE, MERGE_TIMEOUT, || {
            merge_request.refetch_info()?;
            match merge_request.state()?.as_str() {
                "merged" => Ok(Some(())),
                "closed" => Err(cannot_merge(
                    "Someone closed the merge request while I was waiting for it to be merged.",
                )),
                _ => Ok(None),
            }
        })?;
        if merged.is_none() {
            return Err(cannot_merge("It is taking too long to see the request merged!"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::process::Command;
    use std::time::Duration;

    use serde_json::{Value, json};

    use super::*;
    use crate::api::testing::{MockTransport, api_at_version};
    use crate::merge_request::testing::{BOT_ID, mr_info};
    use crate::project::testing::{project_info, project_over};

    fn git(repo: &Path, args: &[&str]) -> String {
        let output = Command::new("git")
            .current_dir(repo)
            .args(args)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    fn commit_file(repo: &Path, name: &str, content: &str, message: &str) {
        fs::write(repo.join(name), content).unwrap();
        git(repo, &["add", name]);
        git(repo, &["commit", "-q", "-m", message]);
    }

    fn stage_repos() -> Option<(tempfile::TempDir, PathBuf, Repo)> {
        let available = Command::new("git")
            .arg("--version")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false);
        if !available {
            return None;
        }
        let tmp = tempfile::tempdir().unwrap();
        let origin = tmp.path().join("origin");
        fs::create_dir(&origin).unwrap();
        git(&origin, &["init", "-q"]);
        git(&origin, &["symbolic-ref", "HEAD", "refs/heads/master"]);
        git(&origin, &["config", "user.email", "author@example.com"]);
        git(&origin, &["config", "user.name", "An Author"]);
        commit_file(&origin, "README.md", "init\n", "init");
        git(&origin, &["checkout", "-q", "-b", "useless_new_feature"]);
        commit_file(&origin, "f1.txt", "one\n", "feature: one");
        git(&origin, &["checkout", "-q", "master"]);
        commit_file(&origin, "base.txt", "more\n", "master: advance");

        let repo = Repo::new(
            origin.display().to_string(),
            tmp.path().join("clone"),
            None,
            Duration::from_secs(60),
            None,
        );
        repo.clone_repo().unwrap();
        repo.config_user_info("Merge Train", "bot@example.com").unwrap();
        Some((tmp, origin, repo))
    }

    fn bot(api: &crate::api::Api) -> User {
        User::for_tests(
            api,
            json!({"id": BOT_ID, "username": "mergetrain", "name": "Merge Train", "is_admin": true}),
        )
    }

    fn approvals_body() -> String {
        json!({
            "id": 42, "iid": 54, "project_id": 1234,
            "approvals_left": 0,
            "approved_by": [{"user": {"id": 10, "username": "reviewer_a"}}],
        })
        .to_string()
    }

    fn staged_mr_info(origin: &Path) -> Value {
        let mut info = mr_info();
        info["sha"] = json!(git(origin, &["rev-parse", "useless_new_feature"]));
        info
    }

    fn no_ci_project(api: &crate::api::Api) -> Project {
        let mut info = project_info(1234);
        info["only_allow_merge_if_pipeline_succeeds"] = json!(false);
        project_over(api, info)
    }

    #[test]
    fn merges_a_rebased_mr_and_accepts_the_final_head() {
        let Some((_tmp, origin, repo)) = stage_repos() else {
            return;
        };
        let staged = staged_mr_info(&origin);
        let mut merged = staged.clone();
        merged["state"] = json!("merged");

        let transport = MockTransport::new()
            .reply(200, &staged.to_string()) // gate refetch
            .reply(200, &approvals_body()) // gate approvals
            .reply(200, &approvals_body()) // approvals kept for reapproval
            // fetch_commits / fetch_approvals / reviewer lookup
            .reply(200, r#"[{"author_email": "author@example.com"}]"#)
            .reply(200, &approvals_body())
            .reply(
                200,
                r#"{"id": 10, "name": "A. Prover", "email": "a.prover@example.com"}"#,
            )
            .reply(200, &staged.to_string()) // merge-status refetch
            .reply(200, r#"{"state": "merged"}"#) // accept
            .reply(200, &merged.to_string()); // merged-state refetch
        let api = api_at_version(&transport, "13.2.0");
        let user = bot(&api);
        let project = no_ci_project(&api);
        let options = MergeJobOptions {
            add_reviewers: true,
            ..MergeJobOptions::default()
        };
        let merge_request = MergeRequest::for_tests(&api, staged.clone());

        SingleMergeJob::new(&api, &user, &project, merge_request, &repo, &options)
            .execute()
            .unwrap();

        // The accept carried exactly the head the rewrite produced, which is
        // also what the force-push put on the remote source branch.
        let remote_head = git(&origin, &["rev-parse", "useless_new_feature"]);
        let calls = transport.calls();
        let accept = calls
            .iter()
            .find(|call| call.path().ends_with("/merge"))
            .expect("an accept call");
        assert_eq!(
            accept.body.as_ref().unwrap().get("sha").unwrap(),
            &json!(remote_head)
        );
        assert_eq!(
            accept.body.as_ref().unwrap().get("merge_when_pipeline_succeeds"),
            Some(&json!(true))
        );
        // Trailer landed on the rewritten commit.
        let message = git(repo.local_path(), &["log", "-1", "--format=%B", &remote_head]);
        assert!(message.contains("Reviewed-by: A. Prover <a.prover@example.com>"));
        // Approvals preserved: no comment, no unassignment.
        assert!(!calls.iter().any(|call| call.path().ends_with("/notes")));
    }

    #[test]
    fn gitlab_rebase_mismatch_cannot_merge() {
        let Some((_tmp, origin, repo)) = stage_repos() else {
            return;
        };
        let staged = staged_mr_info(&origin);
        let mut rebased_elsewhere = staged.clone();
        rebased_elsewhere["sha"] = json!("def4560000000000000000000000000000000000");
        rebased_elsewhere["rebase_in_progress"] = json!(false);

        let transport = MockTransport::new()
            .reply(200, &staged.to_string()) // gate refetch
            .reply(200, &approvals_body()) // gate approvals
            .reply(200, &approvals_body()) // approvals for reapproval
            .reply(200, &staged.to_string()) // rebase(): refetch
            .reply(202, "") // rebase(): PUT
            .reply(200, &rebased_elsewhere.to_string()) // rebase(): poll
            .reply(200, "{}") // unassign (back to author 88)
            .reply(201, "{}"); // comment
        let api = api_at_version(&transport, "13.2.0");
        let user = bot(&api);
        let project = no_ci_project(&api);
        let options = MergeJobOptions {
            fusion: crate::job::Fusion::GitlabRebase,
            ..MergeJobOptions::default()
        };
        let merge_request = MergeRequest::for_tests(&api, staged);

        SingleMergeJob::new(&api, &user, &project, merge_request, &repo, &options)
            .execute()
            .unwrap();

        let calls = transport.calls();
        assert_eq!(calls[6].body, Some(json!({"assignee_id": 88})));
        let comment = calls[7].body.as_ref().unwrap()["body"].as_str().unwrap();
        assert!(
            comment.contains("ended up with a different commit"),
            "{comment}"
        );
    }

    #[test]
    fn cannot_merge_comments_and_hands_back_to_the_author() {
        let transport = MockTransport::new();
        let api = api_at_version(&transport, "13.2.0");
        let mut draft = mr_info();
        draft["draft"] = json!(true);
        transport
            .reply(200, &draft.to_string()) // gate refetch
            .reply(200, "{}") // unassign
            .reply(201, "{}"); // comment
        let user = bot(&api);
        let project = no_ci_project(&api);
        let options = MergeJobOptions::default();
        let repo = Repo::new(
            "unused".to_string(),
            PathBuf::from("/nonexistent"),
            None,
            Duration::from_secs(1),
            None,
        );
        let merge_request = MergeRequest::for_tests(&api, mr_info());

        SingleMergeJob::new(&api, &user, &project, merge_request, &repo, &options)
            .execute()
            .unwrap();

        let calls = transport.calls();
        assert_eq!(calls[1].body, Some(json!({"assignee_id": 88})));
        let comment = calls[2].body.as_ref().unwrap()["body"].as_str().unwrap();
        assert!(comment.starts_with("I couldn't merge this branch:"));
        assert!(comment.contains("drafts"));
    }

    #[test]
    fn skip_merge_stays_silent() {
        let transport = MockTransport::new();
        let api = api_at_version(&transport, "13.2.0");
        let mut unassigned = mr_info();
        unassigned["assignees"] = json!([{"id": 9999}]);
        transport
            .reply(200, &unassigned.to_string())
            .reply(200, &approvals_body());
        let user = bot(&api);
        let project = no_ci_project(&api);
        let options = MergeJobOptions::default();
        let repo = Repo::new(
            "unused".to_string(),
            PathBuf::from("/nonexistent"),
            None,
            Duration::from_secs(1),
            None,
        );
        let merge_request = MergeRequest::for_tests(&api, mr_info());

        SingleMergeJob::new(&api, &user, &project, merge_request, &repo, &options)
            .execute()
            .unwrap();

        // Refetch and approvals only: no note, no assignment change.
        assert_eq!(transport.calls().len(), 2);
    }

    #[test]
    fn conflict_on_accept_retries_and_merges() {
        let Some((_tmp, origin, repo)) = stage_repos() else {
            return;
        };
        let staged = staged_mr_info(&origin);
        let mut merged = staged.clone();
        merged["state"] = json!("merged");

        let transport = MockTransport::new()
            // first pass
            .reply(200, &staged.to_string())
            .reply(200, &approvals_body())
            .reply(200, &approvals_body())
            .reply(200, &staged.to_string()) // merge-status refetch
            .reply(409, r#"{"message": "SHA does not match HEAD of source branch"}"#)
            // second pass
            .reply(200, &staged.to_string())
            .reply(200, &approvals_body())
            .reply(200, &approvals_body())
            .reply(200, &staged.to_string()) // merge-status refetch
            .reply(200, r#"{"state": "merged"}"#) // accept succeeds
            .reply(200, &merged.to_string()); // merged-state refetch
        let api = api_at_version(&transport, "13.2.0");
        let user = bot(&api);
        let project = no_ci_project(&api);
        let options = MergeJobOptions::default();
        let merge_request = MergeRequest::for_tests(&api, staged);

        SingleMergeJob::new(&api, &user, &project, merge_request, &repo, &options)
            .execute()
            .unwrap();

        let accepts: Vec<_> = transport
            .calls()
            .into_iter()
            .filter(|call| call.path().ends_with("/merge"))
            .collect();
        assert_eq!(accepts.len(), 2, "rejected accept must be retried");
    }
}
