//! The supervisor loop.
//!
//! Each sweep discovers the projects the bot is a member of, lists the open
//! merge requests assigned to it, and drives the batch or single-MR job.
//! Nothing is persisted between sweeps; every cycle is recomputed from the
//! remote.

use std::thread;
use std::time::Duration;

use anyhow::Result;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::api::Api;
use crate::batch_job::{BatchError, BatchMergeJob};
use crate::job::{JobError, MergeJobOptions};
use crate::merge_request::{MergeOrder, MergeRequest};
use crate::project::{AccessLevel, Project};
use crate::repo_pool::RepoPool;
use crate::single_job::SingleMergeJob;
use crate::user::User;

const SLEEP_BETWEEN_PROJECTS: Duration = Duration::from_secs(1);
const MIN_SLEEP_BETWEEN_SWEEPS: Duration = Duration::from_secs(30);

pub struct BotConfig {
    pub project_regexp: Regex,
    pub branch_regexp: Regex,
    pub source_branch_regexp: Regex,
    pub merge_order: MergeOrder,
    pub merge_opts: MergeJobOptions,
    pub batch: bool,
    pub batch_branch_name: String,
    /// Run a single sweep and exit instead of looping forever.
    pub cli: bool,
}

pub struct Bot {
    api: Api,
    user: User,
    config: BotConfig,
}

impl Bot {
    pub fn new(api: Api, user: User, config: BotConfig) -> Result<Bot> {
        config.merge_opts.validate_for(&user)?;
        Ok(Bot { api, user, config })
    }

    pub fn start(&self, repo_pool: &mut RepoPool) -> Result<()> {
        loop {
            let projects = self.find_projects()?;
            let project_count = projects.len() as u32;
            for project in &projects {
                let project_name = project.path_with_namespace()?;
                if project.access_level()? < AccessLevel::Reporter {
                    warn!(
                        project = %project_name,
                        "not enough permissions to browse merge requests"
                    );
                    continue;
                }
                self.process_project(repo_pool, project)?;
                thread::sleep(SLEEP_BETWEEN_PROJECTS);
            }
            if self.config.cli {
                return Ok(());
            }

            let spent = SLEEP_BETWEEN_PROJECTS * project_count;
            let big_sleep = MIN_SLEEP_BETWEEN_SWEEPS.saturating_sub(spent);
            info!(seconds = big_sleep.as_secs(), "sweep done, sleeping");
            thread::sleep(big_sleep);
        }
    }

    fn find_projects(&self) -> Result<Vec<Project>> {
        info!("discovering my projects");
        let mut filtered = Vec::new();
        for project in Project::fetch_all_mine(&self.api)? {
            let path = project.path_with_namespace()?;
            if matches_from_start(&self.config.project_regexp, &path) {
                filtered.push(project);
            } else {
                debug!(project = %path, "does not match project_regexp");
            }
        }
        Ok(filtered)
    }

    fn find_merge_requests(&self, project: &Project) -> Result<Vec<MergeRequest>> {
        let assigned = MergeRequest::fetch_all_open_for_user(
            project.id()?,
            &self.user,
            &self.api,
            self.config.merge_order,
        )?;
        let mut filtered = Vec::new();
        for merge_request in assigned {
            if !matches_from_start(&self.config.branch_regexp, &merge_request.target_branch()?) {
                debug!(
                    url = %merge_request.web_url().unwrap_or_default(),
                    "target branch does not match branch_regexp"
                );
                continue;
            }
            if !matches_from_start(
                &self.config.source_branch_regexp,
                &merge_request.source_branch()?,
            ) {
                debug!(
                    url = %merge_request.web_url().unwrap_or_default(),
                    "source branch does not match source_branch_regexp"
                );
                continue;
            }
            filtered.push(merge_request);
        }
        Ok(filtered)
    }

    fn process_project(&self, repo_pool: &mut RepoPool, project: &Project) -> Result<()> {
        let merge_requests = self.find_merge_requests(project)?;
        if merge_requests.is_empty() {
            info!("nothing to merge at this point");
            return Ok(());
        }
        let repo = repo_pool.repo_for_project(project)?;
        info!(count = merge_requests.len(), "requests to merge");

        if self.config.batch && merge_requests.len() > 1 {
            info!("attempting to merge as many requests as possible in one batch");
            let batch = BatchMergeJob::new(
                &self.api,
                &self.user,
                project,
                merge_requests.clone(),
                &repo,
                &self.config.merge_opts,
                &self.config.batch_branch_name,
            );
            match batch.execute() {
                Ok(()) => return Ok(()),
                Err(BatchError::CannotBatch(reason)) => {
                    warn!(%reason, "batch abandoned, falling back to the oldest request");
                }
                Err(BatchError::Job(JobError::CannotMerge(reason))) => {
                    warn!(%reason, "batch failed, leaving this project for the next sweep");
                    return Ok(());
                }
                Err(BatchError::Job(JobError::SkipMerge(reason))) => {
                    info!(%reason, "batch deferred, leaving this project for the next sweep");
                    return Ok(());
                }
                Err(BatchError::Job(JobError::Git(err))) => {
                    warn!(error = %err, "batch hit a git failure, falling back");
                }
                Err(BatchError::Job(JobError::Other(err))) => return Err(err),
            }
        }

        info!("attempting to merge the oldest request");
        let Some(oldest) = merge_requests.into_iter().next() else {
            return Ok(());
        };
        SingleMergeJob::new(
            &self.api,
            &self.user,
            project,
            oldest,
            &repo,
            &self.config.merge_opts,
        )
        .execute()
    }
}

/// Anchored-at-the-start matching, the usual scope-filter semantics.
fn matches_from_start(regexp: &Regex, text: &str) -> bool {
    regexp.find(text).is_some_and(|found| found.start() == 0)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::api::testing::{MockTransport, api_at_version};
    use crate::merge_request::testing::{BOT_ID, mr_info};
    use crate::project::testing::project_info;
    use crate::repo_pool::CloneStrategy;

    fn match_all() -> Regex {
        Regex::new(".*").unwrap()
    }

    fn bot_config(batch: bool) -> BotConfig {
        BotConfig {
            project_regexp: match_all(),
            branch_regexp: match_all(),
            source_branch_regexp: match_all(),
            merge_order: MergeOrder::CreatedAt,
            merge_opts: MergeJobOptions::default(),
            batch,
            batch_branch_name: "mergetrain-batch".to_string(),
            cli: true,
        }
    }

    fn bot_user(api: &Api) -> User {
        User::for_tests(
            api,
            json!({"id": BOT_ID, "username": "mergetrain", "name": "Merge Train", "is_admin": true}),
        )
    }

    #[test]
    fn matches_from_start_anchors_like_a_scope_filter() {
        let re = Regex::new("gitlab-org/.*").unwrap();
        assert!(matches_from_start(&re, "gitlab-org/gitlab"));
        assert!(!matches_from_start(&re, "forks/gitlab-org/gitlab"));
        assert!(matches_from_start(&match_all(), "anything"));
    }

    #[test]
    fn find_merge_requests_applies_branch_filters() {
        let mut to_release = mr_info();
        to_release["iid"] = json!(55);
        to_release["target_branch"] = json!("release-1.0");
        let transport = MockTransport::new()
            .reply(200, &json!([mr_info(), to_release]).to_string())
            .reply(200, "[]");
        let api = api_at_version(&transport, "13.2.0");
        let user = bot_user(&api);
        let config = BotConfig {
            branch_regexp: Regex::new("master$").unwrap(),
            ..bot_config(false)
        };
        let bot = Bot::new(api.clone(), user, config).unwrap();
        let project = crate::project::testing::project_over(&api, project_info(1234));

        let merge_requests = bot.find_merge_requests(&project).unwrap();
        assert_eq!(merge_requests.len(), 1);
        assert_eq!(merge_requests[0].iid().unwrap(), 54);
    }

    #[test]
    fn non_admin_bot_rejects_impersonation_options() {
        let transport = MockTransport::new();
        let api = api_at_version(&transport, "13.2.0");
        let user = User::for_tests(
            &api,
            json!({"id": 1, "username": "plain", "name": "Plain", "is_admin": false}),
        );
        let config = BotConfig {
            merge_opts: MergeJobOptions {
                reapprove: true,
                ..MergeJobOptions::default()
            },
            ..bot_config(false)
        };
        assert!(Bot::new(api, user, config).is_err());
    }

    #[test]
    fn cli_mode_exits_after_one_sweep() {
        let transport = MockTransport::new().reply(200, "[]");
        let api = api_at_version(&transport, "13.2.0");
        let user = bot_user(&api);
        let bot = Bot::new(api, user, bot_config(false)).unwrap();
        let mut pool = RepoPool::new(
            CloneStrategy::Ssh { key_file: None },
            &bot.user,
            Duration::from_secs(1),
            None,
        )
        .unwrap();
        bot.start(&mut pool).unwrap();
        assert_eq!(transport.calls().len(), 1);
    }

    // Full sweep against a real clone: the batch conflicts, the supervisor
    // falls back, and the oldest merge request gets merged on its own.
    mod batch_fallback {
        use std::fs;
        use std::path::Path;
        use std::process::Command;
        use std::time::Duration;

        use serde_json::{Value, json};

        use super::{bot_config, bot_user};
        use crate::api::testing::{MockTransport, api_at_version};
        use crate::bot::Bot;
        use crate::merge_request::testing::mr_info;
        use crate::project::testing::{project_info, project_over};
        use crate::repo_pool::{CloneStrategy, RepoPool};

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

        fn batch_mr(iid: u64, source_branch: &str) -> Value {
            let mut info = mr_info();
            info["iid"] = json!(iid);
            info["source_branch"] = json!(source_branch);
            info
        }

        #[test]
        fn conflicting_batch_falls_back_to_single_merge() {
            let available = Command::new("git")
                .arg("--version")
                .output()
                .map(|output| output.status.success())
                .unwrap_or(false);
            if !available {
                return;
            }
            let tmp = tempfile::tempdir().unwrap();
            let origin = tmp.path().join("origin");
            fs::create_dir(&origin).unwrap();
            git(&origin, &["init", "-q"]);
            git(&origin, &["symbolic-ref", "HEAD", "refs/heads/master"]);
            git(&origin, &["config", "user.email", "author@example.com"]);
            git(&origin, &["config", "user.name", "An Author"]);
            commit_file(&origin, "README.md", "init\n", "init");
            // Both branches edit the same file: they cannot stack.
            git(&origin, &["checkout", "-q", "-b", "feature_a"]);
            commit_file(&origin, "clash.txt", "a\n", "feature a");
            git(&origin, &["checkout", "-q", "master"]);
            git(&origin, &["checkout", "-q", "-b", "feature_b"]);
            commit_file(&origin, "clash.txt", "b\n", "feature b");
            git(&origin, &["checkout", "-q", "master"]);

            let approvals = json!({
                "id": 42, "iid": 54, "project_id": 1234,
                "approvals_left": 0,
                "approved_by": [{"user": {"id": 10, "username": "reviewer_a"}}],
            })
            .to_string();
            let mut merged = batch_mr(54, "feature_a");
            merged["state"] = json!("merged");

            let transport = MockTransport::new()
                // merge request listing
                .reply(
                    200,
                    &json!([batch_mr(54, "feature_a"), batch_mr(55, "feature_b")]).to_string(),
                )
                .reply(200, "[]")
                // batch candidate gates
                .reply(200, &batch_mr(54, "feature_a").to_string())
                .reply(200, &approvals)
                .reply(200, &batch_mr(55, "feature_b").to_string())
                .reply(200, &approvals)
                // single job on !54: gate refetch + approvals, loop approvals
                .reply(200, &batch_mr(54, "feature_a").to_string())
                .reply(200, &approvals)
                .reply(200, &approvals)
                // merge-status refetch, accept, merged refetch
                .reply(200, &batch_mr(54, "feature_a").to_string())
                .reply(200, r#"{"state": "merged"}"#)
                .reply(200, &merged.to_string());
            let api = api_at_version(&transport, "13.2.0");
            let user = bot_user(&api);
            let bot = Bot::new(api.clone(), user, bot_config(true)).unwrap();

            let mut project_body = project_info(1234);
            project_body["ssh_url_to_repo"] = json!(origin.display().to_string());
            project_body["only_allow_merge_if_pipeline_succeeds"] = json!(false);
            let project = project_over(&api, project_body);

            let mut pool = RepoPool::new(
                CloneStrategy::Ssh { key_file: None },
                &bot.user,
                Duration::from_secs(60),
                None,
            )
            .unwrap();

            bot.process_project(&mut pool, &project).unwrap();

            let calls = transport.calls();
            let accepts: Vec<_> = calls
                .iter()
                .filter(|call| call.path().ends_with("/merge"))
                .collect();
            assert_eq!(accepts.len(), 1, "only the oldest request gets merged");
            assert!(accepts[0].path().contains("/merge_requests/54/"));
            // !54's branch really moved onto master.
            let master = git(&origin, &["rev-parse", "master"]);
            let feature_a = git(&origin, &["rev-parse", "feature_a"]);
            let pool_repo = pool
                .repo_for_project(&project)
                .expect("clone still cached");
            assert_eq!(
                git(pool_repo.local_path(), &["merge-base", &feature_a, &master]),
                master
            );
        }
    }
}
