//! Merge-request projection and actions.
//!
//! The `merge_status` field is eventually consistent on the server side, so
//! every precondition check starts from [`MergeRequest::refetch_info`]; the
//! snapshot is replaced wholesale on each refetch.

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::DateTime;
use serde_json::Value;
use tracing::info;

use crate::api::{Api, ApiError, Command, FailureKind};
use crate::approvals::Approvals;
use crate::resource;
use crate::user::User;

pub const NO_JOBS_MESSAGE: &str = "No stages / jobs for this pipeline.";

const REBASE_POLL_ATTEMPTS: u32 = 30;
const REBASE_POLL_CADENCE: Duration = Duration::from_secs(1);

/// Order in which the supervisor walks assigned merge requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOrder {
    CreatedAt,
    UpdatedAt,
    AssignedAt,
}

impl MergeOrder {
    /// The server cannot order by assignment time; for that we list by
    /// creation time and sort locally from the discussion notes.
    fn server_order(self) -> &'static str {
        match self {
            MergeOrder::CreatedAt | MergeOrder::AssignedAt => "created_at",
            MergeOrder::UpdatedAt => "updated_at",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RebaseError {
    #[error("remote rebase failed: {0}")]
    Failed(String),
    #[error("timed out waiting for the remote rebase to finish")]
    Timeout,
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct MergeRequest {
    api: Api,
    info: Value,
}

impl MergeRequest {
    pub fn fetch_by_iid(project_id: u64, iid: u64, api: &Api) -> Result<MergeRequest> {
        let mut merge_request = MergeRequest {
            api: api.clone(),
            info: serde_json::json!({"project_id": project_id, "iid": iid}),
        };
        merge_request.refetch_info()?;
        Ok(merge_request)
    }

    /// All opened merge requests assigned to `user`, sorted ascending by
    /// `order`.
    pub fn fetch_all_open_for_user(
        project_id: u64,
        user: &User,
        api: &Api,
        order: MergeOrder,
    ) -> Result<Vec<MergeRequest>> {
        let command = Command::get(format!("/projects/{project_id}/merge_requests"))
            .arg("state", "opened")
            .arg("order_by", order.server_order())
            .arg("sort", "asc");
        let user_id = user.id()?;
        let mut mine: Vec<Value> = api
            .collect_all_pages(&command)?
            .into_iter()
            .filter(|info| assigned_ids(info).contains(&user_id))
            .collect();

        if order == MergeOrder::AssignedAt {
            let mut keyed = mine
                .drain(..)
                .map(|info| Ok((Self::fetch_assigned_at(user, api, &info)?, info)))
                .collect::<Result<Vec<(i64, Value)>>>()?;
            keyed.sort_by_key(|(assigned_at, _)| *assigned_at);
            mine = keyed.into_iter().map(|(_, info)| info).collect();
        }

        Ok(mine
            .into_iter()
            .map(|info| MergeRequest {
                api: api.clone(),
                info,
            })
            .collect())
    }

    /// Millisecond timestamp of the latest system note assigning `user` to
    /// this merge request, 0 when none is found.
    fn fetch_assigned_at(user: &User, api: &Api, info: &Value) -> Result<i64> {
        let project_id = resource::u64_field(info, "project_id")?;
        let iid = resource::u64_field(info, "iid")?;
        let discussions = api.collect_all_pages(&Command::get(format!(
            "/projects/{project_id}/merge_requests/{iid}/discussions"
        )))?;

        let needle = format!("assigned to @{}", user.username()?);
        let mut assigned_at = 0;
        for discussion in &discussions {
            let notes = discussion
                .get("notes")
                .and_then(Value::as_array)
                .map_or(&[] as &[Value], Vec::as_slice);
            for note in notes {
                let body = note.get("body").and_then(Value::as_str).unwrap_or("");
                if !body.contains(&needle) {
                    continue;
                }
                let Some(created_at) = note.get("created_at").and_then(Value::as_str) else {
                    continue;
                };
                let stamp = DateTime::parse_from_rfc3339(created_at)
                    .with_context(|| format!("bad note timestamp {created_at:?}"))?
                    .timestamp_millis();
                assigned_at = assigned_at.max(stamp);
            }
        }
        Ok(assigned_at)
    }

    pub fn refetch_info(&mut self) -> Result<()> {
        let info = self.api.call(
            &Command::get(format!(
                "/projects/{}/merge_requests/{}",
                self.project_id()?,
                self.iid()?
            ))
            .arg("include_rebase_in_progress", true),
        )?;
        self.info = info;
        Ok(())
    }

    /// Record a sha we just produced ourselves. A refetch right after a
    /// push can still see the pre-push head.
    pub fn update_sha(&mut self, sha: &str) {
        if let Some(fields) = self.info.as_object_mut() {
            fields.insert("sha".to_string(), Value::String(sha.to_string()));
        }
    }

    pub fn comment(&self, message: &str) -> Result<Value> {
        let mr_ref = if self.api.version()?.mr_endpoints_use_iid() {
            self.iid()?
        } else {
            self.id()?
        };
        Ok(self.api.call(
            &Command::post(format!(
                "/projects/{}/merge_requests/{}/notes",
                self.project_id()?,
                mr_ref
            ))
            .arg("body", message),
        )?)
    }

    /// Ask the platform to rebase the source branch, then poll until it
    /// reports completion.
    pub fn rebase(&mut self) -> Result<(), RebaseError> {
        self.refetch_info()?;
        if self.rebase_in_progress() {
            // Someone just happened to press the button for us.
            info!(iid = self.iid().ok(), "a rebase was already in progress");
        } else {
            self.api.call(&Command::put(format!(
                "/projects/{}/merge_requests/{}/rebase",
                self.project_id()?,
                self.iid()?
            )))?;
        }

        for _ in 0..REBASE_POLL_ATTEMPTS {
            self.refetch_info()?;
            if !self.rebase_in_progress() {
                if let Some(message) = self.merge_error().filter(|message| !message.is_empty()) {
                    return Err(RebaseError::Failed(message));
                }
                return Ok(());
            }
            thread::sleep(REBASE_POLL_CADENCE);
        }
        Err(RebaseError::Timeout)
    }

    /// Merge via the platform. Passing the expected `sha` makes the server
    /// reject the call if the head moved underneath us.
    pub fn accept(&self, remove_branch: bool, sha: &str) -> Result<Value, ApiError> {
        self.accept_command(remove_branch, sha)
            .and_then(|command| self.api.call(&command))
    }

    fn accept_command(&self, remove_branch: bool, sha: &str) -> Result<Command, ApiError> {
        let endpoint = match (self.project_id(), self.iid()) {
            (Ok(project_id), Ok(iid)) => {
                format!("/projects/{project_id}/merge_requests/{iid}/merge")
            }
            (Err(err), _) | (_, Err(err)) => return Err(ApiError::Transport(err)),
        };
        Ok(Command::put(endpoint)
            .arg("should_remove_source_branch", remove_branch)
            .arg("merge_when_pipeline_succeeds", true)
            .arg("sha", sha))
    }

    pub fn assign_to(&self, user_id: u64) -> Result<Value> {
        Ok(self.api.call(
            &Command::put(format!(
                "/projects/{}/merge_requests/{}",
                self.project_id()?,
                self.iid()?
            ))
            .arg("assignee_id", user_id),
        )?)
    }

    /// Clearing the assignee is expressed as assigning user 0.
    pub fn unassign(&self) -> Result<Value> {
        self.assign_to(0)
    }

    pub fn fetch_approvals(&self) -> Result<Approvals> {
        let mut approvals =
            Approvals::new(&self.api, self.id()?, self.iid()?, self.project_id()?);
        approvals.refetch_info()?;
        Ok(approvals)
    }

    pub fn fetch_commits(&self) -> Result<Vec<Value>> {
        let response = self.api.call(&Command::get(format!(
            "/projects/{}/merge_requests/{}/commits",
            self.project_id()?,
            self.iid()?
        )))?;
        let Value::Array(commits) = response else {
            anyhow::bail!("expected a commit list, got: {response}");
        };
        Ok(commits)
    }

    /// Trigger a pipeline for this merge request.
    ///
    /// Merge-request pipelines need explicit CI configuration; when the
    /// server answers that no jobs exist for them, fall back to a plain
    /// branch pipeline on the source branch.
    pub fn trigger_pipeline(&self) -> Result<Value> {
        let mr_pipelines = Command::post(format!(
            "/projects/{}/merge_requests/{}/pipelines",
            self.project_id()?,
            self.iid()?
        ));
        match self.api.call(&mr_pipelines) {
            Ok(result) => Ok(result),
            Err(err)
                if err.kind() == Some(FailureKind::BadRequest)
                    && err
                        .error_message()
                        .is_some_and(|message| message.contains(NO_JOBS_MESSAGE)) =>
            {
                info!("no merge-request jobs configured, triggering a branch pipeline");
                Ok(self.api.call(&Command::post(format!(
                    "/projects/{}/pipeline?ref={}",
                    self.project_id()?,
                    self.source_branch()?
                )))?)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn id(&self) -> Result<u64> {
        resource::u64_field(&self.info, "id")
    }

    pub fn iid(&self) -> Result<u64> {
        resource::u64_field(&self.info, "iid")
    }

    pub fn project_id(&self) -> Result<u64> {
        resource::u64_field(&self.info, "project_id")
    }

    pub fn title(&self) -> Result<String> {
        resource::str_field(&self.info, "title")
    }

    pub fn state(&self) -> Result<String> {
        resource::str_field(&self.info, "state")
    }

    pub fn merge_status(&self) -> Result<String> {
        resource::str_field(&self.info, "merge_status")
    }

    pub fn rebase_in_progress(&self) -> bool {
        resource::bool_field_or(&self.info, "rebase_in_progress", false)
    }

    pub fn merge_error(&self) -> Option<String> {
        resource::opt_str_field(&self.info, "merge_error")
    }

    pub fn assignee_ids(&self) -> Vec<u64> {
        assigned_ids(&self.info)
    }

    pub fn author_id(&self) -> Result<u64> {
        let author = self
            .info
            .get("author")
            .context("snapshot has no author")?;
        resource::u64_field(author, "id")
    }

    pub fn source_branch(&self) -> Result<String> {
        resource::str_field(&self.info, "source_branch")
    }

    pub fn target_branch(&self) -> Result<String> {
        resource::str_field(&self.info, "target_branch")
    }

    pub fn sha(&self) -> Result<String> {
        resource::str_field(&self.info, "sha")
    }

    /// Missing means the server does not support auto-squash at all.
    pub fn squash(&self) -> bool {
        resource::bool_field_or(&self.info, "squash", false)
    }

    pub fn source_project_id(&self) -> Result<u64> {
        resource::u64_field(&self.info, "source_project_id")
    }

    pub fn target_project_id(&self) -> Result<u64> {
        resource::u64_field(&self.info, "target_project_id")
    }

    /// Newer servers call it `draft`, older ones `work_in_progress`.
    pub fn work_in_progress(&self) -> bool {
        self.info
            .get("draft")
            .or_else(|| self.info.get("work_in_progress"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn web_url(&self) -> Result<String> {
        resource::str_field(&self.info, "web_url")
    }

    /// Absent on servers that predate blocking discussions.
    pub fn blocking_discussions_resolved(&self) -> bool {
        resource::bool_field_or(&self.info, "blocking_discussions_resolved", true)
    }

    /// The server reports `null` when the author left the default.
    pub fn force_remove_source_branch(&self) -> bool {
        resource::bool_field_or(&self.info, "force_remove_source_branch", false)
    }

    #[cfg(test)]
    pub(crate) fn for_tests(api: &Api, info: Value) -> MergeRequest {
        MergeRequest {
            api: api.clone(),
            info,
        }
    }
}

/// Assignee ids from either the modern `assignees` list or the legacy
/// singular `assignee`.
fn assigned_ids(info: &Value) -> Vec<u64> {
    if let Some(assignees) = info.get("assignees").and_then(Value::as_array) {
        return assignees
            .iter()
            .filter_map(|assignee| assignee.get("id"))
            .filter_map(Value::as_u64)
            .collect();
    }
    info.get("assignee")
        .and_then(|assignee| assignee.get("id"))
        .and_then(Value::as_u64)
        .into_iter()
        .collect()
}
