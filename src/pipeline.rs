//! Pipeline lookups: by merge request on capable servers, by ref otherwise.

use anyhow::Result;
use serde_json::Value;

use crate::api::{Api, Command};
use crate::resource;

#[derive(Debug, Clone)]
pub struct Pipeline {
    info: Value,
}

impl Pipeline {
    /// Pipelines for a merge request, newest first. Needs 10.5.0.
    pub fn pipelines_by_merge_request(
        target_project_id: u64,
        iid: u64,
        api: &Api,
    ) -> Result<Vec<Pipeline>> {
        let command = Command::get(format!(
            "/projects/{target_project_id}/merge_requests/{iid}/pipelines"
        ));
        Ok(api
            .collect_all_pages(&command)?
            .into_iter()
            .map(|info| Pipeline { info })
            .collect())
    }

    /// Pipelines for a branch, newest first. The legacy path for servers
    /// without merge-request pipelines.
    pub fn pipelines_by_branch(
        source_project_id: u64,
        branch: &str,
        api: &Api,
    ) -> Result<Vec<Pipeline>> {
        let command =
            Command::get(format!("/projects/{source_project_id}/pipelines")).arg("ref", branch);
        Ok(api
            .collect_all_pages(&command)?
            .into_iter()
            .map(|info| Pipeline { info })
            .collect())
    }

    pub fn id(&self) -> Result<u64> {
        resource::u64_field(&self.info, "id")
    }

    pub fn sha(&self) -> Result<String> {
        resource::str_field(&self.info, "sha")
    }

    pub fn status(&self) -> Result<String> {
        resource::str_field(&self.info, "status")
    }

    pub fn web_url(&self) -> Result<String> {
        resource::str_field(&self.info, "web_url")
    }
}
