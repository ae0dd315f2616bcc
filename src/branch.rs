//! Remote branch lookup, mainly for the `protected` flag.

use anyhow::Result;
use serde_json::Value;

use crate::api::{Api, Command};
use crate::resource;

#[derive(Debug, Clone)]
pub struct Branch {
    info: Value,
}

impl Branch {
    pub fn fetch_by_name(project_id: u64, branch: &str, api: &Api) -> Result<Branch> {
        let info = api.call(&Command::get(format!(
            "/projects/{project_id}/repository/branches/{branch}"
        )))?;
        Ok(Branch { info })
    }

    /// Delete a remote branch, e.g. a spent integration branch.
    pub fn delete_by_name(project_id: u64, branch: &str, api: &Api) -> Result<()> {
        api.call(&Command::delete(format!(
            "/projects/{project_id}/repository/branches/{branch}"
        )))?;
        Ok(())
    }

    pub fn name(&self) -> Result<String> {
        resource::str_field(&self.info, "name")
    }

    pub fn protected(&self) -> bool {
        resource::bool_field_or(&self.info, "protected", false)
    }
}
