//! Approval state for one merge request.
//!
//! Refetched before every gate and after every rewrite that may have
//! invalidated it: a force-push can drop approvals depending on server
//! settings, and [`Approvals::reapprove`] puts them back by impersonating
//! each original approver.

use anyhow::Result;
use serde_json::{Value, json};

use crate::api::{Api, Command};
use crate::resource;

#[derive(Debug, Clone)]
pub struct Approvals {
    api: Api,
    info: Value,
}

impl Approvals {
    pub(crate) fn new(api: &Api, id: u64, iid: u64, project_id: u64) -> Approvals {
        Approvals {
            api: api.clone(),
            info: json!({"id": id, "iid": iid, "project_id": project_id}),
        }
    }

    pub fn refetch_info(&mut self) -> Result<()> {
        let version = self.api.version()?;
        if version.has_approvals() {
            let mr_ref = if version.mr_endpoints_use_iid() {
                self.iid()?
            } else {
                self.id()?
            };
            self.info = self.api.call(&Command::get(format!(
                "/projects/{}/merge_requests/{}/approvals",
                self.project_id()?,
                mr_ref
            )))?;
        } else if let Some(fields) = self.info.as_object_mut() {
            // No approvals API on this server; synthesize a view that is
            // always sufficient.
            fields.insert("approvals_left".to_string(), json!(0));
            fields.insert("approved_by".to_string(), json!([]));
        }
        Ok(())
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

    pub fn approvals_left(&self) -> u64 {
        self.info
            .get("approvals_left")
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    pub fn sufficient(&self) -> bool {
        self.approvals_left() == 0
    }

    pub fn approver_usernames(&self) -> Vec<String> {
        self.approver_field("username")
    }

    pub fn approver_ids(&self) -> Vec<u64> {
        self.approved_by()
            .iter()
            .filter_map(|who| who.get("user").and_then(|user| user.get("id")))
            .filter_map(Value::as_u64)
            .collect()
    }

    /// Re-approve as each original approver, impersonated via `sudo`.
    /// Approving is not idempotent, so callers must first make sure the
    /// approvals have actually been reset.
    pub fn reapprove(&self) -> Result<()> {
        let version = self.api.version()?;
        let mr_ref = if version.mr_endpoints_use_iid() {
            self.iid()?
        } else {
            self.id()?
        };
        let approve = Command::post(format!(
            "/projects/{}/merge_requests/{}/approve",
            self.project_id()?,
            mr_ref
        ));
        for uid in self.approver_ids() {
            self.api.call_sudo(&approve, uid)?;
        }
        Ok(())
    }

    fn approved_by(&self) -> &[Value] {
        self.info
            .get("approved_by")
            .and_then(Value::as_array)
            .map_or(&[], Vec::as_slice)
    }

    fn approver_field(&self, field: &str) -> Vec<String> {
        self.approved_by()
            .iter()
            .filter_map(|who| who.get("user").and_then(|user| user.get(field)))
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()
    }
}
