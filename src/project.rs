//! Project projection: discovery, permissions, merge policy knobs.

use anyhow::{Context, Result, bail};
use serde_json::{Value, json};
use tracing::warn;

use crate::api::{Api, Command};
use crate::resource;

#[derive(Debug, Clone)]
pub struct Project {
    api: Api,
    info: Value,
}

impl Project {
    pub fn fetch_by_id(project_id: u64, api: &Api) -> Result<Project> {
        let info = api.call(&Command::get(format!("/projects/{project_id}")))?;
        Ok(Project {
            api: api.clone(),
            info,
        })
    }

    /// All projects the bot is a member of (merge requests enabled, not
    /// archived). Servers from 11.2 on support `min_access_level`, which is
    /// the reliable way to scope membership in nested groups; on older
    /// servers fall back to filtering out projects with no reported
    /// permissions at all.
    pub fn fetch_all_mine(api: &Api) -> Result<Vec<Project>> {
        let mut command = Command::get("/projects")
            .arg("membership", true)
            .arg("with_merge_requests_enabled", true)
            .arg("archived", false);
        let use_min_access_level = api.version()?.has_min_access_level();
        if use_min_access_level {
            command = command.arg("min_access_level", AccessLevel::Developer.as_u64());
        }

        let mut projects = Vec::new();
        for mut info in api.collect_all_pages(&command)? {
            if use_min_access_level {
                // The listing guaranteed at least developer access, so keep
                // that as a fallback when the server reports no permissions
                // (known to happen after subgroup moves).
                if let Some(permissions) =
                    info.get_mut("permissions").and_then(Value::as_object_mut)
                {
                    permissions.insert(
                        "fallback".to_string(),
                        json!({"access_level": AccessLevel::Developer.as_u64()}),
                    );
                }
            } else if !project_reports_permissions(&info) {
                warn!(
                    project = %resource::opt_str_field(&info, "path_with_namespace")
                        .unwrap_or_default(),
                    "ignoring project with no reported user permissions"
                );
                continue;
            }
            projects.push(Project {
                api: api.clone(),
                info,
            });
        }
        Ok(projects)
    }

    pub fn id(&self) -> Result<u64> {
        resource::u64_field(&self.info, "id")
    }

    pub fn default_branch(&self) -> Result<String> {
        resource::str_field(&self.info, "default_branch")
    }

    pub fn path_with_namespace(&self) -> Result<String> {
        resource::str_field(&self.info, "path_with_namespace")
    }

    pub fn ssh_url_to_repo(&self) -> Result<String> {
        resource::str_field(&self.info, "ssh_url_to_repo")
    }

    pub fn http_url_to_repo(&self) -> Result<String> {
        resource::str_field(&self.info, "http_url_to_repo")
    }

    pub fn only_allow_merge_if_pipeline_succeeds(&self) -> Result<bool> {
        resource::bool_field(&self.info, "only_allow_merge_if_pipeline_succeeds")
    }

    pub fn only_allow_merge_if_all_discussions_are_resolved(&self) -> Result<bool> {
        resource::bool_field(&self.info, "only_allow_merge_if_all_discussions_are_resolved")
    }

    pub fn approvals_required(&self) -> u64 {
        self.info
            .get("approvals_before_merge")
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    pub fn squash_option(&self) -> Result<SquashOption> {
        SquashOption::parse(&resource::str_field(&self.info, "squash_option")?)
    }

    /// Effective access: project access, else group access, else the
    /// fallback injected by [`Project::fetch_all_mine`].
    pub fn access_level(&self) -> Result<AccessLevel> {
        let permissions = self
            .info
            .get("permissions")
            .context("project snapshot has no permissions")?;
        let effective = ["project_access", "group_access", "fallback"]
            .iter()
            .find_map(|key| permissions.get(*key).filter(|access| !access.is_null()))
            .context("server provided no user permissions on project")?;
        AccessLevel::from_raw(resource::u64_field(effective, "access_level")?)
    }
}

fn project_reports_permissions(info: &Value) -> bool {
    let Some(permissions) = info.get("permissions") else {
        return false;
    };
    ["project_access", "group_access"]
        .iter()
        .any(|key| permissions.get(*key).is_some_and(|access| !access.is_null()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AccessLevel {
    None,
    Minimal,
    Guest,
    Reporter,
    Developer,
    Maintainer,
    Owner,
}

impl AccessLevel {
    pub fn from_raw(raw: u64) -> Result<AccessLevel> {
        Ok(match raw {
            0 => AccessLevel::None,
            5 => AccessLevel::Minimal,
            10 => AccessLevel::Guest,
            20 => AccessLevel::Reporter,
            30 => AccessLevel::Developer,
            40 => AccessLevel::Maintainer,
            50 => AccessLevel::Owner,
            other => bail!("unknown access level: {other}"),
        })
    }

    pub fn as_u64(self) -> u64 {
        match self {
            AccessLevel::None => 0,
            AccessLevel::Minimal => 5,
            AccessLevel::Guest => 10,
            AccessLevel::Reporter => 20,
            AccessLevel::Developer => 30,
            AccessLevel::Maintainer => 40,
            AccessLevel::Owner => 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SquashOption {
    Always,
    Never,
    DefaultOn,
    DefaultOff,
}

impl SquashOption {
    fn parse(raw: &str) -> Result<SquashOption> {
        Ok(match raw {
            "always" => SquashOption::Always,
            "never" => SquashOption::Never,
            "default_on" => SquashOption::DefaultOn,
            "default_off" => SquashOption::DefaultOff,
            other => bail!("unknown squash option: {other:?}"),
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub(crate) fn project_info(id: u64) -> Value {
        json!({
            "id": id,
            "default_branch": "master",
            "path_with_namespace": "group/repo",
            "ssh_url_to_repo": "git@gitlab.example.com:group/repo.git",
            "http_url_to_repo": "https://gitlab.example.com/group/repo.git",
            "only_allow_merge_if_pipeline_succeeds": true,
            "only_allow_merge_if_all_discussions_are_resolved": false,
            "approvals_before_merge": 1,
            "squash_option": "default_off",
            "permissions": {
                "project_access": {"access_level": 40},
                "group_access": null,
            },
        })
    }

    pub(crate) fn project_over(api: &Api, info: Value) -> Project {
        Project {
            api: api.clone(),
            info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{project_info, project_over};
    use super::*;
    use crate::api::testing::{MockTransport, api_at_version, api_over};

    #[test]
    fn typed_accessors_project_the_snapshot() {
        let transport = MockTransport::new();
        let project = project_over(&api_over(&transport), project_info(1234));
        assert_eq!(project.id().unwrap(), 1234);
        assert_eq!(project.default_branch().unwrap(), "master");
        assert_eq!(project.path_with_namespace().unwrap(), "group/repo");
        assert!(project.only_allow_merge_if_pipeline_succeeds().unwrap());
        assert_eq!(project.approvals_required(), 1);
        assert_eq!(project.squash_option().unwrap(), SquashOption::DefaultOff);
        assert_eq!(project.access_level().unwrap(), AccessLevel::Maintainer);
    }

    #[test]
    fn access_level_falls_back_to_group_access() {
        let transport = MockTransport::new();
        let mut info = project_info(1);
        info["permissions"] = serde_json::json!({
            "project_access": null,
            "group_access": {"access_level": 20},
        });
        let project = project_over(&api_over(&transport), info);
        assert_eq!(project.access_level().unwrap(), AccessLevel::Reporter);
        assert!(project.access_level().unwrap() < AccessLevel::Developer);
    }

    #[test]
    fn fetch_all_mine_requests_min_access_level_on_recent_servers() {
        let transport = MockTransport::new()
            .reply(200, &format!("[{}]", project_info(1)))
            .reply(200, "[]");
        let api = api_at_version(&transport, "11.2.0");
        let projects = Project::fetch_all_mine(&api).unwrap();
        assert_eq!(projects.len(), 1);

        let call = &transport.calls()[0];
        assert_eq!(call.query_value("membership"), Some("true"));
        assert_eq!(call.query_value("archived"), Some("false"));
        assert_eq!(call.query_value("min_access_level"), Some("30"));
    }

    #[test]
    fn fetch_all_mine_injects_fallback_permissions() {
        let mut info = project_info(1);
        info["permissions"] = serde_json::json!({
            "project_access": null,
            "group_access": null,
        });
        let transport = MockTransport::new()
            .reply(200, &format!("[{info}]"))
            .reply(200, "[]");
        let api = api_at_version(&transport, "13.2.0");
        let projects = Project::fetch_all_mine(&api).unwrap();
        assert_eq!(
            projects[0].access_level().unwrap(),
            AccessLevel::Developer
        );
    }

    #[test]
    fn fetch_all_mine_drops_permissionless_projects_on_old_servers() {
        let mut broken = project_info(2);
        broken["permissions"] = serde_json::json!({
            "project_access": null,
            "group_access": null,
        });
        let transport = MockTransport::new()
            .reply(200, &format!("[{}, {broken}]", project_info(1)))
            .reply(200, "[]");
        let api = api_at_version(&transport, "9.4.0");
        let projects = Project::fetch_all_mine(&api).unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].id().unwrap(), 1);
        assert_eq!(transport.calls()[0].query_value("min_access_level"), None);
    }
}
