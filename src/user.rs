//! The bot's own identity and user lookups.

use anyhow::{Context, Result};
use serde_json::Value;

use crate::api::{Api, Command, FailureKind, from_singleton_list};
use crate::resource;

#[derive(Debug, Clone)]
pub struct User {
    api: Api,
    info: Value,
}

impl User {
    /// Fetch the token owner. Some releases withhold `is_admin` from
    /// `GET /user`; sudoing to ourselves succeeds exactly when we are
    /// admin, so probe that way when the field is missing.
    pub fn myself(api: &Api) -> Result<User> {
        let mut info = api.call(&Command::get("/user"))?;
        if info.get("is_admin").and_then(Value::as_bool).is_none() {
            let uid = resource::u64_field(&info, "id")?;
            let is_admin = match api.call_sudo(&Command::get("/user"), uid) {
                Ok(_) => true,
                Err(err) if err.kind() == Some(FailureKind::Forbidden) => false,
                Err(err) => return Err(err.into()),
            };
            if let Some(fields) = info.as_object_mut() {
                fields.insert("is_admin".to_string(), Value::Bool(is_admin));
            }
        }
        Ok(User {
            api: api.clone(),
            info,
        })
    }

    pub fn fetch_by_id(user_id: u64, api: &Api) -> Result<User> {
        let info = api.call(&Command::get(format!("/users/{user_id}")))?;
        Ok(User {
            api: api.clone(),
            info,
        })
    }

    pub fn fetch_by_username(username: &str, api: &Api) -> Result<User> {
        let response = api.call(&Command::get("/users").arg("username", username))?;
        let info = from_singleton_list(response)?
            .with_context(|| format!("no user named {username:?}"))?;
        Ok(User {
            api: api.clone(),
            info,
        })
    }

    pub fn id(&self) -> Result<u64> {
        resource::u64_field(&self.info, "id")
    }

    pub fn is_admin(&self) -> bool {
        resource::bool_field_or(&self.info, "is_admin", false)
    }

    pub fn name(&self) -> Result<String> {
        Ok(resource::str_field(&self.info, "name")?.trim().to_string())
    }

    pub fn username(&self) -> Result<String> {
        resource::str_field(&self.info, "username")
    }

    /// Only visible to admins and to the user themselves.
    pub fn email(&self) -> Option<String> {
        resource::opt_str_field(&self.info, "email")
    }

    pub fn state(&self) -> Result<String> {
        resource::str_field(&self.info, "state")
    }

    #[cfg(test)]
    pub(crate) fn for_tests(api: &Api, info: Value) -> User {
        User {
            api: api.clone(),
            info,
        }
    }
}
