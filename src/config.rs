use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::interval::IntervalUnion;
use crate::job::{Fusion, MergeJobOptions};
use crate::merge_request::MergeOrder;

#[derive(Debug, Deserialize)]
pub struct Config {
    /// Base URL of the GitLab instance, e.g. `https://gitlab.example.com`.
    pub gitlab_url: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub auth_token_file: Option<PathBuf>,
    #[serde(default)]
    pub use_https: bool,
    #[serde(default)]
    pub ssh_key_file: Option<PathBuf>,
    #[serde(default = "default_match_all")]
    pub project_regexp: String,
    #[serde(default = "default_match_all")]
    pub branch_regexp: String,
    #[serde(default = "default_match_all")]
    pub source_branch_regexp: String,
    #[serde(default = "default_merge_order")]
    pub merge_order: MergeOrder,
    #[serde(default)]
    pub batch: bool,
    #[serde(default = "default_batch_branch_name")]
    pub batch_branch_name: String,
    /// Run a single sweep and exit.
    #[serde(default)]
    pub cli: bool,
    #[serde(default = "default_git_timeout_secs")]
    pub git_timeout_secs: u64,
    #[serde(default)]
    pub git_reference_repo: Option<String>,
    #[serde(default)]
    pub merge: MergeConfig,
}

#[derive(Debug, Deserialize)]
pub struct MergeConfig {
    #[serde(default = "default_fusion")]
    pub fusion: Fusion,
    #[serde(default)]
    pub add_tested: bool,
    #[serde(default)]
    pub add_part_of: bool,
    #[serde(default)]
    pub add_reviewers: bool,
    #[serde(default)]
    pub reapprove: bool,
    #[serde(default)]
    pub approval_timeout_secs: u64,
    #[serde(default = "default_ci_timeout_secs")]
    pub ci_timeout_secs: u64,
    /// Embargo spec, e.g. `"Fri@17:00 UTC-Mon@09:00 UTC"`.
    #[serde(default)]
    pub embargo: Option<String>,
    #[serde(default)]
    pub guarantee_final_pipeline: bool,
    #[serde(default)]
    pub use_no_ff_batches: bool,
    #[serde(default)]
    pub use_merge_commit_batches: bool,
    #[serde(default)]
    pub skip_ci_batches: bool,
}

fn default_match_all() -> String {
    ".*".to_string()
}

fn default_merge_order() -> MergeOrder {
    MergeOrder::CreatedAt
}

fn default_batch_branch_name() -> String {
    "mergetrain-batch".to_string()
}

fn default_git_timeout_secs() -> u64 {
    120
}

fn default_fusion() -> Fusion {
    Fusion::Rebase
}

fn default_ci_timeout_secs() -> u64 {
    15 * 60
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            fusion: default_fusion(),
            add_tested: false,
            add_part_of: false,
            add_reviewers: false,
            reapprove: false,
            approval_timeout_secs: 0,
            ci_timeout_secs: default_ci_timeout_secs(),
            embargo: None,
            guarantee_final_pipeline: false,
            use_no_ff_batches: false,
            use_merge_commit_batches: false,
            skip_ci_batches: false,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// The token itself, or the trimmed contents of `auth_token_file`.
    pub fn auth_token(&self) -> Result<String> {
        if let Some(token) = &self.auth_token {
            return Ok(token.clone());
        }
        let path = self
            .auth_token_file
            .as_ref()
            .context("config needs either auth_token or auth_token_file")?;
        let token = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read auth token from {}", path.display()))?;
        Ok(token.trim().to_string())
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs)
    }

    pub fn merge_opts(&self) -> Result<MergeJobOptions> {
        let embargo = match &self.merge.embargo {
            Some(spec) => IntervalUnion::from_human(spec)
                .with_context(|| format!("bad embargo spec {spec:?}"))?,
            None => IntervalUnion::empty(),
        };
        Ok(MergeJobOptions {
            add_tested: self.merge.add_tested,
            add_part_of: self.merge.add_part_of,
            add_reviewers: self.merge.add_reviewers,
            reapprove: self.merge.reapprove,
            approval_timeout: Duration::from_secs(self.merge.approval_timeout_secs),
            embargo,
            ci_timeout: Duration::from_secs(self.merge.ci_timeout_secs),
            fusion: self.merge.fusion,
            use_no_ff_batches: self.merge.use_no_ff_batches,
            use_merge_commit_batches: self.merge.use_merge_commit_batches,
            skip_ci_batches: self.merge.skip_ci_batches,
            guarantee_final_pipeline: self.merge.guarantee_final_pipeline,
        })
    }
}
