mod cli;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use regex::Regex;
use tracing::info;

use mergetrain::api::{Api, UreqTransport};
use mergetrain::bot::{Bot, BotConfig};
use mergetrain::config::Config;
use mergetrain::repo_pool::{CloneStrategy, RepoPool};
use mergetrain::user::User;

use cli::Cli;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "mergetrain=info",
        1 => "mergetrain=debug",
        _ => "mergetrain=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut config = Config::load(&cli.config)?;
    if let Some(token_file) = cli.auth_token_file.clone() {
        config.auth_token = None;
        config.auth_token_file = Some(token_file);
    }
    let gitlab_url = cli.gitlab_url.as_deref().unwrap_or(&config.gitlab_url);
    let auth_token = config.auth_token()?;

    let api = Api::new(gitlab_url, &auth_token, Arc::new(UreqTransport::new()));
    let version = api.version()?;
    info!(version = %version, url = gitlab_url, "connected");

    let user = User::myself(&api)?;
    info!(
        user = %user.username()?,
        admin = user.is_admin(),
        "authenticated"
    );

    let strategy = if config.use_https {
        CloneStrategy::Https {
            username: user.username()?,
            auth_token: auth_token.clone(),
        }
    } else {
        CloneStrategy::Ssh {
            key_file: config.ssh_key_file.clone(),
        }
    };
    let mut repo_pool = RepoPool::new(
        strategy,
        &user,
        config.git_timeout(),
        config.git_reference_repo.clone(),
    )?;

    let bot_config = BotConfig {
        project_regexp: compile_filter("project_regexp", &config.project_regexp)?,
        branch_regexp: compile_filter("branch_regexp", &config.branch_regexp)?,
        source_branch_regexp: compile_filter("source_branch_regexp", &config.source_branch_regexp)?,
        merge_order: config.merge_order,
        merge_opts: config.merge_opts()?,
        batch: config.batch,
        batch_branch_name: config.batch_branch_name.clone(),
        cli: config.cli || cli.cli,
    };

    let bot = Bot::new(api, user, bot_config)?;
    bot.start(&mut repo_pool)
}

fn compile_filter(name: &str, pattern: &str) -> Result<Regex> {
    Regex::new(pattern).with_context(|| format!("bad {name}: {pattern:?}"))
}
