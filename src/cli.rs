use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "mergetrain",
    about = "Merge-train bot for self-hosted GitLab",
    version
)]
pub struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "mergetrain.toml")]
    pub config: PathBuf,

    /// Override the GitLab base URL from the config
    #[arg(long)]
    pub gitlab_url: Option<String>,

    /// Read the platform token from this file instead of the config
    #[arg(long)]
    pub auth_token_file: Option<PathBuf>,

    /// Run a single sweep and exit (overrides the config)
    #[arg(long, default_value_t = false)]
    pub cli: bool,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
