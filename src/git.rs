//! Semantic Git operations on a local clone.
//!
//! Every invocation runs under a wall-clock timeout (the child is killed on
//! expiry) and, when an SSH identity is configured, with a pinned
//! `GIT_SSH_COMMAND` so only that key is ever offered.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

const WAIT_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("{command} exited with status {status}: {stderr}")]
    Failed {
        command: String,
        status: i32,
        stderr: String,
    },
    #[error("{command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("failed to run {command}: {source}")]
    Io {
        command: String,
        source: std::io::Error,
    },
    #[error("{0}")]
    Unclean(String),
}

#[derive(Debug, Clone)]
pub struct Repo {
    remote_url: String,
    local_path: PathBuf,
    ssh_key_file: Option<PathBuf>,
    timeout: Duration,
    reference: Option<String>,
}

impl Repo {
    pub fn new(
        remote_url: String,
        local_path: PathBuf,
        ssh_key_file: Option<PathBuf>,
        timeout: Duration,
        reference: Option<String>,
    ) -> Repo {
        Repo {
            remote_url,
            local_path,
            ssh_key_file,
            timeout,
            reference,
        }
    }

    pub fn remote_url(&self) -> &str {
        &self.remote_url
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn clone_repo(&self) -> Result<(), GitError> {
        let mut args = vec!["clone".to_string(), "--origin=origin".to_string()];
        if let Some(reference) = &self.reference {
            args.push(format!("--reference={reference}"));
        }
        args.push(self.remote_url.clone());
        args.push(self.local_path.display().to_string());
        self.git_full(args, false, &[], None).map(drop)
    }

    pub fn config_user_info(&self, user_name: &str, user_email: &str) -> Result<(), GitError> {
        self.git(["config", "user.email", user_email])?;
        self.git(["config", "user.name", user_name]).map(drop)
    }

    pub fn fetch(&self, remote: &str) -> Result<(), GitError> {
        self.git(["fetch", "--prune", remote]).map(drop)
    }

    /// Upsert `remote` to point at `url`, then fetch it. Used for the
    /// `source` remote of cross-fork merge requests.
    pub fn fetch_from_url(&self, remote: &str, url: &str) -> Result<(), GitError> {
        let _ = self.git(["remote", "rm", remote]);
        self.git(["remote", "add", remote, url])?;
        self.fetch(remote)
    }

    pub fn checkout_branch(&self, branch: &str, start_point: Option<&str>) -> Result<(), GitError> {
        match start_point {
            Some(start) => self.git(["checkout", "-B", branch, start, "--"]).map(drop),
            None => self.git(["checkout", branch, "--"]).map(drop),
        }
    }

    /// Merge `target_branch` into `source_branch` and return the new HEAD.
    /// Leaves `source_branch` checked out. Tries `--abort` on failure.
    pub fn merge(
        &self,
        source_branch: &str,
        target_branch: &str,
        flags: &[&str],
        source_repo_url: Option<&str>,
        local: bool,
    ) -> Result<String, GitError> {
        self.fuse_branch("merge", source_branch, target_branch, flags, source_repo_url, local)
    }

    pub fn fast_forward(
        &self,
        source: &str,
        target: &str,
        source_repo_url: Option<&str>,
        local: bool,
    ) -> Result<String, GitError> {
        self.merge(source, target, &["--ff", "--ff-only"], source_repo_url, local)
    }

    /// Rebase `branch` onto `new_base` and return the new HEAD. Leaves
    /// `branch` checked out. Tries `--abort` on failure.
    pub fn rebase(
        &self,
        branch: &str,
        new_base: &str,
        source_repo_url: Option<&str>,
        local: bool,
    ) -> Result<String, GitError> {
        self.fuse_branch("rebase", branch, new_base, &[], source_repo_url, local)
    }

    fn fuse_branch(
        &self,
        strategy: &str,
        branch: &str,
        target_branch: &str,
        flags: &[&str],
        source_repo_url: Option<&str>,
        local: bool,
    ) -> Result<String, GitError> {
        let target = if local {
            self.checkout_branch(branch, None)?;
            target_branch.to_string()
        } else {
            // Work against fresh tips: refetch origin, pin the branch to the
            // remote it actually lives on, then run the strategy against
            // the remote target.
            self.fetch("origin")?;
            if let Some(url) = source_repo_url {
                self.fetch_from_url("source", url)?;
                self.checkout_branch(branch, Some(&format!("source/{branch}")))?;
            } else {
                self.checkout_branch(branch, Some(&format!("origin/{branch}")))?;
            }
            format!("origin/{target_branch}")
        };

        let mut args = vec![strategy, target.as_str()];
        args.extend_from_slice(flags);
        if let Err(err) = self.git(args) {
            warn!(strategy, "fuse failed, running --abort");
            let _ = self.git([strategy, "--abort"]);
            return Err(err);
        }
        self.get_commit_hash("HEAD")
    }

    /// Rewrite commit messages in `start_commit..branch`, replacing any
    /// existing `trailer_name` lines with one line per value. Empty
    /// `trailer_values` removes the trailer. Returns the new branch head;
    /// on failure the branch is restored to its pre-rewrite state.
    ///
    /// Trees, parents and author/committer identity are preserved, so
    /// re-applying the same rewrite reproduces identical commit ids.
    pub fn tag_with_trailer(
        &self,
        trailer_name: &str,
        trailer_values: &[String],
        branch: &str,
        start_commit: &str,
    ) -> Result<String, GitError> {
        let original_head = self.get_commit_hash(branch)?;
        match self.rewrite_trailers(trailer_name, trailer_values, branch, start_commit) {
            Ok(new_head) => {
                // Messages changed but trees did not; reset the checkout so
                // the worktree and index follow the branch.
                self.checkout_branch(branch, Some(&new_head))?;
                Ok(new_head)
            }
            Err(err) => {
                warn!(branch, "trailer rewrite failed, restoring pre-rewrite head");
                let _ = self.checkout_branch(branch, Some(&original_head));
                Err(err)
            }
        }
    }

    fn rewrite_trailers(
        &self,
        trailer_name: &str,
        trailer_values: &[String],
        branch: &str,
        start_commit: &str,
    ) -> Result<String, GitError> {
        let range = format!("{start_commit}..{branch}");
        let listed = self.git(["rev-list", "--reverse", range.as_str()])?;
        let commits: Vec<String> = listed.split_whitespace().map(str::to_string).collect();
        if commits.is_empty() {
            return Err(GitError::Unclean(format!("no commits to rewrite in {range}")));
        }

        let mut rewritten: HashMap<String, String> = HashMap::new();
        let mut new_head = String::new();
        for commit in &commits {
            let message = self.git(["log", "-1", "--format=%B", commit.as_str()])?;
            let identity = self.git([
                "log",
                "-1",
                "--date=raw",
                "--format=%an%x00%ae%x00%ad%x00%cn%x00%ce%x00%cd",
                commit.as_str(),
            ])?;
            let fields: Vec<&str> = identity.trim_end_matches('\n').split('\0').collect();
            let [author_name, author_email, author_date, committer_name, committer_email, committer_date] =
                fields.as_slice()
            else {
                return Err(GitError::Unclean(format!(
                    "unexpected identity format for commit {commit}"
                )));
            };

            let tree = self.get_commit_hash(&format!("{commit}^{{tree}}"))?;
            let parent_line = self.git(["rev-list", "--parents", "-n", "1", commit.as_str()])?;

            let mut args = vec!["commit-tree".to_string(), tree];
            for parent in parent_line.split_whitespace().skip(1) {
                let parent = rewritten
                    .get(parent)
                    .map(String::as_str)
                    .unwrap_or(parent);
                args.push("-p".to_string());
                args.push(parent.to_string());
            }

            let new_message = rewrite_trailer_block(&message, trailer_name, trailer_values);
            let envs = [
                ("GIT_AUTHOR_NAME", *author_name),
                ("GIT_AUTHOR_EMAIL", *author_email),
                ("GIT_AUTHOR_DATE", *author_date),
                ("GIT_COMMITTER_NAME", *committer_name),
                ("GIT_COMMITTER_EMAIL", *committer_email),
                ("GIT_COMMITTER_DATE", *committer_date),
            ];
            let new_sha = self
                .git_full(args, true, &envs, Some(&new_message))?
                .trim()
                .to_string();
            rewritten.insert(commit.clone(), new_sha.clone());
            new_head = new_sha;
        }

        let branch_ref = format!("refs/heads/{branch}");
        self.git(["update-ref", branch_ref.as_str(), new_head.as_str()])?;
        Ok(new_head)
    }

    /// Push `branch` to its remote. Refuses when the checkout is dirty or
    /// untracked files are present.
    pub fn push(
        &self,
        branch: &str,
        source_repo_url: Option<&str>,
        force: bool,
        skip_ci: bool,
    ) -> Result<(), GitError> {
        self.git(["checkout", branch, "--"])?;
        self.git(["diff-index", "--quiet", "HEAD"])?;
        let untracked = self.git(["ls-files", "--others"])?;
        if !untracked.trim().is_empty() {
            return Err(GitError::Unclean(format!(
                "there are untracked files: {}",
                untracked.trim()
            )));
        }

        let remote = match source_repo_url {
            Some(url) => {
                if self.get_remote_url("source")? != url {
                    return Err(GitError::Unclean(
                        "source remote does not point at the source repo".to_string(),
                    ));
                }
                "source"
            }
            None => "origin",
        };

        let refspec = format!("{branch}:{branch}");
        let mut args = vec!["push"];
        if force {
            args.push("--force");
        }
        if skip_ci {
            args.extend_from_slice(&["-o", "ci.skip"]);
        }
        args.extend_from_slice(&[remote, refspec.as_str()]);
        self.git(args).map(drop)
    }

    pub fn remove_branch(&self, branch: &str) -> Result<(), GitError> {
        self.git(["branch", "-D", branch]).map(drop)
    }

    pub fn get_commit_hash(&self, rev: &str) -> Result<String, GitError> {
        Ok(self.git(["rev-parse", rev])?.trim().to_string())
    }

    pub fn get_remote_url(&self, name: &str) -> Result<String, GitError> {
        let key = format!("remote.{name}.url");
        Ok(self.git(["config", "--get", key.as_str()])?.trim().to_string())
    }

    fn git<I, S>(&self, args: I) -> Result<String, GitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.git_full(args, true, &[], None)
    }

    fn git_full<I, S>(
        &self,
        args: I,
        from_repo: bool,
        extra_env: &[(&str, &str)],
        stdin: Option<&str>,
    ) -> Result<String, GitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<OsString> = args.into_iter().map(|arg| arg.as_ref().to_owned()).collect();
        let display_str = render_command(&args);

        let mut command = Command::new("git");
        if from_repo {
            command.arg("-C").arg(&self.local_path);
        }
        command.args(&args);
        if let Some(key) = &self.ssh_key_file {
            // ssh only really honors the -i identity with IdentitiesOnly and
            // with the user config masked out; otherwise it happily offers
            // agent keys first.
            command.env(
                "GIT_SSH_COMMAND",
                format!(
                    "ssh -o StrictHostKeyChecking=no -F /dev/null -o IdentitiesOnly=yes -i {}",
                    key.display()
                ),
            );
        }
        for (name, value) in extra_env {
            command.env(name, value);
        }

        debug!(command = %display_str, "running");
        run_with_timeout(command, stdin, self.timeout, &display_str)
    }
}

fn render_command(args: &[OsString]) -> String {
    let rendered: Vec<String> = args
        .iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();
    format!("git {}", rendered.join(" "))
}

/// Run the child to completion, killing it when the wall clock runs out.
fn run_with_timeout(
    mut command: Command,
    stdin: Option<&str>,
    timeout: Duration,
    display: &str,
) -> Result<String, GitError> {
    command
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn().map_err(|source| GitError::Io {
        command: display.to_string(),
        source,
    })?;

    if let (Some(input), Some(mut handle)) = (stdin, child.stdin.take()) {
        // Closing the pipe signals EOF; a write error just means the child
        // exited early and will be reported below.
        let _ = handle.write_all(input.as_bytes());
    }

    let stdout_reader = child.stdout.take().map(drain_to_vec);
    let stderr_reader = child.stderr.take().map(drain_to_vec);

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(source) => {
                return Err(GitError::Io {
                    command: display.to_string(),
                    source,
                });
            }
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(GitError::Timeout {
                command: display.to_string(),
                timeout,
            });
        }
        thread::sleep(WAIT_POLL);
    };

    let stdout = stdout_reader.map(collect_drained).unwrap_or_default();
    let stderr = stderr_reader.map(collect_drained).unwrap_or_default();

    if !status.success() {
        return Err(GitError::Failed {
            command: display.to_string(),
            status: status.code().unwrap_or(-1),
            stderr: stderr.trim().to_string(),
        });
    }
    Ok(stdout)
}

fn drain_to_vec(mut reader: impl Read + Send + 'static) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = reader.read_to_end(&mut buffer);
        buffer
    })
}

fn collect_drained(handle: thread::JoinHandle<Vec<u8>>) -> String {
    handle
        .join()
        .map(|buffer| String::from_utf8_lossy(&buffer).into_owned())
        .unwrap_or_default()
}

/// Strip every `name:` line from `message`, trim trailing blank lines, then
/// append one `name: value` line per value, extending an existing trailer
/// paragraph rather than opening a second one.
fn rewrite_trailer_block(message: &str, name: &str, values: &[String]) -> String {
    let mut lines: Vec<&str> = message
        .lines()
        .filter(|line| !is_named_trailer(line, name))
        .collect();
    while lines.last().is_some_and(|line| line.trim().is_empty()) {
        lines.pop();
    }

    let values: Vec<&String> = values.iter().filter(|value| !value.is_empty()).collect();
    let mut out = lines.join("\n");
    if !values.is_empty() {
        let last_paragraph = lines
            .rsplit(|line| line.trim().is_empty())
            .next()
            .unwrap_or(&[]);
        let extends_trailer_block =
            !last_paragraph.is_empty() && last_paragraph.iter().all(|line| is_trailer_line(line));
        if out.is_empty() {
            // A message that was nothing but this trailer.
        } else if extends_trailer_block {
            out.push('\n');
        } else {
            out.push_str("\n\n");
        }
        let trailer_lines: Vec<String> = values
            .iter()
            .map(|value| format!("{name}: {value}"))
            .collect();
        out.push_str(&trailer_lines.join("\n"));
    }
    out.push('\n');
    out
}

fn is_named_trailer(line: &str, name: &str) -> bool {
    line.get(..name.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(name))
        && line[name.len()..].starts_with(':')
}

fn is_trailer_line(line: &str) -> bool {
    line.split_once(": ").is_some_and(|(key, _)| {
        !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}
