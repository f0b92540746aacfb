use super::{ArchiveTool, PrunePolicy, ToolError};
use crate::config::AppConfig;
use crate::utils::format::revision_name;
use crate::utils::fs::is_missing_or_empty;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

/// Runs `bup`, `git` and `du` as subprocesses.
#[derive(Debug, Clone)]
pub struct BupTool {
    bup: String,
    git: String,
    du: String,
}

struct Output {
    stdout: String,
}

impl BupTool {
    pub fn new(bup: impl Into<String>, git: impl Into<String>, du: impl Into<String>) -> Self {
        Self {
            bup: bup.into(),
            git: git.into(),
            du: du.into(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(&config.bup_bin, &config.git_bin, &config.du_bin)
    }

    async fn bup(&self, operation: &'static str, repo: &Path, args: &[&str]) -> Result<Output, ToolError> {
        let mut cmd = Command::new(&self.bup);
        cmd.args(args).env("BUP_DIR", repo);
        execute(operation, &self.bup, args, cmd).await
    }

    async fn git(&self, operation: &'static str, repo: &Path, args: &[&str]) -> Result<Output, ToolError> {
        let mut full = vec!["--no-pager"];
        full.extend_from_slice(args);
        let mut cmd = Command::new(&self.git);
        cmd.args(&full).env("GIT_DIR", repo);
        execute(operation, &self.git, &full, cmd).await
    }
}

async fn execute(
    operation: &'static str,
    program: &str,
    args: &[&str],
    mut cmd: Command,
) -> Result<Output, ToolError> {
    tracing::info!("{} {}", program, args.join(" "));

    let output = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    for line in stdout.lines().chain(stderr.lines()) {
        tracing::debug!("  {}", line);
    }

    if output.status.success() {
        Ok(Output { stdout })
    } else {
        Err(ToolError::classify(operation, output.status.code(), stderr))
    }
}

fn revision_path(branch: &str, revision: &DateTime<Utc>) -> String {
    format!("/{}/{}", branch, revision_name(revision))
}

fn parse_commit_time(output: &str) -> Result<DateTime<Utc>, ToolError> {
    let parse_err = || ToolError::Parse {
        operation: "git log",
        output: output.to_string(),
    };
    let secs: i64 = output.trim().parse().map_err(|_| parse_err())?;
    DateTime::from_timestamp(secs, 0).ok_or_else(parse_err)
}

fn parse_revisions(output: &str) -> Result<Vec<DateTime<Utc>>, ToolError> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| {
            DateTime::parse_from_rfc3339(l)
                .map(|d| d.with_timezone(&Utc))
                .map_err(|_| ToolError::Parse {
                    operation: "git log",
                    output: l.to_string(),
                })
        })
        .collect()
}

fn parse_du(output: &str) -> Result<u64, ToolError> {
    output
        .split_whitespace()
        .next()
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| ToolError::Parse {
            operation: "du",
            output: output.to_string(),
        })
}

#[async_trait]
impl ArchiveTool for BupTool {
    async fn init(&self, repo: &Path) -> Result<(), ToolError> {
        self.bup("bup init", repo, &["init"]).await?;
        Ok(())
    }

    async fn index(&self, repo: &Path, source: &str, exclude: Option<&str>) -> Result<(), ToolError> {
        let mut args = vec!["index", "-v", "-v"];
        if let Some(rx) = exclude {
            args.extend_from_slice(&["--exclude-rx", rx]);
        }
        args.push(source);
        self.bup("bup index", repo, &args).await?;
        Ok(())
    }

    async fn save(&self, repo: &Path, name: &str, sources: &[String]) -> Result<(), ToolError> {
        let name_arg = format!("--name={name}");
        let mut args = vec!["save", "-v", "-v", name_arg.as_str()];
        args.extend(sources.iter().map(String::as_str));
        self.bup("bup save", repo, &args).await?;
        Ok(())
    }

    async fn last_commit_time(&self, repo: &Path, branch: &str) -> Result<DateTime<Utc>, ToolError> {
        let out = self
            .git("git log", repo, &["log", "-1", "--format=%ct", branch])
            .await?;
        parse_commit_time(&out.stdout)
    }

    async fn revisions(&self, repo: &Path, branch: &str) -> Result<Vec<DateTime<Utc>>, ToolError> {
        let out = self
            .git("git log", repo, &["log", "--pretty=%aI", branch])
            .await?;
        parse_revisions(&out.stdout)
    }

    async fn size_bytes(&self, repo: &Path) -> Result<u64, ToolError> {
        let repo_arg = repo.to_string_lossy();
        let args = ["-sb", &*repo_arg];
        let cmd = {
            let mut cmd = Command::new(&self.du);
            cmd.args(args);
            cmd
        };
        let out = execute("du", &self.du, &args, cmd).await?;
        parse_du(&out.stdout)
    }

    async fn remove_revision(
        &self,
        repo: &Path,
        branch: &str,
        revision: &DateTime<Utc>,
    ) -> Result<(), ToolError> {
        let path = revision_path(branch, revision);
        self.bup("bup rm", repo, &["rm", "--unsafe", "-v", path.as_str()])
            .await?;
        Ok(())
    }

    async fn gc(&self, repo: &Path) -> Result<(), ToolError> {
        self.bup("bup gc", repo, &["gc", "--unsafe", "-v"]).await?;
        Ok(())
    }

    async fn prune_older(&self, repo: &Path, policy: &PrunePolicy) -> Result<(), ToolError> {
        let args = [
            "prune-older",
            "--unsafe",
            "--keep-all-for",
            policy.keep_all_for.as_str(),
            "--keep-dailies-for",
            policy.keep_dailies_for.as_str(),
            "--keep-monthlies-for",
            policy.keep_monthlies_for.as_str(),
            "--keep-yearlies-for",
            policy.keep_yearlies_for.as_str(),
        ];
        self.bup("bup prune-older", repo, &args).await?;
        Ok(())
    }

    async fn restore(
        &self,
        repo: &Path,
        branch: &str,
        revision: &DateTime<Utc>,
        subpath: &str,
        out_dir: &Path,
    ) -> Result<(), ToolError> {
        if !is_missing_or_empty(out_dir).await? {
            return Err(ToolError::NotEmpty(out_dir.to_path_buf()));
        }

        let source = format!(
            "{}/{}",
            revision_path(branch, revision),
            subpath.trim_start_matches('/')
        );
        let out_arg = out_dir.to_string_lossy();
        self.bup("bup restore", repo, &["restore", "-C", &*out_arg, source.as_str()])
            .await?;
        Ok(())
    }

    async fn rename_branch(&self, repo: &Path, old: &str, new: &str) -> Result<(), ToolError> {
        self.git("git branch", repo, &["branch", "-m", old, new])
            .await?;
        Ok(())
    }
}
