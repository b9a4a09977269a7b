//! tb_safecmd
//!
//! The only place in the workspace allowed to spawn an external process.
//! Every invocation goes through an argument array — never a shell string —
//! and every free-form argument (repo URLs, branch names) is validated or
//! stripped before it reaches `tokio::process::Command`.
//!
//! Grounded in the same shape as a CLI wrapper: build the command, run it
//! with a wall-clock timeout, capture stdout/stderr/exit status, classify
//! the result into a `FaultKind` rather than handing the caller a raw
//! `ExitStatus`.

use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tb_common::FaultKind;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum SafeCmdError {
    #[error("invalid repo spec: {0}")]
    InvalidRepoSpec(String),
    #[error("io error spawning command: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
    #[error("command failed: {fault:?} (exit status {status:?}): {stderr_tail}")]
    Failed { fault: FaultKind, status: Option<i32>, stderr_tail: String },
    #[error("clone exceeded size quota: {actual_bytes} > {limit_bytes}")]
    CloneTooLarge { actual_bytes: u64, limit_bytes: u64 },
}

fn repo_spec_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.\-]+/[A-Za-z0-9_.\-]+$").unwrap())
}

/// Validate an `owner/repo` spec. Rejects anything with path separators
/// beyond the single required slash, shell metacharacters, or `..`.
pub fn validate_repo_spec(spec: &str) -> Result<(), SafeCmdError> {
    if !repo_spec_re().is_match(spec) || spec.contains("..") {
        return Err(SafeCmdError::InvalidRepoSpec(spec.to_string()));
    }
    Ok(())
}

/// Strip shell metacharacters from a free-form argument (branch names,
/// commit refs) and truncate to a sane length. This is defense in depth —
/// we never pass through a shell — but a stray `$()`/backtick in a ref
/// name still has no business reaching git.
pub fn sanitize_free_form_arg(raw: &str, max_len: usize) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| {
            !matches!(
                c,
                ';' | '|' | '&' | '`' | '$' | '(' | ')' | '{' | '}' | '<' | '>' | '\\' | '\n' | '\r'
            )
        })
        .collect();
    cleaned.chars().take(max_len).collect()
}

#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub status_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

/// Run `program` with `args` (no shell, no env inheritance of secrets
/// beyond what the caller explicitly passes via `envs`), enforcing
/// `timeout`. stdout/stderr are captured and truncated to avoid pulling
/// enormous blobs into memory for a misbehaving subprocess.
const MAX_CAPTURED_OUTPUT_BYTES: usize = 1 << 20;

pub async fn run(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
    envs: &[(&str, &str)],
    timeout: Duration,
) -> Result<CommandOutcome, SafeCmdError> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.env_clear();
    for (k, v) in envs {
        cmd.env(k, v);
    }
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    cmd.kill_on_drop(true);

    let started = Instant::now();
    let mut child = cmd.spawn()?;

    let mut stdout_pipe = child.stdout.take().expect("stdout was piped");
    let mut stderr_pipe = child.stderr.take().expect("stderr was piped");

    let read_stdout = async {
        let mut buf = Vec::new();
        let _ = stdout_pipe.take(MAX_CAPTURED_OUTPUT_BYTES as u64).read_to_end(&mut buf).await;
        buf
    };
    let read_stderr = async {
        let mut buf = Vec::new();
        let _ = stderr_pipe.take(MAX_CAPTURED_OUTPUT_BYTES as u64).read_to_end(&mut buf).await;
        buf
    };

    let wait_all = async {
        let (stdout_buf, stderr_buf) = tokio::join!(read_stdout, read_stderr);
        let status = child.wait().await;
        (status, stdout_buf, stderr_buf)
    };

    let result = tokio::time::timeout(timeout, wait_all).await;
    let elapsed = started.elapsed();

    let (status, stdout_buf, stderr_buf) = match result {
        Ok(v) => v,
        Err(_) => return Err(SafeCmdError::Timeout(timeout)),
    };
    let status = status?;

    Ok(CommandOutcome {
        status_code: status.code(),
        stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
        stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
        elapsed,
    })
}

/// Map a failed `CommandOutcome` to a `FaultKind`. Git and `gh`-style CLIs
/// don't have a stable exit-code contract, so classification leans on
/// stderr phrasing — best-effort, never load-bearing for security.
pub fn classify_failure(outcome: &CommandOutcome) -> FaultKind {
    let stderr_lower = outcome.stderr.to_lowercase();
    if stderr_lower.contains("authentication failed") || stderr_lower.contains("401") {
        FaultKind::Authentication
    } else if stderr_lower.contains("rate limit") || stderr_lower.contains("429") {
        FaultKind::RateLimit { retry_after_secs: 60 }
    } else if stderr_lower.contains("not found") || stderr_lower.contains("404") {
        FaultKind::NotFound
    } else if stderr_lower.contains("permission denied") || stderr_lower.contains("403") {
        FaultKind::Permission
    } else {
        FaultKind::NetworkError
    }
}

fn stderr_tail(outcome: &CommandOutcome, n: usize) -> String {
    let lines: Vec<&str> = outcome.stderr.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

/// Options for `clone_repo`. `depth` defaults to a shallow clone (spec
/// section 4: clones should be cheap); callers analyzing history can opt
/// out with `depth: None`.
#[derive(Debug, Clone)]
pub struct CloneOptions {
    pub depth: Option<u32>,
    pub timeout: Duration,
    pub size_quota_bytes: u64,
}

impl Default for CloneOptions {
    fn default() -> Self {
        Self { depth: Some(1), timeout: Duration::from_secs(60), size_quota_bytes: 500 * 1024 * 1024 }
    }
}

/// Clone `clone_url` into `dest`. Hooks are disabled
/// (`-c core.hooksPath=/dev/null`) so a malicious repo can't execute code
/// via a post-checkout hook. After cloning, the directory is measured
/// against `size_quota_bytes`; an oversized clone is deleted and rejected
/// rather than kept around for the caller to trip over later.
pub async fn clone_repo(
    clone_url: &str,
    dest: &Path,
    opts: &CloneOptions,
) -> Result<(), SafeCmdError> {
    let mut args: Vec<&str> = vec!["clone", "-c", "core.hooksPath=/dev/null", "--no-tags"];
    let depth_arg;
    if let Some(depth) = opts.depth {
        depth_arg = depth.to_string();
        args.push("--depth");
        args.push(&depth_arg);
    }
    let dest_str = dest.to_string_lossy().into_owned();
    args.push(clone_url);
    args.push(&dest_str);

    let outcome = run("git", &args, None, &[], opts.timeout).await?;
    if outcome.status_code != Some(0) {
        let fault = classify_failure(&outcome);
        return Err(SafeCmdError::Failed {
            fault,
            status: outcome.status_code,
            stderr_tail: stderr_tail(&outcome, 5),
        });
    }

    let size = directory_size(dest)?;
    if size > opts.size_quota_bytes {
        let _ = std::fs::remove_dir_all(dest);
        return Err(SafeCmdError::CloneTooLarge { actual_bytes: size, limit_bytes: opts.size_quota_bytes });
    }

    Ok(())
}

fn directory_size(path: &Path) -> Result<u64, SafeCmdError> {
    let mut total = 0u64;
    let mut stack: Vec<PathBuf> = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                total += meta.len();
            }
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_owner_repo() {
        assert!(validate_repo_spec("octocat/hello-world").is_ok());
    }

    #[test]
    fn rejects_path_traversal_in_repo_spec() {
        assert!(validate_repo_spec("../../etc/passwd").is_err());
        assert!(validate_repo_spec("octocat/../../x").is_err());
    }

    #[test]
    fn rejects_shell_metacharacters_in_repo_spec() {
        assert!(validate_repo_spec("octocat/hello; rm -rf /").is_err());
        assert!(validate_repo_spec("octocat/$(whoami)").is_err());
    }

    #[test]
    fn sanitize_strips_metacharacters_and_truncates() {
        let out = sanitize_free_form_arg("feature/$(rm -rf /)-branch", 12);
        assert!(!out.contains('$'));
        assert!(!out.contains('('));
        assert_eq!(out.len(), 12);
    }

    #[test]
    fn classify_failure_maps_auth_errors() {
        let outcome = CommandOutcome {
            status_code: Some(128),
            stdout: String::new(),
            stderr: "fatal: Authentication failed for 'https://...'".into(),
            elapsed: Duration::from_millis(5),
        };
        assert_eq!(classify_failure(&outcome), FaultKind::Authentication);
    }

    #[tokio::test]
    async fn run_captures_exit_status_and_stdout() {
        let outcome = run("echo", &["hello"], None, &[], Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome.status_code, Some(0));
        assert!(outcome.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn run_enforces_timeout() {
        let result = run("sleep", &["5"], None, &[], Duration::from_millis(50)).await;
        assert!(matches!(result, Err(SafeCmdError::Timeout(_))));
    }
}
