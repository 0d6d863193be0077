use std::{
    fs,
    io::Read,
    path::Path,
    process::{Child, Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

use super::{DownloadBackend, ModelSource};

const HUB_GIT_ENDPOINT: &str = "huggingface.co";

/// Transfer rate, in bytes per second, below which git counts as stalled.
const LOW_SPEED_LIMIT: u64 = 1024;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Shallow `git clone` of a hub repository. Needs `git` and `git-lfs`.
///
/// git aborts a transfer that stays below [`LOW_SPEED_LIMIT`] for
/// `stall_timeout`, and the process is killed once `transfer_timeout` passes.
pub struct ShallowClone {
    token: Option<String>,
    stall_timeout: Duration,
    transfer_timeout: Duration,
}

impl ShallowClone {
    pub fn new(token: Option<String>, stall_timeout: Duration, transfer_timeout: Duration) -> Self {
        Self {
            token,
            stall_timeout,
            transfer_timeout,
        }
    }

    fn clone_url(&self, repo_id: &str) -> String {
        match &self.token {
            Some(token) => format!("https://user:{token}@{HUB_GIT_ENDPOINT}/{repo_id}"),
            None => format!("https://{HUB_GIT_ENDPOINT}/{repo_id}"),
        }
    }

    fn redact(&self, text: &str) -> String {
        match &self.token {
            Some(token) if !token.is_empty() => text.replace(token.as_str(), "***"),
            _ => text.to_string(),
        }
    }
}

impl DownloadBackend for ShallowClone {
    fn name(&self) -> &str {
        "shallow-clone"
    }

    fn supports(&self, source: &ModelSource) -> bool {
        matches!(source, ModelSource::Hub { .. })
    }

    fn fetch(&self, source: &ModelSource, staging: &Path) -> Result<()> {
        let ModelSource::Hub { repo_id, revision } = source else {
            bail!("shallow clone cannot fetch {source:?}");
        };

        let mut command = Command::new("git");
        command
            .arg("-c")
            .arg(format!("http.lowSpeedLimit={LOW_SPEED_LIMIT}"))
            .arg("-c")
            .arg(format!("http.lowSpeedTime={}", self.stall_timeout.as_secs().max(1)))
            .arg("clone")
            .arg("--depth")
            .arg("1")
            // Fail instead of waiting on a credential prompt.
            .env("GIT_TERMINAL_PROMPT", "0");
        if let Some(revision) = revision {
            command.arg("--branch").arg(revision);
        }
        command.arg(self.clone_url(repo_id)).arg(staging);

        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        debug!("cloning {repo_id} into {staging:?}");
        let child = command.spawn().context("failed to run git")?;
        let (status, stderr) = wait_with_deadline(child, self.transfer_timeout)
            .with_context(|| format!("git clone of {repo_id} did not finish"))?;
        if !status.success() {
            bail!(
                "git clone of {repo_id} exited with {status}: {}",
                self.redact(stderr.trim())
            );
        }

        let git_dir = staging.join(".git");
        if git_dir.exists() {
            fs::remove_dir_all(&git_dir)
                .with_context(|| format!("failed to remove {git_dir:?}"))?;
        }
        Ok(())
    }
}

/// Waits for `child`, killing it once `timeout` has passed. Returns the exit
/// status and whatever the child wrote to stderr.
fn wait_with_deadline(mut child: Child, timeout: Duration) -> Result<(ExitStatus, String)> {
    // Drained on its own thread so a chatty child never blocks on a full pipe.
    let stderr = child.stderr.take().map(|mut pipe| {
        thread::spawn(move || {
            let mut text = String::new();
            let _ = pipe.read_to_string(&mut text);
            text
        })
    });
    let collect = |reader: Option<thread::JoinHandle<String>>| {
        reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default()
    };

    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait().context("failed to wait for child process")? {
            return Ok((status, collect(stderr)));
        }
        if started.elapsed() >= timeout {
            warn!("killing child process after {}s", timeout.as_secs());
            if let Err(e) = child.kill() {
                warn!("failed to kill child process: {e}");
            }
            if let Err(e) = child.wait() {
                warn!("failed to reap child process: {e}");
            }
            collect(stderr);
            bail!("timed out after {}s", timeout.as_secs());
        }
        thread::sleep(POLL_INTERVAL);
    }
}
