//! Extractor boundary
//!
//! The pipeline only sees the [`Extractor`] trait: give it a URL and a
//! timeout, get back an [`ExtractionResult`]. Failures, timeouts included,
//! come back as results with `status = failed`, never as errors.
//!
//! [`CommandExtractor`] runs an external helper program per URL. The helper
//! is started in its own process group; when the call times out or is
//! dropped, the whole group is killed so browsers or other grandchildren
//! cannot outlive it.

use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};
use zen_common::ScrapeStatus;

/// Social profile URLs found on a page
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocialProfiles {
    pub facebook: Option<String>,
    pub instagram: Option<String>,
    pub tiktok: Option<String>,
    pub youtube: Option<String>,
}

impl SocialProfiles {
    /// Incoming non-empty values replace ours; absent ones leave ours alone.
    pub fn merge_from(&mut self, incoming: &SocialProfiles) {
        fn take(slot: &mut Option<String>, value: &Option<String>) {
            if let Some(v) = value.as_deref().filter(|v| !v.is_empty()) {
                *slot = Some(v.to_string());
            }
        }
        take(&mut self.facebook, &incoming.facebook);
        take(&mut self.instagram, &incoming.instagram);
        take(&mut self.tiktok, &incoming.tiktok);
        take(&mut self.youtube, &incoming.youtube);
    }
}

/// Output of one extraction attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub status: ScrapeStatus,
    #[serde(default)]
    pub emails: Vec<String>,
    #[serde(default)]
    pub phones: Vec<String>,
    #[serde(default)]
    pub whatsapp: Vec<String>,
    #[serde(default)]
    pub social: SocialProfiles,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub final_url: Option<String>,
    #[serde(default)]
    pub was_redirected: bool,
    #[serde(default)]
    pub pages_count: i32,
    /// Measured by the caller, not reported by the helper
    #[serde(skip)]
    pub elapsed: Duration,
}

impl ExtractionResult {
    pub fn success() -> Self {
        Self {
            status: ScrapeStatus::Success,
            emails: Vec::new(),
            phones: Vec::new(),
            whatsapp: Vec::new(),
            social: SocialProfiles::default(),
            error: None,
            final_url: None,
            was_redirected: false,
            pages_count: 0,
            elapsed: Duration::ZERO,
        }
    }

    pub fn failed(error: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            status: ScrapeStatus::Failed,
            error: Some(error.into()),
            elapsed,
            ..Self::success()
        }
    }

    pub fn timed_out(timeout: Duration) -> Self {
        Self::failed(format!("extraction timed out after {}s", timeout.as_secs()), timeout)
    }

    pub fn with_emails<I, S>(mut self, emails: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.emails = emails.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }
}

/// Fetches a page and extracts contact data
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Must return within roughly `timeout`. Dropping the returned future
    /// cancels the attempt and releases whatever it started.
    async fn extract(&self, url: &str, timeout: Duration) -> ExtractionResult;
}

/// Sends SIGKILL to a process group when dropped, unless disarmed.
///
/// Disarm once the group leader has been reaped. Until then the leader's pid,
/// and with it the group id, cannot be handed to another process.
struct ProcessGroupGuard {
    pgid: Option<Pid>,
}

impl ProcessGroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pgid: pid.and_then(|p| i32::try_from(p).ok()).map(Pid::from_raw),
        }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            debug!(error = %e, "Extractor pipe read failed");
        }
    }
    buf
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            // ESRCH just means the group is already gone.
            if let Err(err) = killpg(pgid, Signal::SIGKILL) {
                if err != nix::errno::Errno::ESRCH {
                    warn!(pgid = pgid.as_raw(), error = %err, "Failed to kill extractor process group");
                }
            }
        }
    }
}

/// Runs `program [args...] <url> <timeout_secs>` and reads one JSON object
/// from the last non-empty line of its stdout.
#[derive(Debug, Clone)]
pub struct CommandExtractor {
    program: String,
    args: Vec<String>,
}

impl CommandExtractor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build from a program-plus-arguments list.
    pub fn from_command_line(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self::new(program.clone(), args.to_vec()))
    }

    fn parse_output(stdout: &[u8]) -> Result<ExtractionResult, String> {
        let text = String::from_utf8_lossy(stdout);
        let line = text
            .lines()
            .map(str::trim)
            .rfind(|l| !l.is_empty())
            .ok_or_else(|| "extractor produced no output".to_string())?;
        serde_json::from_str(line).map_err(|e| format!("invalid extractor output: {e}"))
    }
}

#[async_trait]
impl Extractor for CommandExtractor {
    async fn extract(&self, url: &str, timeout: Duration) -> ExtractionResult {
        let started = Instant::now();

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(url)
            .arg(timeout.as_secs().max(1).to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ExtractionResult::failed(
                    format!("failed to start extractor {}: {e}", self.program),
                    started.elapsed(),
                )
            },
        };

        // Declared after `child` so it drops first, while the leader is unreaped.
        let mut group = ProcessGroupGuard::new(child.id());
        debug!(url, pid = ?child.id(), "Extractor started");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let run = async { tokio::join!(child.wait(), read_pipe(stdout), read_pipe(stderr)) };

        let (status, stdout, stderr) = match tokio::time::timeout(timeout, run).await {
            Ok((Ok(status), stdout, stderr)) => {
                group.disarm();
                (status, stdout, stderr)
            },
            Ok((Err(e), _, _)) => {
                return ExtractionResult::failed(format!("extractor I/O error: {e}"), started.elapsed())
            },
            Err(_) => return ExtractionResult::timed_out(timeout),
        };

        let elapsed = started.elapsed();

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            let tail = stderr.lines().last().unwrap_or("").trim();
            return ExtractionResult::failed(format!("extractor exited with {}: {}", status, tail), elapsed);
        }

        match Self::parse_output(&stdout) {
            Ok(result) => result.with_elapsed(elapsed),
            Err(e) => ExtractionResult::failed(e, elapsed),
        }
    }
}
