//! Process supervision for one worker session.
//!
//! Per session the supervisor spawns the worker with piped stdout, inserts
//! the `running` row, and starts a dedicated reader task that appends every
//! raw line to the durable log, publishes formatted lines to the hub, and
//! captures the completion event. The supervising task races process exit
//! against the session deadline and the owner's cancellation token, then
//! joins the reader before writing the terminal row — the join is the
//! explicit happens-before between the reader's last write and the result
//! read.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::events::{format_event, parse_event, Completion, WorkerEvent};
use crate::hub::SessionHub;
use crate::sessions::{NewSession, SessionRepo, SessionStatus};
use crate::WardenError;

/// How a supervised process ended up exiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationPath {
    /// Exited within the grace period after the graceful signal.
    Graceful,
    /// Ignored the graceful signal; forcefully killed after the grace
    /// period elapsed.
    Forced,
}

/// The supervisor's view of a spawned worker. Production code wraps
/// [`tokio::process::Child`]; tests inject fakes to exercise the
/// termination escalation without real processes.
#[async_trait]
pub trait WorkerProcess: Send {
    async fn wait(&mut self) -> std::io::Result<ExitStatus>;
    /// Request graceful termination (SIGTERM).
    fn terminate(&mut self) -> std::io::Result<()>;
    /// Force termination (SIGKILL).
    async fn kill(&mut self) -> std::io::Result<()>;
}

pub struct ChildProcess(pub Child);

#[async_trait]
impl WorkerProcess for ChildProcess {
    async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.0.wait().await
    }

    fn terminate(&mut self) -> std::io::Result<()> {
        let Some(pid) = self.0.id() else {
            // Already reaped; nothing to signal.
            return Ok(());
        };
        let rc = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        self.0.kill().await
    }
}

/// Escalating termination: graceful signal, bounded grace, forceful kill.
///
/// Used for both deadline expiry and owner shutdown; only the recorded
/// session status differs between the two.
pub async fn terminate_with_grace<P: WorkerProcess>(
    proc: &mut P,
    grace: Duration,
) -> std::io::Result<(ExitStatus, TerminationPath)> {
    proc.terminate()?;
    match timeout(grace, proc.wait()).await {
        Ok(status) => Ok((status?, TerminationPath::Graceful)),
        Err(_) => {
            proc.kill().await?;
            let status = proc.wait().await?;
            Ok((status, TerminationPath::Forced))
        }
    }
}

/// The worker invocation contract: model selector, instruction source,
/// tool allowlist, machine-readable output mode, and a trailing free-text
/// context block with runtime environment values.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub binary: String,
    pub model: String,
    pub escalation_model: String,
    pub prompt_path: String,
    pub allowed_tools: Vec<String>,
    pub state_dir: String,
    pub results_dir: String,
    pub dry_run: bool,
}

impl WorkerSpec {
    /// Tier 1 runs the standard model; higher tiers escalate.
    pub fn model_for_tier(&self, tier: i64) -> &str {
        if tier >= 2 {
            &self.escalation_model
        } else {
            &self.model
        }
    }

    fn context_block(&self) -> String {
        format!(
            "Runtime context:\n\
             - state dir: {}\n\
             - results dir: {}\n\
             - dry run: {}\n\
             - escalation model: {}",
            self.state_dir, self.results_dir, self.dry_run, self.escalation_model
        )
    }

    fn command(&self, tier: i64) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--model")
            .arg(self.model_for_tier(tier))
            .arg("--prompt-file")
            .arg(&self.prompt_path)
            .arg("--allowed-tools")
            .arg(self.allowed_tools.join(","))
            .arg("--output-format")
            .arg("json-lines")
            .arg(self.context_block())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }
}

/// How long a finished session's replay buffer stays available to late
/// stream subscribers before its hub entry is released.
const REPLAY_RETENTION: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub logs_dir: PathBuf,
    pub session_timeout: Duration,
    pub term_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub tier: i64,
    pub parent_id: Option<i64>,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionOutcome {
    pub session_id: i64,
    pub status: SessionStatus,
}

#[derive(Clone)]
pub struct SessionSupervisor {
    repo: SessionRepo,
    hub: Arc<SessionHub>,
    spec: WorkerSpec,
    cfg: SupervisorConfig,
}

enum ExitKind {
    Natural,
    TimedOut,
    Canceled,
}

impl SessionSupervisor {
    pub fn new(
        repo: SessionRepo,
        hub: Arc<SessionHub>,
        spec: WorkerSpec,
        cfg: SupervisorConfig,
    ) -> Self {
        Self {
            repo,
            hub,
            spec,
            cfg,
        }
    }

    /// Run one session to its terminal state. A failing worker is never
    /// retried here — that is the caller's decision.
    pub async fn run_session(
        &self,
        req: SessionRequest,
        cancel: CancellationToken,
    ) -> Result<SessionOutcome, WardenError> {
        tokio::fs::create_dir_all(&self.cfg.logs_dir).await?;
        let log_path = self.cfg.logs_dir.join(format!(
            "session-{}.log",
            chrono::Utc::now().format("%Y%m%dT%H%M%S%3f")
        ));

        let new = NewSession {
            tier: req.tier,
            model: self.spec.model_for_tier(req.tier).to_string(),
            prompt_path: self.spec.prompt_path.clone(),
            log_path: log_path.to_string_lossy().to_string(),
            parent_id: req.parent_id,
        };

        let mut child = match self.spec.command(req.tier).spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(binary = %self.spec.binary, error = %e, "worker spawn failed");
                let session_id = self.repo.insert_spawn_failure(&new).await?;
                return Ok(SessionOutcome {
                    session_id,
                    status: SessionStatus::Failed,
                });
            }
        };

        let stdout = child.stdout.take();
        let session_id = self.repo.insert_running(&new).await?;
        self.hub.open(session_id);
        info!(
            session_id,
            tier = req.tier,
            model = %new.model,
            parent_id = ?req.parent_id,
            "session started"
        );

        let reader = {
            let hub = Arc::clone(&self.hub);
            let log_path = log_path.clone();
            tokio::spawn(async move {
                read_worker_output(stdout, session_id, hub, log_path).await
            })
        };

        let mut proc = ChildProcess(child);
        let deadline = tokio::time::sleep(self.cfg.session_timeout);
        tokio::pin!(deadline);

        let waited: std::io::Result<(ExitStatus, ExitKind)> = tokio::select! {
            res = proc.wait() => res.map(|s| (s, ExitKind::Natural)),
            () = &mut deadline => {
                warn!(session_id, "session deadline exceeded — escalating termination");
                terminate_with_grace(&mut proc, self.cfg.term_grace)
                    .await
                    .map(|(s, path)| {
                        if path == TerminationPath::Forced {
                            warn!(session_id, "worker ignored graceful signal; killed");
                        }
                        (s, ExitKind::TimedOut)
                    })
            }
            () = cancel.cancelled() => {
                info!(session_id, "shutdown requested — terminating session");
                terminate_with_grace(&mut proc, self.cfg.term_grace)
                    .await
                    .map(|(s, _)| (s, ExitKind::Canceled))
            }
        };

        // The pipe closes at process exit, so the reader drains and
        // finishes; joining it publishes its completion capture to us.
        let completion = match reader.await {
            Ok(c) => c,
            Err(e) => {
                error!(session_id, error = %e, "output reader task failed");
                None
            }
        };

        let (status, exit_code) = match &waited {
            Ok((exit, ExitKind::Natural)) if exit.success() => {
                (SessionStatus::Completed, exit_code_of(exit))
            }
            Ok((exit, ExitKind::Natural)) => (SessionStatus::Failed, exit_code_of(exit)),
            Ok((exit, ExitKind::TimedOut)) => (SessionStatus::TimedOut, exit_code_of(exit)),
            Ok((exit, ExitKind::Canceled)) => (SessionStatus::Canceled, exit_code_of(exit)),
            Err(e) => {
                error!(session_id, error = %e, "failed waiting on worker");
                (SessionStatus::Failed, None)
            }
        };

        if let Err(e) = self
            .repo
            .mark_terminal(session_id, status, exit_code, completion.as_ref())
            .await
        {
            // A gap in persisted history beats crashing the scheduler loop.
            error!(session_id, error = %e, "failed to persist terminal session state");
        }
        self.hub.close(session_id);
        let hub = Arc::clone(&self.hub);
        tokio::spawn(async move {
            tokio::time::sleep(REPLAY_RETENTION).await;
            hub.remove(session_id);
        });

        info!(session_id, %status, ?exit_code, "session finished");
        Ok(SessionOutcome { session_id, status })
    }
}

/// Dedicated per-session output reader. For each line: append raw to the
/// durable log unconditionally, publish the formatted rendering if
/// non-empty, and capture completion metadata. Returns the capture.
async fn read_worker_output(
    stdout: Option<tokio::process::ChildStdout>,
    session_id: i64,
    hub: Arc<SessionHub>,
    log_path: PathBuf,
) -> Option<Completion> {
    let Some(stdout) = stdout else {
        warn!(session_id, "worker stdout not captured");
        return None;
    };

    let mut log = match tokio::fs::File::create(&log_path).await {
        Ok(f) => Some(f),
        Err(e) => {
            warn!(session_id, error = %e, path = %log_path.display(), "cannot open session log");
            None
        }
    };

    let mut lines = BufReader::new(stdout).lines();
    let mut completion: Option<Completion> = None;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(session_id, error = %e, "worker output read error");
                break;
            }
        };

        if let Some(log) = log.as_mut() {
            let mut raw = line.clone();
            raw.push('\n');
            if let Err(e) = log.write_all(raw.as_bytes()).await {
                warn!(session_id, error = %e, "session log write failed; continuing");
            }
        }

        let formatted = match parse_event(&line) {
            Some(WorkerEvent::Completion(c)) => {
                let rendered = format_event(&WorkerEvent::Completion(c.clone()));
                completion = Some(c);
                rendered
            }
            Some(event) => format_event(&event),
            None => line.clone(),
        };
        if !formatted.is_empty() {
            hub.publish(session_id, &formatted);
        }
    }

    if let Some(log) = log.as_mut() {
        if let Err(e) = log.flush().await {
            warn!(session_id, error = %e, "session log flush failed");
        }
    }
    completion
}

#[cfg(unix)]
fn exit_code_of(status: &ExitStatus) -> Option<i64> {
    use std::os::unix::process::ExitStatusExt;
    // Conventional shell encoding for signal deaths: 128 + signal.
    status
        .code()
        .map(i64::from)
        .or_else(|| status.signal().map(|s| 128 + i64::from(s)))
}

#[cfg(not(unix))]
fn exit_code_of(status: &ExitStatus) -> Option<i64> {
    status.code().map(i64::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// Fake worker: optionally ignores the graceful signal.
    struct FakeProcess {
        ignores_term: bool,
        term_sent: Arc<AtomicBool>,
        kill_sent: Arc<AtomicBool>,
    }

    impl FakeProcess {
        fn new(ignores_term: bool) -> Self {
            Self {
                ignores_term,
                term_sent: Arc::new(AtomicBool::new(false)),
                kill_sent: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait]
    impl WorkerProcess for FakeProcess {
        async fn wait(&mut self) -> std::io::Result<ExitStatus> {
            if self.kill_sent.load(Ordering::SeqCst) {
                return Ok(ExitStatus::from_raw(9)); // killed by SIGKILL
            }
            if self.term_sent.load(Ordering::SeqCst) && !self.ignores_term {
                return Ok(ExitStatus::from_raw(15)); // exited on SIGTERM
            }
            // Alive until signaled into a terminal state.
            std::future::pending().await
        }

        fn terminate(&mut self) -> std::io::Result<()> {
            self.term_sent.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn kill(&mut self) -> std::io::Result<()> {
            self.kill_sent.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn cooperative_worker_exits_on_graceful_signal() {
        let mut proc = FakeProcess::new(false);
        let (status, path) = terminate_with_grace(&mut proc, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(path, TerminationPath::Graceful);
        assert!(proc.term_sent.load(Ordering::SeqCst));
        assert!(!proc.kill_sent.load(Ordering::SeqCst));
        assert_eq!(status.signal(), Some(15));
    }

    #[tokio::test]
    async fn stubborn_worker_is_force_killed_after_grace() {
        let mut proc = FakeProcess::new(true);
        let (status, path) = terminate_with_grace(&mut proc, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(path, TerminationPath::Forced);
        assert!(proc.term_sent.load(Ordering::SeqCst));
        assert!(proc.kill_sent.load(Ordering::SeqCst));
        assert_eq!(status.signal(), Some(9));
    }

    #[test]
    fn signal_deaths_map_to_conventional_exit_codes() {
        assert_eq!(exit_code_of(&ExitStatus::from_raw(9)), Some(137));
        assert_eq!(exit_code_of(&ExitStatus::from_raw(15)), Some(143));
        assert_eq!(exit_code_of(&ExitStatus::from_raw(3 << 8)), Some(3));
    }

    #[test]
    fn tier_selects_model() {
        let spec = WorkerSpec {
            binary: "worker".into(),
            model: "standard".into(),
            escalation_model: "large".into(),
            prompt_path: "p.md".into(),
            allowed_tools: vec!["Bash".into()],
            state_dir: "s".into(),
            results_dir: "r".into(),
            dry_run: false,
        };
        assert_eq!(spec.model_for_tier(1), "standard");
        assert_eq!(spec.model_for_tier(2), "large");
        assert_eq!(spec.model_for_tier(3), "large");
    }
}
