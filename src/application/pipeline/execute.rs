//! Supervision of the external render process.
//!
//! The child's stdout/stderr are pumped into a typed event stream by
//! dedicated reader tasks; a waiter task owns the process handle and
//! reports the exit status as a final event. The consuming loop classifies
//! stdout lines into progress milestones, scans stderr for failure
//! keywords, and enforces the configured wall-clock bound by killing the
//! child outright when it expires.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::application::progress::ProgressSender;

/// One observation from the supervised process.
#[derive(Debug)]
enum RawEvent {
    Stdout(String),
    Stderr(String),
    Exited(ExitStatus),
}

/// Stdout milestone markers mapped to fixed progress points. A lookup
/// table, not a parser: lines matching nothing are logged and ignored.
struct Milestone {
    marker: &'static str,
    percent: u8,
    status: &'static str,
}

const MILESTONES: &[Milestone] = &[
    Milestone {
        marker: "Writing",
        percent: 60,
        status: "Writing video frames",
    },
    Milestone {
        marker: "Rendered",
        percent: 80,
        status: "Rendering complete",
    },
];

/// Case-insensitive stderr substrings that mark a run as failed even when
/// the exit code is zero; this class of toolchain does not reliably report
/// failure through its exit status.
const ERROR_KEYWORDS: &[&str] = &["error", "exception"];

/// Fully-resolved invocation of the render toolchain for one job.
#[derive(Debug, Clone)]
pub struct RenderCommand {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub timeout: Duration,
}

/// How the supervised run ended.
#[derive(Debug)]
pub enum ExecutionOutcome {
    Succeeded,
    Failed { reason: String },
    TimedOut,
    /// The render command could not be spawned; the orchestrator converts
    /// this into the mock-artifact path.
    Unavailable,
}

/// Everything the orchestrator needs from a finished run.
#[derive(Debug)]
pub struct ExecutionReport {
    pub logs: Vec<String>,
    pub outcome: ExecutionOutcome,
}

/// Spawn the toolchain and supervise it to completion, streaming milestone
/// progress as recognisable lines arrive. All log lines are retained in
/// arrival order regardless of outcome.
pub async fn run(
    command: RenderCommand,
    progress: &mut ProgressSender,
) -> std::io::Result<ExecutionReport> {
    let mut child = match Command::new(&command.command)
        .args(&command.args)
        .current_dir(&command.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Ok(ExecutionReport {
                logs: Vec::new(),
                outcome: ExecutionOutcome::Unavailable,
            });
        }
        Err(err) => return Err(err),
    };

    let (tx, mut events) = mpsc::channel::<RawEvent>(64);
    if let Some(stdout) = child.stdout.take() {
        spawn_line_reader(stdout, tx.clone(), RawEvent::Stdout);
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_line_reader(stderr, tx.clone(), RawEvent::Stderr);
    }

    // The waiter owns the child so the exit status travels through the same
    // event stream as the log lines. The kill switch is how the timeout arm
    // reaches the process.
    let (kill_tx, kill_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            kill = kill_rx => {
                // A dropped sender means the supervisor finished without
                // needing the kill; only an explicit signal forces one.
                if kill.is_ok() {
                    if let Err(err) = child.start_kill() {
                        warn!(
                            target = "application::pipeline::execute",
                            error = %err,
                            "failed to kill timed-out render process"
                        );
                    }
                }
                child.wait().await
            }
        };
        match status {
            Ok(status) => {
                let _ = tx.send(RawEvent::Exited(status)).await;
            }
            Err(err) => warn!(
                target = "application::pipeline::execute",
                error = %err,
                "failed to await render process exit"
            ),
        }
    });

    let mut logs = Vec::new();
    let mut saw_error_keyword = false;
    let mut exit_status: Option<ExitStatus> = None;
    let mut timed_out = false;
    let mut kill_tx = Some(kill_tx);

    let deadline = tokio::time::Instant::now() + command.timeout;
    let timeout = tokio::time::sleep_until(deadline);
    tokio::pin!(timeout);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(RawEvent::Stdout(line)) => {
                    classify_stdout(&line, progress).await;
                    logs.push(line);
                }
                Some(RawEvent::Stderr(line)) => {
                    if contains_error_keyword(&line) {
                        saw_error_keyword = true;
                    }
                    logs.push(line);
                }
                Some(RawEvent::Exited(status)) => {
                    exit_status = Some(status);
                }
                None => break,
            },
            () = &mut timeout => {
                warn!(
                    target = "application::pipeline::execute",
                    timeout_secs = command.timeout.as_secs(),
                    "render process exceeded its time budget; killing it"
                );
                timed_out = true;
                if let Some(kill) = kill_tx.take() {
                    let _ = kill.send(());
                }
                // Stop draining: a stuck descendant could hold the pipes
                // open and turn the bound back into an unbounded wait. The
                // detached waiter still reaps the child.
                break;
            }
        }
    }

    let outcome = if timed_out {
        ExecutionOutcome::TimedOut
    } else {
        match exit_status {
            Some(status) if !status.success() => ExecutionOutcome::Failed {
                reason: format!("render process exited with {status}"),
            },
            Some(_) if saw_error_keyword => ExecutionOutcome::Failed {
                reason: "render process reported errors in its output".to_string(),
            },
            Some(_) => ExecutionOutcome::Succeeded,
            None => ExecutionOutcome::Failed {
                reason: "render process exit status unavailable".to_string(),
            },
        }
    };

    Ok(ExecutionReport { logs, outcome })
}

fn spawn_line_reader<R>(reader: R, tx: mpsc::Sender<RawEvent>, make: fn(String) -> RawEvent)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(make(line)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(
                        target = "application::pipeline::execute",
                        error = %err,
                        "render output stream closed abnormally"
                    );
                    break;
                }
            }
        }
    });
}

async fn classify_stdout(line: &str, progress: &mut ProgressSender) {
    if line.contains("INFO") {
        for milestone in MILESTONES {
            if line.contains(milestone.marker) {
                progress.progress(milestone.percent, milestone.status).await;
                return;
            }
        }
    }
    debug!(target = "application::pipeline::execute", line, "render output");
}

fn contains_error_keyword(line: &str) -> bool {
    let lower = line.to_lowercase();
    ERROR_KEYWORDS.iter().any(|keyword| lower.contains(keyword))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Instant;

    use tempfile::TempDir;

    use crate::application::progress::{ProgressEvent, progress_channel};

    fn write_script(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("fake-render");
        std::fs::write(&path, body).expect("write script");
        let mut perms = std::fs::metadata(&path).expect("metadata").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("set perms");
        path
    }

    fn command_for(script: &PathBuf, dir: &TempDir, timeout: Duration) -> RenderCommand {
        RenderCommand {
            command: script.display().to_string(),
            args: Vec::new(),
            cwd: dir.path().to_path_buf(),
            timeout,
        }
    }

    fn drain_progress(
        rx: &mut tokio::sync::mpsc::Receiver<ProgressEvent>,
    ) -> Vec<(u8, String)> {
        let mut milestones = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ProgressEvent::Progress { progress, status } = event {
                milestones.push((progress, status));
            }
        }
        milestones
    }

    #[tokio::test]
    async fn clean_run_reports_milestones_and_success() {
        let dir = TempDir::new().expect("temp dir");
        let script = write_script(
            &dir,
            "#!/bin/sh\necho 'INFO Writing scene_1 to media'\necho 'INFO Rendered scene_1'\nexit 0\n",
        );
        let (mut progress, mut rx) = progress_channel(16);

        let report = run(command_for(&script, &dir, Duration::from_secs(10)), &mut progress)
            .await
            .expect("run");

        assert!(matches!(report.outcome, ExecutionOutcome::Succeeded));
        assert_eq!(report.logs.len(), 2);
        let milestones = drain_progress(&mut rx);
        assert_eq!(
            milestones,
            vec![
                (60, "Writing video frames".to_string()),
                (80, "Rendering complete".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn stderr_keyword_fails_a_zero_exit_run() {
        let dir = TempDir::new().expect("temp dir");
        let script = write_script(
            &dir,
            "#!/bin/sh\necho 'INFO Writing frames'\necho 'Exception: division by zero' >&2\nexit 0\n",
        );
        let (mut progress, _rx) = progress_channel(16);

        let report = run(command_for(&script, &dir, Duration::from_secs(10)), &mut progress)
            .await
            .expect("run");

        match report.outcome {
            ExecutionOutcome::Failed { reason } => {
                assert!(reason.contains("errors in its output"), "{reason}");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(report.logs.len(), 2);
    }

    #[tokio::test]
    async fn nonzero_exit_fails_the_run() {
        let dir = TempDir::new().expect("temp dir");
        let script = write_script(&dir, "#!/bin/sh\necho 'partial output'\nexit 3\n");
        let (mut progress, _rx) = progress_channel(16);

        let report = run(command_for(&script, &dir, Duration::from_secs(10)), &mut progress)
            .await
            .expect("run");

        match report.outcome {
            ExecutionOutcome::Failed { reason } => {
                assert!(reason.contains("exited with"), "{reason}");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(report.logs, vec!["partial output".to_string()]);
    }

    #[tokio::test]
    async fn hung_process_is_killed_at_the_deadline() {
        let dir = TempDir::new().expect("temp dir");
        let script = write_script(&dir, "#!/bin/sh\necho 'INFO Writing frames'\nexec sleep 30\n");
        let (mut progress, _rx) = progress_channel(16);

        let started = Instant::now();
        let report = run(
            command_for(&script, &dir, Duration::from_millis(250)),
            &mut progress,
        )
        .await
        .expect("run");

        assert!(matches!(report.outcome, ExecutionOutcome::TimedOut));
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "kill took {:?}",
            started.elapsed()
        );
        assert_eq!(report.logs, vec!["INFO Writing frames".to_string()]);
    }

    #[tokio::test]
    async fn missing_command_reports_unavailable() {
        let dir = TempDir::new().expect("temp dir");
        let command = RenderCommand {
            command: dir.path().join("no-such-renderer").display().to_string(),
            args: Vec::new(),
            cwd: dir.path().to_path_buf(),
            timeout: Duration::from_secs(1),
        };
        let (mut progress, _rx) = progress_channel(16);

        let report = run(command, &mut progress).await.expect("run");
        assert!(matches!(report.outcome, ExecutionOutcome::Unavailable));
    }

    #[test]
    fn unrecognised_info_lines_do_not_match_milestones() {
        assert!(!contains_error_keyword("INFO Loading cached assets"));
        let line = "INFO Loading cached assets";
        assert!(
            MILESTONES
                .iter()
                .all(|milestone| !line.contains(milestone.marker))
        );
    }

    #[test]
    fn keyword_match_is_case_insensitive() {
        assert!(contains_error_keyword("ValueError: bad shape"));
        assert!(contains_error_keyword("UNHANDLED EXCEPTION"));
        assert!(!contains_error_keyword("all good"));
    }
}
