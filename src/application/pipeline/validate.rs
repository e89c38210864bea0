//! Compile-checking of staged scene source, with one repair-backed retry.

use std::io::ErrorKind;
use std::path::Path;
use std::process::Stdio;

use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::ToolchainSettings;
use crate::domain::repair::repair;

/// What validation concluded about the staged source.
#[derive(Debug)]
pub enum Validation {
    /// The check command accepted the file.
    Valid,
    /// Both attempts failed; `diagnostics` is from the most recent one.
    Invalid { diagnostics: String },
    /// The check command could not be spawned at all. The orchestrator
    /// treats this as the toolchain being absent and takes the mock path.
    Unavailable,
}

enum CheckOutcome {
    Passed,
    Failed { diagnostics: String },
    Unavailable,
}

/// Runs the configured check-only command (`python -m py_compile` by
/// default) against a staged source file.
#[derive(Debug, Clone)]
pub struct SyntaxValidator {
    command: String,
    args: Vec<String>,
}

impl SyntaxValidator {
    pub fn new(settings: &ToolchainSettings) -> Self {
        Self {
            command: settings.check_command.clone(),
            args: settings.check_args.clone(),
        }
    }

    /// Validate the file at `path`. On a first failure the current file
    /// contents get a fresh repair pass; if that changes the text, the file
    /// is rewritten and checked once more. Repair producing no change means
    /// a retry cannot succeed either, so the original diagnostics surface
    /// immediately. Exactly one repair cycle, never more.
    pub async fn validate(&self, path: &Path) -> std::io::Result<Validation> {
        let first = self.run_check(path).await?;
        let diagnostics = match first {
            CheckOutcome::Passed => return Ok(Validation::Valid),
            CheckOutcome::Unavailable => return Ok(Validation::Unavailable),
            CheckOutcome::Failed { diagnostics } => diagnostics,
        };

        let current = fs::read_to_string(path).await?;
        let repaired = repair(&current);
        if repaired == current {
            debug!(
                target = "application::pipeline::validate",
                path = %path.display(),
                "repair pass was a no-op; not retrying"
            );
            return Ok(Validation::Invalid { diagnostics });
        }

        info!(
            target = "application::pipeline::validate",
            path = %path.display(),
            "repair changed the source; revalidating once"
        );
        fs::write(path, &repaired).await?;

        match self.run_check(path).await? {
            CheckOutcome::Passed => Ok(Validation::Valid),
            CheckOutcome::Unavailable => Ok(Validation::Unavailable),
            CheckOutcome::Failed { diagnostics } => Ok(Validation::Invalid { diagnostics }),
        }
    }

    async fn run_check(&self, path: &Path) -> std::io::Result<CheckOutcome> {
        let output = match Command::new(&self.command)
            .args(&self.args)
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
        {
            Ok(output) => output,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Ok(CheckOutcome::Unavailable);
            }
            Err(err) => return Err(err),
        };

        if output.status.success() {
            return Ok(CheckOutcome::Passed);
        }

        let mut diagnostics = String::from_utf8_lossy(&output.stderr).into_owned();
        if diagnostics.trim().is_empty() {
            diagnostics = String::from_utf8_lossy(&output.stdout).into_owned();
        }
        if diagnostics.trim().is_empty() {
            diagnostics = format!("check command exited with {}", output.status);
        }
        Ok(CheckOutcome::Failed { diagnostics })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn validator_for(script: &Path) -> SyntaxValidator {
        SyntaxValidator {
            command: script.display().to_string(),
            args: Vec::new(),
        }
    }

    fn write_script(dir: &TempDir, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, body).expect("write script");
        let mut perms = std::fs::metadata(&path).expect("metadata").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("set perms");
        path
    }

    #[tokio::test]
    async fn accepts_a_clean_file() {
        let dir = TempDir::new().expect("temp dir");
        let script = write_script(&dir, "check", "#!/bin/sh\nexit 0\n");
        let source = dir.path().join("scene.py");
        std::fs::write(&source, "print('ok')").expect("write source");

        let validation = validator_for(&script)
            .validate(&source)
            .await
            .expect("validate");
        assert!(matches!(validation, Validation::Valid));
    }

    #[tokio::test]
    async fn retries_once_after_a_repair_that_changes_the_text() {
        let dir = TempDir::new().expect("temp dir");
        // Fails whenever the staged file still contains a `]`.
        let script = write_script(
            &dir,
            "check",
            "#!/bin/sh\nif grep -q ']' \"$1\"; then\n  echo \"SyntaxError: unmatched ']'\" >&2\n  exit 1\nfi\nexit 0\n",
        );
        let source = dir.path().join("scene.py");
        std::fs::write(&source, "foo(bar]").expect("write source");

        let validation = validator_for(&script)
            .validate(&source)
            .await
            .expect("validate");
        assert!(matches!(validation, Validation::Valid));
        assert_eq!(
            std::fs::read_to_string(&source).expect("read back"),
            "foo(bar)"
        );
    }

    #[tokio::test]
    async fn surfaces_diagnostics_when_repair_is_a_noop() {
        let dir = TempDir::new().expect("temp dir");
        let script = write_script(
            &dir,
            "check",
            "#!/bin/sh\necho 'SyntaxError: invalid syntax' >&2\nexit 1\n",
        );
        let source = dir.path().join("scene.py");
        // Balanced text: the repair pass cannot change it.
        std::fs::write(&source, "x = = 1\n").expect("write source");

        let validation = validator_for(&script)
            .validate(&source)
            .await
            .expect("validate");
        match validation {
            Validation::Invalid { diagnostics } => {
                assert!(diagnostics.contains("SyntaxError"), "{diagnostics}");
            }
            other => panic!("unexpected validation: {other:?}"),
        }
    }

    #[tokio::test]
    async fn failing_twice_reports_the_most_recent_diagnostics() {
        let dir = TempDir::new().expect("temp dir");
        // Complains about whichever shape the file currently has.
        let script = write_script(
            &dir,
            "check",
            "#!/bin/sh\nif grep -q ']' \"$1\"; then\n  echo 'first attempt' >&2\nelse\n  echo 'second attempt' >&2\nfi\nexit 1\n",
        );
        let source = dir.path().join("scene.py");
        std::fs::write(&source, "foo(bar]").expect("write source");

        let validation = validator_for(&script)
            .validate(&source)
            .await
            .expect("validate");
        match validation {
            Validation::Invalid { diagnostics } => {
                assert!(diagnostics.contains("second attempt"), "{diagnostics}");
            }
            other => panic!("unexpected validation: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_check_command_reports_unavailable() {
        let dir = TempDir::new().expect("temp dir");
        let source = dir.path().join("scene.py");
        std::fs::write(&source, "print('ok')").expect("write source");

        let validator = SyntaxValidator {
            command: dir
                .path()
                .join("no-such-interpreter")
                .display()
                .to_string(),
            args: Vec::new(),
        };
        let validation = validator.validate(&source).await.expect("validate");
        assert!(matches!(validation, Validation::Unavailable));
    }
}
