//! The job pipeline: repair → validate → render → locate, with the mock
//! fallback and guaranteed scratch-file cleanup.

pub mod artifacts;
pub mod execute;
pub mod validate;

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use metrics::{counter, gauge, histogram};
use thiserror::Error;
use tokio::fs;
use tracing::{error, info};

use crate::application::progress::ProgressSender;
use crate::config::{Settings, ToolchainSettings};
use crate::domain::job::{ExecutionJob, JobId, JobState, RenderResult};
use crate::domain::repair::repair;
use crate::infra::workspace::Workspace;

use execute::{ExecutionOutcome, RenderCommand};
use validate::{SyntaxValidator, Validation};

/// Failure classes surfaced as a terminal `error` event. Toolchain
/// unavailability is deliberately absent: it is recovered into the mock
/// path instead of being surfaced.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("scene failed syntax validation: {diagnostics}")]
    Syntax { diagnostics: String },
    #[error("{message}")]
    Render { message: String },
    #[error(
        "no `{extension}` artifact matching `{job_id}` found after rendering; \
         output directory contains: {listing}"
    )]
    ArtifactMissing {
        job_id: String,
        extension: String,
        listing: String,
    },
    #[error("render timed out after {seconds}s and was killed")]
    TimedOut { seconds: u64 },
    #[error("internal failure during {stage}: {message}")]
    Internal {
        stage: &'static str,
        message: String,
    },
}

impl PipelineError {
    fn internal(stage: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Internal {
            stage,
            message: err.to_string(),
        }
    }
}

/// Registry of jobs currently holding a scratch file. Guarantees id
/// uniqueness across concurrent submissions arriving in the same
/// millisecond and backs the in-flight gauge.
#[derive(Default, Clone)]
pub struct InFlightJobs {
    jobs: Arc<DashMap<String, ()>>,
}

impl InFlightJobs {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(DashMap::new()),
        }
    }

    /// Claim a unique job id derived from the arrival timestamp. The guard
    /// releases the claim when dropped.
    fn claim(&self, unix_millis: i128) -> (JobId, JobGuard) {
        use dashmap::mapref::entry::Entry;

        let base = JobId::from_millis(unix_millis);
        let mut candidate = base.clone();
        let mut attempt = 1;
        loop {
            match self.jobs.entry(candidate.as_str().to_string()) {
                Entry::Vacant(vacant) => {
                    vacant.insert(());
                    gauge!("ciak_jobs_inflight").increment(1.0);
                    let guard = JobGuard {
                        key: candidate.as_str().to_string(),
                        jobs: Arc::clone(&self.jobs),
                    };
                    return (candidate, guard);
                }
                Entry::Occupied(_) => {
                    attempt += 1;
                    candidate = base.with_suffix(attempt);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

struct JobGuard {
    key: String,
    jobs: Arc<DashMap<String, ()>>,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.jobs.remove(&self.key);
        gauge!("ciak_jobs_inflight").decrement(1.0);
    }
}

/// Drives one submission through the full lifecycle. Shared by every
/// request handler; all per-job state lives on the stack of [`run`].
pub struct RenderPipeline {
    toolchain: ToolchainSettings,
    validator: SyntaxValidator,
    workspace: Arc<Workspace>,
    public_url: Option<String>,
    in_flight: InFlightJobs,
}

impl RenderPipeline {
    pub fn new(settings: &Settings, workspace: Arc<Workspace>) -> Self {
        Self {
            toolchain: settings.toolchain.clone(),
            validator: SyntaxValidator::new(&settings.toolchain),
            workspace,
            public_url: settings.server.public_url.clone(),
            in_flight: InFlightJobs::new(),
        }
    }

    pub fn in_flight(&self) -> &InFlightJobs {
        &self.in_flight
    }

    /// Run one job to its terminal event. Never returns an error: every
    /// failure class becomes the stream's single `error` event, and the
    /// scratch source is released on every exit path.
    pub async fn run(&self, code: String, mut progress: ProgressSender) {
        let started = Instant::now();
        counter!("ciak_jobs_started_total").increment(1);

        let (job_id, guard) = self.in_flight.claim(now_millis());
        let mut job = ExecutionJob::new(job_id);

        match self.execute(&mut job, code, &mut progress).await {
            Ok(()) => {
                counter!("ciak_jobs_completed_total").increment(1);
                info!(
                    target = "application::pipeline",
                    job = %job.id(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "job completed"
                );
            }
            Err(err) => {
                counter!("ciak_jobs_failed_total").increment(1);
                job.transition(JobState::Failed);
                error!(
                    target = "application::pipeline",
                    job = %job.id(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %err,
                    "job failed"
                );
                progress.error(err.to_string()).await;
            }
        }

        histogram!("ciak_render_ms").record(started.elapsed().as_millis() as f64);
        drop(guard);
    }

    async fn execute(
        &self,
        job: &mut ExecutionJob,
        code: String,
        progress: &mut ProgressSender,
    ) -> Result<(), PipelineError> {
        progress.progress(10, "Preparing scene source").await;
        job.transition(JobState::Repairing);
        let repaired = repair(&code);

        // The guard removes the scratch file when it leaves scope, which
        // covers every early return below; the happy paths discard it
        // explicitly so removal failures get logged before the terminal
        // event goes out.
        let source = self
            .workspace
            .stage_source(job.id(), &repaired)
            .await
            .map_err(|err| PipelineError::internal("staging scene source", err))?;

        job.transition(JobState::Validating);
        progress.progress(15, "Checking scene syntax").await;
        match self
            .validator
            .validate(source.path())
            .await
            .map_err(|err| PipelineError::internal("syntax validation", err))?
        {
            Validation::Valid => {}
            Validation::Invalid { diagnostics } => {
                return Err(PipelineError::Syntax { diagnostics });
            }
            Validation::Unavailable => {
                self.mock_complete(job, &repaired, progress).await?;
                source.discard().await;
                return Ok(());
            }
        }

        progress.progress(20, "Starting render").await;
        job.transition(JobState::Rendering);
        let report = execute::run(self.render_command(job.id(), source.path()), progress)
            .await
            .map_err(|err| PipelineError::internal("render execution", err))?;
        job.absorb_logs(report.logs);

        match report.outcome {
            ExecutionOutcome::Unavailable => {
                self.mock_complete(job, &repaired, progress).await?;
                source.discard().await;
                return Ok(());
            }
            ExecutionOutcome::TimedOut => {
                return Err(PipelineError::TimedOut {
                    seconds: self.toolchain.render_timeout.as_secs(),
                });
            }
            ExecutionOutcome::Failed { reason } => {
                return Err(PipelineError::Render {
                    message: format!("{reason}. Logs: {}", job.logs().join("\n")),
                });
            }
            ExecutionOutcome::Succeeded => {}
        }

        progress.progress(90, "Finalizing video").await;
        job.transition(JobState::Searching);
        let matches = artifacts::find_artifacts(
            self.workspace.output_dir(),
            job.id(),
            self.workspace.artifact_extension(),
        )
        .await
        .map_err(|err| PipelineError::internal("artifact search", err))?;

        // First match is canonical: traversal order, not alphabetic.
        let Some(artifact) = matches.into_iter().next() else {
            let listing = artifacts::flat_listing(self.workspace.output_dir()).await;
            return Err(PipelineError::ArtifactMissing {
                job_id: job.id().to_string(),
                extension: self.workspace.artifact_extension().to_string(),
                listing: listing.join(", "),
            });
        };

        let relative = self.workspace.relativize(&artifact);
        let url = self.artifact_url(&relative);
        source.discard().await;

        progress.progress(100, "Video ready").await;
        job.transition(JobState::Completed);
        progress
            .complete(RenderResult::rendered(
                url,
                artifact,
                job.take_logs(),
                repaired,
            ))
            .await;
        Ok(())
    }

    async fn mock_complete(
        &self,
        job: &mut ExecutionJob,
        code: &str,
        progress: &mut ProgressSender,
    ) -> Result<(), PipelineError> {
        counter!("ciak_jobs_mock_total").increment(1);
        progress
            .progress(30, "Render toolchain unavailable; creating scene preview")
            .await;

        let file_name = write_mock_preview(self.workspace.output_dir(), job.id(), code)
            .await
            .map_err(|err| PipelineError::internal("mock preview", err))?;
        job.absorb_logs(vec![
            "render toolchain not available; emitted a scene preview instead".to_string(),
        ]);

        let url = self.artifact_url(&file_name);
        let path = self.workspace.output_dir().join(&file_name);

        progress.progress(100, "Scene preview ready").await;
        job.transition(JobState::Completed);
        progress
            .complete(RenderResult::mock(
                url,
                path,
                job.take_logs(),
                code.to_string(),
            ))
            .await;
        Ok(())
    }

    fn render_command(&self, job_id: &JobId, source: &Path) -> RenderCommand {
        let mut args = self.toolchain.render_args.clone();
        args.extend(self.toolchain.quality_args.iter().cloned());
        args.push("--output_file".to_string());
        args.push(job_id.to_string());
        args.push(source.display().to_string());

        RenderCommand {
            command: self.toolchain.render_command.clone(),
            args,
            cwd: self.workspace.output_dir().to_path_buf(),
            timeout: self.toolchain.render_timeout,
        }
    }

    fn artifact_url(&self, relative: &str) -> String {
        match self.public_url.as_deref() {
            Some(base) => format!("{}/videos/{relative}", base.trim_end_matches('/')),
            None => format!("/videos/{relative}"),
        }
    }
}

fn now_millis() -> i128 {
    time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000
}

/// Write the placeholder artifact emitted when the toolchain is absent: a
/// static page embedding the repaired scene source.
async fn write_mock_preview(
    output_dir: &Path,
    job_id: &JobId,
    code: &str,
) -> std::io::Result<String> {
    let file_name = format!("{job_id}.html");
    let body = format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<title>Scene preview</title>\n</head>\n<body>\n\
         <h2>Scene code generated</h2>\n\
         <p>The render toolchain is not available on this host, so the scene\n\
         was not rendered. The generated source is shown below.</p>\n\
         <pre><code>{}</code></pre>\n</body>\n</html>\n",
        escape_html(code)
    );
    fs::write(output_dir.join(&file_name), body).await?;
    Ok(file_name)
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrent_claims_in_the_same_millisecond_stay_unique() {
        let registry = InFlightJobs::new();
        let (first, _first_guard) = registry.claim(1000);
        let (second, _second_guard) = registry.claim(1000);
        let (third, _third_guard) = registry.claim(1000);

        assert_eq!(first.as_str(), "scene_1000");
        assert_eq!(second.as_str(), "scene_1000_2");
        assert_eq!(third.as_str(), "scene_1000_3");
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn dropping_the_guard_releases_the_claim() {
        let registry = InFlightJobs::new();
        {
            let (_id, _guard) = registry.claim(2000);
            assert_eq!(registry.len(), 1);
        }
        assert!(registry.is_empty());

        let (reclaimed, _guard) = registry.claim(2000);
        assert_eq!(reclaimed.as_str(), "scene_2000");
    }

    #[test]
    fn html_escaping_covers_markup_characters() {
        assert_eq!(
            escape_html("if a < b and b > c: print(\"&'\")"),
            "if a &lt; b and b &gt; c: print(&quot;&amp;&#39;&quot;)"
        );
    }

    #[tokio::test]
    async fn mock_preview_embeds_the_escaped_source() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let job_id = JobId::from_millis(42);

        let file_name = write_mock_preview(dir.path(), &job_id, "play(Create(circle))")
            .await
            .expect("preview");
        assert_eq!(file_name, "scene_42.html");

        let body = std::fs::read_to_string(dir.path().join(&file_name)).expect("read");
        assert!(body.contains("play(Create(circle))"));
        assert!(body.contains("not available"));
    }
}
