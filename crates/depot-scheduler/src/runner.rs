//! Build lifecycle for a single job: build and push, then optional SBOM
//! and signing stages.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use depot_config::VariableContext;
use depot_core::build::{BuildBackend, BuildRequest, ImageSigner, LogSink, SbomGenerator};
use depot_core::{BuildResult, Error, FailureReason, Job, JobStatus};
use tracing::{info, warn};

use crate::context::{BuildContext, StopReason};

/// Where a build ended up, and the result to attach.
#[derive(Debug, Clone)]
pub struct Finished {
    pub status: JobStatus,
    pub result: BuildResult,
}

impl Finished {
    fn failed(reason: FailureReason, message: impl Into<String>, started: Instant) -> Self {
        Self {
            status: JobStatus::Failed,
            result: BuildResult::failed(reason, message, elapsed(started)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub registry: String,
    pub image_template: String,
    pub sbom_format: String,
    /// Only used to describe timeouts in failure messages.
    pub build_timeout: Duration,
    /// How long a stage may run on after its context is stopped before it
    /// is dropped.
    pub stop_grace: Duration,
}

/// Drives the external collaborators through one job.
pub struct BuildRunner {
    backend: Arc<dyn BuildBackend>,
    sbom: Option<Arc<dyn SbomGenerator>>,
    signer: Option<Arc<dyn ImageSigner>>,
    settings: RunnerSettings,
}

impl BuildRunner {
    pub fn new(backend: Arc<dyn BuildBackend>, settings: RunnerSettings) -> Self {
        Self {
            backend,
            sbom: None,
            signer: None,
            settings,
        }
    }

    pub fn with_sbom(mut self, generator: Arc<dyn SbomGenerator>) -> Self {
        self.sbom = Some(generator);
        self
    }

    pub fn with_signer(mut self, signer: Arc<dyn ImageSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Render the image reference for `job` from the configured template.
    pub fn image_ref(&self, job: &Job) -> Result<String, Error> {
        let vars = VariableContext::for_job(job, &self.settings.registry);
        let unresolved = vars.unresolved(&self.settings.image_template);
        if !unresolved.is_empty() {
            return Err(Error::InvalidInput(format!(
                "image template uses unknown variables: {}",
                unresolved.join(", ")
            )));
        }
        Ok(vars.interpolate(&self.settings.image_template))
    }

    /// Run every stage. Never returns `building`; the caller performs the
    /// CAS transition to the returned status.
    pub async fn run(&self, job: &Job, ctx: &BuildContext, logs: &dyn LogSink) -> Finished {
        let started = Instant::now();

        let image_ref = match self.image_ref(job) {
            Ok(image_ref) => image_ref,
            Err(e) => return Finished::failed(FailureReason::Internal, e.to_string(), started),
        };

        let request = BuildRequest {
            job_id: job.id,
            release_id: job.release_id,
            service_id: job.service_id,
            project_id: job.project_id,
            source: job.source.clone(),
            config: job.build_config.clone(),
            image_ref,
        };

        logs.system(format!(
            "Building {} at {} with {}",
            job.source.git_repo,
            job.source.short_sha(),
            self.backend.name()
        ))
        .await;

        let image = match self
            .guard(ctx, self.backend.build(ctx.token(), &request, logs))
            .await
        {
            Ok(image) => image,
            Err(e) => return self.stage_failed(ctx, FailureReason::BuildFailed, e, started),
        };
        info!(job_id = %job.id, image = %image.image_uri, "Image built");

        let mut result = BuildResult {
            success: true,
            image_uri: image.image_uri,
            image_digest: image.digest,
            image_size_mb: image.size_mb,
            ..Default::default()
        };

        if let Some(stopped) = self.check_stopped(ctx, started) {
            return stopped;
        }

        if let Some(generator) = &self.sbom {
            logs.system("Generating SBOM".to_string()).await;
            let generate =
                generator.generate(ctx.token(), &result.image_uri, &self.settings.sbom_format, logs);
            match self.guard(ctx, generate).await {
                Ok(sbom) => {
                    result.sbom = sbom.content;
                    result.sbom_format = sbom.format;
                }
                Err(e) => {
                    return self.partial_failure(ctx, FailureReason::SbomFailed, e, result, started);
                }
            }

            if let Some(stopped) = self.check_stopped(ctx, started) {
                return stopped;
            }
        }

        if let Some(signer) = &self.signer {
            logs.system("Signing image".to_string()).await;
            match self
                .guard(ctx, signer.sign(ctx.token(), &result.image_uri, logs))
                .await
            {
                Ok(signature) => result.image_signature = signature,
                Err(e) => {
                    return self.partial_failure(
                        ctx,
                        FailureReason::SigningFailed,
                        e,
                        result,
                        started,
                    );
                }
            }

            if let Some(stopped) = self.check_stopped(ctx, started) {
                return stopped;
            }
        }

        result.duration_secs = elapsed(started);
        logs.system(format!(
            "Build succeeded in {:.1}s: {}",
            result.duration_secs, result.image_uri
        ))
        .await;

        Finished {
            status: JobStatus::Ready,
            result,
        }
    }

    /// Await a stage, abandoning it once the context has been stopped for
    /// longer than `stop_grace`. Dropping the stage kills any child process
    /// it spawned.
    async fn guard<T>(
        &self,
        ctx: &BuildContext,
        stage: impl Future<Output = Result<T, Error>>,
    ) -> Result<T, Error> {
        let abandon = async {
            ctx.stopped().await;
            tokio::time::sleep(self.settings.stop_grace).await;
        };

        tokio::select! {
            result = stage => result,
            _ = abandon => {
                warn!(
                    grace_ms = self.settings.stop_grace.as_millis() as u64,
                    "Build stage ignored cancellation, abandoning it"
                );
                Err(Error::Cancelled)
            }
        }
    }

    /// Outcome for a context that has been stopped, if it has.
    fn check_stopped(&self, ctx: &BuildContext, started: Instant) -> Option<Finished> {
        let reason = ctx.reason()?;
        Some(match reason {
            StopReason::CancelRequested => Finished {
                status: JobStatus::Cancelled,
                result: BuildResult::cancelled(elapsed(started)),
            },
            StopReason::Timeout => Finished::failed(
                FailureReason::BuildTimeout,
                format!(
                    "build exceeded timeout of {}s",
                    self.settings.build_timeout.as_secs()
                ),
                started,
            ),
            StopReason::Shutdown => Finished::failed(
                FailureReason::WorkerShutdown,
                "worker shut down before the build finished",
                started,
            ),
        })
    }

    /// A stage failed. If the context was stopped, the stop is the cause.
    fn stage_failed(
        &self,
        ctx: &BuildContext,
        reason: FailureReason,
        error: Error,
        started: Instant,
    ) -> Finished {
        if let Some(stopped) = self.check_stopped(ctx, started) {
            return stopped;
        }
        warn!(reason = %reason, error = %error, "Build stage failed");
        Finished::failed(reason, error.to_string(), started)
    }

    /// Like [`stage_failed`](Self::stage_failed), but keeps what was already
    /// produced so the caller can see which image failed to sign.
    fn partial_failure(
        &self,
        ctx: &BuildContext,
        reason: FailureReason,
        error: Error,
        partial: BuildResult,
        started: Instant,
    ) -> Finished {
        let mut finished = self.stage_failed(ctx, reason, error, started);
        if finished.status == JobStatus::Failed {
            finished.result.image_uri = partial.image_uri;
            finished.result.image_digest = partial.image_digest;
            finished.result.image_size_mb = partial.image_size_mb;
            finished.result.sbom = partial.sbom;
            finished.result.sbom_format = partial.sbom_format;
        }
        finished
    }
}

fn elapsed(started: Instant) -> f64 {
    started.elapsed().as_secs_f64()
}
