//! Build backend driving the `git`, `docker` and `pack` command-line tools.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use depot_core::build::{BuildBackend, BuildRequest, BuiltImage, LogSink};
use depot_core::job::{BuildConfig, BuildType, SourceRef};
use depot_core::{Error, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::process::Process;

/// Builder used for buildpack builds when the job does not name one.
pub const DEFAULT_BUILDER: &str = "heroku/builder:22";

/// Files whose presence makes `auto` choose a buildpack build.
const BUILDPACK_MANIFESTS: &[&str] = &[
    "package.json",
    "requirements.txt",
    "Gemfile",
    "go.mod",
    "pom.xml",
    "build.gradle",
];

#[derive(Debug, Clone)]
pub struct DockerCliSettings {
    /// Parent directory for per-job checkouts.
    pub work_dir: PathBuf,
    pub registry: String,
    pub registry_user: Option<String>,
    pub registry_password: Option<String>,
    pub docker_bin: String,
    pub git_bin: String,
    pub pack_bin: String,
}

impl DockerCliSettings {
    pub fn new(work_dir: impl Into<PathBuf>, registry: impl Into<String>) -> Self {
        Self {
            work_dir: work_dir.into(),
            registry: registry.into(),
            registry_user: None,
            registry_password: None,
            docker_bin: "docker".to_string(),
            git_bin: "git".to_string(),
            pack_bin: "pack".to_string(),
        }
    }
}

/// Clones the source, builds with Docker or Cloud Native Buildpacks,
/// pushes, and inspects the result.
pub struct DockerCliBackend {
    settings: DockerCliSettings,
}

impl DockerCliBackend {
    pub fn new(settings: DockerCliSettings) -> Self {
        Self { settings }
    }

    fn checkout_dir(&self, request: &BuildRequest) -> PathBuf {
        self.settings.work_dir.join(request.job_id.to_string())
    }

    async fn clone_source(
        &self,
        cancel: &CancellationToken,
        source: &SourceRef,
        dir: &Path,
        logs: &dyn LogSink,
    ) -> Result<()> {
        let shallow = Process::new(&self.settings.git_bin)
            .args(shallow_clone_args(source, dir))
            .run(cancel, logs)
            .await;

        if let Err(e) = shallow {
            if e.is_cancelled() {
                return Err(e);
            }
            logs.system("Shallow clone failed, retrying with a full clone".to_string())
                .await;
            let _ = tokio::fs::remove_dir_all(dir).await;
            Process::new(&self.settings.git_bin)
                .args(["clone", "--"])
                .args([source.git_repo.clone(), path_arg(dir)])
                .run(cancel, logs)
                .await?;
        }

        Process::new(&self.settings.git_bin)
            .arg("-C")
            .arg(dir)
            .args(["checkout", source.git_sha.as_str()])
            .run(cancel, logs)
            .await
            .map(|_| ())
    }

    async fn login(&self, cancel: &CancellationToken, logs: &dyn LogSink) -> Result<()> {
        let (Some(user), Some(password)) = (
            &self.settings.registry_user,
            &self.settings.registry_password,
        ) else {
            return Ok(());
        };

        Process::new(&self.settings.docker_bin)
            .args([
                "login",
                self.settings.registry.as_str(),
                "-u",
                user.as_str(),
                "--password-stdin",
            ])
            .stdin(password.clone())
            .run(cancel, logs)
            .await
            .map(|_| ())
    }

    async fn inspect(
        &self,
        cancel: &CancellationToken,
        image: &str,
        format: &str,
        logs: &dyn LogSink,
    ) -> Result<String> {
        let out = Process::new(&self.settings.docker_bin)
            .args(["inspect", "--format", format, image])
            .capture_stdout()
            .run(cancel, logs)
            .await?;
        Ok(out.trim().to_string())
    }

    async fn build_in(
        &self,
        cancel: &CancellationToken,
        request: &BuildRequest,
        dir: &Path,
        logs: &dyn LogSink,
    ) -> Result<BuiltImage> {
        self.clone_source(cancel, &request.source, dir, logs).await?;

        let build_type = detect_build_type(&request.config, dir)?;
        logs.system(format!("Building {} as {}", request.image_ref, build_type.as_str()))
            .await;

        let build = match build_type {
            BuildType::Buildpack => {
                Process::new(&self.settings.pack_bin).args(pack_build_args(request, dir)?)
            }
            _ => Process::new(&self.settings.docker_bin).args(docker_build_args(request, dir)?),
        };
        build.run(cancel, logs).await?;

        self.login(cancel, logs).await?;
        Process::new(&self.settings.docker_bin)
            .args(["push", request.image_ref.as_str()])
            .run(cancel, logs)
            .await?;

        let digest = self
            .inspect(cancel, &request.image_ref, "{{.Id}}", logs)
            .await?;
        let size = self
            .inspect(cancel, &request.image_ref, "{{.Size}}", logs)
            .await?;
        let size_mb = size
            .parse::<u64>()
            .map(|bytes| bytes as f64 / (1024.0 * 1024.0))
            .unwrap_or_else(|_| {
                warn!(image = %request.image_ref, size = %size, "Unparseable image size");
                0.0
            });

        Ok(BuiltImage {
            image_uri: request.image_ref.clone(),
            digest,
            size_mb,
        })
    }
}

#[async_trait]
impl BuildBackend for DockerCliBackend {
    fn name(&self) -> &'static str {
        "docker-cli"
    }

    async fn build(
        &self,
        cancel: &CancellationToken,
        request: &BuildRequest,
        logs: &dyn LogSink,
    ) -> Result<BuiltImage> {
        let dir = self.checkout_dir(request);
        tokio::fs::create_dir_all(&self.settings.work_dir)
            .await
            .map_err(|e| Error::Internal(format!("creating work dir: {}", e)))?;

        info!(job_id = %request.job_id, image = %request.image_ref, "Starting build");
        let result = self.build_in(cancel, request, &dir, logs).await;

        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(job_id = %request.job_id, error = %e, "Failed to remove checkout");
            }
        }
        result
    }
}

/// Resolve `auto` against the checkout contents.
pub fn detect_build_type(config: &BuildConfig, dir: &Path) -> Result<BuildType> {
    match config.build_type {
        BuildType::Auto => {
            let context = within(dir, config.context_or_default())?;
            let dockerfile = within(&context, config.dockerfile_or_default())?;
            if dockerfile.exists() {
                Ok(BuildType::Dockerfile)
            } else if BUILDPACK_MANIFESTS.iter().any(|f| context.join(f).exists()) {
                Ok(BuildType::Buildpack)
            } else {
                Ok(BuildType::Dockerfile)
            }
        }
        explicit => Ok(explicit),
    }
}

fn shallow_clone_args(source: &SourceRef, dir: &Path) -> Vec<String> {
    let mut args = vec!["clone".to_string(), "--depth".to_string(), "1".to_string()];
    if !source.git_branch.is_empty() {
        args.extend([
            "--single-branch".to_string(),
            "--branch".to_string(),
            source.git_branch.clone(),
        ]);
    }
    args.push("--".to_string());
    args.push(source.git_repo.clone());
    args.push(path_arg(dir));
    args
}

fn docker_build_args(request: &BuildRequest, dir: &Path) -> Result<Vec<String>> {
    let config = &request.config;
    let context = within(dir, config.context_or_default())?;
    let dockerfile = within(&context, config.dockerfile_or_default())?;

    let mut args = vec![
        "build".to_string(),
        "-t".to_string(),
        request.image_ref.clone(),
        "-f".to_string(),
        path_arg(&dockerfile),
    ];

    for (key, value) in &config.build_args {
        args.push("--build-arg".to_string());
        args.push(format!("{}={}", key, value));
    }

    if !config.target.is_empty() {
        args.push("--target".to_string());
        args.push(config.target.clone());
    }

    let labels = [
        ("org.opencontainers.image.revision", request.source.git_sha.clone()),
        ("org.opencontainers.image.source", request.source.git_repo.clone()),
        ("io.depot.service-id", request.service_id.to_string()),
        ("io.depot.release-id", request.release_id.to_string()),
    ];
    for (key, value) in labels {
        args.push("--label".to_string());
        args.push(format!("{}={}", key, value));
    }

    args.push(path_arg(&context));
    Ok(args)
}

fn pack_build_args(request: &BuildRequest, dir: &Path) -> Result<Vec<String>> {
    let config = &request.config;
    let builder = if config.buildpack.is_empty() {
        DEFAULT_BUILDER
    } else {
        config.buildpack.as_str()
    };
    let context = within(dir, config.context_or_default())?;

    let mut args = vec![
        "build".to_string(),
        request.image_ref.clone(),
        "--builder".to_string(),
        builder.to_string(),
        "--path".to_string(),
        path_arg(&context),
    ];
    for (key, value) in &config.build_args {
        args.push("--env".to_string());
        args.push(format!("{}={}", key, value));
    }
    Ok(args)
}

/// Join a job-supplied relative path onto `base`, refusing anything that
/// could escape it.
fn within(base: &Path, relative: &str) -> Result<PathBuf> {
    let relative = Path::new(relative);
    let escapes = relative.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if escapes {
        return Err(Error::InvalidInput(format!(
            "path '{}' must stay inside the checkout",
            relative.display()
        )));
    }
    Ok(base.join(relative))
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
