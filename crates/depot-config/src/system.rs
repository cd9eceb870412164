//! System configuration parsing.
//!
//! A `depot.kdl` file looks like:
//!
//! ```kdl
//! server {
//!     listen "0.0.0.0:8081"
//!     public-url "https://builds.example.com"
//!     internal-api-key "change-me"
//! }
//! store {
//!     backend "postgres"
//!     database-url "postgres://depot@localhost/depot"
//! }
//! worker {
//!     max-concurrent-builds 3
//!     build-timeout "30m"
//! }
//! build {
//!     registry "ghcr.io"
//!     sign-images #false
//! }
//! ```
//!
//! Every key is optional. `DEPOT_*` environment variables override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};

use crate::{ConfigError, ConfigResult, parse_duration};

pub const DEFAULT_IMAGE_TEMPLATE: &str =
    "${registry}/${project.short_id}/${service.short_id}:${git.short_sha}";

/// System-wide configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub worker: WorkerConfig,
    pub build: BuildSettings,
    pub callback: CallbackConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen: String,
    /// Base URL used to build `logs_url` in callbacks.
    pub public_url: String,
    /// Key required on `/internal/*`. Unset leaves the internal surface open.
    pub internal_api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8081".to_string(),
            public_url: "http://localhost:8081".to_string(),
            internal_api_key: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Postgres,
}

impl std::str::FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s {
            "memory" => Ok(StoreBackend::Memory),
            "postgres" => Ok(StoreBackend::Postgres),
            other => Err(ConfigError::invalid(
                "store.backend",
                format!("expected 'memory' or 'postgres', got '{}'", other),
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub database_url: Option<String>,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            database_url: None,
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub id: String,
    pub max_concurrent_builds: u32,
    pub build_timeout: Duration,
    /// Back-off between dequeue attempts after a store error.
    pub poll_interval: Duration,
    /// How often a running build checks for a cancel request.
    pub cancel_poll_interval: Duration,
    pub heartbeat_interval: Duration,
    /// A worker silent for longer than this is considered lost.
    pub heartbeat_ttl: Duration,
    pub shutdown_grace: Duration,
    /// How long a stopped build stage may keep running before the worker
    /// abandons it.
    pub stop_grace: Duration,
    pub work_dir: PathBuf,
    /// Per-subscriber log buffer; a subscriber that falls this far behind
    /// is disconnected.
    pub log_buffer: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            id: default_worker_id(),
            max_concurrent_builds: 3,
            build_timeout: Duration::from_secs(30 * 60),
            poll_interval: Duration::from_secs(5),
            cancel_poll_interval: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_ttl: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(5 * 60),
            stop_grace: Duration::from_secs(30),
            work_dir: std::env::temp_dir().join("depot-builds"),
            log_buffer: 256,
        }
    }
}

fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "depot".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &suffix[..8])
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSettings {
    pub registry: String,
    pub registry_user: Option<String>,
    pub registry_password: Option<String>,
    pub image_template: String,
    pub generate_sbom: bool,
    pub sbom_format: String,
    pub sign_images: bool,
    pub cosign_key: Option<String>,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            registry: "ghcr.io".to_string(),
            registry_user: None,
            registry_password: None,
            image_template: DEFAULT_IMAGE_TEMPLATE.to_string(),
            generate_sbom: true,
            sbom_format: "spdx-json".to_string(),
            sign_images: true,
            cosign_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackConfig {
    /// Sent as a bearer token and used as the HMAC key for the body signature.
    pub api_key: Option<String>,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub request_timeout: Duration,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Parse system configuration from KDL text. Missing keys keep their defaults.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "server" => parse_server(node, &mut config.server)?,
            "store" => parse_store(node, &mut config.store)?,
            "worker" => parse_worker(node, &mut config.worker)?,
            "build" => parse_build(node, &mut config.build)?,
            "callback" => parse_callback(node, &mut config.callback)?,
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(config)
}

fn parse_server(node: &KdlNode, server: &mut ServerConfig) -> ConfigResult<()> {
    for child in children(node) {
        match child.name().value() {
            "listen" => server.listen = required_string(child, "server.listen")?,
            "public-url" => server.public_url = required_string(child, "server.public-url")?,
            "internal-api-key" => {
                server.internal_api_key = Some(required_string(child, "server.internal-api-key")?)
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_store(node: &KdlNode, store: &mut StoreConfig) -> ConfigResult<()> {
    for child in children(node) {
        match child.name().value() {
            "backend" => store.backend = required_string(child, "store.backend")?.parse()?,
            "database-url" => {
                store.database_url = Some(required_string(child, "store.database-url")?)
            }
            "max-connections" => {
                store.max_connections = required_int(child, "store.max-connections")?
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_worker(node: &KdlNode, worker: &mut WorkerConfig) -> ConfigResult<()> {
    for child in children(node) {
        match child.name().value() {
            "id" => worker.id = required_string(child, "worker.id")?,
            "max-concurrent-builds" => {
                worker.max_concurrent_builds = required_int(child, "worker.max-concurrent-builds")?
            }
            "build-timeout" => {
                worker.build_timeout = required_duration(child, "worker.build-timeout")?
            }
            "poll-interval" => {
                worker.poll_interval = required_duration(child, "worker.poll-interval")?
            }
            "cancel-poll-interval" => {
                worker.cancel_poll_interval =
                    required_duration(child, "worker.cancel-poll-interval")?
            }
            "heartbeat-interval" => {
                worker.heartbeat_interval = required_duration(child, "worker.heartbeat-interval")?
            }
            "heartbeat-ttl" => {
                worker.heartbeat_ttl = required_duration(child, "worker.heartbeat-ttl")?
            }
            "shutdown-grace" => {
                worker.shutdown_grace = required_duration(child, "worker.shutdown-grace")?
            }
            "stop-grace" => worker.stop_grace = required_duration(child, "worker.stop-grace")?,
            "work-dir" => worker.work_dir = required_string(child, "worker.work-dir")?.into(),
            "log-buffer" => worker.log_buffer = required_int(child, "worker.log-buffer")?,
            _ => {}
        }
    }
    Ok(())
}

fn parse_build(node: &KdlNode, build: &mut BuildSettings) -> ConfigResult<()> {
    for child in children(node) {
        match child.name().value() {
            "registry" => build.registry = required_string(child, "build.registry")?,
            "registry-user" => {
                build.registry_user = Some(required_string(child, "build.registry-user")?)
            }
            "registry-password" => {
                build.registry_password = Some(required_string(child, "build.registry-password")?)
            }
            "image-template" => {
                build.image_template = required_string(child, "build.image-template")?
            }
            "generate-sbom" => build.generate_sbom = required_bool(child, "build.generate-sbom")?,
            "sbom-format" => build.sbom_format = required_string(child, "build.sbom-format")?,
            "sign-images" => build.sign_images = required_bool(child, "build.sign-images")?,
            "cosign-key" => build.cosign_key = Some(required_string(child, "build.cosign-key")?),
            _ => {}
        }
    }
    Ok(())
}

fn parse_callback(node: &KdlNode, callback: &mut CallbackConfig) -> ConfigResult<()> {
    for child in children(node) {
        match child.name().value() {
            "api-key" => callback.api_key = Some(required_string(child, "callback.api-key")?),
            "max-attempts" => callback.max_attempts = required_int(child, "callback.max-attempts")?,
            "initial-backoff" => {
                callback.initial_backoff = required_duration(child, "callback.initial-backoff")?
            }
            "max-backoff" => {
                callback.max_backoff = required_duration(child, "callback.max-backoff")?
            }
            "request-timeout" => {
                callback.request_timeout = required_duration(child, "callback.request-timeout")?
            }
            _ => {}
        }
    }
    Ok(())
}

impl SystemConfig {
    /// Load from an optional KDL file, apply `DEPOT_*` overrides from the
    /// process environment, and validate.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(path) => parse_system_config(&std::fs::read_to_string(path)?)?,
            None => SystemConfig::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `DEPOT_*` overrides from `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("DEPOT_LISTEN") {
            self.server.listen = v;
        }
        if let Some(v) = lookup("DEPOT_PUBLIC_URL") {
            self.server.public_url = v;
        }
        if let Some(v) = lookup("DEPOT_INTERNAL_API_KEY") {
            self.server.internal_api_key = Some(v);
        }
        if let Some(v) = lookup("DEPOT_STORE_BACKEND") {
            self.store.backend = v.parse()?;
        }
        if let Some(v) = lookup("DATABASE_URL").or_else(|| lookup("DEPOT_DATABASE_URL")) {
            self.store.database_url = Some(v);
        }
        if let Some(v) = lookup("DEPOT_WORKER_ID") {
            self.worker.id = v;
        }
        if let Some(v) = lookup("DEPOT_MAX_CONCURRENT_BUILDS") {
            self.worker.max_concurrent_builds = parse_int(&v, "DEPOT_MAX_CONCURRENT_BUILDS")?;
        }
        if let Some(v) = lookup("DEPOT_BUILD_TIMEOUT") {
            self.worker.build_timeout = parse_duration(&v)?;
        }
        if let Some(v) = lookup("DEPOT_SHUTDOWN_GRACE") {
            self.worker.shutdown_grace = parse_duration(&v)?;
        }
        if let Some(v) = lookup("DEPOT_WORK_DIR") {
            self.worker.work_dir = v.into();
        }
        if let Some(v) = lookup("DEPOT_REGISTRY") {
            self.build.registry = v;
        }
        if let Some(v) = lookup("DEPOT_REGISTRY_USER") {
            self.build.registry_user = Some(v);
        }
        if let Some(v) = lookup("DEPOT_REGISTRY_PASSWORD") {
            self.build.registry_password = Some(v);
        }
        if let Some(v) = lookup("DEPOT_GENERATE_SBOM") {
            self.build.generate_sbom = parse_bool(&v, "DEPOT_GENERATE_SBOM")?;
        }
        if let Some(v) = lookup("DEPOT_SIGN_IMAGES") {
            self.build.sign_images = parse_bool(&v, "DEPOT_SIGN_IMAGES")?;
        }
        if let Some(v) = lookup("DEPOT_COSIGN_KEY") {
            self.build.cosign_key = Some(v);
        }
        if let Some(v) = lookup("DEPOT_CALLBACK_API_KEY") {
            self.callback.api_key = Some(v);
        }
        Ok(())
    }

    /// Reject configurations the service cannot run with.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.worker.max_concurrent_builds == 0 {
            return Err(ConfigError::invalid(
                "worker.max-concurrent-builds",
                "must be at least 1",
            ));
        }
        if self.worker.build_timeout.is_zero() {
            return Err(ConfigError::invalid("worker.build-timeout", "must be positive"));
        }
        for (field, interval) in [
            ("worker.poll-interval", self.worker.poll_interval),
            ("worker.cancel-poll-interval", self.worker.cancel_poll_interval),
            ("worker.heartbeat-interval", self.worker.heartbeat_interval),
        ] {
            if interval.is_zero() {
                return Err(ConfigError::invalid(field, "must be positive"));
            }
        }
        if self.worker.heartbeat_ttl <= self.worker.heartbeat_interval {
            return Err(ConfigError::invalid(
                "worker.heartbeat-ttl",
                "must be longer than worker.heartbeat-interval",
            ));
        }
        if self.worker.log_buffer == 0 {
            return Err(ConfigError::invalid("worker.log-buffer", "must be at least 1"));
        }
        if self.store.backend == StoreBackend::Postgres && self.store.database_url.is_none() {
            return Err(ConfigError::MissingField("store.database-url".to_string()));
        }
        if self.build.registry.is_empty() {
            return Err(ConfigError::MissingField("build.registry".to_string()));
        }
        if self.callback.max_attempts == 0 {
            return Err(ConfigError::invalid("callback.max-attempts", "must be at least 1"));
        }
        url::Url::parse(&self.server.public_url)
            .map_err(|e| ConfigError::invalid("server.public-url", e.to_string()))?;
        Ok(())
    }
}

// Helper functions for extracting values from KDL nodes

fn children(node: &KdlNode) -> impl Iterator<Item = &KdlNode> {
    node.children().into_iter().flat_map(|doc| doc.nodes().iter())
}

fn get_first_arg(node: &KdlNode) -> Option<&kdl::KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
}

fn required_string(node: &KdlNode, field: &str) -> ConfigResult<String> {
    get_first_arg(node)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
        .ok_or_else(|| ConfigError::invalid(field, "expected a string"))
}

fn required_bool(node: &KdlNode, field: &str) -> ConfigResult<bool> {
    get_first_arg(node)
        .and_then(|v| v.as_bool())
        .ok_or_else(|| ConfigError::invalid(field, "expected #true or #false"))
}

fn required_int<T: TryFrom<i128>>(node: &KdlNode, field: &str) -> ConfigResult<T> {
    get_first_arg(node)
        .and_then(|v| v.as_integer())
        .and_then(|i| T::try_from(i).ok())
        .ok_or_else(|| ConfigError::invalid(field, "expected a non-negative integer"))
}

fn required_duration(node: &KdlNode, field: &str) -> ConfigResult<Duration> {
    let value =
        get_first_arg(node).ok_or_else(|| ConfigError::invalid(field, "expected a duration"))?;
    if let Some(s) = value.as_string() {
        return parse_duration(s);
    }
    value
        .as_integer()
        .and_then(|i| u64::try_from(i).ok())
        .map(Duration::from_secs)
        .ok_or_else(|| ConfigError::invalid(field, "expected a duration"))
}

fn parse_int<T: std::str::FromStr>(value: &str, field: &str) -> ConfigResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::invalid(field, format!("'{}' is not a number", value)))
}

fn parse_bool(value: &str, field: &str) -> ConfigResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::invalid(
            field,
            format!("'{}' is not a boolean", other),
        )),
    }
}
