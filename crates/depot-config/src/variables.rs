//! Variable interpolation for image reference templates.
//!
//! Supports variables like:
//! - `${registry}` - Target container registry host
//! - `${git.sha}` - Full git commit SHA
//! - `${git.short_sha}` - First 8 characters of the commit SHA
//! - `${git.branch}` - Branch the commit was built from
//! - `${project.id}` / `${project.short_id}` - Project UUID (full or 8 chars)
//! - `${service.id}` / `${service.short_id}` - Service UUID
//! - `${release.id}` / `${release.short_id}` - Release UUID
//! - `${job.id}` - Build job ID
//! - `${timestamp}` - Unix timestamp
//! - `${date}` - ISO date (YYYY-MM-DD)

use std::collections::HashMap;
use std::sync::LazyLock;

use depot_core::Job;
use depot_core::id::short_uuid;
use regex::Regex;
use uuid::Uuid;

/// Variable context containing all available variables for interpolation.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    pub registry: String,
    pub git: GitContext,
    pub project: IdContext,
    pub service: IdContext,
    pub release: IdContext,
    pub job_id: String,
    /// Custom variables defined by the operator.
    pub custom: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct GitContext {
    pub sha: String,
    pub short_sha: String,
    pub branch: String,
}

/// A UUID in its full and shortened renderings.
#[derive(Debug, Clone, Default)]
pub struct IdContext {
    pub id: String,
    pub short_id: String,
}

impl IdContext {
    fn from_uuid(id: &Uuid) -> Self {
        Self {
            id: id.to_string(),
            short_id: short_uuid(id),
        }
    }
}

const VAR_PATTERN: &str = r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}";

// Regex for matching ${...} variables
static VAR_REGEX: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(VAR_PATTERN).ok());

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for rendering the image reference of a job.
    pub fn for_job(job: &Job, registry: &str) -> Self {
        Self {
            registry: registry.to_string(),
            git: GitContext {
                sha: job.source.git_sha.clone(),
                short_sha: job.source.short_sha().to_string(),
                branch: job.source.git_branch.clone(),
            },
            project: IdContext::from_uuid(&job.project_id),
            service: IdContext::from_uuid(&job.service_id),
            release: IdContext::from_uuid(&job.release_id),
            job_id: job.id.to_string(),
            custom: HashMap::new(),
        }
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.custom.insert(name.to_string(), value.into());
    }

    /// Resolve a variable name to its value.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();

        match parts.as_slice() {
            ["registry"] => Some(self.registry.clone()),

            ["git", "sha"] => Some(self.git.sha.clone()),
            ["git", "short_sha"] => Some(self.git.short_sha.clone()),
            ["git", "branch"] => Some(self.git.branch.clone()),

            ["project", field] => self.project.field(field),
            ["service", field] => self.service.field(field),
            ["release", field] => self.release.field(field),

            ["job", "id"] => Some(self.job_id.clone()),

            ["timestamp"] => Some(chrono::Utc::now().timestamp().to_string()),
            ["date"] => Some(chrono::Utc::now().format("%Y-%m-%d").to_string()),

            [name] => self.custom.get(*name).cloned(),

            _ => None,
        }
    }

    /// Interpolate all variables in a string.
    /// Unknown variables are left in place.
    pub fn interpolate(&self, input: &str) -> String {
        let Some(pattern) = VAR_REGEX.as_ref() else {
            return input.to_string();
        };
        pattern
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    /// Variables in `input` that this context cannot resolve.
    pub fn unresolved(&self, input: &str) -> Vec<String> {
        let Some(pattern) = VAR_REGEX.as_ref() else {
            return Vec::new();
        };
        pattern
            .captures_iter(input)
            .map(|caps| caps[1].to_string())
            .filter(|name| self.resolve(name).is_none())
            .collect()
    }
}

impl IdContext {
    fn field(&self, field: &str) -> Option<String> {
        match field {
            "id" => Some(self.id.clone()),
            "short_id" => Some(self.short_id.clone()),
            _ => None,
        }
    }
}

/// Builder for creating variable contexts.
pub struct VariableContextBuilder {
    ctx: VariableContext,
}

impl VariableContextBuilder {
    pub fn new() -> Self {
        Self {
            ctx: VariableContext::new(),
        }
    }

    pub fn with_registry(mut self, registry: impl Into<String>) -> Self {
        self.ctx.registry = registry.into();
        self
    }

    pub fn with_git_sha(mut self, sha: impl Into<String>) -> Self {
        let sha = sha.into();
        self.ctx.git.short_sha = sha.chars().take(8).collect();
        self.ctx.git.sha = sha;
        self
    }

    pub fn with_git_branch(mut self, branch: impl Into<String>) -> Self {
        self.ctx.git.branch = branch.into();
        self
    }

    pub fn with_project(mut self, id: &Uuid) -> Self {
        self.ctx.project = IdContext::from_uuid(id);
        self
    }

    pub fn with_service(mut self, id: &Uuid) -> Self {
        self.ctx.service = IdContext::from_uuid(id);
        self
    }

    pub fn with_release(mut self, id: &Uuid) -> Self {
        self.ctx.release = IdContext::from_uuid(id);
        self
    }

    pub fn with_custom(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.custom.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> VariableContext {
        self.ctx
    }
}

impl Default for VariableContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}
