//! SBOM generation with `syft`.

use async_trait::async_trait;
use depot_core::build::{LogSink, Sbom, SbomGenerator};
use depot_core::{Error, Result};
use tokio_util::sync::CancellationToken;

use crate::process::Process;

pub struct SyftSbomGenerator {
    syft_bin: String,
}

impl SyftSbomGenerator {
    pub fn new() -> Self {
        Self::with_binary("syft")
    }

    pub fn with_binary(syft_bin: impl Into<String>) -> Self {
        Self {
            syft_bin: syft_bin.into(),
        }
    }
}

impl Default for SyftSbomGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SbomGenerator for SyftSbomGenerator {
    async fn generate(
        &self,
        cancel: &CancellationToken,
        image_uri: &str,
        format: &str,
        logs: &dyn LogSink,
    ) -> Result<Sbom> {
        let content = Process::new(&self.syft_bin)
            .args([image_uri, "-o", format])
            .capture_stdout()
            .run(cancel, logs)
            .await?;

        if content.trim().is_empty() {
            return Err(Error::ExecutionFailed(format!(
                "{} produced an empty SBOM for {}",
                self.syft_bin, image_uri
            )));
        }

        logs.system(format!("Generated {} SBOM ({} bytes)", format, content.len()))
            .await;
        Ok(Sbom {
            content,
            format: format.to_string(),
        })
    }
}
