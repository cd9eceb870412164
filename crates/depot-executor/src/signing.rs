//! Image signing with `cosign`.

use async_trait::async_trait;
use depot_core::build::{ImageSigner, LogSink};
use depot_core::{Error, Result};
use tokio_util::sync::CancellationToken;

use crate::process::Process;

/// Signs an image and reports the signature's OCI reference. Without a
/// key, cosign signs keylessly through Fulcio and Rekor.
pub struct CosignSigner {
    cosign_bin: String,
    key: Option<String>,
}

impl CosignSigner {
    pub fn new(key: Option<String>) -> Self {
        Self::with_binary("cosign", key)
    }

    pub fn with_binary(cosign_bin: impl Into<String>, key: Option<String>) -> Self {
        Self {
            cosign_bin: cosign_bin.into(),
            key,
        }
    }
}

#[async_trait]
impl ImageSigner for CosignSigner {
    async fn sign(
        &self,
        cancel: &CancellationToken,
        image_uri: &str,
        logs: &dyn LogSink,
    ) -> Result<String> {
        let mut sign = Process::new(&self.cosign_bin).args(["sign", "--yes"]);
        if let Some(key) = &self.key {
            sign = sign.args(["--key", key.as_str()]);
        }
        sign.arg(image_uri).run(cancel, logs).await?;

        let reference = Process::new(&self.cosign_bin)
            .args(["triangulate", image_uri])
            .capture_stdout()
            .run(cancel, logs)
            .await?;

        let reference = reference.trim();
        if reference.is_empty() {
            return Err(Error::ExecutionFailed(format!(
                "{} triangulate returned nothing for {}",
                self.cosign_bin, image_uri
            )));
        }
        Ok(reference.to_string())
    }
}
