//! Build collaborators for depot, driven through command-line tools.
//!
//! - [`DockerCliBackend`]: git clone, `docker build` or `pack build`, push, inspect
//! - [`SyftSbomGenerator`]: `syft <image> -o <format>`
//! - [`CosignSigner`]: `cosign sign` + `cosign triangulate`
//!
//! Every invocation goes through [`process::Process`], which streams output
//! into the job log and kills the child when the build is cancelled.

pub mod docker;
pub mod process;
pub mod sbom;
pub mod signing;

pub use docker::{DockerCliBackend, DockerCliSettings};
pub use sbom::SyftSbomGenerator;
pub use signing::CosignSigner;
