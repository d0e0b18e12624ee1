//! Remote build engines
//!
//! A [`RemoteEngine`] turns a leased build slot into a [`RemoteBuilder`]
//! bound to that host. The podman implementation lives in
//! [`crate::podman`].

use crate::error::{BuildError, BuildResult};
use crate::output::BuildOutput;
use crate::podman::PodmanRemote;
use crate::workflow::BuildDir;
use async_trait::async_trait;
use buildfleet_pool::LockedResource;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Executables tried, in order, when looking for podman
const PODMAN_CANDIDATES: [&str; 2] = ["podman", "podman-remote"];

/// Factory for builders connected to a leased remote host
#[async_trait]
pub trait RemoteEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Establish a named connection to the leased host
    async fn setup_for(
        &self,
        resource: &LockedResource,
        registries_authfile: Option<PathBuf>,
    ) -> BuildResult<Box<dyn RemoteBuilder>>;
}

/// Build operations executed on one remote host
#[async_trait]
pub trait RemoteBuilder: Send + Sync {
    fn connection_name(&self) -> &str;

    /// Start a build; the output is consumed lazily
    async fn build_container(
        &self,
        build_dir: &BuildDir,
        build_args: &HashMap<String, String>,
        dest_tag: &str,
        flatpak: bool,
    ) -> BuildResult<BuildOutput>;

    /// Size of the built image in bytes
    async fn get_image_size(&self, dest_tag: &str) -> BuildResult<u64>;

    async fn push_container(&self, dest_tag: &str, insecure: bool) -> BuildResult<()>;
}

/// Locate podman on `$PATH`
///
/// The lookup runs once per process; later calls return the cached result.
pub fn which_podman() -> Option<&'static Path> {
    static PODMAN: OnceLock<Option<PathBuf>> = OnceLock::new();
    PODMAN
        .get_or_init(|| {
            let path_var = std::env::var_os("PATH")?;
            let found = find_podman_in(&path_var);
            match &found {
                Some(path) => tracing::debug!("Using podman at {}", path.display()),
                None => tracing::warn!("Neither podman nor podman-remote found in $PATH"),
            }
            found
        })
        .as_deref()
}

/// First podman candidate found in the given `PATH` value
pub fn find_podman_in(path_var: &OsStr) -> Option<PathBuf> {
    PODMAN_CANDIDATES.iter().find_map(|name| {
        std::env::split_paths(path_var)
            .map(|dir| dir.join(name))
            .find(|candidate| is_executable(candidate))
    })
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// podman / podman-remote based engine
#[derive(Debug, Clone, Default)]
pub struct PodmanEngine {
    binary: Option<PathBuf>,
}

impl PodmanEngine {
    /// Engine using the podman found on `$PATH`
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine using an explicit podman executable
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: Some(binary.into()),
        }
    }

    fn podman(&self) -> BuildResult<PathBuf> {
        match &self.binary {
            Some(binary) => Ok(binary.clone()),
            None => which_podman()
                .map(Path::to_path_buf)
                .ok_or(BuildError::EngineNotFound),
        }
    }
}

#[async_trait]
impl RemoteEngine for PodmanEngine {
    fn name(&self) -> &str {
        "podman"
    }

    async fn setup_for(
        &self,
        resource: &LockedResource,
        registries_authfile: Option<PathBuf>,
    ) -> BuildResult<Box<dyn RemoteBuilder>> {
        let podman = self.podman()?;
        let remote = PodmanRemote::setup_for(podman, resource, registries_authfile).await?;
        Ok(Box::new(remote))
    }
}
