//! podman-remote wrapper
//!
//! Runs builds on a leased host through a named podman system connection.
//! Every command is issued as `podman --remote --connection=<name> ...`.

use crate::engine::RemoteBuilder;
use crate::error::{BuildError, BuildResult, InspectFailure};
use crate::output::BuildOutput;
use crate::workflow::BuildDir;
use async_trait::async_trait;
use buildfleet_pool::LockedResource;
use serde::Deserialize;
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// Devices made available to flatpak builds
const FLATPAK_DEVICES: [&str; 4] = ["null", "random", "urandom", "zero"];

/// Element of the `podman image inspect` result
#[derive(Debug, Deserialize)]
struct ImageInspect {
    #[serde(rename = "Size")]
    size: Option<u64>,
}

/// Builder bound to one remote host connection
#[derive(Debug, Clone)]
pub struct PodmanRemote {
    podman: PathBuf,
    connection_name: String,
    registries_authfile: Option<PathBuf>,
}

impl PodmanRemote {
    /// Add the `<prid>-<platform>` system connection for the leased host
    pub async fn setup_for(
        podman: impl Into<PathBuf>,
        resource: &LockedResource,
        registries_authfile: Option<PathBuf>,
    ) -> BuildResult<Self> {
        let podman = podman.into();
        let host = resource.host();
        let connection_name = connection_name(resource.prid(), resource.platform());

        let args: Vec<OsString> = vec![
            "system".into(),
            "connection".into(),
            "add".into(),
            prefixed("--identity=", &host.ssh_keyfile),
            prefixed("--socket-path=", &host.socket_path),
            connection_name.clone().into(),
            host.ssh_url().into(),
        ];

        tracing::debug!("Running: {} {}", podman.display(), display_args(&args));
        let output = Command::new(&podman)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            let mut message = String::from_utf8_lossy(&output.stdout).into_owned();
            message.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(BuildError::SetupFailed(message.trim().to_string()));
        }

        tracing::info!(
            "Added podman connection {} to {}",
            connection_name,
            host.hostname
        );

        Ok(Self {
            podman,
            connection_name,
            registries_authfile,
        })
    }

    pub fn registries_authfile(&self) -> Option<&Path> {
        self.registries_authfile.as_deref()
    }

    fn remote_command(&self, args: &[OsString]) -> Command {
        let mut cmd = Command::new(&self.podman);
        cmd.arg("--remote")
            .arg(format!("--connection={}", self.connection_name))
            .args(args)
            .stdin(Stdio::null());

        tracing::debug!(
            "Running: {} --remote --connection={} {}",
            self.podman.display(),
            self.connection_name,
            display_args(args)
        );
        cmd
    }

    /// Arguments of `podman build`, build directory last
    pub fn build_args(
        &self,
        build_dir: &Path,
        build_args: &HashMap<String, String>,
        dest_tag: &str,
        flatpak: bool,
    ) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "build".into(),
            format!("--tag={}", dest_tag).into(),
            "--no-cache".into(),
            "--pull-always".into(),
        ];

        if flatpak {
            args.push("--squash-all".into());
            args.extend(FLATPAK_DEVICES.iter().map(|device| {
                OsString::from(format!(
                    "--device=/dev/{0}:/var/tmp/flatpak-build/dev/{0}",
                    device
                ))
            }));
        } else {
            args.push("--squash".into());
        }

        let mut sorted: Vec<_> = build_args.iter().collect();
        sorted.sort();
        args.extend(
            sorted
                .into_iter()
                .map(|(key, value)| OsString::from(format!("--build-arg={}={}", key, value))),
        );

        if let Some(authfile) = &self.registries_authfile {
            args.push(prefixed("--authfile=", authfile));
        }

        args.push(build_dir.as_os_str().to_owned());
        args
    }

    /// Arguments of `podman push`
    pub fn push_args(&self, dest_tag: &str, insecure: bool) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["push".into(), "--format=v2s2".into()];
        if let Some(authfile) = &self.registries_authfile {
            args.push(prefixed("--authfile=", authfile));
        }
        if insecure {
            args.push("--tls-verify=false".into());
        }
        args.push(dest_tag.into());
        args
    }
}

#[async_trait]
impl RemoteBuilder for PodmanRemote {
    fn connection_name(&self) -> &str {
        &self.connection_name
    }

    async fn build_container(
        &self,
        build_dir: &BuildDir,
        build_args: &HashMap<String, String>,
        dest_tag: &str,
        flatpak: bool,
    ) -> BuildResult<BuildOutput> {
        let args = self.build_args(&build_dir.path, build_args, dest_tag, flatpak);
        Ok(BuildOutput::spawn(self.remote_command(&args))?)
    }

    async fn get_image_size(&self, dest_tag: &str) -> BuildResult<u64> {
        let args: Vec<OsString> = vec!["image".into(), "inspect".into(), dest_tag.into()];
        let output = self.remote_command(&args).output().await?;

        let inspect_error = |reason| BuildError::Inspect {
            image: dest_tag.to_string(),
            reason,
        };

        if !output.status.success() {
            tracing::error!(
                "image inspect failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Err(inspect_error(InspectFailure::CommandFailed {
                code: output.status.code().unwrap_or(-1),
            }));
        }

        parse_image_size(&output.stdout).map_err(inspect_error)
    }

    async fn push_container(&self, dest_tag: &str, insecure: bool) -> BuildResult<()> {
        let args = self.push_args(dest_tag, insecure);
        let output = self.remote_command(&args).output().await?;

        for line in String::from_utf8_lossy(&output.stdout)
            .lines()
            .chain(String::from_utf8_lossy(&output.stderr).lines())
        {
            tracing::info!("{}", line);
        }

        if !output.status.success() {
            return Err(BuildError::PushFailed {
                code: output.status.code().unwrap_or(-1),
            });
        }

        tracing::info!("Pushed {}", dest_tag);
        Ok(())
    }
}

/// `<prid>-<platform>`
pub fn connection_name(prid: &str, platform: &str) -> String {
    format!("{}-{}", prid, platform)
}

/// Size of the first image in `podman image inspect` JSON output
pub fn parse_image_size(stdout: &[u8]) -> Result<u64, InspectFailure> {
    let images: Vec<ImageInspect> =
        serde_json::from_slice(stdout).map_err(|e| InspectFailure::InvalidJson(e.to_string()))?;
    let first = images.into_iter().next().ok_or(InspectFailure::NoResults)?;
    first.size.ok_or(InspectFailure::MissingSize)
}

fn prefixed(flag: &str, path: &Path) -> OsString {
    let mut arg = OsString::from(flag);
    arg.push(path.as_os_str());
    arg
}

fn display_args(args: &[OsString]) -> String {
    args.iter()
        .map(|arg| arg.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}
