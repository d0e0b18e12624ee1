use buildfleet_build::{BinaryBuildTaskParams, UserParams, WorkflowData};
use buildfleet_config::ReactorConfig;
use buildfleet_pool::ResourcePool;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const PLATFORM: &str = "x86_64";
pub const PRID: &str = "pipeline-run-7";
pub const IMAGE: &str = "registry.example.com/ns/app:build-7";
pub const DEST_TAG: &str = "registry.example.com/ns/app:build-7-x86_64";
pub const DOCKERFILE: &str = "FROM registry.fedoraproject.org/fedora:latest\nRUN true\n";

/// Scratch layout: build/, context/, slots/ and a reactor config
pub struct TestWorkspace {
    pub root: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let workspace = Self { root };

        let build_dir = workspace.build_dir().join(PLATFORM);
        fs::create_dir_all(&build_dir).unwrap();
        fs::write(build_dir.join("Dockerfile"), DOCKERFILE).unwrap();
        fs::create_dir_all(workspace.context_dir()).unwrap();
        workspace
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    pub fn build_dir(&self) -> PathBuf {
        self.path().join("build")
    }

    pub fn context_dir(&self) -> PathBuf {
        self.path().join("context")
    }

    pub fn slots_dir(&self) -> PathBuf {
        self.path().join("slots")
    }

    pub fn build_log(&self) -> PathBuf {
        self.context_dir().join(format!("{}-build.log", PLATFORM))
    }

    pub fn workflow(&self, platforms: &[&str]) -> WorkflowData {
        serde_json::from_value(serde_json::json!({
            "platforms": platforms,
            "buildargs": {"VERSION": "1.0"},
            "tag_conf": {"unique_images": [IMAGE]},
        }))
        .unwrap()
    }

    #[allow(dead_code)]
    pub fn write_workflow(&self, platforms: &[&str]) {
        fs::write(
            self.context_dir().join("workflow.json"),
            serde_json::to_string(&self.workflow(platforms)).unwrap(),
        )
        .unwrap();
    }

    /// Reactor config with one x86_64 host of `slots` slots
    pub fn config_yaml(&self, slots: u32, size_limit: u64) -> String {
        self.config_yaml_with(slots, size_limit, None)
    }

    pub fn config_yaml_with(&self, slots: u32, size_limit: u64, lease_ttl: Option<u64>) -> String {
        let lease_ttl = lease_ttl
            .map(|secs| format!("\n  lease_ttl: {}", secs))
            .unwrap_or_default();
        format!(
            r#"
version: 1
remote_hosts:
  slots_dir: {slots_dir}{lease_ttl}
  pools:
    x86_64:
      remote-host-1:
        enabled: true
        auth: /secrets/id_rsa
        username: podman-user
        slots: {slots}
        socket_path: /run/user/1000/podman/podman.sock
registry:
  uri: registry.example.com
  insecure: true
image_size_limit:
  binary_image: {size_limit}
"#,
            slots_dir = self.slots_dir().display(),
        )
    }

    pub fn config(&self, slots: u32, size_limit: u64) -> ReactorConfig {
        ReactorConfig::from_yaml_str(&self.config_yaml(slots, size_limit), Path::new("test.yaml"))
            .unwrap()
    }

    #[allow(dead_code)]
    pub fn config_with_lease_ttl(&self, slots: u32, lease_ttl: u64) -> ReactorConfig {
        ReactorConfig::from_yaml_str(
            &self.config_yaml_with(slots, 0, Some(lease_ttl)),
            Path::new("test.yaml"),
        )
        .unwrap()
    }

    #[allow(dead_code)]
    pub fn write_config(&self, slots: u32, size_limit: u64) -> PathBuf {
        let path = self.path().join("reactor-config.yaml");
        fs::write(&path, self.config_yaml(slots, size_limit)).unwrap();
        path
    }

    pub fn params(&self, flatpak: bool) -> BinaryBuildTaskParams {
        BinaryBuildTaskParams {
            platform: PLATFORM.to_string(),
            pipeline_run_name: PRID.to_string(),
            user_params: UserParams { flatpak },
            config_file: None,
            build_dir: self.build_dir(),
            context_dir: self.context_dir(),
        }
    }

    /// Leased counts of the configured pool
    pub fn leased_counts(&self) -> Vec<(String, u32)> {
        let config = self.config(1, 0);
        ResourcePool::from_config(&config.remote_hosts, PLATFORM)
            .unwrap()
            .leased_counts()
            .unwrap()
    }
}
