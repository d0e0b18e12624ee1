//! ワークフローのコラボレーター
//!
//! ビルドタスクが参照するディレクトリ・メタデータ・タグ設定を扱います。
//!
//! ```text
//! <build_dir>/<platform>/Dockerfile      BuildDirs::platform_dir
//! <context_dir>/workflow.json            ContextDir::load_workflow_data
//! <context_dir>/<platform>-build.log     ContextDir::platform_build_log
//! ```

use crate::error::{BuildError, BuildResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const DOCKERFILE: &str = "Dockerfile";
const WORKFLOW_DATA_FILE: &str = "workflow.json";

/// プラットフォームごとのビルドディレクトリ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildDir {
    pub path: PathBuf,
    pub platform: String,
}

impl BuildDir {
    pub fn dockerfile_path(&self) -> PathBuf {
        self.path.join(DOCKERFILE)
    }
}

/// ビルドディレクトリのルート
#[derive(Debug, Clone)]
pub struct BuildDirs {
    root: PathBuf,
}

impl BuildDirs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<platform>` を返す (Dockerfile が必須)
    pub fn platform_dir(&self, platform: &str) -> BuildResult<BuildDir> {
        let path = self.root.join(platform);
        if !path.is_dir() {
            return Err(BuildError::BuildDirNotFound(path));
        }

        let build_dir = BuildDir {
            path,
            platform: platform.to_string(),
        };
        let dockerfile = build_dir.dockerfile_path();
        if !dockerfile.is_file() {
            return Err(BuildError::DockerfileNotFound(dockerfile));
        }

        Ok(build_dir)
    }
}

/// タスク間で共有されるコンテキストディレクトリ
#[derive(Debug, Clone)]
pub struct ContextDir {
    path: PathBuf,
}

impl ContextDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn workflow_data_path(&self) -> PathBuf {
        self.path.join(WORKFLOW_DATA_FILE)
    }

    /// プラットフォームのビルドログ
    pub fn platform_build_log(&self, platform: &str) -> PathBuf {
        self.path.join(format!("{}-build.log", platform))
    }

    /// workflow.json を読み込む
    pub fn load_workflow_data(&self) -> BuildResult<WorkflowData> {
        let content = std::fs::read_to_string(self.workflow_data_path())?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// ワークフローのメタデータ
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowData {
    /// 有効なプラットフォーム (未設定なら何もビルドしない)
    #[serde(default)]
    pub platforms: Option<Vec<String>>,

    #[serde(default)]
    pub buildargs: HashMap<String, String>,

    #[serde(default)]
    pub tag_conf: TagConf,
}

impl WorkflowData {
    pub fn enabled_platforms(&self) -> &[String] {
        self.platforms.as_deref().unwrap_or_default()
    }

    pub fn is_platform_enabled(&self, platform: &str) -> bool {
        self.enabled_platforms().iter().any(|p| p == platform)
    }
}

/// 出力イメージのタグ設定
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagConf {
    #[serde(default)]
    pub unique_images: Vec<String>,
}

impl TagConf {
    /// unique イメージのタグに `-<platform>` を付けたもの
    ///
    /// # Examples
    /// - `registry.example.com/ns/app:1.0` -> `registry.example.com/ns/app:1.0-x86_64`
    /// - `localhost:5000/app` -> `localhost:5000/app:latest-x86_64`
    pub fn unique_images_with_platform(&self, platform: &str) -> Vec<String> {
        self.unique_images
            .iter()
            .map(|image| {
                let (repository, tag) = split_image_tag(image);
                format!("{}:{}-{}", repository, tag, platform)
            })
            .collect()
    }
}

/// イメージ名とタグを分離
///
/// # Examples
/// - `ghcr.io/org/app:v1.0` -> `("ghcr.io/org/app", "v1.0")`
/// - `ghcr.io/org/app` -> `("ghcr.io/org/app", "latest")`
/// - `localhost:5000/app:dev` -> `("localhost:5000/app", "dev")`
pub fn split_image_tag(image: &str) -> (String, String) {
    // 最後の ':' の後ろに '/' があればレジストリのポート番号
    if let Some(pos) = image.rfind(':') {
        let potential_tag = &image[pos + 1..];
        if !potential_tag.is_empty() && !potential_tag.contains('/') {
            return (image[..pos].to_string(), potential_tag.to_string());
        }
    }

    (image.to_string(), "latest".to_string())
}
