use buildfleet_config::ConfigError;
use buildfleet_pool::PoolError;
use std::path::PathBuf;
use thiserror::Error;

/// イメージ inspect の失敗理由
#[derive(Debug, Error)]
pub enum InspectFailure {
    #[error("inspect command failed (rc={code})")]
    CommandFailed { code: i32 },

    #[error("image inspect didn't return any results")]
    NoResults,

    #[error("image inspect returned invalid JSON: {0}")]
    InvalidJson(String),

    #[error("image inspect result has no Size")]
    MissingSize,
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Dockerfile not found: {0}")]
    DockerfileNotFound(PathBuf),

    #[error("Build directory not found: {0}")]
    BuildDirNotFound(PathBuf),

    #[error("No destination tag for platform {0}")]
    NoDestinationTag(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(
        "Failed to acquire a build slot on any remote host for platform {platform}! \
         See the logs for more details."
    )]
    NoSlotAvailable { platform: String },

    #[error("Could not find either podman or podman-remote in $PATH!")]
    EngineNotFound,

    #[error("Failed to set up podman-remote connection: {0}")]
    SetupFailed(String),

    #[error("Build failed (rc={code}): {last_line}")]
    BuildProcess { code: i32, last_line: String },

    #[error(
        "The size {size} of image {image} exceeds the limitation {limit} configured in reactor config."
    )]
    ExceedsImageSize { size: u64, image: String, limit: u64 },

    #[error("Couldn't check image size for image:{image}: {reason}")]
    Inspect {
        image: String,
        reason: InspectFailure,
    },

    #[error("Push failed (rc={code}). Check the logs for more details.")]
    PushFailed { code: i32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BuildError {
    /// ビルド自体ではなく、基盤側 (ホスト・接続・ローカル環境) の失敗か
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            BuildError::NoSlotAvailable { .. }
                | BuildError::EngineNotFound
                | BuildError::SetupFailed(_)
                | BuildError::Pool(_)
                | BuildError::Io(_)
        )
    }

    /// ユーザー向けの分かりやすいエラーメッセージ
    pub fn user_message(&self) -> String {
        match self {
            BuildError::NoSlotAvailable { platform } => {
                format!(
                    "{}\n\
                     \n\
                     解決方法:\n\
                     1. remote_hosts.pools.{} に有効なホストがあるか確認してください\n\
                     2. 各ホストの slots が埋まっていないか確認してください\n\
                     3. 時間をおいてタスクを再実行してください",
                    self, platform
                )
            }
            BuildError::SetupFailed(_) => {
                format!(
                    "{}\n\
                     \n\
                     リモートホストへの SSH 接続 (鍵ファイル、socket_path) を確認してください。",
                    self
                )
            }
            BuildError::ExceedsImageSize { .. } => {
                format!(
                    "{}\n\
                     \n\
                     ビルドは成功しましたが、イメージがサイズ上限を超えたため push していません。",
                    self
                )
            }
            BuildError::DockerfileNotFound(path) => {
                format!(
                    "Dockerfileが見つかりません: {}\n\
                     \n\
                     プラットフォームごとのビルドディレクトリを確認してください。",
                    path.display()
                )
            }
            _ => format!("{}", self),
        }
    }
}

pub type BuildResult<T> = std::result::Result<T, BuildError>;
