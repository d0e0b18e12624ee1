use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("設定ディレクトリが見つかりません")]
    ConfigDirNotFound,

    #[error(
        "reactor 設定ファイルが見つかりません。以下の場所を確認してください:\n\
        - カレントディレクトリ: reactor-config.yaml, .reactor-config.yaml\n\
        - ~/.config/buildfleet/reactor-config.yaml\n\
        または BUILDFLEET_CONFIG_PATH 環境変数で直接指定できます"
    )]
    ConfigFileNotFound,

    #[error("reactor 設定ファイルの解析に失敗しました ({path}): {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("サポートされていない設定バージョンです: {0}")]
    UnsupportedVersion(u32),

    #[error("remote_hosts の設定が不正です (platform={platform}, host={host}): {reason}")]
    InvalidRemoteHost {
        platform: String,
        host: String,
        reason: String,
    },

    #[error(
        "レジストリの secret が見つかりません: {0}\n\
        (.dockercfg または .dockerconfigjson が必要です)"
    )]
    RegistrySecretNotFound(PathBuf),

    #[error("レジストリの secret を読み込めません ({path}): {message}")]
    InvalidRegistrySecret { path: PathBuf, message: String },

    #[error("IO エラー: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub(crate) fn invalid_host(
        platform: impl Into<String>,
        host: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        ConfigError::InvalidRemoteHost {
            platform: platform.into(),
            host: host.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;
