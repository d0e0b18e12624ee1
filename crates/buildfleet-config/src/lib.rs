//! buildfleet の reactor 設定
//!
//! 設定ファイルの探索と読み込みを提供します。

pub mod error;
pub mod reactor;

pub use error::*;
pub use reactor::{
    CONFIG_VERSION, ImageSizeLimit, ReactorConfig, RegistryConfig, RemoteHostEntry,
    RemoteHostsConfig,
};

use std::path::PathBuf;

/// 設定ファイルのパスを直接指定する環境変数
pub const CONFIG_PATH_ENV: &str = "BUILDFLEET_CONFIG_PATH";

const CONFIG_FILE_CANDIDATES: [&str; 2] = ["reactor-config.yaml", ".reactor-config.yaml"];

/// buildfleet のグローバル設定ディレクトリを取得
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("buildfleet");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

/// reactor 設定ファイルを探す
///
/// 以下の優先順位で検索:
/// 1. 環境変数 BUILDFLEET_CONFIG_PATH (直接パス指定)
/// 2. カレントディレクトリ: reactor-config.yaml, .reactor-config.yaml
/// 3. ~/.config/buildfleet/reactor-config.yaml (グローバル設定)
pub fn find_config_file() -> Result<PathBuf> {
    // 1. 環境変数で直接指定
    if let Ok(config_path) = std::env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(path);
        }
        tracing::warn!(
            "{} points to a missing file: {}",
            CONFIG_PATH_ENV,
            path.display()
        );
    }

    // 2. カレントディレクトリで検索
    let current_dir = std::env::current_dir()?;
    for filename in &CONFIG_FILE_CANDIDATES {
        let path = current_dir.join(filename);
        if path.exists() {
            return Ok(path);
        }
    }

    // 3. グローバル設定
    if let Some(config_dir) = dirs::config_dir() {
        let global_config = config_dir.join("buildfleet").join(CONFIG_FILE_CANDIDATES[0]);
        if global_config.exists() {
            return Ok(global_config);
        }
    }

    Err(ConfigError::ConfigFileNotFound)
}

/// 設定ファイルを探して読み込む
pub fn load_config() -> Result<ReactorConfig> {
    let path = find_config_file()?;
    ReactorConfig::load(&path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    #[test]
    #[serial]
    fn test_get_config_dir() {
        let temp_dir = tempfile::tempdir().unwrap();

        // XDG_CONFIG_HOME / HOME を一時ディレクトリへ向ける
        temp_env::with_vars(
            [
                ("XDG_CONFIG_HOME", Some(temp_dir.path().join("config"))),
                ("HOME", Some(temp_dir.path().to_path_buf())),
            ],
            || {
                let config_dir = get_config_dir().unwrap();
                assert!(config_dir.ends_with("buildfleet"));
                assert!(config_dir.exists());
            },
        );
    }

    #[test]
    #[serial]
    fn test_find_config_file_in_current_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();

        fs::write(temp_dir.path().join("reactor-config.yaml"), "version: 1").unwrap();
        std::env::set_current_dir(&temp_dir).unwrap();

        let result = temp_env::with_var_unset(CONFIG_PATH_ENV, find_config_file);

        std::env::set_current_dir(original_dir).unwrap();
        assert!(result.unwrap().ends_with("reactor-config.yaml"));
    }

    #[test]
    #[serial]
    fn test_visible_file_priority() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();

        fs::write(temp_dir.path().join("reactor-config.yaml"), "version: 1").unwrap();
        fs::write(temp_dir.path().join(".reactor-config.yaml"), "version: 1").unwrap();
        std::env::set_current_dir(&temp_dir).unwrap();

        let result = temp_env::with_var_unset(CONFIG_PATH_ENV, find_config_file);

        std::env::set_current_dir(original_dir).unwrap();
        let path = result.unwrap();
        assert_eq!(path.file_name().unwrap(), "reactor-config.yaml");
    }

    #[test]
    #[serial]
    fn test_find_config_file_env_var() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("custom.yaml");
        fs::write(&config_path, "version: 1").unwrap();

        let result = temp_env::with_var(CONFIG_PATH_ENV, Some(&config_path), find_config_file);
        assert_eq!(result.unwrap(), config_path);
    }

    #[test]
    #[serial]
    fn test_load_config_via_env_var() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("custom.yaml");
        fs::write(
            &config_path,
            "registry:\n  uri: registry.example.com\nimage_size_limit:\n  binary_image: 10\n",
        )
        .unwrap();

        let config = temp_env::with_var(CONFIG_PATH_ENV, Some(&config_path), load_config).unwrap();
        assert_eq!(config.registry.uri.as_deref(), Some("registry.example.com"));
        assert_eq!(config.image_size_limit.binary_image, 10);
    }

    #[test]
    #[serial]
    fn test_find_config_file_not_found() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();

        std::env::set_current_dir(&temp_dir).unwrap();

        let result = temp_env::with_vars(
            [
                (CONFIG_PATH_ENV, None),
                ("XDG_CONFIG_HOME", Some(temp_dir.path().join("config"))),
                ("HOME", Some(temp_dir.path().to_path_buf())),
            ],
            find_config_file,
        );

        std::env::set_current_dir(original_dir).unwrap();

        if let Err(ConfigError::ConfigFileNotFound) = result {
            // 期待通りのエラー
        } else {
            panic!("Expected ConfigFileNotFound error");
        }
    }
}
