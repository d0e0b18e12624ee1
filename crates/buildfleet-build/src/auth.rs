//! レジストリ認証ファイルの解決
//!
//! reactor 設定の `registry.secret` から、リモートビルダーに渡す
//! 認証ファイル (containers-auth.json 互換) のパスを求めます。

use buildfleet_config::{ConfigError, RegistryConfig};
use base64::Engine;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// 認証エントリ
#[derive(Debug, Deserialize)]
struct AuthEntry {
    /// Base64エンコードされた "username:password"
    auth: Option<String>,
}

/// レジストリの secret (`.dockercfg` / `.dockerconfigjson`)
#[derive(Debug)]
pub struct RegistryAuth {
    config_path: PathBuf,
    auths: HashMap<String, AuthEntry>,
}

impl RegistryAuth {
    /// secret のパスから認証ファイルを読み込む
    ///
    /// 検索順序:
    /// 1. `<secret>/.dockercfg`
    /// 2. `<secret>/.dockerconfigjson`
    /// 3. `<secret>` 自体
    pub fn from_secret_path(secret_path: &Path) -> ConfigResult<Self> {
        let candidates = [
            secret_path.join(".dockercfg"),
            secret_path.join(".dockerconfigjson"),
        ];

        let config_path = candidates
            .into_iter()
            .find(|p| p.is_file())
            .or_else(|| secret_path.is_file().then(|| secret_path.to_path_buf()))
            .ok_or_else(|| ConfigError::RegistrySecretNotFound(secret_path.to_path_buf()))?;

        let auths = Self::load_auths(&config_path)?;
        let auth = Self { config_path, auths };
        auth.validate()?;
        Ok(auth)
    }

    /// 認証ファイルのパス
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// レジストリの認証情報が含まれているか
    ///
    /// `host:port` で比較するため、スキーム付きのエントリにも一致します。
    pub fn has_credentials_for(&self, registry: &str) -> bool {
        let wanted = registry_hostname(registry);
        self.auths.keys().any(|key| registry_hostname(key) == wanted)
    }

    /// 認証ファイルを読み込み
    ///
    /// `.dockerconfigjson` 形式 (`{"auths": {...}}`) と
    /// `.dockercfg` 形式 (レジストリが直下) の両方を受け付けます。
    fn load_auths(path: &Path) -> ConfigResult<HashMap<String, AuthEntry>> {
        let invalid = |message: String| ConfigError::InvalidRegistrySecret {
            path: path.to_path_buf(),
            message,
        };

        let content = std::fs::read_to_string(path)
            .map_err(|e| invalid(format!("Failed to read secret: {}", e)))?;
        let mut value: serde_json::Value = serde_json::from_str(&content)
            .map_err(|e| invalid(format!("Failed to parse secret: {}", e)))?;

        if let Some(auths) = value.get_mut("auths") {
            value = auths.take();
        }

        serde_json::from_value(value).map_err(|e| invalid(format!("Unexpected secret layout: {}", e)))
    }

    /// 各エントリの auth が "username:password" の Base64 であることを確認
    fn validate(&self) -> ConfigResult<()> {
        for (registry, entry) in &self.auths {
            let Some(auth_b64) = &entry.auth else {
                continue;
            };

            let decoded = base64::engine::general_purpose::STANDARD
                .decode(auth_b64)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok());

            if !decoded.is_some_and(|s| s.contains(':')) {
                return Err(ConfigError::InvalidRegistrySecret {
                    path: self.config_path.clone(),
                    message: format!("Failed to parse 'auth' for {}", registry),
                });
            }
        }
        Ok(())
    }
}

/// レジストリ参照を `host:port` だけにする
///
/// # Examples
/// - `https://registry.example.com/v2/` -> `registry.example.com`
/// - `registry.example.com:5000` -> `registry.example.com:5000`
pub fn registry_hostname(registry: &str) -> &str {
    let without_scheme = registry
        .strip_prefix("https://")
        .or_else(|| registry.strip_prefix("http://"))
        .unwrap_or(registry);
    without_scheme.split('/').next().unwrap_or(without_scheme)
}

/// レジストリ設定から認証ファイルのパスを取得 (secret 未設定なら None)
pub fn get_authfile_path(registry: &RegistryConfig) -> ConfigResult<Option<PathBuf>> {
    let Some(secret_path) = &registry.secret else {
        return Ok(None);
    };

    let auth = RegistryAuth::from_secret_path(secret_path)?;
    if let Some(uri) = &registry.uri
        && !auth.has_credentials_for(uri)
    {
        tracing::warn!(
            "{} not found in {}",
            registry_hostname(uri),
            auth.config_path().display()
        );
    }

    Ok(Some(auth.config_path))
}
