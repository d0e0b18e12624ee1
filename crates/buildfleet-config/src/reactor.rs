//! reactor 設定ファイルのモデル
//!
//! ビルドタスクが参照する設定 (リモートホストのプール、レジストリ、
//! イメージサイズ上限) を YAML から読み込みます。

use crate::error::{ConfigError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// サポートしている設定ファイルのバージョン
pub const CONFIG_VERSION: u32 = 1;

fn default_version() -> u32 {
    CONFIG_VERSION
}

/// reactor 設定全体
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReactorConfig {
    #[serde(default = "default_version")]
    pub version: u32,

    /// リモートビルドホストのプール
    #[serde(default)]
    pub remote_hosts: RemoteHostsConfig,

    /// push 先レジストリ
    #[serde(default)]
    pub registry: RegistryConfig,

    /// イメージ種別ごとのサイズ上限
    #[serde(default)]
    pub image_size_limit: ImageSizeLimit,
}

impl ReactorConfig {
    /// 設定ファイルを読み込む
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content, path)
    }

    /// YAML 文字列から読み込む (`origin` はエラーメッセージ用)
    pub fn from_yaml_str(content: &str, origin: &Path) -> Result<Self> {
        let config: ReactorConfig =
            serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
                path: origin.to_path_buf(),
                source,
            })?;

        if config.version != CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion(config.version));
        }

        tracing::debug!(
            "Loaded reactor config from {} ({} platform pools)",
            origin.display(),
            config.remote_hosts.pools.len()
        );
        Ok(config)
    }
}

/// `remote_hosts` セクション
///
/// プラットフォームごとのホスト定義は設定ファイルの記述順を保持するため、
/// `serde_yaml::Mapping` のまま保持し、参照時に検証します。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteHostsConfig {
    /// slot 台帳を置くディレクトリ。未指定ならプロセス内で管理する
    #[serde(default)]
    pub slots_dir: Option<PathBuf>,

    /// リースの有効期限 (秒)。未指定なら期限なし
    #[serde(default)]
    pub lease_ttl: Option<u64>,

    /// platform -> (hostname -> ホスト定義)
    #[serde(default)]
    pub pools: BTreeMap<String, serde_yaml::Mapping>,
}

/// 検証済みのホスト定義
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHostEntry {
    pub hostname: String,
    pub username: String,
    pub ssh_keyfile: PathBuf,
    pub socket_path: PathBuf,
    pub slots: u32,
    pub enabled: bool,
}

/// YAML 上のホスト定義 (必須項目の欠落を検出するため全て Option)
#[derive(Debug, Deserialize)]
struct RawHostEntry {
    enabled: Option<bool>,
    auth: Option<PathBuf>,
    username: Option<String>,
    slots: Option<i64>,
    socket_path: Option<PathBuf>,
}

impl RemoteHostsConfig {
    /// リースの有効期限 (0 は期限なし)
    pub fn lease_ttl(&self) -> Option<Duration> {
        self.lease_ttl.filter(|secs| *secs > 0).map(Duration::from_secs)
    }

    /// 設定されているプラットフォーム一覧
    pub fn platforms(&self) -> impl Iterator<Item = &str> {
        self.pools.keys().map(String::as_str)
    }

    /// 指定プラットフォームのホスト定義を記述順で返す
    ///
    /// プラットフォームのプールが存在しない場合は空を返します。
    /// 無効化されたホストも含みます (選択対象から外すのはプール側の責務)。
    pub fn hosts_for(&self, platform: &str) -> Result<Vec<RemoteHostEntry>> {
        let Some(pool) = self.pools.get(platform) else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::with_capacity(pool.len());
        for (key, value) in pool {
            let hostname = key
                .as_str()
                .ok_or_else(|| {
                    ConfigError::invalid_host(platform, format!("{:?}", key), "hostname must be a string")
                })?
                .to_string();

            let raw: RawHostEntry = serde_yaml::from_value(value.clone())
                .map_err(|e| ConfigError::invalid_host(platform, &hostname, e.to_string()))?;

            entries.push(Self::validate(platform, hostname, raw)?);
        }

        Ok(entries)
    }

    fn validate(platform: &str, hostname: String, raw: RawHostEntry) -> Result<RemoteHostEntry> {
        let missing = |field: &str| {
            ConfigError::invalid_host(platform, &hostname, format!("missing required field '{}'", field))
        };

        let ssh_keyfile = raw.auth.ok_or_else(|| missing("auth"))?;
        let username = raw.username.ok_or_else(|| missing("username"))?;
        let socket_path = raw.socket_path.ok_or_else(|| missing("socket_path"))?;
        let slots = raw.slots.ok_or_else(|| missing("slots"))?;

        let slots = u32::try_from(slots)
            .ok()
            .filter(|s| *s > 0)
            .ok_or_else(|| {
                ConfigError::invalid_host(
                    platform,
                    &hostname,
                    format!("slots must be a positive integer, got {}", slots),
                )
            })?;

        if username.is_empty() {
            return Err(ConfigError::invalid_host(platform, &hostname, "username is empty"));
        }

        Ok(RemoteHostEntry {
            hostname,
            username,
            ssh_keyfile,
            socket_path,
            slots,
            enabled: raw.enabled.unwrap_or(true),
        })
    }
}

/// `registry` セクション
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistryConfig {
    /// レジストリの URI (例: "registry.example.com:5000")
    #[serde(default)]
    pub uri: Option<String>,

    /// TLS 検証を無効にする
    #[serde(default)]
    pub insecure: bool,

    /// .dockercfg / .dockerconfigjson を含むディレクトリ、またはファイル
    #[serde(default)]
    pub secret: Option<PathBuf>,
}

/// `image_size_limit` セクション (バイト単位、0 は無制限)
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ImageSizeLimit {
    #[serde(default)]
    pub binary_image: u64,
}

impl ImageSizeLimit {
    /// バイナリイメージのサイズ上限。0 の場合は None
    pub fn binary_image_limit(&self) -> Option<u64> {
        (self.binary_image > 0).then_some(self.binary_image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version: 1
remote_hosts:
  slots_dir: /var/lib/buildfleet/slots
  lease_ttl: 3600
  pools:
    x86_64:
      remote-host-2:
        enabled: true
        auth: /secrets/ssh/id_rsa
        username: podman-user
        slots: 2
        socket_path: /run/user/2022/podman/podman.sock
      remote-host-1:
        auth: /secrets/ssh/id_rsa
        username: podman-user
        slots: 3
        socket_path: /run/user/2022/podman/podman.sock
    ppc64le:
      remote-host-ppc:
        enabled: false
        auth: /secrets/ssh/id_rsa
        username: podman-user
        slots: 1
        socket_path: /run/user/2022/podman/podman.sock
registry:
  uri: registry.example.com
  insecure: true
  secret: /secrets/registry
image_size_limit:
  binary_image: 1048576
"#;

    fn parse(content: &str) -> Result<ReactorConfig> {
        ReactorConfig::from_yaml_str(content, Path::new("reactor-config.yaml"))
    }

    #[test]
    fn test_parse_full_config() {
        let config = parse(SAMPLE).unwrap();

        assert_eq!(
            config.remote_hosts.slots_dir,
            Some(PathBuf::from("/var/lib/buildfleet/slots"))
        );
        assert_eq!(config.remote_hosts.lease_ttl(), Some(Duration::from_secs(3600)));
        assert_eq!(config.registry.uri.as_deref(), Some("registry.example.com"));
        assert!(config.registry.insecure);
        assert_eq!(config.image_size_limit.binary_image_limit(), Some(1048576));

        let platforms: Vec<&str> = config.remote_hosts.platforms().collect();
        assert_eq!(platforms, vec!["ppc64le", "x86_64"]);
    }

    #[test]
    fn test_hosts_keep_config_order() {
        let config = parse(SAMPLE).unwrap();
        let hosts = config.remote_hosts.hosts_for("x86_64").unwrap();

        let names: Vec<&str> = hosts.iter().map(|h| h.hostname.as_str()).collect();
        assert_eq!(names, vec!["remote-host-2", "remote-host-1"]);

        // enabled は省略時 true
        assert!(hosts[1].enabled);
        assert_eq!(hosts[1].slots, 3);
        assert_eq!(hosts[1].ssh_keyfile, PathBuf::from("/secrets/ssh/id_rsa"));
    }

    #[test]
    fn test_hosts_for_unknown_platform_is_empty() {
        let config = parse(SAMPLE).unwrap();
        assert!(config.remote_hosts.hosts_for("s390x").unwrap().is_empty());
    }

    #[test]
    fn test_disabled_host_is_still_listed() {
        let config = parse(SAMPLE).unwrap();
        let hosts = config.remote_hosts.hosts_for("ppc64le").unwrap();
        assert_eq!(hosts.len(), 1);
        assert!(!hosts[0].enabled);
    }

    #[test]
    fn test_missing_required_field() {
        let config = parse(
            r#"
remote_hosts:
  pools:
    x86_64:
      remote-host-1:
        auth: /secrets/ssh/id_rsa
        slots: 1
        socket_path: /run/podman.sock
"#,
        )
        .unwrap();

        let err = config.remote_hosts.hosts_for("x86_64").unwrap_err();
        match err {
            ConfigError::InvalidRemoteHost { host, reason, .. } => {
                assert_eq!(host, "remote-host-1");
                assert!(reason.contains("username"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_non_positive_slots() {
        let config = parse(
            r#"
remote_hosts:
  pools:
    x86_64:
      remote-host-1:
        auth: /secrets/ssh/id_rsa
        username: podman-user
        slots: 0
        socket_path: /run/podman.sock
"#,
        )
        .unwrap();

        assert!(matches!(
            config.remote_hosts.hosts_for("x86_64"),
            Err(ConfigError::InvalidRemoteHost { .. })
        ));
    }

    #[test]
    fn test_host_entry_must_be_mapping() {
        let config = parse(
            r#"
remote_hosts:
  pools:
    x86_64:
      remote-host-1: "not a mapping"
"#,
        )
        .unwrap();

        assert!(config.remote_hosts.hosts_for("x86_64").is_err());
    }

    #[test]
    fn test_defaults() {
        let config = parse("{}").unwrap();
        assert_eq!(config.version, CONFIG_VERSION);
        assert!(config.remote_hosts.slots_dir.is_none());
        assert!(config.remote_hosts.lease_ttl().is_none());
        assert!(!config.registry.insecure);
        assert_eq!(config.image_size_limit.binary_image_limit(), None);
    }

    #[test]
    fn test_zero_lease_ttl_disables_expiry() {
        let config = parse("remote_hosts:\n  lease_ttl: 0\n").unwrap();
        assert_eq!(config.remote_hosts.lease_ttl, Some(0));
        assert!(config.remote_hosts.lease_ttl().is_none());
    }

    #[test]
    fn test_unsupported_version() {
        assert!(matches!(
            parse("version: 2"),
            Err(ConfigError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn test_invalid_yaml() {
        assert!(matches!(
            parse("remote_hosts: [unclosed"),
            Err(ConfigError::Parse { .. })
        ));
    }
}
