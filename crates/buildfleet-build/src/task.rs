//! バイナリコンテナビルドタスク
//!
//! 1 プラットフォーム分のビルドを、リモートホストのビルドスロットを
//! 借りて実行します。
//!
//! ```text
//! platform check ─► slot lock ─► connection setup ─► build ─► size check ─► push
//!                        │   └──── heartbeat (lease_ttl 設定時にリースを更新) ───┤
//!                        └──────────────── unlock (常に 1 回) ◄────────────────┘
//! ```

use crate::auth::get_authfile_path;
use crate::engine::{PodmanEngine, RemoteBuilder, RemoteEngine};
use crate::error::{BuildError, BuildResult};
use crate::output::BuildOutput;
use crate::workflow::{BuildDir, BuildDirs, ContextDir, WorkflowData};
use buildfleet_config::ReactorConfig;
use buildfleet_pool::{LeaseRenewer, LockedResource, PoolError, ResourcePool};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// リース更新間隔の下限
const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(100);

/// ユーザーが指定するビルドパラメータ
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserParams {
    /// flatpak 向けビルド (--squash-all とデバイスのマウント)
    #[serde(default)]
    pub flatpak: bool,
}

/// タスクパラメータ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryBuildTaskParams {
    pub platform: String,

    /// パイプライン実行名 (スロットのリース所有者)
    pub pipeline_run_name: String,

    #[serde(default)]
    pub user_params: UserParams,

    /// reactor 設定ファイル (未指定なら探索)
    #[serde(default)]
    pub config_file: Option<PathBuf>,

    pub build_dir: PathBuf,
    pub context_dir: PathBuf,
}

/// 1 プラットフォームのバイナリコンテナビルド
pub struct BinaryBuildTask {
    params: BinaryBuildTaskParams,
    config: ReactorConfig,
    workflow: WorkflowData,
    build_dirs: BuildDirs,
    context_dir: ContextDir,
    engine: Arc<dyn RemoteEngine>,
}

impl BinaryBuildTask {
    pub fn new(
        params: BinaryBuildTaskParams,
        config: ReactorConfig,
        workflow: WorkflowData,
        engine: Arc<dyn RemoteEngine>,
    ) -> Self {
        let build_dirs = BuildDirs::new(&params.build_dir);
        let context_dir = ContextDir::new(&params.context_dir);
        Self {
            params,
            config,
            workflow,
            build_dirs,
            context_dir,
            engine,
        }
    }

    /// 設定ファイルと workflow.json を読み込んでタスクを作成 (エンジンは podman)
    pub fn from_params(params: BinaryBuildTaskParams) -> BuildResult<Self> {
        let config = match &params.config_file {
            Some(path) => ReactorConfig::load(path)?,
            None => buildfleet_config::load_config()?,
        };
        let workflow = ContextDir::new(&params.context_dir).load_workflow_data()?;

        Ok(Self::new(
            params,
            config,
            workflow,
            Arc::new(PodmanEngine::new()),
        ))
    }

    pub fn params(&self) -> &BinaryBuildTaskParams {
        &self.params
    }

    /// ビルドを実行
    ///
    /// プラットフォームが有効でなければ何もせずに成功します。
    pub async fn execute(&self) -> BuildResult<()> {
        let platform = &self.params.platform;
        if !self.workflow.is_platform_enabled(platform) {
            tracing::info!(
                "Platform {} is not enabled for this build, skipping",
                platform
            );
            return Ok(());
        }

        let build_dir = self.build_dirs.platform_dir(platform)?;
        let result = self.run(&build_dir).await;
        self.log_dockerfile(&build_dir).await;
        result
    }

    async fn run(&self, build_dir: &BuildDir) -> BuildResult<()> {
        let platform = &self.params.platform;
        let dest_tag = self
            .workflow
            .tag_conf
            .unique_images_with_platform(platform)
            .into_iter()
            .next()
            .ok_or_else(|| BuildError::NoDestinationTag(platform.clone()))?;

        let authfile = get_authfile_path(&self.config.registry)?;
        let log_path = self.context_dir.platform_build_log(platform);
        let mut build_log = File::create(&log_path).await?;

        let pool = ResourcePool::from_config(&self.config.remote_hosts, platform)?;
        let prid = self.params.pipeline_run_name.clone();
        let resource = tokio::task::spawn_blocking(move || pool.lock_resource(&prid))
            .await
            .map_err(io::Error::other)??
            .ok_or_else(|| BuildError::NoSlotAvailable {
                platform: platform.clone(),
            })?;

        let heartbeat = self
            .config
            .remote_hosts
            .lease_ttl()
            .map(|ttl| LeaseHeartbeat::start(resource.renewer(), ttl));

        let result = self
            .build_on(&resource, authfile, build_dir, &dest_tag, &mut build_log)
            .await;

        if let Some(heartbeat) = heartbeat {
            heartbeat.stop().await;
        }

        let hostname = resource.host().hostname.clone();
        let released = tokio::task::spawn_blocking(move || resource.unlock())
            .await
            .map_err(|e| BuildError::Io(io::Error::other(e)))
            .and_then(|r| r.map_err(BuildError::from));

        match (result, released) {
            // push 済み。回収済みのリースは警告のみ
            (Ok(()), Err(BuildError::Pool(PoolError::NotLeased { host, prid }))) => {
                tracing::warn!(
                    "Build slot on {} for {} was already reclaimed before release",
                    host,
                    prid
                );
                Ok(())
            }
            (Ok(()), released) => released,
            (Err(e), Err(release_error)) => {
                tracing::error!(
                    "Failed to release build slot on {}: {}",
                    hostname,
                    release_error
                );
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
        }
    }

    async fn build_on(
        &self,
        resource: &LockedResource,
        authfile: Option<PathBuf>,
        build_dir: &BuildDir,
        dest_tag: &str,
        build_log: &mut File,
    ) -> BuildResult<()> {
        let builder = self.engine.setup_for(resource, authfile).await?;

        tracing::info!(
            "Building image={} platform={} on host={} (connection {})",
            dest_tag,
            self.params.platform,
            resource.host().hostname,
            builder.connection_name()
        );

        let mut output = builder
            .build_container(
                build_dir,
                &self.workflow.buildargs,
                dest_tag,
                self.params.user_params.flatpak,
            )
            .await?;

        let drained = drain_output(&mut output, build_log).await;
        let flushed = build_log.flush().await;
        drained?;
        flushed?;

        self.check_image_size(builder.as_ref(), dest_tag).await?;
        builder
            .push_container(dest_tag, self.config.registry.insecure)
            .await
    }

    async fn check_image_size(&self, builder: &dyn RemoteBuilder, dest_tag: &str) -> BuildResult<()> {
        let size = builder.get_image_size(dest_tag).await?;
        tracing::info!("Image {} size: {} bytes", dest_tag, size);

        if let Some(limit) = self.config.image_size_limit.binary_image_limit()
            && size > limit
        {
            return Err(BuildError::ExceedsImageSize {
                size,
                image: dest_tag.to_string(),
                limit,
            });
        }
        Ok(())
    }

    async fn log_dockerfile(&self, build_dir: &BuildDir) {
        let path = build_dir.dockerfile_path();
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => tracing::info!("Dockerfile used for build:\n{}", content),
            Err(e) => tracing::warn!("Failed to read {}: {}", path.display(), e),
        }
    }
}

/// ビルド中にリースを定期的に更新し、lease_ttl による回収を防ぐ
struct LeaseHeartbeat {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl LeaseHeartbeat {
    fn start(renewer: LeaseRenewer, ttl: Duration) -> Self {
        let period = (ttl / 3).max(MIN_RENEW_INTERVAL);
        let (stop, mut stopped) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // 最初の tick は即座に完了する
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = interval.tick() => {}
                }

                let renewer = renewer.clone();
                match tokio::task::spawn_blocking(move || renewer.renew()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!("Failed to renew build slot lease: {}", e),
                    Err(e) => tracing::warn!("Lease renewal task failed: {}", e),
                }
            }
        });

        Self { stop, handle }
    }

    /// 更新を止め、実行中の更新の完了を待つ
    async fn stop(self) {
        let _ = self.stop.send(());
        if let Err(e) = self.handle.await {
            tracing::warn!("Lease heartbeat ended abnormally: {}", e);
        }
    }
}

/// ビルド出力をログとビルドログファイルへ
async fn drain_output(output: &mut BuildOutput, build_log: &mut File) -> BuildResult<()> {
    while let Some(line) = output.next_line().await? {
        tracing::info!("{}", line);
        build_log.write_all(line.as_bytes()).await?;
        build_log.write_all(b"\n").await?;
    }
    Ok(())
}
