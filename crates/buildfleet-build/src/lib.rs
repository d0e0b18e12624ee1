//! buildfleet リモートバイナリコンテナビルド
//!
//! リモートホストのビルドスロットを借り、podman-remote でイメージを
//! ビルドしてレジストリへ push します。
//!
//! ```text
//! BinaryBuildTask
//!   ├─ workflow  (BuildDirs / ContextDir / WorkflowData / TagConf)
//!   ├─ auth      (registry secret -> authfile)
//!   ├─ buildfleet-pool (ResourcePool -> LockedResource)
//!   └─ engine    (RemoteEngine -> RemoteBuilder = PodmanRemote)
//!                  └─ output (BuildOutput: 行単位のストリーム)
//! ```

pub mod auth;
pub mod engine;
pub mod error;
pub mod output;
pub mod podman;
pub mod task;
pub mod workflow;

pub use auth::{RegistryAuth, get_authfile_path};
pub use engine::{PodmanEngine, RemoteBuilder, RemoteEngine, which_podman};
pub use error::{BuildError, BuildResult, InspectFailure};
pub use output::BuildOutput;
pub use podman::PodmanRemote;
pub use task::{BinaryBuildTask, BinaryBuildTaskParams, UserParams};
pub use workflow::{BuildDir, BuildDirs, ContextDir, TagConf, WorkflowData, split_image_tag};
