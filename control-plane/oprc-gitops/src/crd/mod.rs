pub mod instance;
pub mod platform;
pub mod route;

pub use instance::{
    ClaimKind, InstanceId, InstanceKey, ManagedInstance, instance_from_dynamic,
};
pub use platform::{
    ClusterGitOpsPlatform, ClusterGitOpsPlatformSpec, GitOpsPlatform,
    GitOpsPlatformSpec, Phase, PlatformCommonSpec, PlatformStatus,
};
