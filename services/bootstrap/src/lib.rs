//! kindling bootstrap.
//!
//! Recreates a disposable kind cluster, installs Tiller into it, waits for
//! it to become ready, tunnels to it, resolves a chart, reconciles the
//! chart's dependencies, and installs the chart as a release.
//!
//! ## Architecture
//!
//! - **Orchestrator**: runs the stages in order and owns failure handling
//! - **ArtifactResolver**: local path, local repository, remote index, download
//! - **TunnelEstablisher**: local listener relayed to the Tiller pod
//! - **Collaborators**: `kind`, `kubectl`, `helm` and `gpg` behind traits,
//!   with mocks in [`mock`]

pub mod cluster;
pub mod config;
pub mod control_plane;
pub mod error;
pub mod fetch;
pub mod kubectl;
pub mod mock;
pub mod orchestrator;
pub mod process;
pub mod release;
pub mod repo_client;
pub mod resolver;
pub mod tunnel;

pub use cluster::{ClusterHandle, ClusterProvider, KindProvider};
pub use config::Config;
pub use error::{BootstrapError, Stage};
pub use orchestrator::{
    BootstrapOutcome, BootstrapPlan, BootstrapState, Collaborators, Orchestrator, ReadinessPolicy,
};
pub use resolver::{ArtifactResolver, ResolutionError, ResolveOptions, ResolverConfig};
pub use tunnel::{TunnelError, TunnelEstablisher, TunnelSession};
