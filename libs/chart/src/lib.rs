//! Chart data model for kindling.
//!
//! This library provides:
//!
//! - **References**: [`ArtifactReference`] names a chart by path, local
//!   repository name, `repo/chart`, or URL.
//! - **Descriptors**: [`PackageDescriptor`] is a loaded chart (directory or
//!   `.tgz`) with its declared and materialized dependencies.
//! - **Repositories**: `index.yaml` and `repositories.yaml` parsing.
//! - **Provenance**: digest extraction from `.prov` files.

mod descriptor;
mod error;
pub mod provenance;
pub mod repo;
mod types;

pub use descriptor::{
    is_archive_name, PackageDescriptor, CHARTS_DIR, CHART_FILE, REQUIREMENTS_FILE,
};
pub use error::ChartError;
pub use repo::{ChartVersion, IndexFile, RepositoryEntry, RepositoryFile};
pub use types::{
    ArtifactReference, ArtifactSource, ChartMetadata, Credentials, Dependency, Requirements,
    ResolvedArtifact,
};
