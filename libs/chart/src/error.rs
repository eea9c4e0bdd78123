//! Chart loading errors.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors from loading charts and repository metadata.
#[derive(Debug, Error)]
pub enum ChartError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{path} does not contain a Chart.yaml")]
    MissingChartFile { path: PathBuf },

    #[error("failed to parse {file} in {path}: {source}")]
    Yaml {
        path: PathBuf,
        file: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid chart archive {path}: {reason}")]
    InvalidArchive { path: PathBuf, reason: String },

    #[error("chart metadata in {path} has no name")]
    MissingName { path: PathBuf },
}

impl ChartError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn yaml(
        path: impl Into<PathBuf>,
        file: impl Into<String>,
        source: serde_yaml::Error,
    ) -> Self {
        Self::Yaml {
            path: path.into(),
            file: file.into(),
            source,
        }
    }
}
