//! Loading charts from directories and packaged archives.
//!
//! A chart is either an unpacked directory:
//!
//! ```text
//! rafter/
//! ├── Chart.yaml
//! ├── requirements.yaml   (optional)
//! └── charts/             (materialized dependencies, dirs or .tgz)
//! ```
//!
//! or a gzipped tarball with the same layout under one top-level directory.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;

use crate::error::ChartError;
use crate::types::{ChartMetadata, Dependency, Requirements};

pub const CHART_FILE: &str = "Chart.yaml";
pub const REQUIREMENTS_FILE: &str = "requirements.yaml";
pub const CHARTS_DIR: &str = "charts";

/// An in-memory view of a loaded chart.
///
/// Descriptors are never patched. After dependencies change on disk, load a
/// fresh one with [`PackageDescriptor::load`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageDescriptor {
    root: PathBuf,
    packaged: bool,
    metadata: ChartMetadata,
    requirements: Option<Requirements>,
    subcharts: Vec<ChartMetadata>,
}

impl PackageDescriptor {
    /// Load a chart from a directory or a `.tgz` archive.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ChartError> {
        let path = path.as_ref();
        let meta = fs::metadata(path).map_err(|e| ChartError::io(path, e))?;

        if meta.is_dir() {
            Self::load_dir(path)
        } else {
            Self::load_archive(path)
        }
    }

    fn load_dir(root: &Path) -> Result<Self, ChartError> {
        let chart_path = root.join(CHART_FILE);
        if !chart_path.is_file() {
            return Err(ChartError::MissingChartFile {
                path: root.to_path_buf(),
            });
        }

        let chart_bytes = fs::read(&chart_path).map_err(|e| ChartError::io(&chart_path, e))?;
        let metadata = parse_metadata(root, &chart_bytes)?;

        let requirements_path = root.join(REQUIREMENTS_FILE);
        let requirements = match fs::read(&requirements_path) {
            Ok(bytes) => Some(parse_requirements(root, &bytes)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(ChartError::io(requirements_path, e)),
        };

        let subcharts = load_subcharts_dir(&root.join(CHARTS_DIR))?;

        Ok(Self {
            root: root.to_path_buf(),
            packaged: false,
            metadata,
            requirements,
            subcharts,
        })
    }

    fn load_archive(path: &Path) -> Result<Self, ChartError> {
        let file = File::open(path).map_err(|e| ChartError::io(path, e))?;
        let parts = read_archive(file, path)?;

        let chart_bytes = parts.chart.ok_or_else(|| ChartError::MissingChartFile {
            path: path.to_path_buf(),
        })?;
        let metadata = parse_metadata(path, &chart_bytes)?;
        let requirements = parts
            .requirements
            .map(|bytes| parse_requirements(path, &bytes))
            .transpose()?;

        let mut subcharts = parts.subcharts;
        sort_charts(&mut subcharts);

        Ok(Self {
            root: path.to_path_buf(),
            packaged: true,
            metadata,
            requirements,
            subcharts,
        })
    }

    /// Path the chart was loaded from.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// True if the chart was loaded from an archive rather than a directory.
    pub fn is_packaged(&self) -> bool {
        self.packaged
    }

    pub fn metadata(&self) -> &ChartMetadata {
        &self.metadata
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// The parsed `requirements.yaml`, or `None` if the chart has none.
    pub fn requirements(&self) -> Option<&Requirements> {
        self.requirements.as_ref()
    }

    /// Declared dependencies (empty when requirements are absent).
    pub fn dependencies(&self) -> &[Dependency] {
        self.requirements
            .as_ref()
            .map(|r| r.dependencies.as_slice())
            .unwrap_or(&[])
    }

    /// Charts present under `charts/`, sorted by name then version.
    pub fn subcharts(&self) -> &[ChartMetadata] {
        &self.subcharts
    }

    /// A dependency is materialized when a chart with its name is bundled.
    pub fn is_materialized(&self, dependency: &Dependency) -> bool {
        self.subcharts.iter().any(|c| c.name == dependency.name)
    }

    /// Declared dependencies that are not bundled under `charts/`.
    pub fn missing_dependencies(&self) -> Vec<&Dependency> {
        self.dependencies()
            .iter()
            .filter(|d| !self.is_materialized(d))
            .collect()
    }
}

fn parse_metadata(origin: &Path, bytes: &[u8]) -> Result<ChartMetadata, ChartError> {
    let metadata: ChartMetadata =
        serde_yaml::from_slice(bytes).map_err(|e| ChartError::yaml(origin, CHART_FILE, e))?;

    if metadata.name.trim().is_empty() {
        return Err(ChartError::MissingName {
            path: origin.to_path_buf(),
        });
    }

    Ok(metadata)
}

fn parse_requirements(origin: &Path, bytes: &[u8]) -> Result<Requirements, ChartError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Requirements::default());
    }

    serde_yaml::from_slice(bytes).map_err(|e| ChartError::yaml(origin, REQUIREMENTS_FILE, e))
}

fn load_subcharts_dir(dir: &Path) -> Result<Vec<ChartMetadata>, ChartError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(ChartError::io(dir, e)),
    };

    let mut charts = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| ChartError::io(dir, e))?;
        let path = entry.path();

        if path.is_dir() {
            let chart_path = path.join(CHART_FILE);
            // Directories without a Chart.yaml are not charts.
            if !chart_path.is_file() {
                continue;
            }
            let bytes = fs::read(&chart_path).map_err(|e| ChartError::io(&chart_path, e))?;
            charts.push(parse_metadata(&path, &bytes)?);
        } else if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(is_archive_name)
        {
            let file = File::open(&path).map_err(|e| ChartError::io(&path, e))?;
            let parts = read_archive(file, &path)?;
            let bytes = parts.chart.ok_or_else(|| ChartError::MissingChartFile {
                path: path.clone(),
            })?;
            charts.push(parse_metadata(&path, &bytes)?);
        }
    }

    sort_charts(&mut charts);
    Ok(charts)
}

fn sort_charts(charts: &mut [ChartMetadata]) {
    charts.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.version.cmp(&b.version)));
}

/// True for file names that look like packaged charts.
pub fn is_archive_name(name: &str) -> bool {
    name.ends_with(".tgz") || name.ends_with(".tar.gz")
}

/// Raw pieces of a chart archive.
#[derive(Default)]
struct ArchiveParts {
    chart: Option<Vec<u8>>,
    requirements: Option<Vec<u8>>,
    subcharts: Vec<ChartMetadata>,
}

fn read_archive<R: Read>(reader: R, origin: &Path) -> Result<ArchiveParts, ChartError> {
    let invalid = |reason: String| ChartError::InvalidArchive {
        path: origin.to_path_buf(),
        reason,
    };

    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    let entries = archive.entries().map_err(|e| invalid(e.to_string()))?;

    let mut parts = ArchiveParts::default();
    for entry in entries {
        let mut entry = entry.map_err(|e| invalid(e.to_string()))?;
        let entry_path = entry.path().map_err(|e| invalid(e.to_string()))?;
        let components: Vec<String> = entry_path
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => part.to_str().map(str::to_string),
                _ => None,
            })
            .collect();

        match components.as_slice() {
            [_, file] if file.as_str() == CHART_FILE => {
                parts.chart = Some(read_entry(&mut entry).map_err(|e| invalid(e.to_string()))?);
            }
            [_, file] if file.as_str() == REQUIREMENTS_FILE => {
                parts.requirements =
                    Some(read_entry(&mut entry).map_err(|e| invalid(e.to_string()))?);
            }
            [_, dir, file] if dir.as_str() == CHARTS_DIR && is_archive_name(file) => {
                let nested_name = file.clone();
                let bytes = read_entry(&mut entry).map_err(|e| invalid(e.to_string()))?;
                let nested = read_archive(bytes.as_slice(), origin)?;
                let chart = nested
                    .chart
                    .ok_or_else(|| invalid(format!("{nested_name} has no {CHART_FILE}")))?;
                parts.subcharts.push(parse_metadata(origin, &chart)?);
            }
            [_, dir, _, file] if dir.as_str() == CHARTS_DIR && file.as_str() == CHART_FILE => {
                let bytes = read_entry(&mut entry).map_err(|e| invalid(e.to_string()))?;
                parts.subcharts.push(parse_metadata(origin, &bytes)?);
            }
            _ => {}
        }
    }

    Ok(parts)
}

fn read_entry<R: Read>(entry: &mut R) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    entry.read_to_end(&mut buf)?;
    Ok(buf)
}
