//! Test fixtures for kindling.
//!
//! [`ChartFixture`] writes charts to disk either as unpacked directories or
//! as packaged `.tgz` archives, with optional declared and bundled
//! dependencies. [`stub_tool`] stands in for an external CLI.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;

/// A chart to be written to disk.
#[derive(Debug, Clone)]
pub struct ChartFixture {
    name: String,
    version: String,
    dependencies: Vec<(String, String, String)>,
    bundled_dirs: Vec<ChartFixture>,
    bundled_archives: Vec<ChartFixture>,
    requirements_file: bool,
}

impl ChartFixture {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            dependencies: Vec::new(),
            bundled_dirs: Vec::new(),
            bundled_archives: Vec::new(),
            requirements_file: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// File name of the packaged chart (`<name>-<version>.tgz`).
    pub fn archive_name(&self) -> String {
        format!("{}-{}.tgz", self.name, self.version)
    }

    /// Declare a dependency in `requirements.yaml`.
    pub fn dependency(mut self, name: &str, version: &str, repository: &str) -> Self {
        self.dependencies
            .push((name.to_string(), version.to_string(), repository.to_string()));
        self.requirements_file = true;
        self
    }

    /// Write an empty `requirements.yaml` even without dependencies.
    pub fn with_empty_requirements(mut self) -> Self {
        self.requirements_file = true;
        self
    }

    /// Bundle an unpacked chart under `charts/<name>/`.
    pub fn bundled(mut self, name: &str, version: &str) -> Self {
        self.bundled_dirs.push(ChartFixture::new(name, version));
        self
    }

    /// Bundle a packaged chart under `charts/<name>-<version>.tgz`.
    pub fn bundled_archive(mut self, name: &str, version: &str) -> Self {
        self.bundled_archives.push(ChartFixture::new(name, version));
        self
    }

    pub fn chart_yaml(&self) -> String {
        format!(
            "apiVersion: v1\nname: {}\nversion: {}\ndescription: {} test chart\n",
            self.name, self.version, self.name
        )
    }

    pub fn requirements_yaml(&self) -> Option<String> {
        if !self.requirements_file {
            return None;
        }

        if self.dependencies.is_empty() {
            return Some("dependencies: []\n".to_string());
        }

        let mut out = String::from("dependencies:\n");
        for (name, version, repository) in &self.dependencies {
            out.push_str(&format!(
                "  - name: {name}\n    version: \"{version}\"\n    repository: \"{repository}\"\n"
            ));
        }
        Some(out)
    }

    /// Write the chart as `<parent>/<name>/` and return that path.
    pub fn write_dir(&self, parent: &Path) -> io::Result<PathBuf> {
        let root = parent.join(&self.name);
        fs::create_dir_all(&root)?;
        fs::write(root.join("Chart.yaml"), self.chart_yaml())?;
        fs::write(
            root.join("values.yaml"),
            format!("# values for {}\n", self.name),
        )?;

        if let Some(requirements) = self.requirements_yaml() {
            fs::write(root.join("requirements.yaml"), requirements)?;
        }

        if !self.bundled_dirs.is_empty() || !self.bundled_archives.is_empty() {
            let charts = root.join("charts");
            fs::create_dir_all(&charts)?;
            for sub in &self.bundled_dirs {
                sub.write_dir(&charts)?;
            }
            for sub in &self.bundled_archives {
                sub.package(&charts)?;
            }
        }

        Ok(root)
    }

    /// Write the chart as `<dest_dir>/<name>-<version>.tgz` and return that path.
    pub fn package(&self, dest_dir: &Path) -> io::Result<PathBuf> {
        fs::create_dir_all(dest_dir)?;
        let path = dest_dir.join(self.archive_name());
        fs::write(&path, self.archive_bytes()?)?;
        Ok(path)
    }

    /// The packaged chart as gzipped tar bytes.
    pub fn archive_bytes(&self) -> io::Result<Vec<u8>> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);

        append_file(
            &mut builder,
            &format!("{}/Chart.yaml", self.name),
            self.chart_yaml().as_bytes(),
        )?;
        append_file(
            &mut builder,
            &format!("{}/values.yaml", self.name),
            format!("# values for {}\n", self.name).as_bytes(),
        )?;

        if let Some(requirements) = self.requirements_yaml() {
            append_file(
                &mut builder,
                &format!("{}/requirements.yaml", self.name),
                requirements.as_bytes(),
            )?;
        }

        for sub in &self.bundled_dirs {
            append_file(
                &mut builder,
                &format!("{}/charts/{}/Chart.yaml", self.name, sub.name),
                sub.chart_yaml().as_bytes(),
            )?;
        }

        for sub in &self.bundled_archives {
            append_file(
                &mut builder,
                &format!("{}/charts/{}", self.name, sub.archive_name()),
                &sub.archive_bytes()?,
            )?;
        }

        let mut encoder = builder.into_inner()?;
        encoder.flush()?;
        encoder.finish()
    }
}

/// Write an executable `sh` script named `name` into `dir`.
#[cfg(unix)]
pub fn stub_tool(dir: &Path, name: &str, script: &str) -> io::Result<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{script}\n"))?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
    Ok(path)
}

fn append_file<W: Write>(builder: &mut tar::Builder<W>, path: &str, data: &[u8]) -> io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, path, data)
}
