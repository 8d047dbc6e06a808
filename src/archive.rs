use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use glob::glob;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::warn;

pub const MANIFEST_NAME: &str = "SHA256SUMS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchivedFile {
    /// Path relative to the working directory.
    pub source: PathBuf,
    pub stored: PathBuf,
    pub sha256: String,
}

/// Persists stage outputs under `<root>/<run_id>/<stage>/`.
#[derive(Debug, Clone)]
pub struct Archiver {
    root: PathBuf,
}

impl Archiver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stage_dir(&self, run_id: &str, stage: &str) -> PathBuf {
        self.root.join(sanitize(run_id)).join(sanitize(stage))
    }

    /// Copies every file matched by `patterns` (relative to `workdir`) and
    /// writes a digest manifest beside them.
    ///
    /// A pattern that matches nothing is an error unless `allow_empty`.
    /// Every pattern is resolved before anything is copied, and a failed
    /// copy removes the stage directory, so nothing is left behind on error.
    pub fn archive(
        &self,
        workdir: &Path,
        run_id: &str,
        stage: &str,
        patterns: &[String],
        allow_empty: bool,
    ) -> Result<Vec<ArchivedFile>> {
        let sources = self.resolve(workdir, patterns, allow_empty)?;
        if sources.is_empty() {
            return Ok(Vec::new());
        }

        let destination = self.stage_dir(run_id, stage);
        match copy_all(&destination, workdir, sources) {
            Ok(archived) => Ok(archived),
            Err(err) => {
                if destination.exists() {
                    if let Err(cleanup) = std::fs::remove_dir_all(&destination) {
                        warn!(dir = %destination.display(), error = %cleanup, "Failed to remove partial archive");
                    }
                }
                Err(err)
            }
        }
    }

    /// Workspace-relative paths matched by `patterns`, without duplicates.
    fn resolve(&self, workdir: &Path, patterns: &[String], allow_empty: bool) -> Result<Vec<PathBuf>> {
        let mut sources: Vec<PathBuf> = Vec::new();
        for pattern in patterns {
            let absolute = workdir.join(pattern);
            let absolute = absolute.to_string_lossy();
            let matches =
                glob(&absolute).with_context(|| format!("Invalid archive pattern: {pattern}"))?;
            let mut found = false;
            for entry in matches {
                let path = entry?;
                if !path.is_file() || path.starts_with(&self.root) {
                    continue;
                }
                let relative = path
                    .strip_prefix(workdir)
                    .map(Path::to_path_buf)
                    .map_err(|_| anyhow!("'{}' is outside the workspace", path.display()))?;
                found = true;
                if !sources.contains(&relative) {
                    sources.push(relative);
                }
            }
            if !found && !allow_empty {
                bail!("No files matched archive pattern '{pattern}'");
            }
        }
        Ok(sources)
    }
}

fn copy_all(destination: &Path, workdir: &Path, sources: Vec<PathBuf>) -> Result<Vec<ArchivedFile>> {
    let mut archived = Vec::with_capacity(sources.len());
    for relative in sources {
        let path = workdir.join(&relative);
        let stored = destination.join(&relative);
        if let Some(parent) = stored.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create archive directory: {}", parent.display())
            })?;
        }
        std::fs::copy(&path, &stored).with_context(|| {
            format!(
                "Failed to archive '{}' to '{}'",
                path.display(),
                stored.display()
            )
        })?;
        archived.push(ArchivedFile {
            sha256: compute_sha256(&stored)?,
            source: relative,
            stored,
        });
    }
    write_manifest(destination, &archived)?;
    Ok(archived)
}

fn write_manifest(dir: &Path, files: &[ArchivedFile]) -> Result<()> {
    let path = dir.join(MANIFEST_NAME);
    let mut file = File::create(&path)
        .with_context(|| format!("Failed to create digest manifest: {}", path.display()))?;
    for entry in files {
        writeln!(file, "{}  {}", entry.sha256, manifest_path(&entry.source))
            .with_context(|| format!("Failed to write digest manifest: {}", path.display()))?;
    }
    Ok(())
}

fn manifest_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn sanitize(segment: &str) -> String {
    segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Compute the SHA256 digest of the file at `path` and return it as a hex string.
pub fn compute_sha256(path: &Path) -> Result<String> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open file for hashing: {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[derive(Debug, Default, Serialize)]
pub struct VerifyReport {
    pub verified: Vec<PathBuf>,
    pub mismatched: Vec<PathBuf>,
    pub missing: Vec<PathBuf>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.mismatched.is_empty() && self.missing.is_empty()
    }
}

/// Recomputes every digest listed in `<dir>/SHA256SUMS`.
pub fn verify_manifest(dir: &Path) -> Result<VerifyReport> {
    let manifest = dir.join(MANIFEST_NAME);
    let content = std::fs::read_to_string(&manifest)
        .with_context(|| format!("Failed to read digest manifest: {}", manifest.display()))?;

    let mut report = VerifyReport::default();
    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let (expected, name) = line
            .split_once("  ")
            .ok_or_else(|| anyhow!("Malformed manifest line {}: '{line}'", idx + 1))?;
        let relative = PathBuf::from(name);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("Manifest line {} escapes the archive: '{name}'", idx + 1);
        }
        let path = dir.join(&relative);
        if !path.is_file() {
            report.missing.push(relative);
        } else if compute_sha256(&path)? == expected {
            report.verified.push(relative);
        } else {
            report.mismatched.push(relative);
        }
    }
    Ok(report)
}
