//! Projects the shared cache into the engine's per-type model directories.
//!
//! Each cached artifact gets a symlink `consumer_dir(type)/filename` pointing
//! at its cache entry. The same idempotent pass runs at image build time and
//! again at worker start, when the cache volume may hold artifacts added
//! after the image was built.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use imagegen_core::artifact::{ArtifactDescriptor, ArtifactType};
use serde::Serialize;

use crate::error::ArtifactError;

/// Artifact type to consumer directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerLayout {
    dirs: BTreeMap<ArtifactType, PathBuf>,
}

impl ConsumerLayout {
    /// Standard directories under a ComfyUI install root.
    pub fn comfyui(root: &Path) -> Self {
        let dirs = ArtifactType::ALL
            .iter()
            .map(|t| (*t, root.join(t.default_subdir())))
            .collect();
        Self { dirs }
    }

    /// Replace directories for the given types.
    pub fn with_overrides(mut self, overrides: &BTreeMap<ArtifactType, PathBuf>) -> Self {
        for (artifact_type, dir) in overrides {
            self.dirs.insert(*artifact_type, dir.clone());
        }
        self
    }

    pub fn set(&mut self, artifact_type: ArtifactType, dir: impl Into<PathBuf>) {
        self.dirs.insert(artifact_type, dir.into());
    }

    pub fn dir(&self, artifact_type: ArtifactType) -> Option<&Path> {
        self.dirs.get(&artifact_type).map(PathBuf::as_path)
    }

    /// Where the link for `descriptor` lives.
    pub fn link_path(&self, descriptor: &ArtifactDescriptor) -> Option<PathBuf> {
        self.dir(descriptor.artifact_type)
            .map(|dir| dir.join(&descriptor.filename))
    }

    /// Fail on the first descriptor whose type has no directory.
    pub fn check(&self, descriptors: &[ArtifactDescriptor]) -> Result<(), ArtifactError> {
        match descriptors.iter().find(|d| self.dir(d.artifact_type).is_none()) {
            Some(d) => Err(ArtifactError::UnknownTarget(d.artifact_type)),
            None => Ok(()),
        }
    }
}

/// When the provisioner runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionMode {
    /// While assembling the execution image.
    Build,
    /// At worker start, against the live cache volume.
    Runtime,
}

impl fmt::Display for ProvisionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Build => "build",
            Self::Runtime => "runtime",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkChange {
    Created,
    Replaced,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkedArtifact {
    pub filename: String,
    pub link: PathBuf,
    pub change: LinkChange,
}

/// A link that could not be created or did not resolve afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkFailure {
    pub filename: String,
    pub link: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionReport {
    pub mode: ProvisionMode,
    pub linked: Vec<LinkedArtifact>,
    pub missing_source: Vec<String>,
    /// Dangling links removed because their cache entry is gone.
    pub pruned: Vec<PathBuf>,
    pub verify_failed: Vec<LinkFailure>,
}

impl ProvisionReport {
    fn new(mode: ProvisionMode) -> Self {
        Self {
            mode,
            linked: Vec::new(),
            missing_source: Vec::new(),
            pruned: Vec::new(),
            verify_failed: Vec::new(),
        }
    }

    /// Links created or replaced by this run.
    pub fn changes(&self) -> usize {
        self.linked
            .iter()
            .filter(|l| l.change != LinkChange::Unchanged)
            .count()
    }

    pub fn is_success(&self) -> bool {
        self.missing_source.is_empty() && self.verify_failed.is_empty()
    }
}

/// Creates and repairs consumer symlinks.
#[derive(Debug, Clone)]
pub struct Provisioner {
    cache_root: PathBuf,
    layout: ConsumerLayout,
}

impl Provisioner {
    /// A relative `cache_root` is resolved against the current directory so
    /// that link targets stay valid from any consumer directory.
    pub fn new(cache_root: impl Into<PathBuf>, layout: ConsumerLayout) -> Self {
        let cache_root = cache_root.into();
        let cache_root = std::path::absolute(&cache_root).unwrap_or(cache_root);
        Self { cache_root, layout }
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    pub fn layout(&self) -> &ConsumerLayout {
        &self.layout
    }

    /// Link every cached descriptor into its consumer directory.
    ///
    /// A descriptor type without a consumer directory fails the whole run
    /// before any link is touched. Everything else is reported per
    /// descriptor.
    pub fn provision(
        &self,
        descriptors: &[ArtifactDescriptor],
        mode: ProvisionMode,
    ) -> Result<ProvisionReport, ArtifactError> {
        self.layout.check(descriptors)?;

        let span = tracing::info_span!("provision", %mode);
        let _enter = span.enter();

        let mut report = ProvisionReport::new(mode);
        for descriptor in descriptors {
            let source = descriptor.cache_path(&self.cache_root);
            let Some(link) = self.layout.link_path(descriptor) else {
                continue;
            };

            if !source.is_file() {
                tracing::warn!(
                    filename = %descriptor.filename,
                    source = %source.display(),
                    "Cache entry missing, not linking",
                );
                report.missing_source.push(descriptor.filename.clone());
                match prune_dangling(&link) {
                    Ok(true) => report.pruned.push(link),
                    Ok(false) => {}
                    Err(e) => {
                        tracing::error!(link = %link.display(), error = %e, "Failed to remove dangling link");
                        report.verify_failed.push(LinkFailure {
                            filename: descriptor.filename.clone(),
                            link,
                            reason: e.to_string(),
                        });
                    }
                }
                continue;
            }

            let failure = |reason: String| LinkFailure {
                filename: descriptor.filename.clone(),
                link: link.clone(),
                reason,
            };

            let change = match ensure_link(&source, &link) {
                Ok(change) => change,
                Err(e) => {
                    tracing::error!(link = %link.display(), error = %e, "Failed to create link");
                    report.verify_failed.push(failure(e.to_string()));
                    continue;
                }
            };

            if let Err(reason) = verify_link(&link) {
                tracing::error!(link = %link.display(), reason = %reason, "Link does not resolve");
                report.verify_failed.push(failure(reason));
                continue;
            }

            tracing::debug!(link = %link.display(), ?change, "Link in place");
            report.linked.push(LinkedArtifact {
                filename: descriptor.filename.clone(),
                link,
                change,
            });
        }

        tracing::info!(
            linked = report.linked.len(),
            changed = report.changes(),
            missing_source = report.missing_source.len(),
            pruned = report.pruned.len(),
            verify_failed = report.verify_failed.len(),
            "Provisioning finished",
        );
        Ok(report)
    }
}

/// Make `link` a symlink to `source`, replacing whatever is there.
///
/// The new link is created under a temporary name and renamed into place,
/// so the location never goes missing and concurrent runs cannot collide.
fn ensure_link(source: &Path, link: &Path) -> io::Result<LinkChange> {
    let parent = link.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent)?;

    let change = match fs::symlink_metadata(link) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => LinkChange::Created,
        Err(e) => return Err(e),
        Ok(meta) if meta.file_type().is_symlink() => {
            if fs::read_link(link)? == source {
                return Ok(LinkChange::Unchanged);
            }
            LinkChange::Replaced
        }
        Ok(meta) if meta.is_dir() => {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "a directory occupies the link location",
            ));
        }
        Ok(_) => LinkChange::Replaced,
    };

    let name = link.file_name().unwrap_or_default().to_string_lossy();
    let staged = parent.join(format!(".{name}.{}.link", uuid::Uuid::new_v4().simple()));
    symlink(source, &staged)?;
    if let Err(e) = fs::rename(&staged, link) {
        let _ = fs::remove_file(&staged);
        return Err(e);
    }
    Ok(change)
}

/// Remove `link` if it is a symlink that no longer resolves. Regular files
/// and working links are left alone.
fn prune_dangling(link: &Path) -> io::Result<bool> {
    match fs::symlink_metadata(link) {
        Ok(meta) if meta.file_type().is_symlink() && fs::metadata(link).is_err() => {
            fs::remove_file(link)?;
            tracing::info!(link = %link.display(), "Removed dangling link");
            Ok(true)
        }
        Ok(_) => Ok(false),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Resolve `link` and require an existing regular file behind it.
fn verify_link(link: &Path) -> Result<(), String> {
    match fs::metadata(link) {
        Ok(meta) if meta.is_file() => Ok(()),
        Ok(_) => Err("link target is not a regular file".to_string()),
        Err(e) => Err(format!("link does not resolve: {e}")),
    }
}

#[cfg(unix)]
fn symlink(source: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(source, link)
}

#[cfg(windows)]
fn symlink(source: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(source, link)
}
