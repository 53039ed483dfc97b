//! Read-only inspection of the cache and of consumer links.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use imagegen_core::artifact::{ArtifactDescriptor, ArtifactType};
use serde::Serialize;

use crate::error::ArtifactError;
use crate::populate::is_partial_name;
use crate::provision::ConsumerLayout;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedFile {
    pub filename: String,
    pub size: u64,
}

/// Cache contents compared with the declared artifacts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheAudit {
    pub present: Vec<CachedFile>,
    pub missing: Vec<String>,
    /// Files in the cache that no descriptor declares.
    pub extra: Vec<String>,
    /// Leftovers of interrupted downloads.
    pub partials: Vec<String>,
}

impl CacheAudit {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Compare `cache_root` with `descriptors`. A missing cache root counts as
/// empty.
pub fn audit_cache(
    cache_root: &Path,
    descriptors: &[ArtifactDescriptor],
) -> Result<CacheAudit, ArtifactError> {
    let mut on_disk = BTreeSet::new();
    let mut audit = CacheAudit::default();

    match fs::read_dir(cache_root) {
        Ok(entries) => {
            for entry in entries {
                let entry = entry.map_err(ArtifactError::io(cache_root))?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if is_partial_name(&name) {
                    audit.partials.push(name);
                } else {
                    on_disk.insert(name);
                }
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(ArtifactError::io(cache_root)(e)),
    }

    let declared: BTreeSet<&str> = descriptors.iter().map(|d| d.filename.as_str()).collect();
    for filename in &declared {
        if on_disk.contains(*filename) {
            let size = fs::metadata(cache_root.join(filename))
                .map(|m| m.len())
                .unwrap_or(0);
            audit.present.push(CachedFile {
                filename: filename.to_string(),
                size,
            });
        } else {
            audit.missing.push(filename.to_string());
        }
    }
    audit.extra = on_disk
        .into_iter()
        .filter(|name| !declared.contains(name.as_str()))
        .collect();
    audit.partials.sort();

    Ok(audit)
}

/// State of one consumer link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LinkStatus {
    /// Points at the cache entry, which exists.
    Linked { target: PathBuf },
    /// Points at the cache entry, which does not exist.
    Dangling { target: PathBuf },
    /// Points somewhere other than the cache entry.
    WrongTarget { target: PathBuf },
    /// A regular file or directory sits at the link location.
    NotSymlink,
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkInspection {
    pub filename: String,
    pub artifact_type: ArtifactType,
    pub link: PathBuf,
    pub status: LinkStatus,
}

/// Inspect the link of every descriptor without changing anything.
pub fn inspect_links(
    layout: &ConsumerLayout,
    cache_root: &Path,
    descriptors: &[ArtifactDescriptor],
) -> Result<Vec<LinkInspection>, ArtifactError> {
    layout.check(descriptors)?;
    let cache_root = std::path::absolute(cache_root).unwrap_or_else(|_| cache_root.to_path_buf());

    let inspections = descriptors
        .iter()
        .filter_map(|descriptor| {
            let link = layout.link_path(descriptor)?;
            let expected = descriptor.cache_path(&cache_root);
            let status = link_status(&link, &expected);
            Some(LinkInspection {
                filename: descriptor.filename.clone(),
                artifact_type: descriptor.artifact_type,
                link,
                status,
            })
        })
        .collect();
    Ok(inspections)
}

fn link_status(link: &Path, expected: &Path) -> LinkStatus {
    let Ok(meta) = fs::symlink_metadata(link) else {
        return LinkStatus::Missing;
    };
    if !meta.file_type().is_symlink() {
        return LinkStatus::NotSymlink;
    }
    let Ok(target) = fs::read_link(link) else {
        return LinkStatus::Missing;
    };
    if target != expected {
        LinkStatus::WrongTarget { target }
    } else if expected.is_file() {
        LinkStatus::Linked { target }
    } else {
        LinkStatus::Dangling { target }
    }
}
