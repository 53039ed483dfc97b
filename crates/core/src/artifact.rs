//! Artifact descriptors and the provisioning manifest.
//!
//! The manifest declares which model files the engine needs, where each one
//! comes from, and (optionally) where each artifact type should be linked:
//!
//! ```json
//! {
//!   "artifacts": [
//!     { "type": "checkpoint", "id": "1764228", "name": "untitled_pony.safetensors" },
//!     { "type": "lora", "id": "local", "name": "add_brightness_XL.safetensors" }
//!   ],
//!   "targets": { "lora": "/root/comfy/ComfyUI/models/loras" }
//! }
//! ```
//!
//! An `id` of `"local"` (or no `id` at all) marks an artifact that is
//! supplied out of band and must already be in the cache.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Manifest id value marking a locally supplied artifact.
pub const LOCAL_ID: &str = "local";

/// Kind of model file, which decides the consumer directory it is linked into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactType {
    Checkpoint,
    Lora,
    Upscaler,
    Segm,
    Bbox,
    Sam,
}

impl ArtifactType {
    pub const ALL: [ArtifactType; 6] = [
        Self::Checkpoint,
        Self::Lora,
        Self::Upscaler,
        Self::Segm,
        Self::Bbox,
        Self::Sam,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Checkpoint => "checkpoint",
            Self::Lora => "lora",
            Self::Upscaler => "upscaler",
            Self::Segm => "segm",
            Self::Bbox => "bbox",
            Self::Sam => "sam",
        }
    }

    /// Default directory for this type, relative to the ComfyUI install root.
    pub fn default_subdir(self) -> &'static str {
        match self {
            Self::Checkpoint => "models/checkpoints",
            Self::Lora => "models/loras",
            Self::Upscaler => "models/upscale_models",
            Self::Segm => "custom_nodes/ComfyUI-Impact-Pack/models/segm",
            Self::Bbox => "custom_nodes/ComfyUI-Impact-Pack/models/bbox",
            Self::Sam => "custom_nodes/ComfyUI-Impact-Pack/models/sam",
        }
    }
}

impl fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One declared artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDescriptor {
    pub artifact_type: ArtifactType,
    /// Registry id, or `None` for locally supplied files.
    pub remote_id: Option<String>,
    /// Canonical file name in the cache and in the consumer directory.
    pub filename: String,
}

impl ArtifactDescriptor {
    pub fn remote(
        artifact_type: ArtifactType,
        remote_id: impl Into<String>,
        filename: impl Into<String>,
    ) -> Self {
        Self {
            artifact_type,
            remote_id: Some(remote_id.into()),
            filename: filename.into(),
        }
    }

    pub fn local(artifact_type: ArtifactType, filename: impl Into<String>) -> Self {
        Self {
            artifact_type,
            remote_id: None,
            filename: filename.into(),
        }
    }

    pub fn is_local(&self) -> bool {
        self.remote_id.is_none()
    }

    /// Canonical cache path of this artifact.
    pub fn cache_path(&self, cache_root: &Path) -> PathBuf {
        cache_root.join(&self.filename)
    }

    /// Reject file names that would escape the cache or consumer directory.
    pub fn validate(&self) -> Result<(), CoreError> {
        let mut components = Path::new(&self.filename).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) if !self.filename.contains('\\') => Ok(()),
            _ => Err(CoreError::InvalidManifest(format!(
                "artifact name '{}' must be a plain file name",
                self.filename
            ))),
        }
    }
}

/// Wire form of a manifest entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestEntry {
    #[serde(rename = "type")]
    artifact_type: ArtifactType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    name: String,
}

impl From<ManifestEntry> for ArtifactDescriptor {
    fn from(entry: ManifestEntry) -> Self {
        let remote_id = entry
            .id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty() && !id.eq_ignore_ascii_case(LOCAL_ID));
        Self {
            artifact_type: entry.artifact_type,
            remote_id,
            filename: entry.name,
        }
    }
}

impl From<&ArtifactDescriptor> for ManifestEntry {
    fn from(descriptor: &ArtifactDescriptor) -> Self {
        Self {
            artifact_type: descriptor.artifact_type,
            id: Some(
                descriptor
                    .remote_id
                    .clone()
                    .unwrap_or_else(|| LOCAL_ID.to_string()),
            ),
            name: descriptor.filename.clone(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManifest {
    #[serde(default)]
    artifacts: Vec<ManifestEntry>,
    #[serde(default)]
    targets: BTreeMap<ArtifactType, PathBuf>,
}

/// Parsed and validated provisioning manifest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArtifactManifest {
    pub artifacts: Vec<ArtifactDescriptor>,
    /// Per-type consumer directory overrides.
    pub targets: BTreeMap<ArtifactType, PathBuf>,
}

impl ArtifactManifest {
    /// Parse a manifest from JSON text.
    ///
    /// Unknown artifact types, unknown fields and unsafe file names are
    /// configuration errors and fail the whole manifest.
    pub fn from_json(text: &str) -> Result<Self, CoreError> {
        let raw: RawManifest =
            serde_json::from_str(text).map_err(|e| CoreError::InvalidManifest(e.to_string()))?;

        let artifacts: Vec<ArtifactDescriptor> =
            raw.artifacts.into_iter().map(Into::into).collect();
        for descriptor in &artifacts {
            descriptor.validate()?;
        }

        Ok(Self {
            artifacts,
            targets: raw.targets,
        })
    }

    pub fn to_json(&self) -> Result<String, CoreError> {
        let raw = RawManifest {
            artifacts: self.artifacts.iter().map(Into::into).collect(),
            targets: self.targets.clone(),
        };
        serde_json::to_string_pretty(&raw).map_err(|e| CoreError::InvalidManifest(e.to_string()))
    }

    pub fn remote(&self) -> impl Iterator<Item = &ArtifactDescriptor> {
        self.artifacts.iter().filter(|d| !d.is_local())
    }

    pub fn local(&self) -> impl Iterator<Item = &ArtifactDescriptor> {
        self.artifacts.iter().filter(|d| d.is_local())
    }
}
