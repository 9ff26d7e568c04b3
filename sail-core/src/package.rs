//! Package data model and manifest parsing.

use std::fmt;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::config::TaskConfig;
use crate::error::{Error, Result};

/// Compact package identifier, an index into [`crate::workspace::Workspace`]'s
/// package table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackageId(pub u32);

impl PackageId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pkg-{}", self.0)
    }
}

/// A package discovered in the workspace.
///
/// Constructed once during discovery and immutable for the rest of the build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    /// Absolute directory of the package.
    pub directory: PathBuf,
    pub version: Option<String>,
    /// Script name to shell command, in manifest order.
    pub scripts: IndexMap<String, String>,
    /// Declared dependency names with their version ranges. Only names that
    /// resolve to workspace members become graph edges.
    pub dependencies: SmallVec<[(String, String); 4]>,
    /// Optional release-group label used by `...#task` references.
    pub release_group: Option<String>,
    /// Per-package task definition overrides from the manifest.
    pub task_overrides: IndexMap<String, TaskConfig>,
}

impl Package {
    #[inline]
    pub fn get_script(&self, name: &str) -> Option<&str> {
        self.scripts.get(name).map(String::as_str)
    }

    /// Filesystem-safe form of the package name, used for donefiles.
    pub fn safe_name(&self) -> String {
        self.name.replace(['/', '\\', '.', ':', '@'], "_")
    }

    /// Path of the donefile recording the last successful cache key for
    /// `task_name`.
    pub fn donefile_path(&self, task_name: &str) -> PathBuf {
        self.directory
            .join(format!("{}-{}.donefile", self.safe_name(), task_name))
    }
}

/// Raw `package.json` shape. Only the fields the engine consumes are modeled.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifest {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub scripts: IndexMap<String, String>,
    #[serde(default)]
    pub dependencies: IndexMap<String, String>,
    #[serde(default)]
    pub dev_dependencies: IndexMap<String, String>,
    #[serde(default)]
    pub sail: Option<ManifestToolSection>,
    /// Legacy section still present in older manifests. Honored when `sail`
    /// is absent; a deprecation warning is logged during discovery.
    #[serde(default)]
    pub fluid_build: Option<ManifestToolSection>,
}

/// The `sail` (or legacy `fluidBuild`) section of a package manifest.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestToolSection {
    #[serde(default)]
    pub tasks: IndexMap<String, TaskConfig>,
    #[serde(default)]
    pub release_group: Option<String>,
}

impl PackageManifest {
    /// Parses a manifest file.
    ///
    /// # Errors
    ///
    /// Returns a `Validation` error when the JSON is malformed and a
    /// `FileSystem` error when the file cannot be read.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        serde_json::from_str(&raw).map_err(|e| Error::json(path.display().to_string(), e))
    }

    /// Converts the manifest into a [`Package`] rooted at `directory`.
    pub fn into_package(mut self, directory: PathBuf) -> Package {
        let section = match self.sail.take() {
            Some(section) => Some(section),
            None => {
                let legacy = self.fluid_build.take();
                if legacy.is_some() {
                    tracing::warn!(
                        package = %self.name,
                        "manifest uses the legacy fluidBuild section; rename it to sail"
                    );
                }
                legacy
            }
        };

        let mut dependencies: SmallVec<[(String, String); 4]> = SmallVec::new();
        for (name, range) in self.dependencies.iter().chain(self.dev_dependencies.iter()) {
            if !dependencies.iter().any(|(n, _)| n == name) {
                dependencies.push((name.clone(), range.clone()));
            }
        }

        let (task_overrides, release_group) = match section {
            Some(s) => (s.tasks, s.release_group),
            None => (IndexMap::new(), None),
        };

        Package {
            name: self.name,
            directory,
            version: self.version,
            scripts: self.scripts,
            dependencies,
            release_group,
            task_overrides,
        }
    }
}
