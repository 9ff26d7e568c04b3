//! Workspace discovery and package-manager boundary.

use std::path::{Path, PathBuf};

use rustc_hash::FxHashMap;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::package::{Package, PackageId, PackageManifest};

const LOCKFILE_NAMES: &[&str] = &["package-lock.json", "pnpm-lock.yaml", "yarn.lock"];
const SKIPPED_DIRS: &[&str] = &["node_modules", ".git", ".sail-cache", "dist", "target"];

/// A set of packages sharing a package-manager lockfile.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub root: PathBuf,
    packages: Vec<Package>,
    by_name: FxHashMap<String, PackageId>,
    /// Path of the workspace lockfile, when one exists.
    pub lockfile: Option<PathBuf>,
    release_groups: FxHashMap<String, Vec<PackageId>>,
}

impl Workspace {
    /// Assembles a workspace from discovered packages.
    ///
    /// # Errors
    ///
    /// Returns a `Dependency` error when two packages share a name.
    pub fn new(root: PathBuf, packages: Vec<Package>, lockfile: Option<PathBuf>) -> Result<Self> {
        let mut by_name = FxHashMap::with_capacity_and_hasher(packages.len(), Default::default());
        let mut release_groups: FxHashMap<String, Vec<PackageId>> = FxHashMap::default();

        for (idx, package) in packages.iter().enumerate() {
            let id = PackageId(idx as u32);
            if let Some(prior) = by_name.insert(package.name.clone(), id) {
                return Err(Error::DuplicatePackage {
                    name: package.name.clone(),
                    first: packages[prior.index()].directory.clone(),
                    second: package.directory.clone(),
                });
            }
            if let Some(group) = &package.release_group {
                release_groups.entry(group.clone()).or_default().push(id);
            }
        }

        Ok(Self {
            root,
            packages,
            by_name,
            lockfile,
            release_groups,
        })
    }

    #[inline]
    pub fn package(&self, id: PackageId) -> &Package {
        &self.packages[id.index()]
    }

    #[inline]
    pub fn find(&self, name: &str) -> Option<PackageId> {
        self.by_name.get(name).copied()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.packages.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = PackageId> + '_ {
        (0..self.packages.len() as u32).map(PackageId)
    }

    pub fn packages(&self) -> &[Package] {
        &self.packages
    }

    /// Members of a release group, in discovery order.
    pub fn release_group(&self, name: &str) -> &[PackageId] {
        self.release_groups
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Direct dependencies of `id` that are workspace members.
    pub fn internal_dependencies(&self, id: PackageId) -> Vec<PackageId> {
        self.packages[id.index()]
            .dependencies
            .iter()
            .filter_map(|(name, _)| self.by_name.get(name).copied())
            .collect()
    }

    /// Warns about internal dependency ranges that do not admit the
    /// workspace-local version of the dependency.
    pub fn validate_internal_ranges(&self) {
        for package in &self.packages {
            for (dep_name, range) in &package.dependencies {
                let Some(dep_id) = self.by_name.get(dep_name) else {
                    continue;
                };
                let dep = &self.packages[dep_id.index()];
                let (Some(version), Ok(req)) = (
                    dep.version.as_deref().and_then(|v| v.parse::<semver::Version>().ok()),
                    range.parse::<semver::VersionReq>(),
                ) else {
                    continue;
                };
                if !req.matches(&version) {
                    tracing::warn!(
                        package = %package.name,
                        dependency = %dep_name,
                        range = %range,
                        local = %version,
                        "dependency range does not match the workspace-local version"
                    );
                }
            }
        }
    }
}

/// Boundary through which the engine obtains a workspace.
pub trait WorkspaceAdapter {
    fn discover(&self, dir: &Path) -> Result<Workspace>;
}

/// Default discovery: walk for `package.json` manifests below the root,
/// skipping dependency and output directories.
#[derive(Debug, Clone)]
pub struct WorkspaceScanner {
    max_depth: usize,
}

impl Default for WorkspaceScanner {
    fn default() -> Self {
        Self { max_depth: 4 }
    }
}

impl WorkspaceScanner {
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    fn find_lockfile(root: &Path) -> Option<PathBuf> {
        LOCKFILE_NAMES
            .iter()
            .map(|name| root.join(name))
            .find(|p| p.is_file())
    }
}

impl WorkspaceAdapter for WorkspaceScanner {
    fn discover(&self, dir: &Path) -> Result<Workspace> {
        let root = dir
            .canonicalize()
            .map_err(|e| Error::io(dir, e))?;

        let mut manifests: Vec<PathBuf> = WalkDir::new(&root)
            .max_depth(self.max_depth)
            .into_iter()
            .filter_entry(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .map(|name| !SKIPPED_DIRS.contains(&name))
                    .unwrap_or(true)
            })
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file() && entry.file_name() == "package.json")
            .map(|entry| entry.into_path())
            .collect();
        manifests.sort();

        let mut packages = Vec::with_capacity(manifests.len());
        for manifest_path in manifests {
            // The root manifest of a multi-package repo is a container, not a
            // buildable package, when it has no scripts.
            let directory = manifest_path
                .parent()
                .unwrap_or(&root)
                .to_path_buf();
            let manifest = PackageManifest::load(&manifest_path)?;
            if directory == root && manifest.scripts.is_empty() {
                continue;
            }
            packages.push(manifest.into_package(directory));
        }

        tracing::debug!(count = packages.len(), root = %root.display(), "discovered packages");
        let lockfile = Self::find_lockfile(&root);
        Workspace::new(root, packages, lockfile)
    }
}

/// Boundary to the concrete package manager. The engine only ever asks
/// whether an install is current and requests one.
pub trait PackageManagerAdapter {
    /// Returns `true` when installed dependencies are current.
    fn check_install(&self, workspace: &Workspace) -> Result<bool>;

    /// Performs an install, optionally updating the lockfile. Returns `true`
    /// on success.
    fn install(&self, workspace: &Workspace, update_lockfile: bool) -> Result<bool>;
}

/// Minimal default: an install is considered current when the lockfile
/// exists. Concrete bindings live outside the engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct LockfilePresenceCheck;

impl PackageManagerAdapter for LockfilePresenceCheck {
    fn check_install(&self, workspace: &Workspace) -> Result<bool> {
        match &workspace.lockfile {
            Some(path) => Ok(path.is_file()),
            None => Err(Error::MissingLockfile {
                root: workspace.root.clone(),
            }),
        }
    }

    fn install(&self, workspace: &Workspace, _update_lockfile: bool) -> Result<bool> {
        Err(Error::internal(format!(
            "no package manager binding configured for {}",
            workspace.root.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use smallvec::SmallVec;

    fn package(name: &str, deps: &[&str]) -> Package {
        Package {
            name: name.to_string(),
            directory: PathBuf::from("/repo").join(name),
            version: Some("1.0.0".to_string()),
            scripts: IndexMap::new(),
            dependencies: deps
                .iter()
                .map(|d| (d.to_string(), "^1.0.0".to_string()))
                .collect::<SmallVec<_>>(),
            release_group: None,
            task_overrides: IndexMap::new(),
        }
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let result = Workspace::new(
            PathBuf::from("/repo"),
            vec![package("a", &[]), package("a", &[])],
            None,
        );
        assert!(matches!(result, Err(Error::DuplicatePackage { .. })));
    }

    #[test]
    fn test_internal_dependencies_ignore_external() {
        let workspace = Workspace::new(
            PathBuf::from("/repo"),
            vec![package("a", &[]), package("b", &["a", "left-pad"])],
            None,
        )
        .unwrap();
        let b = workspace.find("b").unwrap();
        assert_eq!(workspace.internal_dependencies(b), vec![PackageId(0)]);
    }

    #[test]
    fn test_release_groups() {
        let mut a = package("a", &[]);
        a.release_group = Some("client".to_string());
        let mut b = package("b", &[]);
        b.release_group = Some("client".to_string());
        let workspace =
            Workspace::new(PathBuf::from("/repo"), vec![a, b, package("c", &[])], None).unwrap();
        assert_eq!(workspace.release_group("client").len(), 2);
        assert!(workspace.release_group("server").is_empty());
    }
}
