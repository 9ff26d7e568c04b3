//! Gitignore-style file matching for task inputs and outputs.

use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use crate::error::{Error, Result};

const IGNORED_DIRS: &[&str] = &["node_modules", ".git", ".sail-cache"];

/// A compiled set of include globs with explicit `!` negations.
///
/// Matching is case-sensitive on POSIX and case-insensitive on Windows. A
/// path matches when at least one include glob matches and no negation does.
#[derive(Debug, Clone)]
pub struct FileSpec {
    include: GlobSet,
    exclude: GlobSet,
    patterns: Vec<String>,
}

impl FileSpec {
    /// Compiles glob patterns. Patterns beginning with `!` become negations.
    ///
    /// # Errors
    ///
    /// Returns a `Configuration` error for malformed globs.
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut include = GlobSetBuilder::new();
        let mut exclude = GlobSetBuilder::new();

        for pattern in patterns {
            let (negated, body) = match pattern.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, pattern.as_str()),
            };
            let glob = GlobBuilder::new(body)
                .literal_separator(true)
                .case_insensitive(cfg!(windows))
                .build()
                .map_err(|e| Error::InvalidGlob {
                    glob: pattern.clone(),
                    message: e.to_string(),
                })?;
            if negated {
                exclude.add(glob);
            } else {
                include.add(glob);
            }
        }

        Ok(Self {
            include: include.build().map_err(|e| Error::InvalidGlob {
                glob: patterns.join(", "),
                message: e.to_string(),
            })?,
            exclude: exclude.build().map_err(|e| Error::InvalidGlob {
                glob: patterns.join(", "),
                message: e.to_string(),
            })?,
            patterns: patterns.to_vec(),
        })
    }

    /// Spec matching every file below the package directory. Used by the
    /// conservative whole-directory fallback.
    pub fn match_all() -> Self {
        Self::new(&["**/*".to_string()]).expect("static glob compiles")
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_empty(&self) -> bool {
        self.include.is_empty()
    }

    /// Tests a path relative to the package directory.
    pub fn is_match(&self, relative: &Path) -> bool {
        self.include.is_match(relative) && !self.exclude.is_match(relative)
    }

    /// Collects matching files below `dir`, as sorted package-relative paths.
    /// Dependency and cache directories are never descended into, and
    /// donefiles are never part of a fileset.
    pub fn collect(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut matched = Vec::new();
        for entry in WalkDir::new(dir)
            .into_iter()
            .filter_entry(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .map(|name| !IGNORED_DIRS.contains(&name))
                    .unwrap_or(true)
            })
        {
            let entry = entry.map_err(|e| {
                Error::io(dir, e.into_io_error().unwrap_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::Other, "walk error")
                }))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(dir) else {
                continue;
            };
            if relative
                .extension()
                .map(|ext| ext == "donefile")
                .unwrap_or(false)
            {
                continue;
            }
            if self.is_match(relative) {
                matched.push(relative.to_path_buf());
            }
        }
        matched.sort();
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_match_with_negation() {
        let spec = FileSpec::new(&[
            "src/**/*.ts".to_string(),
            "!src/**/*.test.ts".to_string(),
        ])
        .unwrap();
        assert!(spec.is_match(Path::new("src/index.ts")));
        assert!(spec.is_match(Path::new("src/deep/mod.ts")));
        assert!(!spec.is_match(Path::new("src/index.test.ts")));
        assert!(!spec.is_match(Path::new("lib/index.ts")));
    }

    #[test]
    fn test_literal_separator() {
        let spec = FileSpec::new(&["src/*.ts".to_string()]).unwrap();
        assert!(spec.is_match(Path::new("src/a.ts")));
        assert!(!spec.is_match(Path::new("src/deep/a.ts")));
    }

    #[test]
    fn test_collect_is_sorted_and_skips_donefiles() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/b.ts"), "b").unwrap();
        fs::write(dir.path().join("src/a.ts"), "a").unwrap();
        fs::write(dir.path().join("pkg-build.donefile"), "xyz").unwrap();

        let spec = FileSpec::match_all();
        let files = spec.collect(dir.path()).unwrap();
        assert_eq!(
            files,
            vec![PathBuf::from("src/a.ts"), PathBuf::from("src/b.ts")]
        );
    }

    #[test]
    fn test_collect_skips_node_modules() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("node_modules/dep")).unwrap();
        fs::write(dir.path().join("node_modules/dep/index.js"), "x").unwrap();
        fs::write(dir.path().join("index.js"), "y").unwrap();

        let files = FileSpec::match_all().collect(dir.path()).unwrap();
        assert_eq!(files, vec![PathBuf::from("index.js")]);
    }

    #[test]
    fn test_invalid_glob_is_configuration_error() {
        let err = FileSpec::new(&["src/[".to_string()]).unwrap_err();
        assert_eq!(
            err.category(),
            crate::error::ErrorCategory::Configuration
        );
    }
}
