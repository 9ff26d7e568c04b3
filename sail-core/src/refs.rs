//! Task reference grammar and task identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Stable task identifier, `"<package>#<task>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(package: &str, task: &str) -> Self {
        Self(format!("{}#{}", package, task))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn package(&self) -> &str {
        self.0.split_once('#').map(|(p, _)| p).unwrap_or(&self.0)
    }

    pub fn task(&self) -> &str {
        self.0.split_once('#').map(|(_, t)| t).unwrap_or("")
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A dependency reference as written in a task definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskRef {
    /// `"name"` — task `name` in the same package.
    Own(String),
    /// `"^name"` — task `name` in every direct package dependency.
    Dependencies(String),
    /// `"*"` — every task scheduled for the same package. Only valid in
    /// `before`/`after`.
    All,
    /// `"pkg#name"` — a specific package's task.
    Package { package: String, task: String },
    /// `"...#name"` — task `name` in every release-group sibling.
    ReleaseGroup(String),
}

impl TaskRef {
    /// Parses a reference string.
    ///
    /// # Errors
    ///
    /// Returns a `Configuration` error for empty or malformed references.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::config("empty task reference"));
        }
        if raw == "*" {
            return Ok(TaskRef::All);
        }
        if let Some(name) = raw.strip_prefix('^') {
            if name.is_empty() || name.contains('#') {
                return Err(Error::config(format!("malformed task reference '{}'", raw)));
            }
            return Ok(TaskRef::Dependencies(name.to_string()));
        }
        if let Some(name) = raw.strip_prefix("...#") {
            if name.is_empty() {
                return Err(Error::config(format!("malformed task reference '{}'", raw)));
            }
            return Ok(TaskRef::ReleaseGroup(name.to_string()));
        }
        if let Some((package, task)) = raw.split_once('#') {
            if package.is_empty() || task.is_empty() {
                return Err(Error::config(format!("malformed task reference '{}'", raw)));
            }
            return Ok(TaskRef::Package {
                package: package.to_string(),
                task: task.to_string(),
            });
        }
        Ok(TaskRef::Own(raw.to_string()))
    }

    /// Whether this reference form is only meaningful as a weak
    /// (`before`/`after`) edge.
    pub fn weak_only(&self) -> bool {
        matches!(self, TaskRef::All)
    }
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskRef::Own(name) => f.write_str(name),
            TaskRef::Dependencies(name) => write!(f, "^{}", name),
            TaskRef::All => f.write_str("*"),
            TaskRef::Package { package, task } => write!(f, "{}#{}", package, task),
            TaskRef::ReleaseGroup(name) => write!(f, "...#{}", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forms() {
        assert_eq!(TaskRef::parse("build").unwrap(), TaskRef::Own("build".into()));
        assert_eq!(
            TaskRef::parse("^build").unwrap(),
            TaskRef::Dependencies("build".into())
        );
        assert_eq!(TaskRef::parse("*").unwrap(), TaskRef::All);
        assert_eq!(
            TaskRef::parse("utils#build").unwrap(),
            TaskRef::Package {
                package: "utils".into(),
                task: "build".into()
            }
        );
        assert_eq!(
            TaskRef::parse("...#build").unwrap(),
            TaskRef::ReleaseGroup("build".into())
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(TaskRef::parse("").is_err());
        assert!(TaskRef::parse("^").is_err());
        assert!(TaskRef::parse("#build").is_err());
        assert!(TaskRef::parse("pkg#").is_err());
        assert!(TaskRef::parse("...#").is_err());
    }

    #[test]
    fn test_roundtrip_display() {
        for raw in ["build", "^build", "*", "utils#build", "...#lint"] {
            assert_eq!(TaskRef::parse(raw).unwrap().to_string(), raw);
        }
    }

    #[test]
    fn test_task_id_parts() {
        let id = TaskId::new("@scope/utils", "build");
        assert_eq!(id.package(), "@scope/utils");
        assert_eq!(id.task(), "build");
    }
}
