//! Root build configuration and task definition schema.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::package::Package;

pub const CONFIG_FILE_NAME: &str = "sail.config.json";
pub const CONFIG_VERSION: u32 = 1;

/// `script` field of a task definition: `true` runs the matching npm script,
/// `false` marks a group task, a string is an explicit command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScriptSpec {
    Script(bool),
    Command(String),
}

impl Default for ScriptSpec {
    fn default() -> Self {
        ScriptSpec::Script(true)
    }
}

/// A task definition as written in configuration. Every field is optional so
/// per-package entries can shallow-override workspace entries field-by-field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TaskConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<ScriptSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_globs: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_globs: Option<Vec<String>>,
    /// Environment variables that influence the task, hashed into its cache
    /// key. Undeclared variables never affect the key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    /// Treat inputs as text: line endings are normalized before hashing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Scheduling weight; higher runs earlier among equal-level tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
}

/// Fully merged task definition with defaults applied.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDefinition {
    pub depends_on: Vec<String>,
    pub before: Vec<String>,
    pub after: Vec<String>,
    pub children: Vec<String>,
    pub script: ScriptSpec,
    pub input_globs: Option<Vec<String>>,
    pub output_globs: Option<Vec<String>>,
    pub env: Vec<String>,
    pub text: bool,
    pub timeout_ms: Option<u64>,
    pub weight: u32,
}

impl Default for TaskDefinition {
    fn default() -> Self {
        Self {
            depends_on: Vec::new(),
            before: Vec::new(),
            after: Vec::new(),
            children: Vec::new(),
            script: ScriptSpec::Script(true),
            input_globs: None,
            output_globs: None,
            env: Vec::new(),
            text: false,
            timeout_ms: None,
            weight: 0,
        }
    }
}

impl TaskDefinition {
    /// Merges a workspace-level entry with a per-package override. Fields set
    /// on the override win; unset fields fall through to the base.
    pub fn merge(base: Option<&TaskConfig>, overlay: Option<&TaskConfig>) -> Self {
        fn pick<T: Clone>(
            overlay: Option<&TaskConfig>,
            base: Option<&TaskConfig>,
            get: impl Fn(&TaskConfig) -> Option<&T>,
        ) -> Option<T> {
            overlay
                .and_then(|c| get(c).cloned())
                .or_else(|| base.and_then(|c| get(c).cloned()))
        }

        let defaults = TaskDefinition::default();
        Self {
            depends_on: pick(overlay, base, |c| c.depends_on.as_ref()).unwrap_or_default(),
            before: pick(overlay, base, |c| c.before.as_ref()).unwrap_or_default(),
            after: pick(overlay, base, |c| c.after.as_ref()).unwrap_or_default(),
            children: pick(overlay, base, |c| c.children.as_ref()).unwrap_or_default(),
            script: pick(overlay, base, |c| c.script.as_ref()).unwrap_or(defaults.script),
            input_globs: pick(overlay, base, |c| c.input_globs.as_ref()),
            output_globs: pick(overlay, base, |c| c.output_globs.as_ref()),
            env: pick(overlay, base, |c| c.env.as_ref()).unwrap_or_default(),
            text: pick(overlay, base, |c| c.text.as_ref()).unwrap_or(false),
            timeout_ms: pick(overlay, base, |c| c.timeout_ms.as_ref()),
            weight: pick(overlay, base, |c| c.weight.as_ref()).unwrap_or(0),
        }
    }

    #[inline]
    pub fn is_group(&self) -> bool {
        self.script == ScriptSpec::Script(false)
    }
}

/// Input/output globs applied to every command starting with a given
/// executable prefix, when the task itself declares none.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeclarativeTask {
    #[serde(default)]
    pub input_globs: Vec<String>,
    #[serde(default)]
    pub output_globs: Vec<String>,
}

/// Workspace-level build configuration, loaded from `sail.config.json`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub tasks: IndexMap<String, TaskConfig>,
    #[serde(default)]
    pub declarative_tasks: IndexMap<String, DeclarativeTask>,
}

fn default_version() -> u32 {
    CONFIG_VERSION
}

impl BuildConfig {
    /// Loads the configuration from `root/sail.config.json`. Returns the
    /// default (empty) configuration when no file exists.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(CONFIG_FILE_NAME);
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_file(&path)
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let config: BuildConfig =
            serde_json::from_str(&raw).map_err(|e| Error::json(path.display().to_string(), e))?;
        if config.version != CONFIG_VERSION {
            return Err(Error::config(format!(
                "unsupported config version {} in {} (expected {})",
                config.version,
                path.display(),
                CONFIG_VERSION
            )));
        }
        Ok(config)
    }

    /// Returns the merged definition of `task_name` for `package`, or `None`
    /// when neither configuration nor the package's scripts mention it.
    ///
    /// A script with no configuration entry yields an implicit
    /// `script: true` definition with no dependencies.
    pub fn definition_for(&self, package: &Package, task_name: &str) -> Option<TaskDefinition> {
        let base = self.tasks.get(task_name);
        let overlay = package.task_overrides.get(task_name);
        if base.is_none() && overlay.is_none() {
            return package
                .get_script(task_name)
                .map(|_| TaskDefinition::default());
        }
        Some(TaskDefinition::merge(base, overlay))
    }

    /// Looks up declarative input/output globs by longest matching executable
    /// prefix of `command`.
    pub fn declarative_for(&self, command: &str) -> Option<&DeclarativeTask> {
        let mut best: Option<(&str, &DeclarativeTask)> = None;
        for (prefix, decl) in &self.declarative_tasks {
            if command_matches_prefix(command, prefix) {
                match best {
                    Some((existing, _)) if existing.len() >= prefix.len() => {}
                    _ => best = Some((prefix.as_str(), decl)),
                }
            }
        }
        best.map(|(_, decl)| decl)
    }
}

/// A command matches a prefix when the prefix equals its leading
/// whitespace-separated tokens.
pub fn command_matches_prefix(command: &str, prefix: &str) -> bool {
    let mut cmd_tokens = command.split_whitespace();
    for expected in prefix.split_whitespace() {
        match cmd_tokens.next() {
            Some(token) if token == expected => {}
            _ => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> BuildConfig {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn test_script_spec_forms() {
        let config = parse(
            r#"{
                "version": 1,
                "tasks": {
                    "build": { "script": true },
                    "full": { "script": false, "children": ["build"] },
                    "gen": { "script": "node gen.js" }
                }
            }"#,
        );
        assert_eq!(
            config.tasks.get("build").unwrap().script,
            Some(ScriptSpec::Script(true))
        );
        assert!(TaskDefinition::merge(config.tasks.get("full"), None).is_group());
        assert_eq!(
            config.tasks.get("gen").unwrap().script,
            Some(ScriptSpec::Command("node gen.js".to_string()))
        );
    }

    #[test]
    fn test_merge_field_by_field() {
        let base: TaskConfig = serde_json::from_str(
            r#"{ "dependsOn": ["^build"], "inputGlobs": ["src/**"], "weight": 2 }"#,
        )
        .unwrap();
        let overlay: TaskConfig =
            serde_json::from_str(r#"{ "inputGlobs": ["lib/**"] }"#).unwrap();

        let merged = TaskDefinition::merge(Some(&base), Some(&overlay));
        assert_eq!(merged.depends_on, vec!["^build".to_string()]);
        assert_eq!(merged.input_globs, Some(vec!["lib/**".to_string()]));
        assert_eq!(merged.weight, 2);
    }

    #[test]
    fn test_longest_prefix_wins() {
        let config = parse(
            r#"{
                "version": 1,
                "declarativeTasks": {
                    "tsc": { "outputGlobs": ["dist/**"] },
                    "tsc --build": { "outputGlobs": ["lib/**"] }
                }
            }"#,
        );
        let decl = config.declarative_for("tsc --build --force").unwrap();
        assert_eq!(decl.output_globs, vec!["lib/**".to_string()]);
        assert!(config.declarative_for("webpack").is_none());
    }

    #[test]
    fn test_prefix_matches_whole_tokens_only() {
        assert!(command_matches_prefix("tsc --build", "tsc"));
        assert!(!command_matches_prefix("tscx --build", "tsc"));
    }

    #[test]
    fn test_unsupported_version_rejected_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, r#"{"version": 2}"#).unwrap();
        let err = BuildConfig::load_file(&path).unwrap_err();
        assert!(err.to_string().contains("unsupported config version"));
    }
}
