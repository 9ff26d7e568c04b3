//! Task handler registry with longest-prefix command dispatch.

use std::sync::Arc;

use crate::config::{command_matches_prefix, BuildConfig, TaskDefinition};

/// Whether a leaf task participates in caching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachingMode {
    Enabled,
    Disabled { reason: String },
}

impl CachingMode {
    #[inline]
    pub fn is_enabled(&self) -> bool {
        matches!(self, CachingMode::Enabled)
    }
}

/// A handler's plan for a concrete command: which files feed the cache key,
/// which files are captured as outputs, and the tool version mixed into the
/// key.
#[derive(Debug, Clone)]
pub struct LeafPlan {
    pub input_globs: Vec<String>,
    pub output_globs: Vec<String>,
    pub tool_version: Option<String>,
    pub caching: CachingMode,
}

/// Maps an executable prefix to input/output planning for its commands.
///
/// Specialized handlers (a TypeScript or bundler adapter) implement this
/// outside the engine; the engine ships only the generic declarative handler.
pub trait TaskHandler: Send + Sync {
    fn plan(&self, command: &str, definition: &TaskDefinition, config: &BuildConfig) -> LeafPlan;
}

/// Generic handler: treats the command opaquely. Globs come from the task
/// definition, then from `declarativeTasks` by executable prefix; with
/// neither, the whole package directory is the input set and caching is
/// disabled because outputs cannot be identified.
#[derive(Debug, Default)]
pub struct GenericTaskHandler;

impl TaskHandler for GenericTaskHandler {
    fn plan(&self, command: &str, definition: &TaskDefinition, config: &BuildConfig) -> LeafPlan {
        if let (Some(inputs), Some(outputs)) =
            (&definition.input_globs, &definition.output_globs)
        {
            return LeafPlan {
                input_globs: inputs.clone(),
                output_globs: outputs.clone(),
                tool_version: None,
                caching: CachingMode::Enabled,
            };
        }

        if let Some(declarative) = config.declarative_for(command) {
            return LeafPlan {
                input_globs: definition
                    .input_globs
                    .clone()
                    .unwrap_or_else(|| declarative.input_globs.clone()),
                output_globs: definition
                    .output_globs
                    .clone()
                    .unwrap_or_else(|| declarative.output_globs.clone()),
                tool_version: None,
                caching: CachingMode::Enabled,
            };
        }

        LeafPlan {
            input_globs: vec!["**/*".to_string()],
            output_globs: Vec::new(),
            tool_version: None,
            caching: CachingMode::Disabled {
                reason: "no declared inputs or outputs".to_string(),
            },
        }
    }
}

/// Registry of task handlers keyed by executable prefix.
pub struct TaskRegistry {
    handlers: Vec<(String, Arc<dyn TaskHandler>)>,
    generic: Arc<dyn TaskHandler>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
            generic: Arc::new(GenericTaskHandler),
        }
    }

    /// Registers a handler for commands whose leading tokens equal `prefix`.
    /// A later registration for the same prefix replaces the earlier one.
    pub fn register(&mut self, prefix: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let prefix = prefix.into();
        self.handlers.retain(|(p, _)| *p != prefix);
        self.handlers.push((prefix, handler));
    }

    /// Resolves the handler with the longest matching prefix, or `None` when
    /// no specialized handler matches.
    pub fn resolve(&self, command: &str) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers
            .iter()
            .filter(|(prefix, _)| command_matches_prefix(command, prefix))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, handler)| handler)
    }

    /// Plans a command through its handler, falling back to the generic one.
    pub fn plan(
        &self,
        command: &str,
        definition: &TaskDefinition,
        config: &BuildConfig,
    ) -> LeafPlan {
        self.resolve(command)
            .unwrap_or(&self.generic)
            .plan(command, definition, config)
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedPlan(LeafPlan);

    impl TaskHandler for FixedPlan {
        fn plan(&self, _: &str, _: &TaskDefinition, _: &BuildConfig) -> LeafPlan {
            self.0.clone()
        }
    }

    fn fixed(tool: &str) -> Arc<dyn TaskHandler> {
        Arc::new(FixedPlan(LeafPlan {
            input_globs: vec!["src/**".to_string()],
            output_globs: vec!["dist/**".to_string()],
            tool_version: Some(tool.to_string()),
            caching: CachingMode::Enabled,
        }))
    }

    #[test]
    fn test_longest_prefix_dispatch() {
        let mut registry = TaskRegistry::new();
        registry.register("tsc", fixed("tsc-5"));
        registry.register("tsc --build", fixed("tsc-build-5"));

        let config = BuildConfig::default();
        let definition = TaskDefinition::default();
        let plan = registry.plan("tsc --build --force", &definition, &config);
        assert_eq!(plan.tool_version.as_deref(), Some("tsc-build-5"));

        let plan = registry.plan("tsc --watch", &definition, &config);
        assert_eq!(plan.tool_version.as_deref(), Some("tsc-5"));
    }

    #[test]
    fn test_generic_fallback_disables_caching() {
        let registry = TaskRegistry::new();
        let config = BuildConfig::default();
        let plan = registry.plan("bespoke-tool run", &TaskDefinition::default(), &config);
        assert!(!plan.caching.is_enabled());
        assert_eq!(plan.input_globs, vec!["**/*".to_string()]);
    }

    #[test]
    fn test_declared_globs_enable_caching() {
        let registry = TaskRegistry::new();
        let config = BuildConfig::default();
        let definition = TaskDefinition {
            input_globs: Some(vec!["src/**".to_string()]),
            output_globs: Some(vec!["out/**".to_string()]),
            ..TaskDefinition::default()
        };
        let plan = registry.plan("bespoke-tool run", &definition, &config);
        assert!(plan.caching.is_enabled());
        assert_eq!(plan.output_globs, vec!["out/**".to_string()]);
    }

    #[test]
    fn test_declarative_tasks_consulted() {
        let registry = TaskRegistry::new();
        let config: BuildConfig = serde_json::from_str(
            r#"{
                "version": 1,
                "declarativeTasks": {
                    "biome": { "inputGlobs": ["**/*.ts"], "outputGlobs": [] }
                }
            }"#,
        )
        .unwrap();
        let plan = registry.plan("biome check", &TaskDefinition::default(), &config);
        assert!(plan.caching.is_enabled());
        assert_eq!(plan.input_globs, vec!["**/*.ts".to_string()]);
    }
}
