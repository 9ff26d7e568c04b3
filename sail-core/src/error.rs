//! Error types and result aliases.

use std::path::PathBuf;

use thiserror::Error;

/// Broad classification used for reporting and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Configuration,
    Dependency,
    FileSystem,
    Execution,
    Build,
    Worker,
    Validation,
    Network,
    Internal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Dependency => "dependency",
            ErrorCategory::FileSystem => "filesystem",
            ErrorCategory::Execution => "execution",
            ErrorCategory::Build => "build",
            ErrorCategory::Worker => "worker",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Network => "network",
            ErrorCategory::Internal => "internal",
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON parse error in {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {message}")]
    Configuration { message: String },

    #[error("Unknown task reference '{reference}' declared by {task_id}")]
    UnknownTaskReference { reference: String, task_id: String },

    #[error("Task '{task}' is not defined for package '{package}'. Available tasks: {available}")]
    TaskNotFound {
        package: String,
        task: String,
        available: String,
    },

    #[error("Task '{task}' in package '{package}' maps to script '{script}' which does not exist")]
    MissingScript {
        package: String,
        task: String,
        script: String,
    },

    #[error("Circular task dependency: {chain}")]
    CircularTaskDependency { chain: String },

    #[error("Package not found: {name}")]
    PackageNotFound { name: String },

    #[error("Duplicate package name '{name}' at {first} and {second}")]
    DuplicatePackage {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("Circular package dependency: {chain}")]
    CircularPackageDependency { chain: String },

    #[error("Lockfile not found under {root}")]
    MissingLockfile { root: PathBuf },

    #[error("Task {task_id} exited with {code:?}")]
    TaskFailed {
        task_id: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Task {task_id} timed out after {timeout_ms} ms")]
    TaskTimeout { task_id: String, timeout_ms: u64 },

    #[error("No tasks matched: {requested}")]
    NoMatchedTasks { requested: String },

    #[error("Worker error: {message}")]
    Worker { message: String },

    #[error("Cache entry {cache_key} is corrupt: {reason}")]
    CorruptCacheEntry { cache_key: String, reason: String },

    #[error("Invalid glob '{glob}': {message}")]
    InvalidGlob { glob: String, message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Returns the taxonomy category for this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Configuration { .. }
            | Error::UnknownTaskReference { .. }
            | Error::TaskNotFound { .. }
            | Error::MissingScript { .. }
            | Error::CircularTaskDependency { .. }
            | Error::InvalidGlob { .. } => ErrorCategory::Configuration,
            Error::PackageNotFound { .. }
            | Error::DuplicatePackage { .. }
            | Error::CircularPackageDependency { .. } => ErrorCategory::Dependency,
            Error::Io { .. } | Error::MissingLockfile { .. } => ErrorCategory::FileSystem,
            Error::TaskFailed { .. } => ErrorCategory::Execution,
            Error::TaskTimeout { .. } | Error::NoMatchedTasks { .. } => ErrorCategory::Build,
            Error::Worker { .. } => ErrorCategory::Worker,
            Error::Json { .. } | Error::CorruptCacheEntry { .. } => ErrorCategory::Validation,
            Error::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// Whether the failing operation may be retried once at the caller's
    /// discretion. The engine itself never loop-retries executions.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Io { .. } => true,
            Error::TaskTimeout { .. } => true,
            Error::Worker { .. } => true,
            Error::CorruptCacheEntry { .. } => true,
            _ => false,
        }
    }

    /// One-line message suitable for the failure summary.
    pub fn user_message(&self) -> String {
        format!("[{}] {}", self.category().as_str(), self)
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        Error::Json {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Error::Configuration {
            message: message.into(),
        }
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
