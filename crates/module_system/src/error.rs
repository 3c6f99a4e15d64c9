//! Error types for the module host.
//!
//! [`ModuleError`] covers everything that can go wrong between reading a
//! module's source and holding a live instance of it. [`CommandError`] covers
//! command registration and dispatch; dispatch errors are user-visible and
//! never fatal to the host.

use std::io::Error as IoError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while extracting, ordering, compiling or loading modules.
#[derive(Debug, Error)]
pub enum ModuleError {
    /// The source does not declare exactly one public module type, or cannot be parsed.
    #[error("Malformed module {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    /// rustc reported diagnostics at error severity.
    #[error("Compilation of module {identity} failed:\n{diagnostics}")]
    Compilation { identity: String, diagnostics: String },

    /// The compiled image does not match what its descriptor promised.
    #[error("Load integrity check failed for module {identity}: {reason}")]
    LoadIntegrity { identity: String, reason: String },

    /// A required dependency has no compiled image yet.
    #[error("Module {identity} references {dependency}, which has no compiled image")]
    UnresolvedReference { identity: String, dependency: String },

    #[error("Module {identity} requires {dependency}, which is not available")]
    MissingDependency { identity: String, dependency: String },

    #[error("Dependency cycle detected: {}", .cycle.join(" -> "))]
    DependencyCycle { cycle: Vec<String> },

    #[error("Module {0} is already registered")]
    DuplicateIdentity(String),

    #[error("Module {0} not found")]
    NotFound(String),

    #[error("Module {0} has not been compiled")]
    NotCompiled(String),

    #[error("Module {identity} is already loaded in generation {generation}")]
    AlreadyLoaded { identity: String, generation: u64 },

    /// A handle from a generation that has since been unloaded was used.
    #[error("Module {identity} belongs to unloaded generation {generation}")]
    StaleInstance { identity: String, generation: u64 },

    /// A lifecycle hook panicked inside the module.
    #[error("Module {identity} panicked in {hook}")]
    Hook { identity: String, hook: &'static str },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: IoError,
    },

    #[error("Failed to run compiler {program}: {source}")]
    Toolchain {
        program: PathBuf,
        #[source]
        source: IoError,
    },

    #[error("Command registration failed: {0}")]
    CommandRegistration(#[from] CommandError),
}

impl ModuleError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: IoError) -> Self {
        ModuleError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        ModuleError::Malformed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn integrity(identity: &str, reason: impl Into<String>) -> Self {
        ModuleError::LoadIntegrity {
            identity: identity.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors raised by the command dispatch engine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    /// Registration would make the namespace ambiguous.
    #[error("Command '{key}' conflicts with '{existing}': {reason}")]
    Conflict {
        key: String,
        existing: String,
        reason: String,
    },

    #[error("Command '{key}' expects {} arguments, got {given}", expected_range(.min, .max))]
    ArgumentRange {
        key: String,
        min: usize,
        max: usize,
        given: usize,
    },

    #[error("Cannot convert '{value}' to {target}")]
    ArgumentConversion { value: String, target: String },

    #[error("Command '{key}' failed: {message}")]
    Handler { key: String, message: String },

    #[error("Command owner {owner} belongs to unloaded generation {generation}")]
    StaleInstance { owner: String, generation: u64 },
}

fn expected_range(min: &usize, max: &usize) -> String {
    if min == max {
        format!("exactly {}", min)
    } else {
        format!("between {} and {}", min, max)
    }
}
