//! Error kinds of the runtime.
//!
//! Every kind renders a one-line headline; structured detail stays on the
//! variant so a build log can show it below the headline. Errors that
//! affect the next redo decision are never swallowed: a failed redo leaves
//! the run-database untouched and the error resurfaces from the result
//! proxy.

use std::path::PathBuf;

use thiserror::Error;

/// A tool definition is invalid or ambiguous.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("tool definition location is not unique: {file}:{line} already defines {existing:?}")]
    AmbiguousLocation {
        file: &'static str,
        line: u32,
        existing: String,
    },

    #[error("invalid execution parameter name: {0:?} (must be an upper-case identifier)")]
    InvalidParameterName(String),

    #[error("invalid dependency name: {0:?} (must be a lower-case identifier)")]
    InvalidDependencyName(String),

    #[error("execution parameter {name:?} overridden with a value of different type")]
    ParameterTypeChanged { name: String },

    #[error("dependency {name:?} overridden by a less restrictive descriptor ({reason})")]
    DependencyNotMoreRestrictive { name: String, reason: String },

    #[error("dependency {name:?} overridden by a descriptor of different kind or role")]
    DependencyKindChanged { name: String },

    #[error("invalid multiplicity: {reason}")]
    InvalidMultiplicity { reason: String },

    #[error("tool definition {name:?} has no redo body")]
    MissingRedo { name: String },
}

/// An explicit dependency value does not satisfy its descriptor, or the
/// dependency set of a tool instance is inconsistent.
#[derive(Debug, Error)]
pub enum DependencyError {
    #[error("missing value for required dependency {name:?}")]
    MissingRequired { name: String },

    #[error("dependency {name:?} is not explicit and must not be assigned at construction")]
    NotExplicit { name: String },

    #[error("unknown dependency: {name:?}")]
    Unknown { name: String },

    #[error("invalid value for dependency {name:?}: {reason}")]
    InvalidValue { name: String, reason: String },

    #[error("multiplicity of dependency {name:?} not satisfied: {count} not in {range}")]
    Multiplicity {
        name: String,
        count: usize,
        range: String,
    },

    #[error("dependency {name:?}: {path:?} is missing or of wrong kind (expected {expected})")]
    WrongFilesystemObject {
        name: String,
        path: String,
        expected: &'static str,
    },

    #[error("dependencies {first:?} and {second:?} name the same environment variable {var:?}")]
    EnvVarConflict {
        first: String,
        second: String,
        var: String,
    },

    #[error("environment variable {var:?} of dependency {name:?} is undefined in the context")]
    EnvVarUndefined { name: String, var: String },

    #[error("value of environment variable {var:?} does not match {restriction:?}: {value:?}")]
    EnvVarMismatch {
        var: String,
        restriction: String,
        value: String,
    },

    #[error("path {path:?} is both an input and an output dependency")]
    InputIsOutput { path: String },

    #[error("output dependencies {first:?} and {second:?} name the same path {path:?}")]
    DuplicateOutput {
        first: String,
        second: String,
        path: String,
    },
}

/// An execution parameter value is not fundamentally marshallable.
#[derive(Debug, Error)]
pub enum ExecutionParameterError {
    #[error("value of execution parameter {name:?} is not fundamental: {reason}")]
    NotFundamental { name: String, reason: String },
}

/// The working tree or the active context is in a state that forbids the
/// requested operation.
#[derive(Debug, Error)]
pub enum WorkingTreeError {
    #[error("current directory contains no {dot_dlbroot:?}: {cwd:?}", dot_dlbroot = crate::context::MANAGEMENT_TREE_DIRECTORY)]
    NoManagementTree { cwd: PathBuf },

    #[error("cannot acquire lock: working tree is in use by another process (remove {lock_dir:?} only if no other process is running)")]
    LockHeld { lock_dir: PathBuf },

    #[error("root path violates {restriction}: {reason}")]
    RootPathRestricted {
        restriction: &'static str,
        reason: String,
    },

    #[error("path is outside the working tree: {path:?}")]
    OutsideTree { path: PathBuf },

    #[error("path cannot be collapsed without crossing a symbolic link: {path:?}")]
    Uncollapsable { path: PathBuf },

    #[error("filesystem object does not exist: {path:?}")]
    DoesNotExist { path: PathBuf },

    #[error("working tree time regressed (unsynchronized system clock or modified {probe:?}): {last} -> {observed}")]
    ClockRegression {
        probe: &'static str,
        last: i64,
        observed: i64,
    },

    #[error("working tree time probe {probe:?} is unusable, clock regression cannot be ruled out: {reason}")]
    ProbeUnusable { probe: &'static str, reason: String },

    #[error("invalid path: {0}")]
    Path(#[from] crate::fs::PathError),

    #[error("i/o error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no active root context")]
    NotRunning,

    #[error("nesting level limited by the root context: {reason}")]
    NestingRestricted { reason: String },
}

/// A redo body or the machinery around one misbehaved.
#[derive(Debug, Error)]
pub enum RedoError {
    #[error("redo did not assign required non-explicit dependency {name:?}")]
    UnassignedRequired { name: String },

    #[error("redo assigned non-explicit dependency {name:?} more than once")]
    AssignedTwice { name: String },

    #[error("redo must not assign explicit dependency {name:?}")]
    AssignedExplicit { name: String },

    #[error("redo failed earlier: {headline}")]
    PreviouslyFailed { headline: String },

    #[error("operation not permitted inside a running redo: {operation}")]
    ForbiddenInRedo { operation: &'static str },

    #[error("redo context no longer usable (redo has terminated)")]
    Terminated,

    #[error("redo was cancelled before completion")]
    Cancelled,

    #[error("timeout while waiting for pending redos")]
    Timeout,

    #[error("result was already consumed")]
    AlreadyConsumed,
}

/// A helper process misbehaved.
#[derive(Debug, Error)]
pub enum HelperExecutionError {
    #[error("helper {helper:?} returned unexpected exit code {returncode}")]
    UnexpectedReturnCode { helper: String, returncode: i32 },

    #[error("helper {helper:?} was terminated by a signal")]
    TerminatedBySignal { helper: String },

    #[error("chunk from helper {helper:?} exceeds {max_size} bytes")]
    ChunkTooLarge { helper: String, max_size: usize },

    #[error("helper {helper:?} could not be started: {source}")]
    Spawn {
        helper: String,
        #[source]
        source: std::io::Error,
    },

    #[error("helper name {helper:?} is not defined in the context")]
    UnknownHelper { helper: String },
}

/// The run-database failed.
///
/// The hint names the manual recovery step: the lock directory may be
/// removed once no other process uses the working tree.
#[derive(Debug, Error)]
#[error("run-database access failed: {reason}\n  | {hint}")]
pub struct DatabaseError {
    pub reason: String,
    pub hint: String,
}

impl DatabaseError {
    pub(crate) fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            hint: format!(
                "if this happens again, remove {:?} and {:?} manually when no other process uses the working tree",
                crate::context::LOCK_DIRECTORY,
                crate::context::MANAGEMENT_TREE_DIRECTORY,
            ),
        }
    }
}

impl From<sqlx::Error> for DatabaseError {
    fn from(e: sqlx::Error) -> Self {
        Self::new(e.to_string())
    }
}

/// Any error the runtime can produce, for APIs that cross component
/// boundaries (context entry, `start()`, result proxies).
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Definition(#[from] DefinitionError),
    #[error(transparent)]
    Dependency(#[from] DependencyError),
    #[error(transparent)]
    ExecutionParameter(#[from] ExecutionParameterError),
    #[error(transparent)]
    WorkingTree(#[from] WorkingTreeError),
    #[error(transparent)]
    Redo(#[from] RedoError),
    #[error(transparent)]
    HelperExecution(#[from] HelperExecutionError),
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error(transparent)]
    EnvVar(#[from] crate::context::env::EnvVarError),
}

impl From<crate::fs::PathError> for Error {
    fn from(e: crate::fs::PathError) -> Self {
        Error::WorkingTree(WorkingTreeError::Path(e))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
