//! Crate-wide error type: one flat enum with a `Display` impl and `From`
//! conversions for the external error types we wrap.

use std::fmt;

/// Errors raised by the module subsystem.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `(name, namespace)` is already present in the symbol registry, or an
    /// instance/candidate name collides with an existing one.
    #[error("duplicate entry: {0}")]
    Duplicate(String),

    /// A named instance, namespace, symbol or loading-set candidate does not
    /// exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An access-group check failed, a static dependency was asked to be
    /// removed, or an in-use instance was asked to unload.
    #[error("not permitted: {0}")]
    NotPermitted(String),

    /// `remove_dependency` was called on an entry that isn't present.
    #[error("not a dependency: {0}")]
    NotADependency(String),

    /// A parameter read/write used the wrong integer width.
    #[error("invalid parameter type: {0}")]
    InvalidParameterType(String),

    /// Inserting a node/edge would create a cycle in the dependency graph.
    #[error("cyclic dependency: {0}")]
    CyclicDependency(String),

    /// A second `commit()` was attempted while the subsystem is not idle and
    /// the caller bypassed the serialization queue (should not normally be
    /// observable; see [`crate::system::System`]).
    #[error("a loading set commit is already in progress")]
    LoadingInProcess,

    /// Operation attempted on a detached instance.
    #[error("instance is detached: {0}")]
    Detached(String),

    /// A candidate export failed validation. Surfaced only to callers that
    /// directly inspect append results; commit() itself only ever turns
    /// this into a per-candidate error callback.
    #[error("invalid module export: {0}")]
    InvalidExport(String),

    /// Heap allocation failure surfaced from a fallible allocation API.
    #[error("allocation failure: {0}")]
    Allocation(String),

    /// The path given to [`crate::loading_set::LoadingSet::add_modules_from_path`]
    /// does not point to a loadable module binary.
    #[error("invalid module path: {0}")]
    InvalidPath(String),

    /// The module binary is malformed, or is missing the module export
    /// iterator symbol.
    #[error("invalid module binary: {0}")]
    InvalidModule(String),

    /// The OS dynamic loader refused to load or resolve a binary.
    #[error("dynamic loader error: {0}")]
    DlOpen(#[from] libloading::Error),

    /// I/O failure while manipulating the subsystem's temporary directory.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A module-declared version string could not be parsed.
    #[error("invalid version: {0}")]
    InvalidVersion(#[from] semver::Error),
}

impl Error {
    pub(crate) fn duplicate(msg: impl fmt::Display) -> Self {
        Self::Duplicate(msg.to_string())
    }

    pub(crate) fn not_found(msg: impl fmt::Display) -> Self {
        Self::NotFound(msg.to_string())
    }

    pub(crate) fn not_permitted(msg: impl fmt::Display) -> Self {
        Self::NotPermitted(msg.to_string())
    }

    pub(crate) fn not_a_dependency(msg: impl fmt::Display) -> Self {
        Self::NotADependency(msg.to_string())
    }

    pub(crate) fn invalid_parameter_type(msg: impl fmt::Display) -> Self {
        Self::InvalidParameterType(msg.to_string())
    }

    pub(crate) fn cyclic_dependency(msg: impl fmt::Display) -> Self {
        Self::CyclicDependency(msg.to_string())
    }

    pub(crate) fn detached(msg: impl fmt::Display) -> Self {
        Self::Detached(msg.to_string())
    }

    pub(crate) fn invalid_export(msg: impl fmt::Display) -> Self {
        Self::InvalidExport(msg.to_string())
    }

    pub(crate) fn invalid_path(msg: impl fmt::Display) -> Self {
        Self::InvalidPath(msg.to_string())
    }

    pub(crate) fn invalid_module(msg: impl fmt::Display) -> Self {
        Self::InvalidModule(msg.to_string())
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
