//! `fimo-modules`: a dynamic module subsystem for a systems runtime.
//!
//! Loads, links, starts, stops and unloads *instances* of plug-in modules
//! defined in native shared objects (or embedded in the host binary),
//! guaranteeing symbol uniqueness, dependency acyclicity, version
//! compatibility and orderly teardown.
//!
//! A host embeds the subsystem by constructing a [`Context`], registering
//! itself as a [`Context::new_pseudo_instance`] if it wants to be a
//! dependency anchor, then opening a [`LoadingSet`] to append and commit
//! batches of module candidates. Loaded instances are resolved later
//! through [`Context::find_by_name`] / [`Context::find_by_symbol`], and
//! their parameters are read and written through
//! [`Context::read_parameter`] / [`Context::write_parameter`] or, for
//! dependency/private access, directly on [`instance::InstanceHandle`].
//!
//! # Example
//!
//! ```no_run
//! use fimo_modules::{Config, Context};
//!
//! let ctx = Context::new(Config::new()).unwrap();
//! let set = ctx.new_loading_set();
//! set.add_modules_from_path(std::path::Path::new("./plugins/example.so"), |_| true).unwrap();
//! set.commit().wait().unwrap();
//! ```

mod graph;
mod registry;
mod rt;
mod system;

pub mod config;
pub mod context;
pub mod error;
pub mod instance;
pub mod loading_set;
pub mod module;
pub mod version;

pub use config::{Config, FeatureRequest, Profile};
pub use context::{Context, CONTEXT_VERSION};
pub use error::{Error, Result};
pub use instance::{
    DependencyKind, ExportedSymbolRecord, ImportedSymbolRecord, InstanceHandle, InstanceInfo, InstanceKind,
    LifecycleHooks, LifecycleState, ParameterAccessGroup, ParameterCallbacks, ParameterCell, ParameterType,
    ParameterValue,
};
pub use loading_set::LoadingSet;
pub use module::{
    DynamicSymbolExport, ExportIteratorFn, Export, Modifier, ModuleHandle, ParameterDeclaration,
    ResourceDeclaration, SharedModuleHandle, StaticSymbolExport, SymbolImport, EXPORT_ITERATOR_SYMBOL,
};
pub use version::Version;
