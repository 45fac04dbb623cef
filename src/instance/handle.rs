//! Instance handle (C3): the mutable control block backing one loaded
//! instance.
//!
//! Two atomic counters gate the handle's own lifetime (`handle_refcount`)
//! and whether the instance may be unloaded (`strong_count`); everything
//! else — parameters, namespace includes, dependencies, import/export
//! tables — lives behind one `Mutex<Inner>`, the handle's "intrinsic lock".
//! Operations that must upcall into module-supplied code (`on_start`,
//! `on_stop`, the instance state constructor/destructor) temporarily move
//! the relevant field out of `Inner`, drop the lock for the call, then
//! re-acquire to put it back or commit the transition, without resorting to
//! reconstructing an owning pointer across the suspend point.

use crate::error::{Error, Result};
use crate::instance::parameter::{ParameterCell, ParameterValue};
use crate::module::handle::SharedModuleHandle;
use crate::version::Version;
use indexmap::IndexMap;
use std::any::Any;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Regular instances are backed by a real module export; pseudo instances
/// are the host's own bootstrapping identity and carry no export manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceKind {
    Regular,
    Pseudo,
}

/// `uninit -> init -> started -> init -> ...`; `detach` is orthogonal,
/// tracked by `Inner::is_detached` rather than as a fourth state, since an
/// instance can only ever be detached from `init` (never from `started`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninit,
    Init,
    Started,
}

/// Static entries are created at load time and may only be removed by a
/// full unload; dynamic entries are created/removed at runtime via
/// `add_dependency`/`remove_dependency` or `add_namespace`/`remove_namespace`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyKind {
    Static,
    Dynamic,
}

/// A symbol this instance imports, resolved once at load time.
pub struct ImportedSymbolRecord {
    pub name: String,
    pub namespace: String,
    pub owner: String,
    pub pointer: Arc<dyn Any + Send + Sync>,
}

/// A symbol this instance exports. Exported pointers are shared with every
/// importer (lifetime = longest holder, enforced through dependency edges);
/// dynamic exports additionally carry a destructor run at detach time.
pub struct ExportedSymbolRecord {
    pub name: String,
    pub namespace: String,
    pub version: Version,
    pub pointer: Arc<dyn Any + Send + Sync>,
    pub destructor: Option<Box<dyn Fn(Arc<dyn Any + Send + Sync>) + Send + Sync>>,
}

struct DependencyEntry {
    handle: Arc<InstanceHandle>,
    kind: DependencyKind,
}

/// Module-supplied lifecycle hooks, extracted from the export's modifiers
/// at construction time. These never change for the life of the handle, so
/// unlike the rest of the instance's state they live outside `Inner` and
/// need no locking to read.
#[derive(Default)]
pub struct LifecycleHooks {
    pub start_event: Option<Box<dyn Fn(&dyn Any) -> Result<()> + Send + Sync>>,
    pub stop_event: Option<Box<dyn Fn(&dyn Any) + Send + Sync>>,
    pub instance_state_ctor: Option<Box<dyn Fn() -> Result<Box<dyn Any + Send + Sync>> + Send + Sync>>,
    pub destructor: Option<Box<dyn Fn(Box<dyn Any + Send + Sync>) + Send + Sync>>,
}

struct Inner {
    state: LifecycleState,
    is_detached: bool,
    instance_state: Option<Box<dyn Any + Send + Sync>>,
    parameters: IndexMap<String, Arc<ParameterCell>>,
    resources: IndexMap<String, PathBuf>,
    namespaces_included: IndexMap<String, DependencyKind>,
    dependencies: IndexMap<String, DependencyEntry>,
    imports: Vec<ImportedSymbolRecord>,
    exports: Vec<ExportedSymbolRecord>,
    module_handle: Option<SharedModuleHandle>,
}

/// Used when an upcall needs `&dyn Any` but no instance state was produced.
static NO_STATE: () = ();

fn state_ref(state: &Option<Box<dyn Any + Send + Sync>>) -> &dyn Any {
    match state {
        Some(boxed) => boxed.as_ref(),
        None => &NO_STATE,
    }
}

/// The mutable control block of a loaded instance.
pub struct InstanceHandle {
    name: String,
    kind: InstanceKind,
    description: Option<String>,
    author: Option<String>,
    license: Option<String>,
    module_directory: Option<PathBuf>,
    hooks: LifecycleHooks,
    handle_refcount: AtomicUsize,
    strong_count: AtomicUsize,
    inner: Mutex<Inner>,
}

impl InstanceHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> InstanceKind {
        self.kind
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn author(&self) -> Option<&str> {
        self.author.as_deref()
    }

    pub fn license(&self) -> Option<&str> {
        self.license.as_deref()
    }

    pub fn module_directory(&self) -> Option<&std::path::Path> {
        self.module_directory.as_deref()
    }

    /// `¬is_detached`.
    pub fn is_loaded(&self) -> bool {
        !self.inner.lock().unwrap().is_detached
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lock().unwrap().state
    }

    pub(crate) fn module_handle(&self) -> Option<SharedModuleHandle> {
        self.inner.lock().unwrap().module_handle.clone()
    }

    /// Handle refcount: a logical `acquire`/`release` pair distinct from
    /// `Arc` cloning. Actual memory is managed by the
    /// surrounding `Arc<InstanceHandle>` as usual in Rust; this counter
    /// exists so `is_loaded`-adjacent bookkeeping and the saturation-abort
    /// rule have somewhere to live independent of how many `Arc` clones a
    /// given caller happens to keep around.
    pub fn acquire(&self) {
        let prev = self.handle_refcount.fetch_add(1, Ordering::SeqCst);
        if prev == usize::MAX {
            std::process::abort();
        }
    }

    pub fn release(&self) {
        let prev = self.handle_refcount.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev != 0, "handle refcount underflow on `{}`", self.name);
    }

    pub fn handle_refcount(&self) -> usize {
        self.handle_refcount.load(Ordering::SeqCst)
    }

    /// Fails with [`Error::Detached`] if the instance is detached; otherwise
    /// increments the strong count, which in turn blocks `detach`.
    pub fn try_acquire_strong(&self) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        if inner.is_detached {
            return Err(Error::detached(format!("instance `{}`", self.name)));
        }
        let prev = self.strong_count.fetch_add(1, Ordering::SeqCst);
        if prev == usize::MAX {
            std::process::abort();
        }
        Ok(())
    }

    pub fn release_strong(&self) {
        let prev = self.strong_count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev != 0, "strong count underflow on `{}`", self.name);
    }

    pub fn strong_count(&self) -> usize {
        self.strong_count.load(Ordering::SeqCst)
    }

    pub fn query_namespace(&self, namespace: &str) -> Option<DependencyKind> {
        self.inner.lock().unwrap().namespaces_included.get(namespace).copied()
    }

    pub fn add_namespace(&self, namespace: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.is_detached {
            return Err(Error::detached(format!("instance `{}`", self.name)));
        }
        inner
            .namespaces_included
            .entry(namespace.to_owned())
            .or_insert(DependencyKind::Dynamic);
        Ok(())
    }

    pub fn remove_namespace(&self, namespace: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.is_detached {
            return Err(Error::detached(format!("instance `{}`", self.name)));
        }
        match inner.namespaces_included.get(namespace) {
            None => Err(Error::not_a_dependency(format!("namespace `{namespace}`"))),
            Some(DependencyKind::Static) => Err(Error::not_permitted(format!(
                "`{namespace}` was included statically and cannot be removed before unload"
            ))),
            Some(DependencyKind::Dynamic) => {
                inner.namespaces_included.shift_remove(namespace);
                Ok(())
            }
        }
    }

    pub fn query_dependency(&self, owner: &str) -> Option<DependencyKind> {
        self.inner.lock().unwrap().dependencies.get(owner).map(|d| d.kind)
    }

    pub fn dependency_names(&self) -> Vec<String> {
        self.inner.lock().unwrap().dependencies.keys().cloned().collect()
    }

    pub(crate) fn add_dependency_handle(&self, handle: Arc<InstanceHandle>, kind: DependencyKind) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.is_detached {
            return Err(Error::detached(format!("instance `{}`", self.name)));
        }
        inner
            .dependencies
            .entry(handle.name().to_owned())
            .or_insert(DependencyEntry { handle, kind });
        Ok(())
    }

    /// Runtime `add_dependency`: always recorded as dynamic.
    pub fn add_dependency(&self, handle: Arc<InstanceHandle>) -> Result<()> {
        self.add_dependency_handle(handle, DependencyKind::Dynamic)
    }

    pub fn remove_dependency(&self, owner: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.is_detached {
            return Err(Error::detached(format!("instance `{}`", self.name)));
        }
        match inner.dependencies.get(owner) {
            None => Err(Error::not_a_dependency(format!("instance `{owner}`"))),
            Some(DependencyEntry { kind: DependencyKind::Static, .. }) => Err(Error::not_permitted(format!(
                "`{owner}` is a static dependency of `{}` and cannot be removed before unload",
                self.name
            ))),
            Some(_) => {
                inner.dependencies.shift_remove(owner);
                Ok(())
            }
        }
    }

    /// Looks up one of this instance's own imports by name/namespace.
    pub fn load_symbol(&self, name: &str, namespace: &str) -> Result<Arc<dyn Any + Send + Sync>> {
        let inner = self.inner.lock().unwrap();
        if inner.is_detached {
            return Err(Error::detached(format!("instance `{}`", self.name)));
        }
        inner
            .imports
            .iter()
            .find(|imp| imp.name == name && imp.namespace == namespace)
            .map(|imp| imp.pointer.clone())
            .ok_or_else(|| {
                Error::not_found(format!(
                    "symbol `{name}` in namespace `{namespace}` is not imported by `{}`",
                    self.name
                ))
            })
    }

    /// Fetches the live pointer behind one of this instance's own exports,
    /// for wiring another instance's import table during construction.
    pub(crate) fn exported_pointer(&self, name: &str, namespace: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner
            .lock()
            .unwrap()
            .exports
            .iter()
            .find(|e| e.name == name && e.namespace == namespace)
            .map(|e| e.pointer.clone())
    }

    /// Moves a freshly built handle from `uninit` to `init`, with no upcall.
    /// Used once by a load task right before `start`.
    pub(crate) fn enter_init(&self) {
        self.inner.lock().unwrap().state = LifecycleState::Init;
    }

    pub fn exported_symbols(&self) -> Vec<(String, String, Version)> {
        self.inner
            .lock()
            .unwrap()
            .exports
            .iter()
            .map(|e| (e.name.clone(), e.namespace.clone(), e.version.clone()))
            .collect()
    }

    pub fn included_namespaces(&self) -> Vec<String> {
        self.inner.lock().unwrap().namespaces_included.keys().cloned().collect()
    }

    fn parameter_cell(&self, name: &str) -> Result<Arc<ParameterCell>> {
        let inner = self.inner.lock().unwrap();
        if inner.is_detached {
            return Err(Error::detached(format!("instance `{}`", self.name)));
        }
        inner
            .parameters
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("parameter `{name}` on instance `{}`", self.name)))
    }

    /// Looks up a parameter's declared type without checking read/write
    /// access: querying what a parameter is does not require any access
    /// group, only that it exists and the instance is not detached.
    pub fn query_parameter_type(&self, name: &str) -> Result<crate::instance::parameter::ParameterType> {
        Ok(self.parameter_cell(name)?.type_())
    }

    pub fn read_parameter_public(&self, name: &str) -> Result<ParameterValue> {
        let cell = self.parameter_cell(name)?;
        cell.check_read_public()?;
        Ok(cell.read())
    }

    pub fn write_parameter_public(&self, name: &str, value: ParameterValue) -> Result<()> {
        let cell = self.parameter_cell(name)?;
        cell.check_write_public()?;
        cell.write(value)
    }

    pub fn read_parameter_dependency(&self, caller: &str, name: &str) -> Result<ParameterValue> {
        let cell = self.parameter_cell(name)?;
        let is_dependent = self.inner.lock().unwrap().dependencies.contains_key(caller);
        cell.check_read_dependency(caller, is_dependent)?;
        Ok(cell.read())
    }

    pub fn write_parameter_dependency(&self, caller: &str, name: &str, value: ParameterValue) -> Result<()> {
        let cell = self.parameter_cell(name)?;
        let is_dependent = self.inner.lock().unwrap().dependencies.contains_key(caller);
        cell.check_write_dependency(caller, is_dependent)?;
        cell.write(value)
    }

    pub fn read_parameter_private(&self, caller: &str, name: &str) -> Result<ParameterValue> {
        let cell = self.parameter_cell(name)?;
        cell.check_read_private(caller)?;
        Ok(cell.read())
    }

    pub fn write_parameter_private(&self, caller: &str, name: &str, value: ParameterValue) -> Result<()> {
        let cell = self.parameter_cell(name)?;
        cell.check_write_private(caller)?;
        cell.write(value)
    }

    /// Allowed only from `init`. Drops the handle lock for the `on_start`
    /// upcall, re-validating on return: if the instance was concurrently
    /// detached during the call, the transition to `started` is abandoned
    /// and `Detached` is surfaced instead.
    pub fn start(&self) -> Result<()> {
        {
            let inner = self.inner.lock().unwrap();
            if inner.is_detached {
                return Err(Error::detached(format!("instance `{}`", self.name)));
            }
            if inner.state != LifecycleState::Init {
                return Err(Error::not_permitted(format!(
                    "`{}` must be in the `init` state to start",
                    self.name
                )));
            }
        }

        let state = { self.inner.lock().unwrap().instance_state.take() };
        let result = match &self.hooks.start_event {
            Some(on_start) => on_start(state_ref(&state)),
            None => Ok(()),
        };

        let mut inner = self.inner.lock().unwrap();
        inner.instance_state = state;
        if inner.is_detached {
            return Err(Error::detached(format!("instance `{}`", self.name)));
        }
        result?;
        inner.state = LifecycleState::Started;
        Ok(())
    }

    /// Allowed only from `started`. The instance is marked
    /// detached *for the duration of the upcall only*, fencing off
    /// concurrent access while `on_stop` runs with all locks dropped, then
    /// un-detached and returned to `init`.
    pub fn stop(&self) -> Result<()> {
        {
            let inner = self.inner.lock().unwrap();
            if inner.state != LifecycleState::Started {
                return Err(Error::not_permitted(format!(
                    "`{}` must be in the `started` state to stop",
                    self.name
                )));
            }
        }

        let state = {
            let mut inner = self.inner.lock().unwrap();
            inner.is_detached = true;
            inner.instance_state.take()
        };

        if let Some(on_stop) = &self.hooks.stop_event {
            on_stop(state_ref(&state));
        }

        let mut inner = self.inner.lock().unwrap();
        inner.instance_state = state;
        inner.is_detached = false;
        inner.state = LifecycleState::Init;
        Ok(())
    }

    /// Precondition: `state != Started && strong_count == 0`. Tears down
    /// every map and releases the module handle; dynamic exports are
    /// destructed in reverse declaration order (see `DESIGN.md` for why
    /// reverse was picked).
    pub fn detach(&self) -> Result<()> {
        let (instance_state, exports, module_handle, already_detached) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == LifecycleState::Started {
                return Err(Error::not_permitted(format!("`{}` is started", self.name)));
            }
            if self.strong_count.load(Ordering::SeqCst) != 0 {
                return Err(Error::not_permitted(format!(
                    "`{}` still has outstanding strong references",
                    self.name
                )));
            }
            if inner.is_detached {
                (None, Vec::new(), None, true)
            } else {
                let was_init = inner.state == LifecycleState::Init;
                inner.is_detached = true;
                let instance_state = if was_init { inner.instance_state.take() } else { None };
                let exports = std::mem::take(&mut inner.exports);
                inner.parameters.clear();
                inner.resources.clear();
                inner.imports.clear();
                inner.namespaces_included.clear();
                inner.dependencies.clear();
                let module_handle = inner.module_handle.take();
                (instance_state, exports, module_handle, false)
            }
        };

        if already_detached {
            return Ok(());
        }

        if let (Some(state), Some(destructor)) = (instance_state, &self.hooks.destructor) {
            destructor(state);
        }
        for export in exports.into_iter().rev() {
            if let Some(destructor) = export.destructor {
                destructor(export.pointer);
            }
        }
        drop(module_handle);
        Ok(())
    }
}

/// The public, shareable reference to an instance: a thin wrapper over
/// `Arc<InstanceHandle>`, an owned, cheaply cloneable handle rather than a
/// borrowed reference, since Rust has no ambient borrow-checked lifetime to
/// hang a `&'a` reference off across the public API.
#[derive(Clone)]
pub struct InstanceInfo(Arc<InstanceHandle>);

impl InstanceInfo {
    pub(crate) fn new(handle: Arc<InstanceHandle>) -> Self {
        handle.acquire();
        Self(handle)
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }

    pub fn kind(&self) -> InstanceKind {
        self.0.kind()
    }

    pub fn is_loaded(&self) -> bool {
        self.0.is_loaded()
    }

    pub fn handle(&self) -> &Arc<InstanceHandle> {
        &self.0
    }
}

impl Drop for InstanceInfo {
    fn drop(&mut self) {
        self.0.release();
    }
}

impl std::fmt::Debug for InstanceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceInfo").field("name", &self.name()).finish()
    }
}

/// Accumulates an instance's state during a loading-set load task, then
/// produces a fully formed `Arc<InstanceHandle>` with `handle_refcount ==
/// 1` and `strong_count == 0`. Kept separate from `InstanceHandle` itself
/// so construction — which touches every map before anything is shared —
/// never has to take the handle's own lock.
pub struct InstanceHandleBuilder {
    name: String,
    kind: InstanceKind,
    description: Option<String>,
    author: Option<String>,
    license: Option<String>,
    module_directory: Option<PathBuf>,
    module_handle: Option<SharedModuleHandle>,
    hooks: LifecycleHooks,
    parameters: IndexMap<String, Arc<ParameterCell>>,
    resources: IndexMap<String, PathBuf>,
    namespaces_included: IndexMap<String, DependencyKind>,
    dependencies: IndexMap<String, (Arc<InstanceHandle>, DependencyKind)>,
    imports: Vec<ImportedSymbolRecord>,
    exports: Vec<ExportedSymbolRecord>,
    instance_state: Option<Box<dyn Any + Send + Sync>>,
}

impl InstanceHandleBuilder {
    pub fn new_regular(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: InstanceKind::Regular,
            description: None,
            author: None,
            license: None,
            module_directory: None,
            module_handle: None,
            hooks: LifecycleHooks::default(),
            parameters: IndexMap::new(),
            resources: IndexMap::new(),
            namespaces_included: IndexMap::new(),
            dependencies: IndexMap::new(),
            imports: Vec::new(),
            exports: Vec::new(),
            instance_state: None,
        }
    }

    pub fn new_pseudo(name: impl Into<String>) -> Self {
        Self {
            kind: InstanceKind::Pseudo,
            ..Self::new_regular(name)
        }
    }

    pub fn with_metadata(mut self, description: Option<String>, author: Option<String>, license: Option<String>) -> Self {
        self.description = description;
        self.author = author;
        self.license = license;
        self
    }

    pub fn with_module(mut self, handle: SharedModuleHandle, directory: PathBuf) -> Self {
        self.module_handle = Some(handle);
        self.module_directory = Some(directory);
        self
    }

    pub fn with_hooks(mut self, hooks: LifecycleHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Stores the value produced by the export's `InstanceState` modifier
    /// constructor (run by the caller before the builder exists), so it
    /// reaches `on_start`/`on_stop` and the `Destructor` modifier once the
    /// handle is built.
    pub fn with_instance_state(mut self, state: Box<dyn Any + Send + Sync>) -> Self {
        self.instance_state = Some(state);
        self
    }

    pub fn add_parameter(&mut self, cell: ParameterCell) {
        self.parameters.insert(cell.name().to_owned(), Arc::new(cell));
    }

    pub fn add_resource(&mut self, name: impl Into<String>, path: PathBuf) {
        self.resources.insert(name.into(), path);
    }

    pub fn add_namespace_include(&mut self, namespace: impl Into<String>, kind: DependencyKind) {
        self.namespaces_included.insert(namespace.into(), kind);
    }

    pub fn add_dependency(&mut self, handle: Arc<InstanceHandle>, kind: DependencyKind) {
        self.dependencies
            .entry(handle.name().to_owned())
            .or_insert((handle, kind));
    }

    pub fn add_import(&mut self, record: ImportedSymbolRecord) {
        self.imports.push(record);
    }

    pub fn add_export(&mut self, record: ExportedSymbolRecord) {
        self.exports.push(record);
    }

    pub fn parameter_names(&self) -> impl Iterator<Item = &str> {
        self.parameters.keys().map(String::as_str)
    }

    pub fn build(self) -> Result<Arc<InstanceHandle>> {
        let dependencies = self
            .dependencies
            .into_iter()
            .map(|(name, (handle, kind))| (name, DependencyEntry { handle, kind }))
            .collect();

        Ok(Arc::new(InstanceHandle {
            name: self.name,
            kind: self.kind,
            description: self.description,
            author: self.author,
            license: self.license,
            module_directory: self.module_directory,
            hooks: self.hooks,
            handle_refcount: AtomicUsize::new(1),
            strong_count: AtomicUsize::new(0),
            inner: Mutex::new(Inner {
                state: LifecycleState::Uninit,
                is_detached: false,
                instance_state: self.instance_state,
                parameters: self.parameters,
                resources: self.resources,
                namespaces_included: self.namespaces_included,
                dependencies,
                imports: self.imports,
                exports: self.exports,
                module_handle: self.module_handle,
            }),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pseudo(name: &str) -> Arc<InstanceHandle> {
        InstanceHandleBuilder::new_pseudo(name).build().unwrap()
    }

    #[test]
    fn pseudo_instance_starts_empty() {
        let h = pseudo("host");
        assert!(h.is_loaded());
        assert_eq!(h.kind(), InstanceKind::Pseudo);
        assert!(h.exported_symbols().is_empty());
    }

    #[test]
    fn lifecycle_linearity() {
        let h = pseudo("a");
        assert_eq!(h.state(), LifecycleState::Uninit);
        {
            let mut inner = h.inner.lock().unwrap();
            inner.state = LifecycleState::Init;
        }
        h.start().unwrap();
        assert_eq!(h.state(), LifecycleState::Started);
        h.stop().unwrap();
        assert_eq!(h.state(), LifecycleState::Init);
    }

    #[test]
    fn start_requires_init_state() {
        let h = pseudo("a");
        assert!(matches!(h.start().unwrap_err(), Error::NotPermitted(_)));
    }

    #[test]
    fn detach_requires_zero_strong_count() {
        let h = pseudo("a");
        h.try_acquire_strong().unwrap();
        assert!(matches!(h.detach().unwrap_err(), Error::NotPermitted(_)));
        h.release_strong();
        h.detach().unwrap();
        assert!(!h.is_loaded());
    }

    #[test]
    fn remove_static_dependency_is_not_permitted() {
        let dep = pseudo("dep");
        let h = pseudo("a");
        h.add_dependency_handle(dep, DependencyKind::Static).unwrap();
        assert!(matches!(h.remove_dependency("dep").unwrap_err(), Error::NotPermitted(_)));
    }

    #[test]
    fn remove_dynamic_dependency_succeeds() {
        let dep = pseudo("dep");
        let h = pseudo("a");
        h.add_dependency(dep).unwrap();
        h.remove_dependency("dep").unwrap();
        assert!(h.query_dependency("dep").is_none());
    }

    #[test]
    fn detach_is_idempotent() {
        let h = pseudo("a");
        h.detach().unwrap();
        h.detach().unwrap();
    }
}
