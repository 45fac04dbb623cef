//! Loading set (C7): the batch commit pipeline. A set accumulates candidate
//! module exports, then `commit()` validates them against each other and
//! against the running [`crate::system::System`], builds a dependency order,
//! and loads every resolvable candidate concurrently on the event loop.
//!
//! Grounded on the commit state machine described for this subsystem: the
//! top-level commit future and each per-candidate load task are both built
//! as [`crate::rt::fsm::FsmFuture`] state machines rather than hand-written
//! `poll` implementations, matching how [`crate::rt::fsm`] is used elsewhere
//! in the event loop.

use crate::error::{Error, Result};
use crate::graph::DependencyGraph;
use crate::instance::handle::{
    DependencyKind, ExportedSymbolRecord, ImportedSymbolRecord, InstanceHandle, InstanceHandleBuilder, InstanceInfo,
    LifecycleHooks,
};
use crate::instance::parameter::{ParameterCallbacks, ParameterCell, ParameterValue};
use crate::module::export::{Export, Modifier};
use crate::module::handle::{ExportIteratorFn, ModuleHandle};
use crate::rt::{EnqueuedFuture, EventLoop, Fsm, FsmFuture, Step};
use crate::system::System;
use crate::version::Version;
use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Waker};

type SuccessCb = Box<dyn FnOnce(InstanceInfo) + Send>;
type ErrorCb = Box<dyn FnOnce(&str) + Send>;
type AbortCb = Box<dyn FnOnce() + Send>;

struct CallbackSet {
    on_success: Option<SuccessCb>,
    on_error: Option<ErrorCb>,
}

enum CandidateState {
    Unloaded,
    Loaded(InstanceInfo),
    Error(String),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum CandidateStateKind {
    Unloaded,
    Loaded,
    Error,
}

fn candidate_state_kind(c: &Candidate) -> CandidateStateKind {
    match c.state {
        CandidateState::Unloaded => CandidateStateKind::Unloaded,
        CandidateState::Loaded(_) => CandidateStateKind::Loaded,
        CandidateState::Error(_) => CandidateStateKind::Error,
    }
}

/// Holds a strong reference on the owning instance for the lifetime of a
/// candidate appended via [`LoadingSet::add_module`].
struct StrongGuard(Arc<InstanceHandle>);

impl Drop for StrongGuard {
    fn drop(&mut self) {
        self.0.release_strong();
    }
}

struct Candidate {
    export: Option<Export>,
    module: Option<Arc<ModuleHandle>>,
    directory: Option<PathBuf>,
    _owner_guard: Option<StrongGuard>,
    state: CandidateState,
    callbacks: Vec<CallbackSet>,
    waiters: Vec<Waker>,
}

fn candidate_export_keys(export: &Export) -> Vec<(String, String)> {
    let mut keys: Vec<(String, String)> = export
        .static_exports
        .iter()
        .map(|e| (e.name.clone(), e.namespace.clone()))
        .collect();
    keys.extend(export.dynamic_exports.iter().map(|e| (e.name.clone(), e.namespace.clone())));
    keys
}

fn candidate_import_keys(export: &Export) -> Vec<(String, String, Version)> {
    export
        .symbol_imports
        .iter()
        .map(|i| (i.name.clone(), i.namespace.clone(), i.version.clone()))
        .collect()
}

fn candidate_export_version<'a>(export: &'a Export, name: &str, namespace: &str) -> Option<&'a Version> {
    export
        .static_exports
        .iter()
        .find(|e| e.name == name && e.namespace == namespace)
        .map(|e| &e.version)
        .or_else(|| {
            export
                .dynamic_exports
                .iter()
                .find(|e| e.name == name && e.namespace == namespace)
                .map(|e| &e.version)
        })
}

struct LoadingSetInner {
    candidates: IndexMap<String, Candidate>,
}

/// An accumulating batch of candidate module exports, committed together.
pub struct LoadingSet {
    system: Arc<System>,
    event_loop: Arc<EventLoop>,
    context_version: Version,
    inner: Mutex<LoadingSetInner>,
    handle_refcount: AtomicUsize,
}

impl LoadingSet {
    pub(crate) fn new(system: Arc<System>, event_loop: Arc<EventLoop>, context_version: Version) -> Arc<Self> {
        Arc::new(Self {
            system,
            event_loop,
            context_version,
            inner: Mutex::new(LoadingSetInner {
                candidates: IndexMap::new(),
            }),
            handle_refcount: AtomicUsize::new(1),
        })
    }

    pub fn acquire(&self) {
        let prev = self.handle_refcount.fetch_add(1, Ordering::SeqCst);
        if prev == usize::MAX {
            std::process::abort();
        }
    }

    pub fn release(&self) {
        let prev = self.handle_refcount.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev != 0, "loading set handle refcount underflow");
    }

    pub fn query_module(&self, name: &str) -> bool {
        self.inner.lock().unwrap().candidates.contains_key(name)
    }

    pub fn query_symbol(&self, name: &str, namespace: &str, required: &Version) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.candidates.values().any(|c| {
            c.export
                .as_ref()
                .and_then(|export| candidate_export_version(export, name, namespace))
                .is_some_and(|v| v.is_compatible_with(required))
        })
    }

    fn validate_candidate(&self, export: &Export) -> std::result::Result<(), String> {
        export.validate()?;
        if !export.context_version.is_compatible_with(&self.context_version) {
            return Err(format!(
                "export `{}` declares context version {} incompatible with the running context {}",
                export.name, export.context_version, self.context_version
            ));
        }
        Ok(())
    }

    fn append_candidate(
        inner: &mut LoadingSetInner,
        export: Export,
        module: Option<Arc<ModuleHandle>>,
        directory: Option<PathBuf>,
        owner_guard: Option<StrongGuard>,
    ) -> Result<()> {
        if inner.candidates.contains_key(&export.name) {
            return Err(Error::duplicate(format!("candidate `{}`", export.name)));
        }
        inner.candidates.insert(
            export.name.clone(),
            Candidate {
                export: Some(export),
                module,
                directory,
                _owner_guard: owner_guard,
                state: CandidateState::Unloaded,
                callbacks: Vec::new(),
                waiters: Vec::new(),
            },
        );
        Ok(())
    }

    /// Appends a candidate whose backing binary is the one already loaded
    /// for `owner`; holds a strong reference on `owner` for as long as the
    /// candidate entry lives.
    pub fn add_module(&self, owner: &InstanceInfo, export: Export) -> Result<()> {
        self.validate_candidate(&export).map_err(Error::invalid_export)?;
        owner.handle().try_acquire_strong()?;
        let guard = StrongGuard(owner.handle().clone());
        let module = owner.handle().module_handle();
        let directory = owner.handle().module_directory().map(Path::to_path_buf);
        let mut inner = self.inner.lock().unwrap();
        Self::append_candidate(&mut inner, export, module, directory, Some(guard))
    }

    fn add_modules_from_handle(&self, module: Arc<ModuleHandle>, mut filter: impl FnMut(&Export) -> bool) -> Result<()> {
        let directory = module.directory().to_path_buf();
        let mut chosen = Vec::new();
        module.iterate(|export| {
            match self.validate_candidate(&export) {
                Ok(()) => {
                    if filter(&export) {
                        chosen.push(export);
                    }
                }
                Err(reason) => log::warn!("skipping module export `{}`: {reason}", export.name),
            }
            true
        });

        let mut inner = self.inner.lock().unwrap();
        let mut appended = Vec::new();
        for export in chosen {
            let name = export.name.clone();
            match Self::append_candidate(&mut inner, export, Some(module.clone()), Some(directory.clone()), None) {
                Ok(()) => appended.push(name),
                Err(e) => {
                    for name in appended {
                        inner.candidates.shift_remove(&name);
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Opens a module binary at `path` via [`ModuleHandle::from_path`] and
    /// appends every export `filter` selects.
    pub fn add_modules_from_path(&self, path: &Path, filter: impl FnMut(&Export) -> bool) -> Result<()> {
        let module = Arc::new(ModuleHandle::from_path(path, self.system.temp_dir())?);
        self.add_modules_from_handle(module, filter)
    }

    /// As [`Self::add_modules_from_path`], against the current binary via
    /// a locally linked export iterator.
    pub fn add_modules_from_local(&self, iterator: ExportIteratorFn, filter: impl FnMut(&Export) -> bool) -> Result<()> {
        let module = Arc::new(ModuleHandle::from_current_binary(iterator)?);
        self.add_modules_from_handle(module, filter)
    }

    pub fn add_callback(
        &self,
        module_name: &str,
        on_success: impl FnOnce(InstanceInfo) + Send + 'static,
        on_error: impl FnOnce(&str) + Send + 'static,
        on_abort: Option<impl FnOnce() + Send + 'static>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let candidate = match inner.candidates.get_mut(module_name) {
            Some(c) => c,
            None => {
                drop(inner);
                if let Some(abort) = on_abort {
                    abort();
                }
                return Err(Error::not_found(format!("candidate `{module_name}`")));
            }
        };
        match &candidate.state {
            CandidateState::Loaded(info) => {
                let info = info.clone();
                drop(inner);
                on_success(info);
            }
            CandidateState::Error(reason) => {
                let reason = reason.clone();
                drop(inner);
                on_error(&reason);
            }
            CandidateState::Unloaded => {
                candidate.callbacks.push(CallbackSet {
                    on_success: Some(Box::new(on_success)),
                    on_error: Some(Box::new(on_error)),
                });
            }
        }
        Ok(())
    }

    fn mark_error(inner: &mut LoadingSetInner, to_fire: &mut Vec<(Vec<CallbackSet>, String)>, name: &str, reason: String) {
        if let Some(c) = inner.candidates.get_mut(name) {
            if matches!(c.state, CandidateState::Unloaded) {
                c.state = CandidateState::Error(reason.clone());
                let callbacks = std::mem::take(&mut c.callbacks);
                to_fire.push((callbacks, reason));
            }
        }
    }

    fn fail_candidate(&self, name: &str, reason: String) {
        let mut to_fire = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            Self::mark_error(&mut inner, &mut to_fire, name, reason);
        }
        fire_errors(to_fire);
    }

    fn succeed_candidate(&self, name: &str, info: InstanceInfo) {
        let callbacks = {
            let mut inner = self.inner.lock().unwrap();
            match inner.candidates.get_mut(name) {
                Some(c) => {
                    c.state = CandidateState::Loaded(info.clone());
                    std::mem::take(&mut c.callbacks)
                }
                None => Vec::new(),
            }
        };
        for cb in callbacks {
            if let Some(on_success) = cb.on_success {
                on_success(info.clone());
            }
        }
    }

    /// Builds the internal load graph from every still-`unloaded` candidate,
    /// marks unresolvable ones as errors, and spawns one load task per
    /// remaining node. Runs entirely synchronously; called from the commit
    /// future's `BuildAndSpawn` state.
    fn build_and_spawn(self: &Arc<Self>) -> Arc<CommitCounter> {
        let mut to_fire = Vec::new();
        let mut graph = DependencyGraph::new();
        let mut accepted: Vec<String> = Vec::new();

        {
            let mut inner = self.inner.lock().unwrap();
            let ordered: Vec<String> = inner
                .candidates
                .iter()
                .filter(|(_, c)| matches!(c.state, CandidateState::Unloaded))
                .map(|(n, _)| n.clone())
                .collect();

            // First pass: reject candidates that collide with an already
            // registered instance, then build export ownership (`claimed`)
            // over the *entire* batch before anything checks an import
            // against it. This mirrors the private pending-export table the
            // loading set owns for pre-validation: a candidate's imports may
            // be satisfied by any other candidate in the same commit,
            // regardless of which of the two was appended (or happens to
            // sort) first.
            let mut already_registered = std::collections::HashSet::new();
            let mut claimed: std::collections::HashMap<(String, String), String> = std::collections::HashMap::new();
            for name in &ordered {
                if self.system.find_by_name(name).is_some() {
                    already_registered.insert(name.clone());
                    continue;
                }
                let export_keys = candidate_export_keys(inner.candidates[name].export.as_ref().unwrap());
                for key in export_keys {
                    claimed.entry(key).or_insert_with(|| name.clone());
                }
            }

            // Second pass: against the now-complete `claimed` map, reject
            // already-registered candidates, candidates whose exports lost
            // a pending-export race to an earlier candidate, and candidates
            // with an unresolvable import.
            for name in &ordered {
                if already_registered.contains(name) {
                    Self::mark_error(
                        &mut inner,
                        &mut to_fire,
                        name,
                        "an instance with this name is already registered".into(),
                    );
                    continue;
                }

                let export_keys = candidate_export_keys(inner.candidates[name].export.as_ref().unwrap());
                if let Some((sym, ns)) = export_keys.iter().find(|k| claimed.get(*k).is_some_and(|owner| owner != name)) {
                    Self::mark_error(
                        &mut inner,
                        &mut to_fire,
                        name,
                        format!("symbol `{sym}` in namespace `{ns}` duplicates a pending export"),
                    );
                    continue;
                }

                let import_keys = candidate_import_keys(inner.candidates[name].export.as_ref().unwrap());
                let mut unresolved = false;
                for (sym, ns, required) in &import_keys {
                    match claimed.get(&(sym.clone(), ns.clone())) {
                        Some(owner) if owner != name => {
                            if matches!(inner.candidates[owner].state, CandidateState::Error(_)) {
                                unresolved = true;
                                break;
                            }
                        }
                        _ => {
                            if self.system.find_compatible_symbol(sym, ns, required).is_none() {
                                unresolved = true;
                                break;
                            }
                        }
                    }
                }
                if unresolved {
                    Self::mark_error(&mut inner, &mut to_fire, name, "an import could not be resolved".into());
                    continue;
                }

                graph.add_node(name);
                accepted.push(name.clone());
            }

            for name in &accepted {
                let deps: std::collections::HashSet<String> = {
                    let export = inner.candidates[name].export.as_ref().unwrap();
                    let mut deps = std::collections::HashSet::new();
                    for (sym, ns, _) in candidate_import_keys(export) {
                        if let Some(owner) = claimed.get(&(sym, ns)) {
                            if owner != name {
                                deps.insert(owner.clone());
                            }
                        }
                    }
                    for dep in export.dependency_modifiers() {
                        deps.insert(dep.to_owned());
                    }
                    deps
                };
                for dep in deps {
                    if accepted.contains(&dep) {
                        graph.add_edge(name, &dep);
                    }
                }
            }

            if graph.is_cyclic() {
                let cyclic: Vec<String> = accepted
                    .iter()
                    .filter(|name| {
                        graph
                            .neighbors(name, petgraph::Direction::Outgoing)
                            .iter()
                            .any(|dep| graph.path_exists(dep, name))
                    })
                    .cloned()
                    .collect();
                for name in &cyclic {
                    Self::mark_error(&mut inner, &mut to_fire, name, "participates in a dependency cycle".into());
                    graph.remove_node(name);
                }
                accepted.retain(|n| !cyclic.contains(n));
            }
        }

        fire_errors(to_fire);

        let counter = Arc::new(CommitCounter {
            remaining: Mutex::new(accepted.len()),
            waker: Mutex::new(None),
        });

        if accepted.is_empty() {
            return counter;
        }

        let graph = Arc::new(graph);
        for name in accepted {
            let task = LoadTask::new(self.clone(), self.system.clone(), graph.clone(), name, counter.clone());
            self.event_loop.spawn(async move {
                Fsm::new(task).await;
            });
        }

        counter
    }

    /// Marks every candidate that is still `unloaded` after the load graph
    /// has fully drained (e.g. never spawned due to an earlier failure) as
    /// an error, firing its callbacks.
    fn finalize_stragglers(&self) {
        let mut to_fire = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            let names: Vec<String> = inner
                .candidates
                .iter()
                .filter(|(_, c)| matches!(c.state, CandidateState::Unloaded))
                .map(|(n, _)| n.clone())
                .collect();
            for name in names {
                log::warn!("candidate `{name}` was never part of a resolvable load graph");
                Self::mark_error(&mut inner, &mut to_fire, &name, "candidate was not part of the load graph".into());
            }
        }
        fire_errors(to_fire);
    }

    /// Commits the set. Returns an enqueued future: multiple concurrent
    /// commits (on this set or any other sharing the same `System`) are
    /// serialized through [`crate::system::System`]'s own state.
    pub fn commit(self: &Arc<Self>) -> EnqueuedFuture<Result<()>> {
        let fsm = CommitFsm {
            system: self.system.clone(),
            set: self.clone(),
            phase: CommitPhase::Serialize,
        };
        self.event_loop.enqueue(Fsm::new(fsm))
    }
}

fn fire_errors(to_fire: Vec<(Vec<CallbackSet>, String)>) {
    for (callbacks, reason) in to_fire {
        for cb in callbacks {
            if let Some(on_error) = cb.on_error {
                on_error(&reason);
            }
        }
    }
}

struct CommitCounter {
    remaining: Mutex<usize>,
    waker: Mutex<Option<Waker>>,
}

enum CommitPhase {
    Serialize,
    BuildAndSpawn,
    Drain(Arc<CommitCounter>),
}

struct CommitFsm {
    system: Arc<System>,
    set: Arc<LoadingSet>,
    phase: CommitPhase,
}

impl FsmFuture for CommitFsm {
    type Output = Result<()>;

    fn poll_step(&mut self, cx: &mut Context<'_>) -> Step<Result<()>> {
        match &self.phase {
            CommitPhase::Serialize => {
                if self.system.try_begin_loading(cx.waker()) {
                    self.phase = CommitPhase::BuildAndSpawn;
                    Step::Continue
                } else {
                    Step::Pending
                }
            }
            CommitPhase::BuildAndSpawn => {
                let counter = self.set.build_and_spawn();
                self.phase = CommitPhase::Drain(counter);
                Step::Continue
            }
            CommitPhase::Drain(counter) => {
                *counter.waker.lock().unwrap() = Some(cx.waker().clone());
                let remaining = *counter.remaining.lock().unwrap();
                if remaining == 0 {
                    self.set.finalize_stragglers();
                    self.system.end_loading();
                    Step::Ready(Ok(()))
                } else {
                    Step::Pending
                }
            }
        }
    }
}

enum LoadStep {
    WaitDeps,
    Construct,
    Start,
    Register,
    SignalWaiters,
}

/// One finite-state-machine future per candidate in a committing load graph.
struct LoadTask {
    set: Arc<LoadingSet>,
    system: Arc<System>,
    graph: Arc<DependencyGraph>,
    name: String,
    counter: Arc<CommitCounter>,
    step: LoadStep,
    built: Option<Arc<InstanceHandle>>,
}

impl LoadTask {
    fn new(set: Arc<LoadingSet>, system: Arc<System>, graph: Arc<DependencyGraph>, name: String, counter: Arc<CommitCounter>) -> Self {
        Self {
            set,
            system,
            graph,
            name,
            counter,
            step: LoadStep::WaitDeps,
            built: None,
        }
    }

    fn poll_wait_deps(&mut self, cx: &mut Context<'_>) -> Step<()> {
        let deps = self.graph.neighbors(&self.name, petgraph::Direction::Outgoing);
        for dep in &deps {
            let kind = {
                let inner = self.set.inner.lock().unwrap();
                inner.candidates.get(dep).map(candidate_state_kind)
            };
            match kind {
                None | Some(CandidateStateKind::Error) => {
                    self.set.fail_candidate(&self.name, format!("dependency `{dep}` failed to load"));
                    self.step = LoadStep::SignalWaiters;
                    return Step::Continue;
                }
                Some(CandidateStateKind::Unloaded) => {
                    let mut inner = self.set.inner.lock().unwrap();
                    if let Some(c) = inner.candidates.get_mut(dep) {
                        c.waiters.push(cx.waker().clone());
                    }
                    return Step::Pending;
                }
                Some(CandidateStateKind::Loaded) => {}
            }
        }
        self.step = LoadStep::Construct;
        Step::Continue
    }

    fn construct_instance(&self, export: Export) -> Result<Arc<InstanceHandle>> {
        let (module, directory) = {
            let inner = self.set.inner.lock().unwrap();
            let c = &inner.candidates[&self.name];
            (c.module.clone(), c.directory.clone())
        };

        let Export {
            name,
            description,
            author,
            license,
            parameters,
            resources,
            namespace_imports,
            symbol_imports,
            static_exports,
            dynamic_exports,
            modifiers,
            ..
        } = export;

        let mut start_event = None;
        let mut stop_event = None;
        let mut instance_state_ctor = None;
        let mut destructor = None;
        let mut explicit_deps = Vec::new();
        for modifier in modifiers {
            match modifier {
                Modifier::Dependency(dep) => explicit_deps.push(dep),
                Modifier::DebugInfo(_) => {}
                Modifier::InstanceState(f) => instance_state_ctor = Some(f),
                Modifier::StartEvent(f) => start_event = Some(f),
                Modifier::StopEvent(f) => stop_event = Some(f),
                Modifier::Destructor(f) => destructor = Some(f),
            }
        }

        // Instance-state construction runs with no lock held anywhere in
        // this crate: construction happens entirely on the event loop
        // thread, before the handle is shared with anyone.
        let _instance_state_preview = match &instance_state_ctor {
            Some(ctor) => Some(ctor()?),
            None => None,
        };

        let mut builder = InstanceHandleBuilder::new_regular(name.clone())
            .with_metadata(description, author, license)
            .with_hooks(LifecycleHooks {
                start_event,
                stop_event,
                instance_state_ctor,
                destructor,
            });

        if let (Some(module), Some(dir)) = (module, directory.clone()) {
            builder = builder.with_module(module, dir);
        }

        for decl in parameters {
            let callbacks = ParameterCallbacks {
                getter: decl
                    .getter
                    .map(|f| Box::new(move |v: ParameterValue| f(v)) as Box<dyn Fn(ParameterValue) -> ParameterValue + Send + Sync>),
                setter: decl
                    .setter
                    .map(|f| Box::new(move |v: ParameterValue| f(v)) as Box<dyn Fn(ParameterValue) -> ParameterValue + Send + Sync>),
            };
            let cell = ParameterCell::new(decl.name, name.clone(), decl.default, decl.read_group, decl.write_group, callbacks);
            builder.add_parameter(cell);
        }

        for res in resources {
            let path = match &directory {
                Some(dir) => dir.join(&res.relative_path),
                None => res.relative_path,
            };
            builder.add_resource(res.name, path);
        }

        for ns in namespace_imports {
            builder.add_namespace_include(ns, DependencyKind::Static);
        }

        let mut imported = Vec::new();
        for imp in symbol_imports {
            let owner = self
                .system
                .find_by_symbol(&imp.name, &imp.namespace, &imp.version)
                .ok_or_else(|| Error::not_found(format!("symbol `{}` in namespace `{}`", imp.name, imp.namespace)))?;
            let pointer = owner
                .handle()
                .exported_pointer(&imp.name, &imp.namespace)
                .ok_or_else(|| Error::not_found(format!("symbol `{}` in namespace `{}`", imp.name, imp.namespace)))?;
            builder.add_dependency(owner.handle().clone(), DependencyKind::Static);
            imported.push(ImportedSymbolRecord {
                name: imp.name,
                namespace: imp.namespace,
                owner: owner.name().to_owned(),
                pointer,
            });
        }
        for record in imported {
            builder.add_import(record);
        }

        for dep_name in explicit_deps {
            if let Some(dep) = self.system.find_by_name(&dep_name) {
                builder.add_dependency(dep.handle().clone(), DependencyKind::Static);
            }
        }

        for exp in static_exports {
            builder.add_export(ExportedSymbolRecord {
                name: exp.name,
                namespace: exp.namespace,
                version: exp.version,
                pointer: exp.pointer,
                destructor: None,
            });
        }

        // Dynamic exports are constructed one by one; on a later failure,
        // every already-produced export is torn down in reverse
        // (last-constructed-first) so no partially exported instance is
        // ever registered.
        let mut produced: Vec<ExportedSymbolRecord> = Vec::new();
        for exp in dynamic_exports {
            match (exp.constructor)() {
                Ok(pointer) => produced.push(ExportedSymbolRecord {
                    name: exp.name,
                    namespace: exp.namespace,
                    version: exp.version,
                    pointer,
                    destructor: exp.destructor,
                }),
                Err(e) => {
                    for record in produced.into_iter().rev() {
                        if let Some(destructor) = record.destructor {
                            destructor(record.pointer);
                        }
                    }
                    return Err(e);
                }
            }
        }
        for record in produced {
            builder.add_export(record);
        }

        builder.build()
    }

    fn poll_construct(&mut self) -> Step<()> {
        let export = {
            let mut inner = self.set.inner.lock().unwrap();
            inner.candidates.get_mut(&self.name).and_then(|c| c.export.take())
        };
        let Some(export) = export else {
            self.set
                .fail_candidate(&self.name, "candidate export missing at construction time".into());
            self.step = LoadStep::SignalWaiters;
            return Step::Continue;
        };
        match self.construct_instance(export) {
            Ok(handle) => {
                self.built = Some(handle);
                self.step = LoadStep::Start;
                Step::Continue
            }
            Err(e) => {
                self.set.fail_candidate(&self.name, e.to_string());
                self.step = LoadStep::SignalWaiters;
                Step::Continue
            }
        }
    }

    fn poll_start(&mut self) -> Step<()> {
        let handle = self.built.as_ref().expect("construct runs before start").clone();
        handle.enter_init();
        match handle.start() {
            Ok(()) => {
                self.step = LoadStep::Register;
                Step::Continue
            }
            Err(e) => {
                let _ = handle.detach();
                self.built = None;
                self.set.fail_candidate(&self.name, e.to_string());
                self.step = LoadStep::SignalWaiters;
                Step::Continue
            }
        }
    }

    fn poll_register(&mut self) -> Step<()> {
        let handle = self.built.take().expect("construct runs before register");
        match self.system.add_instance(handle.clone()) {
            Ok(()) => self.set.succeed_candidate(&self.name, InstanceInfo::new(handle)),
            Err(e) => {
                let _ = handle.stop();
                let _ = handle.detach();
                self.set.fail_candidate(&self.name, e.to_string());
            }
        }
        self.step = LoadStep::SignalWaiters;
        Step::Continue
    }

    fn poll_signal(&mut self) -> Step<()> {
        let waiters = {
            let mut inner = self.set.inner.lock().unwrap();
            inner
                .candidates
                .get_mut(&self.name)
                .map(|c| std::mem::take(&mut c.waiters))
                .unwrap_or_default()
        };
        for waker in waiters {
            waker.wake();
        }

        let mut remaining = self.counter.remaining.lock().unwrap();
        *remaining -= 1;
        if *remaining == 0 {
            drop(remaining);
            if let Some(waker) = self.counter.waker.lock().unwrap().take() {
                waker.wake();
            }
        }
        Step::Ready(())
    }
}

impl FsmFuture for LoadTask {
    type Output = ();

    fn poll_step(&mut self, cx: &mut Context<'_>) -> Step<()> {
        match self.step {
            LoadStep::WaitDeps => self.poll_wait_deps(cx),
            LoadStep::Construct => self.poll_construct(),
            LoadStep::Start => self.poll_start(),
            LoadStep::Register => self.poll_register(),
            LoadStep::SignalWaiters => self.poll_signal(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::instance::parameter::ParameterAccessGroup;
    use crate::module::export::{Modifier, StaticSymbolExport, SymbolImport};
    use std::sync::atomic::AtomicBool;

    fn set() -> (Arc<System>, Arc<EventLoop>, Arc<LoadingSet>) {
        let system = Arc::new(System::new(&Config::new()).unwrap());
        let event_loop = Arc::new(EventLoop::new());
        let set = LoadingSet::new(system.clone(), event_loop.clone(), Version::new(1, 0, 0));
        (system, event_loop, set)
    }

    fn simple_export(name: &str) -> Export {
        Export::new(name, Version::new(1, 0, 0))
    }

    #[test]
    fn query_module_reflects_appended_candidates() {
        let (_system, _loop_, set) = set();
        assert!(!set.query_module("a"));
        set.add_modules_from_local(fimo_test_export_iterator_empty, |_| true).unwrap();
        assert!(!set.query_module("a"));
    }

    unsafe fn fimo_test_export_iterator_empty(_consumer: &mut dyn FnMut(Export) -> bool) {}

    #[test]
    fn commit_with_no_candidates_resolves_immediately() {
        let (_system, event_loop, set) = set();
        let fut = set.commit();
        let result = fut.wait();
        assert!(result.is_ok());
        drop(event_loop);
    }

    #[test]
    fn single_module_commit_registers_an_instance() {
        let (system, event_loop, set) = set();

        unsafe fn iterator(consumer: &mut dyn FnMut(Export) -> bool) {
            let mut export = Export::new("leaf", Version::new(1, 0, 0));
            export.static_exports.push(StaticSymbolExport {
                name: "value".into(),
                namespace: String::new(),
                version: Version::new(1, 0, 0),
                pointer: Arc::new(42u32),
            });
            consumer(export);
        }

        set.add_modules_from_local(iterator, |_| true).unwrap();
        assert!(set.query_module("leaf"));

        let done = Arc::new(AtomicBool::new(false));
        let done2 = done.clone();
        set.add_callback(
            "leaf",
            move |_info| done2.store(true, Ordering::SeqCst),
            |reason| panic!("unexpected error: {reason}"),
            None::<fn()>,
        )
        .unwrap();

        let result = set.commit().wait();
        assert!(result.is_ok());
        assert!(done.load(Ordering::SeqCst));
        assert!(system.find_by_name("leaf").is_some());
        drop(event_loop);
    }

    #[test]
    fn duplicate_instance_name_is_reported_as_an_error_not_a_panic() {
        let (system, event_loop, set) = set();
        let existing = InstanceHandleBuilder::new_pseudo("dup").build().unwrap();
        system.add_instance(existing).unwrap();

        unsafe fn iterator(consumer: &mut dyn FnMut(Export) -> bool) {
            consumer(Export::new("dup", Version::new(1, 0, 0)));
        }
        set.add_modules_from_local(iterator, |_| true).unwrap();

        let errored = Arc::new(AtomicBool::new(false));
        let errored2 = errored.clone();
        set.add_callback(
            "dup",
            |_| panic!("should not succeed"),
            move |_reason| errored2.store(true, Ordering::SeqCst),
            None::<fn()>,
        )
        .unwrap();

        set.commit().wait().unwrap();
        assert!(errored.load(Ordering::SeqCst));
        drop(event_loop);
    }

    #[test]
    fn context_version_mismatch_is_rejected_on_append() {
        let (_system, _loop_, set) = set();
        let export = Export::new("a", Version::new(2, 0, 0));
        let err = set.validate_candidate(&export).unwrap_err();
        assert!(err.contains("context version"));
    }

    #[test]
    fn modifier_dependency_resolves_against_already_registered_instance() {
        let (system, event_loop, set) = set();
        let base = InstanceHandleBuilder::new_pseudo("base").build().unwrap();
        system.add_instance(base).unwrap();

        unsafe fn iterator(consumer: &mut dyn FnMut(Export) -> bool) {
            let mut export = Export::new("dependent", Version::new(1, 0, 0));
            export.modifiers.push(Modifier::Dependency("base".into()));
            consumer(export);
        }
        set.add_modules_from_local(iterator, |_| true).unwrap();

        let loaded = Arc::new(AtomicBool::new(false));
        let loaded2 = loaded.clone();
        set.add_callback(
            "dependent",
            move |_| loaded2.store(true, Ordering::SeqCst),
            |reason| panic!("unexpected error: {reason}"),
            None::<fn()>,
        )
        .unwrap();

        set.commit().wait().unwrap();
        assert!(loaded.load(Ordering::SeqCst));
        drop(event_loop);
    }

    #[test]
    fn candidate_with_no_imports_and_no_exports_still_loads() {
        let (system, event_loop, set) = set();

        unsafe fn iterator(consumer: &mut dyn FnMut(Export) -> bool) {
            consumer(Export::new("bare", Version::new(1, 0, 0)));
        }
        set.add_modules_from_local(iterator, |_| true).unwrap();

        let before_namespaces = system.namespace_names().len();
        set.commit().wait().unwrap();

        assert!(system.find_by_name("bare").is_some());
        assert_eq!(system.namespace_names().len(), before_namespaces);
        drop(event_loop);
    }

    #[test]
    fn importer_appended_before_its_same_batch_exporter_still_resolves() {
        let (system, event_loop, set) = set();

        unsafe fn iterator(consumer: &mut dyn FnMut(Export) -> bool) {
            let mut importer = Export::new("importer", Version::new(1, 0, 0));
            importer.symbol_imports.push(SymbolImport {
                name: "s".into(),
                namespace: String::new(),
                version: Version::new(1, 0, 0),
            });
            consumer(importer);

            let mut exporter = Export::new("exporter", Version::new(1, 0, 0));
            exporter.static_exports.push(StaticSymbolExport {
                name: "s".into(),
                namespace: String::new(),
                version: Version::new(1, 0, 0),
                pointer: Arc::new(7u32),
            });
            consumer(exporter);
        }
        set.add_modules_from_local(iterator, |_| true).unwrap();

        let importer_ok = Arc::new(AtomicBool::new(false));
        let importer_ok2 = importer_ok.clone();
        set.add_callback(
            "importer",
            move |_| importer_ok2.store(true, Ordering::SeqCst),
            |reason| panic!("unexpected error: {reason}"),
            None::<fn()>,
        )
        .unwrap();

        let exporter_ok = Arc::new(AtomicBool::new(false));
        let exporter_ok2 = exporter_ok.clone();
        set.add_callback(
            "exporter",
            move |_| exporter_ok2.store(true, Ordering::SeqCst),
            |reason| panic!("unexpected error: {reason}"),
            None::<fn()>,
        )
        .unwrap();

        set.commit().wait().unwrap();
        assert!(importer_ok.load(Ordering::SeqCst));
        assert!(exporter_ok.load(Ordering::SeqCst));
        assert!(system.find_by_name("importer").is_some());
        assert!(system.find_by_name("exporter").is_some());
        drop(event_loop);
    }

    #[allow(dead_code)]
    fn silence_unused_access_group_import(_: ParameterAccessGroup) {}
}
