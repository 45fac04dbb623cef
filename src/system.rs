//! System (C6): the registry core. Owns the subsystem-wide namespace and
//! symbol registries, the instance table, the persistent dependency graph,
//! the commit-serialization state machine, and the subsystem's private
//! temporary directory.
//!
//! Lock order: System → Loading Set → Instance Handle. Every public
//! method here takes the System's own lock for the duration of its table
//! mutation and releases it before returning; none of them call back into
//! an `InstanceHandle` method that itself takes a third lock while holding
//! this one, other than the plain atomic counter reads used for read-only
//! checks (`strong_count`, `is_loaded`), which matches the ordering rule.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::graph::DependencyGraph;
use crate::instance::handle::{DependencyKind, InstanceHandle, InstanceInfo};
use crate::registry::{NamespaceRegistry, SymbolRegistry};
use crate::version::Version;
use indexmap::IndexMap;
use petgraph::Direction;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::task::Waker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubsystemState {
    Idle,
    LoadingSet,
}

struct Inner {
    namespaces: NamespaceRegistry,
    symbols: SymbolRegistry,
    instances: IndexMap<String, Arc<InstanceHandle>>,
    graph: DependencyGraph,
    state: SubsystemState,
    commit_waiters: std::collections::VecDeque<Waker>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            namespaces: NamespaceRegistry::new(),
            symbols: SymbolRegistry::new(),
            instances: IndexMap::new(),
            graph: DependencyGraph::new(),
            state: SubsystemState::Idle,
            commit_waiters: std::collections::VecDeque::new(),
        }
    }
}

pub struct System {
    inner: Mutex<Inner>,
    temp_dir: tempfile::TempDir,
}

impl System {
    pub fn new(config: &Config) -> Result<Self> {
        let temp_dir = match config.temp_dir_root() {
            Some(root) => tempfile::Builder::new().prefix("fimo_modules_").tempdir_in(root)?,
            None => tempfile::Builder::new().prefix("fimo_modules_").tempdir()?,
        };
        log::debug!("module subsystem temp directory: {}", temp_dir.path().display());
        Ok(Self {
            inner: Mutex::new(Inner::default()),
            temp_dir,
        })
    }

    pub fn temp_dir(&self) -> &Path {
        self.temp_dir.path()
    }

    // ---- lookups -------------------------------------------------------

    pub fn find_by_name(&self, name: &str) -> Option<InstanceInfo> {
        let st = self.inner.lock().unwrap();
        st.instances.get(name).cloned().map(InstanceInfo::new)
    }

    pub fn find_by_symbol(&self, name: &str, namespace: &str, required: &Version) -> Option<InstanceInfo> {
        let st = self.inner.lock().unwrap();
        let entry = st.symbols.lookup_compatible(name, namespace, required)?;
        st.instances.get(&entry.owner).cloned().map(InstanceInfo::new)
    }

    pub fn find_compatible_symbol(&self, name: &str, namespace: &str, required: &Version) -> Option<(String, Version)> {
        let st = self.inner.lock().unwrap();
        st.symbols
            .lookup_compatible(name, namespace, required)
            .map(|e| (e.owner.clone(), e.version.clone()))
    }

    pub fn namespace_exists(&self, namespace: &str) -> bool {
        self.inner.lock().unwrap().namespaces.exists(namespace)
    }

    pub fn instance_names(&self) -> Vec<String> {
        self.inner.lock().unwrap().instances.keys().cloned().collect()
    }

    pub fn namespace_names(&self) -> Vec<String> {
        self.inner.lock().unwrap().namespaces.names().map(str::to_owned).collect()
    }

    pub fn len_instances(&self) -> usize {
        self.inner.lock().unwrap().instances.len()
    }

    // ---- mutation --------------------------------------------------------

    /// Transactional registration of a fully constructed instance. Failure
    /// leaves every table exactly as it was.
    pub fn add_instance(&self, handle: Arc<InstanceHandle>) -> Result<()> {
        let name = handle.name().to_owned();
        let mut st = self.inner.lock().unwrap();

        if st.instances.contains_key(&name) {
            return Err(Error::duplicate(format!("instance `{name}`")));
        }

        let exported = handle.exported_symbols();
        for (sym, ns, _) in &exported {
            if st.symbols.contains(sym, ns) {
                return Err(Error::duplicate(format!("symbol `{sym}` in namespace `{ns}`")));
            }
        }

        let imported_namespaces = handle.included_namespaces();
        for ns in &imported_namespaces {
            if !st.namespaces.exists(ns) {
                return Err(Error::not_found(format!(
                    "namespace `{ns}` imported by `{name}` is not exported by any loaded instance"
                )));
            }
        }

        let mut refed = Vec::new();
        for ns in &imported_namespaces {
            if let Err(e) = st.namespaces.add_reference(ns) {
                for done in &refed {
                    st.namespaces.remove_reference(done);
                }
                return Err(e);
            }
            refed.push(ns.clone());
        }

        st.graph.add_node(&name);
        for dep in handle.dependency_names() {
            st.graph.add_edge(&name, &dep);
        }

        if st.graph.is_cyclic() {
            st.graph.remove_node(&name);
            for ns in &refed {
                st.namespaces.remove_reference(ns);
            }
            return Err(Error::cyclic_dependency(format!(
                "loading `{name}` would introduce a dependency cycle"
            )));
        }

        for (sym, ns, ver) in &exported {
            st.namespaces.note_symbol_added(ns);
            st.symbols
                .insert(sym, ns, ver.clone(), &name)
                .expect("duplicate-export check already ran above");
        }

        log::debug!("registered instance `{name}` ({} exports)", exported.len());
        st.instances.insert(name, handle);
        Ok(())
    }

    /// Removes an instance from the registry. Precondition: `strong_count
    /// == 0` and no remaining incoming dependency edges.
    pub fn remove_instance(&self, name: &str) -> Result<Arc<InstanceHandle>> {
        let mut st = self.inner.lock().unwrap();
        let handle = st
            .instances
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("instance `{name}`")))?;

        if handle.strong_count() != 0 {
            return Err(Error::not_permitted(format!(
                "instance `{name}` still has outstanding strong references"
            )));
        }
        if st.graph.incoming_count(name) != 0 {
            return Err(Error::not_permitted(format!(
                "instance `{name}` still has dependents in the dependency graph"
            )));
        }

        let exported = handle.exported_symbols();
        let imported_namespaces = handle.included_namespaces();

        for (sym, ns, _) in &exported {
            st.symbols.remove(sym, ns);
            st.namespaces.note_symbol_removed(ns);
        }
        for ns in &imported_namespaces {
            st.namespaces.remove_reference(ns);
        }

        for (_, ns, _) in &exported {
            if let Some(entry) = st.namespaces.entry(ns) {
                if entry.num_symbols == 0 && entry.num_references > 0 {
                    for (sym, ns2, ver) in &exported {
                        st.namespaces.note_symbol_added(ns2);
                        let _ = st.symbols.insert(sym, ns2, ver.clone(), name);
                    }
                    for ns2 in &imported_namespaces {
                        let _ = st.namespaces.add_reference(ns2);
                    }
                    return Err(Error::not_permitted(format!("namespace `{ns}` is still in use")));
                }
            }
        }

        st.graph.remove_node(name);
        st.instances.shift_remove(name);
        log::debug!("removed instance `{name}` from the registry");
        Ok(handle)
    }

    /// Removes the instance from every table, then tears down its own
    /// internal state. Used by `prune` and by the public unload entry
    /// point on `Context`.
    pub fn unload(&self, name: &str) -> Result<()> {
        let handle = self.remove_instance(name)?;
        handle.detach()
    }

    /// Establishes a dynamic dependency edge between two already-loaded
    /// instances.
    pub fn link_instances(&self, a: &str, b: &str) -> Result<()> {
        let st = self.inner.lock().unwrap();
        let handle_a = st
            .instances
            .get(a)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("instance `{a}`")))?;
        let handle_b = st
            .instances
            .get(b)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("instance `{b}`")))?;

        if !handle_a.is_loaded() || !handle_b.is_loaded() {
            return Err(Error::detached(format!("`{a}` or `{b}`")));
        }
        if handle_b.kind() == crate::instance::handle::InstanceKind::Pseudo {
            return Err(Error::not_permitted(format!(
                "`{b}` is a pseudo instance and cannot be depended upon"
            )));
        }
        if handle_a.query_dependency(b).is_some() {
            return Err(Error::duplicate(format!("`{a}` already depends on `{b}`")));
        }
        if st.graph.path_exists(b, a) {
            return Err(Error::cyclic_dependency(format!(
                "linking `{a}` -> `{b}` would introduce a dependency cycle"
            )));
        }

        drop(st);
        let mut st = self.inner.lock().unwrap();
        st.graph.add_edge(a, b);
        drop(st);
        handle_a.add_dependency_handle(handle_b, DependencyKind::Dynamic)
    }

    /// Removes a previously established dynamic dependency edge.
    pub fn unlink_instances(&self, a: &str, b: &str) -> Result<()> {
        let handle_a = {
            let st = self.inner.lock().unwrap();
            st.instances
                .get(a)
                .cloned()
                .ok_or_else(|| Error::not_found(format!("instance `{a}`")))?
        };
        handle_a.remove_dependency(b)?;
        let mut st = self.inner.lock().unwrap();
        st.graph.remove_edge(a, b);
        Ok(())
    }

    /// Unloads every externally-reachable (zero incoming edges),
    /// zero-strong-count, regular instance; restarts after each removal, as
    /// mutating the graph invalidates the externals set.
    pub fn prune(&self) {
        loop {
            let victim = {
                let st = self.inner.lock().unwrap();
                st.graph
                    .externals(Direction::Incoming)
                    .into_iter()
                    .find(|name| {
                        st.instances.get(name).is_some_and(|h| {
                            h.kind() == crate::instance::handle::InstanceKind::Regular && h.strong_count() == 0
                        })
                    })
            };
            match victim {
                Some(name) => match self.unload(&name) {
                    Ok(()) => continue,
                    Err(e) => {
                        log::warn!("prune: failed to unload `{name}`: {e}");
                        break;
                    }
                },
                None => break,
            }
        }
    }

    // ---- commit serialization (used by the loading set's commit FSM) ---

    pub(crate) fn try_begin_loading(&self, waker: &Waker) -> bool {
        let mut st = self.inner.lock().unwrap();
        match st.state {
            SubsystemState::Idle => {
                st.state = SubsystemState::LoadingSet;
                true
            }
            SubsystemState::LoadingSet => {
                st.commit_waiters.push_back(waker.clone());
                false
            }
        }
    }

    pub(crate) fn end_loading(&self) {
        let next = {
            let mut st = self.inner.lock().unwrap();
            st.state = SubsystemState::Idle;
            st.commit_waiters.pop_front()
        };
        if let Some(waker) = next {
            waker.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::handle::InstanceHandleBuilder;

    fn system() -> System {
        System::new(&Config::new()).unwrap()
    }

    fn pseudo(name: &str) -> Arc<InstanceHandle> {
        InstanceHandleBuilder::new_pseudo(name).build().unwrap()
    }

    #[test]
    fn add_then_remove_restores_tables() {
        let sys = system();
        let a = pseudo("a");
        sys.add_instance(a).unwrap();
        assert_eq!(sys.len_instances(), 1);
        sys.remove_instance("a").unwrap();
        assert_eq!(sys.len_instances(), 0);
    }

    #[test]
    fn duplicate_instance_name_rejected() {
        let sys = system();
        sys.add_instance(pseudo("a")).unwrap();
        let err = sys.add_instance(pseudo("a")).unwrap_err();
        assert!(matches!(err, Error::Duplicate(_)));
    }

    #[test]
    fn link_then_unlink_restores_graph() {
        let sys = system();
        sys.add_instance(pseudo("a")).unwrap();
        sys.add_instance(pseudo("b")).unwrap();
        sys.link_instances("a", "b").unwrap();
        assert_eq!(sys.find_by_name("a").unwrap().handle().query_dependency("b"), Some(DependencyKind::Dynamic));
        sys.unlink_instances("a", "b").unwrap();
        assert!(sys.find_by_name("a").unwrap().handle().query_dependency("b").is_none());
    }

    #[test]
    fn link_rejects_cycle() {
        let sys = system();
        sys.add_instance(pseudo("a")).unwrap();
        sys.add_instance(pseudo("b")).unwrap();
        sys.link_instances("a", "b").unwrap();
        let err = sys.link_instances("b", "a").unwrap_err();
        assert!(matches!(err, Error::CyclicDependency(_)));
    }

    #[test]
    fn remove_instance_requires_zero_strong_count() {
        let sys = system();
        let a = pseudo("a");
        a.try_acquire_strong().unwrap();
        sys.add_instance(a.clone()).unwrap();
        assert!(matches!(sys.remove_instance("a").unwrap_err(), Error::NotPermitted(_)));
        a.release_strong();
        sys.remove_instance("a").unwrap();
    }

    #[test]
    fn remove_instance_refuses_while_a_dependent_remains() {
        let sys = system();
        sys.add_instance(pseudo("a")).unwrap();
        sys.add_instance(pseudo("b")).unwrap();
        sys.link_instances("a", "b").unwrap();
        assert!(matches!(sys.remove_instance("b").unwrap_err(), Error::NotPermitted(_)));
        sys.unlink_instances("a", "b").unwrap();
        sys.remove_instance("b").unwrap();
    }

    #[test]
    fn prune_is_idempotent() {
        let sys = system();
        sys.add_instance(pseudo("a")).unwrap();
        sys.prune();
        assert_eq!(sys.len_instances(), 0);
        sys.prune();
        assert_eq!(sys.len_instances(), 0);
    }

    #[test]
    fn commit_serialization_is_mutually_exclusive() {
        let sys = system();
        let waker = futures_test_waker();
        assert!(sys.try_begin_loading(&waker));
        assert!(!sys.try_begin_loading(&waker));
        sys.end_loading();
        assert!(sys.try_begin_loading(&waker));
    }

    fn futures_test_waker() -> Waker {
        use std::sync::Arc as StdArc;
        use std::task::Wake;
        struct NoopWake;
        impl Wake for NoopWake {
            fn wake(self: StdArc<Self>) {}
        }
        Waker::from(StdArc::new(NoopWake))
    }
}
