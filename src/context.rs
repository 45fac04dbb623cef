//! Context root: the embedding host's single entry point into the module
//! subsystem.
//!
//! Owns the [`System`] and the [`EventLoop`] that drives every commit and
//! load task, exposing the public surface as plain inherent methods rather
//! than a vtable of function pointers over `void*` data: this crate never
//! crosses an FFI boundary, so a concrete struct is all a host needs.

use std::sync::Arc;

use crate::config::Config;
use crate::error::Result;
use crate::instance::handle::{InstanceHandleBuilder, InstanceInfo};
use crate::instance::parameter::ParameterValue;
use crate::loading_set::LoadingSet;
use crate::rt::EventLoop;
use crate::system::System;
use crate::version::Version;

/// The version of the running context. Every candidate appended to a
/// [`LoadingSet`] declares the context version it was compiled against,
/// checked on append against this constant via
/// [`Version::is_compatible_with`].
pub const CONTEXT_VERSION: Version = Version::new(0, 1, 0);

/// The host's handle onto one running module subsystem.
///
/// A process may run more than one `Context` side by side (each with its
/// own registries, event loop and temp directory); nothing here is global
/// state beyond what each `Context` owns itself.
pub struct Context {
    system: Arc<System>,
    event_loop: Arc<EventLoop>,
    context_version: Version,
}

impl Context {
    /// Brings up a fresh subsystem: allocates the private temp directory and
    /// starts the background event loop thread that will drive every future
    /// commit.
    pub fn new(config: Config) -> Result<Arc<Self>> {
        let system = Arc::new(System::new(&config)?);
        let event_loop = Arc::new(EventLoop::new());
        Ok(Arc::new(Self {
            system,
            event_loop,
            context_version: CONTEXT_VERSION,
        }))
    }

    pub fn context_version(&self) -> &Version {
        &self.context_version
    }

    /// Creates and immediately registers a pseudo instance: one with no
    /// export manifest, typically used once near startup so the host
    /// process itself can be a [`Context::link_instances`] target before
    /// any real module is loaded.
    pub fn new_pseudo_instance(&self, name: impl Into<String>) -> Result<InstanceInfo> {
        let handle = InstanceHandleBuilder::new_pseudo(name).build()?;
        self.system.add_instance(handle.clone())?;
        Ok(InstanceInfo::new(handle))
    }

    /// Opens a fresh [`LoadingSet`] against this context's registries and
    /// event loop.
    pub fn new_loading_set(self: &Arc<Self>) -> Arc<LoadingSet> {
        LoadingSet::new(self.system.clone(), self.event_loop.clone(), self.context_version.clone())
    }

    pub fn find_by_name(&self, name: &str) -> Option<InstanceInfo> {
        self.system.find_by_name(name)
    }

    pub fn find_by_symbol(&self, name: &str, namespace: &str, required: &Version) -> Option<InstanceInfo> {
        self.system.find_by_symbol(name, namespace, required)
    }

    pub fn namespace_exists(&self, namespace: &str) -> bool {
        self.system.namespace_exists(namespace)
    }

    /// Establishes a dynamic dependency edge between two already-loaded
    /// instances. See [`Context::unlink_instances`] to remove it again.
    pub fn link_instances(&self, depender: &str, dependency: &str) -> Result<()> {
        self.system.link_instances(depender, dependency)
    }

    pub fn unlink_instances(&self, depender: &str, dependency: &str) -> Result<()> {
        self.system.unlink_instances(depender, dependency)
    }

    /// Unloads a single instance: removes it from every global table and
    /// runs its own teardown. Precondition (enforced by [`System`]):
    /// `strong_count == 0`.
    pub fn unload(&self, name: &str) -> Result<()> {
        self.system.unload(name)
    }

    /// Unloads every externally-reachable, zero-strong-count regular
    /// instance, restarting after each removal.
    pub fn prune(&self) {
        self.system.prune()
    }

    /// Read-only diagnostic listing of every currently loaded instance name.
    pub fn instances(&self) -> Vec<String> {
        self.system.instance_names()
    }

    /// Read-only diagnostic listing of every namespace with at least one
    /// live export or import reference.
    pub fn namespaces(&self) -> Vec<String> {
        self.system.namespace_names()
    }

    /// Looks up a parameter's declared type. Unlike
    /// [`Context::read_parameter`] / [`Context::write_parameter`], querying
    /// carries no access-group check: it only requires that `instance` is
    /// loaded and `parameter` exists on it.
    pub fn query_parameter(&self, instance: &str, parameter: &str) -> Result<crate::instance::parameter::ParameterType> {
        let info = self
            .system
            .find_by_name(instance)
            .ok_or_else(|| crate::error::Error::not_found(format!("instance `{instance}`")))?;
        info.handle().query_parameter_type(parameter)
    }

    /// Public (unauthenticated) parameter read: fails with
    /// [`crate::error::Error::NotFound`] if `instance` is not loaded, or
    /// with [`crate::error::Error::NotPermitted`] if the parameter's read
    /// access group is not `Public`.
    pub fn read_parameter(&self, instance: &str, parameter: &str) -> Result<ParameterValue> {
        let info = self
            .system
            .find_by_name(instance)
            .ok_or_else(|| crate::error::Error::not_found(format!("instance `{instance}`")))?;
        info.handle().read_parameter_public(parameter)
    }

    /// Public (unauthenticated) parameter write; see
    /// [`Context::read_parameter`] for the failure modes.
    pub fn write_parameter(&self, instance: &str, parameter: &str, value: ParameterValue) -> Result<()> {
        let info = self
            .system
            .find_by_name(instance)
            .ok_or_else(|| crate::error::Error::not_found(format!("instance `{instance}`")))?;
        info.handle().write_parameter_public(parameter, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn context() -> Arc<Context> {
        Context::new(Config::new()).unwrap()
    }

    #[test]
    fn pseudo_instance_is_immediately_findable() {
        let ctx = context();
        ctx.new_pseudo_instance("host").unwrap();
        assert!(ctx.find_by_name("host").is_some());
        assert_eq!(ctx.instances(), vec!["host".to_string()]);
    }

    #[test]
    fn empty_commit_on_a_fresh_context_succeeds() {
        let ctx = context();
        let set = ctx.new_loading_set();
        assert!(set.commit().wait().is_ok());
    }

    #[test]
    fn link_and_unlink_through_the_context() {
        let ctx = context();
        ctx.new_pseudo_instance("a").unwrap();
        ctx.new_pseudo_instance("b").unwrap();
        ctx.link_instances("a", "b").unwrap();
        ctx.unlink_instances("a", "b").unwrap();
    }

    #[test]
    fn unload_refuses_while_a_dependent_is_linked() {
        let ctx = context();
        ctx.new_pseudo_instance("a").unwrap();
        ctx.new_pseudo_instance("b").unwrap();
        ctx.link_instances("a", "b").unwrap();
        assert!(ctx.unload("b").is_err());
        ctx.unlink_instances("a", "b").unwrap();
        ctx.unload("b").unwrap();
        ctx.unload("a").unwrap();
    }
}
