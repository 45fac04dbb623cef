//! The module export record: the declarative description a module binary
//! hands to the subsystem, and from which an [`crate::instance::handle::InstanceHandle`]
//! is built during a loading-set commit.

use crate::instance::parameter::{ParameterAccessGroup, ParameterType, ParameterValue};
use crate::version::Version;
use std::sync::Arc;

/// A declared per-instance parameter, before the instance exists.
#[derive(Clone)]
pub struct ParameterDeclaration {
    pub name: String,
    pub default: ParameterValue,
    pub read_group: ParameterAccessGroup,
    pub write_group: ParameterAccessGroup,
    pub getter: Option<Arc<dyn Fn(ParameterValue) -> ParameterValue + Send + Sync>>,
    pub setter: Option<Arc<dyn Fn(ParameterValue) -> ParameterValue + Send + Sync>>,
}

impl ParameterDeclaration {
    pub fn new(name: impl Into<String>, default: ParameterValue) -> Self {
        Self {
            name: name.into(),
            default,
            read_group: ParameterAccessGroup::Private,
            write_group: ParameterAccessGroup::Private,
            getter: None,
            setter: None,
        }
    }

    pub fn with_access(mut self, read: ParameterAccessGroup, write: ParameterAccessGroup) -> Self {
        self.read_group = read;
        self.write_group = write;
        self
    }

    pub fn type_(&self) -> ParameterType {
        self.default.type_()
    }
}

/// A declared resource path, relative to the module's own directory.
#[derive(Debug, Clone)]
pub struct ResourceDeclaration {
    pub name: String,
    pub relative_path: std::path::PathBuf,
}

/// An imported symbol: `(name, namespace, minimum compatible version)`.
#[derive(Debug, Clone)]
pub struct SymbolImport {
    pub name: String,
    pub namespace: String,
    pub version: Version,
}

/// A statically exported symbol: resolved once at load time, alive for the
/// instance's whole lifetime, never individually destructed.
#[derive(Clone)]
pub struct StaticSymbolExport {
    pub name: String,
    pub namespace: String,
    pub version: Version,
    pub pointer: Arc<dyn std::any::Any + Send + Sync>,
}

/// A dynamically exported symbol: produced by a constructor closure invoked
/// during instance construction (with all locks dropped) and torn down by
/// an optional destructor when the instance is detached.
pub struct DynamicSymbolExport {
    pub name: String,
    pub namespace: String,
    pub version: Version,
    pub constructor:
        Box<dyn Fn() -> crate::error::Result<Arc<dyn std::any::Any + Send + Sync>> + Send + Sync>,
    pub destructor: Option<Box<dyn Fn(Arc<dyn std::any::Any + Send + Sync>) + Send + Sync>>,
}

/// At-most-once and repeatable modifier entries recognized during candidate
/// validation.
pub enum Modifier {
    /// A static dependency on another named instance, recorded regardless
    /// of whether any import is satisfied by it.
    Dependency(String),
    /// Opaque debug information; at most one per export.
    DebugInfo(Box<dyn std::any::Any + Send + Sync>),
    /// Produces the per-instance opaque state handed to the instance's
    /// lifecycle hooks; at most one per export.
    InstanceState(Box<dyn Fn() -> crate::error::Result<Box<dyn std::any::Any + Send + Sync>> + Send + Sync>),
    /// Invoked when the instance transitions `init -> started`; at most one
    /// per export.
    StartEvent(Box<dyn Fn(&dyn std::any::Any) -> crate::error::Result<()> + Send + Sync>),
    /// Invoked when the instance transitions `started -> init`; at most one
    /// per export.
    StopEvent(Box<dyn Fn(&dyn std::any::Any) + Send + Sync>),
    /// Invoked exactly once, when the instance is fully detached, if an
    /// instance state was produced.
    Destructor(Box<dyn Fn(Box<dyn std::any::Any + Send + Sync>) + Send + Sync>),
}

impl Modifier {
    fn kind(&self) -> ModifierKind {
        match self {
            Modifier::Dependency(_) => ModifierKind::Dependency,
            Modifier::DebugInfo(_) => ModifierKind::DebugInfo,
            Modifier::InstanceState(_) => ModifierKind::InstanceState,
            Modifier::StartEvent(_) => ModifierKind::StartEvent,
            Modifier::StopEvent(_) => ModifierKind::StopEvent,
            Modifier::Destructor(_) => ModifierKind::Destructor,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ModifierKind {
    Dependency,
    DebugInfo,
    InstanceState,
    StartEvent,
    StopEvent,
    Destructor,
}

impl ModifierKind {
    /// Keys with "at-most-once" semantics.
    fn at_most_once(self) -> bool {
        matches!(
            self,
            ModifierKind::DebugInfo
                | ModifierKind::InstanceState
                | ModifierKind::StartEvent
                | ModifierKind::StopEvent
        )
    }
}

/// The declarative description of one module, as handed to the subsystem by
/// a module binary's export iterator.
pub struct Export {
    pub name: String,
    pub description: Option<String>,
    pub author: Option<String>,
    pub license: Option<String>,
    pub parameters: Vec<ParameterDeclaration>,
    pub resources: Vec<ResourceDeclaration>,
    pub namespace_imports: Vec<String>,
    pub symbol_imports: Vec<SymbolImport>,
    pub static_exports: Vec<StaticSymbolExport>,
    pub dynamic_exports: Vec<DynamicSymbolExport>,
    pub modifiers: Vec<Modifier>,
    /// The runtime context version the module was compiled against.
    pub context_version: Version,
}

impl Export {
    pub fn new(name: impl Into<String>, context_version: Version) -> Self {
        Self {
            name: name.into(),
            description: None,
            author: None,
            license: None,
            parameters: Vec::new(),
            resources: Vec::new(),
            namespace_imports: Vec::new(),
            symbol_imports: Vec::new(),
            static_exports: Vec::new(),
            dynamic_exports: Vec::new(),
            modifiers: Vec::new(),
            context_version,
        }
    }

    /// Validates this export's internal consistency (name, namespace and
    /// symbol uniqueness, modifier cardinality), excluding context-version
    /// compatibility, which the caller checks against its own running
    /// context version. On failure returns a human-readable reason; the
    /// caller is expected to log it as a warning and skip the export rather
    /// than fail the whole batch.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("export has an empty name".into());
        }
        if self.name.starts_with("__") {
            return Err(format!("export name `{}` uses the reserved `__` prefix", self.name));
        }

        let mut seen_namespaces = std::collections::HashSet::new();
        for ns in &self.namespace_imports {
            if ns.is_empty() {
                return Err("cannot explicitly import the global namespace".into());
            }
            if !seen_namespaces.insert(ns.as_str()) {
                return Err(format!("namespace `{ns}` is imported more than once"));
            }
        }

        for imp in &self.symbol_imports {
            if !imp.namespace.is_empty() && !seen_namespaces.contains(imp.namespace.as_str()) {
                return Err(format!(
                    "symbol import `{}` references namespace `{}`, which is not imported",
                    imp.name, imp.namespace
                ));
            }
        }

        let mut exported: std::collections::HashSet<(&str, &str)> = std::collections::HashSet::new();
        for exp in &self.static_exports {
            if !exported.insert((exp.name.as_str(), exp.namespace.as_str())) {
                return Err(format!(
                    "symbol `{}` in namespace `{}` is exported more than once",
                    exp.name, exp.namespace
                ));
            }
        }
        for exp in &self.dynamic_exports {
            if !exported.insert((exp.name.as_str(), exp.namespace.as_str())) {
                return Err(format!(
                    "symbol `{}` in namespace `{}` is exported more than once",
                    exp.name, exp.namespace
                ));
            }
        }
        for imp in &self.symbol_imports {
            if exported.contains(&(imp.name.as_str(), imp.namespace.as_str())) {
                return Err(format!(
                    "symbol `{}` in namespace `{}` is both imported and exported",
                    imp.name, imp.namespace
                ));
            }
        }

        let mut seen_kinds = std::collections::HashSet::new();
        for modifier in &self.modifiers {
            let kind = modifier.kind();
            if kind.at_most_once() && !seen_kinds.insert(kind) {
                return Err(format!("modifier `{kind:?}` may appear at most once"));
            }
        }

        Ok(())
    }

    pub fn dependency_modifiers(&self) -> impl Iterator<Item = &str> {
        self.modifiers.iter().filter_map(|m| match m {
            Modifier::Dependency(name) => Some(name.as_str()),
            _ => None,
        })
    }
}

impl std::fmt::Debug for Export {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Export")
            .field("name", &self.name)
            .field("namespace_imports", &self.namespace_imports)
            .field("symbol_imports", &self.symbol_imports.len())
            .field("static_exports", &self.static_exports.len())
            .field("dynamic_exports", &self.dynamic_exports.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(name: &str) -> Export {
        Export::new(name, Version::new(1, 0, 0))
    }

    #[test]
    fn reserved_prefix_rejected() {
        let e = base("__internal");
        assert!(e.validate().is_err());
    }

    #[test]
    fn global_namespace_import_rejected() {
        let mut e = base("a");
        e.namespace_imports.push(String::new());
        assert!(e.validate().is_err());
    }

    #[test]
    fn import_requires_imported_namespace() {
        let mut e = base("a");
        e.symbol_imports.push(SymbolImport {
            name: "s".into(),
            namespace: "ns".into(),
            version: Version::new(1, 0, 0),
        });
        assert!(e.validate().is_err());

        e.namespace_imports.push("ns".into());
        assert!(e.validate().is_ok());
    }

    #[test]
    fn duplicate_export_rejected() {
        let mut e = base("a");
        e.static_exports.push(StaticSymbolExport {
            name: "s".into(),
            namespace: String::new(),
            version: Version::new(1, 0, 0),
            pointer: Arc::new(()),
        });
        e.static_exports.push(StaticSymbolExport {
            name: "s".into(),
            namespace: String::new(),
            version: Version::new(1, 0, 0),
            pointer: Arc::new(()),
        });
        assert!(e.validate().is_err());
    }

    #[test]
    fn import_and_export_same_symbol_rejected() {
        let mut e = base("a");
        e.namespace_imports.push("ns".into());
        e.symbol_imports.push(SymbolImport {
            name: "s".into(),
            namespace: "ns".into(),
            version: Version::new(1, 0, 0),
        });
        e.static_exports.push(StaticSymbolExport {
            name: "s".into(),
            namespace: "ns".into(),
            version: Version::new(1, 0, 0),
            pointer: Arc::new(()),
        });
        assert!(e.validate().is_err());
    }
}
