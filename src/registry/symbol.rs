//! Symbol registry: tracks which instance owns each exported `(name,
//! namespace)` pair and at which version.

use crate::error::{Error, Result};
use crate::version::Version;
use indexmap::IndexMap;

/// Key identifying a symbol: its name and the namespace it lives in.
/// The empty string denotes the implicit global namespace.
pub type SymbolKey = (String, String);

/// A registered symbol entry: which instance owns it, and at which version.
#[derive(Debug, Clone)]
pub struct SymbolEntry {
    pub owner: String,
    pub version: Version,
}

/// Maps `(name, namespace) -> (owner instance, version)`.
///
/// Invariant: for every entry with a non-global namespace there is a live
/// [`crate::registry::namespace::NamespaceRegistry`] entry whose
/// `num_symbols` counts it; callers are expected to keep the namespace
/// registry in sync (see [`crate::system::System::add_instance`]).
#[derive(Default)]
pub struct SymbolRegistry {
    entries: IndexMap<SymbolKey, SymbolEntry>,
}

impl SymbolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_global(namespace: &str) -> bool {
        namespace.is_empty()
    }

    /// Inserts a new symbol entry. Fails with [`Error::Duplicate`] if the
    /// key is already present.
    pub fn insert(&mut self, name: &str, namespace: &str, version: Version, owner: &str) -> Result<()> {
        let key = (name.to_owned(), namespace.to_owned());
        if self.entries.contains_key(&key) {
            return Err(Error::duplicate(format!(
                "symbol `{name}` in namespace `{namespace}` is already exported"
            )));
        }
        self.entries.insert(
            key,
            SymbolEntry {
                owner: owner.to_owned(),
                version,
            },
        );
        Ok(())
    }

    /// Removes a symbol entry. No-op if absent (callers are expected to
    /// only remove entries they previously inserted).
    pub fn remove(&mut self, name: &str, namespace: &str) -> Option<SymbolEntry> {
        self.entries.shift_remove(&(name.to_owned(), namespace.to_owned()))
    }

    pub fn lookup(&self, name: &str, namespace: &str) -> Option<&SymbolEntry> {
        self.entries.get(&(name.to_owned(), namespace.to_owned()))
    }

    /// As [`Self::lookup`], but additionally requires the found entry's
    /// version to satisfy `required` under [`Version::is_compatible_with`].
    pub fn lookup_compatible(
        &self,
        name: &str,
        namespace: &str,
        required: &Version,
    ) -> Option<&SymbolEntry> {
        self.lookup(name, namespace)
            .filter(|entry| entry.version.is_compatible_with(required))
    }

    pub fn contains(&self, name: &str, namespace: &str) -> bool {
        self.entries.contains_key(&(name.to_owned(), namespace.to_owned()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries currently registered under `namespace`.
    pub fn count_in_namespace(&self, namespace: &str) -> usize {
        self.entries.keys().filter(|(_, ns)| ns == namespace).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_insert_fails() {
        let mut reg = SymbolRegistry::new();
        reg.insert("s", "ns", Version::new(1, 0, 0), "a").unwrap();
        let err = reg.insert("s", "ns", Version::new(1, 0, 0), "b").unwrap_err();
        assert!(matches!(err, Error::Duplicate(_)));
    }

    #[test]
    fn lookup_compatible_respects_major_minor_patch_rule() {
        let mut reg = SymbolRegistry::new();
        reg.insert("s", "ns", Version::new(1, 2, 0), "a").unwrap();
        assert!(reg
            .lookup_compatible("s", "ns", &Version::new(1, 2, 0))
            .is_some());
        assert!(reg
            .lookup_compatible("s", "ns", &Version::new(2, 0, 0))
            .is_none());
    }

    #[test]
    fn remove_decrements_presence() {
        let mut reg = SymbolRegistry::new();
        reg.insert("s", "ns", Version::new(1, 0, 0), "a").unwrap();
        assert!(reg.remove("s", "ns").is_some());
        assert!(!reg.contains("s", "ns"));
    }
}
