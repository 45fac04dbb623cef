//! Namespace registry: ref-counted lifecycle bookkeeping for symbol
//! namespaces.

use crate::error::{Error, Result};
use indexmap::IndexMap;

/// Bookkeeping for one namespace: how many symbols it currently exports,
/// and how many loaded instances hold an import reference to it.
#[derive(Debug, Clone, Copy, Default)]
pub struct NamespaceEntry {
    pub num_symbols: usize,
    pub num_references: usize,
}

/// Maps namespace name -> [`NamespaceEntry`]. The global namespace (`""`)
/// is never materialized; all operations on it are no-ops, matching the
/// original's "implicit" treatment of the global namespace.
#[derive(Default)]
pub struct NamespaceRegistry {
    entries: IndexMap<String, NamespaceEntry>,
}

impl NamespaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_global(name: &str) -> bool {
        name.is_empty()
    }

    pub fn exists(&self, name: &str) -> bool {
        !Self::is_global(name) && self.entries.contains_key(name)
    }

    pub fn entry(&self, name: &str) -> Option<NamespaceEntry> {
        self.entries.get(name).copied()
    }

    /// Increments the reference count of `name`. Fails with
    /// [`Error::NotFound`] if the namespace does not exist (global
    /// namespace excluded: a `ref` on it is always a no-op success).
    pub fn add_reference(&mut self, name: &str) -> Result<()> {
        if Self::is_global(name) {
            return Ok(());
        }
        let entry = self
            .entries
            .get_mut(name)
            .ok_or_else(|| Error::not_found(format!("namespace `{name}`")))?;
        entry.num_references += 1;
        Ok(())
    }

    /// Decrements the reference count of `name`, deleting the entry once
    /// both counters have reached zero.
    pub fn remove_reference(&mut self, name: &str) {
        if Self::is_global(name) {
            return;
        }
        let Some(entry) = self.entries.get_mut(name) else {
            return;
        };
        entry.num_references = entry.num_references.saturating_sub(1);
        self.prune_if_dead(name);
    }

    /// Called when a symbol is inserted into `name`'s namespace; creates
    /// the entry lazily.
    pub fn note_symbol_added(&mut self, name: &str) {
        if Self::is_global(name) {
            return;
        }
        let entry = self.entries.entry(name.to_owned()).or_default();
        entry.num_symbols += 1;
    }

    /// Called when a symbol is removed from `name`'s namespace.
    pub fn note_symbol_removed(&mut self, name: &str) {
        if Self::is_global(name) {
            return;
        }
        if let Some(entry) = self.entries.get_mut(name) {
            entry.num_symbols = entry.num_symbols.saturating_sub(1);
        }
        self.prune_if_dead(name);
    }

    fn prune_if_dead(&mut self, name: &str) {
        if let Some(entry) = self.entries.get(name) {
            if entry.num_symbols == 0 && entry.num_references == 0 {
                self.entries.shift_remove(name);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ref_on_missing_namespace_fails() {
        let mut reg = NamespaceRegistry::new();
        assert!(matches!(
            reg.add_reference("ns").unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[test]
    fn global_namespace_is_always_a_noop() {
        let mut reg = NamespaceRegistry::new();
        reg.add_reference("").unwrap();
        reg.remove_reference("");
        assert!(!reg.exists(""));
    }

    #[test]
    fn entry_deleted_when_both_counters_hit_zero() {
        let mut reg = NamespaceRegistry::new();
        reg.note_symbol_added("ns");
        reg.add_reference("ns").unwrap();
        assert!(reg.exists("ns"));

        reg.note_symbol_removed("ns");
        assert!(reg.exists("ns"), "still has a reference");

        reg.remove_reference("ns");
        assert!(!reg.exists("ns"));
    }
}
