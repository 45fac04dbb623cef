//! Global tables owned by the [`crate::system::System`]: the symbol
//! registry and the namespace registry.

pub mod namespace;
pub mod symbol;

pub use namespace::{NamespaceEntry, NamespaceRegistry};
pub use symbol::{SymbolEntry, SymbolKey, SymbolRegistry};
