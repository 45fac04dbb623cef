//! Module handles (C4) and the export record modules declare (part of the
//! C7 loading-set contract).

pub mod export;
pub mod handle;

pub use export::{
    DynamicSymbolExport, Export, Modifier, ParameterDeclaration, ResourceDeclaration,
    StaticSymbolExport, SymbolImport,
};
pub use handle::{ExportIteratorFn, ModuleHandle, SharedModuleHandle, EXPORT_ITERATOR_SYMBOL};
