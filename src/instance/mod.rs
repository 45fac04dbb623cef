//! The instance handle (C3): the per-instance control block, and the
//! parameter store (C5) it owns a slice of.

pub mod handle;
pub mod parameter;

pub use handle::{
    DependencyKind, ExportedSymbolRecord, ImportedSymbolRecord, InstanceHandle, InstanceHandleBuilder,
    InstanceInfo, InstanceKind, LifecycleHooks, LifecycleState,
};
pub use parameter::{ParameterAccessGroup, ParameterCallbacks, ParameterCell, ParameterType, ParameterValue};
