//! A minimal module binary demonstrating the export contract consumed by
//! `fimo-modules`: one exported symbol, one public parameter, and a
//! start/stop lifecycle hook that logs the transition.
//!
//! Built as a `cdylib` so it can be loaded through
//! [`fimo_modules::LoadingSet::add_modules_from_path`]; a host linking this
//! crate in directly (rather than `dlopen`-ing it) would instead use
//! [`fimo_modules::LoadingSet::add_modules_from_local`] with
//! [`fimo_impl_module_export_iterator`].

use fimo_modules::{Export, ParameterAccessGroup, ParameterDeclaration, ParameterValue, StaticSymbolExport, Version};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// The symbol this module exports: a shared counter other instances can
/// import by name (`"greeting_count"`, global namespace).
fn greeting_counter() -> Arc<AtomicU32> {
    Arc::new(AtomicU32::new(0))
}

fn build_export() -> Export {
    let mut export = Export::new("sample_greeter", Version::new(0, 1, 0));
    export.description = Some("Greets callers and counts how many times it has started.".into());
    export.author = Some("The Fimo Project Developers".into());
    export.license = Some("Apache-2.0".into());

    export.parameters.push(
        ParameterDeclaration::new("greeting", ParameterValue::U32(0))
            .with_access(ParameterAccessGroup::Public, ParameterAccessGroup::Private),
    );

    export.static_exports.push(StaticSymbolExport {
        name: "greeting_count".into(),
        namespace: String::new(),
        version: Version::new(1, 0, 0),
        pointer: greeting_counter(),
    });

    export.modifiers.push(fimo_modules::Modifier::StartEvent(Box::new(|_state| {
        log::info!("sample_greeter: started");
        Ok(())
    })));
    export.modifiers.push(fimo_modules::Modifier::StopEvent(Box::new(|_state| {
        log::info!("sample_greeter: stopped");
    })));

    export
}

/// The well-known export iterator symbol every module binary must provide.
///
/// # Safety
///
/// Must only be called by the subsystem's own [`ModuleHandle`] machinery,
/// which guarantees `consumer` outlives the call.
///
/// [`ModuleHandle`]: fimo_modules::ModuleHandle
#[unsafe(no_mangle)]
pub unsafe extern "Rust" fn fimo_impl_module_export_iterator(consumer: &mut dyn FnMut(Export) -> bool) {
    consumer(build_export());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_validates() {
        assert!(build_export().validate().is_ok());
    }
}
