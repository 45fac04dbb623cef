//! End-to-end commit scenarios driven entirely through the public API:
//! [`Context`] + [`fimo_modules::LoadingSet`].

use fimo_modules::{Config, Context, Export, Modifier, StaticSymbolExport, SymbolImport, Version};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

fn context() -> Arc<Context> {
    let _ = env_logger::try_init();
    Context::new(Config::new()).unwrap()
}

/// A single exporting candidate, no imports. Its symbol becomes resolvable
/// at the declared version and no weaker version, and unresolvable at a
/// higher major version.
#[test]
fn single_module_commit_exposes_a_compatible_symbol() {
    let ctx = context();
    let set = ctx.new_loading_set();

    unsafe fn iterator(consumer: &mut dyn FnMut(Export) -> bool) {
        let mut export = Export::new("a", Version::new(0, 1, 0));
        export.static_exports.push(StaticSymbolExport {
            name: "s".into(),
            namespace: "ns".into(),
            version: Version::new(1, 2, 0),
            pointer: Arc::new(()),
        });
        consumer(export);
    }
    set.add_modules_from_local(iterator, |_| true).unwrap();
    set.commit().wait().unwrap();

    assert!(ctx.find_by_name("a").is_some());
    assert!(ctx.find_by_symbol("s", "ns", &Version::new(1, 2, 0)).is_some());
    assert!(ctx.find_by_symbol("s", "ns", &Version::new(2, 0, 0)).is_none());
}

/// `b` imports a symbol `a` exports. Both load; `b` cannot be unloaded
/// before `a` while the static dependency is live; unloading in dependency
/// order succeeds and empties every table.
#[test]
fn linear_chain_commit_orders_dependencies_and_teardown() {
    let ctx = context();
    let set = ctx.new_loading_set();

    unsafe fn iterator(consumer: &mut dyn FnMut(Export) -> bool) {
        let mut a = Export::new("a", Version::new(0, 1, 0));
        a.static_exports.push(StaticSymbolExport {
            name: "s".into(),
            namespace: String::new(),
            version: Version::new(1, 0, 0),
            pointer: Arc::new(()),
        });
        consumer(a);

        let mut b = Export::new("b", Version::new(0, 1, 0));
        b.symbol_imports.push(SymbolImport {
            name: "s".into(),
            namespace: String::new(),
            version: Version::new(1, 0, 0),
        });
        consumer(b);
    }
    set.add_modules_from_local(iterator, |_| true).unwrap();
    set.commit().wait().unwrap();

    assert!(ctx.find_by_name("a").is_some());
    assert!(ctx.find_by_name("b").is_some());

    // `a` still has `b` depending on it: unload must be refused.
    assert!(ctx.unload("a").is_err());

    ctx.unload("b").unwrap();
    ctx.unload("a").unwrap();
    assert!(ctx.instances().is_empty());
    assert!(ctx.namespaces().is_empty());
}

/// An import whose required version is incompatible with what is actually
/// exported fails the candidate, not the whole commit.
#[test]
fn version_mismatch_fails_only_the_dependent_candidate() {
    let ctx = context();

    let base = ctx.new_loading_set();
    unsafe fn base_iterator(consumer: &mut dyn FnMut(Export) -> bool) {
        let mut a = Export::new("a", Version::new(0, 1, 0));
        a.static_exports.push(StaticSymbolExport {
            name: "s".into(),
            namespace: String::new(),
            version: Version::new(1, 0, 0),
            pointer: Arc::new(()),
        });
        consumer(a);
    }
    base.add_modules_from_local(base_iterator, |_| true).unwrap();
    base.commit().wait().unwrap();

    let set = ctx.new_loading_set();
    unsafe fn dependent_iterator(consumer: &mut dyn FnMut(Export) -> bool) {
        let mut b = Export::new("b", Version::new(0, 1, 0));
        b.symbol_imports.push(SymbolImport {
            name: "s".into(),
            namespace: String::new(),
            version: Version::new(2, 0, 0),
        });
        consumer(b);
    }
    set.add_modules_from_local(dependent_iterator, |_| true).unwrap();

    let errored = Arc::new(AtomicBool::new(false));
    let errored2 = errored.clone();
    set.add_callback(
        "b",
        |_| panic!("b should not have loaded"),
        move |_reason| errored2.store(true, Ordering::SeqCst),
        None::<fn()>,
    )
    .unwrap();

    set.commit().wait().unwrap();
    assert!(errored.load(Ordering::SeqCst));
    assert!(ctx.find_by_name("b").is_none());
    assert!(ctx.find_by_name("a").is_some());
}

/// Two candidates importing each other's symbols form a cycle and both end
/// up in error, with no partial registration.
#[test]
fn mutual_import_cycle_fails_both_candidates() {
    let ctx = context();
    let set = ctx.new_loading_set();

    unsafe fn iterator(consumer: &mut dyn FnMut(Export) -> bool) {
        let mut a = Export::new("a", Version::new(0, 1, 0));
        a.static_exports.push(StaticSymbolExport {
            name: "a_sym".into(),
            namespace: String::new(),
            version: Version::new(1, 0, 0),
            pointer: Arc::new(()),
        });
        a.symbol_imports.push(SymbolImport {
            name: "b_sym".into(),
            namespace: String::new(),
            version: Version::new(1, 0, 0),
        });
        consumer(a);

        let mut b = Export::new("b", Version::new(0, 1, 0));
        b.static_exports.push(StaticSymbolExport {
            name: "b_sym".into(),
            namespace: String::new(),
            version: Version::new(1, 0, 0),
            pointer: Arc::new(()),
        });
        b.symbol_imports.push(SymbolImport {
            name: "a_sym".into(),
            namespace: String::new(),
            version: Version::new(1, 0, 0),
        });
        consumer(b);
    }
    set.add_modules_from_local(iterator, |_| true).unwrap();

    let errors = Arc::new(AtomicUsize::new(0));
    for name in ["a", "b"] {
        let errors = errors.clone();
        set.add_callback(
            name,
            |_| panic!("cyclic candidate should not have loaded"),
            move |_reason| {
                errors.fetch_add(1, Ordering::SeqCst);
            },
            None::<fn()>,
        )
        .unwrap();
    }

    set.commit().wait().unwrap();
    assert_eq!(errors.load(Ordering::SeqCst), 2);
    assert!(ctx.instances().is_empty());
}

/// A candidate declaring a symbol the global registry already has
/// registered fails at commit time, even though appending it succeeded.
#[test]
fn duplicate_export_against_the_registry_is_rejected_at_commit() {
    let ctx = context();

    let first = ctx.new_loading_set();
    unsafe fn exporter(consumer: &mut dyn FnMut(Export) -> bool) {
        let mut x = Export::new("x", Version::new(0, 1, 0));
        x.static_exports.push(StaticSymbolExport {
            name: "s".into(),
            namespace: "ns".into(),
            version: Version::new(1, 0, 0),
            pointer: Arc::new(()),
        });
        consumer(x);
    }
    first.add_modules_from_local(exporter, |_| true).unwrap();
    first.commit().wait().unwrap();

    let second = ctx.new_loading_set();
    unsafe fn reexporter(consumer: &mut dyn FnMut(Export) -> bool) {
        let mut y = Export::new("y", Version::new(0, 1, 0));
        y.static_exports.push(StaticSymbolExport {
            name: "s".into(),
            namespace: "ns".into(),
            version: Version::new(1, 0, 0),
            pointer: Arc::new(()),
        });
        consumer(y);
    }
    // Appending succeeds: validation only checks the candidate in isolation.
    second.add_modules_from_local(reexporter, |_| true).unwrap();
    assert!(second.query_module("y"));

    let errored = Arc::new(AtomicBool::new(false));
    let errored2 = errored.clone();
    second
        .add_callback(
            "y",
            |_| panic!("y should not have loaded"),
            move |_reason| errored2.store(true, Ordering::SeqCst),
            None::<fn()>,
        )
        .unwrap();

    second.commit().wait().unwrap();
    assert!(errored.load(Ordering::SeqCst));
    assert!(ctx.find_by_name("y").is_none());
}

/// A rendezvous the test uses to pin down the interleaving between the two
/// commits without sleeping: `signal` releases anyone parked in `wait`.
struct Gate {
    ready: std::sync::Mutex<bool>,
    cv: std::sync::Condvar,
}

impl Gate {
    fn new() -> Self {
        Self {
            ready: std::sync::Mutex::new(false),
            cv: std::sync::Condvar::new(),
        }
    }

    fn signal(&self) {
        *self.ready.lock().unwrap() = true;
        self.cv.notify_all();
    }

    fn wait(&self) {
        let mut guard = self.ready.lock().unwrap();
        while !*guard {
            guard = self.cv.wait(guard).unwrap();
        }
    }
}

static GATES: std::sync::OnceLock<(Arc<Gate>, Arc<Gate>)> = std::sync::OnceLock::new();

/// `first`'s start hook blocks the event loop thread until released. While
/// it is blocked, `second` is committed on an independent candidate: its
/// commit observes the subsystem still in `loading_set` and queues behind
/// `first` rather than interleaving with it. Releasing the hook lets both
/// commits drain, in order, and both candidates end up loaded.
#[test]
fn concurrent_commits_are_serialized_through_the_system() {
    let started = Arc::new(Gate::new());
    let release = Arc::new(Gate::new());
    GATES
        .set((started.clone(), release.clone()))
        .unwrap_or_else(|_| panic!("gate already set by another test run"));

    unsafe fn blocked_iterator(consumer: &mut dyn FnMut(Export) -> bool) {
        let (started, release) = GATES.get().unwrap().clone();
        let mut first = Export::new("first", Version::new(0, 1, 0));
        first.modifiers.push(Modifier::StartEvent(Box::new(move |_state| {
            started.signal();
            release.wait();
            Ok(())
        })));
        consumer(first);
    }

    unsafe fn independent_iterator(consumer: &mut dyn FnMut(Export) -> bool) {
        consumer(Export::new("second", Version::new(0, 1, 0)));
    }

    let ctx = context();

    let first_set = ctx.new_loading_set();
    first_set.add_modules_from_local(blocked_iterator, |_| true).unwrap();
    let first_commit = first_set.commit();

    // Blocks until the event loop thread is parked inside `first`'s start
    // hook, guaranteeing the subsystem is still `loading_set`.
    started.wait();

    let second_set = ctx.new_loading_set();
    second_set.add_modules_from_local(independent_iterator, |_| true).unwrap();
    let second_commit = second_set.commit();

    release.signal();

    first_commit.wait().unwrap();
    second_commit.wait().unwrap();

    assert!(ctx.find_by_name("first").is_some());
    assert!(ctx.find_by_name("second").is_some());
}
