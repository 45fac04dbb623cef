//! Module handle: owns the OS-level shared-object handle (or a reference to
//! the host binary itself), the module's load directory, and the export
//! iterator used to enumerate its declared [`crate::module::export::Export`]
//! records.
//!
//! Built on the higher-level `libloading` crate rather than a hand-rolled
//! ELF loader, since the module handle here only needs to resolve one
//! well-known symbol rather than relocate a whole binary.

use crate::error::{Error, Result};
use base64::Engine;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::export::Export;

/// `for_each(filter, data)`: the module binary invokes `filter` once per
/// declared export until it returns `false`. Modules in this crate are
/// Rust-to-Rust plugins (same toolchain, shared `Export` layout), so the
/// iterator is a plain Rust function pointer rather than a `repr(C)`
/// signature; the `__no_mangle` export name is still the stable ABI-ish
/// contract modules are found by.
///
/// The consumer receives an *owned* [`Export`] per call (the binary's
/// iterator builds each record on the fly and hands ownership across, since
/// an `Export` carries boxed constructor/destructor closures that cannot be
/// recovered from a borrow). Returning `false` stops the iteration early;
/// callers that want every export should always return `true`.
pub type ExportIteratorFn = unsafe fn(consumer: &mut dyn FnMut(Export) -> bool);

pub const EXPORT_ITERATOR_SYMBOL: &[u8] = b"fimo_impl_module_export_iterator\0";

bitflags::bitflags! {
    /// Mirrors the flags requested of the OS loader
    /// (`NOW | LOCAL | NODELETE | LOAD_LIBRARY_SEARCH_DLL_LOAD_DIR`), kept
    /// purely for diagnostics: the platform-specific `load_with_no_delete`
    /// below talks to `libloading`'s own OS-specific flag types directly,
    /// since those differ in representation across platforms.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct RequestedLoadFlags: u32 {
        const NOW = 1 << 0;
        const LOCAL = 1 << 1;
        const NODELETE = 1 << 2;
        const SEARCH_DLL_LOAD_DIR = 1 << 3;
    }
}

enum Backing {
    /// A `dlopen`-ed shared object, kept alive (and non-unloadable: we
    /// request `RTLD_NODELETE`-equivalent semantics through
    /// [`libloading::Library`]'s ordinary refcounting plus never dropping
    /// the last handle until every derived instance has gone away).
    Dynamic {
        _library: libloading::Library,
        symlink_dir: PathBuf,
    },
    /// The host binary itself, reached by resolving the address of a
    /// locally linked iterator and looking up the owning module.
    CurrentBinary,
}

/// The OS-level handle backing one loaded module, shared (via
/// [`ModuleHandle`]'s own `Arc`) by every instance derived from it.
pub struct ModuleHandle {
    backing: Backing,
    directory: PathBuf,
    iterator: ExportIteratorFn,
}

impl ModuleHandle {
    /// Loads a module binary found at `path` (or, if `path` is a directory,
    /// at `<path>/module.fimo_module`), materializing a unique symlink
    /// directory under `tmp_root` first so the library keeps seeing its
    /// dependencies relative to the original location even though we open
    /// it through an indirection.
    ///
    /// Naming: `<tmp_root>/module_<base64(8 random bytes)>/<binary-name>`.
    pub fn from_path(path: &Path, tmp_root: &Path) -> Result<Self> {
        let binary_path = resolve_binary_path(path)?;
        let parent = binary_path
            .parent()
            .ok_or_else(|| Error::invalid_path(format!("`{}` has no parent directory", binary_path.display())))?;
        let file_name = binary_path
            .file_name()
            .ok_or_else(|| Error::invalid_path(format!("`{}` has no file name", binary_path.display())))?;

        let symlink_dir = unique_symlink_dir(tmp_root)?;
        if let Err(e) = std::os::unix::fs::symlink(parent, symlink_dir.join("dir")) {
            let _ = std::fs::remove_dir_all(&symlink_dir);
            return Err(Error::from(e));
        }
        let loadable_path = symlink_dir.join("dir").join(file_name);

        let requested_flags = RequestedLoadFlags::NOW
            | RequestedLoadFlags::LOCAL
            | RequestedLoadFlags::NODELETE
            | RequestedLoadFlags::SEARCH_DLL_LOAD_DIR;
        log::debug!("loading module binary {} with flags {requested_flags:?}", loadable_path.display());

        let library = unsafe {
            load_with_no_delete(&loadable_path).map_err(|e| {
                let _ = std::fs::remove_dir_all(&symlink_dir);
                e
            })?
        };

        let iterator = unsafe {
            let symbol = library
                .get::<ExportIteratorFn>(EXPORT_ITERATOR_SYMBOL)
                .map_err(|e| Error::invalid_module(format!("missing export iterator: {e}")))?;
            *symbol
        };

        Ok(Self {
            directory: parent.to_path_buf(),
            backing: Backing::Dynamic {
                _library: library,
                symlink_dir,
            },
            iterator,
        })
    }

    /// Builds a handle referring to the current binary: `iterator` must be
    /// a function already linked into the running process (typically the
    /// caller's own `fimo_impl_module_export_iterator`). The owning
    /// module's directory is recovered via an OS address-to-module lookup;
    /// on non-Windows targets the library is additionally re-opened with
    /// `RTLD_NOLOAD` purely to bump its refcount (never to introduce a new
    /// mapping).
    pub fn from_current_binary(iterator: ExportIteratorFn) -> Result<Self> {
        let directory = owning_module_directory(iterator as *const ())?;
        #[cfg(unix)]
        {
            bump_refcount_no_load(iterator as *const ())?;
        }
        Ok(Self {
            directory,
            backing: Backing::CurrentBinary,
            iterator,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Invokes `consumer` once per declared export (by value), stopping
    /// early if it returns `false`.
    pub fn iterate(&self, mut consumer: impl FnMut(Export) -> bool) {
        unsafe { (self.iterator)(&mut consumer) }
    }

    pub fn resource_path(&self, relative: &Path) -> PathBuf {
        self.directory.join(relative)
    }
}

impl Drop for ModuleHandle {
    fn drop(&mut self) {
        if let Backing::Dynamic { symlink_dir, .. } = &self.backing {
            log::trace!("removing module symlink directory {}", symlink_dir.display());
            let _ = std::fs::remove_dir_all(symlink_dir);
        }
    }
}

/// [`ModuleHandle`] is owned by possibly many instance handles, each via a
/// shared reference; this alias documents that convention at call sites.
pub type SharedModuleHandle = Arc<ModuleHandle>;

fn resolve_binary_path(path: &Path) -> Result<PathBuf> {
    let meta = std::fs::symlink_metadata(path)
        .map_err(|_| Error::invalid_path(format!("`{}` does not exist", path.display())))?;

    if meta.is_symlink() {
        let target = std::fs::read_link(path)?;
        let resolved = if target.is_absolute() {
            target
        } else {
            path.parent().unwrap_or(Path::new(".")).join(target)
        };
        return resolve_binary_path(&resolved);
    }
    if meta.is_dir() {
        return resolve_binary_path(&path.join("module.fimo_module"));
    }
    if meta.is_file() {
        return Ok(path.to_path_buf());
    }
    Err(Error::invalid_path(format!(
        "`{}` is neither a file, a directory nor a symlink",
        path.display()
    )))
}

fn unique_symlink_dir(tmp_root: &Path) -> Result<PathBuf> {
    let mut random = [0u8; 8];
    rand::Rng::fill(&mut rand::thread_rng(), &mut random);
    let suffix = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(random);
    let dir = tmp_root.join(format!("module_{suffix}"));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

#[cfg(unix)]
unsafe fn load_with_no_delete(path: &Path) -> Result<libloading::Library> {
    use libloading::os::unix::{Library, RTLD_LOCAL, RTLD_NODELETE, RTLD_NOW};
    unsafe {
        Library::open(Some(path), RTLD_NOW | RTLD_LOCAL | RTLD_NODELETE)
            .map(Into::into)
            .map_err(Error::from)
    }
}

#[cfg(windows)]
unsafe fn load_with_no_delete(path: &Path) -> Result<libloading::Library> {
    use libloading::os::windows::Library;
    unsafe { Library::new(path).map(Into::into).map_err(Error::from) }
}

/// Resolves the full path of the module owning `addr` via `dladdr`,
/// canonicalized where possible. Shared by [`owning_module_directory`] and
/// [`bump_refcount_no_load`], which needs the file itself (not just its
/// parent) to re-open it.
#[cfg(unix)]
fn owning_module_path(addr: *const ()) -> Result<PathBuf> {
    use std::ffi::c_void;
    #[repr(C)]
    struct DlInfo {
        dli_fname: *const std::os::raw::c_char,
        dli_fbase: *mut c_void,
        dli_sname: *const std::os::raw::c_char,
        dli_saddr: *mut c_void,
    }
    unsafe extern "C" {
        fn dladdr(addr: *const c_void, info: *mut DlInfo) -> i32;
    }
    let mut info = DlInfo {
        dli_fname: std::ptr::null(),
        dli_fbase: std::ptr::null_mut(),
        dli_sname: std::ptr::null(),
        dli_saddr: std::ptr::null_mut(),
    };
    let rc = unsafe { dladdr(addr.cast(), &mut info) };
    if rc == 0 || info.dli_fname.is_null() {
        return Err(Error::invalid_module(
            "could not resolve the owning module of the local export iterator",
        ));
    }
    let name = unsafe { std::ffi::CStr::from_ptr(info.dli_fname) }
        .to_string_lossy()
        .into_owned();
    let path = PathBuf::from(name);
    Ok(std::fs::canonicalize(&path).unwrap_or(path))
}

#[cfg(unix)]
fn owning_module_directory(addr: *const ()) -> Result<PathBuf> {
    let path = owning_module_path(addr)?;
    Ok(path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(".")))
}

#[cfg(windows)]
fn owning_module_directory(addr: *const ()) -> Result<PathBuf> {
    use windows_sys::Win32::System::LibraryLoader::{
        GetModuleFileNameW, GetModuleHandleExW, GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS,
    };
    unsafe {
        let mut handle = std::ptr::null_mut();
        if GetModuleHandleExW(GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS, addr.cast(), &mut handle) == 0 {
            return Err(Error::invalid_module("GetModuleHandleExW failed"));
        }
        let mut buf = [0u16; 4096];
        let len = GetModuleFileNameW(handle, buf.as_mut_ptr(), buf.len() as u32);
        if len == 0 {
            return Err(Error::invalid_module("GetModuleFileNameW failed"));
        }
        let path = PathBuf::from(String::from_utf16_lossy(&buf[..len as usize]));
        Ok(path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(".")))
    }
}

/// Bumps the refcount of the module owning `addr` without introducing a new
/// mapping, by re-opening it with `RTLD_NOLOAD`. The reopened handle is
/// leaked intentionally: its only purpose is the refcount increment the OS
/// loader performs as a side effect of the open call, mirroring the
/// lifetime of the process-wide binary this [`ModuleHandle`] refers to.
#[cfg(unix)]
fn bump_refcount_no_load(addr: *const ()) -> Result<()> {
    use libloading::os::unix::{Library, RTLD_NOLOAD, RTLD_NOW};
    let path = owning_module_path(addr)?;
    let library = unsafe { Library::open(Some(&path), RTLD_NOW | RTLD_NOLOAD).map_err(Error::from)? };
    std::mem::forget(library);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_binary_path_rejects_missing_file() {
        let err = resolve_binary_path(Path::new("/nonexistent/path/to/module")).unwrap_err();
        assert!(matches!(err, Error::InvalidPath(_)));
    }

    #[test]
    fn unique_symlink_dirs_do_not_collide() {
        let tmp = tempfile::tempdir().unwrap();
        let a = unique_symlink_dir(tmp.path()).unwrap();
        let b = unique_symlink_dir(tmp.path()).unwrap();
        assert_ne!(a, b);
    }
}
