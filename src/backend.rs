//! Replaceable backend allocator hooks and the taken-pointer boundary.
//!
//! The tree allocator never calls the platform allocator directly; every
//! byte it acquires or returns goes through a process-wide table of four
//! hooks. The defaults are the platform `malloc` family plus an aborting
//! error handler. Swapping hooks mid-flight is legal only while no
//! allocation produced by the previous backend is still live.

use std::ptr::{addr_of, addr_of_mut};

/// The four backend entry points. None of them is ever invoked with a
/// size of zero.
#[derive(Clone, Copy)]
pub(crate) struct Backend {
    pub alloc: fn(usize) -> *mut u8,
    pub realloc: fn(*mut u8, usize) -> *mut u8,
    pub release: fn(*mut u8),
    pub error: fn(&str),
}

fn default_alloc(size: usize) -> *mut u8 {
    unsafe { libc::malloc(size) as *mut u8 }
}

fn default_realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    unsafe { libc::realloc(ptr as *mut libc::c_void, size) as *mut u8 }
}

fn default_release(ptr: *mut u8) {
    unsafe { libc::free(ptr as *mut libc::c_void) }
}

fn default_error(msg: &str) {
    eprintln!("treealloc: {msg}");
    std::process::abort();
}

static mut HOOKS: Backend = Backend {
    alloc: default_alloc,
    realloc: default_realloc,
    release: default_release,
    error: default_error,
};

/// Replace any subset of the backend hooks. `None` keeps the current hook.
///
/// A program that installs a non-aborting error hook must check the return
/// values of every mutating operation: the hook is informational, not a
/// recovery channel.
pub fn set_backend(
    alloc: Option<fn(usize) -> *mut u8>,
    realloc: Option<fn(*mut u8, usize) -> *mut u8>,
    release: Option<fn(*mut u8)>,
    error: Option<fn(&str)>,
) {
    unsafe {
        let hooks = addr_of_mut!(HOOKS);
        if let Some(f) = alloc {
            (*hooks).alloc = f;
        }
        if let Some(f) = realloc {
            (*hooks).realloc = f;
        }
        if let Some(f) = release {
            (*hooks).release = f;
        }
        if let Some(f) = error {
            (*hooks).error = f;
        }
    }
}

fn hooks() -> Backend {
    unsafe { *addr_of!(HOOKS) }
}

/// Acquire `size` bytes. Reports through the error hook and returns null
/// on failure.
pub(crate) fn allocate(size: usize) -> *mut u8 {
    debug_assert!(size != 0);
    let ptr = (hooks().alloc)(size);
    if ptr.is_null() {
        error("allocation failed");
    } else {
        bounds::update(ptr as usize, size);
    }
    ptr
}

/// Grow or shrink `ptr` to `size` bytes, possibly moving it. Reports
/// through the error hook and returns null on failure, leaving the old
/// allocation intact.
pub(crate) fn reallocate(ptr: *mut u8, size: usize) -> *mut u8 {
    debug_assert!(size != 0);
    let new = (hooks().realloc)(ptr, size);
    if new.is_null() {
        error("reallocation failed");
    } else {
        bounds::update(new as usize, size);
    }
    new
}

pub(crate) fn release(ptr: *mut u8) {
    (hooks().release)(ptr)
}

#[cold]
pub(crate) fn error(msg: &str) {
    (hooks().error)(msg)
}

/// Hooks into the companion ownership-transfer ("taken pointer") layer.
///
/// `is_taken` answers whether a pointer argument was marked as passed by
/// ownership; `cleanup` releases the layer's bookkeeping at shutdown. The
/// collaborator is expected to register [`crate::free`] as its own
/// allocation-failure callback so that a take followed by an allocator OOM
/// still frees the taken object.
#[derive(Clone, Copy)]
pub struct TakenOps {
    pub is_taken: fn(*const u8) -> bool,
    pub cleanup: fn(),
}

fn never_taken(_ptr: *const u8) -> bool {
    false
}

fn no_cleanup() {}

static mut TAKEN: TakenOps = TakenOps {
    is_taken: never_taken,
    cleanup: no_cleanup,
};

/// Register the taken-pointer collaborator. The defaults treat nothing as
/// taken and clean nothing up.
pub fn set_taken_ops(ops: TakenOps) {
    unsafe {
        *addr_of_mut!(TAKEN) = ops;
    }
}

pub(crate) fn is_taken(ptr: *const u8) -> bool {
    (unsafe { *addr_of!(TAKEN) }.is_taken)(ptr)
}

pub(crate) fn taken_cleanup() {
    (unsafe { *addr_of!(TAKEN) }.cleanup)()
}

/// Debug-build window of every address the backend has handed out, used by
/// the header validation in [`crate::tree`]. Release builds keep nothing
/// and report every pointer as in bounds.
#[cfg(debug_assertions)]
pub(crate) mod bounds {
    use std::ptr::{addr_of, addr_of_mut};

    static mut START: usize = 0;
    static mut END: usize = 0;

    pub(crate) fn update(addr: usize, size: usize) {
        unsafe {
            if *addr_of!(START) == 0 {
                *addr_of_mut!(START) = addr;
                *addr_of_mut!(END) = addr + size;
            } else if addr < *addr_of!(START) {
                *addr_of_mut!(START) = addr;
            } else if addr + size > *addr_of!(END) {
                *addr_of_mut!(END) = addr + size;
            }
        }
    }

    pub(crate) fn contains(addr: usize) -> bool {
        unsafe { addr >= *addr_of!(START) && addr <= *addr_of!(END) }
    }
}

#[cfg(not(debug_assertions))]
pub(crate) mod bounds {
    pub(crate) fn update(_addr: usize, _size: usize) {}

    pub(crate) fn contains(_addr: usize) -> bool {
        true
    }
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "emscripten"))]
pub(crate) unsafe fn errno_ptr() -> *mut libc::c_int {
    libc::__errno_location()
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "tvos",
    target_os = "watchos",
    target_os = "freebsd"
))]
pub(crate) unsafe fn errno_ptr() -> *mut libc::c_int {
    libc::__error()
}

#[cfg(any(target_os = "openbsd", target_os = "netbsd"))]
pub(crate) unsafe fn errno_ptr() -> *mut libc::c_int {
    libc::__errno()
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "emscripten",
    target_os = "macos",
    target_os = "ios",
    target_os = "tvos",
    target_os = "watchos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd"
)))]
pub(crate) unsafe fn errno_ptr() -> *mut libc::c_int {
    std::ptr::null_mut()
}

/// Saves errno on construction and writes it back on drop, so a
/// deallocation path can promise not to clobber the caller's errno.
pub(crate) struct ErrnoGuard(libc::c_int);

impl ErrnoGuard {
    pub(crate) fn save() -> Self {
        let saved = unsafe { errno_ptr().as_ref().map_or(0, |e| *e) };
        ErrnoGuard(saved)
    }
}

impl Drop for ErrnoGuard {
    fn drop(&mut self) {
        unsafe {
            if let Some(e) = errno_ptr().as_mut() {
                *e = self.0;
            }
        }
    }
}
