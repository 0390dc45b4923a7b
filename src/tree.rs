//! The ownership tree.
//!
//! Every allocation is a fixed header immediately followed by the caller's
//! payload bytes. The header threads the node into its parent's sibling
//! list, anchors the property chain, and points back at the parent's
//! children collection. The user-visible pointer is the first payload
//! byte; null stands for the implicit process-wide root.
//!
//! All operations here are `unsafe fn`s over raw user pointers. The caller
//! promises that the pointers were produced by this allocator and are
//! live, and that operations on nodes reachable from a common root are
//! serialized. Destructors and notifier callbacks may re-enter the
//! library, including freeing the node they are being notified about.

use std::mem::{self, size_of, MaybeUninit};
use std::ptr::{addr_of, addr_of_mut, NonNull};
use std::sync::Once;

use sptr::Strict;

use crate::backend::{self, ErrnoGuard};

use self::link::Node;
use self::notify::{Callback, DestroyFn, Events, Notify, NotifyFn};
use self::prop::{Children, Length, Name, Notifier, PropHdr, PropLink, PropTag};

mod check;
mod link;
pub mod notify;
mod prop;

pub use check::{check, dump};

/// The fixed prefix in front of every payload.
#[repr(C)]
pub(crate) struct Hdr {
    /// Sibling link in the parent's children list.
    pub link: Node,
    /// Head of the property chain.
    pub prop: PropLink,
    /// The parent's children collection, with the low bit stolen as the
    /// destroying flag. Null only on the sentinel root.
    parent_child: *mut Children,
}

impl Hdr {
    pub(crate) fn parent_children(&self) -> *mut Children {
        Strict::map_addr(self.parent_child, |a| a & !1)
    }

    fn destroying(&self) -> bool {
        Strict::addr(self.parent_child) & 1 != 0
    }

    /// One-way: the node dies before the flag could ever need clearing.
    fn set_destroying(&mut self) {
        self.parent_child = Strict::map_addr(self.parent_child, |a| a | 1);
    }
}

/// The implicit parent of every allocation made with a null context.
#[repr(C)]
struct Sentinel {
    hdr: Hdr,
    kids: Children,
}

static mut SENTINEL: MaybeUninit<Sentinel> = MaybeUninit::uninit();
static SENTINEL_INIT: Once = Once::new();

pub(crate) fn root_hdr() -> *mut Hdr {
    unsafe {
        let root = addr_of_mut!(SENTINEL) as *mut Sentinel;
        SENTINEL_INIT.call_once(|| {
            let hdr = addr_of_mut!((*root).hdr);
            let kids = addr_of_mut!((*root).kids);
            (*hdr).link.next = addr_of_mut!((*hdr).link);
            (*hdr).link.prev = addr_of_mut!((*hdr).link);
            (*hdr).prop = PropLink::Prop(NonNull::new_unchecked(kids as *mut PropHdr));
            (*hdr).parent_child = std::ptr::null_mut();
            (*kids).hdr.tag = PropTag::Children;
            (*kids).hdr.next = PropLink::End;
            (*kids).owner = hdr;
            link::init(addr_of_mut!((*kids).kids));
        });
        addr_of_mut!((*root).hdr)
    }
}

fn sentinel_contains(addr: usize) -> bool {
    let base = unsafe { addr_of!(SENTINEL) as usize };
    addr >= base && addr <= base + size_of::<Sentinel>()
}

pub(crate) fn in_bounds(addr: usize) -> bool {
    addr == 0 || sentinel_contains(addr) || backend::bounds::contains(addr)
}

fn check_bounds(addr: usize) {
    if !in_bounds(addr) {
        backend::error("not a valid header");
    }
}

/// User pointer for a header.
pub(crate) unsafe fn from_hdr(t: *mut Hdr) -> *mut u8 {
    (t as *mut u8).add(size_of::<Hdr>())
}

/// Header for a user pointer, with debug-build sanity checks on
/// everything the header points at.
pub(crate) unsafe fn to_hdr(ctx: *const u8) -> *mut Hdr {
    let t = (ctx as *mut u8).sub(size_of::<Hdr>()) as *mut Hdr;
    check_bounds(t as usize);
    check_bounds((*t).parent_children() as usize);
    check_bounds((*t).link.next as usize);
    check_bounds((*t).link.prev as usize);
    if let PropLink::Prop(p) = (*t).prop {
        check_bounds(p.as_ptr() as usize);
    }
    t
}

pub(crate) unsafe fn to_hdr_or_root(ctx: *const u8) -> *mut Hdr {
    if ctx.is_null() {
        root_hdr()
    } else {
        to_hdr(ctx)
    }
}

unsafe fn hdr_of(node: *mut Node) -> *mut Hdr {
    (node as *mut u8).sub(mem::offset_of!(Hdr, link)) as *mut Hdr
}

/// Scale `size` by `count`, refusing multiplicative overflow and any total
/// that could not carry the header plus a padded trailing length record.
fn adjust_size(size: &mut usize, count: usize) -> bool {
    const EXTRA: usize = size_of::<Hdr>() + size_of::<Length>() * 2;
    match size.checked_mul(count) {
        Some(total) if total.checked_add(EXTRA).is_some() => {
            *size = total;
            true
        }
        _ => {
            backend::error("allocation size overflow");
            false
        }
    }
}

/// Bytes to append to a payload of `size` so a naturally aligned length
/// record fits at the tail.
fn extra_for_length(size: usize) -> usize {
    let align = mem::align_of::<Length>();
    (align - size % align) % align + size_of::<Length>()
}

/// The tail position of the length record for a payload of `size` bytes.
unsafe fn length_at(payload: *mut u8, size: usize) -> *mut Length {
    let align = mem::align_of::<Length>();
    payload.add(size + (align - size % align) % align) as *mut Length
}

unsafe fn add_child(parent: *mut Hdr, child: *mut Hdr) -> bool {
    let mut children = prop::find_prop(parent, PropTag::Children) as *mut Children;
    if children.is_null() {
        children = prop::add_children_property(parent);
        if children.is_null() {
            return false;
        }
    }
    link::add_head(addr_of_mut!((*children).kids), addr_of_mut!((*child).link));
    (*child).parent_child = children;
    true
}

unsafe fn first_child(t: *mut Hdr) -> *mut Hdr {
    let children = prop::find_prop(t, PropTag::Children) as *mut Children;
    if children.is_null() {
        return std::ptr::null_mut();
    }
    let top = link::top(addr_of_mut!((*children).kids));
    if top.is_null() {
        std::ptr::null_mut()
    } else {
        hdr_of(top)
    }
}

/// Allocate `size` payload bytes under `ctx` (null for the root),
/// optionally zeroed, optionally labeled with a borrowed literal name.
/// Returns null after reporting through the error hook on failure, in
/// which case nothing was linked and no notification fired.
///
/// # Safety
/// `ctx` must be null or a live pointer from this allocator; the tree must
/// not be operated on concurrently.
pub unsafe fn alloc(
    ctx: *const u8,
    size: usize,
    clear: bool,
    label: Option<&'static str>,
) -> *mut u8 {
    let parent = to_hdr_or_root(ctx);

    let Some(total) = size.checked_add(size_of::<Hdr>()) else {
        backend::error("allocation size overflow");
        return std::ptr::null_mut();
    };
    let child = backend::allocate(total) as *mut Hdr;
    if child.is_null() {
        return std::ptr::null_mut();
    }
    if clear {
        std::ptr::write_bytes(from_hdr(child), 0, size);
    }
    (*child).prop = match label {
        Some(name) => PropLink::Literal(name),
        None => PropLink::End,
    };
    (*child).parent_child = std::ptr::null_mut();
    if !add_child(parent, child) {
        backend::release(child as *mut u8);
        return std::ptr::null_mut();
    }
    if notify::any() {
        notify::dispatch(
            parent,
            Notify::AddChild {
                child: from_hdr(child),
            },
        );
    }
    from_hdr(child)
}

/// Allocate an array of `count` elements of `size` bytes each. With
/// `add_count`, an element count is embedded in the buffer tail and kept
/// current across [`resize`]; read it back with [`count`].
///
/// # Safety
/// As [`alloc`].
pub unsafe fn alloc_arr(
    ctx: *const u8,
    size: usize,
    count: usize,
    clear: bool,
    add_count: bool,
    label: Option<&'static str>,
) -> *mut u8 {
    let mut size = size;
    if !adjust_size(&mut size, count) {
        return std::ptr::null_mut();
    }
    let payload = if add_count {
        size + extra_for_length(size)
    } else {
        size
    };
    let ret = alloc(ctx, payload, clear, label);
    if ret.is_null() {
        return ret;
    }
    if add_count {
        let lp = length_at(ret, size);
        prop::push(to_hdr(ret), lp as *mut PropHdr, PropTag::Length);
        (*lp).count = count;
    }
    ret
}

/// Free `ctx` and every descendant. Null is a no-op. Always returns null
/// for assignment convenience, and never clobbers the caller's errno.
///
/// For each node, free notifiers fire before that node's descendants are
/// walked; destruction of the subtree itself is bottom-up. A destructor
/// that frees a node already being destroyed is a no-op, so reentrant
/// cascades terminate.
///
/// # Safety
/// As [`alloc`]; additionally, no pointer into the freed subtree may be
/// used afterwards.
pub unsafe fn free(ctx: *const u8) -> *mut u8 {
    if ctx.is_null() {
        return std::ptr::null_mut();
    }
    let _errno = ErrnoGuard::save();
    let t = to_hdr(ctx);
    if notify::any() {
        let parent = (*(*t).parent_children()).owner;
        notify::dispatch(
            parent,
            Notify::DelChild {
                child: ctx as *mut u8,
            },
        );
    }
    link::del(addr_of_mut!((*t).link));
    del_tree(t, ctx as *mut u8);
    std::ptr::null_mut()
}

unsafe fn del_tree(t: *mut Hdr, orig: *mut u8) {
    // Already being torn down: a destructor freed an ancestor.
    if (*t).destroying() {
        return;
    }
    (*t).set_destroying();

    notify::dispatch(t, Notify::Free { orig });

    let children = prop::find_prop(t, PropTag::Children) as *mut Children;
    if !children.is_null() {
        // Take from the head each round: destructors may reparent the
        // remaining siblings while we run.
        loop {
            let top = link::top(addr_of_mut!((*children).kids));
            if top.is_null() {
                break;
            }
            link::del(top);
            del_tree(hdr_of(top), orig);
        }
    }

    let mut chain = (*t).prop;
    while let PropLink::Prop(p) = chain {
        let record = p.as_ptr();
        chain = (*record).next;
        match (*record).tag {
            // Embedded in the payload buffer; goes away with the node.
            PropTag::Length => {}
            PropTag::Notifier => {
                notify::unsubscribed((*(record as *mut Notifier)).types);
                backend::release(record as *mut u8);
            }
            _ => backend::release(record as *mut u8),
        }
    }
    backend::release(t as *mut u8);
}

/// Move `ctx` under `new_parent` (null for the root), keeping its subtree
/// intact. On failure to attach, the node is restored to its old parent
/// and null is returned; if even that re-attachment fails the tree is
/// corrupt and the process aborts.
///
/// # Safety
/// As [`alloc`]. `new_parent` must not be `ctx` or a descendant of `ctx`:
/// the ownership tree cannot represent cycles.
pub unsafe fn steal(new_parent: *const u8, ctx: *const u8) -> *mut u8 {
    if ctx.is_null() {
        return std::ptr::null_mut();
    }
    let newpar = to_hdr_or_root(new_parent);
    let t = to_hdr(ctx);

    link::del(addr_of_mut!((*t).link));
    let old_parent = (*(*t).parent_children()).owner;

    if !add_child(newpar, t) {
        // The old parent still has its children collection, so this
        // cannot allocate and cannot fail short of corruption.
        if !add_child(old_parent, t) {
            std::process::abort();
        }
        return std::ptr::null_mut();
    }
    if notify::any() {
        notify::dispatch(
            t,
            Notify::Steal {
                new_parent: new_parent as *mut u8,
            },
        );
    }
    ctx as *mut u8
}

/// Run `destroy` with `ctx`'s user pointer when the node is freed.
///
/// # Safety
/// As [`alloc`].
pub unsafe fn add_destructor(ctx: *const u8, destroy: DestroyFn) -> bool {
    let t = to_hdr(ctx);
    !prop::add_notifier_property(t, Events::FREE, Callback::Destroy(destroy)).is_null()
}

/// Remove a destructor previously installed with [`add_destructor`].
/// Returns whether a matching callback was found.
///
/// # Safety
/// As [`alloc`].
pub unsafe fn del_destructor(ctx: *const u8, destroy: DestroyFn) -> bool {
    del_callback_common(to_hdr(ctx), Callback::Destroy(destroy))
}

/// Subscribe `callback` to the events in `types` on `ctx`. The new
/// notifier does not see its own installation: any `ADD_NOTIFIER`
/// subscribers already present are told first, then the mask is armed.
///
/// # Safety
/// As [`alloc`].
pub unsafe fn add_notifier(ctx: *const u8, types: Events, callback: NotifyFn) -> bool {
    let t = to_hdr(ctx);
    assert!(!types.is_empty());

    let n = prop::add_notifier_property(t, Events::empty(), Callback::Notify(callback));
    if n.is_null() {
        return false;
    }

    if notify::any() {
        notify::dispatch(
            t,
            Notify::AddNotifier {
                callback: Callback::Notify(callback),
            },
        );
    }

    (*n).types = types;
    notify::subscribed(types);
    true
}

/// Remove a notifier previously installed with [`add_notifier`]. Returns
/// whether a matching callback was found.
///
/// # Safety
/// As [`alloc`].
pub unsafe fn del_notifier(ctx: *const u8, callback: NotifyFn) -> bool {
    del_callback_common(to_hdr(ctx), Callback::Notify(callback))
}

unsafe fn del_callback_common(t: *mut Hdr, cb: Callback) -> bool {
    match prop::del_callback(t, cb) {
        Some(types) => {
            notify::dispatch(t, Notify::DelNotifier { callback: cb });
            notify::unsubscribed(types);
            true
        }
        None => false,
    }
}

/// Give `ctx` a heap-copied name.
///
/// # Safety
/// As [`alloc`].
pub unsafe fn set_name(ctx: *mut u8, name: &str) -> bool {
    replace_name(to_hdr(ctx), name, None)
}

/// Give `ctx` a name borrowed for the node's whole lifetime; no copy is
/// made and [`name`] returns the very same `&str`. An empty literal falls
/// back to a heap copy.
///
/// # Safety
/// As [`alloc`].
pub unsafe fn set_name_literal(ctx: *mut u8, name: &'static str) -> bool {
    let literal = if name.is_empty() { None } else { Some(name) };
    replace_name(to_hdr(ctx), name, literal)
}

unsafe fn replace_name(t: *mut Hdr, name: &str, literal: Option<&'static str>) -> bool {
    if let Some(at) = prop::find_link(t, PropTag::Name) {
        match at.get() {
            PropLink::Literal(_) => at.set(PropLink::End),
            PropLink::Prop(p) => {
                at.set((*p.as_ptr()).next);
                backend::release(p.as_ptr() as *mut u8);
            }
            PropLink::End => unreachable!(),
        }
    }
    match literal {
        Some(lit) => prop::append_literal(t, lit),
        None => {
            if !prop::add_name_property(t, name) {
                return false;
            }
        }
    }
    if notify::any() {
        notify::dispatch(t, Notify::Rename { name });
    }
    true
}

/// The node's name, if any. Literal names come back as the exact `&str`
/// that was installed.
///
/// # Safety
/// As [`alloc`]. The returned borrow must not outlive the node or its
/// next rename.
pub unsafe fn name<'a>(ctx: *const u8) -> Option<&'a str> {
    let t = to_hdr(ctx);
    match prop::find_link(t, PropTag::Name)?.get() {
        PropLink::Literal(s) => Some(s),
        PropLink::Prop(p) => Some(prop::name_str(p.as_ptr() as *const Name)),
        PropLink::End => None,
    }
}

/// The embedded element count of an array allocation, or 0 when absent.
///
/// # Safety
/// As [`alloc`].
pub unsafe fn count(ctx: *const u8) -> usize {
    if ctx.is_null() {
        return 0;
    }
    let l = prop::find_prop(to_hdr(ctx), PropTag::Length) as *const Length;
    if l.is_null() {
        0
    } else {
        (*l).count
    }
}

/// First child of `root` (null for the implicit root), or null.
///
/// # Safety
/// As [`alloc`].
pub unsafe fn first(root: *const u8) -> *mut u8 {
    let c = first_child(to_hdr_or_root(root));
    if c.is_null() {
        std::ptr::null_mut()
    } else {
        from_hdr(c)
    }
}

/// Pre-order successor of `prev` within the subtree under `root`: first
/// child if any, else the next sibling, else the nearest ancestor's next
/// sibling; null once the walk returns to `root`.
///
/// # Safety
/// As [`alloc`]; `prev` must be inside `root`'s subtree.
pub unsafe fn next(root: *const u8, prev: *const u8) -> *mut u8 {
    let mut t = to_hdr(prev);

    let c = first_child(t);
    if !c.is_null() {
        return from_hdr(c);
    }

    let top = to_hdr_or_root(root);
    loop {
        let children = (*t).parent_children();
        let end = link::head_of(addr_of_mut!((*children).kids));
        let sibling = (*t).link.next;
        if sibling != end {
            return from_hdr(hdr_of(sibling));
        }
        t = (*children).owner;
        if t == top {
            break;
        }
    }
    std::ptr::null_mut()
}

/// The node's parent context, or null when it sits under the implicit
/// root.
///
/// # Safety
/// As [`alloc`].
pub unsafe fn parent(ctx: *const u8) -> *mut u8 {
    if ctx.is_null() {
        return std::ptr::null_mut();
    }
    let t = to_hdr(ctx);
    let p = (*(*t).parent_children()).owner;
    if p == root_hdr() {
        std::ptr::null_mut()
    } else {
        from_hdr(p)
    }
}

/// Resize `*ctxp` to `count` elements of `size` bytes. The buffer may
/// move: sibling links and the children collection's back-pointer are
/// repaired, `*ctxp` is rewritten, and a `MOVE` notification carries the
/// old user pointer. `RESIZE` fires in every successful call. An embedded
/// element count is relocated to the new tail and set to `count`.
///
/// # Safety
/// As [`alloc`]. On relocation every other pointer to the old payload is
/// invalidated.
pub unsafe fn resize(ctxp: *mut *mut u8, size: usize, count: usize) -> bool {
    let old_user = *ctxp;
    let old_t = to_hdr(old_user);

    let mut size = size;
    if !adjust_size(&mut size, count) {
        return false;
    }

    // The length record lives inside the buffer about to be reallocated;
    // capture its chain position and continuation link on the stack first
    // (a shrink may cut the tail off before it could be read back).
    enum LenAt {
        Absent,
        Head,
        After(*mut PropHdr),
    }
    let mut len_at = LenAt::Absent;
    let mut len_next = PropLink::End;
    {
        let mut at = prop::LinkAt::Head(old_t);
        while let PropLink::Prop(p) = at.get() {
            let record = p.as_ptr();
            if (*record).tag == PropTag::Length {
                len_at = match at {
                    prop::LinkAt::Head(_) => LenAt::Head,
                    prop::LinkAt::After(prev) => LenAt::After(prev),
                };
                len_next = (*record).next;
                break;
            }
            at = prop::LinkAt::After(record);
        }
    }
    let extra = if matches!(len_at, LenAt::Absent) {
        0
    } else {
        extra_for_length(size)
    };

    let t = backend::reallocate(old_t as *mut u8, size_of::<Hdr>() + size + extra) as *mut Hdr;
    if t.is_null() {
        return false;
    }

    match len_at {
        LenAt::Absent => {}
        len_at => {
            let lp = length_at(from_hdr(t), size);
            (*lp).hdr.tag = PropTag::Length;
            (*lp).hdr.next = len_next;
            (*lp).count = count;
            let spliced = PropLink::Prop(NonNull::new_unchecked(lp as *mut PropHdr));
            match len_at {
                // The head slot moved with the header: write through the
                // new header, not the captured location.
                LenAt::Head => (*t).prop = spliced,
                LenAt::After(prev) => (*prev).next = spliced,
                LenAt::Absent => unreachable!(),
            }
        }
    }

    if t != old_t {
        link::relink(addr_of_mut!((*t).link));
        let children = prop::find_prop(t, PropTag::Children) as *mut Children;
        if !children.is_null() {
            debug_assert!(std::ptr::eq((*children).owner, old_t));
            (*children).owner = t;
        }
        *ctxp = from_hdr(t);
        if notify::any() {
            notify::dispatch(t, Notify::Move { old: old_user });
        }
    }
    if notify::any() {
        notify::dispatch(t, Notify::Resize { new_size: size });
    }
    true
}

/// Grow the counted array `*ctxp` by `count` elements copied from `src`.
/// Consults the taken-pointer layer: a taken `src` is freed whether or not
/// the operation succeeds.
///
/// # Safety
/// As [`resize`]. `*ctxp` must carry an embedded element count, `src` must
/// be readable for `size * count` bytes and must not point into the buffer
/// being grown.
pub unsafe fn expand(ctxp: *mut *mut u8, src: *const u8, size: usize, count: usize) -> bool {
    let l = prop::find_prop(to_hdr(*ctxp), PropTag::Length) as *const Length;
    assert!(!l.is_null(), "expand requires a counted array allocation");
    let old_count = (*l).count;

    let mut ok = false;
    if let Some(total) = old_count.checked_add(count) {
        let start = *ctxp as *const u8;
        assert!(src < start || src >= start.add(size * old_count));

        if resize(ctxp, size, total) {
            std::ptr::copy_nonoverlapping(src, (*ctxp).add(size * old_count), size * count);
            ok = true;
        }
    } else {
        backend::error("expand size overflow");
    }

    if backend::is_taken(src) {
        free(src);
    }
    ok
}

/// Byte-level duplication: a new array of `n + extra` elements under
/// `ctx`, with the first `n` copied from `src`. A taken `src` is not
/// copied at all: its buffer is resized and stolen to `ctx`, or freed on
/// failure.
///
/// # Safety
/// As [`alloc`]. A non-taken `src` must be readable for `size * n` bytes.
pub unsafe fn dup(
    ctx: *const u8,
    src: *const u8,
    size: usize,
    n: usize,
    extra: usize,
    add_count: bool,
    label: Option<&'static str>,
) -> *mut u8 {
    let mut nbytes = size;
    if !adjust_size(&mut nbytes, n) {
        if backend::is_taken(src) {
            free(src);
        }
        return std::ptr::null_mut();
    }
    if n.checked_add(extra).is_none() {
        backend::error("dup size overflow");
        if backend::is_taken(src) {
            free(src);
        }
        return std::ptr::null_mut();
    }

    if backend::is_taken(src) {
        if src.is_null() {
            return std::ptr::null_mut();
        }
        let mut moved = src as *mut u8;
        if !resize(&mut moved, size, n + extra) {
            return free(moved);
        }
        if steal(ctx, moved).is_null() {
            return free(moved);
        }
        return moved;
    }

    let ret = alloc_arr(ctx, size, n + extra, false, add_count, label);
    if !ret.is_null() {
        std::ptr::copy_nonoverlapping(src, ret, nbytes);
    }
    ret
}

/// Free every tree still parented to the implicit root, then let the
/// taken-pointer layer clean up. Call once when the program is done with
/// the allocator so leak detectors see nothing retained.
///
/// # Safety
/// No pointer produced by this allocator may be used afterwards.
pub unsafe fn shutdown() {
    let root = root_hdr();
    loop {
        let c = first_child(root);
        if c.is_null() {
            break;
        }
        free(from_hdr(c));
    }
    backend::taken_cleanup();
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::ptr;
    use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};
    use std::sync::{Mutex, MutexGuard};

    // The sentinel root and the notifier counter are process-wide; tests
    // that touch them serialize here.
    static LOCK: Mutex<()> = Mutex::new(());

    fn lock() -> MutexGuard<'static, ()> {
        LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[test]
    fn header_leaves_the_tail_record_aligned() {
        assert_eq!(size_of::<Hdr>() % mem::align_of::<Length>(), 0);
    }

    #[test]
    fn alloc_clears_and_parents() {
        let _g = lock();
        unsafe {
            let p = alloc(ptr::null(), 32, true, None);
            assert!(!p.is_null());
            for i in 0..32 {
                assert_eq!(*p.add(i), 0);
            }
            assert!(parent(p).is_null());

            let c = alloc(p, 8, false, None);
            assert_eq!(parent(c), p);
            assert_eq!(first(p), c);

            free(p);
            assert!(first(ptr::null()).is_null());
        }
    }

    #[test]
    fn label_is_the_name() {
        let _g = lock();
        unsafe {
            let label = "widget";
            let p = alloc(ptr::null(), 8, false, Some(label));
            let n = name(p).unwrap();
            assert!(std::ptr::eq(n.as_ptr(), label.as_ptr()));
            free(p);
        }
    }

    #[test]
    fn literal_and_copied_names() {
        let _g = lock();
        unsafe {
            let p = alloc(ptr::null(), 8, false, None);
            assert!(name(p).is_none());

            let lit = "fixed";
            assert!(set_name_literal(p, lit));
            let got = name(p).unwrap();
            assert!(std::ptr::eq(got.as_ptr(), lit.as_ptr()));

            assert!(set_name(p, "copied"));
            let got = name(p).unwrap();
            assert_eq!(got, "copied");
            assert!(!std::ptr::eq(got.as_ptr(), "copied".as_ptr()));

            // And back to a literal, dropping the heap copy.
            assert!(set_name_literal(p, lit));
            assert!(std::ptr::eq(name(p).unwrap().as_ptr(), lit.as_ptr()));

            free(p);
        }
    }

    #[test]
    fn empty_literal_falls_back_to_copy() {
        let _g = lock();
        unsafe {
            let p = alloc(ptr::null(), 8, false, None);
            assert!(set_name_literal(p, ""));
            assert_eq!(name(p), Some(""));
            free(p);
        }
    }

    #[test]
    fn embedded_count_tracks_resize() {
        let _g = lock();
        unsafe {
            let mut arr = alloc_arr(ptr::null(), size_of::<u32>(), 10, true, true, None);
            assert_eq!(count(arr), 10);

            assert!(resize(&mut arr, size_of::<u32>(), 20));
            assert_eq!(count(arr), 20);

            assert!(resize(&mut arr, size_of::<u32>(), 3));
            assert_eq!(count(arr), 3);

            free(arr);
        }
    }

    #[test]
    fn resize_preserves_payload_and_siblings() {
        let _g = lock();
        unsafe {
            let parent_ctx = alloc(ptr::null(), 8, false, None);
            let before = alloc(parent_ctx, 8, false, None);
            let mut target = alloc_arr(parent_ctx, 1, 16, true, true, None);
            let after = alloc(parent_ctx, 8, false, None);

            for i in 0..16 {
                *target.add(i) = i as u8;
            }
            assert!(resize(&mut target, 1, 4096));
            for i in 0..16 {
                assert_eq!(*target.add(i), i as u8);
            }

            // Sibling order under the parent survives any relocation.
            let kids: Vec<*mut u8> = walk(parent_ctx);
            assert_eq!(kids, vec![after, target, before]);
            assert!(check(ptr::null(), None));

            free(parent_ctx);
        }
    }

    #[test]
    fn steal_reparents_and_keeps_descendants() {
        let _g = lock();
        unsafe {
            let p = alloc(ptr::null(), 8, false, None);
            let q = alloc(ptr::null(), 8, false, None);
            let r = alloc(p, 4, false, None);
            let leaf = alloc(r, 4, false, None);

            assert_eq!(steal(q, r), r);
            assert_eq!(parent(r), q);
            assert_eq!(parent(leaf), r);
            assert!(first(p).is_null());
            assert!(check(ptr::null(), None));

            // p no longer owns r: freeing p leaves r alive.
            free(p);
            assert_eq!(parent(r), q);
            assert_eq!(count(leaf), 0);

            free(q);
        }
    }

    #[test]
    fn preorder_traversal_order() {
        let _g = lock();
        unsafe {
            let a = alloc(ptr::null(), 8, false, None);
            let b = alloc(a, 8, false, None);
            let c = alloc(a, 8, false, None);
            let d = alloc(b, 8, false, None);

            // Children sit in reverse insertion order, depth first.
            assert_eq!(walk(a), vec![c, b, d]);
            free(a);
        }
    }

    unsafe fn walk(root: *mut u8) -> Vec<*mut u8> {
        let mut out = Vec::new();
        let mut it = first(root);
        while !it.is_null() {
            out.push(it);
            it = next(root, it);
        }
        out
    }

    static DESTROYED: AtomicUsize = AtomicUsize::new(0);

    fn counting_destructor(_ctx: *mut u8) {
        DESTROYED.fetch_add(1, Relaxed);
    }

    #[test]
    fn destructors_run_once_per_node() {
        let _g = lock();
        unsafe {
            DESTROYED.store(0, Relaxed);
            let a = alloc(ptr::null(), 8, false, None);
            let b = alloc(a, 8, false, None);
            assert!(add_destructor(a, counting_destructor));
            assert!(add_destructor(b, counting_destructor));

            free(a);
            assert_eq!(DESTROYED.load(Relaxed), 2);
        }
    }

    #[test]
    fn removing_a_destructor_silences_it() {
        let _g = lock();
        unsafe {
            DESTROYED.store(0, Relaxed);
            let a = alloc(ptr::null(), 8, false, None);
            assert!(add_destructor(a, counting_destructor));
            assert!(del_destructor(a, counting_destructor));
            assert!(!del_destructor(a, counting_destructor));

            free(a);
            assert_eq!(DESTROYED.load(Relaxed), 0);
        }
    }

    static ANCESTOR: AtomicUsize = AtomicUsize::new(0);

    fn free_the_ancestor(_ctx: *mut u8) {
        let ancestor = ANCESTOR.load(Relaxed) as *mut u8;
        unsafe {
            free(ancestor);
        }
        DESTROYED.fetch_add(1, Relaxed);
    }

    #[test]
    fn destructor_freeing_its_ancestor_terminates() {
        let _g = lock();
        unsafe {
            DESTROYED.store(0, Relaxed);
            let a = alloc(ptr::null(), 8, false, None);
            let b = alloc(a, 8, false, None);
            ANCESTOR.store(a as usize, Relaxed);
            assert!(add_destructor(b, free_the_ancestor));

            // The nested free(a) hits the destroying flag and backs out.
            free(a);
            assert_eq!(DESTROYED.load(Relaxed), 1);
        }
    }

    static SEEN: Mutex<Vec<u32>> = Mutex::new(Vec::new());

    fn recording_notifier(_ctx: *mut u8, notice: Notify) {
        SEEN.lock().unwrap().push(notice.event().bits());
    }

    #[test]
    fn notifier_counter_counts_only_non_free_masks() {
        let _g = lock();
        unsafe {
            let base = notify::outstanding();
            let a = alloc(ptr::null(), 8, false, None);

            assert!(add_destructor(a, counting_destructor));
            assert_eq!(notify::outstanding(), base);

            assert!(add_notifier(a, Events::FREE, recording_notifier));
            assert_eq!(notify::outstanding(), base);

            assert!(add_notifier(a, Events::STEAL | Events::RENAME, recording_notifier));
            assert_eq!(notify::outstanding(), base + 1);

            assert!(del_notifier(a, recording_notifier));
            // The first match is the most recent installation.
            assert_eq!(notify::outstanding(), base);

            assert!(add_notifier(a, Events::RESIZE, recording_notifier));
            assert_eq!(notify::outstanding(), base + 1);

            // Freeing the node retires its notifiers too.
            free(a);
            assert_eq!(notify::outstanding(), base);

            SEEN.lock().unwrap().clear();
            DESTROYED.store(0, Relaxed);
        }
    }

    #[test]
    fn notifier_sees_rename_and_steal() {
        let _g = lock();
        unsafe {
            SEEN.lock().unwrap().clear();
            let a = alloc(ptr::null(), 8, false, None);
            let b = alloc(ptr::null(), 8, false, None);
            assert!(add_notifier(
                a,
                Events::STEAL | Events::RENAME,
                recording_notifier
            ));

            assert!(set_name(a, "renamed"));
            assert_eq!(steal(b, a), a);

            let seen = SEEN.lock().unwrap().clone();
            assert_eq!(seen, vec![Events::RENAME.bits(), Events::STEAL.bits()]);

            // b owns a now; one free tears both down.
            free(b);
            SEEN.lock().unwrap().clear();
        }
    }

    #[test]
    fn new_notifier_misses_its_own_installation() {
        let _g = lock();
        unsafe {
            SEEN.lock().unwrap().clear();
            let a = alloc(ptr::null(), 8, false, None);

            assert!(add_notifier(a, Events::ADD_NOTIFIER, recording_notifier));
            // Installing itself produced nothing.
            assert!(SEEN.lock().unwrap().is_empty());

            assert!(add_notifier(a, Events::RENAME, recording_notifier));
            // ...but the second installation was observed by the first.
            assert_eq!(
                SEEN.lock().unwrap().clone(),
                vec![Events::ADD_NOTIFIER.bits()]
            );

            free(a);
            SEEN.lock().unwrap().clear();
        }
    }

    #[derive(Clone, Debug)]
    enum Op {
        Alloc(u8),
        AllocArr(u8, u8),
        Free(u8),
        Steal(u8, u8),
        Resize(u8, u8),
        Rename(u8),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            any::<u8>().prop_map(Op::Alloc),
            (any::<u8>(), any::<u8>()).prop_map(|(p, n)| Op::AllocArr(p, n)),
            any::<u8>().prop_map(Op::Free),
            (any::<u8>(), any::<u8>()).prop_map(|(t, p)| Op::Steal(t, p)),
            (any::<u8>(), any::<u8>()).prop_map(|(t, n)| Op::Resize(t, n)),
            any::<u8>().prop_map(Op::Rename),
        ]
    }

    struct Slot {
        ptr: *mut u8,
        parent: Option<usize>,
        live: bool,
        counted: bool,
    }

    fn live_indices(slots: &[Slot]) -> Vec<usize> {
        slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.live)
            .map(|(i, _)| i)
            .collect()
    }

    fn is_within(slots: &[Slot], ancestor: usize, mut idx: usize) -> bool {
        loop {
            if idx == ancestor {
                return true;
            }
            match slots[idx].parent {
                Some(up) => idx = up,
                None => return false,
            }
        }
    }

    fn kill_subtree(slots: &mut [Slot], root: usize) {
        slots[root].live = false;
        loop {
            let mut changed = false;
            for i in 0..slots.len() {
                if slots[i].live {
                    if let Some(up) = slots[i].parent {
                        if !slots[up].live {
                            slots[i].live = false;
                            changed = true;
                        }
                    }
                }
            }
            if !changed {
                break;
            }
        }
    }

    // Tears the shared root down even when an assertion bails out of a
    // proptest case early.
    struct Sweep;

    impl Drop for Sweep {
        fn drop(&mut self) {
            unsafe {
                shutdown();
            }
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]
        #[test]
        fn randomized_operations_keep_the_tree_consistent(
            ops in proptest::prelude::prop::collection::vec(op_strategy(), 1..48)
        ) {
            let _g = lock();
            unsafe {
                let _sweep = Sweep;
                let mut slots: Vec<Slot> = Vec::new();

                for op in ops {
                    match op {
                        Op::Alloc(sel) => {
                            let live = live_indices(&slots);
                            let pick = sel as usize % (live.len() + 1);
                            let parent_idx = if pick == 0 { None } else { Some(live[pick - 1]) };
                            let pptr = parent_idx
                                .map(|i| slots[i].ptr as *const u8)
                                .unwrap_or(ptr::null());
                            let ptr = alloc(pptr, 16, false, None);
                            prop_assert!(!ptr.is_null());
                            slots.push(Slot { ptr, parent: parent_idx, live: true, counted: false });
                        }
                        Op::AllocArr(sel, n) => {
                            let live = live_indices(&slots);
                            let pick = sel as usize % (live.len() + 1);
                            let parent_idx = if pick == 0 { None } else { Some(live[pick - 1]) };
                            let pptr = parent_idx
                                .map(|i| slots[i].ptr as *const u8)
                                .unwrap_or(ptr::null());
                            let n = n as usize % 13 + 1;
                            let ptr = alloc_arr(pptr, 4, n, true, true, None);
                            prop_assert!(!ptr.is_null());
                            prop_assert_eq!(count(ptr), n);
                            slots.push(Slot { ptr, parent: parent_idx, live: true, counted: true });
                        }
                        Op::Free(sel) => {
                            let live = live_indices(&slots);
                            if live.is_empty() {
                                continue;
                            }
                            let idx = live[sel as usize % live.len()];
                            free(slots[idx].ptr);
                            kill_subtree(&mut slots, idx);
                        }
                        Op::Steal(tsel, psel) => {
                            let live = live_indices(&slots);
                            if live.is_empty() {
                                continue;
                            }
                            let target = live[tsel as usize % live.len()];
                            let pick = psel as usize % (live.len() + 1);
                            let parent_idx = if pick == 0 { None } else { Some(live[pick - 1]) };
                            if parent_idx.map_or(false, |p| is_within(&slots, target, p)) {
                                continue;
                            }
                            let pptr = parent_idx
                                .map(|i| slots[i].ptr as *const u8)
                                .unwrap_or(ptr::null());
                            prop_assert_eq!(steal(pptr, slots[target].ptr), slots[target].ptr);
                            slots[target].parent = parent_idx;
                        }
                        Op::Resize(sel, n) => {
                            let counted: Vec<usize> = live_indices(&slots)
                                .into_iter()
                                .filter(|&i| slots[i].counted)
                                .collect();
                            if counted.is_empty() {
                                continue;
                            }
                            let idx = counted[sel as usize % counted.len()];
                            let n = n as usize % 29 + 1;
                            let mut ptr = slots[idx].ptr;
                            prop_assert!(resize(&mut ptr, 4, n));
                            slots[idx].ptr = ptr;
                            prop_assert_eq!(count(ptr), n);
                        }
                        Op::Rename(sel) => {
                            let live = live_indices(&slots);
                            if live.is_empty() {
                                continue;
                            }
                            let idx = live[sel as usize % live.len()];
                            if sel % 2 == 0 {
                                prop_assert!(set_name(slots[idx].ptr, "node"));
                            } else {
                                prop_assert!(set_name_literal(slots[idx].ptr, "fixed"));
                            }
                            prop_assert!(name(slots[idx].ptr).is_some());
                        }
                    }
                    prop_assert!(check(ptr::null(), None));
                }

                // Everything the model believes is live is reachable from
                // the root, and nothing else is.
                let reachable: HashSet<usize> = {
                    let mut out = HashSet::new();
                    let mut it = first(ptr::null());
                    while !it.is_null() {
                        out.insert(it as usize);
                        it = next(ptr::null(), it);
                    }
                    out
                };
                let live: HashSet<usize> = slots
                    .iter()
                    .filter(|s| s.live)
                    .map(|s| s.ptr as usize)
                    .collect();
                prop_assert_eq!(reachable, live);
            }
        }
    }
}
