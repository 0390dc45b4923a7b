//! Per-allocation metadata: a singly linked chain of tagged property
//! records hanging off the header.
//!
//! Records are heap structures sharing a leading [`PropHdr`] and are cast
//! by tag. The chain is threaded through [`PropLink`], whose third variant
//! holds a borrowed `'static` name in place of a record: a literal name is
//! therefore always the last element of a chain, by construction rather
//! than by convention.

use std::mem::size_of;
use std::ptr::{addr_of_mut, NonNull};

use crate::backend;

use super::link::{self, List};
use super::notify::{Callback, Events};
use super::Hdr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum PropTag {
    Children = 0x00c1_d500,
    Name = 0x0011_1100,
    Notifier = 0x0007_1f00,
    Length = 0x0051_5300,
}

/// One step of the property chain: the end, a real record, or a borrowed
/// literal name terminating the chain.
#[derive(Clone, Copy)]
pub(crate) enum PropLink {
    End,
    Prop(NonNull<PropHdr>),
    Literal(&'static str),
}

/// Common prefix of every heap property record.
#[repr(C)]
pub(crate) struct PropHdr {
    pub tag: PropTag,
    pub next: PropLink,
}

/// Children collection: the sibling-list head plus a back-pointer to the
/// header the collection belongs to.
#[repr(C)]
pub(crate) struct Children {
    pub hdr: PropHdr,
    pub owner: *mut Hdr,
    pub kids: List,
}

/// Heap-copied name; the bytes follow the struct in the same allocation.
#[repr(C)]
pub(crate) struct Name {
    pub hdr: PropHdr,
    pub len: usize,
}

/// Element count of an array allocation. The record is embedded in the
/// tail of the payload buffer and must never be released on its own.
#[repr(C)]
pub(crate) struct Length {
    pub hdr: PropHdr,
    pub count: usize,
}

/// A lifecycle-event subscription.
#[repr(C)]
pub(crate) struct Notifier {
    pub hdr: PropHdr,
    pub types: Events,
    pub cb: Callback,
}

/// A place holding a `PropLink`: either the chain head in a header or the
/// `next` slot of a record. Lets removal and splicing write back through
/// whichever link reached the target.
#[derive(Clone, Copy)]
pub(crate) enum LinkAt {
    Head(*mut Hdr),
    After(*mut PropHdr),
}

impl LinkAt {
    pub(crate) unsafe fn get(self) -> PropLink {
        match self {
            LinkAt::Head(t) => (*t).prop,
            LinkAt::After(p) => (*p).next,
        }
    }

    pub(crate) unsafe fn set(self, link: PropLink) {
        match self {
            LinkAt::Head(t) => (*t).prop = link,
            LinkAt::After(p) => (*p).next = link,
        }
    }
}

/// Find the first record tagged `tag`, or null. Literal names terminate
/// the walk and are not returned here (see [`find_link`] for name lookup).
pub(crate) unsafe fn find_prop(t: *const Hdr, tag: PropTag) -> *mut PropHdr {
    let mut link = (*t).prop;
    while let PropLink::Prop(p) = link {
        if (*p.as_ptr()).tag == tag {
            return p.as_ptr();
        }
        link = (*p.as_ptr()).next;
    }
    std::ptr::null_mut()
}

/// Find the link leading to the first record tagged `tag`. When searching
/// for a name, a terminating literal matches too.
pub(crate) unsafe fn find_link(t: *mut Hdr, tag: PropTag) -> Option<LinkAt> {
    let mut at = LinkAt::Head(t);
    loop {
        match at.get() {
            PropLink::End => return None,
            PropLink::Literal(_) => return (tag == PropTag::Name).then_some(at),
            PropLink::Prop(p) => {
                if (*p.as_ptr()).tag == tag {
                    return Some(at);
                }
                at = LinkAt::After(p.as_ptr());
            }
        }
    }
}

/// Stitch `record` onto the front of `t`'s chain with the given tag.
pub(crate) unsafe fn push(t: *mut Hdr, record: *mut PropHdr, tag: PropTag) {
    (*record).tag = tag;
    (*record).next = (*t).prop;
    (*t).prop = PropLink::Prop(NonNull::new_unchecked(record));
}

/// Put `name` at the chain terminus, replacing any literal already there.
/// The caller has removed any heap name first.
pub(crate) unsafe fn append_literal(t: *mut Hdr, name: &'static str) {
    let mut at = LinkAt::Head(t);
    loop {
        match at.get() {
            PropLink::Prop(p) => at = LinkAt::After(p.as_ptr()),
            _ => {
                at.set(PropLink::Literal(name));
                return;
            }
        }
    }
}

/// Create the children collection for `t`. Returns null on backend
/// failure.
pub(crate) unsafe fn add_children_property(t: *mut Hdr) -> *mut Children {
    let c = backend::allocate(size_of::<Children>()) as *mut Children;
    if c.is_null() {
        return c;
    }
    push(t, c as *mut PropHdr, PropTag::Children);
    (*c).owner = t;
    link::init(addr_of_mut!((*c).kids));
    c
}

/// Attach a heap copy of `name` to `t`.
pub(crate) unsafe fn add_name_property(t: *mut Hdr, name: &str) -> bool {
    let n = backend::allocate(size_of::<Name>() + name.len()) as *mut Name;
    if n.is_null() {
        return false;
    }
    push(t, n as *mut PropHdr, PropTag::Name);
    (*n).len = name.len();
    std::ptr::copy_nonoverlapping(name.as_ptr(), n.add(1) as *mut u8, name.len());
    true
}

/// View a heap name record's bytes. The lifetime is the caller's claim.
pub(crate) unsafe fn name_str<'a>(n: *const Name) -> &'a str {
    let bytes = std::slice::from_raw_parts(n.add(1) as *const u8, (*n).len);
    std::str::from_utf8_unchecked(bytes)
}

/// Attach a notifier record to `t`. Returns null on backend failure.
pub(crate) unsafe fn add_notifier_property(
    t: *mut Hdr,
    types: Events,
    cb: Callback,
) -> *mut Notifier {
    let n = backend::allocate(size_of::<Notifier>()) as *mut Notifier;
    if n.is_null() {
        return n;
    }
    push(t, n as *mut PropHdr, PropTag::Notifier);
    (*n).types = types;
    (*n).cb = cb;
    n
}

/// Unlink and release the first notifier whose callback matches `cb`,
/// returning its event mask.
pub(crate) unsafe fn del_callback(t: *mut Hdr, cb: Callback) -> Option<Events> {
    let mut at = LinkAt::Head(t);
    loop {
        match at.get() {
            PropLink::Prop(p) => {
                let record = p.as_ptr();
                if (*record).tag == PropTag::Notifier {
                    let n = record as *mut Notifier;
                    if (*n).cb == cb {
                        let types = (*n).types;
                        at.set((*record).next);
                        backend::release(record as *mut u8);
                        return Some(types);
                    }
                }
                at = LinkAt::After(record);
            }
            _ => return None,
        }
    }
}
