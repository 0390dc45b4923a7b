//! Lifecycle notifications.
//!
//! A notifier subscribes a callback to a mask of events on one node.
//! Destructors are the degenerate form: a one-argument callback subscribed
//! to [`Events::FREE`]. A process-wide count of notifiers whose mask is
//! anything other than exactly `FREE` lets the mutating operations skip
//! dispatch entirely in the common no-subscribers case.

use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};

use bitflags::bitflags;

use super::prop::{PropLink, PropTag, Notifier};
use super::{from_hdr, Hdr};

bitflags! {
    /// Lifecycle events a notifier can subscribe to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Events: u32 {
        const FREE = 1 << 0;
        const STEAL = 1 << 1;
        const MOVE = 1 << 2;
        const RESIZE = 1 << 3;
        const RENAME = 1 << 4;
        const ADD_CHILD = 1 << 5;
        const DEL_CHILD = 1 << 6;
        const ADD_NOTIFIER = 1 << 7;
        const DEL_NOTIFIER = 1 << 8;
    }
}

/// General notification callback: the node's user pointer plus the event
/// and its payload.
pub type NotifyFn = for<'a> unsafe fn(*mut u8, Notify<'a>);

/// Destructor callback: just the dying node's user pointer.
pub type DestroyFn = unsafe fn(*mut u8);

/// The two callback shapes a notifier can carry.
#[derive(Debug, Clone, Copy)]
pub enum Callback {
    Notify(NotifyFn),
    Destroy(DestroyFn),
}

impl PartialEq for Callback {
    fn eq(&self, other: &Self) -> bool {
        // Identity, not behavior: removal matches the registered callback.
        match (self, other) {
            (Callback::Notify(a), Callback::Notify(b)) => *a as usize == *b as usize,
            (Callback::Destroy(a), Callback::Destroy(b)) => *a as usize == *b as usize,
            _ => false,
        }
    }
}

impl Eq for Callback {}

/// An event together with its event-specific payload.
#[derive(Clone, Copy)]
pub enum Notify<'a> {
    /// The node is being freed. `orig` is the user pointer whose `free`
    /// call initiated the cascade, so notifiers on ancestors can tell
    /// which call is tearing them down.
    Free { orig: *mut u8 },
    /// The node was reparented; the payload is the new parent context
    /// (null for the implicit root).
    Steal { new_parent: *mut u8 },
    /// A resize relocated the node; the payload is the old user pointer.
    Move { old: *mut u8 },
    /// The node's payload was resized to `new_size` bytes.
    Resize { new_size: usize },
    /// The node was renamed.
    Rename { name: &'a str },
    /// A child was allocated under / freed from under the node.
    AddChild { child: *mut u8 },
    DelChild { child: *mut u8 },
    /// A notifier was installed on / removed from the node.
    AddNotifier { callback: Callback },
    DelNotifier { callback: Callback },
}

impl Notify<'_> {
    pub fn event(&self) -> Events {
        match self {
            Notify::Free { .. } => Events::FREE,
            Notify::Steal { .. } => Events::STEAL,
            Notify::Move { .. } => Events::MOVE,
            Notify::Resize { .. } => Events::RESIZE,
            Notify::Rename { .. } => Events::RENAME,
            Notify::AddChild { .. } => Events::ADD_CHILD,
            Notify::DelChild { .. } => Events::DEL_CHILD,
            Notify::AddNotifier { .. } => Events::ADD_NOTIFIER,
            Notify::DelNotifier { .. } => Events::DEL_NOTIFIER,
        }
    }
}

// Count of live notifiers subscribed to anything beyond exactly FREE.
// Often stays zero.
static OUTSTANDING: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn any() -> bool {
    OUTSTANDING.load(Relaxed) != 0
}

#[cfg(test)]
pub(crate) fn outstanding() -> usize {
    OUTSTANDING.load(Relaxed)
}

pub(crate) fn subscribed(types: Events) {
    if types != Events::FREE {
        OUTSTANDING.fetch_add(1, Relaxed);
    }
}

pub(crate) fn unsubscribed(types: Events) {
    if types != Events::FREE {
        OUTSTANDING.fetch_sub(1, Relaxed);
    }
}

/// Run every notifier on `t` whose mask covers the event, in chain order
/// (reverse installation order). Destructor-form callbacks get the node's
/// own user pointer; general callbacks additionally get the payload.
pub(crate) unsafe fn dispatch(t: *mut Hdr, notice: Notify) {
    let event = notice.event();
    let mut link = (*t).prop;
    while let PropLink::Prop(p) = link {
        let record = p.as_ptr();
        // Read ahead: the callback may remove its own record.
        link = (*record).next;
        if (*record).tag != PropTag::Notifier {
            continue;
        }
        let n = record as *mut Notifier;
        if (*n).types.intersects(event) {
            match (*n).cb {
                Callback::Destroy(destroy) => destroy(from_hdr(t)),
                Callback::Notify(notify) => notify(from_hdr(t), notice),
            }
        }
    }
}
