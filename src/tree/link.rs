//! Intrusive circular doubly-linked list threading siblings under one
//! parent. The list head lives inside the parent's children property; each
//! member node is embedded in an allocation header. Empty lists are
//! self-linked, so unlink and insert never branch on emptiness.

/// A member link. Embedded in whatever structure participates in a list.
#[repr(C)]
pub(crate) struct Node {
    pub next: *mut Node,
    pub prev: *mut Node,
}

/// A list head. `head.next` is the first member, `head.prev` the last;
/// both point back at `head` when the list is empty.
#[repr(C)]
pub(crate) struct List {
    pub head: Node,
}

/// Self-link `list` so it reads as empty.
pub(crate) unsafe fn init(list: *mut List) {
    let head = head_of(list);
    (*head).next = head;
    (*head).prev = head;
}

pub(crate) fn head_of(list: *mut List) -> *mut Node {
    unsafe { std::ptr::addr_of_mut!((*list).head) }
}

/// Insert `node` at the front of `list`.
pub(crate) unsafe fn add_head(list: *mut List, node: *mut Node) {
    let head = head_of(list);
    let first = (*head).next;
    (*node).next = first;
    (*node).prev = head;
    (*first).prev = node;
    (*head).next = node;
}

/// Unlink `node` from whatever list it is on. The node's own pointers are
/// left stale; re-running the unlink against unchanged neighbors is a
/// no-op, which the destruction path relies on.
pub(crate) unsafe fn del(node: *mut Node) {
    (*(*node).next).prev = (*node).prev;
    (*(*node).prev).next = (*node).next;
}

/// First member of `list`, or null when empty.
pub(crate) unsafe fn top(list: *mut List) -> *mut Node {
    let head = head_of(list);
    let first = (*head).next;
    if first == head {
        std::ptr::null_mut()
    } else {
        first
    }
}

/// Point `node`'s neighbors back at it after the memory holding `node`
/// has been relocated with its contents intact.
pub(crate) unsafe fn relink(node: *mut Node) {
    (*(*node).next).prev = node;
    (*(*node).prev).next = node;
}

/// Walk `list` verifying that every next/prev pair agrees. Returns false
/// on the first inconsistency.
pub(crate) unsafe fn consistent(list: *mut List) -> bool {
    let head = head_of(list);
    if (*(*head).next).prev != head || (*(*head).prev).next != head {
        return false;
    }
    let mut node = (*head).next;
    while node != head {
        if (*(*node).next).prev != node || (*(*node).prev).next != node {
            return false;
        }
        node = (*node).next;
    }
    true
}
