//! Debug-build tree validation and a human-readable dump.

use std::fmt::{self, Write};
use std::ptr::addr_of_mut;

use super::link;
use super::prop::{find_prop, name_str, Children, Length, Name, Notifier, PropLink, PropTag};
use super::{hdr_of, to_hdr_or_root, Hdr};

/// Walk the subtree under `ctx` (null for the implicit root) and verify
/// every structural invariant: headers and property records inside the
/// allocation window, parent back-references agreeing with the sibling
/// lists, at most one children/name/length property per node, no unknown
/// property tags, consistent sibling links.
///
/// With `errorstr`, the first violation is reported through the error hook
/// prefixed by it; without, the check is silent and only the return value
/// tells. Release builds skip the walk and report success.
///
/// # Safety
/// As [`crate::alloc`].
pub unsafe fn check(ctx: *const u8, errorstr: Option<&str>) -> bool {
    check_impl(ctx, errorstr)
}

#[cfg(debug_assertions)]
unsafe fn check_impl(ctx: *const u8, errorstr: Option<&str>) -> bool {
    let t = to_hdr_or_root(ctx);
    check_node((*t).parent_children(), t, errorstr)
}

#[cfg(not(debug_assertions))]
unsafe fn check_impl(_ctx: *const u8, _errorstr: Option<&str>) -> bool {
    true
}

#[cfg(debug_assertions)]
unsafe fn check_err(t: *mut Hdr, errorstr: Option<&str>, msg: &str) -> bool {
    if let Some(prefix) = errorstr {
        crate::backend::error(&format!("{prefix}:{:p} {msg}", super::from_hdr(t)));
    }
    false
}

#[cfg(debug_assertions)]
unsafe fn check_node(parent_child: *mut Children, t: *mut Hdr, errorstr: Option<&str>) -> bool {
    use super::in_bounds;

    if !in_bounds(t as usize) {
        return check_err(t, errorstr, "invalid pointer");
    }
    if (*t).parent_children() != parent_child {
        return check_err(t, errorstr, "incorrect parent");
    }

    let mut children: *mut Children = std::ptr::null_mut();
    let mut have_name = false;
    let mut have_length = false;

    let mut chain = (*t).prop;
    loop {
        match chain {
            PropLink::End => break,
            PropLink::Literal(_) => {
                if have_name {
                    return check_err(t, errorstr, "has two names");
                }
                break;
            }
            PropLink::Prop(p) => {
                let record = p.as_ptr();
                if !in_bounds(record as usize) {
                    return check_err(t, errorstr, "has bad property pointer");
                }
                // Raw bits, not the enum: a corrupt record may hold no
                // valid discriminant at all.
                match (record as *const u32).read() {
                    x if x == PropTag::Children as u32 => {
                        if !children.is_null() {
                            return check_err(t, errorstr, "has two child collections");
                        }
                        children = record as *mut Children;
                    }
                    x if x == PropTag::Name as u32 => {
                        if have_name {
                            return check_err(t, errorstr, "has two names");
                        }
                        have_name = true;
                    }
                    x if x == PropTag::Length as u32 => {
                        if have_length {
                            return check_err(t, errorstr, "has two lengths");
                        }
                        have_length = true;
                    }
                    x if x == PropTag::Notifier as u32 => {}
                    _ => return check_err(t, errorstr, "has unknown property"),
                }
                chain = (*record).next;
            }
        }
    }

    if !children.is_null() {
        if (*children).owner != t {
            return check_err(t, errorstr, "wrong owner on child collection");
        }
        if !link::consistent(addr_of_mut!((*children).kids)) {
            return check_err(t, errorstr, "corrupt sibling list");
        }
        let head = link::head_of(addr_of_mut!((*children).kids));
        let mut node = (*head).next;
        while node != head {
            if !check_node(children, hdr_of(node), errorstr) {
                return false;
            }
            node = (*node).next;
        }
    }
    true
}

/// Write a pre-order dump of the subtree under `ctx` (null for the
/// implicit root): one line per node with its header address and every
/// property.
///
/// # Safety
/// As [`crate::alloc`]; the subtree must be structurally sound.
pub unsafe fn dump(ctx: *const u8, out: &mut dyn Write) -> fmt::Result {
    dump_node(to_hdr_or_root(ctx), 0, out)
}

unsafe fn dump_node(t: *mut Hdr, depth: usize, out: &mut dyn Write) -> fmt::Result {
    for _ in 0..depth {
        out.write_str("  ")?;
    }
    write!(out, "{t:p}")?;

    let mut chain = (*t).prop;
    loop {
        match chain {
            PropLink::End => break,
            PropLink::Literal(s) => {
                write!(out, " {s:?}")?;
                break;
            }
            PropLink::Prop(p) => {
                let record = p.as_ptr();
                match (*record).tag {
                    PropTag::Children => {
                        let c = record as *mut Children;
                        write!(out, " children({record:p}) owner={:p}", (*c).owner)?;
                    }
                    PropTag::Name => {
                        let n = record as *const Name;
                        write!(out, " name({record:p}) {:?}", name_str(n))?;
                    }
                    PropTag::Notifier => {
                        let n = record as *const Notifier;
                        write!(out, " notifier({record:p}) mask={:?}", (*n).types)?;
                    }
                    PropTag::Length => {
                        let l = record as *const Length;
                        write!(out, " length({record:p}) count={}", (*l).count)?;
                    }
                }
                chain = (*record).next;
            }
        }
    }
    out.write_str("\n")?;

    let children = find_prop(t, PropTag::Children) as *mut Children;
    if !children.is_null() {
        let head = link::head_of(addr_of_mut!((*children).kids));
        let mut node = (*head).next;
        while node != head {
            dump_node(hdr_of(node), depth + 1, out)?;
            node = (*node).next;
        }
    }
    Ok(())
}
