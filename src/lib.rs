#![doc = include_str!("../README.md")]

pub mod backend;
pub mod tree;

pub use backend::{set_backend, set_taken_ops, TakenOps};
pub use tree::notify::{Callback, DestroyFn, Events, Notify, NotifyFn};
pub use tree::{
    add_destructor, add_notifier, alloc, alloc_arr, check, count, del_destructor, del_notifier,
    dump, dup, expand, first, free, name, next, parent, resize, set_name, set_name_literal,
    shutdown, steal,
};
