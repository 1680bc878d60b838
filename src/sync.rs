// Conditional compilation for using loom.
#[cfg(loom)]
pub(crate) use loom::sync::{
    atomic::{fence, AtomicPtr, AtomicU64, AtomicU8, Ordering},
    Arc, Mutex,
};

#[cfg(not(loom))]
pub(crate) use std::sync::{
    atomic::{fence, AtomicPtr, AtomicU64, AtomicU8, Ordering},
    Arc, Mutex,
};
