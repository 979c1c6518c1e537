//! Ownership handles for heap resources.
//!
//! [`Unique`] is a move-only sole owner. [`Shared`] and [`Weak`] count
//! owners and observers in an atomic control block, so they can be cloned and
//! dropped from any thread. Only the counts are synchronized; the resource
//! itself needs its own locking if several threads mutate it.

mod block;
mod deleter;
mod error;
mod shared;
mod unique;
mod weak;

use std::ptr::NonNull;

pub use deleter::{DefaultDelete, Deleter};
pub use error::Error;
pub use shared::Shared;
pub use unique::Unique;
pub use weak::Weak;

/// Address without metadata, null for an empty handle.
fn address<T: ?Sized>(ptr: Option<NonNull<T>>) -> *const () {
    ptr.map_or(std::ptr::null(), |p| p.as_ptr().cast::<()>().cast_const())
}

#[cfg(test)]
fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}
