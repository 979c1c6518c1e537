use std::fmt;
use std::marker::PhantomData;
use std::mem;

use crate::block::ControlBlock;
use crate::shared::{Parts, Shared};

/// Non-owning observer of a [`Shared`] resource.
///
/// A `Weak` keeps the control block alive but not the resource. The only way
/// to reach the resource through it is [`Weak::lock`] (or [`Weak::upgrade`]),
/// which yields a new owner if the resource still exists. Hold a `Weak` on one
/// side of a reference cycle to let the cycle be freed.
pub struct Weak<T: ?Sized> {
    parts: Option<Parts<T>>,
    _marker: PhantomData<T>,
}

unsafe impl<T: ?Sized + Send + Sync> Send for Weak<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for Weak<T> {}

impl<T: ?Sized> Weak<T> {
    /// A handle observing nothing. It is always expired.
    pub fn new() -> Self {
        Self {
            parts: None,
            _marker: PhantomData,
        }
    }

    pub(crate) fn from_parts(parts: Parts<T>) -> Self {
        Self {
            parts: Some(parts),
            _marker: PhantomData,
        }
    }

    fn block(&self) -> Option<&ControlBlock> {
        self.parts.map(|p| unsafe { &*p.block.as_ptr() })
    }

    pub fn use_count(&self) -> usize {
        self.block().map_or(0, ControlBlock::strong_count)
    }

    pub fn weak_count(&self) -> usize {
        self.block().map_or(0, ControlBlock::weak_count)
    }

    pub fn expired(&self) -> bool {
        self.use_count() == 0
    }

    pub fn upgrade(&self) -> Option<Shared<T>> {
        let parts = self.parts?;
        if !self.block()?.try_promote() {
            return None;
        }
        Some(Shared::from_parts(parts))
    }

    /// A new owner of the observed resource, or an empty [`Shared`] if it is
    /// already gone.
    pub fn lock(&self) -> Shared<T> {
        self.upgrade().unwrap_or_default()
    }

    pub fn take(&mut self) -> Self {
        mem::take(self)
    }

    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        match (this.parts, other.parts) {
            (Some(a), Some(b)) => {
                a.block == b.block && crate::address(Some(a.ptr)) == crate::address(Some(b.ptr))
            }
            (None, None) => true,
            _ => false,
        }
    }
}

impl<T: ?Sized> Clone for Weak<T> {
    fn clone(&self) -> Self {
        if let Some(block) = self.block() {
            block.increment_weak();
        }
        Self {
            parts: self.parts,
            _marker: PhantomData,
        }
    }

    fn clone_from(&mut self, source: &Self) {
        if Self::ptr_eq(self, source) {
            return;
        }
        *self = source.clone();
    }
}

impl<T: ?Sized> Drop for Weak<T> {
    fn drop(&mut self) {
        if let Some(parts) = self.parts.take() {
            unsafe { ControlBlock::release_weak(parts.block) };
        }
    }
}

impl<T: ?Sized> Default for Weak<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> From<&Shared<T>> for Weak<T> {
    fn from(value: &Shared<T>) -> Self {
        Shared::downgrade(value)
    }
}

impl<T: ?Sized> fmt::Debug for Weak<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(Weak)")
    }
}
