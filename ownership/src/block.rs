//! Reference-count bookkeeping shared by [`Shared`](crate::Shared) and
//! [`Weak`](crate::Weak).
//!
//! Every block starts with a [`ControlBlock`] header. What follows the header
//! depends on how the resource was adopted: [`PtrBlock`] points at a resource
//! allocated elsewhere and carries its deleter, [`InlineBlock`] stores the
//! value in the same allocation. Handles only ever see the header; the layout
//! specific work is reached through a static vtable.
//!
//! `weak` counts the weak handles plus one reference held collectively by all
//! strong handles. The last strong handle disposes of the resource and then
//! gives up that collective reference, so whichever decrement brings `weak`
//! to zero is the one that frees the block.

use std::alloc::{self, Layout};
use std::cell::UnsafeCell;
use std::mem::ManuallyDrop;
use std::ptr::{self, NonNull};
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::atomic::{fence, AtomicUsize};

use log::{debug, trace};

use crate::deleter::Deleter;
use crate::error::AllocFailure;

/// Counts above this abort the process instead of wrapping around.
pub(crate) const MAX_REFCOUNT: usize = isize::MAX as usize;

struct BlockVTable {
    dispose: unsafe fn(NonNull<ControlBlock>),
    deallocate: unsafe fn(NonNull<ControlBlock>),
}

#[repr(C)]
pub(crate) struct ControlBlock {
    strong: AtomicUsize,
    weak: AtomicUsize,
    vtable: &'static BlockVTable,
}

impl ControlBlock {
    fn new(vtable: &'static BlockVTable) -> Self {
        Self {
            strong: AtomicUsize::new(1),
            weak: AtomicUsize::new(1),
            vtable,
        }
    }

    pub(crate) fn strong_count(&self) -> usize {
        self.strong.load(Relaxed)
    }

    pub(crate) fn weak_count(&self) -> usize {
        let weak = self.weak.load(Relaxed);
        if weak == usize::MAX {
            // Locked by `is_unique`, which only succeeds without weak handles.
            return 0;
        }
        if self.strong.load(Relaxed) > 0 {
            weak - 1
        } else {
            weak
        }
    }

    pub(crate) fn increment_strong(&self) {
        if self.strong.fetch_add(1, Relaxed) > MAX_REFCOUNT {
            std::process::abort();
        }
    }

    /// Takes a new strong reference unless the resource is already gone.
    pub(crate) fn try_promote(&self) -> bool {
        let mut n = self.strong.load(Relaxed);
        loop {
            if n == 0 {
                return false;
            }
            if n > MAX_REFCOUNT {
                std::process::abort();
            }
            match self
                .strong
                .compare_exchange_weak(n, n + 1, Acquire, Relaxed)
            {
                Ok(_) => return true,
                Err(e) => n = e,
            }
        }
    }

    /// Adds a weak reference on behalf of a strong handle.
    pub(crate) fn downgrade(&self) {
        let mut n = self.weak.load(Relaxed);
        loop {
            if n == usize::MAX {
                std::hint::spin_loop();
                n = self.weak.load(Relaxed);
                continue;
            }
            if n > MAX_REFCOUNT {
                std::process::abort();
            }
            match self
                .weak
                .compare_exchange_weak(n, n + 1, Acquire, Relaxed)
            {
                Ok(_) => return,
                Err(e) => n = e,
            }
        }
    }

    /// Adds a weak reference on behalf of an existing weak handle. While one
    /// exists `is_unique` cannot hold the lock, so no spinning is needed.
    pub(crate) fn increment_weak(&self) {
        if self.weak.fetch_add(1, Relaxed) > MAX_REFCOUNT {
            std::process::abort();
        }
    }

    /// True when the caller's strong handle is the only handle of any kind.
    pub(crate) fn is_unique(&self) -> bool {
        if self
            .weak
            .compare_exchange(1, usize::MAX, Acquire, Relaxed)
            .is_err()
        {
            return false;
        }
        let is_unique = self.strong.load(Relaxed) == 1;
        self.weak.store(1, Release);
        if is_unique {
            fence(Acquire);
        }
        is_unique
    }

    /// # Safety
    ///
    /// The caller must own one strong reference to `block` and give it up.
    pub(crate) unsafe fn release_strong(block: NonNull<ControlBlock>) {
        if block.as_ref().strong.fetch_sub(1, Release) != 1 {
            return;
        }
        fence(Acquire);
        trace!("disposing resource of control block {:p}", block);
        let dispose = block.as_ref().vtable.dispose;
        dispose(block);
        Self::release_weak(block);
    }

    /// # Safety
    ///
    /// The caller must own one weak reference to `block` and give it up.
    pub(crate) unsafe fn release_weak(block: NonNull<ControlBlock>) {
        if block.as_ref().weak.fetch_sub(1, Release) != 1 {
            return;
        }
        fence(Acquire);
        trace!("freeing control block {:p}", block);
        let deallocate = block.as_ref().vtable.deallocate;
        deallocate(block);
    }
}

/// Header followed by a pointer to a separately allocated resource.
#[repr(C)]
struct PtrBlock<T: ?Sized, D> {
    header: ControlBlock,
    resource: NonNull<T>,
    deleter: ManuallyDrop<D>,
}

impl<T: ?Sized, D: Deleter<T>> PtrBlock<T, D> {
    const VTABLE: &'static BlockVTable = &BlockVTable {
        dispose: Self::dispose,
        deallocate: Self::deallocate,
    };

    unsafe fn dispose(block: NonNull<ControlBlock>) {
        let this = block.cast::<Self>().as_ptr();
        let mut deleter = ManuallyDrop::take(&mut (*this).deleter);
        deleter.delete((*this).resource);
    }

    unsafe fn deallocate(block: NonNull<ControlBlock>) {
        drop(Box::from_raw(block.cast::<Self>().as_ptr()));
    }
}

/// Header and resource in one allocation.
#[repr(C)]
struct InlineBlock<T> {
    header: ControlBlock,
    value: UnsafeCell<ManuallyDrop<T>>,
}

impl<T> InlineBlock<T> {
    const VTABLE: &'static BlockVTable = &BlockVTable {
        dispose: Self::dispose,
        deallocate: Self::deallocate,
    };

    unsafe fn dispose(block: NonNull<ControlBlock>) {
        ManuallyDrop::drop(&mut *Self::value(block).as_ptr());
    }

    unsafe fn deallocate(block: NonNull<ControlBlock>) {
        drop(Box::from_raw(block.cast::<Self>().as_ptr()));
    }

    unsafe fn value(block: NonNull<ControlBlock>) -> NonNull<ManuallyDrop<T>> {
        let this = block.cast::<Self>().as_ptr();
        NonNull::new_unchecked(UnsafeCell::raw_get(ptr::addr_of!((*this).value)))
    }
}

/// Moves `value` into a fresh global allocation, handing it back on failure.
/// The memory can be released with `Box::from_raw`.
pub(crate) fn try_alloc<B>(value: B, what: &'static str) -> Result<NonNull<B>, (B, AllocFailure)> {
    let layout = Layout::new::<B>();
    if layout.size() == 0 {
        let ptr = NonNull::<B>::dangling();
        unsafe { ptr.as_ptr().write(value) };
        return Ok(ptr);
    }
    match NonNull::new(unsafe { alloc::alloc(layout) }.cast::<B>()) {
        Some(ptr) => {
            unsafe { ptr.as_ptr().write(value) };
            Ok(ptr)
        }
        None => {
            debug!("allocation of {} bytes for {what} failed", layout.size());
            Err((value, AllocFailure { what, layout }))
        }
    }
}

/// Allocates a block holding `value` and returns it with the value's address.
pub(crate) fn allocate_inline<T>(value: T) -> Result<(NonNull<ControlBlock>, NonNull<T>), AllocFailure> {
    let block = InlineBlock {
        header: ControlBlock::new(InlineBlock::<T>::VTABLE),
        value: UnsafeCell::new(ManuallyDrop::new(value)),
    };
    let block = try_alloc(block, "control block with inline value")
        .map_err(|(block, err)| {
            drop(ManuallyDrop::into_inner(block.value.into_inner()));
            err
        })?
        .cast::<ControlBlock>();
    trace!("allocated control block {:p} with inline value", block);
    let value = unsafe { InlineBlock::<T>::value(block) }.cast::<T>();
    Ok((block, value))
}

/// Allocates a block that disposes of `resource` through `deleter`.
///
/// If the block cannot be allocated the resource is disposed of before the
/// error is returned, so nothing leaks.
///
/// # Safety
///
/// `deleter` must be a valid way to dispose of `resource`, and nothing else
/// may dispose of it.
pub(crate) unsafe fn allocate_for<T: ?Sized, D: Deleter<T>>(
    resource: NonNull<T>,
    deleter: D,
) -> Result<NonNull<ControlBlock>, AllocFailure> {
    let block = PtrBlock {
        header: ControlBlock::new(PtrBlock::<T, D>::VTABLE),
        resource,
        deleter: ManuallyDrop::new(deleter),
    };
    match try_alloc(block, "control block") {
        Ok(block) => {
            let block = block.cast::<ControlBlock>();
            trace!("allocated control block {:p}", block);
            Ok(block)
        }
        Err((block, err)) => {
            let PtrBlock {
                resource, deleter, ..
            } = block;
            ManuallyDrop::into_inner(deleter).delete(resource);
            Err(err)
        }
    }
}
