use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::mem::{self, ManuallyDrop};
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};

use crate::block::try_alloc;
use crate::deleter::{DefaultDelete, Deleter};
use crate::error::{alloc_failed, null_dereference, Error};

/// Sole owner of a heap resource.
///
/// Ownership is structural: there are no counts, the handle disposes of its
/// resource through `D` when it is dropped or reset. A `Unique` can be empty,
/// in which case dropping it does nothing and dereferencing it panics.
pub struct Unique<T: ?Sized, D: Deleter<T> = DefaultDelete> {
    ptr: Option<NonNull<T>>,
    deleter: D,
    _owns: PhantomData<T>,
}

unsafe impl<T: ?Sized + Send, D: Deleter<T> + Send> Send for Unique<T, D> {}
unsafe impl<T: ?Sized + Sync, D: Deleter<T> + Sync> Sync for Unique<T, D> {}

impl<T> Unique<T> {
    pub fn new(value: T) -> Self {
        match try_alloc(value, "resource") {
            Ok(ptr) => Self::adopt(ptr),
            Err((_, err)) => alloc_failed(err),
        }
    }

    /// Like [`Unique::new`], but reports allocation failure. `value` is
    /// dropped before the error comes back.
    pub fn try_new(value: T) -> Result<Self, Error> {
        let ptr = try_alloc(value, "resource").map_err(|(_, err)| err)?;
        Ok(Self::adopt(ptr))
    }

    fn adopt(ptr: NonNull<T>) -> Self {
        Self {
            ptr: Some(ptr),
            deleter: DefaultDelete,
            _owns: PhantomData,
        }
    }
}

impl<T: ?Sized> Unique<T> {
    pub fn from_box(value: Box<T>) -> Self {
        unsafe { Self::from_raw_with(Box::into_raw(value), DefaultDelete) }
    }

    /// # Safety
    ///
    /// `ptr` must be null or come from `Box::into_raw`, and nothing else may
    /// free it.
    pub unsafe fn from_raw(ptr: *mut T) -> Self {
        Self::from_raw_with(ptr, DefaultDelete)
    }
}

impl<T: ?Sized, D: Deleter<T>> Unique<T, D> {
    /// Adopts `ptr`, to be disposed of by `deleter`. A null `ptr` gives an
    /// empty handle that never calls `deleter`.
    ///
    /// # Safety
    ///
    /// `deleter` must be a valid way to dispose of `ptr`, and nothing else
    /// may dispose of it.
    pub unsafe fn from_raw_with(ptr: *mut T, deleter: D) -> Self {
        Self {
            ptr: NonNull::new(ptr),
            deleter,
            _owns: PhantomData,
        }
    }

    pub fn empty_with(deleter: D) -> Self {
        Self {
            ptr: None,
            deleter,
            _owns: PhantomData,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ptr.is_none()
    }

    pub fn as_ptr(&self) -> Option<NonNull<T>> {
        self.ptr
    }

    pub fn get(&self) -> Option<&T> {
        self.ptr.map(|p| unsafe { &*p.as_ptr() })
    }

    pub fn get_mut(&mut self) -> Option<&mut T> {
        self.ptr.map(|p| unsafe { &mut *p.as_ptr() })
    }

    pub fn try_get(&self) -> Result<&T, Error> {
        self.get().ok_or(Error::NullDereference)
    }

    pub fn deleter(&self) -> &D {
        &self.deleter
    }

    pub fn deleter_mut(&mut self) -> &mut D {
        &mut self.deleter
    }

    /// Gives up ownership without disposing. The caller becomes responsible
    /// for the returned resource.
    pub fn release(&mut self) -> Option<NonNull<T>> {
        self.ptr.take()
    }

    /// Disposes of the owned resource, if any, leaving the handle empty.
    pub fn reset(&mut self) {
        if let Some(ptr) = self.ptr.take() {
            unsafe { self.deleter.delete(ptr) };
        }
    }

    /// Disposes of the owned resource and adopts `ptr` in its place.
    /// Passing the pointer already owned is a no-op.
    ///
    /// # Safety
    ///
    /// Same contract as [`Unique::from_raw_with`] for `ptr` and the stored
    /// deleter.
    pub unsafe fn reset_with(&mut self, ptr: *mut T) {
        if let Some(old) = self.ptr {
            if ptr::eq(old.as_ptr().cast::<()>(), ptr.cast::<()>()) {
                return;
            }
        }
        self.reset();
        self.ptr = NonNull::new(ptr);
    }

    /// Moves ownership out, leaving this handle empty with a default deleter.
    pub fn take(&mut self) -> Self
    where
        D: Default,
    {
        mem::replace(self, Self::empty_with(D::default()))
    }

    /// Splits the handle without disposing of anything.
    pub fn into_parts(self) -> (Option<NonNull<T>>, D) {
        let this = ManuallyDrop::new(self);
        let deleter = unsafe { ptr::read(&this.deleter) };
        (this.ptr, deleter)
    }
}

impl<T: ?Sized, D: Deleter<T>> Drop for Unique<T, D> {
    fn drop(&mut self) {
        self.reset();
    }
}

impl<T: ?Sized, D: Deleter<T> + Default> Default for Unique<T, D> {
    fn default() -> Self {
        Self::empty_with(D::default())
    }
}

impl<T: ?Sized> From<Box<T>> for Unique<T> {
    fn from(value: Box<T>) -> Self {
        Self::from_box(value)
    }
}

impl<T: ?Sized, D: Deleter<T>> Deref for Unique<T, D> {
    type Target = T;

    #[track_caller]
    fn deref(&self) -> &Self::Target {
        self.get().unwrap_or_else(|| null_dereference())
    }
}

impl<T: ?Sized, D: Deleter<T>> DerefMut for Unique<T, D> {
    #[track_caller]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.get_mut().unwrap_or_else(|| null_dereference())
    }
}

impl<T: ?Sized, D: Deleter<T>> PartialEq for Unique<T, D> {
    fn eq(&self, other: &Self) -> bool {
        crate::address(self.ptr) == crate::address(other.ptr)
    }
}

impl<T: ?Sized, D: Deleter<T>> Eq for Unique<T, D> {}

impl<T: ?Sized, D: Deleter<T>> Hash for Unique<T, D> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        crate::address(self.ptr).hash(state);
    }
}

impl<T: ?Sized + fmt::Debug, D: Deleter<T>> fmt::Debug for Unique<T, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(value) => f.debug_tuple("Unique").field(&value).finish(),
            None => f.write_str("Unique(<empty>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering::Relaxed;

    #[test]
    fn moved_from_handle_is_empty() {
        static NUM_DROPS: AtomicUsize = AtomicUsize::new(0);

        struct DetectDrop;
        impl Drop for DetectDrop {
            fn drop(&mut self) {
                NUM_DROPS.fetch_add(1, Relaxed);
            }
        }

        let mut first = Unique::new(DetectDrop);
        let second = first.take();
        assert!(first.get().is_none());
        assert!(first.as_ptr().is_none());
        assert!(!second.is_empty());

        drop(first);
        assert_eq!(NUM_DROPS.load(Relaxed), 0);
        drop(second);
        assert_eq!(NUM_DROPS.load(Relaxed), 1);
    }

    #[test]
    fn assigning_over_owner_disposes_old() {
        static NUM_DROPS: AtomicUsize = AtomicUsize::new(0);

        struct DetectDrop;
        impl Drop for DetectDrop {
            fn drop(&mut self) {
                NUM_DROPS.fetch_add(1, Relaxed);
            }
        }

        let mut target = Unique::new(DetectDrop);
        let mut source = Unique::new(DetectDrop);
        assert!(!target.is_empty());
        target = source.take();
        assert_eq!(NUM_DROPS.load(Relaxed), 1);
        assert!(source.is_empty());
        drop(target);
        assert_eq!(NUM_DROPS.load(Relaxed), 2);
    }

    #[test]
    fn release_hands_over_responsibility() {
        let mut handle = Unique::new(String::from("mine"));
        let raw = handle.release().unwrap();
        assert!(handle.is_empty());
        drop(handle);

        let value = unsafe { Box::from_raw(raw.as_ptr()) };
        assert_eq!(*value, "mine");
    }

    #[test]
    fn reset_runs_deleter_once() {
        static DELETED: AtomicUsize = AtomicUsize::new(0);

        let count = |p: NonNull<u64>| {
            DELETED.fetch_add(1, Relaxed);
            drop(unsafe { Box::from_raw(p.as_ptr()) });
        };
        let mut handle = unsafe { Unique::from_raw_with(Box::into_raw(Box::new(1u64)), count) };
        handle.reset();
        assert_eq!(DELETED.load(Relaxed), 1);
        handle.reset();
        assert_eq!(DELETED.load(Relaxed), 1);

        unsafe { handle.reset_with(Box::into_raw(Box::new(2u64))) };
        assert_eq!(*handle, 2);
        assert_eq!(DELETED.load(Relaxed), 1);

        let same = handle.as_ptr().unwrap().as_ptr();
        unsafe { handle.reset_with(same) };
        assert_eq!(*handle, 2);
        assert_eq!(DELETED.load(Relaxed), 1);

        drop(handle);
        assert_eq!(DELETED.load(Relaxed), 2);
    }

    #[test]
    fn null_gives_empty_handle() {
        let handle = unsafe { Unique::<i32>::from_raw(ptr::null_mut()) };
        assert!(handle.is_empty());
        assert_eq!(handle.try_get(), Err(Error::NullDereference));
    }

    #[test]
    #[should_panic(expected = "dereferenced an empty handle")]
    fn deref_empty_panics() {
        let handle: Unique<i32> = Unique::default();
        let _value: i32 = *handle;
    }

    #[test]
    fn unsized_and_mutable() {
        let mut handle: Unique<[i32]> = Unique::from(vec![3, 1, 2].into_boxed_slice());
        handle.sort();
        assert_eq!(&*handle, &[1, 2, 3]);
        assert_eq!(format!("{handle:?}"), "Unique([1, 2, 3])");
    }

    #[test]
    fn equality_is_by_address() {
        let a = Unique::new(1);
        let b = Unique::new(1);
        assert_ne!(a, b);
        assert_eq!(Unique::<i32>::default(), Unique::default());
    }

    #[test]
    fn into_parts_keeps_resource_alive() {
        let handle = Unique::new(9u8);
        let (ptr, mut deleter) = handle.into_parts();
        let ptr = ptr.unwrap();
        assert_eq!(unsafe { *ptr.as_ptr() }, 9);
        unsafe { deleter.delete(ptr) };
    }
}
