use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::mem;
use std::ops::Deref;
use std::ptr::NonNull;

use crate::block::{self, ControlBlock};
use crate::deleter::{DefaultDelete, Deleter};
use crate::error::{alloc_failed, null_dereference, Error};
use crate::unique::Unique;
use crate::weak::Weak;

/// What a non-empty `Shared` or `Weak` points at: the control block it
/// counts against and the value it dereferences to. The two differ only for
/// projected handles.
pub(crate) struct Parts<T: ?Sized> {
    pub(crate) block: NonNull<ControlBlock>,
    pub(crate) ptr: NonNull<T>,
    pub(crate) projected: bool,
}

impl<T: ?Sized> Clone for Parts<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ?Sized> Copy for Parts<T> {}

/// Reference-counted owner of a heap resource.
///
/// Clones share one control block. The resource is disposed of exactly once,
/// when the last `Shared` pointing at it goes away; [`Weak`] handles can
/// outlive it and observe that it is gone. The deleter is erased into the
/// control block, so handles built with different deleters have the same
/// type.
pub struct Shared<T: ?Sized> {
    pub(crate) parts: Option<Parts<T>>,
    _owns: PhantomData<T>,
}

unsafe impl<T: ?Sized + Send + Sync> Send for Shared<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for Shared<T> {}

impl<T> Shared<T> {
    /// Allocates the value and its control block together.
    pub fn new(value: T) -> Self {
        match block::allocate_inline(value) {
            Ok((block, ptr)) => Self::adopt(block, ptr),
            Err(err) => alloc_failed(err),
        }
    }

    /// Like [`Shared::new`], but reports allocation failure. `value` is
    /// dropped before the error comes back.
    pub fn try_new(value: T) -> Result<Self, Error> {
        let (block, ptr) = block::allocate_inline(value)?;
        Ok(Self::adopt(block, ptr))
    }
}

impl<T: ?Sized> Shared<T> {
    fn adopt(block: NonNull<ControlBlock>, ptr: NonNull<T>) -> Self {
        Self::from_parts(Parts {
            block,
            ptr,
            projected: false,
        })
    }

    pub(crate) fn from_parts(parts: Parts<T>) -> Self {
        Self {
            parts: Some(parts),
            _owns: PhantomData,
        }
    }

    pub fn empty() -> Self {
        Self {
            parts: None,
            _owns: PhantomData,
        }
    }

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

    /// Adopts `ptr` under a new control block that disposes of it through
    /// `deleter`.
    ///
    /// # Safety
    ///
    /// See [`Shared::try_from_raw_with`].
    pub unsafe fn from_raw_with<D>(ptr: *mut T, deleter: D) -> Self
    where
        D: Deleter<T> + Send + 'static,
    {
        let Some(ptr) = NonNull::new(ptr) else {
            return Self::empty();
        };
        match block::allocate_for(ptr, deleter) {
            Ok(block) => Self::adopt(block, ptr),
            Err(err) => alloc_failed(err),
        }
    }

    /// Like [`Shared::from_raw_with`], but reports a failed control block
    /// allocation instead of aborting. The resource has already been disposed
    /// of through `deleter` when the error comes back. A null `ptr` gives an
    /// empty handle and `deleter` is dropped unused.
    ///
    /// # Safety
    ///
    /// `deleter` must be a valid way to dispose of `ptr`, from any thread,
    /// and nothing else may dispose of it.
    pub unsafe fn try_from_raw_with<D>(ptr: *mut T, deleter: D) -> Result<Self, Error>
    where
        D: Deleter<T> + Send + 'static,
    {
        let Some(ptr) = NonNull::new(ptr) else {
            return Ok(Self::empty());
        };
        let block = block::allocate_for(ptr, deleter)?;
        Ok(Self::adopt(block, ptr))
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_none()
    }

    pub fn as_ptr(&self) -> Option<NonNull<T>> {
        self.parts.map(|p| p.ptr)
    }

    pub fn get(&self) -> Option<&T> {
        self.parts.map(|p| unsafe { &*p.ptr.as_ptr() })
    }

    pub fn try_get(&self) -> Result<&T, Error> {
        self.get().ok_or(Error::NullDereference)
    }

    /// Number of `Shared` handles on this resource, 0 when empty. A snapshot
    /// only: other threads may change it right after.
    pub fn use_count(&self) -> usize {
        self.parts
            .map_or(0, |p| unsafe { p.block.as_ref() }.strong_count())
    }

    pub fn weak_count(&self) -> usize {
        self.parts
            .map_or(0, |p| unsafe { p.block.as_ref() }.weak_count())
    }

    /// Gives up this handle's ownership, leaving it empty.
    pub fn reset(&mut self) {
        if let Some(parts) = self.parts.take() {
            unsafe { ControlBlock::release_strong(parts.block) };
        }
    }

    /// Gives up this handle's ownership and adopts `ptr` under a new
    /// control block. Passing the address this handle already points at is
    /// a no-op and `deleter` is dropped unused.
    ///
    /// # Safety
    ///
    /// See [`Shared::try_from_raw_with`].
    pub unsafe fn reset_with<D>(&mut self, ptr: *mut T, deleter: D)
    where
        D: Deleter<T> + Send + 'static,
    {
        if !self.is_empty() && crate::address(self.as_ptr()) == ptr.cast::<()>().cast_const() {
            return;
        }
        *self = Self::from_raw_with(ptr, deleter);
    }

    pub fn take(&mut self) -> Self {
        mem::take(self)
    }

    pub fn downgrade(this: &Self) -> Weak<T> {
        match this.parts {
            Some(parts) => {
                unsafe { parts.block.as_ref() }.downgrade();
                Weak::from_parts(parts)
            }
            None => Weak::new(),
        }
    }

    /// Mutable access, granted only when no other `Shared` or `Weak` shares
    /// the control block. Projected handles never get mutable access.
    pub fn get_mut(this: &mut Self) -> Option<&mut T> {
        let parts = this.parts?;
        if parts.projected || !unsafe { parts.block.as_ref() }.is_unique() {
            return None;
        }
        Some(unsafe { &mut *parts.ptr.as_ptr() })
    }

    /// A handle that dereferences to part of this resource while keeping the
    /// whole of it alive.
    ///
    /// The result no longer names `T`, so `T` may end up dropped on whatever
    /// thread releases the last projection, after any borrow it holds. Hence
    /// `T: Send + Sync + 'static`:
    ///
    /// ```compile_fail
    /// use std::rc::Rc;
    /// use ownership::Shared;
    ///
    /// struct Local {
    ///     _rc: Rc<()>,
    ///     name: String,
    /// }
    ///
    /// let owner = Shared::new(Local { _rc: Rc::new(()), name: String::from("x") });
    /// let name: Shared<String> = Shared::project(&owner, |l| &l.name);
    /// ```
    ///
    /// ```compile_fail
    /// use ownership::Shared;
    ///
    /// struct Borrowing<'a> {
    ///     items: &'a [u32],
    ///     owned: Vec<u32>,
    /// }
    ///
    /// fn escape(items: &[u32]) -> Shared<Vec<u32>> {
    ///     let owner = Shared::new(Borrowing { items, owned: vec![1] });
    ///     Shared::project(&owner, |b| &b.owned)
    /// }
    /// ```
    pub fn project<U, F>(this: &Self, project: F) -> Shared<U>
    where
        T: Send + Sync + 'static,
        U: ?Sized,
        F: for<'x> FnOnce(&'x T) -> &'x U,
    {
        let Some(parts) = this.parts else {
            return Shared::empty();
        };
        let ptr = NonNull::from(project(unsafe { parts.ptr.as_ref() }));
        unsafe { parts.block.as_ref() }.increment_strong();
        Shared::from_parts(Parts {
            block: parts.block,
            ptr,
            projected: true,
        })
    }

    /// True when both handles share a control block and point at the same
    /// address, or are both empty.
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

impl<T: ?Sized> Clone for Shared<T> {
    fn clone(&self) -> Self {
        if let Some(parts) = self.parts {
            unsafe { parts.block.as_ref() }.increment_strong();
        }
        Self {
            parts: self.parts,
            _owns: PhantomData,
        }
    }

    fn clone_from(&mut self, source: &Self) {
        if Self::ptr_eq(self, source) {
            return;
        }
        *self = source.clone();
    }
}

impl<T: ?Sized> Drop for Shared<T> {
    fn drop(&mut self) {
        self.reset();
    }
}

impl<T: ?Sized> Default for Shared<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: ?Sized> Deref for Shared<T> {
    type Target = T;

    #[track_caller]
    fn deref(&self) -> &Self::Target {
        self.get().unwrap_or_else(|| null_dereference())
    }
}

impl<T: ?Sized> From<Box<T>> for Shared<T> {
    fn from(value: Box<T>) -> Self {
        Self::from_box(value)
    }
}

impl<T: ?Sized, D> From<Unique<T, D>> for Shared<T>
where
    D: Deleter<T> + Send + 'static,
{
    fn from(value: Unique<T, D>) -> Self {
        match value.into_parts() {
            (Some(ptr), deleter) => unsafe { Self::from_raw_with(ptr.as_ptr(), deleter) },
            (None, _) => Self::empty(),
        }
    }
}

impl<T: ?Sized> PartialEq for Shared<T> {
    fn eq(&self, other: &Self) -> bool {
        crate::address(self.as_ptr()) == crate::address(other.as_ptr())
    }
}

impl<T: ?Sized> Eq for Shared<T> {}

impl<T: ?Sized> Hash for Shared<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        crate::address(self.as_ptr()).hash(state);
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(value) => f.debug_tuple("Shared").field(&value).finish(),
            None => f.write_str("Shared(<empty>)"),
        }
    }
}
