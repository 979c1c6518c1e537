use std::ptr::NonNull;

/// Disposes of a resource once its owner lets go of it.
///
/// Handles call `delete` exactly once per adopted pointer. Closures taking
/// `NonNull<T>` implement this trait, so a resource that needs a teardown
/// call other than `Box` deallocation can be wrapped without a new type.
pub trait Deleter<T: ?Sized> {
    /// # Safety
    ///
    /// `resource` must be the pointer this deleter was paired with when the
    /// owning handle adopted it, and must not be used after this call.
    unsafe fn delete(&mut self, resource: NonNull<T>);
}

/// Frees a resource that came from `Box::into_raw`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DefaultDelete;

impl<T: ?Sized> Deleter<T> for DefaultDelete {
    unsafe fn delete(&mut self, resource: NonNull<T>) {
        drop(Box::from_raw(resource.as_ptr()));
    }
}

impl<T: ?Sized, F> Deleter<T> for F
where
    F: FnMut(NonNull<T>),
{
    unsafe fn delete(&mut self, resource: NonNull<T>) {
        self(resource)
    }
}
