use std::alloc::{self, Layout};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("dereferenced an empty handle")]
    NullDereference,

    #[error("failed to allocate {what} ({} bytes)", .layout.size())]
    AllocationFailure { what: &'static str, layout: Layout },
}

#[cold]
#[track_caller]
pub(crate) fn null_dereference() -> ! {
    panic!("{}", Error::NullDereference)
}

/// A global allocation that came back null.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AllocFailure {
    pub(crate) what: &'static str,
    pub(crate) layout: Layout,
}

impl From<AllocFailure> for Error {
    fn from(err: AllocFailure) -> Self {
        Error::AllocationFailure {
            what: err.what,
            layout: err.layout,
        }
    }
}

/// Infallible constructors end up here; allocation failure goes to the
/// global handler like `Box::new` does.
#[cold]
pub(crate) fn alloc_failed(err: AllocFailure) -> ! {
    alloc::handle_alloc_error(err.layout)
}
