use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::ptr::{self, NonNull};
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::SeqCst;

use ownership::{Error, Shared, Unique};

thread_local! {
    static FAIL_ALLOCATIONS: Cell<bool> = const { Cell::new(false) };
}

/// System allocator that returns null on the current thread while armed.
struct FailingAlloc;

unsafe impl GlobalAlloc for FailingAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if FAIL_ALLOCATIONS.try_with(Cell::get).unwrap_or(false) {
            return ptr::null_mut();
        }
        System.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout)
    }
}

#[global_allocator]
static ALLOCATOR: FailingAlloc = FailingAlloc;

/// Runs `f` with every allocation on this thread failing.
fn out_of_memory<R>(f: impl FnOnce() -> R) -> R {
    FAIL_ALLOCATIONS.with(|fail| fail.set(true));
    let result = f();
    FAIL_ALLOCATIONS.with(|fail| fail.set(false));
    result
}

#[test]
fn block_failure_disposes_resource() {
    static DELETED: AtomicUsize = AtomicUsize::new(0);

    let deleter = |p: NonNull<[u64; 8]>| {
        DELETED.fetch_add(1, SeqCst);
        drop(unsafe { Box::from_raw(p.as_ptr()) });
    };
    let resource = Box::into_raw(Box::new([7u64; 8]));

    let result = out_of_memory(|| unsafe { Shared::try_from_raw_with(resource, deleter) });

    assert!(matches!(
        result,
        Err(Error::AllocationFailure { what: "control block", .. })
    ));
    assert_eq!(DELETED.load(SeqCst), 1);
}

#[test]
fn combined_failure_drops_value() {
    static NUM_DROPS: AtomicUsize = AtomicUsize::new(0);

    struct DetectDrop;
    impl Drop for DetectDrop {
        fn drop(&mut self) {
            NUM_DROPS.fetch_add(1, SeqCst);
        }
    }

    let result = out_of_memory(|| Shared::try_new(DetectDrop));

    assert!(matches!(result, Err(Error::AllocationFailure { .. })));
    assert_eq!(NUM_DROPS.load(SeqCst), 1);
}

#[test]
fn unique_failure_drops_value() {
    static NUM_DROPS: AtomicUsize = AtomicUsize::new(0);

    struct DetectDrop(#[allow(dead_code)] u32);
    impl Drop for DetectDrop {
        fn drop(&mut self) {
            NUM_DROPS.fetch_add(1, SeqCst);
        }
    }

    let result = out_of_memory(|| Unique::try_new(DetectDrop(3)));

    assert!(matches!(result, Err(Error::AllocationFailure { what: "resource", .. })));
    assert_eq!(NUM_DROPS.load(SeqCst), 1);
}

#[test]
fn construction_succeeds_once_memory_returns() {
    let _ = out_of_memory(|| Shared::try_new(1u32));

    let handle = Shared::try_new(1u32).unwrap();
    assert_eq!(*handle, 1);
    assert_eq!(handle.use_count(), 1);
}
