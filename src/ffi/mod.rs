use std::sync::LazyLock;

pub mod bindings;
pub mod syscall;

// Dereferences the pointer and offsets by the size of the
// pointee type, then returns the dereferenced value. Reads are
// unaligned: tracepoint data sits at a 4-byte offset inside sample
// records.
#[inline]
pub unsafe fn deref_offset<T: Copy>(ptr: &mut *const u8) -> T {
    let val = (*ptr as *const T).read_unaligned();
    *ptr = ptr.add(size_of::<T>());
    val
}

pub type Attr = bindings::perf_event_attr;
pub type Metadata = bindings::perf_event_mmap_page;

pub static PAGE_SIZE: LazyLock<usize> =
    LazyLock::new(|| unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) } as usize);
