//! The collectable object contract and allocation entry points.
//!
//! A collectable value is allocated behind a [GcHeader] that carries its
//! handle, mark bit and list links. The handle table stores a fat pointer to
//! the boxed header+value pair, so the collector can reach the value's
//! [Collectable] vtable from nothing but a handle.

use std::alloc::{alloc, Layout};
use std::any::TypeId;
use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ops::Deref;
use std::ptr::{self, addr_of_mut, null_mut};
use std::sync::atomic::Ordering;

use crate::cell::SnapCell;
use crate::handle::{self, Handle, NULL_HANDLE};
use crate::list::{self, Link};
use crate::state::{ThreadData, THREAD};
use crate::{trigger, GcContext};

/// A value the collector can manage.
///
/// Implementors publish their internal [SnapCell] fields so the collector can
/// traverse and repair them: `instance_var_count` and `instance_var` must
/// agree, and both must be overridden together. The destructor (`Drop`) runs
/// exactly once, on the collector, before the object's handle is reused.
pub trait Collectable: Send + 'static {
    /// In-memory size of this object, fed into the allocation trigger.
    fn allocation_size(&self) -> usize {
        std::mem::size_of_val(self)
    }

    /// Number of embedded [InstanceHandle](crate::InstanceHandle) cells.
    fn instance_var_count(&self) -> usize {
        0
    }

    /// The i-th embedded cell, `0 <= at < instance_var_count()`.
    fn instance_var(&self, _at: usize) -> &SnapCell {
        panic!("collectable declared no instance handles")
    }

    /// Invoked on every survivor right after its mark bit is cleared. Must
    /// only touch state the mutators do not race on.
    fn clean_after_collect(&self) {}
}

/// Header prepended to every collectable allocation. List links and the mark
/// bit are only ever touched by the owning thread or by the collector during
/// its exclusive window, never both at once.
#[repr(C)]
pub struct GcHeader {
    next: Cell<*mut GcHeader>,
    prev: Cell<*mut GcHeader>,
    handle: Cell<Handle>,
    mark: Cell<bool>,
    sentinel: bool,
    type_id: TypeId,
}

impl GcHeader {
    fn for_object<T: Collectable>() -> Self {
        Self {
            next: Cell::new(null_mut()),
            prev: Cell::new(null_mut()),
            handle: Cell::new(NULL_HANDLE),
            mark: Cell::new(false),
            sentinel: false,
            type_id: TypeId::of::<T>(),
        }
    }

    pub(crate) fn sentinel() -> Self {
        Self {
            next: Cell::new(null_mut()),
            prev: Cell::new(null_mut()),
            handle: Cell::new(NULL_HANDLE),
            mark: Cell::new(false),
            sentinel: true,
            type_id: TypeId::of::<()>(),
        }
    }

    pub(crate) fn handle(&self) -> Handle {
        self.handle.get()
    }

    pub(crate) fn is_marked(&self) -> bool {
        self.mark.get()
    }

    pub(crate) fn set_marked(&self, marked: bool) {
        self.mark.set(marked);
    }

    pub(crate) fn is_sentinel(&self) -> bool {
        self.sentinel
    }
}

unsafe impl Link for GcHeader {
    fn next(&self) -> *mut Self {
        self.next.get()
    }
    fn prev(&self) -> *mut Self {
        self.prev.get()
    }
    fn set_next(&self, next: *mut Self) {
        self.next.set(next);
    }
    fn set_prev(&self, prev: *mut Self) {
        self.prev.set(prev);
    }
}

#[repr(C)]
pub(crate) struct GcBox<T: Collectable + ?Sized> {
    pub(crate) header: GcHeader,
    pub(crate) value: T,
}

/// Common surface of the three reference kinds: the raw id naming the object
/// through the handle table.
pub trait Handled {
    fn handle(&self) -> Handle;
}

/// A typed reference carrying a handle id. Copyable and unrooted: holding a
/// `Gc` does not keep the object alive across a collection.
pub struct Gc<T: Collectable> {
    handle: Handle,
    _marker: PhantomData<*const T>,
}

impl<T: Collectable> Gc<T> {
    pub(crate) fn from_handle(handle: Handle) -> Self {
        debug_assert!(handle != NULL_HANDLE);
        Self {
            handle,
            _marker: PhantomData,
        }
    }

    pub fn ptr_eq(a: Gc<T>, b: Gc<T>) -> bool {
        a.handle == b.handle
    }
}

impl<T: Collectable> Handled for Gc<T> {
    fn handle(&self) -> Handle {
        self.handle
    }
}

impl<T: Collectable> Clone for Gc<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T: Collectable> Copy for Gc<T> {}

impl<T: Collectable> Deref for Gc<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        unsafe {
            let object = crate::context().table.object(self.handle);
            debug_assert_eq!((*object).header.type_id, TypeId::of::<T>());
            &(*(object as *mut GcBox<T>)).value
        }
    }
}

impl<T: Collectable> fmt::Pointer for Gc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gc({})", self.handle)
    }
}

/// Allocation failure: the underlying allocator refused the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocError {
    pub bytes: usize,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to allocate {} bytes for a collectable", self.bytes)
    }
}

impl std::error::Error for AllocError {}

/// Allocate `value` on the collected heap, assign it a handle and link it
/// into the calling thread's active object list.
///
/// The calling thread must be registered. Aborts the process if the handle
/// pool is exhausted; allocator failure is returned as an error.
pub fn allocate<T: Collectable>(value: T) -> Result<Gc<T>, AllocError> {
    let ctx = crate::context();
    THREAD.with(|t| unsafe { allocate_inner(ctx, t, value, None) })
}

/// Allocate a fixed collection of collectables as one object, counted through
/// the array-allocation trigger path.
pub fn allocate_array<T: Collectable>(items: Vec<T>) -> Result<Gc<GcArray<T>>, AllocError> {
    let ctx = crate::context();
    let len = items.len();
    THREAD.with(|t| unsafe { allocate_inner(ctx, t, GcArray { items }, Some(len)) })
}

unsafe fn allocate_inner<T: Collectable>(
    ctx: &GcContext,
    thread: &ThreadData,
    value: T,
    array_len: Option<usize>,
) -> Result<Gc<T>, AllocError> {
    assert!(
        thread.is_registered(),
        "calling thread is not registered with the collector"
    );
    let layout = Layout::new::<GcBox<T>>();
    let raw = alloc(layout) as *mut GcBox<T>;
    if raw.is_null() {
        return Err(AllocError {
            bytes: layout.size(),
        });
    }
    addr_of_mut!((*raw).header).write(GcHeader::for_object::<T>());
    addr_of_mut!((*raw).value).write(value);

    let size = (*raw).value.allocation_size() + size_of::<GcHeader>();
    match array_len {
        Some(len) => trigger::log_array_alloc(ctx, thread, size, len),
        None => trigger::log_alloc(ctx, thread, size),
    }

    let handle = handle::allocate_handle(ctx, thread);
    (*raw).header.handle.set(handle);
    let erased: *mut GcBox<dyn Collectable> = raw;
    ctx.table.set_object(handle, erased);

    let lists = &*ctx.scan_lists[thread.index.get()].load(Ordering::Acquire);
    let active = ctx.active_index.load(Ordering::SeqCst);
    list::push_front(lists.objects[active], addr_of_mut!((*raw).header));

    ctx.stats.objects_allocated.fetch_add(1, Ordering::Relaxed);
    ctx.stats.live_objects.fetch_add(1, Ordering::Relaxed);
    ctx.stats.bytes_allocated.fetch_add(size, Ordering::Relaxed);
    Ok(Gc::from_handle(handle))
}

/// A fixed-length collection of collectables stored as a single object. The
/// embedded cells of every element are published through the enclosing
/// object's instance-var table, so references held by elements are traced.
pub struct GcArray<T: Collectable> {
    items: Vec<T>,
}

impl<T: Collectable> GcArray<T> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, at: usize) -> Option<&T> {
        self.items.get(at)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }
}

impl<T: Collectable> std::ops::Index<usize> for GcArray<T> {
    type Output = T;
    fn index(&self, at: usize) -> &T {
        &self.items[at]
    }
}

impl<T: Collectable> Collectable for GcArray<T> {
    fn allocation_size(&self) -> usize {
        size_of::<Self>() + self.items.capacity() * size_of::<T>()
    }

    fn instance_var_count(&self) -> usize {
        self.items.iter().map(Collectable::instance_var_count).sum()
    }

    fn instance_var(&self, at: usize) -> &SnapCell {
        let mut at = at;
        for item in &self.items {
            let n = item.instance_var_count();
            if at < n {
                return item.instance_var(at);
            }
            at -= n;
        }
        panic!("instance handle index out of range")
    }

    fn clean_after_collect(&self) {
        for item in &self.items {
            item.clean_after_collect();
        }
    }
}

/// Destroy the object behind `handle`: run its destructor (panics are
/// isolated and logged) and release the backing memory. Collector-only.
pub(crate) unsafe fn destroy_object(ctx: &GcContext, handle: Handle) {
    let object = ctx.table.object(handle);
    let layout = Layout::for_value(&*object);
    let dropped = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        ptr::drop_in_place(object);
    }));
    if dropped.is_err() {
        log::error!(
            "collectable destructor panicked (handle {}); memory released anyway",
            handle
        );
    }
    std::alloc::dealloc(object as *mut u8, layout);
}
