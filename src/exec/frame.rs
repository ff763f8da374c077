//! Pooled allocation for task frames.
//!
//! Spawning a task stores its future in a type-erased frame. The
//! backing memory comes from a [`FrameAllocator`]; the default is the
//! process-wide [`FramePool`], a two-tier free list:
//!
//! - a thread-local list, searched first-fit by block capacity;
//! - a global overflow list under its own mutex;
//! - the system allocator on a double miss.
//!
//! Deallocation pushes into the thread-local list unconditionally, so
//! a thread that spawns generations of same-sized tasks recycles one
//! block. Every block records its total capacity in a header, and the
//! frame records which allocator produced it, so release needs no
//! extra state from the caller.
//!
//! The pool keeps counters; [`FramePool::stats`] exposes them so the
//! allocate/deallocate balance is observable.

use parking_lot::Mutex;
use std::alloc::Layout;
use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

/// Supplies backing memory for task frames.
pub trait FrameAllocator: Send + Sync + 'static {
    /// Allocates `size` bytes aligned to `align`.
    fn allocate(&self, size: usize, align: usize) -> NonNull<u8>;

    /// Releases an allocation previously returned by
    /// [`allocate`](Self::allocate) with the same size and alignment.
    ///
    /// # Safety
    ///
    /// `ptr` must come from this allocator with exactly `size` and
    /// `align`, and must not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize, align: usize);
}

/// Blocks carry their capacity so a freed block can serve any request
/// that fits.
#[repr(C)]
struct BlockHeader {
    next: *mut BlockHeader,
    capacity: usize,
}

/// All pool blocks share one alignment; requests with stricter
/// alignment bypass the pool.
const BLOCK_ALIGN: usize = 16;
const HEADER: usize = std::mem::size_of::<BlockHeader>();

/// A thread-local list longer than this spills into the global pool.
const LOCAL_LIMIT: usize = 64;

struct FreeList {
    head: Cell<*mut BlockHeader>,
    len: Cell<usize>,
}

impl FreeList {
    const fn new() -> Self {
        Self {
            head: Cell::new(std::ptr::null_mut()),
            len: Cell::new(0),
        }
    }

    fn len(&self) -> usize {
        self.len.get()
    }

    fn push(&self, block: *mut BlockHeader) {
        unsafe { (*block).next = self.head.get() };
        self.head.set(block);
        self.len.set(self.len.get() + 1);
    }

    /// First block whose capacity covers `total` bytes.
    fn pop(&self, total: usize) -> Option<*mut BlockHeader> {
        let mut prev: *mut BlockHeader = std::ptr::null_mut();
        let mut cur = self.head.get();
        while !cur.is_null() {
            unsafe {
                if (*cur).capacity >= total {
                    if prev.is_null() {
                        self.head.set((*cur).next);
                    } else {
                        (*prev).next = (*cur).next;
                    }
                    self.len.set(self.len.get() - 1);
                    return Some(cur);
                }
                prev = cur;
                cur = (*cur).next;
            }
        }
        None
    }

    fn drain(&self) {
        self.len.set(0);
        let mut cur = self.head.replace(std::ptr::null_mut());
        while !cur.is_null() {
            unsafe {
                let next = (*cur).next;
                let layout =
                    Layout::from_size_align_unchecked((*cur).capacity, BLOCK_ALIGN);
                std::alloc::dealloc(cur.cast(), layout);
                cur = next;
            }
        }
    }
}

thread_local! {
    static LOCAL_POOL: LocalPool = LocalPool {
        list: FreeList::new(),
    };
}

struct LocalPool {
    list: FreeList,
}

impl Drop for LocalPool {
    fn drop(&mut self) {
        self.list.drain();
    }
}

/// Counters for observing pool behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FramePoolStats {
    /// Frames handed out.
    pub allocations: u64,
    /// Frames returned.
    pub deallocations: u64,
    /// Total bytes handed out.
    pub bytes_allocated: u64,
    /// Total bytes returned.
    pub bytes_freed: u64,
    /// Allocations served from a free list instead of the system.
    pub reuses: u64,
}

/// The shared two-tier frame pool.
pub struct FramePool {
    global: Mutex<GlobalFreeList>,
    allocations: AtomicU64,
    deallocations: AtomicU64,
    bytes_allocated: AtomicU64,
    bytes_freed: AtomicU64,
    reuses: AtomicU64,
}

struct GlobalFreeList {
    head: *mut BlockHeader,
}

unsafe impl Send for GlobalFreeList {}

impl GlobalFreeList {
    fn push(&mut self, block: *mut BlockHeader) {
        unsafe { (*block).next = self.head };
        self.head = block;
    }

    fn pop(&mut self, total: usize) -> Option<*mut BlockHeader> {
        let mut prev: *mut BlockHeader = std::ptr::null_mut();
        let mut cur = self.head;
        while !cur.is_null() {
            unsafe {
                if (*cur).capacity >= total {
                    if prev.is_null() {
                        self.head = (*cur).next;
                    } else {
                        (*prev).next = (*cur).next;
                    }
                    return Some(cur);
                }
                prev = cur;
                cur = (*cur).next;
            }
        }
        None
    }
}

impl Drop for GlobalFreeList {
    fn drop(&mut self) {
        let mut cur = self.head;
        while !cur.is_null() {
            unsafe {
                let next = (*cur).next;
                let layout =
                    Layout::from_size_align_unchecked((*cur).capacity, BLOCK_ALIGN);
                std::alloc::dealloc(cur.cast(), layout);
                cur = next;
            }
        }
    }
}

impl FramePool {
    /// Creates a standalone pool (the spawn path defaults to
    /// [`FramePool::shared`]).
    #[must_use]
    pub fn new() -> Self {
        Self {
            global: Mutex::new(GlobalFreeList {
                head: std::ptr::null_mut(),
            }),
            allocations: AtomicU64::new(0),
            deallocations: AtomicU64::new(0),
            bytes_allocated: AtomicU64::new(0),
            bytes_freed: AtomicU64::new(0),
            reuses: AtomicU64::new(0),
        }
    }

    /// The pool shared by all spawned tasks.
    #[must_use]
    pub fn shared() -> &'static Arc<FramePool> {
        static SHARED: OnceLock<Arc<FramePool>> = OnceLock::new();
        SHARED.get_or_init(|| Arc::new(FramePool::new()))
    }

    /// Snapshot of the pool counters.
    #[must_use]
    pub fn stats(&self) -> FramePoolStats {
        FramePoolStats {
            allocations: self.allocations.load(Ordering::Acquire),
            deallocations: self.deallocations.load(Ordering::Acquire),
            bytes_allocated: self.bytes_allocated.load(Ordering::Acquire),
            bytes_freed: self.bytes_freed.load(Ordering::Acquire),
            reuses: self.reuses.load(Ordering::Acquire),
        }
    }
}

impl Default for FramePool {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAllocator for FramePool {
    fn allocate(&self, size: usize, align: usize) -> NonNull<u8> {
        self.allocations.fetch_add(1, Ordering::AcqRel);
        self.bytes_allocated
            .fetch_add(size as u64, Ordering::AcqRel);

        if align > BLOCK_ALIGN {
            // Rare over-aligned frame: go straight to the system.
            let layout = Layout::from_size_align(size, align).expect("frame layout");
            let ptr = unsafe { std::alloc::alloc(layout) };
            return NonNull::new(ptr).expect("frame allocation failed");
        }

        let total = size + HEADER;
        let block = LOCAL_POOL
            .with(|p| p.list.pop(total))
            .or_else(|| self.global.lock().pop(total));

        let block = match block {
            Some(b) => {
                self.reuses.fetch_add(1, Ordering::AcqRel);
                b
            }
            None => {
                let layout = Layout::from_size_align(total, BLOCK_ALIGN).expect("frame layout");
                let raw = unsafe { std::alloc::alloc(layout) }.cast::<BlockHeader>();
                assert!(!raw.is_null(), "frame allocation failed");
                unsafe {
                    (*raw).next = std::ptr::null_mut();
                    (*raw).capacity = total;
                }
                raw
            }
        };
        // Safety: block points at least HEADER + size valid bytes.
        unsafe { NonNull::new_unchecked(block.cast::<u8>().add(HEADER)) }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize, align: usize) {
        self.deallocations.fetch_add(1, Ordering::AcqRel);
        self.bytes_freed.fetch_add(size as u64, Ordering::AcqRel);

        if align > BLOCK_ALIGN {
            let layout = Layout::from_size_align(size, align).expect("frame layout");
            unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
            return;
        }

        let block = unsafe { ptr.as_ptr().sub(HEADER) }.cast::<BlockHeader>();
        let overflow = LOCAL_POOL.with(|p| {
            if p.list.len() < LOCAL_LIMIT {
                p.list.push(block);
                false
            } else {
                true
            }
        });
        if overflow {
            self.global.lock().push(block);
        }
    }
}

/// Type-erased storage for a spawned future.
///
/// The future lives in allocator-provided memory; the frame records
/// the poll and drop entry points plus the producing allocator, so
/// the task needs no knowledge of the concrete future type.
pub(crate) struct TaskFrame {
    ptr: NonNull<u8>,
    size: usize,
    align: usize,
    poll_fn: unsafe fn(NonNull<u8>, &mut Context<'_>) -> Poll<()>,
    drop_fn: unsafe fn(NonNull<u8>),
    alloc: Arc<dyn FrameAllocator>,
    live: bool,
}

// The constructor requires F: Send; the raw pointer is the only
// reason auto-derivation fails.
unsafe impl Send for TaskFrame {}

impl TaskFrame {
    pub(crate) fn new<F>(future: F, alloc: Arc<dyn FrameAllocator>) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let size = std::mem::size_of::<F>().max(1);
        let align = std::mem::align_of::<F>();
        let ptr = alloc.allocate(size, align);
        // Safety: ptr is valid for size bytes at F's alignment.
        unsafe { ptr.as_ptr().cast::<F>().write(future) };

        unsafe fn poll_impl<F: Future<Output = ()>>(
            ptr: NonNull<u8>,
            cx: &mut Context<'_>,
        ) -> Poll<()> {
            // Safety: the frame never moves its payload; pinning is
            // structural.
            let future = unsafe { Pin::new_unchecked(&mut *ptr.as_ptr().cast::<F>()) };
            future.poll(cx)
        }

        unsafe fn drop_impl<F>(ptr: NonNull<u8>) {
            unsafe { std::ptr::drop_in_place(ptr.as_ptr().cast::<F>()) };
        }

        Self {
            ptr,
            size,
            align,
            poll_fn: poll_impl::<F>,
            drop_fn: drop_impl::<F>,
            alloc,
            live: true,
        }
    }

    pub(crate) fn poll(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        debug_assert!(self.live);
        // Safety: live frame, exclusive access through &mut self.
        unsafe { (self.poll_fn)(self.ptr, cx) }
    }
}

impl Drop for TaskFrame {
    fn drop(&mut self) {
        if !self.live {
            return;
        }
        self.live = false;
        // Safety: the payload is live and owned by this frame.
        unsafe {
            (self.drop_fn)(self.ptr);
            self.alloc.deallocate(self.ptr, self.size, self.align);
        }
    }
}

impl std::fmt::Debug for TaskFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskFrame")
            .field("size", &self.size)
            .field("align", &self.align)
            .finish_non_exhaustive()
    }
}
