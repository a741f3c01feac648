//! Physical page allocator.
//!
//! Hands out whole [`PAGE_SIZE`]-byte pages of physical memory for user
//! processes, kernel stacks, and page-table pages. Free frames sit on a
//! freelist; every frame additionally carries a reference count so that the
//! virtual memory layer can share one physical page among several logical
//! owners (copy-on-write). A frame returns to the freelist only when its
//! last owner frees it.
//!
//! Frames are tracked by index into the managed range, with the freelist
//! links in a side table, so no allocator metadata lives inside page memory
//! and address arithmetic stays confined to one translation helper.
//!
//! All state sits behind one [`SpinLock`]; every operation is a short,
//! non-suspending critical section.

use crate::error::OutOfMemory;
use core::ptr::NonNull;
use util::sync::SpinLock;

/// The size of a single page in memory.
pub const PAGE_SIZE: usize = 4096;

/// Fill byte for freshly allocated pages.
///
/// A deterministic non-zero pattern, so that reads of allocated-but-unwritten
/// memory produce visible garbage instead of plausible zeroes.
const ALLOC_FILL: u8 = 5;

/// Fill byte for freed pages, distinct from [`ALLOC_FILL`], so that dangling
/// access to freed memory is visibly wrong rather than silently stale.
const FREE_FILL: u8 = 1;

/// Freelist terminator, also the head value of an empty freelist.
const LIST_END: u32 = u32::MAX;

/// Link value of a frame that is not on the freelist at all.
const UNLINKED: u32 = u32::MAX - 1;

/// Allocator bookkeeping, all guarded by the one allocator lock.
struct Inner<const NFRAMES: usize> {
    /// Start of the managed range, page-aligned. Null until [`bootstrap`].
    ///
    /// [`bootstrap`]: PageAllocator::bootstrap
    base: *mut u8,
    /// Number of frames actually in the managed range; at most `NFRAMES`.
    frames: usize,
    /// Index of the first free frame, or [`LIST_END`].
    free_head: u32,
    /// Freelist links: `next[f]` is the frame after `f`, [`LIST_END`] at the
    /// tail, or [`UNLINKED`] while `f` is off the list.
    next: [u32; NFRAMES],
    /// Reference counts by frame index.
    ///
    /// Invariant: `refcnt[f] == 0` exactly when `f` is on the freelist (once
    /// bootstrap has pushed it there). A frame with owners is never linked.
    refcnt: [u32; NFRAMES],
}

impl<const NFRAMES: usize> Inner<NFRAMES> {
    /// Translate a page address into its frame index.
    ///
    /// A misaligned or out-of-range address is a kernel programming error,
    /// not something a caller can trigger at runtime, so it is fatal.
    fn frame_index(&self, pa: *mut u8) -> usize {
        let addr = pa.addr();
        let base = self.base.addr();
        if addr % PAGE_SIZE != 0 || addr < base || addr >= base + self.frames * PAGE_SIZE {
            panic!("palloc: bad page address");
        }
        (addr - base) / PAGE_SIZE
    }

    /// The page address of a frame.
    fn frame_address(&self, frame: usize) -> *mut u8 {
        self.base.wrapping_add(frame * PAGE_SIZE)
    }
}

// SAFETY:
// `Inner` owns its managed memory range exclusively from `bootstrap` on, and
// the raw base pointer is only a range bookmark; all access to page memory is
// mediated by the allocator operations.
unsafe impl<const NFRAMES: usize> Send for Inner<NFRAMES> {}

/// The physical page allocator.
///
/// `NFRAMES` bounds the managed range (it sizes the reference-count table),
/// fixed at build time from the top of physical memory. One allocator exists
/// for the lifetime of the kernel.
pub struct PageAllocator<const NFRAMES: usize> {
    /// The allocator state. Everything mutates under this one lock.
    inner: SpinLock<Inner<NFRAMES>>,
}

impl<const NFRAMES: usize> PageAllocator<NFRAMES> {
    /// Construct an empty allocator managing no memory yet.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(Inner {
                base: core::ptr::null_mut(),
                frames: 0,
                free_head: LIST_END,
                next: [UNLINKED; NFRAMES],
                refcnt: [0; NFRAMES],
            }),
        }
    }

    /// Hand the address range `[start, end)` to the allocator.
    ///
    /// `start` is rounded up to a page boundary and every whole page below
    /// `end` is pushed onto the freelist, establishing the starting state:
    /// all usable frames have reference count zero and are free. Call once,
    /// at startup. A range holding more than `NFRAMES` pages is fatal.
    ///
    /// # Safety
    /// The range must be valid for reads and writes for the allocator's
    /// entire lifetime, and nothing else may touch it except through pages
    /// handed out by [`Self::alloc_page`].
    pub unsafe fn bootstrap(&self, start: *mut u8, end: *mut u8) {
        let first = start.addr().next_multiple_of(PAGE_SIZE);
        let aligned = start.wrapping_add(first - start.addr());
        let frames = end.addr().saturating_sub(first) / PAGE_SIZE;
        assert!(frames <= NFRAMES, "palloc: range exceeds frame capacity");
        {
            let mut inner = self.inner.lock();
            inner.base = aligned;
            inner.frames = frames;
        }
        log::debug!("palloc: managing {frames} frames from {first:#x}");
        for frame in 0..frames {
            // SAFETY:
            // The page is inside the range the caller just handed over.
            unsafe { self.free_page(aligned.wrapping_add(frame * PAGE_SIZE)) };
        }
    }

    /// Allocate one page of physical memory.
    ///
    /// The page comes back filled with a fixed junk pattern and with
    /// reference count 1. An empty freelist is not an error in the fatal
    /// sense: memory pressure is expected, and the caller decides how to
    /// handle it.
    pub fn alloc_page(&self) -> Result<NonNull<u8>, OutOfMemory> {
        let mut inner = self.inner.lock();
        if inner.free_head == LIST_END {
            return Err(OutOfMemory);
        }
        let frame = inner.free_head as usize;
        let next = inner.next[frame];
        inner.free_head = next;
        inner.next[frame] = UNLINKED;
        inner.refcnt[frame] = 1;
        let pa = inner.frame_address(frame);
        drop(inner);
        log::trace!("palloc: allocated frame {frame}");
        // SAFETY:
        // The frame now has reference count 1 and we are its only owner
        // until the pointer is returned, so the fill races with no one.
        unsafe { pa.write_bytes(ALLOC_FILL, PAGE_SIZE) };
        // SAFETY:
        // `base` is non-null once any frame is on the freelist, and the
        // frame address is inside the managed range.
        Ok(unsafe { NonNull::new_unchecked(pa) })
    }

    /// Release one reference to the page at `pa`, freeing it when the last
    /// owner lets go.
    ///
    /// While other owners remain (the copy-on-write sharing path) the page
    /// is left untouched. On the last release the page is filled with junk
    /// and pushed onto the freelist. Freeing a page that is already free is
    /// a no-op; see the module notes on refcount underflow.
    ///
    /// # Safety
    /// The caller must actually own the reference it is releasing: the page
    /// must have come from [`Self::alloc_page`] (or, during [`bootstrap`],
    /// from the handed-over range) and the caller must not touch it again
    /// unless it holds another reference.
    ///
    /// [`bootstrap`]: Self::bootstrap
    pub unsafe fn free_page(&self, pa: *mut u8) {
        let mut inner = self.inner.lock();
        let frame = inner.frame_index(pa);
        match inner.refcnt[frame] {
            // Underflow clamps rather than panics; bootstrap relies on
            // freeing never-referenced frames, and see the module notes.
            0 => {}
            count => inner.refcnt[frame] = count - 1,
        }
        if inner.refcnt[frame] > 0 {
            // Copy-on-write: other owners still hold the page.
            return;
        }
        if inner.next[frame] != UNLINKED {
            // Redundant free of a frame already on the freelist. Tolerated
            // without corrupting the list, but loudly: it usually means a
            // caller's accounting is off.
            log::warn!("palloc: redundant free of frame {frame}");
            return;
        }
        // Fill with junk to catch dangling references.
        //
        // SAFETY:
        // Reference count is zero and the frame is off the freelist, so no
        // owner can observe the fill.
        unsafe { pa.write_bytes(FREE_FILL, PAGE_SIZE) };
        let head = inner.free_head;
        inner.next[frame] = head;
        inner.free_head = frame as u32;
    }

    /// The reference count of the page at `pa`.
    pub fn page_ref_count(&self, pa: *mut u8) -> u32 {
        let inner = self.inner.lock();
        let frame = inner.frame_index(pa);
        inner.refcnt[frame]
    }

    /// Add one reference to the page at `pa`.
    ///
    /// The virtual memory layer calls this when it maps an existing page
    /// into another owner, deferring the copy until a write (copy-on-write).
    pub fn add_page_ref(&self, pa: *mut u8) {
        let mut inner = self.inner.lock();
        let frame = inner.frame_index(pa);
        inner.refcnt[frame] += 1;
    }

    /// Drop one reference to the page at `pa` without freeing it.
    ///
    /// A decrement below zero is clamped to a no-op. That choice can mask a
    /// double-free rather than catch it, but callers with imprecise
    /// accounting rely on the forgiving behavior, so it stays; the clamp is
    /// logged instead.
    pub fn sub_page_ref(&self, pa: *mut u8) {
        let mut inner = self.inner.lock();
        let frame = inner.frame_index(pa);
        match inner.refcnt[frame] {
            0 => log::warn!("palloc: ignoring refcount underflow on frame {frame}"),
            count => inner.refcnt[frame] = count - 1,
        }
    }

    /// The number of free bytes remaining, by walking the freelist.
    ///
    /// Diagnostic; not meant for hot paths.
    pub fn free_bytes(&self) -> usize {
        let inner = self.inner.lock();
        let mut frames = 0_usize;
        let mut cursor = inner.free_head;
        while cursor != LIST_END {
            frames += 1;
            cursor = inner.next[cursor as usize];
        }
        frames * PAGE_SIZE
    }
}

impl<const NFRAMES: usize> Default for PageAllocator<NFRAMES> {
    fn default() -> Self {
        Self::new()
    }
}
