//! Disk block buffer cache.
//!
//! The buffer cache keeps cached copies of disk block contents in a fixed
//! pool of in-memory slots. Caching blocks in memory reduces the number of
//! disk reads and also provides the synchronization point for blocks used by
//! multiple tasks: all access to one `(device, block)` pair is serialized
//! through that slot's content lock.
//!
//! Interface:
//! - To get a locked buffer for a particular disk block, call
//!   [`BufferCache::read`].
//! - After changing buffer data, call [`Buf::write`] to write it to disk.
//! - Dropping the [`Buf`] releases the buffer; do not keep buffers longer
//!   than necessary, since only one task at a time can hold one.
//! - To keep a block resident across a longer operation without holding it
//!   locked the whole time, use [`Buf::pin`] / [`Buf::unpin`].
//!
//! Slot identity metadata is hashed into [`NBUCKET`] independently-locked
//! buckets, so lookups of unrelated blocks never contend. A slot whose use
//! count reaches zero leaves its bucket and enters a single pool of eviction
//! candidates ordered by release time; a cache miss claims the least
//! recently released one. The bucket lock is always taken before the pool
//! lock, and every spin guard is dropped before the blocking content-lock
//! acquire.

use crate::error::Result;
use arrayvec::ArrayVec;
use core::{
    fmt,
    mem::ManuallyDrop,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};
use hex_display::HexDisplayExt as _;
use util::sync::{SleepLock, SleepLockGuard, SpinLock};

/// The size in bytes of one disk block.
pub const BLOCK_SIZE: usize = 1024;

/// The number of slots in the buffer pool.
///
/// This is a hard provisioning limit: a cache miss with every slot in use is
/// fatal.
pub const NBUF: usize = 30;

/// The number of hash buckets.
///
/// Using a prime number reduces the likelihood of collision clustering for
/// block numbers with regular strides.
pub const NBUCKET: usize = 17;

/// A synchronous block device, the storage collaborator behind the cache.
///
/// Both operations transfer exactly one block and do not return until the
/// transfer is complete.
pub trait BlockDevice: Send + Sync {
    /// Read the given block from the device into `data`.
    fn read_block(&self, dev: u32, blockno: u32, data: &mut [u8; BLOCK_SIZE]) -> Result<()>;
    /// Write `data` to the given block on the device.
    fn write_block(&self, dev: u32, blockno: u32, data: &[u8; BLOCK_SIZE]) -> Result<()>;
}

/// Identity and use count of one in-use slot, owned by its bucket.
struct Entry {
    /// The device id of the cached block.
    dev: u32,
    /// The block number of the cached block.
    blockno: u32,
    /// Index of the slot holding the block's content.
    slot: u16,
    /// Number of active holders; always greater than zero while the entry is
    /// in a bucket.
    refcnt: u32,
}

/// One eviction candidate: a slot no one is using.
struct Unused {
    /// Index of the idle slot.
    slot: u16,
    /// Tick at which the slot's last holder released it. Smaller is older,
    /// hence more evictable.
    released_at: u64,
}

/// A bucket's list of the entries currently hashed to it.
type Bucket = ArrayVec<Entry, NBUF>;

/// Content storage for one slot.
struct Slot {
    /// Whether `data` holds the content of the slot's current identity.
    ///
    /// Cleared (under the rebind path's spin locks) when the slot is bound
    /// to a new block; set once the block has been read in.
    valid: AtomicBool,
    /// The block payload, guarded by the slot's exclusive content lock.
    data: SleepLock<[u8; BLOCK_SIZE]>,
}

/// The block buffer cache.
///
/// One of these exists for the lifetime of the kernel; embedders typically
/// place it in a `static` behind a `util::cell::OnceLock`.
pub struct BufferCache<D: BlockDevice> {
    /// The device the cached blocks live on.
    device: D,
    /// The timer tick counter, incremented elsewhere and only read here.
    ticks: &'static AtomicU64,
    /// Per-bucket entry lists, independently locked.
    buckets: [SpinLock<Bucket>; NBUCKET],
    /// Slots with use count zero, keyed by release time for LRU eviction.
    ///
    /// This lock nests inside a bucket lock on the miss path, never the
    /// other way around.
    unused: SpinLock<ArrayVec<Unused, NBUF>>,
    /// The fixed pool of content slots.
    slots: [Slot; NBUF],
}

impl<D: BlockDevice> BufferCache<D> {
    /// Construct a cache over the given device and tick counter.
    ///
    /// Every slot starts out invalid and immediately evictable.
    pub fn new(device: D, ticks: &'static AtomicU64) -> Self {
        let mut unused = ArrayVec::new();
        for slot in 0..NBUF {
            unused.push(Unused {
                slot: slot as u16,
                released_at: 0,
            });
        }
        Self {
            device,
            ticks,
            buckets: core::array::from_fn(|_| SpinLock::new(Bucket::new())),
            unused: SpinLock::new(unused),
            slots: core::array::from_fn(|_| Slot {
                valid: AtomicBool::new(false),
                data: SleepLock::new([0; BLOCK_SIZE]),
            }),
        }
    }

    /// Return a locked buffer with the contents of the indicated block.
    ///
    /// If the block is not cached, the least recently used idle slot is
    /// rebound to it and filled from the device. The caller gets exclusive
    /// access to the content until the returned [`Buf`] is dropped.
    pub fn read(&self, dev: u32, blockno: u32) -> Result<Buf<'_, D>> {
        let mut buf = self.get(dev, blockno);
        if !self.slots[buf.slot].valid.load(Ordering::Acquire) {
            self.device.read_block(dev, blockno, &mut buf.data)?;
            self.slots[buf.slot].valid.store(true, Ordering::Release);
        }
        Ok(buf)
    }

    /// Look through the cache for the block; allocate a slot on a miss.
    ///
    /// In either case, return the buffer with its content lock held. Content
    /// validity is the caller's problem.
    fn get(&self, dev: u32, blockno: u32) -> Buf<'_, D> {
        let bucket_index = blockno as usize % NBUCKET;
        let mut bucket = self.buckets[bucket_index].lock();

        // Is the block already cached?
        if let Some(entry) = bucket
            .iter_mut()
            .find(|entry| entry.dev == dev && entry.blockno == blockno)
        {
            entry.refcnt += 1;
            let slot = usize::from(entry.slot);
            drop(bucket);
            // All spin guards are gone; now it's legal to suspend.
            let data = self.slots[slot].data.lock();
            return Buf {
                cache: self,
                dev,
                blockno,
                slot,
                data: ManuallyDrop::new(data),
            };
        }

        // Not cached. Claim the least recently released idle slot. The pool
        // lock nests inside the bucket lock we still hold, which keeps the
        // scan atomic against other misses, and makes a concurrent miss on
        // this same block wait at the bucket above rather than claim a
        // second slot for it.
        let mut unused = self.unused.lock();
        let Some(pos) = unused
            .iter()
            .enumerate()
            .min_by_key(|(_, candidate)| candidate.released_at)
            .map(|(pos, _)| pos)
        else {
            panic!("bcache: no buffers");
        };
        let Unused { slot, .. } = unused.remove(pos);
        let slot_index = usize::from(slot);
        log::trace!("bcache: rebind slot {slot_index} to ({dev}, {blockno})");
        self.slots[slot_index].valid.store(false, Ordering::Release);
        bucket.push(Entry {
            dev,
            blockno,
            slot,
            refcnt: 1,
        });
        drop(unused);
        drop(bucket);
        // All spin guards are gone; now it's legal to suspend. No one can
        // contend for this content lock yet except a racing `get` that found
        // the entry we just published, so this acquire is near-immediate.
        let data = self.slots[slot_index].data.lock();
        Buf {
            cache: self,
            dev,
            blockno,
            slot: slot_index,
            data: ManuallyDrop::new(data),
        }
    }

    /// Run `f` on the bucket entry for the given block.
    ///
    /// The entry must exist; a caller can only name blocks it holds a [`Buf`]
    /// for, so a miss here means the cache's own bookkeeping broke.
    fn with_entry<R>(&self, dev: u32, blockno: u32, f: impl FnOnce(&mut Entry) -> R) -> R {
        let mut bucket = self.buckets[blockno as usize % NBUCKET].lock();
        let Some(entry) = bucket
            .iter_mut()
            .find(|entry| entry.dev == dev && entry.blockno == blockno)
        else {
            panic!("bcache: held buffer missing from its bucket");
        };
        f(entry)
    }

    /// Release path shared by [`Buf::drop`].
    ///
    /// Decrements the use count under the bucket lock; the last holder
    /// unlinks the entry and stamps the slot into the eviction pool with the
    /// current tick.
    fn release(&self, dev: u32, blockno: u32, slot: usize) {
        let mut bucket = self.buckets[blockno as usize % NBUCKET].lock();
        let Some(pos) = bucket
            .iter()
            .position(|entry| entry.dev == dev && entry.blockno == blockno)
        else {
            panic!("bcache: held buffer missing from its bucket");
        };
        bucket[pos].refcnt -= 1;
        if bucket[pos].refcnt == 0 {
            // No one is waiting for it.
            bucket.swap_remove(pos);
            let released_at = self.ticks.load(Ordering::Relaxed);
            self.unused.lock().push(Unused {
                slot: slot as u16,
                released_at,
            });
        }
    }
}

/// An exclusively-held buffer, the witness that its content lock is held.
///
/// Dereferences to the block payload. Dropping it releases the buffer; the
/// operations that require the content lock ([`Buf::write`], mutation
/// through `DerefMut`) can only be expressed while the `Buf` is alive, so
/// the "must hold the lock" contract is discharged by construction.
pub struct Buf<'a, D: BlockDevice> {
    /// The cache that owns the slot.
    cache: &'a BufferCache<D>,
    /// The device id this buffer is bound to.
    dev: u32,
    /// The block number this buffer is bound to.
    blockno: u32,
    /// Index of the held slot.
    slot: usize,
    /// The content-lock guard, dropped by hand before the release-path
    /// bookkeeping runs.
    data: ManuallyDrop<SleepLockGuard<'a, [u8; BLOCK_SIZE]>>,
}

impl<D: BlockDevice> Buf<'_, D> {
    /// The device id this buffer is bound to.
    pub fn device_id(&self) -> u32 {
        self.dev
    }

    /// The block number this buffer is bound to.
    pub fn block_number(&self) -> u32 {
        self.blockno
    }

    /// Write the buffer's contents through to the device.
    pub fn write(&self) -> Result<()> {
        self.cache
            .device
            .write_block(self.dev, self.blockno, &self.data)
    }

    /// Take an extra reference on the underlying slot.
    ///
    /// The slot stays resident (never evicted) after this `Buf` is dropped,
    /// until a matching [`Buf::unpin`]. Used by callers such as a
    /// transactional log that revisit a block across several of their own
    /// operations.
    pub fn pin(&self) {
        self.cache
            .with_entry(self.dev, self.blockno, |entry| entry.refcnt += 1);
    }

    /// Drop a reference previously taken with [`Buf::pin`].
    pub fn unpin(&self) {
        self.cache
            .with_entry(self.dev, self.blockno, |entry| entry.refcnt -= 1);
    }
}

impl<D: BlockDevice> core::ops::Deref for Buf<'_, D> {
    type Target = [u8; BLOCK_SIZE];
    fn deref(&self) -> &Self::Target {
        &self.data
    }
}
impl<D: BlockDevice> core::ops::DerefMut for Buf<'_, D> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

impl<D: BlockDevice> fmt::Debug for Buf<'_, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Buf({}:{} {}..)",
            self.dev,
            self.blockno,
            self[..8].hex()
        )
    }
}

impl<D: BlockDevice> Drop for Buf<'_, D> {
    fn drop(&mut self) {
        // The content lock must go first: the release bookkeeping takes the
        // bucket spin lock, and a spin lock may not be held while anyone
        // could be suspended on this slot.
        //
        // SAFETY:
        // The guard is dropped exactly once, here; `self.data` is never
        // touched again.
        unsafe { ManuallyDrop::drop(&mut self.data) };
        self.cache.release(self.dev, self.blockno, self.slot);
    }
}
