//! Test coverage of the disk block buffer cache.

use kcore::bcache::{BLOCK_SIZE, BlockDevice, BufferCache, NBUF};
use kcore::error::Result;
use std::collections::HashMap;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

/// The content a block has before anything is ever written to it.
fn initial_content(dev: u32, blockno: u32) -> [u8; BLOCK_SIZE] {
    core::array::from_fn(|i| (dev as usize * 31 + blockno as usize * 7 + i) as u8)
}

/// An in-memory block device with instrumented transfer counters.
///
/// Clones share the same backing store, so a test can keep a handle to the
/// disk after moving another one into the cache.
#[derive(Clone)]
struct RamDisk {
    inner: Arc<RamDiskInner>,
}
struct RamDiskInner {
    blocks: Mutex<HashMap<(u32, u32), [u8; BLOCK_SIZE]>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}
impl RamDisk {
    fn new() -> Self {
        Self {
            inner: Arc::new(RamDiskInner {
                blocks: Mutex::new(HashMap::new()),
                reads: AtomicUsize::new(0),
                writes: AtomicUsize::new(0),
            }),
        }
    }

    fn reads(&self) -> usize {
        self.inner.reads.load(Ordering::Relaxed)
    }

    fn writes(&self) -> usize {
        self.inner.writes.load(Ordering::Relaxed)
    }

    fn stored(&self, dev: u32, blockno: u32) -> Option<[u8; BLOCK_SIZE]> {
        self.inner
            .blocks
            .lock()
            .expect("Disk mutex should not be poisoned")
            .get(&(dev, blockno))
            .copied()
    }
}
impl BlockDevice for RamDisk {
    fn read_block(&self, dev: u32, blockno: u32, data: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        self.inner.reads.fetch_add(1, Ordering::Relaxed);
        *data = self
            .stored(dev, blockno)
            .unwrap_or_else(|| initial_content(dev, blockno));
        Ok(())
    }

    fn write_block(&self, dev: u32, blockno: u32, data: &[u8; BLOCK_SIZE]) -> Result<()> {
        self.inner.writes.fetch_add(1, Ordering::Relaxed);
        self.inner
            .blocks
            .lock()
            .expect("Disk mutex should not be poisoned")
            .insert((dev, blockno), *data);
        Ok(())
    }
}

#[test]
fn test_read_caches_block_content() {
    static TICKS: AtomicU64 = AtomicU64::new(0);
    let disk = RamDisk::new();
    let cache = BufferCache::new(disk.clone(), &TICKS);

    let buf = cache.read(1, 4).expect("Read should succeed");
    assert_eq!(*buf, initial_content(1, 4), "Content should come from disk");
    assert!(
        format!("{buf:?}").starts_with("Buf(1:4 "),
        "Debug form should name the identity"
    );
    drop(buf);

    let buf = cache.read(1, 4).expect("Read should succeed");
    assert_eq!(*buf, initial_content(1, 4), "Content should be unchanged");
    assert_eq!(disk.reads(), 1, "Second read should be served from cache");
}

#[test]
fn test_colliding_blocks_coexist() {
    static TICKS: AtomicU64 = AtomicU64::new(0);
    let disk = RamDisk::new();
    let cache = BufferCache::new(disk.clone(), &TICKS);

    // 5, 22, and 39 all hash to the same bucket (mod 17).
    let a = cache.read(1, 5).expect("Read should succeed");
    let b = cache.read(1, 22).expect("Read should succeed");
    let c = cache.read(1, 39).expect("Read should succeed");
    assert_eq!(*a, initial_content(1, 5));
    assert_eq!(*b, initial_content(1, 22));
    assert_eq!(*c, initial_content(1, 39));
    drop((a, b, c));

    let _a = cache.read(1, 5).expect("Read should succeed");
    let _b = cache.read(1, 22).expect("Read should succeed");
    assert_eq!(
        disk.reads(),
        3,
        "Colliding entries should stay distinct, not evict each other"
    );
}

#[test]
fn test_lru_eviction_order() {
    static TICKS: AtomicU64 = AtomicU64::new(0);
    let disk = RamDisk::new();
    let cache = BufferCache::new(disk.clone(), &TICKS);

    // Touch every slot, releasing block b at tick b.
    for b in 0..NBUF as u32 {
        drop(cache.read(1, b).expect("Read should succeed"));
        TICKS.fetch_add(1, Ordering::Relaxed);
    }
    assert_eq!(disk.reads(), NBUF);

    // The next miss must claim the slot with the oldest release: block 0's.
    drop(cache.read(1, 1000).expect("Read should succeed"));
    assert_eq!(disk.reads(), NBUF + 1);

    drop(cache.read(1, 1).expect("Read should succeed"));
    assert_eq!(disk.reads(), NBUF + 1, "Block 1 should still be cached");

    drop(cache.read(1, 0).expect("Read should succeed"));
    assert_eq!(disk.reads(), NBUF + 2, "Block 0 should have been evicted");
}

#[test]
fn test_write_reaches_device() {
    static TICKS: AtomicU64 = AtomicU64::new(0);
    let disk = RamDisk::new();
    let cache = BufferCache::new(disk.clone(), &TICKS);

    let mut buf = cache.read(3, 9).expect("Read should succeed");
    buf[..4].copy_from_slice(b"tag!");
    buf.write().expect("Write should succeed");
    drop(buf);

    assert_eq!(disk.writes(), 1);
    let stored = disk.stored(3, 9).expect("Block should now be on disk");
    assert_eq!(&stored[..4], b"tag!");
    let mut expected = initial_content(3, 9);
    expected[..4].copy_from_slice(b"tag!");
    assert_eq!(stored, expected, "Unmodified bytes should round trip");
}

#[test]
#[should_panic(expected = "bcache: no buffers")]
fn test_pool_exhaustion_is_fatal() {
    static TICKS: AtomicU64 = AtomicU64::new(0);
    let cache = BufferCache::new(RamDisk::new(), &TICKS);

    let mut held = Vec::new();
    for b in 0..NBUF as u32 {
        held.push(cache.read(1, b).expect("Read should succeed"));
    }
    // Every slot is in use; one more distinct block has nowhere to go.
    let _ = cache.read(1, 500);
}

#[test]
fn test_pin_keeps_block_resident() {
    static TICKS: AtomicU64 = AtomicU64::new(0);
    let disk = RamDisk::new();
    let cache = BufferCache::new(disk.clone(), &TICKS);

    let buf = cache.read(2, 3).expect("Read should succeed");
    buf.pin();
    drop(buf);
    assert_eq!(disk.reads(), 1);

    // Churn more blocks through the cache than there are slots.
    for b in 100..100 + NBUF as u32 {
        drop(cache.read(1, b).expect("Read should succeed"));
    }
    let reads_after_churn = disk.reads();

    let buf = cache.read(2, 3).expect("Read should succeed");
    assert_eq!(
        disk.reads(),
        reads_after_churn,
        "Pinned block should have survived the churn"
    );
    buf.unpin();
    drop(buf);

    // Unpinned, the slot is an eviction candidate again.
    for b in 200..200 + NBUF as u32 {
        drop(cache.read(1, b).expect("Read should succeed"));
    }
    let reads_before_reload = disk.reads();
    drop(cache.read(2, 3).expect("Read should succeed"));
    assert_eq!(
        disk.reads(),
        reads_before_reload + 1,
        "Unpinned block should eventually be evicted"
    );
}

#[test]
fn test_same_block_updates_serialize() {
    static TICKS: AtomicU64 = AtomicU64::new(0);
    let cache = BufferCache::new(RamDisk::new(), &TICKS);

    {
        let mut buf = cache.read(1, 7).expect("Read should succeed");
        buf.fill(0);
    }

    std::thread::scope(|s| {
        for _ in 0..4 {
            let cache = &cache;
            s.spawn(move || {
                for _ in 0..250 {
                    let mut buf = cache.read(1, 7).expect("Read should succeed");
                    let value = u64::from_le_bytes(buf[..8].try_into().expect("8 bytes"));
                    buf[..8].copy_from_slice(&(value + 1).to_le_bytes());
                }
            });
        }
    });

    let buf = cache.read(1, 7).expect("Read should succeed");
    let value = u64::from_le_bytes(buf[..8].try_into().expect("8 bytes"));
    assert_eq!(
        value, 1000,
        "Every update should have happened under the content lock"
    );
}

#[test]
fn test_cache_in_static() {
    static TICKS: AtomicU64 = AtomicU64::new(0);
    static CACHE: util::cell::OnceLock<BufferCache<RamDisk>> = util::cell::OnceLock::new();

    assert!(
        CACHE.set(BufferCache::new(RamDisk::new(), &TICKS)).is_ok(),
        "First initialization should win"
    );
    let cache = CACHE.get().expect("Cache should be initialized");
    let buf = cache.read(1, 11).expect("Read should succeed");
    assert_eq!(*buf, initial_content(1, 11));
}
