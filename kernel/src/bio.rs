// Buffer cache.
//
// The buffer cache is split into NBUFMAP_BUCKET independent hash
// buckets, each its own singly-linked chain guarded by its own
// spinlock, keyed by BUFMAP_HASH!(dev, blockno). A lookup only ever
// takes its own bucket's lock, so two harts working on blocks that
// hash to different buckets never contend.
//
// When a lookup misses, eviction has to consider every buffer in the
// cache (the globally least-recently-used one with refcnt == 0), which
// means touching other buckets. That is serialized by a single
// evict_lock so only one hart is ever mid-eviction at a time; the
// lock is not held on the (by far more common) hit path.
//
// Interface:
// * To get a buffer for a particular disk block, call bread.
// * After changing buffer data, call bwrite to write it to disk.
// * When done with the buffer, call brelse.
// * Do not use the buffer after calling brelse.
// * Only one process at a time can use a buffer,
//     so do not keep them longer than necessary.

use core::ptr::NonNull;

use crate::buf::Buf;
use crate::param::NBUF;
use crate::spinlock::Spinlock;
use crate::virtio::virtio_disk::virtio_disk_rw;
use crate::BUFMAP_HASH;
use crate::param::NBUFMAP_BUCKET;

#[derive(Copy, Clone)]
struct Bucket {
    lock: Spinlock,
    head: Option<NonNull<Buf>>,
}

impl Bucket {
    const fn create() -> Self {
        Self { lock: Spinlock::init_lock("bcache.bucket"), head: None }
    }
}

unsafe impl Send for Bucket {}
unsafe impl Sync for Bucket {}

struct BCache {
    buf: [Buf; NBUF],
    buckets: [Bucket; NBUFMAP_BUCKET],
    evict_lock: Spinlock,
}

unsafe impl Send for BCache {}
unsafe impl Sync for BCache {}

static mut BCACHE: BCache = BCache {
    buf: [Buf::new(); NBUF],
    buckets: [Bucket::create(); NBUFMAP_BUCKET],
    evict_lock: Spinlock::init_lock("bcache.evict"),
};

static mut TICK: u32 = 0;

pub fn binit() {
    unsafe {
        // scatter every buffer across the buckets so each one starts out
        // reachable (and therefore evictable) before it's ever used for a
        // real (dev, blockno).
        for i in 0..NBUF {
            let bucket = i % NBUFMAP_BUCKET;
            let b = &mut BCACHE.buf[i] as *mut Buf;
            (*b).next = BCACHE.buckets[bucket].head;
            BCACHE.buckets[bucket].head = NonNull::new(b);
        }
    }
}

// search bucket `key`'s chain for (dev, blockno); bump refcnt and
// return it if found. Caller must hold bucket[key].lock.
unsafe fn find_in_bucket(key: usize, dev: u32, blockno: u32) -> Option<&'static mut Buf> {
    let mut cur = BCACHE.buckets[key].head;
    while let Some(ptr) = cur {
        let b = ptr.as_ptr().as_mut().unwrap();
        if b.dev == dev && b.blockno == blockno {
            b.refcnt += 1;
            return Some(b);
        }
        cur = b.next;
    }
    None
}

// Look through buffer cache for block on device dev.
// If not found, allocate a buffer.
// In either case, return locked buffer.
fn bget(dev: u32, blockno: u32) -> &'static mut Buf {
    let key = BUFMAP_HASH!(dev, blockno);

    unsafe {
        BCACHE.buckets[key].lock.acquire();
        if let Some(b) = find_in_bucket(key, dev, blockno) {
            BCACHE.buckets[key].lock.release();
            b.lock.acquire_sleep();
            return b;
        }
        BCACHE.buckets[key].lock.release();

        // not cached. Serialize the whole evict-and-relink sequence so
        // two harts can never pick the same victim buffer.
        BCACHE.evict_lock.acquire();

        // someone may have created the entry for (dev, blockno) between
        // our release above and the evict_lock acquire; check again.
        BCACHE.buckets[key].lock.acquire();
        if let Some(b) = find_in_bucket(key, dev, blockno) {
            BCACHE.buckets[key].lock.release();
            BCACHE.evict_lock.release();
            b.lock.acquire_sleep();
            return b;
        }
        BCACHE.buckets[key].lock.release();

        // scan every bucket for the buffer with refcnt == 0 and the
        // smallest last-use tick, tracking the node before it so we can
        // unlink it from its (singly-linked) chain.
        let mut holding_bucket: Option<usize> = None;
        let mut before_victim: Option<*mut Buf> = None; // None means "at the head"
        let mut victim: Option<*mut Buf> = None;
        let mut victim_tick = u32::MAX;

        for i in 0..NBUFMAP_BUCKET {
            BCACHE.buckets[i].lock.acquire();

            let mut found_here = false;
            let mut prev: Option<*mut Buf> = None;
            let mut cur = BCACHE.buckets[i].head;
            while let Some(ptr) = cur {
                let b = ptr.as_ptr();
                if (*b).refcnt == 0 && (victim.is_none() || (*b).tick < victim_tick) {
                    victim = Some(b);
                    victim_tick = (*b).tick;
                    before_victim = prev;
                    found_here = true;
                }
                prev = Some(b);
                cur = (*b).next;
            }

            if found_here {
                if let Some(held) = holding_bucket {
                    BCACHE.buckets[held].lock.release();
                }
                holding_bucket = Some(i);
            } else {
                BCACHE.buckets[i].lock.release();
            }
        }

        let victim = victim.unwrap_or_else(|| panic!("bget: no buffers"));
        let held = holding_bucket.unwrap();

        if held != key {
            // unlink victim from its old bucket.
            match before_victim {
                Some(prev) => (*prev).next = (*victim).next,
                None => BCACHE.buckets[held].head = (*victim).next,
            }
            BCACHE.buckets[held].lock.release();

            BCACHE.buckets[key].lock.acquire();
            (*victim).next = BCACHE.buckets[key].head;
            BCACHE.buckets[key].head = NonNull::new(victim);
        }

        (*victim).dev = dev;
        (*victim).blockno = blockno;
        (*victim).valid = false;
        (*victim).refcnt = 1;
        BCACHE.buckets[key].lock.release();
        BCACHE.evict_lock.release();

        let b = victim.as_mut().unwrap();
        b.lock.acquire_sleep();
        b
    }
}

// Return a locked buf with the contents of the indicated block.
pub fn bread(dev: u32, blockno: u32) -> &'static mut Buf {
    let b = bget(dev, blockno);
    if !b.valid {
        unsafe { virtio_disk_rw(b, false) };
        b.valid = true
    }

    return b;
}

// Write b's contents to disk.  Must be locked.
pub fn bwrite(b: &mut Buf) {
    if !b.lock.holding_sleep() {
        panic!("bwrite");
    }
    unsafe {
        virtio_disk_rw(b, true);
    }
}

// Release a locked buffer. Just stamps its last-use tick; it stays
// wherever it is in the hash table, no list to re-splice.
pub fn brelse(b: &mut Buf) {
    if !b.lock.holding_sleep() {
        panic!("brelse");
    }

    b.lock.release_sleep();

    let key = BUFMAP_HASH!(b.dev, b.blockno);
    unsafe {
        BCACHE.buckets[key].lock.acquire();
        b.refcnt -= 1;
        if b.refcnt == 0 {
            TICK += 1;
            b.tick = TICK;
        }
        BCACHE.buckets[key].lock.release();
    }
}

pub fn bpin(b: &mut Buf) {
    let key = BUFMAP_HASH!(b.dev, b.blockno);
    unsafe {
        BCACHE.buckets[key].lock.acquire();
        b.refcnt += 1;
        BCACHE.buckets[key].lock.release();
    }
}

pub fn bunpin(b: *mut Buf) {
    unsafe {
        let b = b.as_mut().unwrap();
        let key = BUFMAP_HASH!(b.dev, b.blockno);
        BCACHE.buckets[key].lock.acquire();
        b.refcnt -= 1;
        BCACHE.buckets[key].lock.release();
    }
}
