use core::ptr;
use core::sync::atomic::{AtomicU8, Ordering};

use crate::memlayout::{KERNBASE, PHYSTOP};
use crate::param::{KALLOC_STEAL, NCPU};
use crate::proc::cpuid;
use crate::riscv::PGSIZE;
use crate::spinlock::Spinlock;
use crate::string::memset;
use crate::PGROUNDUP;

extern "C" {
    // first address after kernel.
    // defined by kernel.ld.
    static mut end: u8;
}

// Fill patterns so a stale reference through a freed or just-allocated
// page surfaces as an obviously wrong value rather than silently reading
// whatever was there before.
const KFREE_SCRUB: u8 = 1;
const KALLOC_SCRUB: u8 = 5;

struct Run {
    next: *mut Run,
}

unsafe impl Send for Run {}

/// One hart's free list. Physical pages bounce between these lists only
/// when a hart's own list runs dry (work-stealing), so the common case
/// never contends across harts.
struct FreeList {
    lock: Spinlock,
    freelist: *mut Run,
}

impl FreeList {
    const fn create(name: &'static str) -> Self {
        Self {
            lock: Spinlock::init_lock(name),
            freelist: ptr::null_mut(),
        }
    }
}

pub struct KMem {
    lists: [FreeList; NCPU],
}

pub static mut KMEM: KMem = KMem::create();

impl KMem {
    const fn create() -> Self {
        // NCPU is small and fixed; this avoids requiring FreeList: Copy.
        Self {
            lists: [
                FreeList::create("kmem_cpu"), FreeList::create("kmem_cpu"),
                FreeList::create("kmem_cpu"), FreeList::create("kmem_cpu"),
                FreeList::create("kmem_cpu"), FreeList::create("kmem_cpu"),
                FreeList::create("kmem_cpu"), FreeList::create("kmem_cpu"),
            ],
        }
    }

    pub fn kinit() {
        unsafe {
            KMEM.freerange((&mut end) as *mut u8, PHYSTOP as *mut u8);
        }
    }

    // Hand out physical RAM from end..PHYSTOP, round-robining pages
    // across every hart's free list so that work-stealing has less to do
    // once processes start running.
    fn freerange<T: Sized>(self: &mut Self, pa_start: *mut T, pa_end: *mut T) {
        let mut p = PGROUNDUP!(pa_start);
        let mut hart = 0usize;
        while p + PGSIZE <= pa_end as usize {
            self.free_to(hart, p as *mut u8);
            p += PGSIZE;
            hart = (hart + 1) % NCPU;
        }
    }

    fn free_to(self: &mut Self, hart: usize, pa: *mut u8) {
        memset(pa, KFREE_SCRUB, PGSIZE);
        let r = pa as *mut Run;
        let list = &mut self.lists[hart];
        list.lock.acquire();
        unsafe {
            (*r).next = list.freelist;
        }
        list.freelist = r;
        list.lock.release();
        page_ref_set(pa as usize, 0);
    }

    /// Free the page of physical memory pointed at by pa, which normally
    /// should have been returned by a call to kalloc(). Pages shared by a
    /// copy-on-write fork are only actually returned to a free list once
    /// their reference count drops to zero.
    pub fn kfree<T: Sized>(self: &mut Self, pa: *mut T) {
        let pa_usize = pa as usize;
        unsafe {
            if pa_usize % PGSIZE != 0
                || pa_usize < ((&end) as *const u8) as usize
                || pa_usize >= PHYSTOP
            {
                panic!("kfree");
            }
        }

        if page_ref_dec(pa_usize) > 0 {
            // still mapped elsewhere (e.g. a COW sibling); keep the frame.
            return;
        }

        self.free_to(cpuid(), pa as *mut u8);
    }

    /// Allocate one 4096-byte page of physical memory, from this hart's
    /// own list, stealing from other harts' lists if it runs dry.
    /// Returns a null pointer if no memory is available anywhere.
    pub fn kalloc<T: Sized>(self: &mut Self) -> *mut T {
        let me = cpuid();
        let r = self.pop(me);
        let r = match r {
            Some(r) => r,
            None => match self.steal(me) {
                Some(r) => r,
                None => return ptr::null_mut(),
            },
        };

        memset(r as *mut u8, KALLOC_SCRUB, PGSIZE); // fill with junk
        page_ref_set(r as usize, 1);
        r as *mut T
    }

    fn pop(self: &mut Self, hart: usize) -> Option<*mut u8> {
        let list = &mut self.lists[hart];
        list.lock.acquire();
        let r = list.freelist;
        if !r.is_null() {
            unsafe {
                list.freelist = (*r).next;
            }
        }
        list.lock.release();
        if r.is_null() {
            None
        } else {
            Some(r as *mut u8)
        }
    }

    // Steal up to KALLOC_STEAL pages from one peer hart at a time, each
    // under that peer's own lock alone, so that no two hart locks are
    // ever held at once. Returns one stolen page for immediate use and
    // leaves the rest on our own list.
    fn steal(self: &mut Self, me: usize) -> Option<*mut u8> {
        for i in 1..NCPU {
            let victim = (me + i) % NCPU;
            if victim == me {
                continue;
            }

            let mut stolen: *mut Run = ptr::null_mut();
            let mut count = 0usize;
            {
                let list = &mut self.lists[victim];
                list.lock.acquire();
                while count < KALLOC_STEAL && !list.freelist.is_null() {
                    let head = list.freelist;
                    unsafe {
                        list.freelist = (*head).next;
                        (*head).next = stolen;
                    }
                    stolen = head;
                    count += 1;
                }
                list.lock.release();
            }

            if stolen.is_null() {
                continue;
            }

            // pull one off for the caller, park the rest on our own list.
            let taken = stolen;
            let rest = unsafe { (*taken).next };

            if !rest.is_null() {
                let mine = &mut self.lists[me];
                mine.lock.acquire();
                let mut tail = rest;
                loop {
                    let next = unsafe { (*tail).next };
                    if next.is_null() {
                        break;
                    }
                    tail = next;
                }
                unsafe {
                    (*tail).next = mine.freelist;
                }
                mine.freelist = rest;
                mine.lock.release();
            }

            return Some(taken as *mut u8);
        }
        None
    }
}

// ------------------------------------------------------------------
// Per-frame reference counts, used by copy-on-write fork.
// ------------------------------------------------------------------

const NFRAMES: usize = (PHYSTOP - KERNBASE) / PGSIZE;

struct RefTable {
    lock: Spinlock,
    counts: [AtomicU8; NFRAMES],
}

#[allow(clippy::declare_interior_mutable_const)]
const ZERO: AtomicU8 = AtomicU8::new(0);

static mut REFS: RefTable = RefTable {
    lock: Spinlock::init_lock("kref"),
    counts: [ZERO; NFRAMES],
};

fn frame_index(pa: usize) -> usize {
    (pa - KERNBASE) / PGSIZE
}

pub fn page_ref_get(pa: usize) -> u8 {
    unsafe { REFS.counts[frame_index(pa)].load(Ordering::Relaxed) }
}

pub fn page_ref_set(pa: usize, v: u8) {
    unsafe {
        REFS.counts[frame_index(pa)].store(v, Ordering::Relaxed);
    }
}

/// Bump pa's reference count (a COW fork sharing it with a new mapping).
pub fn page_ref_inc(pa: usize) {
    unsafe {
        REFS.lock.acquire();
        let idx = frame_index(pa);
        let cur = REFS.counts[idx].load(Ordering::Relaxed);
        REFS.counts[idx].store(cur.saturating_add(1), Ordering::Relaxed);
        REFS.lock.release();
    }
}

/// Drop pa's reference count by one, returning the count afterwards.
fn page_ref_dec(pa: usize) -> u8 {
    unsafe {
        REFS.lock.acquire();
        let idx = frame_index(pa);
        let cur = REFS.counts[idx].load(Ordering::Relaxed);
        let next = cur.saturating_sub(1);
        REFS.counts[idx].store(next, Ordering::Relaxed);
        REFS.lock.release();
        next
    }
}

#[cfg(test)]
mod tests {
    // frame_index is the only piece of this module that is pure enough to
    // unit test without a booted allocator behind it.
    #[test]
    fn frame_index_is_page_granular() {
        let a = super::frame_index(super::KERNBASE);
        let b = super::frame_index(super::KERNBASE + super::PGSIZE);
        assert_eq!(b, a + 1);
    }
}
