// Kernel tunables, mirroring xv6-riscv's param.h.

pub const NPROC: usize = 64; // maximum number of processes
pub const NCPU: usize = 8; // maximum number of CPUs
pub const NOFILE: usize = 16; // open files per process
pub const NFILE: usize = 100; // open files per system
pub const NINODE: usize = 50; // maximum number of active i-nodes
pub const NDEV: usize = 10; // maximum major device number
pub const ROOTDEV: u32 = 1; // device number of file system root disk
pub const MAXARG: usize = 32; // max exec arguments
pub const MAXOPBLOCKS: usize = 10; // max # of blocks any FS op writes
pub const LOGSIZE: usize = MAXOPBLOCKS * 3; // max data blocks in on-disk log
pub const NBUF: usize = MAXOPBLOCKS * 3; // size of disk block cache
pub const FSSIZE: usize = 10000; // size of file system in blocks
pub const MAXPATH: usize = 128; // maximum file path name

// block cache hash table.
pub const NBUFMAP_BUCKET: usize = 13;
#[macro_export]
macro_rules! BUFMAP_HASH {
    ( $dev:expr, $blockno:expr ) => {
        ((($dev as usize) << 27) | ($blockno as usize)) % $crate::param::NBUFMAP_BUCKET
    };
}

// per-hart free-list stealing: how many frames to grab from a peer's
// list at once when our own list runs dry.
pub const KALLOC_STEAL: usize = 64;

// maximum symlink chain length before ELOOP.
pub const MAXSYMLINKS: usize = 10;

// number of VMAs (mmap regions) tracked per process.
pub const NVMA: usize = 16;

#[cfg(test)]
mod tests {
    #[test]
    fn bufmap_hash_stays_in_bucket_range() {
        for dev in 0..4u32 {
            for blockno in 0..10_000u32 {
                let key = BUFMAP_HASH!(dev, blockno);
                assert!(key < super::NBUFMAP_BUCKET);
            }
        }
    }

    #[test]
    fn bufmap_hash_is_a_pure_function_of_dev_and_blockno() {
        assert_eq!(BUFMAP_HASH!(1u32, 42u32), BUFMAP_HASH!(1u32, 42u32));
    }

    #[test]
    fn bufmap_hash_distinguishes_some_dev_pairs() {
        // same blockno, different dev: not required to always differ, but
        // with only one device in use in this kernel (ROOTDEV) the common
        // case is dev 0/1 landing in different buckets for at least one
        // sample blockno, guarding against an accidental dev-invariant hash.
        let differs = (0..64u32).any(|b| BUFMAP_HASH!(0u32, b) != BUFMAP_HASH!(1u32, b));
        assert!(differs);
    }
}
