use crate::file::FDType::{FD_DEVICE, FD_INODE, FD_NONE, FD_PIPE};
use crate::file::{File, DEVSW};
use crate::fs::BSIZE;
use crate::log::{begin_op, end_op};
use crate::param::{MAXOPBLOCKS, NFILE};
use crate::pipe::{piperead, pipewrite};
use crate::proc::myproc;
use crate::spinlock::Spinlock;
use crate::stat::Stat;
use crate::vm::copyout;

struct FTable {
    lock: Spinlock,
    file: [File; NFILE]
}

static mut FTABLE: FTable = FTable {
    lock: Spinlock::init_lock("ftable"),
    file: [File::create(); NFILE],
};

pub fn fileinit() {
    // empty due to FTABLE has already been initialized
}

// Allocate a file structure.
pub fn filealloc() -> Option<&'static mut File> {
    unsafe {
        FTABLE.lock.acquire();
        for f in &mut FTABLE.file {
            if f.ref_cnt == 0 {
                f.ref_cnt = 1;
                FTABLE.lock.release();
                return Some(f);
            }
        }

        FTABLE.lock.release();
        return None;
    }
}

// Increment ref count for file f.
pub(crate) fn filedup(f: *mut File) {
    unsafe {
        FTABLE.lock.acquire();
        let f = f.as_mut().unwrap();
        if f.ref_cnt < 1 {
            panic!("filedup")
        }

        f.ref_cnt += 1;
        FTABLE.lock.release();
    }
}

// Close file f.  (Decrement ref count, close when reaches 0.)
pub(crate) fn fileclose(f: &mut File) {
    unsafe {
        FTABLE.lock.acquire();
        if f.ref_cnt < 1 {
            panic!("fileclose");
        }

        f.ref_cnt -= 1;
        if f.ref_cnt > 0 {
            FTABLE.lock.release();
            return;
        }

        let file_type = f.file_type;
        let pipe = f.pipe;
        let writable = f.writable;
        let ip = f.ip;

        f.ref_cnt = 0;
        f.file_type = FD_NONE;
        FTABLE.lock.release();

        if file_type == FD_PIPE {
            pipe.unwrap().as_mut().unwrap().close(writable);
        } else if file_type == FD_INODE || file_type == FD_DEVICE {
            begin_op();
            ip.unwrap().as_mut().unwrap().iput();
            end_op();
        }
    }
}

// Get metadata about file f, writing a Stat into the user-space
// pointer addr. Returns 0 on success, -1 on error.
pub(crate) fn filestat(f: &mut File, addr: usize) -> i32 {
    let p = myproc();

    if f.file_type == FD_INODE || f.file_type == FD_DEVICE {
        let ip = unsafe { f.ip.unwrap().as_mut().unwrap() };
        ip.ilock();
        let st = Stat {
            dev: ip.dev as i32,
            ino: ip.inum,
            file_type: ip.file_type as i16,
            nlink: ip.nlink,
            size: ip.size as u64,
        };
        ip.iunlock();

        if copyout(
            unsafe { p.pagetable.unwrap().as_mut().unwrap() },
            addr,
            &st as *const Stat as *const u8,
            core::mem::size_of::<Stat>(),
        ) < 0
        {
            return -1;
        }
        return 0;
    }
    -1
}

// Read from file f into addr (a user virtual address), at most n bytes.
// Returns bytes read, or -1 on error.
pub(crate) fn fileread(f: &mut File, addr: usize, n: usize) -> i32 {
    if !f.readable {
        return -1;
    }

    match f.file_type {
        FD_PIPE => piperead(unsafe { f.pipe.unwrap().as_mut().unwrap() }, true, addr, n),
        FD_DEVICE => {
            if f.major < 0 || f.major as usize >= crate::param::NDEV {
                return -1;
            }
            let devsw = unsafe { DEVSW[f.major as usize] };
            match devsw {
                Some(d) => (d.read)(true, addr, n),
                None => -1,
            }
        }
        FD_INODE => {
            let ip = unsafe { f.ip.unwrap().as_mut().unwrap() };
            ip.ilock();
            let r = ip.readi(true, addr as *mut u8, f.off, n);
            if r > 0 {
                f.off += r as u32;
            }
            ip.iunlock();
            r as i32
        }
        _ => panic!("fileread"),
    }
}

// Write to file f from addr (a user virtual address), n bytes total.
// Chunks inode writes so each transaction stays within the log's
// worst-case block budget.
pub(crate) fn filewrite(f: &mut File, addr: usize, n: usize) -> i32 {
    if !f.writable {
        return -1;
    }

    match f.file_type {
        FD_PIPE => pipewrite(unsafe { f.pipe.unwrap().as_mut().unwrap() }, true, addr, n),
        FD_DEVICE => {
            if f.major < 0 || f.major as usize >= crate::param::NDEV {
                return -1;
            }
            let devsw = unsafe { DEVSW[f.major as usize] };
            match devsw {
                Some(d) => (d.write)(true, addr, n),
                None => -1,
            }
        }
        FD_INODE => {
            // max bytes to write per transaction, leaving headroom for
            // the inode block itself plus a couple of indirect blocks.
            let max = ((MAXOPBLOCKS - 1 - 1 - 2) / 2) * BSIZE;
            let mut i = 0;
            while i < n {
                let mut n1 = n - i;
                if n1 > max {
                    n1 = max;
                }

                begin_op();
                let ip = unsafe { f.ip.unwrap().as_mut().unwrap() };
                ip.ilock();
                let r = ip.writei(true, (addr + i) as *mut u8, f.off, n1);
                if r > 0 {
                    f.off += r as u32;
                }
                ip.iunlock();
                end_op();

                if r != n1 as isize {
                    break;
                }
                i += r as usize;
            }
            if i == n { n as i32 } else { -1 }
        }
        _ => panic!("filewrite"),
    }
}
