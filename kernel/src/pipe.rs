use crate::file::{File, FDType};
use crate::file::file::{filealloc, fileclose};
use crate::kalloc::KMEM;
use crate::proc::{either_copyin, either_copyout, myproc, sleep, wakeup};
use crate::spinlock::Spinlock;

const PIPESIZE: usize = 512;

pub struct Pipe {
    lock: Spinlock,
    data: [u8; PIPESIZE],
    nread: u32, // number of bytes read
    nwrite: u32, // number of bytes written
    readopen: bool, // read fd is still open
    writeopen: bool, // write fd is still open
}

impl Pipe {
    const fn create() -> Self {
        Self {
            lock: Spinlock::init_lock("pipe"),
            data: [0; PIPESIZE],
            nread: 0,
            nwrite: 0,
            readopen: true,
            writeopen: true,
        }
    }

    pub(crate) fn close(self: &mut Self, writable: bool) {
        self.lock.acquire();
        if writable {
            self.writeopen = false;
            wakeup(&self.nread);
        } else {
            self.readopen = false;
            wakeup(&self.nwrite);
        }
        if !self.readopen && !self.writeopen {
            self.lock.release();
            unsafe { KMEM.kfree(self as *mut Pipe); }
        } else {
            self.lock.release();
        }
    }
}

// Allocate a pipe: a page-sized Pipe plus a pair of File objects wired
// to it, one readable, one writable. Takes no ownership on failure.
pub fn pipealloc<'a>() -> Option<(&'a mut File, &'a mut File)> {
    let rf = filealloc()?;
    let wf = match filealloc() {
        Some(wf) => wf,
        None => {
            rf.ref_cnt = 0;
            return None;
        }
    };

    let pipe_ptr: *mut Pipe = unsafe { KMEM.kalloc() };
    if pipe_ptr.is_null() {
        rf.ref_cnt = 0;
        wf.ref_cnt = 0;
        return None;
    }
    unsafe { pipe_ptr.write(Pipe::create()); }

    rf.file_type = FDType::FD_PIPE;
    rf.readable = true;
    rf.writable = false;
    rf.pipe = Some(pipe_ptr);

    wf.file_type = FDType::FD_PIPE;
    wf.readable = false;
    wf.writable = true;
    wf.pipe = Some(pipe_ptr);

    Some((rf, wf))
}

/// Blocking write: sleeps on nread while the ring is full, wakes readers
/// after each byte batch. Fails if the read end has already closed.
pub fn pipewrite(pipe: &mut Pipe, is_user_src: bool, addr: usize, n: usize) -> i32 {
    let p = myproc();
    let mut i: usize = 0;

    pipe.lock.acquire();
    while i < n {
        if !pipe.readopen || p.killed() != 0 {
            pipe.lock.release();
            return -1;
        }
        if pipe.nwrite == pipe.nread + PIPESIZE as u32 {
            // buffer full: wake any waiting reader, go to sleep.
            wakeup(&pipe.nread);
            sleep(&pipe.nwrite, &mut pipe.lock);
            continue;
        }

        let mut ch: u8 = 0;
        if either_copyin(&mut ch as *mut u8, is_user_src, addr + i, 1) == -1 {
            break;
        }
        let idx = (pipe.nwrite as usize) % PIPESIZE;
        pipe.data[idx] = ch;
        pipe.nwrite += 1;
        i += 1;
    }
    wakeup(&pipe.nread);
    pipe.lock.release();

    i as i32
}

/// Blocking read: sleeps until at least one byte is available or the
/// write end closes, then drains whatever is buffered (not just one
/// byte), matching xv6's piperead.
pub fn piperead(pipe: &mut Pipe, is_user_dst: bool, addr: usize, n: usize) -> i32 {
    let p = myproc();

    pipe.lock.acquire();
    while pipe.nread == pipe.nwrite && pipe.writeopen {
        if p.killed() != 0 {
            pipe.lock.release();
            return -1;
        }
        sleep(&pipe.nread, &mut pipe.lock);
    }

    let mut i: usize = 0;
    while i < n {
        if pipe.nread == pipe.nwrite {
            break;
        }
        let ch = pipe.data[(pipe.nread as usize) % PIPESIZE];
        pipe.nread += 1;

        if either_copyout(is_user_dst, addr + i, &ch as *const u8, 1) == -1 {
            break;
        }
        i += 1;
    }
    wakeup(&pipe.nwrite);
    pipe.lock.release();

    i as i32
}
