use core::mem;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::file::file::{filedup, fileclose};
use crate::file::{File, INode, Vma};
use crate::fs::fs;
use crate::kalloc::KMEM;
use crate::log::{begin_op, end_op};
use crate::KSTACK;
use crate::memlayout::{TRAMPOLINE, TRAPFRAME};
use crate::param::{NCPU, NOFILE, NPROC, NVMA, ROOTDEV};
use crate::proc::Procstate::{RUNNABLE, RUNNING, SLEEPING, UNUSED, USED, ZOMBIE};
use crate::printf;
use crate::riscv::{intr_get, intr_on, PageTable, PGSIZE, PTE_R, PTE_W, PTE_X, r_tp};
use crate::spinlock::{pop_off, push_off, Spinlock};
use crate::string::{memmove, safestrcpy};
use crate::trap::usertrapret;
use crate::vm::{
    copyout, kvmmap, mappages, uvmalloc, uvmcopy, uvmcreate, uvmdealloc, uvmfirst, uvmfree,
    uvmunmap,
};

// either_copyin/either_copyout dispatch on myproc(), but their bodies just
// shell out to vm.rs's copyin/copyout; re-exported here because that's
// where every caller (fs.rs, console.rs) reaches for them.
pub use crate::vm::{either_copyin, either_copyout};

extern "C" {
    // switch.S: save the registers in `old`, restore the registers in
    // `new`, and "return" into whatever `new.ra` points at.
    fn swtch(old: *mut Context, new: *mut Context);
    static trampoline: u8; // trampoline.S
}

// Saved registers for kernel context switches.
#[derive(Copy, Clone)]
pub(crate) struct Context {
    ra: u64,
    sp: u64,

    // callee-saved
    s0: u64,
    s1: u64,
    s2: u64,
    s3: u64,
    s4: u64,
    s5: u64,
    s6: u64,
    s7: u64,
    s8: u64,
    s9: u64,
    s10: u64,
    s11: u64,
}

impl Context {
    const fn zeroed() -> Self {
        Self {
            ra: 0,
            sp: 0,
            s0: 0,
            s1: 0,
            s2: 0,
            s3: 0,
            s4: 0,
            s5: 0,
            s6: 0,
            s7: 0,
            s8: 0,
            s9: 0,
            s10: 0,
            s11: 0,
        }
    }
}

// Per-CPU state.
#[derive(Copy, Clone)]
pub struct Cpu {
    proc: Option<*mut Proc>, // the process running on this cpu, or None.
    context: Context, // swtch() here to enter scheduler().
    pub noff: u8, // depth of push_off() nesting.
    pub intena: bool, // were interrupts enabled before push_off()?
}

impl Cpu {
    const fn default() -> Self {
        Cpu {
            proc: None,
            context: Context::zeroed(),
            noff: 0,
            intena: false,
        }
    }
}

static mut CPUS: [Cpu; NCPU] = [Cpu::default(); NCPU];
static mut PROCS: [Proc; NPROC] = [Proc::default(); NPROC];

static mut INIT_PROC: Option<*mut Proc> = None;

// per-process data for the trap handling code in trampoline.S.
// sits in a page by itself just under the trampoline page in the
// user page table. not specially mapped in the kernel page table.
// uservec in trampoline.S saves user registers in the trapframe,
// then initializes registers from the trapframe's
// kernel_sp, kernel_hartid, kernel_satp, and jumps to kernel_trap.
// usertrapret() and userret in trampoline.S set up
// the trapframe's kernel_*, restore user registers from the
// trapframe, switch to the user page table, and enter user space.
// the trapframe includes callee-saved user registers like s0-s11 because the
// return-to-user path via usertrapret() doesn't return through
// the entire kernel call stack.
#[repr(C)]
pub struct Trapframe {
    /*   0 */ pub kernel_satp: u64,
    // kernel page table
    /*   8 */ pub kernel_sp: u64,
    // top of process's kernel stack
    /*  16 */ pub kernel_trap: u64,
    // usertrap()
    /*  24 */ pub epc: u64,
    // saved user program counter
    /*  32 */ pub kernel_hartid: u64,
    // saved kernel tp
    /*  40 */ pub ra: u64,
    /*  48 */ pub sp: u64,
    /*  56 */ pub gp: u64,
    /*  64 */ pub tp: u64,
    /*  72 */ pub t0: u64,
    /*  80 */ pub t1: u64,
    /*  88 */ pub t2: u64,
    /*  96 */ pub s0: u64,
    /* 104 */ pub s1: u64,
    /* 112 */ pub a0: u64,
    /* 120 */ pub a1: u64,
    /* 128 */ pub a2: u64,
    /* 136 */ pub a3: u64,
    /* 144 */ pub a4: u64,
    /* 152 */ pub a5: u64,
    /* 160 */ pub a6: u64,
    /* 168 */ pub a7: u64,
    /* 176 */ pub s2: u64,
    /* 184 */ pub s3: u64,
    /* 192 */ pub s4: u64,
    /* 200 */ pub s5: u64,
    /* 208 */ pub s6: u64,
    /* 216 */ pub s7: u64,
    /* 224 */ pub s8: u64,
    /* 232 */ pub s9: u64,
    /* 240 */ pub s10: u64,
    /* 248 */ pub s11: u64,
    /* 256 */ pub t3: u64,
    /* 264 */ pub t4: u64,
    /* 272 */ pub t5: u64,
    /* 280 */ pub t6: u64,
}

#[derive(Copy, Clone, PartialEq, Eq)]
pub(crate) enum Procstate { UNUSED, USED, SLEEPING, RUNNABLE, RUNNING, ZOMBIE }

// Saved alarm state for the periodic SIGALRM facility. `handler` is a
// user virtual address; `saved_tf` is a
// kalloc'd page holding the trapframe as it stood the instant the
// handler was invoked, so sigreturn can restore it exactly.
#[derive(Copy, Clone)]
struct Alarm {
    interval: i32, // ticks between firings, 0 = disabled
    elapsed: i32, // ticks since the interval last reset
    handler: usize, // user va to jump to when the interval elapses
    saved_tf: Option<*mut Trapframe>,
    in_handler: bool, // reentrancy guard: don't refire until sigreturn
}

impl Alarm {
    const fn default() -> Self {
        Self {
            interval: 0,
            elapsed: 0,
            handler: 0,
            saved_tf: None,
            in_handler: false,
        }
    }
}

// Per-process state
#[derive(Copy, Clone)]
pub struct Proc {
    lock: Spinlock,

    // p.lock must be held when using these:
    state: Procstate, // Process state
    chan: usize, // nonzero if sleeping on this channel address
    killed: bool, // have been killed
    xstate: i32, // Exit status to be returned to parent's wait
    pub pid: u32, // Process ID

    // wait_lock must be held when using this:
    parent: Option<*mut Proc>, // Parent process

    // these are private to the process, so p.lock need not be held.
    kstack: usize, // Virtual address of kernel stack
    pub(crate) sz: usize, // Size of process memory (bytes)
    pub pagetable: Option<*mut PageTable>, // User page table
    pub trapframe: Option<*mut Trapframe>, // data page for trampoline.S
    context: Context, // swtch() here to run process
    pub ofile: [Option<*mut File>; NOFILE], // Open files
    pub cwd: Option<*mut INode>, // Current directory
    pub name: [u8; 16], // Process name (debugging)

    pub vma: [Option<Vma>; NVMA], // mmap()ed regions

    alarm: Alarm,
}

unsafe impl Send for Proc {}
unsafe impl Sync for Proc {}

impl Proc {
    const fn default() -> Self {
        Proc {
            lock: Spinlock::init_lock("proc"),
            state: UNUSED,
            chan: 0,
            killed: false,
            xstate: 0,
            pid: 0,
            parent: None,
            kstack: 0,
            sz: 0,
            pagetable: None,
            trapframe: None,
            context: Context::zeroed(),
            ofile: [None; NOFILE],
            cwd: None,
            name: [0; 16],
            vma: [None; NVMA],
            alarm: Alarm::default(),
        }
    }

    /// Read `killed` under the process's own lock.
    pub fn killed(self: &mut Self) -> i32 {
        self.lock.acquire();
        let k = self.killed;
        self.lock.release();
        k as i32
    }

    pub fn set_killed(self: &mut Self) {
        self.lock.acquire();
        self.killed = true;
        self.lock.release();
    }

    /// Arm (or disarm, with ticks == 0) the periodic alarm.
    pub fn set_alarm(self: &mut Self, ticks: i32, handler: usize) {
        self.alarm.interval = ticks;
        self.alarm.elapsed = 0;
        self.alarm.handler = handler;
        if ticks == 0 {
            self.alarm.in_handler = false;
        }
    }

    /// Called once per timer tick while running in user mode. Snapshots
    /// the trapframe and redirects epc to the handler the first time the
    /// interval elapses; does nothing again until sigreturn clears
    /// `in_handler`.
    pub fn tick_alarm(self: &mut Self) {
        if self.alarm.interval <= 0 || self.alarm.in_handler {
            return;
        }

        self.alarm.elapsed += 1;
        if self.alarm.elapsed < self.alarm.interval {
            return;
        }

        let tf = self.trapframe.unwrap();
        let saved = match self.alarm.saved_tf {
            Some(saved) => saved,
            None => {
                let page: *mut Trapframe = unsafe { KMEM.kalloc() };
                if page.is_null() {
                    // out of memory: skip firing this round and retry on
                    // the next tick instead of writing through a null
                    // trapframe pointer.
                    return;
                }
                self.alarm.saved_tf = Some(page);
                page
            }
        };
        self.alarm.elapsed = 0;

        unsafe {
            memmove(saved as *mut u8, tf as *const u8, mem::size_of::<Trapframe>());
            (*tf).epc = self.alarm.handler as u64;
        }
        self.alarm.in_handler = true;
    }

    /// sys_sigreturn: restore the trapframe saved by tick_alarm and allow
    /// the alarm to fire again. Returns the a0 the handler's caller
    /// should see (the value it had before the alarm interrupted it).
    pub fn sigreturn(self: &mut Self) -> i32 {
        if let Some(saved) = self.alarm.saved_tf {
            let tf = self.trapframe.unwrap();
            unsafe {
                memmove(tf as *mut u8, saved as *const u8, mem::size_of::<Trapframe>());
            }
        }
        self.alarm.in_handler = false;
        unsafe { (*self.trapframe.unwrap()).a0 as i32 }
    }
}

static NEXT_PID: AtomicU32 = AtomicU32::new(1);
// helps ensure that wakeups of wait()ing
// parents are not lost. helps obey the
// memory model when using p.parent.
// must be acquired before any p.lock.
static mut WAIT_LOCK: Spinlock = Spinlock::init_lock("wait_lock");

// Must be called with interrupts disabled,
// to prevent race with process being moved
// to a different CPU.
pub fn cpuid() -> usize {
    r_tp() as usize
}

// Return this CPU's cpu struct.
// Interrupts must be disabled.
pub fn mycpu() -> &'static mut Cpu {
    unsafe { &mut CPUS[cpuid()] }
}

// Return the current struct proc, or panics if none (must only be
// called from process context).
pub fn myproc() -> &'static mut Proc {
    push_off();
    let c = mycpu();
    let p = c.proc;
    pop_off();
    unsafe { p.expect("myproc: no current process").as_mut().unwrap() }
}

// Whether this CPU currently has a RUNNING process, without panicking
// when it doesn't (kerneltrap can fire with no current process).
pub fn proc_is_running() -> bool {
    push_off();
    let c = mycpu();
    let running = match c.proc {
        Some(p) => unsafe { (*p).state == RUNNING },
        None => false,
    };
    pop_off();
    running
}

fn allocpid() -> u32 {
    NEXT_PID.fetch_add(1, Ordering::Relaxed)
}

// Allocate a page for each process's kernel stack.
// Map it high in memory, followed by an invalid
// guard page.
pub fn proc_mapstacks(kpgtbl: &mut PageTable) {
    for idx in 0..NPROC {
        unsafe {
            let pa: *mut u8 = KMEM.kalloc();
            if pa.is_null() {
                panic!("kalloc");
            }
            let va = KSTACK!(idx);
            kvmmap(kpgtbl, va, pa as usize, PGSIZE, PTE_R | PTE_W)
        }
    }
}

// initialize the proc table at boot time.
pub fn procinit() {
    for i in 0..NPROC {
        unsafe {
            PROCS[i].kstack = KSTACK!(i);
        }
    }
}

// a user program that calls exec("/init")
// assembled from ../user/initcode.S
// od -t xC ../user/initcode
const INITCODE: [u8; 52] = [
    0x17, 0x05, 0x00, 0x00, 0x13, 0x05, 0x45, 0x02,
    0x97, 0x05, 0x00, 0x00, 0x93, 0x85, 0x35, 0x02,
    0x93, 0x08, 0x70, 0x00, 0x73, 0x00, 0x00, 0x00,
    0x93, 0x08, 0x20, 0x00, 0x73, 0x00, 0x00, 0x00,
    0xef, 0xf0, 0x9f, 0xff, 0x2f, 0x69, 0x6e, 0x69,
    0x74, 0x00, 0x00, 0x24, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00
];

// Set up first user process.
pub fn userinit() {
    let p = allocproc().expect("userinit: allocproc");
    unsafe { INIT_PROC = Some(p as *mut Proc); }

    // allocate one user page and copy initcode's instructions
    // and data into it.
    uvmfirst(unsafe { p.pagetable.unwrap().as_mut().unwrap() }, &INITCODE as *const u8, mem::size_of_val(&INITCODE));
    p.sz = PGSIZE;

    // prepare for the very first "return" from kernel to user.
    unsafe {
        let tf = p.trapframe.unwrap();
        (*tf).epc = 0; // user program counter
        (*tf).sp = PGSIZE as u64; // user stack pointer
    }

    safestrcpy(p.name.as_mut_ptr(), b"initcode\0".as_ptr(), p.name.len());

    // namei("/") never touches disk for the root path, so this is safe
    // to call before fsinit() (which runs later, from forkret()).
    p.cwd = fs::namei(b"/").map(|ip| ip as *mut INode);

    p.state = RUNNABLE;

    p.lock.release();
}

// A fork child's very first scheduling by scheduler()
// will swtch to forkret.
extern "C" fn forkret() {
    static mut FIRST: bool = true;

    // Still holding p.lock from scheduler.
    myproc().lock.release();

    unsafe {
        if FIRST {
            // File system initialization must be run in the context of a
            // regular process (e.g., because it calls sleep), and thus
            // cannot be run from main().
            FIRST = false;
            fs::fsinit(ROOTDEV);
        }
    }

    usertrapret();
}

// Look in the process table for an UNUSED proc.
// If found, initialize state required to run in the kernel,
// and return with p.lock held.
// If there are no free procs, or a memory allocation fails, return None.
fn allocproc() -> Option<&'static mut Proc> {
    let mut found = None;
    for i in 0..NPROC {
        let p = unsafe { &mut PROCS[i] };
        p.lock.acquire();

        if p.state == UNUSED {
            found = Some(p);
            break;
        }

        p.lock.release();
    }

    let p = found?;
    p.pid = allocpid();
    p.state = USED;

    // Allocate a trapframe page.
    let trapframe_ptr: *mut Trapframe = unsafe { KMEM.kalloc() };
    if trapframe_ptr.is_null() {
        freeproc(p);
        p.lock.release();
        return None;
    }
    p.trapframe = Some(trapframe_ptr);

    // An empty user page table.
    p.pagetable = proc_pagetable(p).map(|pt| pt as *mut PageTable);
    if p.pagetable.is_none() {
        freeproc(p);
        p.lock.release();
        return None;
    }

    // Set up new context to start executing at forkret,
    // which returns to user space.
    p.context = Context::zeroed();
    p.context.ra = forkret as usize as u64;
    p.context.sp = (p.kstack + PGSIZE) as u64;

    Some(p)
}

// free a proc structure and the data hanging from it,
// including user pages.
// p.lock must be held.
fn freeproc(p: &mut Proc) {
    if let Some(tf) = p.trapframe {
        unsafe { KMEM.kfree(tf) };
    }
    p.trapframe = None;

    if let Some(saved) = p.alarm.saved_tf {
        unsafe { KMEM.kfree(saved) };
    }
    p.alarm = Alarm::default();

    if let Some(pagetable) = p.pagetable {
        proc_freepagetable(unsafe { pagetable.as_mut().unwrap() }, p.sz);
    }
    p.pagetable = None;

    p.sz = 0;
    p.pid = 0;
    p.parent = None;
    p.name = [0; 16];
    p.chan = 0;
    p.killed = false;
    p.xstate = 0;
    p.state = UNUSED;
}

// Create a user page table for a given process, with no user memory,
// but with trampoline and trapframe pages.
pub(crate) fn proc_pagetable(p: &Proc) -> Option<&'static mut PageTable> {
    // An empty page table.
    let pagetable = uvmcreate()?;

    // map the trampoline code (for system call return)
    // at the highest user virtual address.
    // only the supervisor uses it, on the way
    // to/from user space, so not PTE_U.
    let trampoline_addr = (unsafe { &trampoline } as *const u8).expose_addr();
    if mappages(pagetable, TRAMPOLINE, trampoline_addr, PGSIZE, PTE_R | PTE_X) != 0 {
        uvmfree(pagetable, 0);
        return None;
    }

    // map the trapframe page just below the trampoline page, for
    // trampoline.S.
    let trapframe_addr = (p.trapframe.unwrap() as *const Trapframe).expose_addr();
    if mappages(pagetable, TRAPFRAME, trapframe_addr, PGSIZE, PTE_R | PTE_W) != 0 {
        uvmunmap(pagetable, TRAMPOLINE, 1, false);
        uvmfree(pagetable, 0);
        return None;
    }

    Some(pagetable)
}

// Free a process's page table, and free the
// physical memory it refers to.
pub(crate) fn proc_freepagetable(pagetable: &mut PageTable, sz: usize) {
    uvmunmap(pagetable, TRAMPOLINE, 1, false);
    uvmunmap(pagetable, TRAPFRAME, 1, false);
    uvmfree(pagetable, sz);
}

// Grow or shrink the calling process's memory by n bytes (sbrk).
// Returns 0 on success, -1 on failure.
pub fn growproc(n: i32) -> i32 {
    let p = myproc();
    let oldsz = p.sz;

    let newsz = if n > 0 {
        let newsz = uvmalloc(
            unsafe { p.pagetable.unwrap().as_mut().unwrap() },
            oldsz,
            oldsz + n as usize,
            PTE_W,
        );
        if newsz == 0 {
            return -1;
        }
        newsz
    } else if n < 0 {
        uvmdealloc(
            unsafe { p.pagetable.unwrap().as_mut().unwrap() },
            oldsz,
            (oldsz as isize + n as isize) as usize,
        )
    } else {
        oldsz
    };

    p.sz = newsz;
    0
}

// Give up the CPU for one scheduling round.
pub fn proc_yield() {
    let p = myproc();
    p.lock.acquire();
    p.state = RUNNABLE;
    sched();
    p.lock.release();
}

// Per-hart scheduler loop. Each hart picks its own RUNNABLE process by
// a plain round-robin scan of the whole table; never returns.
pub fn scheduler() -> ! {
    let c = mycpu();
    c.proc = None;

    loop {
        // avoid deadlock by ensuring that devices can interrupt.
        intr_on();

        let mut found_runnable = false;
        for i in 0..NPROC {
            let p = unsafe { &mut PROCS[i] };
            p.lock.acquire();
            if p.state == RUNNABLE {
                // switch to chosen process. it is the process's job to
                // release its lock and then reacquire it before jumping
                // back to us.
                p.state = RUNNING;
                c.proc = Some(p as *mut Proc);
                unsafe {
                    swtch(&mut c.context as *mut Context, &mut p.context as *mut Context);
                }

                // process is done running for now; it should have
                // changed its p.state before coming back to us.
                c.proc = None;
                found_runnable = true;
            }
            p.lock.release();
        }

        if !found_runnable {
            unsafe { core::arch::asm!("wfi") }
        }
    }
}

// Switch to scheduler. Must hold only p.lock and have changed
// proc.state. Saves and restores intena because intena is a property of
// this kernel thread, not this CPU. It should be proc.intena and
// proc.noff, but that would break in the few places where a lock is
// held but there's no process.
fn sched() {
    let p = myproc();

    if !p.lock.holding() {
        panic!("sched p.lock");
    }
    if mycpu().noff != 1 {
        panic!("sched locks");
    }
    if p.state == RUNNING {
        panic!("sched running");
    }
    if intr_get() {
        panic!("sched interruptible");
    }

    let intena = mycpu().intena;
    unsafe {
        swtch(&mut p.context as *mut Context, &mut mycpu().context as *mut Context);
    }
    mycpu().intena = intena;
}

// Atomically release lock and sleep on chan.
// Reacquires lock when awakened.
pub fn sleep<T>(chan: *const T, lk: &mut Spinlock) {
    let p = myproc();

    // Must acquire p.lock in order to change p.state and then call
    // sched. Once we hold p.lock, we can be guaranteed that we won't
    // miss any wakeup (wakeup locks p.lock), so it's okay to release lk.
    let same_lock = core::ptr::eq(lk as *const Spinlock, &p.lock as *const Spinlock);
    if !same_lock {
        p.lock.acquire();
        lk.release();
    }

    p.chan = chan as *const u8 as usize;
    p.state = SLEEPING;

    sched();

    // tidy up.
    p.chan = 0;

    if !same_lock {
        p.lock.release();
        lk.acquire();
    }
}

// Wake up every process sleeping on chan.
// Must be called without any p.lock held.
pub fn wakeup<T>(chan: *const T) {
    let addr = chan as *const u8 as usize;
    let me = myproc() as *const Proc;

    for i in 0..NPROC {
        let p = unsafe { &mut PROCS[i] };
        if (p as *const Proc) != me {
            p.lock.acquire();
            if p.state == SLEEPING && p.chan == addr {
                p.state = RUNNABLE;
            }
            p.lock.release();
        }
    }
}

// Create a new process, copying the parent.
// Sets up child kernel stack to return as if from fork() system call.
pub fn fork() -> i32 {
    let p = myproc();

    let np = match allocproc() {
        Some(np) => np,
        None => return -1,
    };

    // Copy user memory from parent to child.
    if uvmcopy(
        unsafe { p.pagetable.unwrap().as_mut().unwrap() },
        unsafe { np.pagetable.unwrap().as_mut().unwrap() },
        p.sz,
    ) != 0 {
        freeproc(np);
        np.lock.release();
        return -1;
    }
    np.sz = p.sz;

    // copy saved user registers.
    unsafe {
        memmove(
            np.trapframe.unwrap() as *mut u8,
            p.trapframe.unwrap() as *const u8,
            mem::size_of::<Trapframe>(),
        );
        // Cause fork to return 0 in the child.
        (*np.trapframe.unwrap()).a0 = 0;
    }

    // increment reference counts on open file descriptors.
    for i in 0..NOFILE {
        if let Some(f) = p.ofile[i] {
            filedup(f);
            np.ofile[i] = Some(f);
        }
    }
    np.cwd = p.cwd.map(|ip| unsafe { (*ip).idup() as *mut INode });

    // inherit mmap()ed regions, taking our own reference on the backing
    // file.
    for i in 0..NVMA {
        if let Some(vma) = p.vma[i] {
            np.vma[i] = Some(vma);
            if let Some(f) = vma.file {
                filedup(f);
            }
        }
    }

    np.name = p.name;

    let pid = np.pid;

    np.lock.release();

    unsafe {
        WAIT_LOCK.acquire();
        np.parent = Some(p as *mut Proc);
        WAIT_LOCK.release();
    }

    np.lock.acquire();
    np.state = RUNNABLE;
    np.lock.release();

    pid as i32
}

// Pass p's abandoned children to init.
// Caller must hold wait_lock.
fn reparent(p: *mut Proc) {
    for i in 0..NPROC {
        let pp = unsafe { &mut PROCS[i] };
        if pp.parent == Some(p) {
            pp.parent = unsafe { INIT_PROC };
            wakeup(unsafe { INIT_PROC.unwrap() as *const Proc });
        }
    }
}

// Exit the current process. Does not return.
// An exited process remains in the zombie state
// until its parent calls wait().
pub fn exit(status: i32) -> ! {
    let p = myproc();

    unsafe {
        if Some(p as *mut Proc) == INIT_PROC {
            panic!("init exiting");
        }
    }

    // Unmap and (for MAP_SHARED) write back any mmap()ed regions before
    // the address space and its backing files go away.
    crate::syscall::sysfile::vma_cleanup(p);

    // Close all open files.
    for fd in 0..NOFILE {
        if let Some(f) = p.ofile[fd] {
            fileclose(unsafe { f.as_mut().unwrap() });
            p.ofile[fd] = None;
        }
    }

    begin_op();
    if let Some(cwd) = p.cwd {
        unsafe { (*cwd).iput(); }
    }
    end_op();
    p.cwd = None;

    unsafe { WAIT_LOCK.acquire(); }

    // Give any children to init.
    reparent(p as *mut Proc);

    // Parent might be sleeping in wait().
    if let Some(parent) = p.parent {
        wakeup(parent as *const Proc);
    }

    p.lock.acquire();

    p.xstate = status;
    p.state = ZOMBIE;

    unsafe { WAIT_LOCK.release(); }

    // Jump into the scheduler, never to return.
    sched();
    panic!("zombie exit");
}

// Wait for a child process to exit and return its pid.
// Return -1 if this process has no children.
pub fn wait(addr: usize) -> i32 {
    let p = myproc();

    unsafe { WAIT_LOCK.acquire(); }

    loop {
        let mut havekids = false;
        for i in 0..NPROC {
            let np = unsafe { &mut PROCS[i] };
            if np.parent == Some(p as *mut Proc) {
                // make sure the child isn't still in exit() or swtch().
                np.lock.acquire();

                havekids = true;
                if np.state == ZOMBIE {
                    let pid = np.pid;
                    if addr != 0 {
                        if copyout(
                            unsafe { p.pagetable.unwrap().as_mut().unwrap() },
                            addr,
                            &np.xstate as *const i32 as *const u8,
                            mem::size_of::<i32>(),
                        ) < 0 {
                            np.lock.release();
                            unsafe { WAIT_LOCK.release(); }
                            return -1;
                        }
                    }
                    freeproc(np);
                    np.lock.release();
                    unsafe { WAIT_LOCK.release(); }
                    return pid as i32;
                }
                np.lock.release();
            }
        }

        // No point waiting if we don't have any children.
        if !havekids || p.killed() != 0 {
            unsafe { WAIT_LOCK.release(); }
            return -1;
        }

        // Wait for a child to exit.
        sleep(p as *const Proc, unsafe { &mut WAIT_LOCK });
    }
}

// Kill the process with the given pid.
// The victim won't exit until it tries to return
// to user space (see usertrap() in trap.rs).
pub fn kill(pid: u32) -> i32 {
    for i in 0..NPROC {
        let p = unsafe { &mut PROCS[i] };
        p.lock.acquire();
        if p.pid == pid {
            p.killed = true;
            if p.state == SLEEPING {
                // Wake process from sleep().
                p.state = RUNNABLE;
            }
            p.lock.release();
            return 0;
        }
        p.lock.release();
    }
    -1
}

// Print a process listing to the console, triggered by the 'P'
// keystroke in consoleintr(). No lock to avoid wedging a stuck machine
// further.
pub fn procdump() {
    printf!("\n");
    for i in 0..NPROC {
        let p = unsafe { &PROCS[i] };
        if p.state == UNUSED {
            continue;
        }
        let state = match p.state {
            UNUSED => "unused",
            USED => "used",
            SLEEPING => "sleep",
            RUNNABLE => "runble",
            RUNNING => "run",
            ZOMBIE => "zombie",
        };
        let name_len = p.name.iter().position(|&c| c == 0).unwrap_or(p.name.len());
        let name = core::str::from_utf8(&p.name[..name_len]).unwrap_or("?");
        printf!("{} {} {}\n", p.pid, state, name);
    }
}
