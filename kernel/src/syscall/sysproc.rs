use crate::proc::{self, myproc};
use crate::syscall::syscall::{argaddr, argint};
use crate::trap::{clock_sleep, uptime};

pub(super) fn sys_fork() -> u64 {
    proc::fork() as u64
}

pub(super) fn sys_exit() -> u64 {
    let status = argint(0);
    proc::exit(status);
}

pub(super) fn sys_wait() -> u64 {
    let addr = argaddr(0);
    proc::wait(addr) as u64
}

pub(super) fn sys_kill() -> u64 {
    let pid = argint(0);
    proc::kill(pid as u32) as u64
}

pub(super) fn sys_getpid() -> u64 {
    myproc().pid as u64
}

// Change the size of the calling process's memory by n bytes (positive
// or negative). Returns the size before the call on success, -1 on
// failure.
pub(super) fn sys_sbrk() -> u64 {
    let n = argint(0);
    let addr = myproc().sz;
    if proc::growproc(n) < 0 {
        return u64::MAX;
    }
    addr as u64
}

pub(super) fn sys_sleep() -> u64 {
    let n = argint(0);
    clock_sleep(n) as u64
}

pub(super) fn sys_uptime() -> u64 {
    uptime() as u64
}

// Arm (or, with ticks==0, disarm) the periodic alarm delivered to the
// calling process every `ticks` timer interrupts.
pub(super) fn sys_sigalarm() -> u64 {
    let ticks = argint(0);
    let handler = argaddr(1);
    myproc().set_alarm(ticks, handler);
    0
}

// Restore the trapframe sigalarm's handler was dispatched from, letting
// the alarm fire again.
pub(super) fn sys_sigreturn() -> u64 {
    myproc().sigreturn() as u64
}
