use core::mem;
use crate::exec::exec;
use crate::file::fcntl::{
    MAP_SHARED, O_CREATE, O_NOFOLLOW, O_RDONLY, O_RDWR, O_TRUNC, O_WRONLY, PROT_EXEC, PROT_READ,
    PROT_WRITE,
};
use crate::file::file::{filealloc, filedup, fileclose, fileread, filestat, filewrite};
use crate::file::{File, INode, Vma};
use crate::file::FDType::{FD_DEVICE, FD_INODE};
use crate::fs::fs::{dirlink, dirlookup, ialloc, namei, nameiparent};
use crate::fs::{Dirent, DIRSIZ};
use crate::kalloc::KMEM;
use crate::log::{begin_op, end_op};
use crate::memlayout::MMAPEND;
use crate::param::{MAXARG, MAXPATH, MAXSYMLINKS, NDEV, NOFILE, NVMA};
use crate::proc::{myproc, Proc};
use crate::riscv::{PGSIZE, PTE_R, PTE_U, PTE_W, PTE_X};
use crate::stat::FileType;
use crate::stat::FileType::{T_DEVICE, T_DIR, T_FILE, T_SYMLINK};
use crate::string::memset;
use crate::syscall::syscall::{argaddr, argint, argstr, fetchaddr, fetchstr};
use crate::vm::{copyout, mappages, uvmunmap_sparse};
use crate::PGROUNDDOWN;

pub(super) fn sys_exec() -> u64 {
    let mut uarg: usize = 0;
    let uargv = argaddr(1);

    let mut path: [u8; MAXPATH] = ['\0' as u8; MAXPATH];
    if argstr(0, &mut path as *mut u8, MAXPATH) < 0 {
        return u64::MAX;
    }

    let mut argv: [Option<*mut u8>; MAXARG] = [None; MAXARG];
    let mut i = 0;
    let mut bad = false;
    loop {
        if i >= argv.len() {
            bad = true;
            break
        }

        if fetchaddr(uargv+mem::size_of::<usize>()*i, &mut uarg) < 0 {
            bad = true;
            break
        }

        if uarg == 0 {
            argv[i] = None;
            break;
        }

        let ptr: *mut u8 = unsafe { KMEM.kalloc() };
        if ptr.is_null() {
            bad = true;
            break
        }
        argv[i] = Some(ptr);


        if fetchstr(uarg, argv[i].unwrap(), PGSIZE) < 0 {
            bad = true;
            break
        }

        i += 1;
    }

    let mut ret = -1;
    if !bad {
        ret = exec(&path, &argv);
    }

    for i in 0..argv.len() {
        if argv[i].is_none() {
            break
        }

        unsafe { KMEM.kfree(argv[i].unwrap()) }
    }

    return ret as u64;
}

pub(super) fn sys_open() -> u64 {
    let mut path: [u8; MAXPATH] = [0; MAXPATH];
    let omode = argint(1);
    if argstr(0, path.as_mut_ptr(), MAXPATH) < 0 {
        return u64::MAX;
    }

    begin_op();

    let ip: &mut INode;
    if omode & O_CREATE != 0 {
        ip = match create(&path, T_FILE, 0, 0) {
            Some(ip) => ip,
            None => {
                end_op();
                return u64::MAX;
            }
        };
    } else {
        let mut cur = match namei(&path) {
            Some(ip) => ip,
            None => {
                end_op();
                return u64::MAX;
            }
        };

        // follow a chain of symlinks unless the caller asked not to.
        let mut follows = 0;
        loop {
            cur.ilock();
            if cur.file_type != T_SYMLINK || (omode & O_NOFOLLOW) != 0 {
                break;
            }

            if follows >= MAXSYMLINKS {
                cur.iunlockput();
                end_op();
                return u64::MAX;
            }
            follows += 1;

            let mut target = [0u8; MAXPATH];
            let n = cur.readi(false, target.as_mut_ptr(), 0, MAXPATH);
            cur.iunlockput();
            if n == 0 {
                end_op();
                return u64::MAX;
            }

            cur = match namei(&target) {
                Some(ip) => ip,
                None => {
                    end_op();
                    return u64::MAX;
                }
            };
        }

        if cur.file_type == T_DIR && omode != O_RDONLY {
            cur.iunlockput();
            end_op();
            return u64::MAX;
        }

        ip = cur;
    }

    if ip.file_type == T_DEVICE && (ip.major < 0 || ip.major as usize >= NDEV) {
        ip.iunlockput();
        end_op();
        return u64::MAX;
    }

    let f = match filealloc() {
        Some(f) => f,
        None => {
            ip.iunlockput();
            end_op();
            return u64::MAX;
        }
    };

    let fptr = f as *mut File;
    let fd = match fdalloc(fptr) {
        Some(fd) => fd,
        None => {
            fileclose(unsafe { fptr.as_mut().unwrap() });
            ip.iunlockput();
            end_op();
            return u64::MAX;
        }
    };
    let f = unsafe { fptr.as_mut().unwrap() };

    if ip.file_type == T_DEVICE {
        f.file_type = FD_DEVICE;
        f.major = ip.major;
    } else {
        f.file_type = FD_INODE;
        f.off = 0;
    }
    let ipptr = ip as *mut INode;
    f.ip = Some(ipptr);
    let ip = unsafe { ipptr.as_mut().unwrap() };
    f.readable = omode & O_WRONLY == 0;
    f.writable = (omode & O_WRONLY) != 0 || (omode & O_RDWR) != 0;

    if (omode & O_TRUNC) != 0 && ip.file_type == T_FILE {
        ip.itrunc();
    }

    ip.iunlock();
    end_op();

    fd as u64
}

pub fn sys_mknod() -> u64 {
    begin_op();
    let major = argint(1)  as i16;
    let minor = argint(2)  as i16;

    let mut path = [0; MAXPATH];

    if (argstr(0, &mut path as *mut u8, MAXPATH)) < 0 {
        end_op();
        return u64::MAX;
    }

    let ip = create(&path, T_DEVICE, major, minor);
    if ip.is_none() {
        end_op();
        return u64::MAX;
    }

    ip.unwrap().iunlockput();
    end_op();
    return 0;
}

pub(super) fn sys_symlink() -> u64 {
    let mut target = [0u8; MAXPATH];
    let mut path = [0u8; MAXPATH];
    if argstr(0, target.as_mut_ptr(), MAXPATH) < 0 || argstr(1, path.as_mut_ptr(), MAXPATH) < 0 {
        return u64::MAX;
    }

    begin_op();
    let ip = match create(&path, T_SYMLINK, 0, 0) {
        Some(ip) => ip,
        None => {
            end_op();
            return u64::MAX;
        }
    };

    let n = crate::string::strlen(target.as_ptr()) + 1;
    if ip.writei(false, target.as_mut_ptr(), 0, n) != n as isize {
        ip.iunlockput();
        end_op();
        return u64::MAX;
    }

    ip.iunlockput();
    end_op();
    0
}

fn create<'a>(path: &[u8], file_type: FileType, major: i16, minor: i16) -> Option<&'a mut INode> {
    let (dp, name) = nameiparent(path);
    let dp = dp?;
    dp.ilock();

    let ip = dirlookup(dp, name, &mut 0);
    if ip.is_some() {
        let ip = ip?;
        dp.iunlockput();
        ip.ilock();
        if file_type == T_FILE && (ip.file_type == T_FILE || ip.file_type == T_DEVICE) {
            return Some(ip);
        }
        ip.iunlockput();
        return None;
    }

    let ip = ialloc(dp.dev, file_type);
    if ip.is_none() {
        dp.iunlockput();
        return None;
    }

    let ip = ip?;
    ip.ilock();
    ip.major = major;
    ip.minor = minor;
    ip.nlink = 1;
    ip.iupdate();

    if file_type == T_DIR {  // Create . and .. entries.
        // No ip->nlink++ for ".": avoid cyclic ref count.
        if dirlink(ip, b".", ip.inum as u16).is_none() || dirlink(ip, b"..", dp.inum as u16).is_none() {
            // something went wrong. de-allocate ip.
            ip.nlink = 0;
            ip.iupdate();
            ip.iunlockput();
            dp.iunlockput();
            return None;
        }
    }

    if dirlink(dp, name, ip.inum as u16).is_none() {
        // something went wrong. de-allocate ip.
        ip.nlink = 0;
        ip.iupdate();
        ip.iunlockput();
        dp.iunlockput();
        return None;
    }

    if file_type == T_DIR {
        // now that success is guaranteed:
        dp.nlink += 1;  // for ".."
        dp.iupdate();
    }

    dp.iunlockput();

    return Some(ip);
}

// Allocate a file descriptor for the given file.
// Takes over file reference from caller on success.
fn fdalloc(f: *mut File) -> Option<usize> {
    let p = myproc();

    for fd in 0..NOFILE {
        if p.ofile[fd].is_none() {
            p.ofile[fd] = Some(f);
            return Some(fd);
        }
    }

    return None;
}

// Resolve the nth syscall argument as an open file descriptor.
fn argfd(n: u8) -> Option<(usize, &'static mut File)> {
    let fd = argint(n);
    if fd < 0 || fd as usize >= NOFILE {
        return None;
    }

    let p = myproc();
    let f = p.ofile[fd as usize]?;
    Some((fd as usize, unsafe { f.as_mut().unwrap() }))
}

pub(super) fn sys_dup() -> u64 {
    let (_, f) = match argfd(0) {
        Some(v) => v,
        None => return u64::MAX,
    };

    let fptr = f as *mut File;
    let fd = match fdalloc(fptr) {
        Some(fd) => fd,
        None => return u64::MAX,
    };

    filedup(fptr);
    fd as u64
}

pub(super) fn sys_read() -> u64 {
    let (_, f) = match argfd(0) {
        Some(v) => v,
        None => return u64::MAX,
    };
    let addr = argaddr(1);
    let n = argint(2);
    if n < 0 {
        return u64::MAX;
    }

    fileread(f, addr, n as usize) as i64 as u64
}

pub(super) fn sys_write() -> u64 {
    let (_, f) = match argfd(0) {
        Some(v) => v,
        None => return u64::MAX,
    };
    let addr = argaddr(1);
    let n = argint(2);
    if n < 0 {
        return u64::MAX;
    }

    filewrite(f, addr, n as usize) as i64 as u64
}

pub(super) fn sys_close() -> u64 {
    let (fd, f) = match argfd(0) {
        Some(v) => v,
        None => return u64::MAX,
    };

    myproc().ofile[fd] = None;
    fileclose(f);
    0
}

pub(super) fn sys_fstat() -> u64 {
    let addr = argaddr(1);
    let (_, f) = match argfd(0) {
        Some(v) => v,
        None => return u64::MAX,
    };

    filestat(f, addr) as i64 as u64
}

pub(super) fn sys_pipe() -> u64 {
    let fdarray = argaddr(0);
    let p = myproc();

    let (rf, wf) = match crate::pipe::pipealloc() {
        Some(pair) => pair,
        None => return u64::MAX,
    };
    let rfptr = rf as *mut File;
    let wfptr = wf as *mut File;

    let fd0 = match fdalloc(rfptr) {
        Some(fd) => fd,
        None => {
            fileclose(unsafe { rfptr.as_mut().unwrap() });
            fileclose(unsafe { wfptr.as_mut().unwrap() });
            return u64::MAX;
        }
    };

    let fd1 = match fdalloc(wfptr) {
        Some(fd) => fd,
        None => {
            p.ofile[fd0] = None;
            fileclose(unsafe { rfptr.as_mut().unwrap() });
            fileclose(unsafe { wfptr.as_mut().unwrap() });
            return u64::MAX;
        }
    };

    let fds = [fd0 as i32, fd1 as i32];
    if copyout(
        unsafe { p.pagetable.unwrap().as_mut().unwrap() },
        fdarray,
        &fds as *const i32 as *const u8,
        mem::size_of_val(&fds),
    ) < 0
    {
        p.ofile[fd0] = None;
        p.ofile[fd1] = None;
        fileclose(unsafe { rfptr.as_mut().unwrap() });
        fileclose(unsafe { wfptr.as_mut().unwrap() });
        return u64::MAX;
    }

    0
}

pub(super) fn sys_chdir() -> u64 {
    let p = myproc();
    let mut path = [0u8; MAXPATH];
    if argstr(0, path.as_mut_ptr(), MAXPATH) < 0 {
        return u64::MAX;
    }

    begin_op();
    let ip = match namei(&path) {
        Some(ip) => ip,
        None => {
            end_op();
            return u64::MAX;
        }
    };

    ip.ilock();
    if ip.file_type != T_DIR {
        ip.iunlockput();
        end_op();
        return u64::MAX;
    }
    ip.iunlock();

    unsafe { p.cwd.unwrap().as_mut().unwrap().iput(); }
    end_op();

    p.cwd = Some(ip as *mut INode);
    0
}

pub(super) fn sys_mkdir() -> u64 {
    let mut path = [0u8; MAXPATH];
    begin_op();
    if argstr(0, path.as_mut_ptr(), MAXPATH) < 0 {
        end_op();
        return u64::MAX;
    }

    let ip = match create(&path, T_DIR, 0, 0) {
        Some(ip) => ip,
        None => {
            end_op();
            return u64::MAX;
        }
    };
    ip.iunlockput();
    end_op();
    0
}

fn undo_link(ip: &mut INode) {
    ip.ilock();
    ip.nlink -= 1;
    ip.iupdate();
    ip.iunlockput();
}

pub(super) fn sys_link() -> u64 {
    let mut old = [0u8; MAXPATH];
    let mut new = [0u8; MAXPATH];
    if argstr(0, old.as_mut_ptr(), MAXPATH) < 0 || argstr(1, new.as_mut_ptr(), MAXPATH) < 0 {
        return u64::MAX;
    }

    begin_op();
    let ip = match namei(&old) {
        Some(ip) => ip,
        None => {
            end_op();
            return u64::MAX;
        }
    };

    ip.ilock();
    if ip.file_type == T_DIR {
        ip.iunlockput();
        end_op();
        return u64::MAX;
    }
    ip.nlink += 1;
    ip.iupdate();
    ip.iunlock();

    let (dp, name) = nameiparent(&new);
    let dp = match dp {
        Some(dp) => dp,
        None => {
            undo_link(ip);
            end_op();
            return u64::MAX;
        }
    };

    dp.ilock();
    if dp.dev != ip.dev || dirlink(dp, name, ip.inum as u16).is_none() {
        dp.iunlockput();
        undo_link(ip);
        end_op();
        return u64::MAX;
    }
    dp.iunlockput();
    ip.iput();
    end_op();
    0
}

fn isdirempty(ip: &mut INode) -> bool {
    let mut de = Dirent { inum: 0, name: [0; DIRSIZ] };
    let sz = mem::size_of::<Dirent>();
    let mut off = (2 * sz) as u32; // skip "." and ".."
    while off < ip.size {
        if ip.readi(false, &mut de, off, sz) != sz {
            panic!("isdirempty: readi");
        }
        if de.inum != 0 {
            return false;
        }
        off += sz as u32;
    }
    true
}

pub(super) fn sys_unlink() -> u64 {
    let mut path = [0u8; MAXPATH];
    if argstr(0, path.as_mut_ptr(), MAXPATH) < 0 {
        return u64::MAX;
    }

    begin_op();
    let (dp, name) = nameiparent(&path);
    let dp = match dp {
        Some(dp) => dp,
        None => {
            end_op();
            return u64::MAX;
        }
    };

    dp.ilock();

    let is_dot = name.len() == 1 && name[0] == b'.';
    let is_dotdot = name.len() == 2 && name[0] == b'.' && name[1] == b'.';
    if is_dot || is_dotdot {
        dp.iunlockput();
        end_op();
        return u64::MAX;
    }

    let mut off = 0u32;
    let ip = match dirlookup(dp, name, &mut off) {
        Some(ip) => ip,
        None => {
            dp.iunlockput();
            end_op();
            return u64::MAX;
        }
    };
    ip.ilock();

    if ip.nlink < 1 {
        panic!("unlink: nlink < 1");
    }
    if ip.file_type == T_DIR && !isdirempty(ip) {
        ip.iunlockput();
        dp.iunlockput();
        end_op();
        return u64::MAX;
    }

    let mut de = Dirent { inum: 0, name: [0; DIRSIZ] };
    let sz = mem::size_of::<Dirent>();
    if dp.writei(false, &mut de, off, sz) != sz as isize {
        panic!("unlink: writei");
    }

    if ip.file_type == T_DIR {
        dp.nlink -= 1;
        dp.iupdate();
    }
    dp.iunlockput();

    ip.nlink -= 1;
    ip.iupdate();
    ip.iunlockput();

    end_op();
    0
}

// mmap() a file into the calling process's address space. Lazily
// faulted in a page at a time by vmatrylazytouch().
pub(super) fn sys_mmap() -> u64 {
    let _addr = argaddr(0); // placement is kernel-chosen; hint ignored
    let length = argint(1);
    let prot = argint(2);
    let flags = argint(3);
    let fd = argint(4);
    let offset = argint(5);

    if length <= 0 || fd < 0 || fd as usize >= NOFILE {
        return u64::MAX;
    }

    let p = myproc();
    let fptr = match p.ofile[fd as usize] {
        Some(fptr) => fptr,
        None => return u64::MAX,
    };
    let f = unsafe { fptr.as_mut().unwrap() };

    if (prot & PROT_WRITE) != 0 && (flags & MAP_SHARED) != 0 && !f.writable {
        return u64::MAX;
    }
    if (prot & PROT_READ) != 0 && !f.readable {
        return u64::MAX;
    }

    let len = crate::PGROUNDUP!(length as usize);

    let slot = match p.vma.iter().position(|v| v.is_none()) {
        Some(s) => s,
        None => return u64::MAX,
    };

    // grow the mmap area down from the lowest region in use so far, or
    // from MMAPEND if this is the first mapping.
    let lo = p.vma.iter().flatten().map(|v| v.va).min().unwrap_or(MMAPEND);
    if lo < len || lo - len < p.sz {
        return u64::MAX;
    }
    let va = lo - len;

    filedup(fptr);
    p.vma[slot] = Some(Vma {
        valid: true,
        va,
        sz: len,
        prot,
        flags,
        file: Some(fptr),
        offset: offset as usize,
    });

    va as u64
}

// Write the pages [va, va+len) of a MAP_SHARED region back to its
// backing file at the corresponding file offset, chunked so each
// transaction stays within the log's worst-case block budget.
fn writeback_vma(vma: &Vma, va: usize, len: usize) {
    let f = match vma.file {
        Some(f) => unsafe { f.as_mut().unwrap() },
        None => return,
    };
    let ip = unsafe { f.ip.unwrap().as_mut().unwrap() };
    let max = ((crate::param::MAXOPBLOCKS - 1 - 1 - 2) / 2) * crate::fs::BSIZE;
    let base = vma.offset + (va - vma.va);

    let mut i = 0;
    while i < len {
        let n1 = core::cmp::min(len - i, max);
        begin_op();
        ip.ilock();
        ip.writei(true, (va + i) as *mut u8, (base + i) as u32, n1);
        ip.iunlock();
        end_op();
        i += n1;
    }
}

pub(super) fn sys_munmap() -> u64 {
    let addr = argaddr(0);
    let length = argint(1);
    if length <= 0 {
        return u64::MAX;
    }
    let len = crate::PGROUNDUP!(length as usize);

    let p = myproc();
    let idx = match p.vma.iter().position(|v| {
        matches!(v, Some(vma) if addr >= vma.va && addr + len <= vma.va + vma.sz)
    }) {
        Some(i) => i,
        None => return u64::MAX,
    };

    let vma = p.vma[idx].unwrap();
    // only trimming from either end is supported, not punching a hole
    // in the middle of a mapping.
    if addr != vma.va && addr + len != vma.va + vma.sz {
        return u64::MAX;
    }

    if (vma.flags & MAP_SHARED) != 0 {
        writeback_vma(&vma, addr, len);
    }

    let pagetable = unsafe { p.pagetable.unwrap().as_mut().unwrap() };
    uvmunmap_sparse(pagetable, addr, len);

    let vma_mut = p.vma[idx].as_mut().unwrap();
    if addr == vma_mut.va {
        vma_mut.va += len;
    }
    vma_mut.sz -= len;

    if vma_mut.sz == 0 {
        if let Some(f) = vma_mut.file {
            fileclose(unsafe { f.as_mut().unwrap() });
        }
        p.vma[idx] = None;
    }

    0
}

// Called from the page-fault path (trap.rs) when a fault address isn't
// a COW page: look for a VMA covering it and fault in one zeroed page,
// populated from the backing file if there is one.
pub(crate) fn vmatrylazytouch(va: usize) -> i32 {
    let p = myproc();
    let va_down = PGROUNDDOWN!(va);

    let vma = match p.vma.iter().find(|v| {
        matches!(v, Some(vma) if va_down >= vma.va && va_down < vma.va + vma.sz)
    }) {
        Some(Some(vma)) => *vma,
        _ => return -1,
    };

    let mem: *mut u8 = unsafe { KMEM.kalloc() };
    if mem.is_null() {
        return -1;
    }
    memset(mem, 0, PGSIZE);

    if let Some(f) = vma.file {
        let ip = unsafe { f.as_mut().unwrap().ip.unwrap().as_mut().unwrap() };
        let file_off = vma.offset + (va_down - vma.va);
        ip.ilock();
        ip.readi(false, mem, file_off as u32, PGSIZE);
        ip.iunlock();
    }

    let mut perm = PTE_U;
    if vma.prot & PROT_READ != 0 {
        perm |= PTE_R;
    }
    if vma.prot & PROT_WRITE != 0 {
        perm |= PTE_W;
    }
    if vma.prot & PROT_EXEC != 0 {
        perm |= PTE_X;
    }

    let pagetable = unsafe { p.pagetable.unwrap().as_mut().unwrap() };
    if mappages(pagetable, va_down, mem.expose_addr(), PGSIZE, perm) != 0 {
        unsafe { KMEM.kfree(mem) };
        return -1;
    }

    0
}

// Tear down a process's mmap()ed regions at exit: write back any dirty
// MAP_SHARED pages, unmap, and drop the file reference.
pub(crate) fn vma_cleanup(p: &mut Proc) {
    for i in 0..NVMA {
        if let Some(vma) = p.vma[i].take() {
            if (vma.flags & MAP_SHARED) != 0 {
                writeback_vma(&vma, vma.va, vma.sz);
            }
            if let Some(pagetable) = p.pagetable {
                uvmunmap_sparse(unsafe { pagetable.as_mut().unwrap() }, vma.va, vma.sz);
            }
            if let Some(f) = vma.file {
                fileclose(unsafe { f.as_mut().unwrap() });
            }
        }
    }
}
