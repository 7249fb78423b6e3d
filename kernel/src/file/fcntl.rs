// open() flags, matching xv6's kernel/fcntl.h.

pub const O_RDONLY: i32 = 0x000;
pub const O_WRONLY: i32 = 0x001;
pub const O_RDWR: i32 = 0x002;
pub const O_CREATE: i32 = 0x200;
pub const O_TRUNC: i32 = 0x400;
// open() without this flag follows a terminal symlink; with it, open()
// returns the symlink itself.
pub const O_NOFOLLOW: i32 = 0x800;

// mmap() protection bits, matching xv6's kernel/fcntl.h / mman.h subset.
pub const PROT_NONE: i32 = 0x0;
pub const PROT_READ: i32 = 0x1;
pub const PROT_WRITE: i32 = 0x2;
pub const PROT_EXEC: i32 = 0x4;

// mmap() flags. MAP_PRIVATE mmaps are never written back to the file;
// MAP_SHARED mmaps are, by munmap() and process exit.
pub const MAP_SHARED: i32 = 0x01;
pub const MAP_PRIVATE: i32 = 0x02;
