#![allow(non_camel_case_types)]

/// On-disk/in-memory inode kind, xv6's `T_DIR`/`T_FILE`/`T_DEVICE` plus a
/// `T_SYMLINK` kind for symbolic links.
#[repr(i16)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FileType {
    NO_TYPE = 0,
    T_DIR = 1,
    T_FILE = 2,
    T_DEVICE = 3,
    T_SYMLINK = 4,
}

impl FileType {
    pub fn from_i16(v: i16) -> FileType {
        match v {
            1 => FileType::T_DIR,
            2 => FileType::T_FILE,
            3 => FileType::T_DEVICE,
            4 => FileType::T_SYMLINK,
            _ => FileType::NO_TYPE,
        }
    }
}

/// Result of the `fstat` syscall, laid out to match what a user-space
/// caller expects to find at the pointer it passed in.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct Stat {
    pub dev: i32,
    pub ino: u32,
    pub file_type: i16,
    pub nlink: i16,
    pub size: u64,
}
