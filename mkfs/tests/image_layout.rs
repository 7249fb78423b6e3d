// Black-box check of the on-disk image mkfs produces, against the
// layout spelled out in spec.md section 6 (little-endian superblock,
// root directory containing "." and "..").

use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::process::Command;

const BSIZE: usize = 1024;
const FSMAGIC: u32 = 0x10203040;
const DIRSIZ: usize = 14;

fn read_block(path: &std::path::Path, blockno: u64) -> Vec<u8> {
    let mut f = fs::File::open(path).expect("open image");
    f.seek(SeekFrom::Start(blockno * BSIZE as u64)).unwrap();
    let mut buf = vec![0u8; BSIZE];
    f.read_exact(&mut buf).unwrap();
    buf
}

fn le_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

fn build_image(out: &std::path::Path) {
    let status = Command::new(env!("CARGO_BIN_EXE_mkfs"))
        .arg("--output-name")
        .arg(out)
        .status()
        .expect("run mkfs");
    assert!(status.success());
}

#[test]
fn superblock_matches_spec_layout() {
    let dir = std::env::temp_dir();
    let img = dir.join(format!("mkfs-test-{}.img", std::process::id()));
    build_image(&img);

    let sb = read_block(&img, 1);
    assert_eq!(le_u32(&sb, 0), FSMAGIC, "superblock magic");

    let size = le_u32(&sb, 4);
    let nblocks = le_u32(&sb, 8);
    let ninodes = le_u32(&sb, 12);
    let nlog = le_u32(&sb, 16);
    let logstart = le_u32(&sb, 20);
    let inodestart = le_u32(&sb, 24);
    let bmapstart = le_u32(&sb, 28);

    assert_eq!(size, 10000);
    assert!(nblocks < size, "data blocks must leave room for meta blocks");
    assert_eq!(logstart, 2, "log follows boot+super block");
    assert!(inodestart > logstart + nlog, "inode table follows the log");
    assert!(bmapstart > inodestart, "bitmap follows the inode table");
    assert_eq!(ninodes, 200);

    fs::remove_file(&img).ok();
}

#[test]
fn root_directory_has_dot_and_dotdot() {
    let dir = std::env::temp_dir();
    let img = dir.join(format!("mkfs-test-root-{}.img", std::process::id()));
    build_image(&img);

    let sb = read_block(&img, 1);
    let inodestart = le_u32(&sb, 24);

    // root inode is inum 1; each inode is 16 bytes (type, major, minor,
    // nlink: i16 each, size: u32, addrs[14]: u32 each) = 2*4 + 4 + 14*4 = 68 bytes.
    const DINODE_SIZE: usize = 2 * 4 + 4 + 14 * 4;
    let ipb = BSIZE / DINODE_SIZE;
    let inum = 1usize;
    let inode_block = read_block(&img, (inodestart as usize + inum / ipb) as u64);
    let off = (inum % ipb) * DINODE_SIZE;
    let file_type = i16::from_le_bytes(inode_block[off..off + 2].try_into().unwrap());
    assert_eq!(file_type, 1, "root inode must be T_DIR");

    let size = le_u32(&inode_block, off + 8);
    assert!(size > 0, "root directory has at least . and .. entries");

    // walk the root directory's first data block for "." and ".." dirents.
    let addrs_off = off + 12;
    let first_data_block = le_u32(&inode_block, addrs_off);
    assert_ne!(first_data_block, 0);
    let data = read_block(&img, first_data_block as u64);

    const DIRENT_SIZE: usize = 2 + DIRSIZ;
    let mut names = Vec::new();
    for entry in data.chunks(DIRENT_SIZE).take((size as usize) / DIRENT_SIZE) {
        let inum = u16::from_le_bytes(entry[0..2].try_into().unwrap());
        if inum != 0 {
            let nul = entry[2..].iter().position(|&b| b == 0).unwrap_or(DIRSIZ);
            names.push(String::from_utf8_lossy(&entry[2..2 + nul]).to_string());
        }
    }
    assert!(names.contains(&".".to_string()));
    assert!(names.contains(&"..".to_string()));

    fs::remove_file(&img).ok();
}
