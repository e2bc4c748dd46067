
use thiserror::Error;

// a2kit_macro automatically derives `new`, `to_bytes`, `from_bytes`, and `length` from a DiskStruct.
// This spares us having to manually write code to copy bytes in and out for every new structure.
use a2kit_macro::{DiskStruct, DiskStructError};
use a2kit_macro_derive::DiskStruct;

/// Number of data bytes in one page
pub const PAGESZ: usize = 512;
/// Size of the on-disk filename field, including length byte and trailing dot
pub const FNLEN: usize = 40;
/// Longest name the filename field can encode, without the trailing dot
pub const MAX_NAME: usize = FNLEN - 3;
/// The flat root directory file, present on every volume
pub const SYSDIR: &str = "SysDir";
/// The volume header file, present on every volume
pub const DISK_DESCRIPTOR: &str = "DiskDescriptor";

/// Offset to Unix epoch; addition relies on 32 bit wrap-around.
pub const ALTOTIME_MAGIC: u32 = 2117503696;

pub const FID_FREE: u16 = 0xffff;
pub const FID_DIR: u16 = 0x8000;

/// Enumerates file system errors.  The `Display` trait will print the long message.
/// `errno` gives the negative POSIX code a mount host wants.
#[derive(Error, Debug)]
pub enum Error {
    #[error("file not found")]
    FileNotFound,
    #[error("file already exists")]
    FileExists,
    #[error("operation not permitted")]
    Protected,
    #[error("insufficient space")]
    DiskFull,
    #[error("invalid file name")]
    InvalidName,
    #[error("file system not loaded")]
    NotLoaded,
    #[error("SysDir is missing")]
    MissingSysDir,
    #[error("DiskDescriptor is missing")]
    MissingDescriptor,
    #[error("file system is inconsistent")]
    Inconsistent,
}

impl Error {
    pub fn errno(&self) -> i32 {
        match self {
            Self::FileNotFound => -2,   // ENOENT
            Self::FileExists => -17,    // EEXIST
            Self::Protected => -1,      // EPERM
            Self::DiskFull => -28,      // ENOSPC
            Self::InvalidName => -22,   // EINVAL
            Self::NotLoaded => -9,      // EBADF
            Self::MissingSysDir => -5,  // EIO
            Self::MissingDescriptor => -5,
            Self::Inconsistent => -5,
        }
    }
}

// Word order: the image stores every 16 bit word low byte first, so the
// `raw` structures below (labels, the descriptor header) read words with
// `from_le_bytes`.  The character stream of file data is the byte-pair
// swap of the raw bytes, so the `stream` structures (leader, file
// pointer) read words with `from_be_bytes`.

/// The label attached to every page (raw order, 8 words).
/// `next_rda`/`prev_rda` chain the pages of a file; an RDA of 0 ends the chain.
#[derive(DiskStruct, Copy, Clone)]
pub struct Label {
    pub next_rda: [u8; 2],
    pub prev_rda: [u8; 2],
    pub unused1: [u8; 2],
    pub nbytes: [u8; 2],
    pub filepage: [u8; 2],
    pub fid_file: [u8; 2],
    pub fid_dir: [u8; 2],
    pub fid_id: [u8; 2],
}

impl Label {
    pub fn next_rda(&self) -> u16 {
        u16::from_le_bytes(self.next_rda)
    }
    pub fn prev_rda(&self) -> u16 {
        u16::from_le_bytes(self.prev_rda)
    }
    pub fn nbytes(&self) -> u16 {
        u16::from_le_bytes(self.nbytes)
    }
    pub fn filepage(&self) -> u16 {
        u16::from_le_bytes(self.filepage)
    }
    pub fn fid_file(&self) -> u16 {
        u16::from_le_bytes(self.fid_file)
    }
    pub fn fid_dir(&self) -> u16 {
        u16::from_le_bytes(self.fid_dir)
    }
    pub fn fid_id(&self) -> u16 {
        u16::from_le_bytes(self.fid_id)
    }
    pub fn set_next_rda(&mut self, v: u16) {
        self.next_rda = u16::to_le_bytes(v);
    }
    pub fn set_prev_rda(&mut self, v: u16) {
        self.prev_rda = u16::to_le_bytes(v);
    }
    pub fn set_nbytes(&mut self, v: u16) {
        self.nbytes = u16::to_le_bytes(v);
    }
    pub fn set_filepage(&mut self, v: u16) {
        self.filepage = u16::to_le_bytes(v);
    }
    pub fn set_fid_file(&mut self, v: u16) {
        self.fid_file = u16::to_le_bytes(v);
    }
    pub fn set_fid_dir(&mut self, v: u16) {
        self.fid_dir = u16::to_le_bytes(v);
    }
    pub fn set_fid_id(&mut self, v: u16) {
        self.fid_id = u16::to_le_bytes(v);
    }
    /// is this the first page of a live file
    pub fn is_leader(&self) -> bool {
        self.filepage() == 0 && self.fid_file() == 1 && self.prev_rda() == 0
    }
    /// all three file identifiers cleared
    pub fn is_free(&self) -> bool {
        self.fid_file() == FID_FREE && self.fid_dir() == FID_FREE && self.fid_id() == FID_FREE
    }
}

/// Header of the `DiskDescriptor` file (raw order, 16 words).
#[derive(DiskStruct, Clone)]
pub struct KdhHeader {
    pub n_disks: [u8; 2],
    pub n_tracks: [u8; 2],
    pub n_heads: [u8; 2],
    pub n_sectors: [u8; 2],
    pub last_sn: [u8; 4],
    pub blank: [u8; 2],
    pub disk_bt_size: [u8; 2],
    pub def_versions_kept: [u8; 2],
    pub free_pages: [u8; 2],
    pub blank1: [u8; 12],
}

impl KdhHeader {
    pub fn n_disks(&self) -> u16 {
        u16::from_le_bytes(self.n_disks)
    }
    pub fn n_tracks(&self) -> u16 {
        u16::from_le_bytes(self.n_tracks)
    }
    pub fn n_heads(&self) -> u16 {
        u16::from_le_bytes(self.n_heads)
    }
    pub fn n_sectors(&self) -> u16 {
        u16::from_le_bytes(self.n_sectors)
    }
    pub fn disk_bt_size(&self) -> u16 {
        u16::from_le_bytes(self.disk_bt_size)
    }
    pub fn def_versions_kept(&self) -> u16 {
        u16::from_le_bytes(self.def_versions_kept)
    }
    pub fn free_pages(&self) -> u16 {
        u16::from_le_bytes(self.free_pages)
    }
    pub fn set_free_pages(&mut self, v: u16) {
        self.free_pages = u16::to_le_bytes(v);
    }
    /// the running counter is the low-order word of the 32 bit serial
    pub fn serial(&self) -> u16 {
        u16::from_le_bytes([self.last_sn[2], self.last_sn[3]])
    }
    pub fn advance_serial(&mut self) {
        let bytes = u16::to_le_bytes(self.serial().wrapping_add(1));
        self.last_sn[2] = bytes[0];
        self.last_sn[3] = bytes[1];
    }
}

/// File pointer as found in directory records and the leader hint
/// (stream order, 5 words big endian).
#[derive(DiskStruct, Copy, Clone)]
pub struct FilePointer {
    pub fid_dir: [u8; 2],
    pub serialno: [u8; 2],
    pub version: [u8; 2],
    pub blank: [u8; 2],
    pub leader_vda: [u8; 2],
}

impl FilePointer {
    pub fn fid_dir(&self) -> u16 {
        u16::from_be_bytes(self.fid_dir)
    }
    pub fn serialno(&self) -> u16 {
        u16::from_be_bytes(self.serialno)
    }
    pub fn version(&self) -> u16 {
        u16::from_be_bytes(self.version)
    }
    pub fn leader_vda(&self) -> u16 {
        u16::from_be_bytes(self.leader_vda)
    }
    pub fn set_fid_dir(&mut self, v: u16) {
        self.fid_dir = u16::to_be_bytes(v);
    }
    pub fn set_serialno(&mut self, v: u16) {
        self.serialno = u16::to_be_bytes(v);
    }
    pub fn set_version(&mut self, v: u16) {
        self.version = u16::to_be_bytes(v);
    }
    pub fn set_leader_vda(&mut self, v: u16) {
        self.leader_vda = u16::to_be_bytes(v);
    }
}

/// The leader page of a file (stream order, 256 words).  Holds the
/// timestamps, the on-disk filename, and the last page hint used for
/// appending.  The property area is carried but not interpreted.
#[derive(DiskStruct, Clone)]
pub struct Leader {
    pub created: [u8; 4],
    pub written: [u8; 4],
    pub read: [u8; 4],
    pub filename: [u8; FNLEN],
    pub leader_props: [u8; 420],
    pub spare: [u8; 20],
    pub proplength: u8,
    pub propbegin: u8,
    pub change_sn: u8,
    pub consecutive: u8,
    pub dir_fp_hint: [u8; 10],
    pub last_page_hint: [u8; 6],
}

impl Leader {
    pub fn created(&self) -> u32 {
        u32::from_be_bytes(self.created)
    }
    pub fn written(&self) -> u32 {
        u32::from_be_bytes(self.written)
    }
    pub fn read(&self) -> u32 {
        u32::from_be_bytes(self.read)
    }
    pub fn set_created(&mut self, t: u32) {
        self.created = u32::to_be_bytes(t);
    }
    pub fn set_written(&mut self, t: u32) {
        self.written = u32::to_be_bytes(t);
    }
    pub fn set_read(&mut self, t: u32) {
        self.read = u32::to_be_bytes(t);
    }
    pub fn dir_fp_hint(&self) -> FilePointer {
        FilePointer::from_bytes(&self.dir_fp_hint).expect("bad file pointer slice")
    }
    pub fn set_dir_fp_hint(&mut self, fp: &FilePointer) {
        self.dir_fp_hint.copy_from_slice(&fp.to_bytes());
    }
    /// last page hint as (vda, filepage, char_pos)
    pub fn last_page_hint(&self) -> (u16, u16, u16) {
        (
            u16::from_be_bytes([self.last_page_hint[0], self.last_page_hint[1]]),
            u16::from_be_bytes([self.last_page_hint[2], self.last_page_hint[3]]),
            u16::from_be_bytes([self.last_page_hint[4], self.last_page_hint[5]]),
        )
    }
    pub fn set_last_page_hint(&mut self, vda: u16, filepage: u16, char_pos: u16) {
        self.last_page_hint[0..2].copy_from_slice(&u16::to_be_bytes(vda));
        self.last_page_hint[2..4].copy_from_slice(&u16::to_be_bytes(filepage));
        self.last_page_hint[4..6].copy_from_slice(&u16::to_be_bytes(char_pos));
    }
}

/// Counterpart of `statvfs` for the mount host.
pub struct VolumeStat {
    pub bsize: usize,
    pub frsize: usize,
    pub blocks: usize,
    pub bfree: usize,
    pub bavail: usize,
    pub files: usize,
    pub ffree: usize,
    pub favail: usize,
    pub fsid: u64,
    pub namemax: usize,
}

/// Convert an Alto 32 bit timestamp to seconds since the Unix epoch.
/// The all-ones value is the Alto's "never" and maps to 1.
pub fn altotime_to_unix(at: u32) -> i64 {
    if at == u32::MAX {
        1
    } else {
        at.wrapping_add(ALTOTIME_MAGIC) as i64
    }
}

/// Convert seconds since the Unix epoch to an Alto 32 bit timestamp.
pub fn unix_to_altotime(t: i64) -> u32 {
    (t as u32).wrapping_sub(ALTOTIME_MAGIC)
}

pub fn now_altotime() -> u32 {
    unix_to_altotime(chrono::Utc::now().timestamp())
}

/// Render an Alto timestamp for the catalog listing.
pub fn altotime_to_string(at: u32) -> String {
    match chrono::DateTime::from_timestamp(altotime_to_unix(at), 0) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => "<no date>".to_string(),
    }
}

#[test]
fn time_round_trip() {
    for t in [0i64, 86400, 1_000_000_000, 1_234_567_890] {
        assert_eq!(altotime_to_unix(unix_to_altotime(t)), t);
    }
    // "never"
    assert_eq!(altotime_to_unix(u32::MAX), 1);
}

#[test]
fn label_fields() {
    let mut l = Label::new();
    assert_eq!(l.len(), 16);
    l.set_fid_file(FID_FREE);
    l.set_fid_dir(FID_FREE);
    l.set_fid_id(FID_FREE);
    assert!(l.is_free());
    l.set_fid_file(1);
    l.set_fid_id(0x1234);
    assert!(!l.is_free());
    assert!(l.is_leader());
    let bytes = l.to_bytes();
    assert_eq!(bytes[10], 0x01); // fid_file stored low byte first
    let copy = Label::from_bytes(&bytes).expect("bad label");
    assert_eq!(copy.fid_id(), 0x1234);
}

#[test]
fn leader_layout() {
    let mut lp = Leader::new();
    assert_eq!(lp.len(), PAGESZ);
    lp.set_created(0x01020304);
    lp.set_last_page_hint(100, 3, 76);
    let bytes = lp.to_bytes();
    assert_eq!(bytes[0..4], [1, 2, 3, 4]);
    let copy = Leader::from_bytes(&bytes).expect("bad leader");
    assert_eq!(copy.last_page_hint(), (100, 3, 76));
}
