//! ### SysDir records
//!
//! The system directory is an ordinary file whose content is a packed
//! sequence of variable-length records, each mapping a filename to the
//! file's leader page.  Records are word structures in the character
//! stream, so all fields here are stream order (big endian words).
//!
//! Deleted files leave a tombstone record in place; this preserves the
//! offsets of everything behind it.  The directory ends at the first
//! record whose filename length byte is zero or out of range.

// a2kit_macro automatically derives `new`, `to_bytes`, `from_bytes`, and `length` from a DiskStruct.
// The auto-derivation is not used for structures with variable length fields.
use a2kit_macro::{DiskStruct, DiskStructError};

use log::{debug, trace};
use super::pack;
use super::types::{FilePointer, FNLEN};

/// record type of a live file
pub const TYPE_FILE: u8 = 4;
/// record type of a tombstone
pub const TYPE_DELETED: u8 = 0;

/// the fixed prefix: type/length word plus file pointer
const PREFIX_SIZE: usize = 12;

/// One record of the system directory.  The filename field keeps its
/// on-disk padding so offsets survive a round trip.
#[derive(Clone)]
pub struct DirEntry {
    pub dv_type: u8,
    pub dv_length: u8,
    pub fileptr: FilePointer,
    filename: Vec<u8>,
}

impl DirEntry {
    /// Build a live record for a new file.  The caller has validated the name.
    pub fn create(name: &str, serialno: u16, leader_vda: u16) -> Self {
        let fnlen = name.len() + 1;
        let mut filename = vec![0; (fnlen | 1) + 1];
        pack::string_to_filename(&mut filename, name);
        let mut fileptr = FilePointer::new();
        fileptr.set_fid_dir(0);
        fileptr.set_serialno(serialno);
        fileptr.set_version(1);
        fileptr.set_leader_vda(leader_vda);
        Self {
            dv_type: TYPE_FILE,
            dv_length: name.len() as u8,
            fileptr,
            filename,
        }
    }
    pub fn name(&self) -> String {
        pack::filename_to_string(&self.filename)
    }
    pub fn is_live(&self) -> bool {
        self.dv_type == TYPE_FILE
    }
    pub fn delete(&mut self) {
        self.dv_type = TYPE_DELETED;
    }
    /// Rewrite the filename; the record size may change.
    pub fn rename(&mut self, name: &str) {
        let fnlen = name.len() + 1;
        self.filename = vec![0; (fnlen | 1) + 1];
        pack::string_to_filename(&mut self.filename, name);
        self.dv_length = name.len() as u8;
    }
}

impl DiskStruct for DirEntry {
    fn new() -> Self {
        Self {
            dv_type: 0,
            dv_length: 0,
            fileptr: FilePointer::new(),
            filename: Vec::new(),
        }
    }
    fn to_bytes(&self) -> Vec<u8> {
        let mut ans = vec![self.dv_type, self.dv_length];
        ans.append(&mut self.fileptr.to_bytes());
        ans.append(&mut self.filename.clone());
        ans
    }
    fn update_from_bytes(&mut self, bytes: &[u8]) -> Result<(), DiskStructError> {
        if bytes.len() < PREFIX_SIZE + 1 {
            return Err(DiskStructError::OutOfData);
        }
        self.dv_type = bytes[0];
        self.dv_length = bytes[1];
        self.fileptr = FilePointer::from_bytes(&bytes[2..PREFIX_SIZE])?;
        let fnlen = bytes[PREFIX_SIZE] as usize;
        let field = (fnlen | 1) + 1;
        if PREFIX_SIZE + field > bytes.len() {
            return Err(DiskStructError::OutOfData);
        }
        self.filename = bytes[PREFIX_SIZE..PREFIX_SIZE + field].to_vec();
        Ok(())
    }
    fn from_bytes(bytes: &[u8]) -> Result<Self, DiskStructError> {
        let mut ans = Self::new();
        ans.update_from_bytes(bytes)?;
        Ok(ans)
    }
    fn len(&self) -> usize {
        PREFIX_SIZE + self.filename.len()
    }
}

/// Scan the SysDir content (stream order) into records.  Stops at the
/// first record with a zero or out-of-range filename length.
pub fn parse_directory(stream: &[u8]) -> Vec<DirEntry> {
    let mut ans = Vec::new();
    let mut offset = 0;
    let mut deleted = 0;
    while offset + PREFIX_SIZE < stream.len() {
        let fnlen = stream[offset + PREFIX_SIZE] as usize;
        if fnlen == 0 || fnlen > FNLEN {
            break;
        }
        let entry = match DirEntry::from_bytes(&stream[offset..]) {
            Ok(e) => e,
            Err(_) => break,
        };
        trace!(
            "directory entry @{}: type {} leader {} `{}`",
            offset,
            entry.dv_type,
            entry.fileptr.leader_vda(),
            entry.name()
        );
        if !entry.is_live() {
            deleted += 1;
        }
        offset += entry.len();
        ans.push(entry);
    }
    debug!(
        "SysDir holds {} records ({} deleted) in {} bytes",
        ans.len(),
        deleted,
        offset
    );
    ans
}

/// Pack records back into a stream.  The terminator is a full blank
/// record prefix, so a scan stops on its zero filename length even when
/// stale bytes from a longer directory follow it in the file.
pub fn serialize_directory(entries: &[DirEntry]) -> Vec<u8> {
    let mut ans = Vec::new();
    for entry in entries {
        ans.append(&mut entry.to_bytes());
    }
    ans.append(&mut vec![0; PREFIX_SIZE + 2]);
    ans
}

/// Index at which a new record keeps the directory sorted by name.
/// If a tombstone with the same name exists its index is returned for reuse.
pub fn insertion_index(entries: &[DirEntry], name: &str) -> (usize, bool) {
    for (idx, entry) in entries.iter().enumerate() {
        let fname = entry.name();
        if fname == name && !entry.is_live() {
            return (idx, true);
        }
        if fname.as_str() > name {
            return (idx, false);
        }
    }
    (entries.len(), false)
}

#[test]
fn record_round_trip() {
    let entry = DirEntry::create("Memo.txt", 0x42, 100);
    // 12 byte prefix + (9|1)+1 = 10 byte name field
    assert_eq!(entry.len(), 22);
    let bytes = entry.to_bytes();
    let copy = DirEntry::from_bytes(&bytes).expect("bad record");
    assert_eq!(copy.name(), "Memo.txt");
    assert_eq!(copy.fileptr.leader_vda(), 100);
    assert_eq!(copy.fileptr.version(), 1);
    assert!(copy.is_live());
}

#[test]
fn directory_round_trip() {
    let names = ["DiskDescriptor", "SysDir", "copydisk.run"];
    let mut entries = Vec::new();
    for (i, name) in names.iter().enumerate() {
        entries.push(DirEntry::create(name, i as u16, 10 * i as u16 + 1));
    }
    entries[2].delete();
    let stream = serialize_directory(&entries);
    let copy = parse_directory(&stream);
    assert_eq!(copy.len(), 3);
    assert_eq!(copy[0].name(), "DiskDescriptor");
    assert_eq!(copy[1].name(), "SysDir");
    assert!(!copy[2].is_live());
}

#[test]
fn sorted_insert() {
    let mut entries = Vec::new();
    for name in ["Alpha", "Gamma"] {
        entries.push(DirEntry::create(name, 1, 1));
    }
    assert_eq!(insertion_index(&entries, "Beta"), (1, false));
    assert_eq!(insertion_index(&entries, "Zeta"), (2, false));
    entries[0].delete();
    assert_eq!(insertion_index(&entries, "Alpha"), (0, true));
}
