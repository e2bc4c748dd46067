//! ### File info tree
//!
//! In-memory stat for every file on the volume, kept apart from the
//! image so the mount host can answer `getattr`/`readdir` without
//! touching disk structures.  The hierarchy is one root directory with
//! file children; nodes refer to their leader page by VDA rather than
//! holding any pointer into the image.

use super::types::PAGESZ;

pub const MODE_DIR: u32 = 0o040755;
pub const MODE_RO: u32 = 0o100400;
pub const MODE_RW: u32 = 0o100666;

/// Stat-like record for one file, or for the root directory.
#[derive(Clone)]
pub struct FileInfo {
    /// inode of the containing directory; the root itself has none
    pub parent: Option<u64>,
    pub name: String,
    /// the leader page VDA doubles as the inode number
    pub ino: u64,
    pub mode: u32,
    pub nlink: u32,
    pub size: usize,
    pub blocks: usize,
    pub blksize: usize,
    pub ctime: i64,
    pub mtime: i64,
    pub atime: i64,
    pub leader_vda: usize,
    pub deleted: bool,
}

impl FileInfo {
    pub fn new_file(name: String, leader_vda: usize, mode: u32) -> Self {
        Self {
            parent: None,
            name,
            ino: leader_vda as u64,
            mode,
            nlink: 0,
            size: 0,
            blocks: 0,
            blksize: PAGESZ,
            ctime: 0,
            mtime: 0,
            atime: 0,
            leader_vda,
            deleted: false,
        }
    }
}

/// The root directory and its children.
pub struct FileInfoTree {
    root: FileInfo,
    children: Vec<FileInfo>,
}

impl FileInfoTree {
    pub fn new() -> Self {
        let mut root = FileInfo::new_file("/".to_string(), 0, MODE_DIR);
        root.nlink = 2; // "." and ".."
        Self {
            root,
            children: Vec::new(),
        }
    }
    pub fn root(&self) -> &FileInfo {
        &self.root
    }
    pub fn children(&self) -> &[FileInfo] {
        &self.children
    }
    pub fn append(&mut self, mut info: FileInfo) {
        info.parent = Some(self.root.ino);
        self.children.push(info);
    }
    pub fn find(&self, name: &str) -> Option<&FileInfo> {
        self.children.iter().find(|i| i.name == name)
    }
    pub fn find_mut(&mut self, name: &str) -> Option<&mut FileInfo> {
        self.children.iter_mut().find(|i| i.name == name)
    }
    pub fn find_by_vda(&self, leader_vda: usize) -> Option<&FileInfo> {
        self.children.iter().find(|i| i.leader_vda == leader_vda)
    }
    pub fn find_by_vda_mut(&mut self, leader_vda: usize) -> Option<&mut FileInfo> {
        self.children.iter_mut().find(|i| i.leader_vda == leader_vda)
    }
    pub fn remove(&mut self, name: &str) -> bool {
        match self.children.iter().position(|i| i.name == name) {
            Some(idx) => {
                self.children.remove(idx);
                true
            }
            None => false,
        }
    }
}

#[test]
fn tree_edits() {
    let mut tree = FileInfoTree::new();
    tree.append(FileInfo::new_file("SysDir".to_string(), 1, MODE_RO));
    tree.append(FileInfo::new_file("Memo.txt".to_string(), 40, MODE_RW));
    assert_eq!(tree.root().parent, None);
    assert_eq!(
        tree.find("Memo.txt").expect("lost file").parent,
        Some(tree.root().ino)
    );
    assert_eq!(tree.find("Memo.txt").expect("lost file").leader_vda, 40);
    assert!(tree.find("memo.txt").is_none()); // lookup is case sensitive
    tree.find_mut("Memo.txt").expect("lost file").name = "Letter.txt".to_string();
    assert!(tree.find_by_vda(40).is_some());
    assert!(tree.remove("Letter.txt"));
    assert!(!tree.remove("Letter.txt"));
    assert_eq!(tree.children().len(), 1);
}
