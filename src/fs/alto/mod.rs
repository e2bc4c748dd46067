//! ## Alto file system module
//!
//! This manipulates Diablo disk images containing a Xerox Alto file
//! system.  Files are doubly-linked chains of pages; every page carries
//! a label naming its file and position, the first page of a file is a
//! *leader* holding timestamps and the filename, the flat directory
//! lives in the ordinary file `SysDir`, and the volume header with its
//! free-page bit table lives in the file `DiskDescriptor`.
//!
//! The `Disk` struct is the single mutation point.  Construction loads
//! and validates the descriptor, repairing it from the labels when the
//! on-disk view is inconsistent, then builds the file info tree and
//! parses `SysDir`.  Mutating operations mark the descriptor and the
//! directory dirty independently; `save` (or dropping a dirty `Disk`
//! with a backing file) flushes both and writes the image back.
//!
//! `Disk` does no internal locking.  A mount host serving kernel
//! requests from several threads must serialize every call through one
//! lock; within a call, effects are atomic for external observers.

pub mod types;
pub mod pack;
pub mod directory;
pub mod fileinfo;

use std::cmp::min;
use log::{trace, debug, info, warn, error};
use a2kit_macro::DiskStruct;

use types::*;
use fileinfo::{FileInfo, FileInfoTree, MODE_RO, MODE_RW};
use directory::DirEntry;
use crate::bios::{rda_to_vda, vda_to_rda, NCYLS, NHEADS, NSECS, NPAGES};
use crate::img::diablo::DiabloImage;
use crate::{DYNERR, STDRESULT};

pub const FS_NAME: &str = "alto";

/// size of the descriptor header within its first data page
const KDH_SIZE: usize = 32;

/// position while stepping through a file chain one word at a time
struct WordCursor {
    vda: usize,
    filepage: u16,
    char_pos: u16,
}

/// The primary interface for disk operations.
pub struct Disk {
    img: DiabloImage,
    kdh: KdhHeader,
    bit_table: Vec<u16>,
    bit_count: usize,
    files: Vec<DirEntry>,
    tree: FileInfoTree,
    descriptor_dirty: bool,
    sysdir_dirty: bool,
    image_dirty: bool,
    repaired: bool,
}

fn strip_root(path: &str) -> &str {
    path.strip_prefix('/').unwrap_or(path)
}

fn is_protected(name: &str) -> bool {
    name == SYSDIR || name == DISK_DESCRIPTOR
}

impl Disk {
    /// Use the given image as storage for a new file system.  The file
    /// system takes ownership of the image, validates the descriptor,
    /// and repairs it if the labels disagree.
    pub fn from_img(img: DiabloImage) -> Result<Self, DYNERR> {
        let mut disk = Self {
            img,
            kdh: KdhHeader::new(),
            bit_table: Vec::new(),
            bit_count: 0,
            files: Vec::new(),
            tree: FileInfoTree::new(),
            descriptor_dirty: false,
            sysdir_dirty: false,
            image_dirty: false,
            repaired: false,
        };
        if !disk.validate_disk_descriptor()? {
            warn!("disk descriptor is inconsistent, rebuilding");
            disk.fix_disk_descriptor()?;
            disk.repaired = true;
        }
        disk.make_fileinfo()?;
        disk.read_sysdir()?;
        Ok(disk)
    }
    /// did loading have to rebuild the descriptor
    pub fn repaired(&self) -> bool {
        self.repaired
    }

    // typed views of a page

    pub fn page_label(&self, vda: usize) -> Label {
        Label::from_bytes(self.img.label(vda)).expect("bad label slice")
    }
    fn put_label(&mut self, vda: usize, l: &Label) {
        self.img.label_mut(vda).copy_from_slice(&l.to_bytes());
        self.image_dirty = true;
    }
    pub fn page_leader(&self, vda: usize) -> Leader {
        let mut buf = vec![0; PAGESZ];
        self.img.read_page_at(vda, 0, &mut buf);
        Leader::from_bytes(&buf).expect("bad leader slice")
    }
    fn put_leader(&mut self, vda: usize, lp: &Leader) {
        self.img.write_page_at(vda, 0, &lp.to_bytes());
        self.image_dirty = true;
    }

    // free page bit table

    /// Get a bit from the free page bit table.  Out of range reads as
    /// allocated so the caller will not touch the page.
    fn get_bt(&self, page: usize) -> u8 {
        if page >= self.bit_count {
            warn!("bit table page out of bounds ({})", page);
            return 1;
        }
        ((self.bit_table[page / 16] >> (15 - page % 16)) & 1) as u8
    }
    fn set_bt(&mut self, page: usize, val: u8) {
        if page >= self.bit_count {
            warn!("bit table page out of bounds ({})", page);
            return;
        }
        let offs = page / 16;
        let bit = 15 - page % 16;
        if val != ((self.bit_table[offs] >> bit) & 1) as u8 {
            self.bit_table[offs] =
                (self.bit_table[offs] & !(1 << bit)) | ((val as u16 & 1) << bit);
            self.descriptor_dirty = true;
        }
    }

    // page allocation

    /// Allocate a page from the free set, searching alternately above
    /// and below `prev_vda` so chains stay close together on the disk.
    /// With `prev_vda` 0 a fresh leader is created, otherwise the new
    /// page is linked behind `prev_vda` and inherits its identity.
    fn alloc_page(&mut self, prev_vda: usize) -> Option<usize> {
        if self.kdh.free_pages() == 0 {
            warn!("no free page left on the volume");
            return None;
        }
        let limit = min(self.bit_count, self.img.page_count());
        let mut page = prev_vda;
        let mut dist = 1;
        while dist < limit {
            if page + dist < limit && self.get_bt(page + dist) == 0 {
                page += dist;
                break;
            }
            if page > dist + 1 && self.get_bt(page - dist) == 0 {
                page -= dist;
                break;
            }
            dist += 1;
        }
        if self.get_bt(page) != 0 {
            warn!("no free page found near {}", prev_vda);
            return None;
        }
        self.kdh.set_free_pages(self.kdh.free_pages() - 1);
        self.descriptor_dirty = true;
        self.set_bt(page, 1);
        self.img.zero_page(page);
        let mut lthis = Label::new();
        lthis.set_prev_rda(vda_to_rda(prev_vda));
        if prev_vda != 0 {
            let mut lprev = self.page_label(prev_vda);
            lprev.set_next_rda(vda_to_rda(page));
            self.put_label(prev_vda, &lprev);
            lthis.set_filepage(lprev.filepage() + 1);
            lthis.set_fid_file(lprev.fid_file());
            lthis.set_fid_dir(lprev.fid_dir());
            lthis.set_fid_id(lprev.fid_id());
            lthis.set_nbytes(0);
        } else {
            lthis.set_filepage(0);
            lthis.set_fid_file(1);
            lthis.set_fid_dir(0);
            lthis.set_fid_id(self.kdh.serial());
            self.kdh.advance_serial();
            lthis.set_nbytes(PAGESZ as u16);
        }
        self.put_label(page, &lthis);
        trace!("allocated page {} behind {}", page, prev_vda);
        Some(page)
    }

    /// Clear the file identifiers of a page and return it to the free
    /// set.  `id` is the identifier of the owning file; a mismatch means
    /// the chain is corrupt.
    fn free_page(&mut self, page: usize, id: u16) {
        let mut l = self.page_label(page);
        if !(l.nbytes() == 0 || l.fid_id() == id) {
            panic!(
                "label id {:#06x} of page {} does not match the leader id {:#06x}",
                l.fid_id(),
                page,
                id
            );
        }
        l.set_fid_file(FID_FREE);
        l.set_fid_dir(FID_FREE);
        l.set_fid_id(FID_FREE);
        self.put_label(page, &l);
        self.kdh.set_free_pages(self.kdh.free_pages() + 1);
        self.descriptor_dirty = true;
        self.set_bt(page, 0);
    }

    // chain walking

    /// Find a file's leader page by a linear scan of the labels.
    fn find_file(&self, name: &str) -> Option<usize> {
        for page in 0..self.img.page_count() {
            let l = self.page_label(page);
            if l.filepage() == 0 && l.fid_file() == 1 {
                let lp = self.page_leader(page);
                if pack::filename_to_string(&lp.filename) == name {
                    return Some(page);
                }
            }
        }
        None
    }

    /// Walk a file chain, returning (byte length, data page count).
    /// The chain ends at the first data page shorter than `PAGESZ`.
    fn chain_stats(&self, leader_vda: usize) -> (usize, usize) {
        let mut page = rda_to_vda(self.page_label(leader_vda).next_rda());
        let mut bytes = 0;
        let mut pages = 0;
        let mut visited = 0;
        while page != 0 {
            visited += 1;
            if visited > self.img.page_count() {
                panic!("file chain from leader {} does not terminate", leader_vda);
            }
            let l = self.page_label(page);
            if l.is_free() {
                break;
            }
            bytes += l.nbytes() as usize;
            pages += 1;
            if l.nbytes() < PAGESZ as u16 {
                break;
            }
            page = rda_to_vda(l.next_rda());
        }
        (bytes, pages)
    }
    fn file_length(&self, leader_vda: usize) -> usize {
        self.chain_stats(leader_vda).0
    }

    /// Read the word under the cursor and advance, following the chain
    /// across page boundaries.  `None` at the end of the file.
    fn get_word(&self, fa: &mut WordCursor) -> Option<u16> {
        if fa.char_pos & 1 != 0 {
            panic!("word read on odd byte boundary ({})", fa.char_pos);
        }
        let mut l = self.page_label(fa.vda);
        if fa.char_pos >= l.nbytes() {
            if l.next_rda() == 0 || l.nbytes() < PAGESZ as u16 {
                return None;
            }
            fa.vda = rda_to_vda(l.next_rda());
            l = self.page_label(fa.vda);
            fa.filepage += 1;
            fa.char_pos = 0;
        }
        if fa.filepage != l.filepage() {
            panic!(
                "disk corruption - expected vda {} to be filepage {}",
                fa.vda,
                fa.filepage
            );
        }
        let w = self.img.data_word(fa.vda, (fa.char_pos >> 1) as usize);
        fa.char_pos += 2;
        Some(w)
    }

    /// Write a word under the cursor and advance.  The label's file page
    /// is stamped as we go.
    fn put_word(&mut self, fa: &mut WordCursor, w: u16) -> Option<()> {
        if fa.char_pos & 1 != 0 {
            panic!("word write on odd byte boundary ({})", fa.char_pos);
        }
        let mut l = self.page_label(fa.vda);
        if fa.char_pos >= l.nbytes() {
            if l.next_rda() == 0 || l.nbytes() < PAGESZ as u16 {
                return None;
            }
            fa.vda = rda_to_vda(l.next_rda());
            l = self.page_label(fa.vda);
            fa.filepage += 1;
            fa.char_pos = 0;
        }
        if l.filepage() != fa.filepage {
            l.set_filepage(fa.filepage);
            self.put_label(fa.vda, &l);
        }
        self.img.set_data_word(fa.vda, (fa.char_pos >> 1) as usize, w);
        self.image_dirty = true;
        fa.char_pos += 2;
        Some(())
    }

    // descriptor

    /// Load the descriptor and bit table and cross-check them against
    /// the labels.  Returns false when a `fix_disk_descriptor` pass is
    /// needed.
    fn validate_disk_descriptor(&mut self) -> Result<bool, DYNERR> {
        let ddlp = match self.find_file(DISK_DESCRIPTOR) {
            Some(vda) => vda,
            None => {
                error!("cannot find DiskDescriptor");
                return Err(Box::new(Error::MissingDescriptor));
            }
        };
        let l = self.page_label(ddlp);
        if l.next_rda() == 0 {
            error!("DiskDescriptor has no data page");
            return Err(Box::new(Error::MissingDescriptor));
        }
        let vda0 = rda_to_vda(l.next_rda());
        self.kdh = KdhHeader::from_bytes(&self.img.data_raw(vda0)[0..KDH_SIZE])
            .expect("bad descriptor slice");
        self.bit_count = self.kdh.disk_bt_size() as usize * 16;
        self.bit_table = Vec::with_capacity(self.kdh.disk_bt_size() as usize);
        let mut ok = true;
        let mut fa = WordCursor {
            vda: vda0,
            filepage: 1,
            char_pos: KDH_SIZE as u16,
        };
        for i in 0..self.kdh.disk_bt_size() {
            match self.get_word(&mut fa) {
                Some(w) => self.bit_table.push(w),
                None => {
                    warn!("bit table truncated at word {}", i);
                    self.bit_table.push(u16::MAX);
                    ok = false;
                }
            }
        }
        self.descriptor_dirty = false;
        info!(
            "bit table is {} words ({} bits)",
            self.kdh.disk_bt_size(),
            self.bit_count
        );
        if self.kdh.n_disks() as usize != self.img.units() {
            warn!(
                "descriptor names {} disks, image supplies {}",
                self.kdh.n_disks(),
                self.img.units()
            );
            ok = false;
        }
        if self.kdh.n_tracks() as usize != NCYLS
            || self.kdh.n_heads() as usize != NHEADS
            || self.kdh.n_sectors() as usize != NSECS
        {
            warn!(
                "descriptor geometry {}/{}/{} does not match the Diablo drive",
                self.kdh.n_tracks(),
                self.kdh.n_heads(),
                self.kdh.n_sectors()
            );
            ok = false;
        }
        if self.kdh.def_versions_kept() != 0 {
            warn!("default versions kept is {}", self.kdh.def_versions_kept());
            ok = false;
        }
        let nfree = (0..self.bit_count).filter(|p| self.get_bt(*p) == 0).count();
        if nfree != self.kdh.free_pages() as usize {
            warn!(
                "bit table free page count {} does not match descriptor value {}",
                nfree,
                self.kdh.free_pages()
            );
            ok = false;
        }
        let nfree = (0..self.img.page_count())
            .filter(|p| self.page_label(*p).is_free())
            .count();
        if nfree != self.kdh.free_pages() as usize {
            warn!(
                "label free page count {} does not match descriptor value {}",
                nfree,
                self.kdh.free_pages()
            );
            ok = false;
        }
        Ok(ok)
    }

    /// Rebuild the bit table and the per-page label fields by walking
    /// the leader chain of every live directory record, then recount the
    /// free pages.
    fn fix_disk_descriptor(&mut self) -> STDRESULT {
        self.make_fileinfo()?;
        self.read_sysdir()?;
        for idx in 0..self.files.len() {
            let entry = self.files[idx].clone();
            if !entry.is_live() {
                continue;
            }
            let name = entry.name();
            let leader = entry.fileptr.leader_vda() as usize;
            if leader == 0 || leader >= self.img.page_count() {
                warn!("record `{}` points outside the image ({})", name, leader);
                continue;
            }
            let l0 = self.page_label(leader);
            let length = self.file_length(leader);
            let mut fixed = false;
            let mut filepage: u16 = 0;
            let mut offset: usize = 0;
            let mut page = leader;
            let mut visited = 0;
            while page != 0 {
                visited += 1;
                if visited > self.img.page_count() {
                    panic!("file chain of `{}` does not terminate", name);
                }
                let mut l = self.page_label(page);
                let left = length.saturating_sub(offset);
                if self.get_bt(page) == 0 {
                    warn!("page {} filepage {} marked as free is wrong", page, filepage);
                    fixed = true;
                }
                self.set_bt(page, 1);
                if filepage > 0 {
                    let nbytes = l.nbytes() as usize;
                    if left >= PAGESZ && nbytes < PAGESZ {
                        warn!(
                            "page {} filepage {} nbytes {} is wrong (should be {})",
                            page, filepage, nbytes, PAGESZ
                        );
                        l.set_nbytes(PAGESZ as u16);
                        fixed = true;
                    }
                    if left < PAGESZ && nbytes != left {
                        warn!(
                            "page {} filepage {} last page nbytes {} is wrong (should be {})",
                            page, filepage, nbytes, left
                        );
                        l.set_nbytes(left as u16);
                        fixed = true;
                    }
                }
                if l.nbytes() > 0 {
                    if l.filepage() != filepage {
                        warn!(
                            "page {} filepage {} is wrong (should be {})",
                            page,
                            l.filepage(),
                            filepage
                        );
                        l.set_filepage(filepage);
                        fixed = true;
                    }
                    if l.fid_file() != l0.fid_file() {
                        warn!(
                            "page {} fid_file {:#06x} is wrong (should be {:#06x})",
                            page,
                            l.fid_file(),
                            l0.fid_file()
                        );
                        l.set_fid_file(l0.fid_file());
                        fixed = true;
                    }
                    if l.fid_dir() != l0.fid_dir() {
                        warn!(
                            "page {} fid_dir {:#06x} is wrong (should be {:#06x})",
                            page,
                            l.fid_dir(),
                            l0.fid_dir()
                        );
                        l.set_fid_dir(l0.fid_dir());
                        fixed = true;
                    }
                    if l.fid_id() != l0.fid_id() {
                        warn!(
                            "page {} fid_id {:#06x} is wrong (should be {:#06x})",
                            page,
                            l.fid_id(),
                            l0.fid_id()
                        );
                        l.set_fid_id(l0.fid_id());
                        fixed = true;
                    }
                }
                self.put_label(page, &l);
                if filepage > 0 {
                    offset += PAGESZ;
                    if l.nbytes() < PAGESZ as u16 {
                        break;
                    }
                }
                filepage += 1;
                page = rda_to_vda(l.next_rda());
            }
            let pages = (length + PAGESZ - 1) / PAGESZ;
            if fixed {
                warn!("file `{}`, {} pages, {} bytes was fixed", name, pages, length);
            } else {
                debug!("file `{}`, {} pages, {} bytes verified ok", name, pages, length);
            }
        }
        let nfree = (0..self.bit_count).filter(|p| self.get_bt(*p) == 0).count();
        if nfree != self.kdh.free_pages() as usize {
            warn!(
                "free page count corrected from {} to {}",
                self.kdh.free_pages(),
                nfree
            );
            self.kdh.set_free_pages(nfree as u16);
        }
        self.descriptor_dirty = true;
        Ok(())
    }

    /// Copy the descriptor header and bit table back into the
    /// `DiskDescriptor` file.
    fn save_disk_descriptor(&mut self) {
        let ddlp = self
            .find_file(DISK_DESCRIPTOR)
            .expect("DiskDescriptor vanished");
        let l = self.page_label(ddlp);
        let vda0 = rda_to_vda(l.next_rda());
        let bytes = self.kdh.to_bytes();
        self.img.data_raw_mut(vda0)[0..KDH_SIZE].copy_from_slice(&bytes);
        let mut fa = WordCursor {
            vda: vda0,
            filepage: 1,
            char_pos: KDH_SIZE as u16,
        };
        for i in 0..self.kdh.disk_bt_size() as usize {
            let w = self.bit_table[i];
            if self.put_word(&mut fa, w).is_none() {
                warn!("DiskDescriptor too short for the bit table at word {}", i);
                break;
            }
        }
        self.image_dirty = true;
        self.descriptor_dirty = false;
    }

    // file info tree

    fn make_fileinfo(&mut self) -> STDRESULT {
        self.tree = FileInfoTree::new();
        for page in 0..self.img.page_count() {
            if self.page_label(page).is_leader() {
                self.make_fileinfo_file(page)?;
            }
        }
        Ok(())
    }
    fn make_fileinfo_file(&mut self, leader_vda: usize) -> STDRESULT {
        let l = self.page_label(leader_vda);
        if l.filepage() != 0 {
            panic!("page {} is not a leader page", leader_vda);
        }
        let lp = self.page_leader(leader_vda);
        let name = pack::filename_to_string(&lp.filename);
        let mode = match l.fid_dir() == FID_DIR || name == DISK_DESCRIPTOR {
            true => MODE_RO,
            false => MODE_RW,
        };
        let mut info = FileInfo::new_file(name, leader_vda, mode);
        info.ctime = altotime_to_unix(lp.created());
        info.mtime = altotime_to_unix(lp.written());
        info.atime = altotime_to_unix(lp.read());
        let (bytes, pages) = self.chain_stats(leader_vda);
        info.size = bytes;
        info.blocks = pages;
        trace!(
            "fileinfo `{}` ino {} size {} pages {}",
            info.name,
            info.ino,
            info.size,
            info.blocks
        );
        self.tree.append(info);
        Ok(())
    }

    // system directory

    /// Scan the `SysDir` file into the record vector and mark deleted
    /// files in the info tree.
    fn read_sysdir(&mut self) -> STDRESULT {
        if self.sysdir_dirty {
            self.save_sysdir()?;
        }
        let info = match self.tree.find(SYSDIR) {
            Some(info) => info,
            None => {
                error!("the file SysDir was not found");
                return Err(Box::new(Error::MissingSysDir));
            }
        };
        let size = info.size;
        let leader = info.leader_vda;
        let mut buf = vec![0; size];
        self.read_file(leader, &mut buf, 0, false)?;
        self.files = directory::parse_directory(&buf);
        for idx in 0..self.files.len() {
            let name = self.files[idx].name();
            let live = self.files[idx].is_live();
            if let Some(info) = self.tree.find_mut(&name) {
                info.deleted = !live;
            }
        }
        Ok(())
    }

    /// Serialize the record vector back into the `SysDir` file,
    /// extending it when the directory grew.
    fn save_sysdir(&mut self) -> Result<(), Error> {
        let info = self.tree.find(SYSDIR).ok_or(Error::MissingSysDir)?;
        let leader = info.leader_vda;
        let stream = directory::serialize_directory(&self.files);
        let written = self.write_file(leader, &stream, 0, false)?;
        debug!("SysDir usage is {} bytes", stream.len());
        if written != stream.len() {
            error!("SysDir could not be extended");
            return Err(Error::DiskFull);
        }
        self.sysdir_dirty = false;
        Ok(())
    }

    fn remove_sysdir_entry(&mut self, name: &str) -> Result<(), Error> {
        for entry in self.files.iter_mut() {
            if entry.name() == name && entry.is_live() {
                entry.delete();
                self.sysdir_dirty = true;
                return Ok(());
            }
        }
        warn!("could not find `{}` in SysDir", name);
        Err(Error::FileNotFound)
    }

    fn rename_sysdir_entry(&mut self, name: &str, newname: &str) -> Result<(), Error> {
        if is_protected(name) {
            return Err(Error::Protected);
        }
        for entry in self.files.iter_mut() {
            if entry.name() == name && entry.is_live() {
                entry.rename(newname);
                // keep the directory in filename order
                self.files.sort_by_key(|e| e.name());
                self.sysdir_dirty = true;
                return Ok(());
            }
        }
        Err(Error::FileNotFound)
    }

    // public operations

    /// Get the info node for a path, or `None` if there is no such file.
    pub fn find(&self, path: &str) -> Option<&FileInfo> {
        if path == "/" {
            return Some(self.tree.root());
        }
        self.tree.find(strip_root(path))
    }
    /// All files on the volume, in label scan order.
    pub fn file_infos(&self) -> &[FileInfo] {
        self.tree.children()
    }
    pub fn free_pages(&self) -> usize {
        self.kdh.free_pages() as usize
    }
    pub fn page_count(&self) -> usize {
        self.img.page_count()
    }
    /// Copy of the image bytes; callers wanting durable changes should
    /// `flush` first.
    pub fn to_img(&self) -> Vec<u8> {
        self.img.to_bytes()
    }
    /// the 512 data bytes of a page in raw word order
    pub fn page_data_raw(&self, vda: usize) -> Vec<u8> {
        self.img.data_raw(vda).to_vec()
    }

    /// Fill a statvfs-like summary of the volume.
    pub fn statfs(&self) -> Result<VolumeStat, Error> {
        if self.tree.children().is_empty() {
            return Err(Error::NotLoaded);
        }
        let free = self.kdh.free_pages() as usize;
        Ok(VolumeStat {
            bsize: PAGESZ,
            frsize: PAGESZ,
            blocks: NPAGES * self.img.units(),
            bfree: free,
            bavail: free,
            files: self.files.len(),
            // a new file costs at least a leader page and a data page
            ffree: free / 2,
            favail: free / 2,
            fsid: self.kdh.serial() as u64,
            namemax: FNLEN - 2,
        })
    }

    /// Read `buf.len()` bytes from the file at `leader_vda`, starting at
    /// `offset`.  Returns the number of bytes actually read, which is
    /// short at the end of the file.
    pub fn read_file(
        &mut self,
        leader_vda: usize,
        buf: &mut [u8],
        offset: usize,
        update: bool,
    ) -> Result<usize, Error> {
        if self.tree.find_by_vda(leader_vda).is_none() {
            return Err(Error::FileNotFound);
        }
        let size = buf.len();
        let mut page = rda_to_vda(self.page_label(leader_vda).next_rda());
        let mut done = 0;
        let mut pos = 0;
        let mut visited = 0;
        while page != 0 && done < size {
            visited += 1;
            if visited > self.img.page_count() {
                panic!("file chain from leader {} does not terminate", leader_vda);
            }
            let l = self.page_label(page);
            if l.is_free() {
                break;
            }
            let nb = l.nbytes() as usize;
            if offset + done >= pos + nb {
                // page lies before the requested range
                pos += nb;
            } else {
                let from = offset + done - pos;
                let take = min(nb - from, size - done);
                self.img.read_page_at(page, from, &mut buf[done..done + take]);
                done += take;
                pos += nb;
            }
            if nb < PAGESZ {
                break;
            }
            page = rda_to_vda(l.next_rda());
        }
        if update && done > 0 {
            let now = chrono::Utc::now().timestamp();
            if let Some(info) = self.tree.find_by_vda_mut(leader_vda) {
                info.atime = now;
            }
        }
        Ok(done)
    }

    /// Write `dat` into the file at `leader_vda`, starting at `offset`,
    /// allocating pages as the file grows.  Returns the number of bytes
    /// written; when the volume fills up this is short and the file
    /// keeps what was written.
    pub fn write_file(
        &mut self,
        leader_vda: usize,
        dat: &[u8],
        offset: usize,
        update: bool,
    ) -> Result<usize, Error> {
        if self.tree.find_by_vda(leader_vda).is_none() {
            return Err(Error::FileNotFound);
        }
        let mut lp = self.page_leader(leader_vda);
        let mut page = rda_to_vda(self.page_label(leader_vda).next_rda());
        let mut pos = 0;
        let (hint_vda, hint_fp, _) = lp.last_page_hint();
        if hint_fp >= 1
            && hint_vda != 0
            && (hint_vda as usize) < self.img.page_count()
            && offset >= (hint_fp as usize - 1) * PAGESZ
            && !self.page_label(hint_vda as usize).is_free()
        {
            // the write lands at or beyond the last page
            page = hint_vda as usize;
            pos = (hint_fp as usize - 1) * PAGESZ;
        }
        let size = dat.len();
        let mut done = 0;
        let mut last_touched = 0;
        let mut visited = 0;
        while page != 0 && done < size {
            visited += 1;
            if visited > self.img.page_count() {
                panic!("file chain from leader {} does not terminate", leader_vda);
            }
            let mut l = self.page_label(page);
            let left = size - done;
            if pos >= offset && l.nbytes() == PAGESZ as u16 {
                // aligned overwrite; a short chunk becomes the new tail
                let chunk = min(left, PAGESZ);
                self.img.write_page_at(page, 0, &dat[done..done + chunk]);
                l.set_nbytes(chunk as u16);
                self.put_label(page, &l);
                done += chunk;
                last_touched = page;
            } else if l.nbytes() < PAGESZ as u16 {
                // fill a partial page, from the requested position if it
                // falls inside the current extent, else from the tail
                let to = match offset + done >= pos {
                    true => min(offset + done - pos, l.nbytes() as usize),
                    false => l.nbytes() as usize,
                };
                let chunk = min(left, PAGESZ - to);
                self.img.write_page_at(page, to, &dat[done..done + chunk]);
                let new_nb = std::cmp::max(l.nbytes() as usize, to + chunk);
                l.set_nbytes(new_nb as u16);
                self.put_label(page, &l);
                done += chunk;
                last_touched = page;
                if new_nb < PAGESZ {
                    break;
                }
            } else {
                trace!("seeking past page {} (pos {:#08x})", page, pos);
            }
            pos += PAGESZ;
            let next = l.next_rda();
            let mut next_vda = match next {
                0 => 0,
                _ => rda_to_vda(next),
            };
            if next_vda != 0 && self.page_label(next_vda).is_free() {
                // stale link left by an earlier truncation
                next_vda = 0;
            }
            if done < size && next_vda == 0 {
                match self.alloc_page(page) {
                    Some(p) => next_vda = p,
                    None => break, // out of space, return the partial count
                }
            }
            page = next_vda;
        }
        if done > 0 {
            // a chain never ends on a full page
            let lt = self.page_label(last_touched);
            if lt.nbytes() == PAGESZ as u16 {
                let next = lt.next_rda();
                let ends = next == 0 || self.page_label(rda_to_vda(next)).is_free();
                if ends {
                    if let Some(p) = self.alloc_page(last_touched) {
                        last_touched = p;
                    }
                }
            }
            let lt = self.page_label(last_touched);
            lp.set_last_page_hint(last_touched as u16, lt.filepage(), lt.nbytes());
            self.put_leader(leader_vda, &lp);
            let (bytes, pages) = self.chain_stats(leader_vda);
            let now = chrono::Utc::now().timestamp();
            if let Some(info) = self.tree.find_by_vda_mut(leader_vda) {
                info.size = bytes;
                info.blocks = pages;
                if update {
                    info.mtime = now;
                }
            }
            self.image_dirty = true;
        }
        Ok(done)
    }

    /// Truncate (or extend) the file at `path` to `new_size` bytes.
    /// Freed pages return to the bit table; extension allocates zeroed
    /// pages and fails with `DiskFull` when the volume cannot hold them.
    pub fn truncate_file(&mut self, path: &str, new_size: usize) -> Result<(), Error> {
        let name = strip_root(path);
        let (leader_vda, old_blocks) = match self.tree.find(name) {
            Some(info) => (info.leader_vda, info.blocks),
            None => return Err(Error::FileNotFound),
        };
        let id = self.page_label(leader_vda).fid_id();
        // a chain never ends on a full page, so exact multiples keep an
        // empty tail page
        let total_pages = match new_size % PAGESZ {
            0 => new_size / PAGESZ + 1,
            _ => (new_size + PAGESZ - 1) / PAGESZ,
        };
        let nbytes_of = |i: usize| min(PAGESZ, new_size.saturating_sub((i - 1) * PAGESZ));
        let mut page = rda_to_vda(self.page_label(leader_vda).next_rda());
        let mut i = 1;
        let mut covered = 0;
        let mut last_page = leader_vda;
        let mut visited = 0;
        while page != 0 && i <= total_pages {
            visited += 1;
            if visited > self.img.page_count() {
                panic!("file chain from leader {} does not terminate", leader_vda);
            }
            let mut l = self.page_label(page);
            if l.is_free() || l.fid_id() != id {
                // stale link, the rest must be allocated fresh
                page = 0;
                break;
            }
            let nb = nbytes_of(i);
            if l.nbytes() as usize != nb {
                l.set_nbytes(nb as u16);
                self.put_label(page, &l);
            }
            covered += nb;
            last_page = page;
            i += 1;
            page = rda_to_vda(l.next_rda());
        }
        if i <= total_pages {
            // extend
            while i <= total_pages {
                match self.alloc_page(last_page) {
                    Some(p) => {
                        let nb = nbytes_of(i);
                        let mut l = self.page_label(p);
                        l.set_nbytes(nb as u16);
                        self.put_label(p, &l);
                        covered += nb;
                        last_page = p;
                        i += 1;
                    }
                    None => {
                        self.finish_truncate(leader_vda, last_page, covered, i - 1);
                        return Err(Error::DiskFull);
                    }
                }
            }
        } else {
            // free everything beyond the new tail
            let mut visited = 0;
            while page != 0 {
                visited += 1;
                if visited > old_blocks + 1 {
                    break;
                }
                let l = self.page_label(page);
                if l.is_free() {
                    break;
                }
                self.free_page(page, id);
                page = rda_to_vda(l.next_rda());
                if l.nbytes() < PAGESZ as u16 {
                    break;
                }
            }
        }
        self.finish_truncate(leader_vda, last_page, new_size, total_pages);
        Ok(())
    }
    fn finish_truncate(&mut self, leader_vda: usize, last_page: usize, size: usize, pages: usize) {
        let l = self.page_label(last_page);
        let mut lp = self.page_leader(leader_vda);
        lp.set_last_page_hint(last_page as u16, l.filepage(), l.nbytes());
        self.put_leader(leader_vda, &lp);
        if let Some(info) = self.tree.find_by_vda_mut(leader_vda) {
            info.size = size;
            info.blocks = pages;
        }
        self.image_dirty = true;
    }

    /// Create an empty file: a leader page, one empty data page, and a
    /// directory record inserted in filename order.
    pub fn create_file(&mut self, path: &str) -> Result<(), Error> {
        let name = strip_root(path).to_string();
        if self.tree.find(&name).is_some() {
            return Err(Error::FileExists);
        }
        if !pack::is_name_valid(&name) {
            error!("invalid Alto file name `{}`", name);
            return Err(Error::InvalidName);
        }
        let leader = match self.alloc_page(0) {
            Some(p) => p,
            None => return Err(Error::DiskFull),
        };
        let id = self.page_label(leader).fid_id();
        let mut lp = Leader::new();
        let now = now_altotime();
        lp.set_created(now);
        lp.set_written(now);
        lp.set_read(now);
        pack::string_to_filename(&mut lp.filename, &name);
        let mut fp = FilePointer::new();
        fp.set_fid_dir(FID_DIR);
        fp.set_version(1);
        match self.tree.find(SYSDIR) {
            Some(sysdir) => {
                fp.set_serialno(self.page_label(sysdir.leader_vda).fid_id());
                fp.set_leader_vda(sysdir.leader_vda as u16);
            }
            None => fp.set_leader_vda(1),
        }
        lp.set_dir_fp_hint(&fp);
        lp.propbegin = ((12 + FNLEN) / 2) as u8;
        lp.proplength = 210;
        let page0 = match self.alloc_page(leader) {
            Some(p) => p,
            None => {
                error!("volume full while allocating the first page of `{}`", name);
                self.free_page(leader, id);
                return Err(Error::DiskFull);
            }
        };
        lp.set_last_page_hint(page0 as u16, 1, 0);
        self.put_leader(leader, &lp);
        self.dump_leader(&lp);
        let (idx, reuse) = directory::insertion_index(&self.files, &name);
        let entry = DirEntry::create(&name, id, leader as u16);
        if reuse {
            self.files[idx] = entry;
        } else {
            self.files.insert(idx, entry);
        }
        self.sysdir_dirty = true;
        let mut info = FileInfo::new_file(name, leader, MODE_RW);
        let t = altotime_to_unix(now);
        info.ctime = t;
        info.mtime = t;
        info.atime = t;
        info.blocks = 1;
        self.tree.append(info);
        Ok(())
    }

    /// Delete the file at `path`: free its chain, drop it from the info
    /// tree, and tombstone its directory record.
    pub fn unlink_file(&mut self, path: &str) -> Result<(), Error> {
        let name = strip_root(path).to_string();
        let leader_vda = match self.tree.find(&name) {
            Some(info) => info.leader_vda,
            None => return Err(Error::FileNotFound),
        };
        if is_protected(&name) {
            return Err(Error::Protected);
        }
        // zap the leader so a label scan will not resurrect the file
        let mut lp = self.page_leader(leader_vda);
        lp.filename = [0; FNLEN];
        lp.set_last_page_hint(0, 0, 0);
        self.put_leader(leader_vda, &lp);
        let id = self.page_label(leader_vda).fid_id();
        let mut page = leader_vda;
        let mut visited = 0;
        while page != 0 {
            visited += 1;
            if visited > self.img.page_count() {
                panic!("file chain from leader {} does not terminate", leader_vda);
            }
            let l = self.page_label(page);
            if l.is_free() {
                break;
            }
            self.free_page(page, id);
            if l.nbytes() < PAGESZ as u16 {
                break;
            }
            page = rda_to_vda(l.next_rda());
        }
        let mut l = self.page_label(leader_vda);
        l.set_next_rda(0);
        l.set_prev_rda(0);
        l.unused1 = [0; 2];
        l.set_fid_file(FID_FREE);
        l.set_fid_dir(FID_FREE);
        l.set_fid_id(FID_FREE);
        self.put_label(leader_vda, &l);
        self.tree.remove(&name);
        self.remove_sysdir_entry(&name)
    }

    /// Rename the file at `path`.  The protected files refuse, and the
    /// new name must fit the on-disk filename field.
    pub fn rename_file(&mut self, path: &str, newname: &str) -> Result<(), Error> {
        let name = strip_root(path).to_string();
        let newname = strip_root(newname).to_string();
        let leader_vda = match self.tree.find(&name) {
            Some(info) => info.leader_vda,
            None => return Err(Error::FileNotFound),
        };
        if is_protected(&name) {
            return Err(Error::Protected);
        }
        if !pack::is_name_valid(&newname) {
            error!("new name `{}` is too long or invalid", newname);
            return Err(Error::InvalidName);
        }
        self.rename_sysdir_entry(&name, &newname)?;
        let mut lp = self.page_leader(leader_vda);
        pack::string_to_filename(&mut lp.filename, &newname);
        self.put_leader(leader_vda, &lp);
        if let Some(info) = self.tree.find_mut(&name) {
            info.name = newname;
        }
        Ok(())
    }

    /// Stamp last access and last write times on the file at `path`.
    pub fn set_times(&mut self, path: &str, atime: i64, mtime: i64) -> Result<(), Error> {
        let name = strip_root(path);
        let leader_vda = match self.tree.find(name) {
            Some(info) => info.leader_vda,
            None => return Err(Error::FileNotFound),
        };
        let mut lp = self.page_leader(leader_vda);
        lp.set_written(unix_to_altotime(mtime));
        lp.set_read(unix_to_altotime(atime));
        self.put_leader(leader_vda, &lp);
        if let Some(info) = self.tree.find_by_vda_mut(leader_vda) {
            info.mtime = mtime;
            info.atime = atime;
        }
        self.image_dirty = true;
        Ok(())
    }

    /// Write dirty metadata back into the image buffer.  The directory
    /// goes first since extending it can allocate pages and touch the
    /// descriptor.
    pub fn flush(&mut self) -> STDRESULT {
        if self.sysdir_dirty {
            self.save_sysdir()?;
        }
        if self.descriptor_dirty {
            self.save_disk_descriptor();
        }
        Ok(())
    }
    /// Flush and write the image back to its backup files.
    pub fn save(&mut self) -> STDRESULT {
        self.flush()?;
        self.img.save()?;
        self.image_dirty = false;
        Ok(())
    }

    /// Check the quantified invariants without touching the image:
    /// descriptor, bit table, and labels must agree on the free count.
    pub fn check_consistency(&self) -> bool {
        let mut ok = true;
        let nbits = (0..self.bit_count).filter(|p| self.get_bt(*p) == 0).count();
        if nbits != self.kdh.free_pages() as usize {
            warn!(
                "bit table count {} vs descriptor {}",
                nbits,
                self.kdh.free_pages()
            );
            ok = false;
        }
        let nlabels = (0..self.img.page_count())
            .filter(|p| self.page_label(*p).is_free())
            .count();
        if nlabels != self.kdh.free_pages() as usize {
            warn!(
                "label count {} vs descriptor {}",
                nlabels,
                self.kdh.free_pages()
            );
            ok = false;
        }
        ok
    }

    fn dump_leader(&self, lp: &Leader) {
        trace!("created  : {}", altotime_to_string(lp.created()));
        trace!("written  : {}", altotime_to_string(lp.written()));
        trace!("read     : {}", altotime_to_string(lp.read()));
        trace!("filename : {}", pack::filename_to_string(&lp.filename));
        let (vda, filepage, char_pos) = lp.last_page_hint();
        trace!("last page: vda {} filepage {} char_pos {}", vda, filepage, char_pos);
    }
}

impl Drop for Disk {
    fn drop(&mut self) {
        if self.descriptor_dirty || self.sysdir_dirty || self.image_dirty {
            if self.img.has_backing() {
                if let Err(e) = self.save() {
                    error!("could not save changes on close: {}", e);
                }
            } else {
                debug!("dropping unsaved changes (no backing file)");
            }
        }
    }
}
