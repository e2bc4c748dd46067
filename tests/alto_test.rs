// test of the alto file system module
//
// These tests build small consistent volumes in memory, mount them, and
// drive the public operations the way a mount host would.

use a2kit_macro::DiskStruct;
use altofs::bios::{vda_to_rda, NPAGES};
use altofs::fs::alto::directory::{serialize_directory, DirEntry};
use altofs::fs::alto::types::{
    unix_to_altotime, Error, KdhHeader, Label, Leader, FID_DIR, FID_FREE, PAGESZ,
};
use altofs::fs::alto::{pack, Disk};
use altofs::img::diablo::{DiabloImage, UNIT_SIZE};

const BT_WORDS: usize = (NPAGES + 15) / 16;
const BUILD_TIME: i64 = 1_000_000_000;

/// data pages a file of `len` bytes occupies; exact multiples keep an
/// empty tail page
fn data_pages_for(len: usize) -> usize {
    match len % PAGESZ {
        0 => len / PAGESZ + 1,
        _ => (len + PAGESZ - 1) / PAGESZ,
    }
}

fn record_len(name: &str) -> usize {
    12 + ((name.len() + 1) | 1) + 1
}

/// serialized directory size: the records plus the blank terminator prefix
fn directory_len(names: &[&str]) -> usize {
    names.iter().map(|n| record_len(n)).sum::<usize>() + 14
}

fn put_label(img: &mut DiabloImage, vda: usize, l: &Label) {
    img.label_mut(vda).copy_from_slice(&l.to_bytes());
}

/// stamp an orphan in-use label, standing in for pages outside any chain
fn put_orphan(img: &mut DiabloImage, vda: usize) {
    let mut l = Label::new();
    l.set_filepage(1);
    l.set_nbytes(PAGESZ as u16);
    l.set_fid_file(1);
    l.set_fid_id(0xb007);
    put_label(img, vda, &l);
}

/// Lay a file chain down at pre-assigned pages.
fn write_chain(
    img: &mut DiabloImage,
    leader: usize,
    pages: &[usize],
    name: &str,
    content: &[u8],
    fid_dir: u16,
    id: u16,
) {
    let mut l = Label::new();
    l.set_next_rda(vda_to_rda(pages[0]));
    l.set_nbytes(PAGESZ as u16);
    l.set_fid_file(1);
    l.set_fid_dir(fid_dir);
    l.set_fid_id(id);
    put_label(img, leader, &l);
    let mut lp = Leader::new();
    let t = unix_to_altotime(BUILD_TIME);
    lp.set_created(t);
    lp.set_written(t);
    lp.set_read(t);
    pack::string_to_filename(&mut lp.filename, name);
    let last = pages[pages.len() - 1];
    let tail_nb = content.len() - (pages.len() - 1) * PAGESZ;
    lp.set_last_page_hint(last as u16, pages.len() as u16, tail_nb as u16);
    img.write_page_at(leader, 0, &lp.to_bytes());
    let mut prev = leader;
    for (i, page) in pages.iter().enumerate() {
        let nb = std::cmp::min(PAGESZ, content.len().saturating_sub(i * PAGESZ));
        let mut l = Label::new();
        if i + 1 < pages.len() {
            l.set_next_rda(vda_to_rda(pages[i + 1]));
        }
        l.set_prev_rda(vda_to_rda(prev));
        l.set_nbytes(nb as u16);
        l.set_filepage(i as u16 + 1);
        l.set_fid_file(1);
        l.set_fid_dir(fid_dir);
        l.set_fid_id(id);
        put_label(img, *page, &l);
        if nb > 0 {
            img.write_page_at(*page, 0, &content[i * PAGESZ..i * PAGESZ + nb]);
        }
        prev = *page;
    }
}

/// Build a consistent single-unit volume holding the given user files,
/// with `filler` additional pages marked in use to shrink the free pool.
fn build_volume(user_files: &[(&str, Vec<u8>)], filler: usize) -> DiabloImage {
    let mut img = DiabloImage::from_bytes(&vec![0; UNIT_SIZE]).expect("bad unit size");
    let mut used = vec![false; NPAGES];
    // free pages carry cleared file identifiers
    let mut free = Label::new();
    free.set_fid_file(FID_FREE);
    free.set_fid_dir(FID_FREE);
    free.set_fid_id(FID_FREE);
    for vda in 0..NPAGES {
        put_label(&mut img, vda, &free);
    }
    // page 0 stands in for the boot page
    put_orphan(&mut img, 0);
    used[0] = true;
    for i in 0..filler {
        let vda = NPAGES - 1 - i;
        put_orphan(&mut img, vda);
        used[vda] = true;
    }
    // sort all files the way SysDir keeps them
    let mut names: Vec<&str> = vec!["DiskDescriptor", "SysDir"];
    names.extend(user_files.iter().map(|(n, _)| *n));
    names.sort();
    let sysdir_size = directory_len(&names);
    let dd_size = 32 + 2 * BT_WORDS;
    // assign pages in directory order
    let mut next = 1;
    let mut alloc = |n: usize, used: &mut Vec<bool>| -> Vec<usize> {
        let pages: Vec<usize> = (next..next + n).collect();
        for p in &pages {
            used[*p] = true;
        }
        next += n;
        pages
    };
    let mut layout = Vec::new();
    for (i, name) in names.iter().enumerate() {
        let content_len = match *name {
            "SysDir" => sysdir_size,
            "DiskDescriptor" => dd_size,
            _ => user_files.iter().find(|(n, _)| n == name).expect("lost file").1.len(),
        };
        let pages = alloc(1 + data_pages_for(content_len), &mut used);
        layout.push((name.to_string(), pages, 100 + i as u16));
    }
    // directory records point at the leaders just assigned
    let mut entries = Vec::new();
    for (name, pages, id) in &layout {
        let mut entry = DirEntry::create(name, *id, pages[0] as u16);
        if name == "SysDir" {
            entry.fileptr.set_fid_dir(FID_DIR);
        }
        entries.push(entry);
    }
    let sysdir_content = serialize_directory(&entries);
    assert_eq!(sysdir_content.len(), sysdir_size);
    for (name, pages, id) in &layout {
        let content: Vec<u8> = match name.as_str() {
            "SysDir" => sysdir_content.clone(),
            "DiskDescriptor" => vec![0; dd_size],
            _ => user_files
                .iter()
                .find(|(n, _)| n == name)
                .expect("lost file")
                .1
                .to_vec(),
        };
        let fid_dir = match name.as_str() {
            "SysDir" => FID_DIR,
            _ => 0,
        };
        write_chain(&mut img, pages[0], &pages[1..], name, &content, fid_dir, *id);
    }
    // descriptor header and bit table go in raw word order
    let used_count = used.iter().filter(|u| **u).count();
    let mut kdh = KdhHeader::new();
    kdh.n_disks = u16::to_le_bytes(1);
    kdh.n_tracks = u16::to_le_bytes(203);
    kdh.n_heads = u16::to_le_bytes(2);
    kdh.n_sectors = u16::to_le_bytes(12);
    kdh.last_sn = [0, 0, 200, 0];
    kdh.disk_bt_size = u16::to_le_bytes(BT_WORDS as u16);
    kdh.free_pages = u16::to_le_bytes((NPAGES - used_count) as u16);
    let mut bits = vec![0u16; BT_WORDS];
    for vda in 0..NPAGES {
        if used[vda] {
            bits[vda / 16] |= 1 << (15 - vda % 16);
        }
    }
    for spare in NPAGES..16 * BT_WORDS {
        bits[spare / 16] |= 1 << (15 - spare % 16);
    }
    let mut dd_content = kdh.to_bytes();
    for w in bits {
        dd_content.extend_from_slice(&u16::to_le_bytes(w));
    }
    let dd_pages = &layout
        .iter()
        .find(|(n, _, _)| n == "DiskDescriptor")
        .expect("lost descriptor")
        .1;
    let mut offset = 0;
    for page in &dd_pages[1..] {
        let n = std::cmp::min(PAGESZ, dd_content.len() - offset);
        img.data_raw_mut(*page)[0..n].copy_from_slice(&dd_content[offset..offset + n]);
        offset += n;
        if offset == dd_content.len() {
            break;
        }
    }
    img
}

fn leader_of(disk: &Disk, name: &str) -> usize {
    disk.find(name).expect("file not found").leader_vda
}

/// walk a chain collecting (vda, label) for every data page
fn chain(disk: &Disk, leader: usize) -> Vec<(usize, Label)> {
    let mut ans = Vec::new();
    let mut l = disk.page_label(leader);
    let mut page = altofs::bios::rda_to_vda(l.next_rda());
    while page != 0 {
        l = disk.page_label(page);
        if l.is_free() {
            break;
        }
        ans.push((page, l));
        if l.nbytes() < PAGESZ as u16 {
            break;
        }
        page = altofs::bios::rda_to_vda(l.next_rda());
    }
    ans
}

/// the resting invariants: counts agree, chains are well formed
fn assert_invariants(disk: &Disk) {
    assert!(disk.check_consistency());
    for info in disk.file_infos() {
        let pages = chain(disk, info.leader_vda);
        let leader_label = disk.page_label(info.leader_vda);
        let mut prev = info.leader_vda;
        for (i, (vda, l)) in pages.iter().enumerate() {
            assert_eq!(l.filepage() as usize, i + 1, "file {}", info.name);
            assert_eq!(
                altofs::bios::rda_to_vda(l.prev_rda()),
                prev,
                "backlink of page {} in {}",
                vda,
                info.name
            );
            assert_eq!(l.fid_id(), leader_label.fid_id());
            if i + 1 < pages.len() {
                assert_eq!(l.nbytes() as usize, PAGESZ);
            }
            prev = *vda;
        }
        let tail = pages.last().expect("empty chain");
        assert!((tail.1.nbytes() as usize) < PAGESZ, "file {}", info.name);
    }
}

#[test]
fn load_clean_volume() {
    // S1: everything agrees, no repair pass runs
    let img = build_volume(&[("copydisk.run", vec![7u8; 600])], 0);
    let disk = Disk::from_img(img).expect("mount failed");
    assert!(!disk.repaired());
    assert!(disk.find("SysDir").is_some());
    assert!(disk.find("DiskDescriptor").is_some());
    assert!(disk.find("copydisk.run").is_some());
    assert!(disk.find("nosuchfile").is_none());
    assert_eq!(disk.find("copydisk.run").expect("lost file").size, 600);
    let stat = disk.statfs().expect("statfs failed");
    assert_eq!(stat.bsize, PAGESZ);
    assert_eq!(stat.blocks, NPAGES);
    assert_eq!(stat.bfree, disk.free_pages());
    assert_eq!(stat.files, 3);
    assert_eq!(stat.namemax, 38);
    assert_invariants(&disk);
}

#[test]
fn read_across_pages() {
    // S2: leader + 3 data pages of 512, 512, 100 bytes
    let content: Vec<u8> = (0..1124u32).map(|i| (i % 251) as u8).collect();
    let img = build_volume(&[("Hello", content.clone())], 0);
    let mut disk = Disk::from_img(img).expect("mount failed");
    let leader = leader_of(&disk, "Hello");
    assert_eq!(disk.find("Hello").expect("lost file").blocks, 3);
    let mut buf = vec![0; 600];
    let n = disk.read_file(leader, &mut buf, 400, true).expect("read failed");
    assert_eq!(n, 600);
    assert_eq!(buf, content[400..1000].to_vec());
    // reading the tail comes up short
    let mut buf = vec![0; 600];
    let n = disk.read_file(leader, &mut buf, 1000, false).expect("read failed");
    assert_eq!(n, 124);
    assert_eq!(buf[0..124], content[1000..1124]);
    // offset exactly at a page boundary
    let mut buf = vec![0; 100];
    let n = disk.read_file(leader, &mut buf, 512, false).expect("read failed");
    assert_eq!(n, 100);
    assert_eq!(buf, content[512..612].to_vec());
    // unknown leader fails
    assert!(matches!(
        disk.read_file(4000, &mut buf, 0, false),
        Err(Error::FileNotFound)
    ));
}

#[test]
fn write_extends_file() {
    // S3: 1000 byte file grows to 1100 via the last page hint
    let content: Vec<u8> = (0..1000u32).map(|i| (i % 239) as u8).collect();
    let img = build_volume(&[("Grow", content.clone())], 0);
    let mut disk = Disk::from_img(img).expect("mount failed");
    let free0 = disk.free_pages();
    let leader = leader_of(&disk, "Grow");
    let patch = vec![0x58u8; 200];
    let n = disk.write_file(leader, &patch, 900, true).expect("write failed");
    assert_eq!(n, 200);
    assert_eq!(disk.find("Grow").expect("lost file").size, 1100);
    assert_eq!(disk.free_pages(), free0 - 1);
    let pages = chain(&disk, leader);
    assert_eq!(pages.len(), 3);
    assert_eq!(pages[1].1.nbytes() as usize, PAGESZ);
    assert_eq!(pages[2].1.nbytes(), 76);
    let lp = disk.page_leader(leader);
    assert_eq!(lp.last_page_hint(), (pages[2].0 as u16, 3, 76));
    // the write is readable back
    let mut buf = vec![0; 1100];
    let n = disk.read_file(leader, &mut buf, 0, false).expect("read failed");
    assert_eq!(n, 1100);
    assert_eq!(buf[0..900], content[0..900]);
    assert_eq!(buf[900..1100], patch[..]);
    assert_invariants(&disk);
}

#[test]
fn truncate_frees_pages() {
    // S4: shrink the 1100 byte file to 300, pages return to the free set
    let content: Vec<u8> = (0..1100u32).map(|i| (i % 239) as u8).collect();
    let img = build_volume(&[("Grow", content.clone())], 0);
    let mut disk = Disk::from_img(img).expect("mount failed");
    let free0 = disk.free_pages();
    let leader = leader_of(&disk, "Grow");
    disk.truncate_file("/Grow", 300).expect("truncate failed");
    assert_eq!(disk.find("Grow").expect("lost file").size, 300);
    assert_eq!(disk.free_pages(), free0 + 2);
    let pages = chain(&disk, leader);
    assert_eq!(pages.len(), 1);
    assert_eq!(pages[0].1.nbytes(), 300);
    let lp = disk.page_leader(leader);
    assert_eq!(lp.last_page_hint(), (pages[0].0 as u16, 1, 300));
    assert_invariants(&disk);
    // truncate to zero keeps the leader and one empty page
    disk.truncate_file("/Grow", 0).expect("truncate failed");
    assert_eq!(disk.find("Grow").expect("lost file").size, 0);
    let pages = chain(&disk, leader);
    assert_eq!(pages.len(), 1);
    assert_eq!(pages[0].1.nbytes(), 0);
    assert_invariants(&disk);
    // extend it again; fresh pages are zero filled
    disk.truncate_file("/Grow", 700).expect("truncate failed");
    assert_eq!(disk.find("Grow").expect("lost file").size, 700);
    let mut buf = vec![0xffu8; 700];
    let n = disk.read_file(leader, &mut buf, 0, false).expect("read failed");
    assert_eq!(n, 700);
    assert_eq!(buf[512..700], vec![0u8; 188][..]);
    assert_invariants(&disk);
}

#[test]
fn rename_and_protection() {
    // S5
    let img = build_volume(&[("Old", vec![1u8; 100])], 0);
    let mut disk = Disk::from_img(img).expect("mount failed");
    let leader = leader_of(&disk, "Old");
    disk.rename_file("/Old", "/NewName").expect("rename failed");
    assert!(disk.find("Old").is_none());
    assert!(disk.find("NewName").is_some());
    let lp = disk.page_leader(leader);
    assert_eq!(pack::filename_to_string(&lp.filename), "NewName");
    match disk.unlink_file("/SysDir") {
        Err(Error::Protected) => {}
        _ => panic!("unlinking SysDir should be refused"),
    }
    match disk.rename_file("/DiskDescriptor", "/dd") {
        Err(Error::Protected) => {}
        _ => panic!("renaming DiskDescriptor should be refused"),
    }
    match disk.rename_file("/NewName", &"x".repeat(50)) {
        Err(Error::InvalidName) => {}
        _ => panic!("over-long name should be refused"),
    }
    assert_eq!(Error::Protected.errno(), -1);
    assert_eq!(Error::FileNotFound.errno(), -2);
    assert_invariants(&disk);
}

#[test]
fn repair_rebuilds_descriptor() {
    // S6: a reachable in-use page is marked free in the on-disk bit
    // table; loading must repair the descriptor
    let content = vec![9u8; 700];
    let mut img = build_volume(&[("Hurt", content.clone())], 0);
    // find the leader by scanning labels the way the fs would
    let mut victim = 0;
    for vda in 1..NPAGES {
        let l = Label::from_bytes(img.label(vda)).expect("bad label");
        if l.filepage() == 2 && l.fid_id() >= 100 {
            victim = vda;
            break;
        }
    }
    assert!(victim != 0);
    // clear the victim's bit where the descriptor file stores it, without
    // adjusting the free page count
    let mut dd_data = 0;
    for vda in 0..NPAGES {
        let l = Label::from_bytes(img.label(vda)).expect("bad label");
        if l.filepage() == 0 && l.fid_file() == 1 {
            let mut buf = vec![0; PAGESZ];
            img.read_page_at(vda, 0, &mut buf);
            let lp = Leader::from_bytes(&buf).expect("bad leader");
            if pack::filename_to_string(&lp.filename) == "DiskDescriptor" {
                dd_data = altofs::bios::rda_to_vda(l.next_rda());
                break;
            }
        }
    }
    assert!(dd_data != 0);
    let word_offset = 32 + 2 * (victim / 16);
    assert!(word_offset + 1 < PAGESZ, "victim bit should land in the first page");
    let raw = img.data_raw_mut(dd_data);
    let mut w = u16::from_le_bytes([raw[word_offset], raw[word_offset + 1]]);
    w &= !(1 << (15 - victim % 16));
    raw[word_offset..word_offset + 2].copy_from_slice(&u16::to_le_bytes(w));

    let disk = Disk::from_img(img).expect("mount failed");
    assert!(disk.repaired());
    assert!(disk.check_consistency());
    assert_eq!(disk.find("Hurt").expect("lost file").size, 700);
    assert_invariants(&disk);
}

#[test]
fn create_write_unlink_cycle() {
    let img = build_volume(&[], 0);
    let mut disk = Disk::from_img(img).expect("mount failed");
    let free0 = disk.free_pages();
    disk.create_file("/memo.txt").expect("create failed");
    match disk.create_file("/memo.txt") {
        Err(Error::FileExists) => {}
        _ => panic!("duplicate create should be refused"),
    }
    let info = disk.find("memo.txt").expect("lost file");
    assert_eq!(info.size, 0);
    assert_eq!(disk.free_pages(), free0 - 2);
    let leader = info.leader_vda;
    // write and read back across a page boundary
    let dat: Vec<u8> = (0..1500u32).map(|i| (i % 241) as u8).collect();
    let n = disk.write_file(leader, &dat, 0, true).expect("write failed");
    assert_eq!(n, 1500);
    let mut buf = vec![0; 1500];
    let n = disk.read_file(leader, &mut buf, 0, true).expect("read failed");
    assert_eq!(n, 1500);
    assert_eq!(buf, dat);
    assert_invariants(&disk);
    // unlink returns every page and tombstones the record
    disk.unlink_file("/memo.txt").expect("unlink failed");
    assert!(disk.find("memo.txt").is_none());
    assert_eq!(disk.free_pages(), free0);
    match disk.unlink_file("/memo.txt") {
        Err(Error::FileNotFound) => {}
        _ => panic!("second unlink should fail"),
    }
    assert_invariants(&disk);
    // a new file reuses the freed pages and the tombstone
    disk.create_file("/memo.txt").expect("create failed");
    assert_eq!(disk.free_pages(), free0 - 2);
    assert_invariants(&disk);
}

#[test]
fn volume_fills_up() {
    // leave only a few free pages; a large write is partial, not fatal
    let content = vec![3u8; 300];
    let img = build_volume(&[("tight", content.clone())], NPAGES - 12);
    let mut disk = Disk::from_img(img).expect("mount failed");
    let free0 = disk.free_pages();
    assert!(free0 < 6, "filler should leave only a few pages, got {}", free0);
    let leader = leader_of(&disk, "tight");
    let big = vec![0xaau8; 10 * PAGESZ];
    let n = disk.write_file(leader, &big, 300, true).expect("write failed");
    assert!(n < big.len(), "write should have been partial");
    assert_eq!(disk.free_pages(), 0);
    // the file keeps what was written
    let written = disk.find("tight").expect("lost file").size;
    assert_eq!(written, 300 + n);
    match disk.truncate_file("/tight", 20 * PAGESZ) {
        Err(Error::DiskFull) => {}
        _ => panic!("extension should run out of space"),
    }
    // creating a file needs two pages
    match disk.create_file("/toobig") {
        Err(Error::DiskFull) => {}
        _ => panic!("create should run out of space"),
    }
}

#[test]
fn set_times_updates_leader() {
    let img = build_volume(&[("Stamp", vec![0u8; 10])], 0);
    let mut disk = Disk::from_img(img).expect("mount failed");
    let leader = leader_of(&disk, "Stamp");
    disk.set_times("/Stamp", 1_100_000_000, 1_200_000_000).expect("set_times failed");
    let info = disk.find("Stamp").expect("lost file");
    assert_eq!(info.atime, 1_100_000_000);
    assert_eq!(info.mtime, 1_200_000_000);
    assert_eq!(info.ctime, BUILD_TIME);
    let lp = disk.page_leader(leader);
    use altofs::fs::alto::types::altotime_to_unix;
    assert_eq!(altotime_to_unix(lp.read()), 1_100_000_000);
    assert_eq!(altotime_to_unix(lp.written()), 1_200_000_000);
}

#[test]
fn sysdir_round_trip_after_mutations() {
    // the directory survives serialization: mutate, flush, remount the
    // same bytes, and everything is still there
    let img = build_volume(&[("alpha", vec![1u8; 40]), ("omega", vec![2u8; 40])], 0);
    let mut disk = Disk::from_img(img).expect("mount failed");
    disk.create_file("/middle").expect("create failed");
    disk.unlink_file("/alpha").expect("unlink failed");
    disk.rename_file("/omega", "/beta").expect("rename failed");
    disk.flush().expect("flush failed");
    let img2 = DiabloImage::from_bytes(&disk.to_img()).expect("bad image");
    drop(disk);
    let disk2 = Disk::from_img(img2).expect("remount failed");
    assert!(!disk2.repaired());
    assert!(disk2.find("middle").is_some());
    assert!(disk2.find("beta").is_some());
    assert!(disk2.find("alpha").is_none());
    assert!(disk2.find("omega").is_none());
    assert_invariants(&disk2);
}
