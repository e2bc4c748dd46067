//! ## Support for Diablo disk images (DSK)
//!
//! A Diablo image is a sequential dump of 4872 page records in VDA
//! order.  Each record carries the software page number, the two header
//! words, the eight label words, and 256 data words, 534 bytes in all.
//! Every word is stored low byte first; the character stream of file
//! data is the byte-pair swap of the raw bytes.  A file system mounting
//! two units supplies two image files, the second covering VDAs
//! `NPAGES..2*NPAGES`.
//!
//! A name ending in `.Z` is read through an external `zcat` process.
//! Saving always targets `<name>~` with any `.Z` suffix stripped, and
//! never recompresses.

use std::process::Command;
use log::{info, error};
use crate::bios::NPAGES;
use crate::img;
use crate::{DYNERR, STDRESULT};

/// bytes in one on-disk page record
pub const RECORD_SIZE: usize = 534;
/// bytes in the data region of a page
pub const DATA_SIZE: usize = 512;
/// bytes in one image unit
pub const UNIT_SIZE: usize = NPAGES * RECORD_SIZE;

const HEADER_OFFSET: usize = 2;
const LABEL_OFFSET: usize = 6;
const DATA_OFFSET: usize = 22;

/// Wrapper for the in-memory image of one or two Diablo units.
pub struct DiabloImage {
    unit_names: Vec<String>,
    data: Vec<u8>,
}

fn read_unit(name: &str) -> Result<Vec<u8>, DYNERR> {
    info!("reading disk image `{}`", name);
    let dat = match name.ends_with(".Z") {
        true => {
            let output = Command::new("zcat").arg(name).output()?;
            if !output.status.success() {
                error!("zcat failed on `{}`", name);
                return Err(Box::new(img::Error::Decompressor));
            }
            output.stdout
        }
        false => std::fs::read(name)?,
    };
    if dat.len() != UNIT_SIZE {
        error!("image `{}` is {} bytes, expected {}", name, dat.len(), UNIT_SIZE);
        return Err(Box::new(img::Error::ImageSizeMismatch));
    }
    Ok(dat)
}

/// target for saving: strip any `.Z` and append the backup marker
fn backup_name(name: &str) -> String {
    match name.strip_suffix(".Z") {
        Some(stripped) => stripped.to_string() + "~",
        None => name.to_string() + "~",
    }
}

impl DiabloImage {
    /// Load from a comma separated specification `name0[,name1]`.
    pub fn from_spec(spec: &str) -> Result<Self, DYNERR> {
        let names: Vec<&str> = spec.split(',').collect();
        if names.len() < 1 || names.len() > 2 || names.iter().any(|n| n.is_empty()) {
            error!("bad image specification `{}`", spec);
            return Err(Box::new(img::Error::ImageSpecMismatch));
        }
        let mut data = Vec::new();
        for name in &names {
            data.append(&mut read_unit(name)?);
        }
        Ok(Self {
            unit_names: names.iter().map(|n| n.to_string()).collect(),
            data,
        })
    }
    /// Wrap an image already in memory; it will have no backing file.
    pub fn from_bytes(dat: &[u8]) -> Option<Self> {
        if dat.len() != UNIT_SIZE && dat.len() != 2 * UNIT_SIZE {
            return None;
        }
        Some(Self {
            unit_names: Vec::new(),
            data: dat.to_vec(),
        })
    }
    pub fn to_bytes(&self) -> Vec<u8> {
        self.data.clone()
    }
    pub fn units(&self) -> usize {
        self.data.len() / UNIT_SIZE
    }
    pub fn page_count(&self) -> usize {
        self.units() * NPAGES
    }
    pub fn has_backing(&self) -> bool {
        !self.unit_names.is_empty()
    }
    /// Write every unit back to its backup file.
    pub fn save(&self) -> STDRESULT {
        if !self.has_backing() {
            return Err(Box::new(img::Error::NoBackingFile));
        }
        for (unit, name) in self.unit_names.iter().enumerate() {
            let target = backup_name(name);
            info!("writing disk image `{}`", target);
            std::fs::write(&target, &self.data[unit * UNIT_SIZE..(unit + 1) * UNIT_SIZE])?;
        }
        Ok(())
    }
    fn record(&self, vda: usize) -> &[u8] {
        &self.data[vda * RECORD_SIZE..(vda + 1) * RECORD_SIZE]
    }
    /// software page number stored with the record
    pub fn pagenum(&self, vda: usize) -> u16 {
        let rec = self.record(vda);
        u16::from_le_bytes([rec[0], rec[1]])
    }
    pub fn header(&self, vda: usize) -> &[u8] {
        &self.record(vda)[HEADER_OFFSET..LABEL_OFFSET]
    }
    /// the 16 label bytes in raw order
    pub fn label(&self, vda: usize) -> &[u8] {
        &self.record(vda)[LABEL_OFFSET..DATA_OFFSET]
    }
    pub fn label_mut(&mut self, vda: usize) -> &mut [u8] {
        let offset = vda * RECORD_SIZE + LABEL_OFFSET;
        &mut self.data[offset..offset + 16]
    }
    /// the 512 data bytes in raw order
    pub fn data_raw(&self, vda: usize) -> &[u8] {
        &self.record(vda)[DATA_OFFSET..RECORD_SIZE]
    }
    pub fn data_raw_mut(&mut self, vda: usize) -> &mut [u8] {
        let offset = vda * RECORD_SIZE + DATA_OFFSET;
        &mut self.data[offset..offset + DATA_SIZE]
    }
    /// read a raw word from the data region
    pub fn data_word(&self, vda: usize, widx: usize) -> u16 {
        let dat = self.data_raw(vda);
        u16::from_le_bytes([dat[2 * widx], dat[2 * widx + 1]])
    }
    /// write a raw word into the data region
    pub fn set_data_word(&mut self, vda: usize, widx: usize, w: u16) {
        let dat = self.data_raw_mut(vda);
        dat[2 * widx..2 * widx + 2].copy_from_slice(&u16::to_le_bytes(w));
    }
    /// Copy out of the data region in character stream order, starting
    /// at stream offset `offset` within the page.
    pub fn read_page_at(&self, vda: usize, offset: usize, buf: &mut [u8]) {
        let dat = self.data_raw(vda);
        for i in 0..buf.len() {
            buf[i] = dat[(offset + i) ^ 1];
        }
    }
    /// Copy into the data region in character stream order.
    pub fn write_page_at(&mut self, vda: usize, offset: usize, buf: &[u8]) {
        let dat = self.data_raw_mut(vda);
        for i in 0..buf.len() {
            dat[(offset + i) ^ 1] = buf[i];
        }
    }
    pub fn zero_page(&mut self, vda: usize) {
        self.data_raw_mut(vda).fill(0);
    }
}

#[test]
fn stream_order() {
    let mut img = DiabloImage::from_bytes(&vec![0; UNIT_SIZE]).expect("bad unit size");
    img.write_page_at(5, 0, "AB".as_bytes());
    // the first character lands in the high half of the first word
    assert_eq!(img.data_raw(5)[0..2], [b'B', b'A']);
    assert_eq!(img.data_word(5, 0), 0x4142);
    let mut back = [0u8; 2];
    img.read_page_at(5, 0, &mut back);
    assert_eq!(&back, "AB".as_bytes());
}

#[test]
fn unit_sizes() {
    assert_eq!(UNIT_SIZE, 2_601_648);
    assert!(DiabloImage::from_bytes(&vec![0; 100]).is_none());
    let double = DiabloImage::from_bytes(&vec![0; 2 * UNIT_SIZE]).expect("bad unit size");
    assert_eq!(double.units(), 2);
    assert_eq!(double.page_count(), 2 * NPAGES);
}

#[test]
fn backup_names() {
    assert_eq!(backup_name("alto.dsk"), "alto.dsk~");
    assert_eq!(backup_name("alto.dsk.Z"), "alto.dsk~");
}
