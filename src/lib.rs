//! # `altofs` main library
//!
//! This library gives read/write access to Xerox Alto file systems as
//! preserved in Diablo disk image files.
//!
//! ## Architecture
//!
//! Disk operations are built around three layers:
//! * `bios` maps between linear page indices and raw Diablo disk addresses
//! * `img::diablo::DiabloImage` owns the raw bytes of one or two loaded
//!   disk units, does not try to interpret a file system
//! * `fs::alto::Disk` imposes the Alto file system on the image
//!
//! When a `Disk` is created it takes ownership of a `DiabloImage`,
//! validates the volume structures (repairing them when the on-disk view
//! is inconsistent), and serves all file operations from memory.  Any
//! changes are not permanent until the image is saved to whatever file
//! system is hosting `altofs`; saving targets `<name>~` backup files.
//!
//! A mount host adapts `Disk` to a kernel filesystem interface by
//! wrapping it in a lock and translating `fs::alto::types::Error` via
//! its `errno` method.

pub mod bios;
pub mod fs;
pub mod img;
pub mod commands;

use log::info;

type DYNERR = Box<dyn std::error::Error>;
type STDRESULT = Result<(), Box<dyn std::error::Error>>;

/// Given an image specification `name0[,name1]`, load the image(s) and
/// return the file system living on them.  A name ending in `.Z` is
/// read through an external `zcat` process.
pub fn create_fs_from_file(img_spec: &str) -> Result<fs::alto::Disk, DYNERR> {
    let img = img::diablo::DiabloImage::from_spec(img_spec)?;
    info!("loaded {} unit(s) from `{}`", img.units(), img_spec);
    fs::alto::Disk::from_img(img)
}
