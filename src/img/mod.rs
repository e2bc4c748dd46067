//! # Disk Image Module
//!
//! This is a container for disk image modules.  The image module owns the
//! raw bytes of a loaded disk image and serves them to the file system
//! layer as typed page regions; it knows nothing about the file system
//! living on top.

pub mod diablo;

/// Enumerates disk image errors.  The `Display` trait will print the equivalent long message.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("image size did not match the request")]
    ImageSizeMismatch,
    #[error("image specification could not be parsed")]
    ImageSpecMismatch,
    #[error("decompressor failed")]
    Decompressor,
    #[error("image has no backing file")]
    NoBackingFile,
}
