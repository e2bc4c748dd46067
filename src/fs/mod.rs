//! # File System Module
//!
//! This is a container for file system modules.  File system modules
//! handle interactions with directories and files; they retain their own
//! typed view of the disk data and explicitly write changes back to the
//! underlying image.

pub mod alto;
