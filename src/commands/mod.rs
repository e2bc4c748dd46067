//! # CLI Subcommands
//!
//! Contains the functions that run the subcommands.  Each one loads the
//! file system, drives the public facade the way a mount host would, and
//! saves the image when it mutated anything.

use std::io::{Read, Write};
use colored::*;
use crate::fs::alto::types::{altotime_to_string, unix_to_altotime};
use crate::fs::alto::pack;
use crate::STDRESULT;

#[derive(thiserror::Error, Debug)]
pub enum CommandError {
    #[error("Command could not be interpreted")]
    InvalidCommand,
    #[error("One of the parameters was out of range")]
    OutOfRange,
}

/// List the files on the volume with size, pages, and creation time.
pub fn catalog(img_spec: &str) -> STDRESULT {
    let disk = crate::create_fs_from_file(img_spec)?;
    println!();
    println!(
        " {:38} {:>8} {:>6}  {:19}",
        "NAME".bold(),
        "BYTES".bold(),
        "PAGES".bold(),
        "CREATED".bold()
    );
    println!();
    let mut count = 0;
    for info in disk.file_infos() {
        if info.deleted {
            continue;
        }
        println!(
            " {:38} {:>8} {:>6}  {}",
            info.name.bright_blue(),
            info.size,
            info.blocks,
            altotime_to_string(unix_to_altotime(info.ctime))
        );
        count += 1;
    }
    println!();
    let stat = disk.statfs()?;
    println!(
        "{} files, {} pages free of {}",
        count, stat.bfree, stat.blocks
    );
    println!();
    Ok(())
}

/// Copy a file out of the volume to stdout.
pub fn get(img_spec: &str, file: &str) -> STDRESULT {
    let mut disk = crate::create_fs_from_file(img_spec)?;
    let (leader_vda, size) = match disk.find(file) {
        Some(info) => (info.leader_vda, info.size),
        None => return Err(Box::new(crate::fs::alto::types::Error::FileNotFound)),
    };
    let mut buf = vec![0; size];
    disk.read_file(leader_vda, &mut buf, 0, false)?;
    std::io::stdout().write_all(&buf)?;
    Ok(())
}

/// Copy stdin into a file on the volume, creating it if necessary, and
/// save the image.
pub fn put(img_spec: &str, file: &str) -> STDRESULT {
    let mut dat = Vec::new();
    std::io::stdin().read_to_end(&mut dat)?;
    let mut disk = crate::create_fs_from_file(img_spec)?;
    if disk.find(file).is_none() {
        disk.create_file(file)?;
    }
    disk.truncate_file(file, 0)?;
    let leader_vda = disk.find(file).expect("file vanished").leader_vda;
    let written = disk.write_file(leader_vda, &dat, 0, true)?;
    if written != dat.len() {
        return Err(Box::new(crate::fs::alto::types::Error::DiskFull));
    }
    disk.save()
}

pub fn create(img_spec: &str, file: &str) -> STDRESULT {
    let mut disk = crate::create_fs_from_file(img_spec)?;
    disk.create_file(file)?;
    disk.save()
}

pub fn delete(img_spec: &str, file: &str) -> STDRESULT {
    let mut disk = crate::create_fs_from_file(img_spec)?;
    disk.unlink_file(file)?;
    disk.save()
}

pub fn rename(img_spec: &str, file: &str, newname: &str) -> STDRESULT {
    let mut disk = crate::create_fs_from_file(img_spec)?;
    disk.rename_file(file, newname)?;
    disk.save()
}

pub fn truncate(img_spec: &str, file: &str, size: usize) -> STDRESULT {
    let mut disk = crate::create_fs_from_file(img_spec)?;
    disk.truncate_file(file, size)?;
    disk.save()
}

/// Load the volume, reporting whether the descriptor had to be rebuilt,
/// and save the repaired image if it was.
pub fn verify(img_spec: &str) -> STDRESULT {
    let mut disk = crate::create_fs_from_file(img_spec)?;
    match disk.repaired() {
        true => {
            println!("descriptor was inconsistent and has been rebuilt");
            disk.save()?;
        }
        false => println!("volume is consistent"),
    }
    match disk.check_consistency() {
        true => Ok(()),
        false => Err(Box::new(crate::fs::alto::types::Error::Inconsistent)),
    }
}

/// Print the statvfs-like volume summary.
pub fn stat(img_spec: &str) -> STDRESULT {
    let disk = crate::create_fs_from_file(img_spec)?;
    let stat = disk.statfs()?;
    println!("block size:     {}", stat.bsize);
    println!("blocks:         {}", stat.blocks);
    println!("blocks free:    {}", stat.bfree);
    println!("files:          {}", stat.files);
    println!("files free:     {}", stat.ffree);
    println!("fsid:           {}", stat.fsid);
    println!("name max:       {}", stat.namemax);
    Ok(())
}

/// Hex dump of one page's data region, words and ASCII.
pub fn dump(img_spec: &str, page: usize) -> STDRESULT {
    let disk = crate::create_fs_from_file(img_spec)?;
    if page >= disk.page_count() {
        return Err(Box::new(CommandError::OutOfRange));
    }
    let mut raw = disk.page_data_raw(page);
    pack::swab(&mut raw);
    display_stream(&raw);
    Ok(())
}

/// Display a character stream as rows of words and ASCII.
fn display_stream(stream: &[u8]) {
    let nwords = stream.len() / 2;
    for row in 0..(nwords + 7) / 8 {
        print!("{:04x}:", row * 8);
        let mut txt = String::new();
        for col in 0..8 {
            let offs = row * 8 + col;
            if offs < nwords {
                print!(" {:02x}{:02x}", stream[2 * offs], stream[2 * offs + 1]);
                for b in [stream[2 * offs], stream[2 * offs + 1]] {
                    txt.push(match b {
                        x if x >= 0x20 && x < 0x7f => x as char,
                        _ => '.',
                    });
                }
            } else {
                print!("     ");
                txt.push_str("  ");
            }
        }
        println!("  {}", txt);
    }
}
