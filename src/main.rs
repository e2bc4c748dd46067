//! # Command Line Interface
//!
//! Thin front end over the `commands` module.  Set the RUST_LOG
//! environment variable to control logging level.

use clap::{arg, Command};
use std::str::FromStr;
use altofs::commands;

const RCH: &str = "unreachable was reached";

fn main() {
    env_logger::init();
    let long_help = "altofs reads and writes Xerox Alto file systems in Diablo disk images.
A volume is one image file, or two comma-separated image files for a
double disk system.  A name ending in .Z is read through zcat.  Saving
always writes to <name>~ backup files.
Set RUST_LOG environment variable to control logging level.
  levels: trace,debug,info,warn,error

Examples:
---------
list files:          `altofs catalog -d allgames.dsk`
extract a file:      `altofs get -f copydisk.run -d allgames.dsk > copydisk.run`
store a file:        `altofs put -f memo.txt -d allgames.dsk < memo.txt`
check consistency:   `altofs verify -d dp0.dsk,dp1.dsk`";

    let matches = Command::new("altofs")
        .about("Manipulates Xerox Alto files and Diablo disk images.")
        .after_long_help(long_help)
        .subcommand_required(true)
        .subcommand(Command::new("catalog")
            .arg(arg!(-d --dimg <PATH> "path to disk image(s)"))
            .visible_alias("ls")
            .about("list the files on a volume"))
        .subcommand(Command::new("get")
            .arg(arg!(-f --file <NAME> "file on the volume"))
            .arg(arg!(-d --dimg <PATH> "path to disk image(s)"))
            .about("write a file from the volume to stdout"))
        .subcommand(Command::new("put")
            .arg(arg!(-f --file <NAME> "file on the volume"))
            .arg(arg!(-d --dimg <PATH> "path to disk image(s)"))
            .about("write stdin to a file on the volume"))
        .subcommand(Command::new("create")
            .arg(arg!(-f --file <NAME> "file on the volume"))
            .arg(arg!(-d --dimg <PATH> "path to disk image(s)"))
            .about("create an empty file on the volume"))
        .subcommand(Command::new("delete")
            .arg(arg!(-f --file <NAME> "file on the volume"))
            .arg(arg!(-d --dimg <PATH> "path to disk image(s)"))
            .visible_alias("del")
            .about("delete a file on the volume"))
        .subcommand(Command::new("rename")
            .arg(arg!(-f --file <NAME> "file on the volume"))
            .arg(arg!(-n --name <NAME> "new name"))
            .arg(arg!(-d --dimg <PATH> "path to disk image(s)"))
            .about("rename a file on the volume"))
        .subcommand(Command::new("truncate")
            .arg(arg!(-f --file <NAME> "file on the volume"))
            .arg(arg!(-s --size <BYTES> "new size"))
            .arg(arg!(-d --dimg <PATH> "path to disk image(s)"))
            .about("truncate or extend a file on the volume"))
        .subcommand(Command::new("verify")
            .arg(arg!(-d --dimg <PATH> "path to disk image(s)"))
            .about("validate the volume, rebuilding the descriptor if needed"))
        .subcommand(Command::new("stat")
            .arg(arg!(-d --dimg <PATH> "path to disk image(s)"))
            .about("show the volume statistics"))
        .subcommand(Command::new("dump")
            .arg(arg!(-p --page <VDA> "page number"))
            .arg(arg!(-d --dimg <PATH> "path to disk image(s)"))
            .about("hex dump the data region of a page"))
        .get_matches();

    let result = match matches.subcommand() {
        Some(("catalog", cmd)) => {
            commands::catalog(cmd.get_one::<String>("dimg").expect(RCH))
        }
        Some(("get", cmd)) => commands::get(
            cmd.get_one::<String>("dimg").expect(RCH),
            cmd.get_one::<String>("file").expect(RCH),
        ),
        Some(("put", cmd)) => commands::put(
            cmd.get_one::<String>("dimg").expect(RCH),
            cmd.get_one::<String>("file").expect(RCH),
        ),
        Some(("create", cmd)) => commands::create(
            cmd.get_one::<String>("dimg").expect(RCH),
            cmd.get_one::<String>("file").expect(RCH),
        ),
        Some(("delete", cmd)) => commands::delete(
            cmd.get_one::<String>("dimg").expect(RCH),
            cmd.get_one::<String>("file").expect(RCH),
        ),
        Some(("rename", cmd)) => commands::rename(
            cmd.get_one::<String>("dimg").expect(RCH),
            cmd.get_one::<String>("file").expect(RCH),
            cmd.get_one::<String>("name").expect(RCH),
        ),
        Some(("truncate", cmd)) => {
            match usize::from_str(cmd.get_one::<String>("size").expect(RCH)) {
                Ok(size) => commands::truncate(
                    cmd.get_one::<String>("dimg").expect(RCH),
                    cmd.get_one::<String>("file").expect(RCH),
                    size,
                ),
                Err(e) => Err(Box::new(e) as Box<dyn std::error::Error>),
            }
        }
        Some(("verify", cmd)) => {
            commands::verify(cmd.get_one::<String>("dimg").expect(RCH))
        }
        Some(("stat", cmd)) => commands::stat(cmd.get_one::<String>("dimg").expect(RCH)),
        Some(("dump", cmd)) => {
            match usize::from_str(cmd.get_one::<String>("page").expect(RCH)) {
                Ok(page) => commands::dump(cmd.get_one::<String>("dimg").expect(RCH), page),
                Err(e) => Err(Box::new(e) as Box<dyn std::error::Error>),
            }
        }
        _ => panic!("{}", RCH),
    };
    if let Err(e) = result {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
