//! ### Filename and byte-stream packing
//!
//! Alto filenames are Pascal strings: a length byte, the characters, and
//! a mandatory trailing dot.  The strings handed around the crate never
//! carry the dot.  These helpers convert between the two forms and do
//! the byte-pair swap that separates the raw word order of the image
//! from the character stream.

use log::warn;
use regex::Regex;
use super::types::{FNLEN, MAX_NAME};

/// Test a string for validity as an Alto filename (without trailing dot).
/// This can be used to check names before passing to functions that may panic.
pub fn is_name_valid(s: &str) -> bool {
    let fname_patt = Regex::new(r"^[ -~]{1,37}$").expect("unreachable");
    fname_patt.is_match(s) && !s.contains('/') && s.len() <= MAX_NAME
}

/// Convert an on-disk filename field to a string.  Will not panic: bad
/// lengths are clamped, non-printing characters come out as `#`, and a
/// missing trailing dot is reported but accepted.
pub fn filename_to_string(field: &[u8]) -> String {
    let mut length = field[0] as usize;
    if length == 0 {
        return String::new();
    }
    if length >= FNLEN {
        length = FNLEN - 1;
    }
    let mut chars: Vec<u8> = field[1..1 + length]
        .iter()
        .map(|b| match *b {
            x if x >= 0x20 && x < 0x7f => x,
            _ => b'#',
        })
        .collect();
    if chars[length - 1] == b'.' {
        chars.pop();
    } else {
        warn!(
            "no dot at end of filename ({})",
            String::from_utf8_lossy(&chars)
        );
    }
    String::from_utf8(chars).expect("unreachable")
}

/// Write a string into an on-disk filename field, appending the dot.
/// The caller must validate with `is_name_valid` first; an over-long
/// name panics.
pub fn string_to_filename(field: &mut [u8], s: &str) {
    let length = s.len() + 1;
    if length > FNLEN - 2 {
        panic!("attempt to encode a bad file name");
    }
    field[0] = length as u8;
    field[1..s.len() + 1].copy_from_slice(s.as_bytes());
    field[s.len() + 1] = b'.';
    for i in length + 1..field.len() {
        field[i] = 0;
    }
}

/// Swap the bytes of each word in place, converting between raw word
/// order and character stream order.  The length must be even.
pub fn swab(data: &mut [u8]) {
    if data.len() % 2 != 0 {
        panic!("byte swap called with unaligned size ({})", data.len());
    }
    for pair in data.chunks_exact_mut(2) {
        pair.swap(0, 1);
    }
}

#[test]
fn filename_round_trip() {
    let mut field = [0u8; FNLEN];
    for name in ["SysDir", "a", "Memo.txt", "Bravo1"] {
        string_to_filename(&mut field, name);
        assert_eq!(filename_to_string(&field), name);
    }
}

#[test]
fn filename_oddities() {
    let mut field = [0u8; FNLEN];
    string_to_filename(&mut field, "Hello");
    assert_eq!(field[0], 6); // length includes the dot
    assert_eq!(field[6], b'.');
    // control character comes out escaped
    field[2] = 0x07;
    assert_eq!(filename_to_string(&field), "H#llo");
    // empty field
    assert_eq!(filename_to_string(&[0u8; FNLEN]), "");
}

#[test]
fn name_validity() {
    assert!(is_name_valid("SysDir"));
    assert!(is_name_valid("a file with spaces"));
    assert!(!is_name_valid(""));
    assert!(!is_name_valid("a/b"));
    assert!(!is_name_valid(&"x".repeat(MAX_NAME + 1)));
}

#[test]
fn pair_swap() {
    let mut buf = [1u8, 2, 3, 4];
    swab(&mut buf);
    assert_eq!(buf, [2, 1, 4, 3]);
    swab(&mut buf);
    assert_eq!(buf, [1, 2, 3, 4]);
}
