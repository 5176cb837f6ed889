//! Byte-size parsing and formatting
//!
//! Suffixes are decimal (`k` = 1000). A trailing `b` means bits, `B` or no
//! suffix means bytes: `20M` = 20_000_000, `8kb` = 1_000.

use crate::{Error, Result};

/// Parse a memory size such as `512`, `20M`, `2GB` or `64Mb` into bytes
pub fn parse_size(input: &str) -> Result<u64> {
    let s = input.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);

    if number.is_empty() {
        return Err(invalid(input));
    }
    let number: u64 = number.parse().map_err(|_| invalid(input))?;

    let mut chars = suffix.chars();
    let multiplier = match chars.next() {
        None | Some('B') => 1,
        Some('b') => return finish(number, 1, true, chars.next(), input),
        Some(c) => {
            let multiplier = match c.to_ascii_lowercase() {
                'k' => 1_000,
                'm' => 1_000_000,
                'g' => 1_000_000_000,
                't' => 1_000_000_000_000,
                _ => return Err(invalid(input)),
            };
            match chars.next() {
                None | Some('B') => multiplier,
                Some('b') => return finish(number, multiplier, true, chars.next(), input),
                Some(_) => return Err(invalid(input)),
            }
        }
    };
    if chars.next().is_some() {
        return Err(invalid(input));
    }
    finish(number, multiplier, false, None, input)
}

fn finish(number: u64, multiplier: u64, bits: bool, rest: Option<char>, input: &str) -> Result<u64> {
    if rest.is_some() {
        return Err(invalid(input));
    }
    let bytes = number
        .checked_mul(multiplier)
        .ok_or_else(|| Error::Validation(format!("memory size `{}` is too large", input)))?;
    Ok(if bits { bytes / 8 } else { bytes })
}

fn invalid(input: &str) -> Error {
    Error::Validation(format!("invalid memory size `{}`", input))
}

/// Human-readable decimal size
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1000;
    const MB: u64 = KB * 1000;
    const GB: u64 = MB * 1000;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
