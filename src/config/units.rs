//! Shared grammar for duration and byte-size expressions used by the CLI.

use crate::error::Error;
use anyhow::Result;
use std::time::Duration;

/// Parse a duration expression like `7d`, `1h30m` or `90s`.
///
/// Accepted suffixes: `s` (seconds), `m` (minutes), `h` (hours), `d` (days),
/// `w` (weeks), `y` (years). Multiple terms may be concatenated and are
/// summed. Unknown units or trailing garbage are rejected.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return Err(Error::Config("empty duration expression".to_string()).into());
    }

    let mut total: u64 = 0;
    let mut digits = String::new();
    let mut matched_any = false;

    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }

        if digits.is_empty() {
            return Err(Error::Config(format!(
                "invalid duration `{input}`: unit `{c}` has no value"
            ))
            .into());
        }

        let value: u64 = digits
            .parse()
            .map_err(|_| Error::Config(format!("invalid duration `{input}`")))?;
        digits.clear();

        let seconds = match c {
            's' => 1,
            'm' => 60,
            'h' => 60 * 60,
            'd' => 60 * 60 * 24,
            'w' => 60 * 60 * 24 * 7,
            'y' => 60 * 60 * 24 * 365,
            other => {
                return Err(Error::Config(format!(
                    "invalid duration `{input}`: unknown unit `{other}`"
                ))
                .into())
            }
        };

        total = total.saturating_add(value.saturating_mul(seconds));
        matched_any = true;
    }

    if !digits.is_empty() {
        return Err(Error::Config(format!(
            "invalid duration `{input}`: value `{digits}` has no unit"
        ))
        .into());
    }
    if !matched_any {
        return Err(Error::Config(format!("invalid duration `{input}`")).into());
    }

    Ok(Duration::from_secs(total))
}

const SIZE_SUFFIXES: [(&str, u64); 5] = [
    ("TiB", 1 << 40),
    ("GiB", 1 << 30),
    ("MiB", 1 << 20),
    ("KiB", 1 << 10),
    ("B", 1),
];

/// Parse a byte-size expression like `512MiB` or `64KiB` into bytes.
pub fn parse_size(input: &str) -> Result<u64> {
    let s = input.trim();

    for (suffix, multiplier) in SIZE_SUFFIXES {
        if let Some(value) = s.strip_suffix(suffix) {
            let value = value.trim();
            let value: f64 = value
                .parse()
                .map_err(|_| Error::Config(format!("invalid size `{input}`")))?;
            if value < 0.0 {
                return Err(Error::Config(format!("invalid size `{input}`")).into());
            }
            return Ok((value * multiplier as f64) as u64);
        }
    }

    // A bare number is taken as bytes.
    s.parse::<u64>()
        .map_err(|_| Error::Config(format!("invalid size `{input}`: unknown unit")).into())
}

/// Format a byte count with ISO/IEC 80000 binary prefixes, e.g. `512.0MiB`.
pub fn human_readable_size(bytes: u64) -> String {
    let mut value = bytes as f64;
    for unit in ["B", "KiB", "MiB", "GiB", "TiB", "PiB"] {
        if value.abs() < 1024.0 {
            return format!("{value:.1}{unit}");
        }
        value /= 1024.0;
    }
    format!("{value:.1}EiB")
}
