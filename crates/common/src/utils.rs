//! Utility functions for the LLM loader

use std::time::{Duration, Instant};
use bytesize::ByteSize;
use crate::error::{Error, Result};

/// Bytes in one mebibyte
pub const MIB: u64 = 1024 * 1024;

/// Bytes in one gibibyte
pub const GIB: u64 = 1024 * MIB;

/// Formats a byte size into a human-readable string
///
/// # Examples
///
/// ```
/// use common::utils::format_bytes;
///
/// assert_eq!(format_bytes(0), "0 B");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    ByteSize::b(bytes).to_string_as(true)
}

/// Parses a binary-unit memory string such as `"9500MiB"` or `"10 GiB"`
/// into bytes. Only `B`, `KiB`, `MiB`, `GiB` and `TiB` are accepted.
///
/// # Examples
///
/// ```
/// use common::utils::{parse_binary_size, GIB};
///
/// assert_eq!(parse_binary_size("2GiB").unwrap(), 2 * GIB);
/// assert!(parse_binary_size("2GB").is_err());
/// ```
pub fn parse_binary_size(text: &str) -> Result<u64> {
    let trimmed = text.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);

    let value: f64 = number
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("Invalid memory size: {}", text)))?;

    let multiplier = match unit.trim().to_lowercase().as_str() {
        "" | "b" => 1,
        "kib" => 1024,
        "mib" => MIB,
        "gib" => GIB,
        "tib" => 1024 * GIB,
        other => {
            return Err(Error::InvalidArgument(format!(
                "Unsupported memory unit '{}' in '{}'",
                other, text
            )))
        }
    };

    Ok((value * multiplier as f64) as u64)
}

/// Measures the execution time of a function
///
/// # Examples
///
/// ```
/// use common::utils::measure_execution_time;
///
/// let (value, elapsed) = measure_execution_time(|| Ok::<_, common::Error>(42)).unwrap();
/// assert_eq!(value, 42);
/// assert!(elapsed.as_secs() < 1);
/// ```
pub fn measure_execution_time<T, E, F>(f: F) -> std::result::Result<(T, Duration), E>
where
    F: FnOnce() -> std::result::Result<T, E>,
{
    let start = Instant::now();
    let result = f()?;
    Ok((result, start.elapsed()))
}
