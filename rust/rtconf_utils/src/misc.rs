// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use anyhow::bail;
use anyhow::Result;
use std::path::Path;

/// Read a file and parse its content into the specified type.
///
/// Trims null and whitespace before parsing.
///
/// # Errors
/// Returns an error if reading or parsing fails.
pub fn read_from_file<T>(path: &Path) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let val = read_file_string(path)?;

    match val.parse::<T>() {
        Ok(parsed) => Ok(parsed),
        Err(_) => {
            bail!("Failed to parse content '{}' from {:?}", val, path);
        }
    }
}

/// Read a sysfs/procfs attribute with trailing nulls and whitespace removed.
pub fn read_file_string(path: &Path) -> Result<String> {
    let val = match std::fs::read_to_string(path) {
        Ok(val) => val,
        Err(_) => {
            bail!("Failed to open or read file {:?}", path);
        }
    };
    Ok(val.trim_end_matches('\0').trim().to_string())
}

/// Parse a hexadecimal attribute such as a PCI `vendor` file ("0x8086").
pub fn read_file_hex(path: &Path) -> Result<u32> {
    let val = read_file_string(path)?;
    let digits = val.strip_prefix("0x").unwrap_or(&val);
    match u32::from_str_radix(digits, 16) {
        Ok(v) => Ok(v),
        Err(_) => bail!("Failed to parse hex '{}' from {:?}", val, path),
    }
}
