//! Size conversions for hypervisor command arguments. Sizes are carried in MB internally.

use crate::{ControlError, Result};
use byte_unit::Byte;

/// `limits.memory` style value: `<N>MiB`.
pub fn memory_arg(memory_mb: i64) -> String {
    format!("{}MiB", memory_mb.max(1))
}

/// Root disk size: whole gigabytes render as `<N>GiB`, anything else as `<N>MiB`.
pub fn disk_arg(disk_mb: i64) -> String {
    let mb = disk_mb.max(1);
    if mb % 1024 == 0 {
        format!("{}GiB", mb / 1024)
    } else {
        format!("{}MiB", mb)
    }
}

/// Proxmox takes disk sizes in whole gigabytes, rounded up, at least 1.
pub fn disk_gb(disk_mb: i64) -> i64 {
    ((disk_mb + 1023) / 1024).max(1)
}

/// Parse a human size (`512`, `512MiB`, `10G`) into megabytes. Bare numbers are megabytes.
pub fn parse_size_mb(value: &str) -> Result<i64> {
    let trimmed = value.trim();
    if let Ok(mb) = trimmed.parse::<i64>() {
        return Ok(mb);
    }
    let bytes = Byte::parse_str(trimmed, true)
        .map_err(|e| ControlError::InvalidParam(format!("invalid size '{value}': {e}")))?
        .as_u64();
    Ok((bytes / 1024 / 1024) as i64)
}
