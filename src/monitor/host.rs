//! Host resource readers backed by procfs and libc.

use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use crate::fsutil::nearest_existing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryInfo {
    pub total: u64,
    pub available: u64,
}

impl MemoryInfo {
    pub fn used(&self) -> u64 {
        self.total.saturating_sub(self.available)
    }
}

pub fn read_meminfo() -> io::Result<MemoryInfo> {
    let text = fs::read_to_string("/proc/meminfo")?;
    parse_meminfo(&text).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "MemTotal missing from /proc/meminfo")
    })
}

/// Parse `/proc/meminfo`. Values are reported in kB.
///
/// Kernels older than 3.14 lack `MemAvailable`; free + buffers + cached is
/// used instead.
pub fn parse_meminfo(text: &str) -> Option<MemoryInfo> {
    let mut total = None;
    let mut available = None;
    let mut free = 0u64;
    let mut buffers = 0u64;
    let mut cached = 0u64;
    for line in text.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let Some(kb) = rest
            .split_whitespace()
            .next()
            .and_then(|v| v.parse::<u64>().ok())
        else {
            continue;
        };
        let bytes = kb.saturating_mul(1024);
        match key.trim() {
            "MemTotal" => total = Some(bytes),
            "MemAvailable" => available = Some(bytes),
            "MemFree" => free = bytes,
            "Buffers" => buffers = bytes,
            "Cached" => cached = bytes,
            _ => {}
        }
    }
    let total = total?;
    let available = available.unwrap_or(free + buffers + cached).min(total);
    Some(MemoryInfo { total, available })
}

/// One-minute load average.
pub fn load_average() -> Option<f64> {
    let mut loads = [0f64; 3];
    // SAFETY: getloadavg writes at most `nelem` doubles into the buffer.
    let n = unsafe { libc::getloadavg(loads.as_mut_ptr(), 3) };
    if n < 1 {
        None
    } else {
        Some(loads[0])
    }
}

/// Free space available to unprivileged writers on the filesystem holding
/// `path`, or its nearest existing ancestor.
pub fn available_disk(path: &Path) -> io::Result<u64> {
    fs2::available_space(nearest_existing(path))
}

/// Device id of the filesystem holding `path`, or its nearest existing ancestor.
pub fn filesystem_id(path: &Path) -> io::Result<u64> {
    Ok(fs::metadata(nearest_existing(path))?.dev())
}

pub fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

pub fn effective_uid() -> u32 {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() }
}
