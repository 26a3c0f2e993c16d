//! Process memory provider
//!
//! Reads the mapped regions of a live process. Raw offsets are virtual
//! addresses in the target's address space; unmapped holes read as
//! errors. The provider is read-only and never resizable.

use std::fs;
use std::io;

use crate::controls::ProviderControls;
use crate::error::ProviderError;
use crate::Provider;

/// One entry of the target's memory map.
#[derive(Debug, Clone)]
pub struct MemoryRegion {
    pub start: u64,
    pub end: u64,
    pub permissions: String,
    pub label: String,
}

pub struct ProcessMemoryProvider {
    pid: i32,
    process_name: String,
    regions: Vec<MemoryRegion>,
    controls: ProviderControls,
}

impl ProcessMemoryProvider {
    /// Attach to a running process by pid and snapshot its memory map.
    pub fn attach(pid: i32) -> Result<Self, ProviderError> {
        let maps = fs::read_to_string(format!("/proc/{pid}/maps"))?;
        let process_name = fs::read_to_string(format!("/proc/{pid}/comm"))
            .map(|s| s.trim().to_string())
            .unwrap_or_default();

        let regions = parse_memory_map(&maps);
        if regions.is_empty() {
            return Err(ProviderError::Remote(format!(
                "process {pid} has no readable mappings"
            )));
        }

        Ok(Self {
            pid,
            process_name,
            regions,
            controls: ProviderControls::new(),
        })
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }
}

fn parse_memory_map(maps: &str) -> Vec<MemoryRegion> {
    let mut regions = Vec::new();

    for line in maps.lines() {
        let mut fields = line.split_whitespace();
        let (Some(range), Some(permissions)) = (fields.next(), fields.next()) else {
            continue;
        };
        let Some((start, end)) = range.split_once('-') else {
            continue;
        };
        let (Ok(start), Ok(end)) = (
            u64::from_str_radix(start, 16),
            u64::from_str_radix(end, 16),
        ) else {
            continue;
        };

        if !permissions.starts_with('r') {
            continue;
        }

        regions.push(MemoryRegion {
            start,
            end,
            permissions: permissions.to_string(),
            label: fields.nth(3).unwrap_or("").to_string(),
        });
    }

    regions
}

#[cfg(target_os = "linux")]
fn read_process_memory(pid: i32, address: u64, buf: &mut [u8]) -> Result<(), ProviderError> {
    let local = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    let remote = libc::iovec {
        iov_base: address as *mut libc::c_void,
        iov_len: buf.len(),
    };

    let read = unsafe { libc::process_vm_readv(pid, &local, 1, &remote, 1, 0) };
    if read < 0 {
        return Err(ProviderError::Io(io::Error::last_os_error()));
    }
    if (read as usize) < buf.len() {
        return Err(ProviderError::OutOfRange {
            offset: address,
            size: buf.len() as u64,
            provider_size: address + read as u64,
        });
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn read_process_memory(_pid: i32, _address: u64, _buf: &mut [u8]) -> Result<(), ProviderError> {
    Err(ProviderError::Remote(
        "process memory access is only supported on Linux".into(),
    ))
}

impl Provider for ProcessMemoryProvider {
    fn name(&self) -> String {
        format!("{} ({})", self.process_name, self.pid)
    }

    fn type_name(&self) -> &'static str {
        "process"
    }

    fn description(&self) -> Vec<(String, String)> {
        vec![
            ("pid".into(), self.pid.to_string()),
            ("process".into(), self.process_name.clone()),
            ("regions".into(), self.regions.len().to_string()),
        ]
    }

    fn is_writable(&self) -> bool {
        false
    }

    fn controls(&self) -> &ProviderControls {
        &self.controls
    }

    fn read_raw(&self, offset: u64, buf: &mut [u8]) -> Result<(), ProviderError> {
        read_process_memory(self.pid, offset, buf)
    }

    fn write_raw(&self, _offset: u64, _data: &[u8]) -> Result<(), ProviderError> {
        Err(ProviderError::NotWritable(self.name()))
    }

    fn actual_size(&self) -> u64 {
        self.regions.last().map_or(0, |r| r.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_map() {
        let maps = "\
00400000-00452000 r-xp 00000000 08:02 173521 /usr/bin/dbus-daemon\n\
00651000-00652000 rw-p 00051000 08:02 173521 /usr/bin/dbus-daemon\n\
7f000000-7f100000 ---p 00000000 00:00 0\n\
7fffb2c0-7fffb2e1 rw-p 00000000 00:00 0 [stack]\n";

        let regions = parse_memory_map(maps);
        assert_eq!(regions.len(), 3);
        assert_eq!(regions[0].start, 0x0040_0000);
        assert_eq!(regions[0].label, "/usr/bin/dbus-daemon");
        assert_eq!(regions[2].label, "[stack]");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_read_own_process_memory() {
        let marker: [u8; 8] = *b"runicpmp";
        let provider = ProcessMemoryProvider::attach(std::process::id() as i32).unwrap();

        let mut buf = [0u8; 8];
        provider
            .read_raw(marker.as_ptr() as u64, &mut buf)
            .unwrap();
        assert_eq!(buf, marker);
    }
}
