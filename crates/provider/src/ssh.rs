//! SSH remote file provider
//!
//! Proxies a file on a remote host through an SFTP handle: the remote
//! bytes are fetched once when the provider opens and uploaded back on
//! save. The handle drives the system `sftp` client in batch mode, so no
//! native SSH library is linked.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::controls::ProviderControls;
use crate::error::ProviderError;
use crate::Provider;

static STAGING_COUNTER: AtomicU64 = AtomicU64::new(0);

/// One `sftp` batch session per operation.
struct SftpHandle {
    /// `user@host` or a `Host` alias from the ssh config.
    destination: String,
}

impl SftpHandle {
    fn run(&self, batch: &str) -> Result<(), ProviderError> {
        let mut child = Command::new("sftp")
            .arg("-b")
            .arg("-")
            .arg(&self.destination)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(stdin) = child.stdin.as_mut() {
            stdin.write_all(batch.as_bytes())?;
        }

        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(ProviderError::Remote(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    fn fetch(&self, remote_path: &str, local: &PathBuf) -> Result<(), ProviderError> {
        self.run(&format!("get \"{}\" \"{}\"\n", remote_path, local.display()))
    }

    fn upload(&self, local: &PathBuf, remote_path: &str) -> Result<(), ProviderError> {
        self.run(&format!("put \"{}\" \"{}\"\n", local.display(), remote_path))
    }
}

fn staging_path() -> PathBuf {
    std::env::temp_dir().join(format!(
        "runic-sftp-{}-{}",
        std::process::id(),
        STAGING_COUNTER.fetch_add(1, Ordering::Relaxed)
    ))
}

pub struct SshProvider {
    handle: SftpHandle,
    remote_path: String,
    data: RwLock<Vec<u8>>,
    read_only: bool,
    controls: ProviderControls,
}

impl SshProvider {
    /// Fetch `remote_path` from `destination` (`user@host`) and expose it.
    pub fn connect(destination: &str, remote_path: &str) -> Result<Self, ProviderError> {
        Self::connect_with(destination, remote_path, false)
    }

    pub fn connect_read_only(
        destination: &str,
        remote_path: &str,
    ) -> Result<Self, ProviderError> {
        Self::connect_with(destination, remote_path, true)
    }

    fn connect_with(
        destination: &str,
        remote_path: &str,
        read_only: bool,
    ) -> Result<Self, ProviderError> {
        let handle = SftpHandle {
            destination: destination.to_string(),
        };

        let staging = staging_path();
        handle.fetch(remote_path, &staging)?;
        let data = std::fs::read(&staging)?;
        let _ = std::fs::remove_file(&staging);

        debug!(destination, remote_path, size = data.len(), "fetched remote file");

        Ok(Self {
            handle,
            remote_path: remote_path.to_string(),
            data: RwLock::new(data),
            read_only,
            controls: ProviderControls::new(),
        })
    }

    #[cfg(test)]
    pub(crate) fn from_bytes(destination: &str, remote_path: &str, data: Vec<u8>) -> Self {
        Self {
            handle: SftpHandle {
                destination: destination.to_string(),
            },
            remote_path: remote_path.to_string(),
            data: RwLock::new(data),
            read_only: false,
            controls: ProviderControls::new(),
        }
    }

    fn read_guard(&self) -> std::sync::RwLockReadGuard<'_, Vec<u8>> {
        self.data.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl Provider for SshProvider {
    fn name(&self) -> String {
        format!("{}:{}", self.handle.destination, self.remote_path)
    }

    fn type_name(&self) -> &'static str {
        "ssh"
    }

    fn description(&self) -> Vec<(String, String)> {
        vec![
            ("destination".into(), self.handle.destination.clone()),
            ("remote path".into(), self.remote_path.clone()),
            ("size".into(), format!("{:#x}", self.actual_size())),
        ]
    }

    fn is_writable(&self) -> bool {
        !self.read_only
    }

    fn is_savable(&self) -> bool {
        !self.read_only
    }

    fn controls(&self) -> &ProviderControls {
        &self.controls
    }

    fn read_raw(&self, offset: u64, buf: &mut [u8]) -> Result<(), ProviderError> {
        let data = self.read_guard();
        let start = offset as usize;
        let end = match start.checked_add(buf.len()) {
            Some(end) if end <= data.len() => end,
            _ => {
                return Err(ProviderError::OutOfRange {
                    offset,
                    size: buf.len() as u64,
                    provider_size: data.len() as u64,
                });
            }
        };
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_raw(&self, offset: u64, bytes: &[u8]) -> Result<(), ProviderError> {
        if self.read_only {
            return Err(ProviderError::NotWritable(self.name()));
        }

        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        let start = offset as usize;
        let end = match start.checked_add(bytes.len()) {
            Some(end) if end <= data.len() => end,
            _ => {
                return Err(ProviderError::OutOfRange {
                    offset,
                    size: bytes.len() as u64,
                    provider_size: data.len() as u64,
                });
            }
        };
        data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn actual_size(&self) -> u64 {
        self.read_guard().len() as u64
    }

    /// Apply pending patches to the buffer and upload it back through the
    /// SFTP handle.
    fn save(&self) -> Result<(), ProviderError> {
        if self.read_only {
            return Err(ProviderError::NotSavable(self.name()));
        }

        self.apply_patches()?;

        let staging = staging_path();
        std::fs::write(&staging, &*self.read_guard())?;
        let result = self.handle.upload(&staging, &self.remote_path);
        let _ = std::fs::remove_file(&staging);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_fetched_bytes() {
        let provider = SshProvider::from_bytes("dev@build-box", "/srv/firmware.bin", vec![9, 8, 7]);

        assert_eq!(provider.name(), "dev@build-box:/srv/firmware.bin");
        assert_eq!(provider.actual_size(), 3);

        let mut buf = [0u8; 2];
        provider.read(1, &mut buf).unwrap();
        assert_eq!(buf, [8, 7]);
    }

    #[test]
    fn test_writes_patch_the_buffer() {
        let provider = SshProvider::from_bytes("dev@build-box", "/srv/firmware.bin", vec![0u8; 4]);
        provider.write(2, &[0x55]).unwrap();

        let mut buf = [0u8; 4];
        provider.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0, 0, 0x55, 0]);
        assert!(provider.controls().can_undo());
    }
}
