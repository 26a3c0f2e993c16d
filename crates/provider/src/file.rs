//! File-backed provider
//!
//! The file content is buffered in memory at open; `save` applies pending
//! patches and writes the buffer back, `save_as` dumps the logical bytes
//! elsewhere. Insert/remove splice the buffer and are flushed on save.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::debug;

use crate::controls::ProviderControls;
use crate::error::ProviderError;
use crate::Provider;

pub struct FileProvider {
    path: PathBuf,
    data: RwLock<Vec<u8>>,
    read_only: bool,
    controls: ProviderControls,
}

impl FileProvider {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ProviderError> {
        Self::open_with(path, false)
    }

    pub fn open_read_only(path: impl Into<PathBuf>) -> Result<Self, ProviderError> {
        Self::open_with(path, true)
    }

    fn open_with(path: impl Into<PathBuf>, read_only: bool) -> Result<Self, ProviderError> {
        let path = path.into();
        let data = fs::read(&path)?;
        debug!(path = %path.display(), size = data.len(), read_only, "opened file provider");

        Ok(Self {
            path,
            data: RwLock::new(data),
            read_only,
            controls: ProviderControls::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_guard(&self) -> std::sync::RwLockReadGuard<'_, Vec<u8>> {
        self.data.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_guard(&self) -> std::sync::RwLockWriteGuard<'_, Vec<u8>> {
        self.data.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Provider for FileProvider {
    fn name(&self) -> String {
        self.path.display().to_string()
    }

    fn type_name(&self) -> &'static str {
        "file"
    }

    fn description(&self) -> Vec<(String, String)> {
        vec![
            ("path".into(), self.path.display().to_string()),
            ("size".into(), format!("{:#x}", self.actual_size())),
            ("read only".into(), self.read_only.to_string()),
        ]
    }

    fn is_writable(&self) -> bool {
        !self.read_only
    }

    fn is_resizable(&self) -> bool {
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

        let mut data = self.write_guard();
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

    fn insert(&self, offset: u64, len: u64) -> Result<(), ProviderError> {
        if self.read_only {
            return Err(ProviderError::NotResizable(self.name()));
        }
        let mut data = self.write_guard();
        let at = (offset as usize).min(data.len());
        data.splice(at..at, std::iter::repeat_n(0u8, len as usize));
        Ok(())
    }

    fn remove(&self, offset: u64, len: u64) -> Result<(), ProviderError> {
        if self.read_only {
            return Err(ProviderError::NotResizable(self.name()));
        }
        let mut data = self.write_guard();
        let start = (offset as usize).min(data.len());
        let end = (start + len as usize).min(data.len());
        data.drain(start..end);
        Ok(())
    }

    fn save(&self) -> Result<(), ProviderError> {
        if self.read_only {
            return Err(ProviderError::NotSavable(self.name()));
        }

        self.apply_patches()?;
        let data = self.read_guard();
        fs::write(&self.path, &*data)?;
        debug!(path = %self.path.display(), size = data.len(), "saved file provider");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(content: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_open_read_save_round_trip() {
        let file = temp_file(&[0x10, 0x20, 0x30]);
        let provider = FileProvider::open(file.path()).unwrap();

        provider.write(1, &[0xFF]).unwrap();
        provider.save().unwrap();

        assert_eq!(fs::read(file.path()).unwrap(), vec![0x10, 0xFF, 0x30]);
        assert!(provider.controls().patches().is_empty());
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let file = temp_file(&[0u8; 4]);
        let provider = FileProvider::open_read_only(file.path()).unwrap();

        assert!(!provider.is_writable());
        assert!(matches!(
            provider.write(0, &[1]),
            Err(ProviderError::NotWritable(_))
        ));
        assert!(matches!(provider.save(), Err(ProviderError::NotSavable(_))));
    }

    #[test]
    fn test_save_as_writes_logical_bytes() {
        let file = temp_file(&[1, 2, 3, 4]);
        let provider = FileProvider::open(file.path()).unwrap();
        provider.write(0, &[0xEE]).unwrap();
        provider.controls().add_overlay(3, vec![0xDD]);

        let out = tempfile::NamedTempFile::new().unwrap();
        provider.save_as(out.path()).unwrap();

        assert_eq!(fs::read(out.path()).unwrap(), vec![0xEE, 2, 3, 0xDD]);
        // Pending patches survive a save_as.
        assert_eq!(provider.controls().patches().len(), 1);
    }

    #[test]
    fn test_insert_grows_file_on_save() {
        let file = temp_file(&[1, 2]);
        let provider = FileProvider::open(file.path()).unwrap();
        provider.insert(1, 2).unwrap();
        provider.save().unwrap();

        assert_eq!(fs::read(file.path()).unwrap(), vec![1, 0, 0, 2]);
    }
}
