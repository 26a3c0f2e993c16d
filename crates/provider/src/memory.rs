//! In-memory provider
//!
//! Backs APIs that want a provider but only have a byte buffer — tests,
//! clipboard data, decoded network payloads.

use std::sync::RwLock;

use crate::controls::ProviderControls;
use crate::error::ProviderError;
use crate::Provider;

pub struct MemoryProvider {
    data: RwLock<Vec<u8>>,
    name: String,
    controls: ProviderControls,
}

impl MemoryProvider {
    pub fn new(data: Vec<u8>) -> Self {
        Self::named(data, String::new())
    }

    pub fn named(data: Vec<u8>, name: impl Into<String>) -> Self {
        Self {
            data: RwLock::new(data),
            name: name.into(),
            controls: ProviderControls::new(),
        }
    }

    fn read_guard(&self) -> std::sync::RwLockReadGuard<'_, Vec<u8>> {
        self.data.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_guard(&self) -> std::sync::RwLockWriteGuard<'_, Vec<u8>> {
        self.data.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Provider for MemoryProvider {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn type_name(&self) -> &'static str {
        "memory"
    }

    fn is_writable(&self) -> bool {
        true
    }

    fn is_resizable(&self) -> bool {
        true
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
        let mut data = self.write_guard();
        let at = (offset as usize).min(data.len());
        data.splice(at..at, std::iter::repeat_n(0u8, len as usize));
        Ok(())
    }

    fn remove(&self, offset: u64, len: u64) -> Result<(), ProviderError> {
        let mut data = self.write_guard();
        let start = (offset as usize).min(data.len());
        let end = (start + len as usize).min(data.len());
        data.drain(start..end);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_applies_patches() {
        let provider = MemoryProvider::new(vec![0x00, 0x11, 0x22, 0x33]);
        provider.write(1, &[0xAB]).unwrap();

        let mut buf = [0u8; 4];
        provider.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0x00, 0xAB, 0x22, 0x33]);

        // Raw bytes are untouched until the patches are applied.
        provider.read_raw(0, &mut buf).unwrap();
        assert_eq!(buf, [0x00, 0x11, 0x22, 0x33]);

        provider.apply_patches().unwrap();
        provider.read_raw(0, &mut buf).unwrap();
        assert_eq!(buf, [0x00, 0xAB, 0x22, 0x33]);
    }

    #[test]
    fn test_read_past_end_is_out_of_range() {
        let provider = MemoryProvider::new(vec![0u8; 8]);

        let mut one = [0u8; 1];
        assert!(provider.read(7, &mut one).is_ok());
        assert!(matches!(
            provider.read(8, &mut one),
            Err(ProviderError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_insert_and_remove() {
        let provider = MemoryProvider::new(vec![1, 2, 3, 4]);
        provider.insert(2, 2).unwrap();
        assert_eq!(provider.actual_size(), 6);

        let mut buf = [0u8; 6];
        provider.read_raw(0, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 0, 0, 3, 4]);

        provider.remove(2, 2).unwrap();
        let mut buf = [0u8; 4];
        provider.read_raw(0, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn test_undo_redo_restores_observable_bytes() {
        let provider = MemoryProvider::new(vec![0u8; 2]);
        provider.write(0, &[0xAA]).unwrap();
        provider.write(1, &[0xBB]).unwrap();

        let mut buf = [0u8; 2];
        provider.controls().undo();
        provider.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0xAA, 0x00]);

        provider.controls().redo();
        provider.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0xAA, 0xBB]);
    }
}
