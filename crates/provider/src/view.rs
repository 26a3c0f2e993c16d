//! View provider
//!
//! A window over a region of another provider. Raw reads and writes are
//! forwarded with an address offset and clamped to the window; the view
//! keeps its own patch and overlay state.

use std::sync::Arc;

use crate::controls::ProviderControls;
use crate::error::ProviderError;
use crate::Provider;

pub struct ViewProvider {
    inner: Arc<dyn Provider>,
    start: u64,
    length: u64,
    controls: ProviderControls,
}

impl ViewProvider {
    /// Window `[start, start + length)` of `inner`'s raw bytes.
    pub fn new(inner: Arc<dyn Provider>, start: u64, length: u64) -> Result<Self, ProviderError> {
        let inner_size = inner.actual_size();
        match start.checked_add(length) {
            Some(end) if end <= inner_size => {}
            _ => {
                return Err(ProviderError::OutOfRange {
                    offset: start,
                    size: length,
                    provider_size: inner_size,
                });
            }
        }

        Ok(Self {
            inner,
            start,
            length,
            controls: ProviderControls::new(),
        })
    }

    fn check(&self, offset: u64, len: usize) -> Result<(), ProviderError> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.length => Ok(()),
            _ => Err(ProviderError::OutOfRange {
                offset,
                size: len as u64,
                provider_size: self.length,
            }),
        }
    }
}

impl Provider for ViewProvider {
    fn name(&self) -> String {
        format!(
            "{} [{:#x}..{:#x}]",
            self.inner.name(),
            self.start,
            self.start + self.length
        )
    }

    fn type_name(&self) -> &'static str {
        "view"
    }

    fn description(&self) -> Vec<(String, String)> {
        vec![
            ("backing".into(), self.inner.name()),
            ("start".into(), format!("{:#x}", self.start)),
            ("length".into(), format!("{:#x}", self.length)),
        ]
    }

    fn is_writable(&self) -> bool {
        self.inner.is_writable()
    }

    fn controls(&self) -> &ProviderControls {
        &self.controls
    }

    fn read_raw(&self, offset: u64, buf: &mut [u8]) -> Result<(), ProviderError> {
        self.check(offset, buf.len())?;
        self.inner.read_raw(self.start + offset, buf)
    }

    fn write_raw(&self, offset: u64, data: &[u8]) -> Result<(), ProviderError> {
        self.check(offset, data.len())?;
        self.inner.write_raw(self.start + offset, data)
    }

    fn actual_size(&self) -> u64 {
        self.length
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryProvider;

    #[test]
    fn test_view_forwards_with_offset() {
        let inner = Arc::new(MemoryProvider::new((0u8..16).collect()));
        let view = ViewProvider::new(inner, 4, 8).unwrap();

        assert_eq!(view.actual_size(), 8);

        let mut buf = [0u8; 4];
        view.read(0, &mut buf).unwrap();
        assert_eq!(buf, [4, 5, 6, 7]);
    }

    #[test]
    fn test_view_bounds_are_enforced() {
        let inner = Arc::new(MemoryProvider::new(vec![0u8; 16]));
        let view = ViewProvider::new(inner.clone(), 4, 8).unwrap();

        let mut buf = [0u8; 4];
        assert!(matches!(
            view.read(6, &mut buf),
            Err(ProviderError::OutOfRange { .. })
        ));

        assert!(ViewProvider::new(inner, 12, 8).is_err());
    }

    #[test]
    fn test_view_patches_are_local() {
        let inner = Arc::new(MemoryProvider::new(vec![0u8; 8]));
        let view = ViewProvider::new(inner.clone(), 2, 4).unwrap();

        view.write(0, &[0xAA]).unwrap();

        let mut buf = [0u8; 1];
        view.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0xAA]);

        // The inner provider sees neither the patch nor a raw change.
        inner.read(2, &mut buf).unwrap();
        assert_eq!(buf, [0x00]);
    }
}
