//! Byte-source providers for the runic pattern engine
//!
//! A [`Provider`] is a uniform random-access byte store. Raw bytes come
//! from a backing implementation (a file, a memory buffer, a UDP message
//! stream, a remote SFTP file, a live process); the logical view layers
//! patches and overlays on top of them and supports linear undo/redo of
//! edits. Reads are safe for concurrent readers; patch mutation is
//! exclusive.
//!
//! Providers are paged: addresses handed to [`Provider::read`] and
//! [`Provider::write`] are relative to the current page, while patch and
//! overlay addresses are absolute (base address + page offset).

use std::io::Write;
use std::path::Path;

mod base64_file;
mod controls;
mod error;
mod file;
mod ips;
mod memory;
mod overlay;
mod patches;
mod process;
mod ssh;
mod udp;
mod view;

pub use base64_file::Base64Provider;
pub use controls::ProviderControls;
pub use error::{PatchError, ProviderError};
pub use file::FileProvider;
pub use ips::{decode_ips, decode_ips32, encode_ips, encode_ips32};
pub use memory::MemoryProvider;
pub use overlay::{Overlay, OverlayId};
pub use patches::Patches;
pub use process::{MemoryRegion, ProcessMemoryProvider};
pub use ssh::SshProvider;
pub use udp::{UdpMessage, UdpProvider};
pub use view::ViewProvider;

/// Fixed page size shared by every provider.
pub const PAGE_SIZE: u64 = 0x1000_0000;

/// A random-access byte store with overlayed patches, paging and undo.
///
/// Implementations supply the raw byte plumbing (`read_raw`, `write_raw`,
/// `actual_size`) plus a [`ProviderControls`] block; the logical
/// operations are provided on top of those.
pub trait Provider: Send + Sync {
    /// Human-readable instance name (usually a path or an address).
    fn name(&self) -> String;

    /// Short backing-kind name, e.g. `"file"` or `"udp"`.
    fn type_name(&self) -> &'static str;

    /// Key/value pairs describing the instance for a UI.
    fn description(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    fn is_readable(&self) -> bool {
        true
    }
    fn is_writable(&self) -> bool;
    fn is_resizable(&self) -> bool {
        false
    }
    fn is_savable(&self) -> bool {
        false
    }

    /// The shared control block (patches, overlays, paging, base address).
    fn controls(&self) -> &ProviderControls;

    /// Fill `buf` from the backing store, bypassing overlays and patches.
    fn read_raw(&self, offset: u64, buf: &mut [u8]) -> Result<(), ProviderError>;

    /// Write directly to the backing store, bypassing the patch layer.
    fn write_raw(&self, offset: u64, data: &[u8]) -> Result<(), ProviderError>;

    /// Total byte count of the backing store, across all pages.
    fn actual_size(&self) -> u64;

    /// Grow the store by `len` zero bytes at `offset`.
    fn insert(&self, _offset: u64, _len: u64) -> Result<(), ProviderError> {
        Err(ProviderError::NotResizable(self.name()))
    }

    /// Shrink the store by `len` bytes at `offset`.
    fn remove(&self, _offset: u64, _len: u64) -> Result<(), ProviderError> {
        Err(ProviderError::NotResizable(self.name()))
    }

    /// Flush pending patches into the backing store.
    fn save(&self) -> Result<(), ProviderError> {
        Err(ProviderError::NotSavable(self.name()))
    }

    /// Write the logical content (raw bytes masked by patches and
    /// overlays, all pages) to `path`.
    fn save_as(&self, path: &Path) -> Result<(), ProviderError> {
        const CHUNK: usize = 0x1_0000;

        let mut out = std::fs::File::create(path)?;
        let base = self.controls().base_address();
        let total = self.actual_size();

        let mut offset = 0u64;
        let mut chunk = vec![0u8; CHUNK];
        while offset < total {
            let len = CHUNK.min((total - offset) as usize);
            self.read_raw(offset, &mut chunk[..len])?;
            self.controls().apply_masks(base + offset, &mut chunk[..len]);
            out.write_all(&chunk[..len])?;
            offset += len as u64;
        }

        out.flush()?;
        Ok(())
    }

    /// Logical byte count of the current page.
    fn size(&self) -> u64 {
        let page_start = u64::from(self.controls().current_page()) * PAGE_SIZE;
        PAGE_SIZE.min(self.actual_size().saturating_sub(page_start))
    }

    /// Page-relative logical read. Overlays win over patches; patches win
    /// over raw bytes.
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), ProviderError> {
        let size = self.size();
        let out_of_range = ProviderError::OutOfRange {
            offset,
            size: buf.len() as u64,
            provider_size: size,
        };
        match offset.checked_add(buf.len() as u64) {
            Some(end) if end <= size => {}
            _ => return Err(out_of_range),
        }

        let page_start = u64::from(self.controls().current_page()) * PAGE_SIZE;
        self.read_raw(page_start + offset, buf)?;

        let absolute = self.controls().base_address() + page_start + offset;
        self.controls().apply_masks(absolute, buf);
        Ok(())
    }

    /// Page-relative logical write: records one patch per byte and opens
    /// an undo point for the whole call.
    fn write(&self, offset: u64, data: &[u8]) -> Result<(), ProviderError> {
        if !self.is_writable() {
            return Err(ProviderError::NotWritable(self.name()));
        }

        let size = self.size();
        match offset.checked_add(data.len() as u64) {
            Some(end) if end <= size => {}
            _ => {
                return Err(ProviderError::OutOfRange {
                    offset,
                    size: data.len() as u64,
                    provider_size: size,
                });
            }
        }

        let page_start = u64::from(self.controls().current_page()) * PAGE_SIZE;
        let absolute = self.controls().base_address() + page_start + offset;
        self.controls().add_patch(absolute, data, true);
        Ok(())
    }

    /// Flush the current patch map through `write_raw` and clear it,
    /// together with its undo history.
    fn apply_patches(&self) -> Result<(), ProviderError> {
        let base = self.controls().base_address();
        for (address, byte) in self.controls().take_patches() {
            self.write_raw(address - base, &[byte])?;
        }
        Ok(())
    }

    fn page_count(&self) -> u32 {
        self.actual_size().div_ceil(PAGE_SIZE).max(1) as u32
    }

    fn current_page(&self) -> u32 {
        self.controls().current_page()
    }

    fn set_current_page(&self, page: u32) {
        self.controls().set_current_page(page.min(self.page_count().saturating_sub(1)));
    }

    /// Absolute address of the first byte of the current page.
    fn current_page_address(&self) -> u64 {
        self.controls().base_address() + u64::from(self.controls().current_page()) * PAGE_SIZE
    }

    fn base_address(&self) -> u64 {
        self.controls().base_address()
    }

    fn set_base_address(&self, address: u64) {
        self.controls().set_base_address(address);
    }

    /// Page containing the absolute address, if any.
    fn page_of_address(&self, address: u64) -> Option<u32> {
        let base = self.controls().base_address();
        if address < base {
            return None;
        }
        let page = (address - base) / PAGE_SIZE;
        (page < u64::from(self.page_count())).then_some(page as u32)
    }
}
