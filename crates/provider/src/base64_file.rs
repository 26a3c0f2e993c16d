//! Base64 file provider
//!
//! Treats a file whose content is base64 text as the byte store it
//! encodes: the provider exposes the decoded bytes 1:1 and translates
//! every raw access to the aligned 4-byte ciphertext groups covering it.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::RwLock;

use base64::prelude::*;

use crate::controls::ProviderControls;
use crate::error::ProviderError;
use crate::Provider;

pub struct Base64Provider {
    path: PathBuf,
    /// The raw base64 text, whitespace stripped.
    text: RwLock<Vec<u8>>,
    decoded_size: u64,
    read_only: bool,
    controls: ProviderControls,
}

impl Base64Provider {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ProviderError> {
        Self::open_with(path, false)
    }

    pub fn open_read_only(path: impl Into<PathBuf>) -> Result<Self, ProviderError> {
        Self::open_with(path, true)
    }

    fn open_with(path: impl Into<PathBuf>, read_only: bool) -> Result<Self, ProviderError> {
        let path = path.into();
        let mut text = fs::read(&path)?;
        text.retain(|b| !b.is_ascii_whitespace());

        if text.len() % 4 != 0 || BASE64_STANDARD.decode(&text).is_err() {
            return Err(ProviderError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("'{}' is not valid base64", path.display()),
            )));
        }

        let padding = text.iter().rev().take_while(|&&b| b == b'=').count() as u64;
        let decoded_size = (text.len() as u64 / 4) * 3 - padding;

        Ok(Self {
            path,
            text: RwLock::new(text),
            decoded_size,
            read_only,
            controls: ProviderControls::new(),
        })
    }

    /// Decode the ciphertext groups covering `[offset, offset + len)`.
    /// Returns the plaintext of those groups and the offset into it.
    fn decode_groups(&self, offset: u64, len: usize) -> Result<(Vec<u8>, usize, u64), ProviderError> {
        let first_group = offset / 3;
        let last_group = (offset + len as u64 - 1) / 3;

        let text = self.text.read().unwrap_or_else(|e| e.into_inner());
        let start = (first_group * 4) as usize;
        let end = ((last_group + 1) * 4).min(text.len() as u64) as usize;

        let plain = BASE64_STANDARD
            .decode(&text[start..end])
            .map_err(|e| ProviderError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;

        Ok((plain, (offset - first_group * 3) as usize, first_group))
    }

    fn check(&self, offset: u64, len: usize) -> Result<(), ProviderError> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.decoded_size => Ok(()),
            _ => Err(ProviderError::OutOfRange {
                offset,
                size: len as u64,
                provider_size: self.decoded_size,
            }),
        }
    }
}

impl Provider for Base64Provider {
    fn name(&self) -> String {
        self.path.display().to_string()
    }

    fn type_name(&self) -> &'static str {
        "base64"
    }

    fn description(&self) -> Vec<(String, String)> {
        vec![
            ("path".into(), self.path.display().to_string()),
            ("encoded size".into(), format!("{:#x}", self.text.read().unwrap_or_else(|e| e.into_inner()).len())),
            ("decoded size".into(), format!("{:#x}", self.decoded_size)),
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
        if buf.is_empty() {
            return Ok(());
        }
        self.check(offset, buf.len())?;

        let (plain, skip, _) = self.decode_groups(offset, buf.len())?;
        buf.copy_from_slice(&plain[skip..skip + buf.len()]);
        Ok(())
    }

    fn write_raw(&self, offset: u64, bytes: &[u8]) -> Result<(), ProviderError> {
        if self.read_only {
            return Err(ProviderError::NotWritable(self.name()));
        }
        if bytes.is_empty() {
            return Ok(());
        }
        self.check(offset, bytes.len())?;

        let (mut plain, skip, first_group) = self.decode_groups(offset, bytes.len())?;
        plain[skip..skip + bytes.len()].copy_from_slice(bytes);

        let encoded = BASE64_STANDARD.encode(&plain);
        let start = (first_group * 4) as usize;
        let mut text = self.text.write().unwrap_or_else(|e| e.into_inner());
        text[start..start + encoded.len()].copy_from_slice(encoded.as_bytes());
        Ok(())
    }

    fn actual_size(&self) -> u64 {
        self.decoded_size
    }

    fn save(&self) -> Result<(), ProviderError> {
        if self.read_only {
            return Err(ProviderError::NotSavable(self.name()));
        }

        self.apply_patches()?;
        let text = self.text.read().unwrap_or_else(|e| e.into_inner());
        fs::write(&self.path, &*text)?;
        Ok(())
    }
}
