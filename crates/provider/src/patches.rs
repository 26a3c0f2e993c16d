//! Patch sets
//!
//! A patch is a single `(address, byte)` override layered on top of a
//! provider's raw bytes. The whole set is kept ordered by address so the
//! IPS encoder can group consecutive addresses into runs.

use std::collections::BTreeMap;

/// Ordered map of absolute address to replacement byte.
///
/// Invariant: every key is a distinct absolute address; on read the value
/// replaces the underlying provider byte.
pub type Patches = BTreeMap<u64, u8>;

/// Apply every patch that falls inside `[start, start + buf.len())` to the
/// buffer, which is assumed to hold the raw bytes for that range.
pub fn apply_patches(patches: &Patches, start: u64, buf: &mut [u8]) {
    let end = start + buf.len() as u64;
    for (&address, &value) in patches.range(start..end) {
        buf[(address - start) as usize] = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_patches_masks_range() {
        let patches: Patches = [(2u64, 0xAAu8), (5, 0xBB), (100, 0xCC)].into_iter().collect();

        let mut buf = [0u8; 8];
        apply_patches(&patches, 0, &mut buf);
        assert_eq!(buf, [0, 0, 0xAA, 0, 0, 0xBB, 0, 0]);

        let mut window = [0u8; 2];
        apply_patches(&patches, 4, &mut window);
        assert_eq!(window, [0, 0xBB]);
    }
}
