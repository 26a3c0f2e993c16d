//! Shared provider control block
//!
//! Every provider embeds a [`ProviderControls`] holding the state that is
//! common to all backings: the patch map with its undo/redo history, the
//! overlay list, the page index and the base address. The block is
//! internally locked so the logical read path is safe for concurrent
//! readers while patch mutation stays exclusive.

use std::sync::{Mutex, MutexGuard};

use crate::overlay::{Overlay, OverlayId};
use crate::patches::{self, Patches};

#[derive(Default)]
struct ControlState {
    patches: Patches,
    undo_stack: Vec<Patches>,
    redo_stack: Vec<Patches>,
    overlays: Vec<Overlay>,
    next_overlay_id: u64,
    current_page: u32,
    base_address: u64,
}

/// Patches, overlays, paging and base address for one provider.
#[derive(Default)]
pub struct ProviderControls {
    state: Mutex<ControlState>,
}

impl ProviderControls {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ControlState> {
        // A poisoned lock only means another reader panicked mid-read;
        // the state itself is never left half-written.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mask a raw-byte buffer for `[start, start + buf.len())` (absolute
    /// addresses) with patches, then overlays. Overlays win over patches;
    /// patches win over raw bytes.
    pub fn apply_masks(&self, start: u64, buf: &mut [u8]) {
        let state = self.lock();
        patches::apply_patches(&state.patches, start, buf);
        for overlay in &state.overlays {
            overlay.apply(start, buf);
        }
    }

    /// Record one patch byte per element of `bytes`, starting at `address`.
    ///
    /// With `create_undo` the current patch map is snapshotted first and
    /// the redo history is discarded; without it the bytes merge into the
    /// current snapshot.
    pub fn add_patch(&self, address: u64, bytes: &[u8], create_undo: bool) {
        let mut state = self.lock();
        if create_undo {
            let snapshot = state.patches.clone();
            state.undo_stack.push(snapshot);
            state.redo_stack.clear();
        }
        for (i, &byte) in bytes.iter().enumerate() {
            state.patches.insert(address + i as u64, byte);
        }
    }

    /// Current patch map snapshot.
    pub fn patches(&self) -> Patches {
        self.lock().patches.clone()
    }

    /// Drain the patch map, returning what was pending. Called when the
    /// patches have been flushed through to the backing store.
    pub fn take_patches(&self) -> Patches {
        let mut state = self.lock();
        state.undo_stack.clear();
        state.redo_stack.clear();
        std::mem::take(&mut state.patches)
    }

    pub fn can_undo(&self) -> bool {
        !self.lock().undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.lock().redo_stack.is_empty()
    }

    /// Step one snapshot back in the patch history.
    pub fn undo(&self) -> bool {
        let mut state = self.lock();
        match state.undo_stack.pop() {
            Some(previous) => {
                let current = std::mem::replace(&mut state.patches, previous);
                state.redo_stack.push(current);
                true
            }
            None => false,
        }
    }

    /// Step one snapshot forward in the patch history.
    pub fn redo(&self) -> bool {
        let mut state = self.lock();
        match state.redo_stack.pop() {
            Some(next) => {
                let current = std::mem::replace(&mut state.patches, next);
                state.undo_stack.push(current);
                true
            }
            None => false,
        }
    }

    pub fn add_overlay(&self, address: u64, bytes: Vec<u8>) -> OverlayId {
        let mut state = self.lock();
        let id = OverlayId(state.next_overlay_id);
        state.next_overlay_id += 1;
        state.overlays.push(Overlay { id, address, bytes });
        id
    }

    pub fn remove_overlay(&self, id: OverlayId) -> bool {
        let mut state = self.lock();
        let before = state.overlays.len();
        state.overlays.retain(|o| o.id != id);
        state.overlays.len() != before
    }

    /// Ordered snapshot of the overlay list.
    pub fn overlays(&self) -> Vec<Overlay> {
        self.lock().overlays.clone()
    }

    pub fn current_page(&self) -> u32 {
        self.lock().current_page
    }

    pub fn set_current_page(&self, page: u32) {
        self.lock().current_page = page;
    }

    pub fn base_address(&self) -> u64 {
        self.lock().base_address
    }

    pub fn set_base_address(&self, address: u64) {
        self.lock().base_address = address;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_undo_redo_restores_patches() {
        let controls = ProviderControls::new();

        controls.add_patch(0x10, &[0xAA], true);
        controls.add_patch(0x11, &[0xBB], true);
        assert_eq!(controls.patches().len(), 2);

        assert!(controls.undo());
        assert_eq!(controls.patches().len(), 1);
        assert!(controls.can_redo());

        assert!(controls.redo());
        assert_eq!(controls.patches().len(), 2);
        assert_eq!(controls.patches().get(&0x11), Some(&0xBB));
    }

    #[test]
    fn test_new_patch_after_undo_drops_redo_history() {
        let controls = ProviderControls::new();

        controls.add_patch(0x10, &[0xAA], true);
        controls.add_patch(0x11, &[0xBB], true);
        assert!(controls.undo());
        controls.add_patch(0x20, &[0xCC], true);

        assert!(!controls.can_redo());
        assert!(!controls.redo());
        assert_eq!(controls.patches().get(&0x20), Some(&0xCC));
        assert_eq!(controls.patches().get(&0x11), None);
    }

    #[test]
    fn test_merge_without_undo_point() {
        let controls = ProviderControls::new();

        controls.add_patch(0x10, &[0xAA], true);
        controls.add_patch(0x11, &[0xBB], false);

        assert!(controls.undo());
        assert!(controls.patches().is_empty());
    }

    #[test]
    fn test_overlays_win_over_patches() {
        let controls = ProviderControls::new();
        controls.add_patch(4, &[0x11, 0x22], false);
        controls.add_overlay(5, vec![0xFF]);

        let mut buf = [0u8; 4];
        controls.apply_masks(3, &mut buf);
        assert_eq!(buf, [0, 0x11, 0xFF, 0]);
    }

    #[test]
    fn test_remove_overlay() {
        let controls = ProviderControls::new();
        let id = controls.add_overlay(0, vec![1, 2, 3]);
        assert_eq!(controls.overlays().len(), 1);
        assert!(controls.remove_overlay(id));
        assert!(controls.overlays().is_empty());
        assert!(!controls.remove_overlay(id));
    }
}
