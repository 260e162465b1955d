// Copyright (c) 2024 the vkcheck developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Mirrored command buffer state.
//!
//! The device-mask rules only need three facts about a command buffer: the
//! device mask it was begun with, the device mask of the render pass it is
//! currently inside (if any), and whether submitted work referencing it is
//! still pending. The first two are recorded by the begin/render-pass hooks,
//! the last by the submit/completion hooks.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Clone, Copy, Debug)]
struct MaskState {
    initial_device_mask: u32,
    /// `Some` while a render pass instance is active on this command buffer.
    render_pass_device_mask: Option<u32>,
}

/// The layer's mirror of one allocated command buffer.
#[derive(Debug)]
pub struct CommandBufferRecord {
    masks: RwLock<MaskState>,
    /// Set when the command buffer is submitted, cleared when the submission
    /// is known to have completed.
    in_use: AtomicBool,
}

impl CommandBufferRecord {
    /// Creates the record for a freshly allocated command buffer.
    ///
    /// Until `vkBeginCommandBuffer` says otherwise, the initial device mask
    /// includes every physical device in the group.
    pub fn new(initial_device_mask: u32) -> Self {
        CommandBufferRecord {
            masks: RwLock::new(MaskState {
                initial_device_mask,
                render_pass_device_mask: None,
            }),
            in_use: AtomicBool::new(false),
        }
    }

    /// The device mask fixed at begin/reset time.
    #[inline]
    pub fn initial_device_mask(&self) -> u32 {
        self.masks.read().initial_device_mask
    }

    /// The device mask of the active render pass, or `None` outside one.
    #[inline]
    pub fn render_pass_device_mask(&self) -> Option<u32> {
        self.masks.read().render_pass_device_mask
    }

    #[inline]
    pub fn in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    /// Begins recording with the given device mask; also the reset path,
    /// since both discard all previously recorded state.
    pub(crate) fn begin(&self, initial_device_mask: u32) {
        let mut masks = self.masks.write();
        masks.initial_device_mask = initial_device_mask;
        masks.render_pass_device_mask = None;
    }

    pub(crate) fn begin_render_pass(&self, device_mask: u32) {
        self.masks.write().render_pass_device_mask = Some(device_mask);
    }

    pub(crate) fn end_render_pass(&self) {
        self.masks.write().render_pass_device_mask = None;
    }

    pub(crate) fn mark_submitted(&self) {
        self.in_use.store(true, Ordering::Release);
    }

    pub(crate) fn mark_completed(&self) {
        self.in_use.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::CommandBufferRecord;

    #[test]
    fn begin_resets_render_pass_mask() {
        let record = CommandBufferRecord::new(0b11);
        record.begin_render_pass(0b01);
        assert_eq!(record.render_pass_device_mask(), Some(0b01));

        record.begin(0b01);
        assert_eq!(record.initial_device_mask(), 0b01);
        assert_eq!(record.render_pass_device_mask(), None);
    }

    #[test]
    fn render_pass_mask_tracks_begin_end() {
        let record = CommandBufferRecord::new(0b1);
        assert_eq!(record.render_pass_device_mask(), None);

        record.begin_render_pass(0b1);
        assert_eq!(record.render_pass_device_mask(), Some(0b1));

        record.end_render_pass();
        assert_eq!(record.render_pass_device_mask(), None);
    }

    #[test]
    fn in_use_follows_submission_lifecycle() {
        let record = CommandBufferRecord::new(0b1);
        assert!(!record.in_use());

        record.mark_submitted();
        assert!(record.in_use());

        record.mark_completed();
        assert!(!record.in_use());
    }
}
