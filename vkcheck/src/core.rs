// Copyright (c) 2024 the vkcheck developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The entry-point surface consumed by the dispatch layer.
//!
//! [`CoreValidation`] owns the mirrored state and exposes one
//! `pre_call_validate_*` function per intercepted entry point plus the
//! `record_*` hooks that keep the mirror current. The validate functions are
//! pure reads: they emit every violation through the logging facade and
//! return the "skip" boolean, which is only `true` when the layer is
//! configured to block on error. The record hooks run after the native call
//! succeeded.
//!
//! A handle that does not resolve means the object was never mirrored or was
//! already destroyed; there is nothing left to validate against, so those
//! calls pass through silently rather than guessing.

use crate::{
    cache::ValidationCache,
    command_buffer::CommandBufferRecord,
    command_pool::{
        validate_create_command_pool, validate_destroy_command_pool, validate_reset_command_pool,
        CommandPoolCreateInfo, CommandPoolRecord,
    },
    device::{
        physical::PhysicalDeviceRecord,
        queue::{validate_get_device_queue, validate_get_device_queue2, DeviceQueueInfo2},
        validate_create_device, DeviceCreateInfo, DeviceRecord,
    },
    device_group::validate_cmd_set_device_mask,
    report::Violations,
    settings::ValidationSettings,
    store::{Handle, HandleArena},
};

/// The state-and-validation core behind the generated dispatch layer.
#[derive(Debug, Default)]
pub struct CoreValidation {
    physical_devices: HandleArena<PhysicalDeviceRecord>,
    devices: HandleArena<DeviceRecord>,
    command_pools: HandleArena<CommandPoolRecord>,
    command_buffers: HandleArena<CommandBufferRecord>,
    settings: ValidationSettings,
}

impl CoreValidation {
    pub fn new(settings: ValidationSettings) -> Self {
        CoreValidation {
            physical_devices: HandleArena::new(),
            devices: HandleArena::new(),
            command_pools: HandleArena::new(),
            command_buffers: HandleArena::new(),
            settings,
        }
    }

    #[inline]
    pub fn settings(&self) -> &ValidationSettings {
        &self.settings
    }

    fn finish(&self, command: &str, violations: Violations) -> bool {
        violations.emit(command);
        violations.should_skip(&self.settings)
    }

    // Physical device mirroring.

    /// Mirrors a physical device reported by enumeration.
    pub fn record_enumerate_physical_device(
        &self,
        record: PhysicalDeviceRecord,
    ) -> Handle<PhysicalDeviceRecord> {
        self.physical_devices.insert(record)
    }

    /// Records a successful queue family enumeration call: the application
    /// now knows this physical device has at least `count` families.
    pub fn record_queue_family_count_discovered(
        &self,
        physical_device: Handle<PhysicalDeviceRecord>,
        count: u32,
    ) {
        if let Some(record) = self.physical_devices.get(physical_device) {
            record.discover_queue_family_count(count);
        }
    }

    pub fn physical_device(
        &self,
        handle: Handle<PhysicalDeviceRecord>,
    ) -> Option<std::sync::Arc<PhysicalDeviceRecord>> {
        self.physical_devices.get(handle)
    }

    // Device lifecycle.

    pub fn pre_call_validate_create_device(
        &self,
        physical_device: Handle<PhysicalDeviceRecord>,
        create_info: &DeviceCreateInfo,
    ) -> bool {
        let Some(physical_device) = self.physical_devices.get(physical_device) else {
            return false;
        };

        self.finish(
            "vkCreateDevice",
            validate_create_device(&physical_device, create_info),
        )
    }

    /// Mirrors a successfully created device, loading its validation cache
    /// unless caching is disabled.
    pub fn record_create_device(
        &self,
        physical_device: Handle<PhysicalDeviceRecord>,
        create_info: &DeviceCreateInfo,
    ) -> Option<Handle<DeviceRecord>> {
        let physical_device_record = self.physical_devices.get(physical_device)?;
        let cache = ValidationCache::load(&self.settings);

        Some(self.devices.insert(DeviceRecord::new(
            physical_device,
            &physical_device_record,
            create_info,
            cache,
        )))
    }

    /// Unmirrors a destroyed device, persisting its validation cache first.
    pub fn record_destroy_device(&self, device: Handle<DeviceRecord>) {
        if let Some(record) = self.devices.remove(device) {
            if let Some(cache) = record.take_validation_cache() {
                cache.save(&self.settings);
            }
        }
    }

    pub fn device(&self, handle: Handle<DeviceRecord>) -> Option<std::sync::Arc<DeviceRecord>> {
        self.devices.get(handle)
    }

    // Queue retrieval.

    pub fn pre_call_validate_get_device_queue(
        &self,
        device: Handle<DeviceRecord>,
        queue_family_index: u32,
        queue_index: u32,
    ) -> bool {
        let Some(device) = self.devices.get(device) else {
            return false;
        };

        self.finish(
            "vkGetDeviceQueue",
            validate_get_device_queue(&device, queue_family_index, queue_index),
        )
    }

    pub fn pre_call_validate_get_device_queue2(
        &self,
        device: Handle<DeviceRecord>,
        queue_info: &DeviceQueueInfo2,
    ) -> bool {
        let Some(device) = self.devices.get(device) else {
            return false;
        };

        self.finish(
            "vkGetDeviceQueue2",
            validate_get_device_queue2(&device, queue_info),
        )
    }

    // Command pool lifecycle.

    pub fn pre_call_validate_create_command_pool(
        &self,
        device: Handle<DeviceRecord>,
        create_info: &CommandPoolCreateInfo,
    ) -> bool {
        let Some(device) = self.devices.get(device) else {
            return false;
        };

        self.finish(
            "vkCreateCommandPool",
            validate_create_command_pool(&device, create_info),
        )
    }

    pub fn record_create_command_pool(
        &self,
        create_info: &CommandPoolCreateInfo,
    ) -> Handle<CommandPoolRecord> {
        self.command_pools.insert(CommandPoolRecord::new(create_info))
    }

    pub fn pre_call_validate_destroy_command_pool(
        &self,
        command_pool: Handle<CommandPoolRecord>,
    ) -> bool {
        let Some(pool) = self.command_pools.get(command_pool) else {
            return false;
        };

        self.finish("vkDestroyCommandPool", validate_destroy_command_pool(&pool))
    }

    pub fn pre_call_validate_reset_command_pool(
        &self,
        command_pool: Handle<CommandPoolRecord>,
    ) -> bool {
        let Some(pool) = self.command_pools.get(command_pool) else {
            return false;
        };

        self.finish("vkResetCommandPool", validate_reset_command_pool(&pool))
    }

    pub fn record_destroy_command_pool(&self, command_pool: Handle<CommandPoolRecord>) {
        self.command_pools.remove(command_pool);
    }

    // Command buffer mirroring.

    /// Mirrors command buffers allocated from a pool. Until begun, each one
    /// addresses every physical device of the owning device's group.
    pub fn record_allocate_command_buffers(
        &self,
        device: Handle<DeviceRecord>,
        command_pool: Handle<CommandPoolRecord>,
        count: u32,
    ) -> Vec<Handle<CommandBufferRecord>> {
        let all_devices_mask = self
            .devices
            .get(device)
            .map(|device| full_device_mask(device.physical_device_count()))
            .unwrap_or(0b1);

        (0..count)
            .map(|_| {
                let handle = self
                    .command_buffers
                    .insert(CommandBufferRecord::new(all_devices_mask));

                if let (Some(pool), Some(record)) = (
                    self.command_pools.get(command_pool),
                    self.command_buffers.get(handle),
                ) {
                    pool.register_command_buffer(record);
                }

                handle
            })
            .collect()
    }

    /// Records the start of recording, fixing the command buffer's device
    /// mask. A mask of zero in the begin info means "all devices".
    pub fn record_begin_command_buffer(
        &self,
        device: Handle<DeviceRecord>,
        command_buffer: Handle<CommandBufferRecord>,
        device_mask: u32,
    ) {
        let Some(record) = self.command_buffers.get(command_buffer) else {
            return;
        };

        let device_mask = if device_mask == 0 {
            self.devices
                .get(device)
                .map(|device| full_device_mask(device.physical_device_count()))
                .unwrap_or(0b1)
        } else {
            device_mask
        };

        record.begin(device_mask);
    }

    pub fn record_begin_render_pass(
        &self,
        command_buffer: Handle<CommandBufferRecord>,
        device_mask: u32,
    ) {
        if let Some(record) = self.command_buffers.get(command_buffer) {
            record.begin_render_pass(device_mask);
        }
    }

    pub fn record_end_render_pass(&self, command_buffer: Handle<CommandBufferRecord>) {
        if let Some(record) = self.command_buffers.get(command_buffer) {
            record.end_render_pass();
        }
    }

    pub fn record_submit(&self, command_buffer: Handle<CommandBufferRecord>) {
        if let Some(record) = self.command_buffers.get(command_buffer) {
            record.mark_submitted();
        }
    }

    pub fn record_submission_completed(&self, command_buffer: Handle<CommandBufferRecord>) {
        if let Some(record) = self.command_buffers.get(command_buffer) {
            record.mark_completed();
        }
    }

    // Device mask operations.

    pub fn pre_call_validate_cmd_set_device_mask(
        &self,
        device: Handle<DeviceRecord>,
        command_buffer: Handle<CommandBufferRecord>,
        device_mask: u32,
    ) -> bool {
        let (Some(device), Some(command_buffer)) = (
            self.devices.get(device),
            self.command_buffers.get(command_buffer),
        ) else {
            return false;
        };

        self.finish(
            "vkCmdSetDeviceMask",
            validate_cmd_set_device_mask(
                &command_buffer,
                device_mask,
                device.physical_device_count(),
            ),
        )
    }
}

/// The mask addressing every device in a group of the given cardinality.
fn full_device_mask(physical_device_count: u32) -> u32 {
    ((1u64 << physical_device_count) - 1) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{device::DeviceQueueCreateInfo, Version};

    fn core_with_device(
        fail_on_error: bool,
    ) -> (
        CoreValidation,
        Handle<PhysicalDeviceRecord>,
        Handle<DeviceRecord>,
    ) {
        let core = CoreValidation::new(ValidationSettings {
            fail_on_error,
            disable_cache: true,
            ..Default::default()
        });

        let physical = core.record_enumerate_physical_device(
            crate::device::tests::graphics_families(&[4, 2]),
        );

        let create_info = DeviceCreateInfo {
            api_version: Version::V1_1,
            queue_create_infos: vec![DeviceQueueCreateInfo {
                queue_family_index: 0,
                queue_count: 2,
                ..Default::default()
            }],
            ..Default::default()
        };

        assert!(!core.pre_call_validate_create_device(physical, &create_info));
        let device = core.record_create_device(physical, &create_info).unwrap();

        (core, physical, device)
    }

    #[test]
    fn default_policy_reports_but_forwards() {
        let (core, physical, _) = core_with_device(false);

        // Family 7 was never discovered, so this create info is invalid, but
        // the observational default still forwards.
        let bad = DeviceCreateInfo {
            api_version: Version::V1_1,
            queue_create_infos: vec![DeviceQueueCreateInfo {
                queue_family_index: 7,
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(!core.pre_call_validate_create_device(physical, &bad));
    }

    #[test]
    fn fail_on_error_blocks_invalid_calls() {
        let core = CoreValidation::new(ValidationSettings {
            fail_on_error: true,
            disable_cache: true,
            ..Default::default()
        });
        let physical = core.record_enumerate_physical_device(
            crate::device::tests::graphics_families(&[4]),
        );

        let bad = DeviceCreateInfo {
            api_version: Version::V1_1,
            queue_create_infos: vec![DeviceQueueCreateInfo {
                queue_family_index: 7,
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(core.pre_call_validate_create_device(physical, &bad));

        let good = DeviceCreateInfo {
            api_version: Version::V1_1,
            queue_create_infos: vec![DeviceQueueCreateInfo::default()],
            ..Default::default()
        };
        assert!(!core.pre_call_validate_create_device(physical, &good));
    }

    #[test]
    fn queue_retrieval_checked_against_creation_records() {
        let core = CoreValidation::new(ValidationSettings {
            fail_on_error: true,
            disable_cache: true,
            ..Default::default()
        });
        let physical = core.record_enumerate_physical_device(
            crate::device::tests::graphics_families(&[4, 2]),
        );

        let create_info = DeviceCreateInfo {
            api_version: Version::V1_1,
            queue_create_infos: vec![DeviceQueueCreateInfo {
                queue_family_index: 0,
                queue_count: 2,
                ..Default::default()
            }],
            ..Default::default()
        };
        let device = core.record_create_device(physical, &create_info).unwrap();

        assert!(!core.pre_call_validate_get_device_queue(device, 0, 1));
        assert!(core.pre_call_validate_get_device_queue(device, 0, 2));
        assert!(core.pre_call_validate_get_device_queue(device, 1, 0));
    }

    #[test]
    fn destroyed_device_handle_passes_through() {
        let (core, _, device) = core_with_device(true);
        core.record_destroy_device(device);

        // Nothing to validate against; the call passes through.
        assert!(!core.pre_call_validate_get_device_queue(device, 0, 99));
    }

    #[test]
    fn pool_lifecycle_tracks_in_flight_buffers() {
        let (core, _, device) = core_with_device(true);

        let pool = core.record_create_command_pool(&CommandPoolCreateInfo::default());
        let buffers = core.record_allocate_command_buffers(device, pool, 2);
        assert_eq!(buffers.len(), 2);

        assert!(!core.pre_call_validate_destroy_command_pool(pool));

        core.record_submit(buffers[0]);
        assert!(core.pre_call_validate_destroy_command_pool(pool));
        assert!(core.pre_call_validate_reset_command_pool(pool));

        core.record_submission_completed(buffers[0]);
        assert!(!core.pre_call_validate_destroy_command_pool(pool));

        core.record_destroy_command_pool(pool);
        assert!(!core.pre_call_validate_destroy_command_pool(pool));
    }

    #[test]
    fn device_mask_validated_against_group_and_command_buffer() {
        let (core, _, device) = core_with_device(true);

        let pool = core.record_create_command_pool(&CommandPoolCreateInfo::default());
        let command_buffer = core.record_allocate_command_buffers(device, pool, 1)[0];

        // Single-device group: only mask 0b1 is valid.
        assert!(!core.pre_call_validate_cmd_set_device_mask(device, command_buffer, 0b1));
        assert!(core.pre_call_validate_cmd_set_device_mask(device, command_buffer, 0b10));
        assert!(core.pre_call_validate_cmd_set_device_mask(device, command_buffer, 0));
    }

    #[test]
    fn begin_with_zero_mask_means_all_devices() {
        let (core, _, device) = core_with_device(false);
        let pool = core.record_create_command_pool(&CommandPoolCreateInfo::default());
        let command_buffer = core.record_allocate_command_buffers(device, pool, 1)[0];

        core.record_begin_command_buffer(device, command_buffer, 0);
        let record = core.command_buffers.get(command_buffer).unwrap();
        assert_eq!(record.initial_device_mask(), 0b1);
    }
}
