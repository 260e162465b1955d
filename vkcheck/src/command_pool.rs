// Copyright (c) 2024 the vkcheck developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Command pool lifecycle validation.
//!
//! Creation checks the queue family and the protected-memory feature gate.
//! Destruction and reset share one rule: no command buffer allocated from the
//! pool may still be in flight. The predicate is identical for both entry
//! points; only the VUID and the action wording differ.

use crate::{
    command_buffer::CommandBufferRecord,
    device::{validate_device_queue_family, DeviceRecord},
    report::Violations,
    Requires, RequiresAllOf, RequiresOneOf, ValidationError,
};
use ash::vk;
use parking_lot::RwLock;
use std::sync::Arc;

/// The parameters of a `vkCreateCommandPool` call that this core validates.
#[derive(Clone, Copy, Debug)]
pub struct CommandPoolCreateInfo {
    pub flags: vk::CommandPoolCreateFlags,
    pub queue_family_index: u32,
    pub _ne: crate::NonExhaustive,
}

impl Default for CommandPoolCreateInfo {
    #[inline]
    fn default() -> Self {
        CommandPoolCreateInfo {
            flags: vk::CommandPoolCreateFlags::empty(),
            queue_family_index: 0,
            _ne: crate::NonExhaustive(()),
        }
    }
}

/// The layer's mirror of one command pool.
#[derive(Debug)]
pub struct CommandPoolRecord {
    queue_family_index: u32,
    flags: vk::CommandPoolCreateFlags,
    command_buffers: RwLock<Vec<Arc<CommandBufferRecord>>>,
}

impl CommandPoolRecord {
    pub(crate) fn new(create_info: &CommandPoolCreateInfo) -> Self {
        CommandPoolRecord {
            queue_family_index: create_info.queue_family_index,
            flags: create_info.flags,
            command_buffers: RwLock::new(Vec::new()),
        }
    }

    #[inline]
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    #[inline]
    pub fn flags(&self) -> vk::CommandPoolCreateFlags {
        self.flags
    }

    pub(crate) fn register_command_buffer(&self, command_buffer: Arc<CommandBufferRecord>) {
        self.command_buffers.write().push(command_buffer);
    }

    /// Whether any command buffer allocated from this pool has been submitted
    /// and is not yet known to have completed.
    pub fn any_command_buffer_in_use(&self) -> bool {
        self.command_buffers
            .read()
            .iter()
            .any(|command_buffer| command_buffer.in_use())
    }
}

pub(crate) fn validate_create_command_pool(
    device: &DeviceRecord,
    create_info: &CommandPoolCreateInfo,
) -> Violations {
    let mut violations = Violations::new();

    violations.check(validate_device_queue_family(
        device,
        create_info.queue_family_index,
        "create_info.queue_family_index".into(),
        &["VUID-vkCreateCommandPool-queueFamilyIndex-01937"],
        false,
    ));

    if create_info
        .flags
        .contains(vk::CommandPoolCreateFlags::PROTECTED)
        && !device.enabled_features().protected_memory
    {
        violations.push(Box::new(ValidationError {
            context: "create_info.flags".into(),
            problem: "contains `VK_COMMAND_POOL_CREATE_PROTECTED_BIT`, but the \
                `protectedMemory` feature was not enabled when the device was created"
                .into(),
            requires_one_of: RequiresOneOf(&[RequiresAllOf(&[Requires::DeviceFeature(
                "protectedMemory",
            )])]),
            vuids: &["VUID-VkCommandPoolCreateInfo-flags-02860"],
            ..Default::default()
        }));
    }

    violations
}

pub(crate) fn validate_destroy_command_pool(pool: &CommandPoolRecord) -> Violations {
    validate_pool_not_in_use(
        pool,
        "destroy",
        &["VUID-vkDestroyCommandPool-commandPool-00041"],
    )
}

pub(crate) fn validate_reset_command_pool(pool: &CommandPoolRecord) -> Violations {
    validate_pool_not_in_use(
        pool,
        "reset",
        &["VUID-vkResetCommandPool-commandPool-00040"],
    )
}

fn validate_pool_not_in_use(
    pool: &CommandPoolRecord,
    action: &str,
    vuids: &'static [&'static str],
) -> Violations {
    let mut violations = Violations::new();

    if pool.any_command_buffer_in_use() {
        violations.push(Box::new(ValidationError {
            context: "command_pool".into(),
            problem: format!(
                "attempt to {} command pool with command buffers still in use by a \
                submitted, not yet completed workload",
                action,
            )
            .into(),
            vuids,
            ..Default::default()
        }));
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::device_record_with_queues;

    fn pool_with_buffers(in_use: &[bool]) -> CommandPoolRecord {
        let pool = CommandPoolRecord::new(&CommandPoolCreateInfo::default());

        for &busy in in_use {
            let command_buffer = Arc::new(CommandBufferRecord::new(0b1));
            if busy {
                command_buffer.mark_submitted();
            }
            pool.register_command_buffer(command_buffer);
        }

        pool
    }

    #[test]
    fn create_checks_queue_family_membership() {
        let device = device_record_with_queues(&[(1, vk::DeviceQueueCreateFlags::empty(), 1)]);

        let violations = validate_create_command_pool(
            &device,
            &CommandPoolCreateInfo {
                queue_family_index: 0,
                ..Default::default()
            },
        );
        assert_eq!(violations.len(), 1);
        assert!(violations.contains_vuid("VUID-vkCreateCommandPool-queueFamilyIndex-01937"));

        let violations = validate_create_command_pool(
            &device,
            &CommandPoolCreateInfo {
                queue_family_index: 1,
                ..Default::default()
            },
        );
        assert!(violations.is_empty());
    }

    #[test]
    fn protected_pool_requires_protected_memory_feature() {
        let device = device_record_with_queues(&[(0, vk::DeviceQueueCreateFlags::empty(), 1)]);

        let violations = validate_create_command_pool(
            &device,
            &CommandPoolCreateInfo {
                flags: vk::CommandPoolCreateFlags::PROTECTED,
                ..Default::default()
            },
        );
        assert_eq!(violations.len(), 1);
        assert!(violations.contains_vuid("VUID-VkCommandPoolCreateInfo-flags-02860"));
    }

    #[test]
    fn destroy_and_reset_reject_in_flight_buffers() {
        let busy = pool_with_buffers(&[false, true, false]);

        let violations = validate_destroy_command_pool(&busy);
        assert_eq!(violations.len(), 1);
        assert!(violations.contains_vuid("VUID-vkDestroyCommandPool-commandPool-00041"));
        assert!(violations.iter().any(|error| error.problem.contains("destroy")));

        let violations = validate_reset_command_pool(&busy);
        assert_eq!(violations.len(), 1);
        assert!(violations.contains_vuid("VUID-vkResetCommandPool-commandPool-00040"));
        assert!(violations.iter().any(|error| error.problem.contains("reset")));
    }

    #[test]
    fn idle_pool_passes_destroy_and_reset() {
        let idle = pool_with_buffers(&[false, false]);
        assert!(validate_destroy_command_pool(&idle).is_empty());
        assert!(validate_reset_command_pool(&idle).is_empty());
    }

    #[test]
    fn completed_buffer_frees_the_pool() {
        let pool = CommandPoolRecord::new(&CommandPoolCreateInfo::default());
        let command_buffer = Arc::new(CommandBufferRecord::new(0b1));
        pool.register_command_buffer(command_buffer.clone());

        command_buffer.mark_submitted();
        assert!(pool.any_command_buffer_in_use());

        command_buffer.mark_completed();
        assert!(!pool.any_command_buffer_in_use());
    }
}
