// Copyright (c) 2024 the vkcheck developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Queue creation records and queue retrieval validation.

use crate::{
    device::{validate_device_queue_family, DeviceRecord},
    report::Violations,
    ValidationError,
};
use ash::vk;

/// A scheduling-priority hint attached to a queue at creation time.
///
/// `VK_KHR_global_priority` makes this explicit; when the application does
/// not chain the extension struct, the priority defaults to `Medium`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum QueueGlobalPriority {
    Low,
    #[default]
    Medium,
    High,
    Realtime,
}

/// One `(queueFamilyIndex, flags)` pair the device was created with.
///
/// Established at successful device creation and immutable thereafter; the
/// queue retrieval validators check `vkGetDeviceQueue`/`vkGetDeviceQueue2`
/// arguments against these records.
#[derive(Clone, Copy, Debug)]
pub struct DeviceQueueCreateRecord {
    pub queue_family_index: u32,
    pub flags: vk::DeviceQueueCreateFlags,
    pub queue_count: u32,
    /// Index into the original `pQueueCreateInfos` array, kept so that
    /// diagnostics can point at the element that established the record.
    pub create_info_index: usize,
}

/// Parameters of a `vkGetDeviceQueue2` call.
#[derive(Clone, Copy, Debug)]
pub struct DeviceQueueInfo2 {
    pub flags: vk::DeviceQueueCreateFlags,
    pub queue_family_index: u32,
    pub queue_index: u32,
    pub _ne: crate::NonExhaustive,
}

impl Default for DeviceQueueInfo2 {
    #[inline]
    fn default() -> Self {
        DeviceQueueInfo2 {
            flags: vk::DeviceQueueCreateFlags::empty(),
            queue_family_index: 0,
            queue_index: 0,
            _ne: crate::NonExhaustive(()),
        }
    }
}

pub(crate) fn validate_get_device_queue(
    device: &DeviceRecord,
    queue_family_index: u32,
    queue_index: u32,
) -> Violations {
    let mut violations = Violations::new();

    if let Err(error) = validate_device_queue_family(
        device,
        queue_family_index,
        "queue_family_index".into(),
        &["VUID-vkGetDeviceQueue-queueFamilyIndex-00384"],
        false,
    ) {
        // Without a valid family there is no creation record to check the
        // remaining arguments against.
        violations.push(error);
        return violations;
    }

    for record in device
        .queue_create_records()
        .iter()
        .filter(|record| record.queue_family_index == queue_family_index)
    {
        if !record.flags.is_empty() {
            violations.push(Box::new(ValidationError {
                context: "queue_family_index".into(),
                problem: format!(
                    "(= {}) was used in `pCreateInfo->pQueueCreateInfos[{}]` with non-zero \
                    flags ({:?}); queues created with flags must be retrieved with \
                    vkGetDeviceQueue2",
                    queue_family_index, record.create_info_index, record.flags,
                )
                .into(),
                vuids: &["VUID-vkGetDeviceQueue-flags-01841"],
                ..Default::default()
            }));
        } else if queue_index >= record.queue_count {
            violations.push(Box::new(ValidationError {
                context: "queue_index".into(),
                problem: format!(
                    "(= {}) is not less than the number of queues (= {}) requested for queue \
                    family {} in `pCreateInfo->pQueueCreateInfos[{}]`",
                    queue_index, record.queue_count, queue_family_index, record.create_info_index,
                )
                .into(),
                vuids: &["VUID-vkGetDeviceQueue-queueIndex-00385"],
                ..Default::default()
            }));
        }
    }

    violations
}

pub(crate) fn validate_get_device_queue2(
    device: &DeviceRecord,
    queue_info: &DeviceQueueInfo2,
) -> Violations {
    let mut violations = Violations::new();

    if let Err(error) = validate_device_queue_family(
        device,
        queue_info.queue_family_index,
        "queue_info.queue_family_index".into(),
        &["VUID-VkDeviceQueueInfo2-queueFamilyIndex-01842"],
        false,
    ) {
        violations.push(error);
        return violations;
    }

    // The "2" variant requires an exact match on both family index and flags.
    // A family that was created, but never with this flags value, is a
    // different failure than an in-range family with a too-high ordinal.
    let matching = device.queue_create_records().iter().find(|record| {
        record.queue_family_index == queue_info.queue_family_index
            && record.flags == queue_info.flags
    });

    match matching {
        Some(record) => {
            if queue_info.queue_index >= record.queue_count {
                violations.push(Box::new(ValidationError {
                    context: "queue_info.queue_index".into(),
                    problem: format!(
                        "(= {}) is not less than the number of queues (= {}) requested for \
                        queue family {} with flags {:?} in `pCreateInfo->pQueueCreateInfos[{}]`",
                        queue_info.queue_index,
                        record.queue_count,
                        queue_info.queue_family_index,
                        queue_info.flags,
                        record.create_info_index,
                    )
                    .into(),
                    vuids: &["VUID-VkDeviceQueueInfo2-queueIndex-01843"],
                    ..Default::default()
                }));
            }
        }
        None => {
            violations.push(Box::new(ValidationError {
                context: "queue_info".into(),
                problem: format!(
                    "no element of `pCreateInfo->pQueueCreateInfos` combined queue family {} \
                    with flags {:?} when the device was created",
                    queue_info.queue_family_index, queue_info.flags,
                )
                .into(),
                vuids: &["VUID-VkDeviceQueueInfo2-flags-06225"],
                ..Default::default()
            }));
        }
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::device_record_with_queues;

    #[test]
    fn unknown_family_reports_only_family_violation() {
        // Scenario: the device was created without any entry for family 2, so
        // retrieving a queue from it fails the topology check and nothing
        // else runs for that call.
        let device = device_record_with_queues(&[(0, vk::DeviceQueueCreateFlags::empty(), 2)]);

        let violations = validate_get_device_queue(&device, 2, 0);
        assert_eq!(violations.len(), 1);
        assert!(violations.contains_vuid("VUID-vkGetDeviceQueue-queueFamilyIndex-00384"));
    }

    #[test]
    fn queue_index_out_of_range() {
        let device = device_record_with_queues(&[(0, vk::DeviceQueueCreateFlags::empty(), 2)]);

        let violations = validate_get_device_queue(&device, 0, 2);
        assert_eq!(violations.len(), 1);
        assert!(violations.contains_vuid("VUID-vkGetDeviceQueue-queueIndex-00385"));

        assert!(validate_get_device_queue(&device, 0, 1).is_empty());
    }

    #[test]
    fn flagged_family_requires_queue2() {
        let device = device_record_with_queues(&[(0, vk::DeviceQueueCreateFlags::PROTECTED, 1)]);

        let violations = validate_get_device_queue(&device, 0, 0);
        assert!(violations.contains_vuid("VUID-vkGetDeviceQueue-flags-01841"));
    }

    #[test]
    fn queue2_requires_exact_flags_match() {
        let device = device_record_with_queues(&[(0, vk::DeviceQueueCreateFlags::PROTECTED, 1)]);

        let violations = validate_get_device_queue2(
            &device,
            &DeviceQueueInfo2 {
                queue_family_index: 0,
                ..Default::default()
            },
        );
        assert_eq!(violations.len(), 1);
        assert!(violations.contains_vuid("VUID-VkDeviceQueueInfo2-flags-06225"));

        let violations = validate_get_device_queue2(
            &device,
            &DeviceQueueInfo2 {
                flags: vk::DeviceQueueCreateFlags::PROTECTED,
                queue_family_index: 0,
                ..Default::default()
            },
        );
        assert!(violations.is_empty());
    }

    #[test]
    fn queue2_ordinal_checked_only_after_match() {
        let device = device_record_with_queues(&[(1, vk::DeviceQueueCreateFlags::empty(), 3)]);

        let violations = validate_get_device_queue2(
            &device,
            &DeviceQueueInfo2 {
                queue_family_index: 1,
                queue_index: 3,
                ..Default::default()
            },
        );
        assert_eq!(violations.len(), 1);
        assert!(violations.contains_vuid("VUID-VkDeviceQueueInfo2-queueIndex-01843"));
    }

    #[test]
    fn queue2_invalid_family_not_double_reported() {
        let device = device_record_with_queues(&[(0, vk::DeviceQueueCreateFlags::empty(), 1)]);

        let violations = validate_get_device_queue2(
            &device,
            &DeviceQueueInfo2 {
                queue_family_index: 5,
                queue_index: 9,
                ..Default::default()
            },
        );
        assert_eq!(violations.len(), 1);
        assert!(violations.contains_vuid("VUID-VkDeviceQueueInfo2-queueFamilyIndex-01842"));
    }
}
