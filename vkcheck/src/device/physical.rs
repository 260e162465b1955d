// Copyright (c) 2024 the vkcheck developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Mirrored physical device state and queue family topology checks.

use crate::{report::Violations, ValidationError, Version};
use ash::vk;
use foldhash::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};

/// Properties of one queue family, as advertised by the driver.
#[derive(Clone, Copy, Debug)]
pub struct QueueFamilyProperties {
    pub queue_flags: vk::QueueFlags,
    pub queue_count: u32,
    pub timestamp_valid_bits: u32,
}

/// The layer's mirror of one enumerated physical device.
///
/// The capability data is immutable once the record is created. The one
/// exception is `queue_family_known_count`, which tracks how much of the
/// queue family topology the *application* has discovered so far: it grows as
/// a side effect of successful enumeration calls (recorded by
/// [`CoreValidation`](crate::core::CoreValidation)) and is not the true
/// hardware count. Several valid-usage rules are phrased against what the
/// application could know, not against the hardware.
#[derive(Debug)]
pub struct PhysicalDeviceRecord {
    api_version: Version,
    /// Queue family properties the application has fetched. May be shorter
    /// than `queue_family_known_count` if the application only queried the
    /// count and never retrieved the properties themselves.
    queue_families: Vec<QueueFamilyProperties>,
    queue_family_known_count: AtomicU32,
    /// Whether `VK_KHR_get_physical_device_properties2` is enabled on the
    /// owning instance; decides which enumeration entry points the
    /// diagnostics mention.
    khr_get_physical_device_properties2: bool,
}

impl PhysicalDeviceRecord {
    pub fn new(
        api_version: Version,
        khr_get_physical_device_properties2: bool,
        queue_families: Vec<QueueFamilyProperties>,
    ) -> Self {
        PhysicalDeviceRecord {
            api_version,
            queue_families,
            queue_family_known_count: AtomicU32::new(0),
            khr_get_physical_device_properties2,
        }
    }

    #[inline]
    pub fn api_version(&self) -> Version {
        self.api_version
    }

    #[inline]
    pub fn queue_families(&self) -> &[QueueFamilyProperties] {
        &self.queue_families
    }

    /// How many queue families the application has discovered so far.
    #[inline]
    pub fn queue_family_known_count(&self) -> u32 {
        self.queue_family_known_count.load(Ordering::Relaxed)
    }

    /// Grows the discovered queue family count. Monotonic: a later
    /// enumeration call never shrinks what the application already knows.
    pub(crate) fn discover_queue_family_count(&self, count: u32) {
        self.queue_family_known_count
            .fetch_max(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn supports_properties2(&self) -> bool {
        self.khr_get_physical_device_properties2
    }
}

/// Checks a queue family index against the family count the application has
/// discovered on this physical device.
///
/// The message names `vkGetPhysicalDeviceQueueFamilyProperties2` as well when
/// the corresponding instance extension is enabled, since the application may
/// have used either entry point.
pub(crate) fn validate_queue_family_index(
    physical_device: &PhysicalDeviceRecord,
    queue_family_index: u32,
    context: String,
    vuids: &'static [&'static str],
) -> Result<(), Box<ValidationError>> {
    let known_count = physical_device.queue_family_known_count();

    if queue_family_index >= known_count {
        let second_entry_point = if physical_device.supports_properties2() {
            " or vkGetPhysicalDeviceQueueFamilyProperties2"
        } else {
            ""
        };

        return Err(Box::new(ValidationError {
            context: context.into(),
            problem: format!(
                "(= {}) is not less than the largest queue family count ({}) previously \
                returned by vkGetPhysicalDeviceQueueFamilyProperties{}",
                queue_family_index, known_count, second_entry_point,
            )
            .into(),
            vuids,
            ..Default::default()
        }));
    }

    Ok(())
}

/// Checks an array of queue family indices used in a multi-family operation
/// against a physical device (for example concurrent-sharing family lists).
///
/// Each offending element is reported independently: duplicates, the
/// `VK_QUEUE_FAMILY_IGNORED` sentinel, and indices beyond the discovered
/// family count.
pub fn validate_physical_device_queue_families(
    physical_device: &PhysicalDeviceRecord,
    queue_family_indices: &[u32],
    array_name: &str,
    vuids: &'static [&'static str],
) -> Violations {
    let mut violations = Violations::new();
    let mut seen = HashSet::with_capacity_and_hasher(queue_family_indices.len(), Default::default());

    for (index, &queue_family_index) in queue_family_indices.iter().enumerate() {
        let context = format!("{}[{}]", array_name, index);

        if !seen.insert(queue_family_index) {
            violations.push(Box::new(ValidationError {
                context: context.clone().into(),
                problem: format!(
                    "(= {}) appears more than once in `{}`",
                    queue_family_index, array_name,
                )
                .into(),
                vuids,
                ..Default::default()
            }));
        }

        if queue_family_index == vk::QUEUE_FAMILY_IGNORED {
            violations.push(Box::new(ValidationError {
                context: context.into(),
                problem: "is `VK_QUEUE_FAMILY_IGNORED`, but an actual queue family is required"
                    .into(),
                vuids,
                ..Default::default()
            }));
            continue;
        }

        violations.check(validate_queue_family_index(
            physical_device,
            queue_family_index,
            context,
            vuids,
        ));
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(queue_count: u32) -> QueueFamilyProperties {
        QueueFamilyProperties {
            queue_flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
            queue_count,
            timestamp_valid_bits: 64,
        }
    }

    fn record_with_families(count: u32) -> PhysicalDeviceRecord {
        let record = PhysicalDeviceRecord::new(
            Version::V1_1,
            false,
            (0..count).map(|_| family(4)).collect(),
        );
        record.discover_queue_family_count(count);
        record
    }

    const VUIDS: &[&str] = &["VUID-test-families"];

    #[test]
    fn index_below_known_count_passes() {
        let record = record_with_families(3);
        assert!(
            validate_queue_family_index(&record, 2, "queue_family_index".into(), VUIDS).is_ok()
        );
    }

    #[test]
    fn index_at_known_count_fails() {
        let record = record_with_families(3);
        let err = validate_queue_family_index(&record, 3, "queue_family_index".into(), VUIDS)
            .unwrap_err();
        assert!(err
            .problem
            .contains("vkGetPhysicalDeviceQueueFamilyProperties"));
        assert!(!err
            .problem
            .contains("vkGetPhysicalDeviceQueueFamilyProperties2"));
    }

    #[test]
    fn message_names_second_entry_point_with_properties2() {
        let record = PhysicalDeviceRecord::new(Version::V1_1, true, vec![family(1)]);
        record.discover_queue_family_count(1);

        let err = validate_queue_family_index(&record, 9, "queue_family_index".into(), VUIDS)
            .unwrap_err();
        assert!(err
            .problem
            .contains("or vkGetPhysicalDeviceQueueFamilyProperties2"));
    }

    #[test]
    fn discovery_is_monotonic() {
        let record = record_with_families(4);
        record.discover_queue_family_count(2);
        assert_eq!(record.queue_family_known_count(), 4);
    }

    #[test]
    fn family_array_reports_each_problem() {
        let record = record_with_families(2);
        let violations = validate_physical_device_queue_families(
            &record,
            &[0, 0, vk::QUEUE_FAMILY_IGNORED, 7],
            "queue_family_indices",
            VUIDS,
        );

        // duplicate, sentinel, and out-of-range are all reported.
        assert_eq!(violations.len(), 3);
    }

    #[test]
    fn family_array_clean_list_passes() {
        let record = record_with_families(3);
        let violations = validate_physical_device_queue_families(
            &record,
            &[0, 1, 2],
            "queue_family_indices",
            VUIDS,
        );
        assert!(violations.is_empty());
    }
}
