// Copyright (c) 2024 the vkcheck developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Logical device creation validation and the mirrored device state.
//!
//! `vkCreateDevice` carries the densest rule set in this core: the queue
//! create info array has per-entry rules (family validity, version-dependent
//! uniqueness, global priority consistency, protected capability, queue
//! counts) and the create info as a whole has feature-exclusion and
//! device-group rules. Every rule is checked and reported independently; the
//! only gate is that an out-of-range family index suppresses the remaining
//! checks for *that entry*, because they would index capability arrays with
//! an invalid index.

use crate::{
    cache::ValidationCache,
    device::{
        physical::{validate_queue_family_index, PhysicalDeviceRecord},
        queue::{DeviceQueueCreateRecord, QueueGlobalPriority},
    },
    report::Violations,
    store::Handle,
    Requires, RequiresAllOf, RequiresOneOf, ValidationError, Version,
};
use ash::vk;
use foldhash::{HashMap, HashSet};
use parking_lot::Mutex;
use smallvec::SmallVec;

pub mod physical;
pub mod queue;

/// The subset of device features that this core's rules consult.
///
/// The full feature table runs to hundreds of entries; only the bits with
/// create-time or use-time interactions validated here are mirrored.
#[derive(Clone, Copy, Debug, Default)]
pub struct EnabledFeatures {
    pub protected_memory: bool,

    pub shading_rate_image: bool,
    pub pipeline_fragment_shading_rate: bool,
    pub primitive_fragment_shading_rate: bool,
    pub attachment_fragment_shading_rate: bool,
    pub fragment_density_map: bool,

    pub shader_image_int64_atomics: bool,
    pub sparse_image_int64_atomics: bool,
    pub shader_image_float32_atomics: bool,
    pub sparse_image_float32_atomics: bool,
    pub shader_image_float32_atomic_add: bool,
    pub sparse_image_float32_atomic_add: bool,
    pub shader_image_float32_atomic_min_max: bool,
    pub sparse_image_float32_atomic_min_max: bool,
}

/// One element of `pQueueCreateInfos`.
#[derive(Clone, Copy, Debug)]
pub struct DeviceQueueCreateInfo {
    pub flags: vk::DeviceQueueCreateFlags,
    pub queue_family_index: u32,
    pub queue_count: u32,
    /// The global priority from a chained
    /// `VkDeviceQueueGlobalPriorityCreateInfoKHR`, if any.
    pub global_priority: Option<QueueGlobalPriority>,
    pub _ne: crate::NonExhaustive,
}

impl Default for DeviceQueueCreateInfo {
    #[inline]
    fn default() -> Self {
        DeviceQueueCreateInfo {
            flags: vk::DeviceQueueCreateFlags::empty(),
            queue_family_index: 0,
            queue_count: 1,
            global_priority: None,
            _ne: crate::NonExhaustive(()),
        }
    }
}

/// The parameters of a `vkCreateDevice` call that this core validates.
#[derive(Clone, Debug)]
pub struct DeviceCreateInfo {
    /// The API version the application targets; the effective version is
    /// capped by what the physical device supports.
    pub api_version: Version,
    pub queue_create_infos: Vec<DeviceQueueCreateInfo>,
    pub enabled_features: EnabledFeatures,
    /// The physical devices from a chained `VkDeviceGroupDeviceCreateInfo`,
    /// empty when the device is not part of a group.
    pub group_physical_devices: Vec<Handle<PhysicalDeviceRecord>>,
    pub _ne: crate::NonExhaustive,
}

impl Default for DeviceCreateInfo {
    #[inline]
    fn default() -> Self {
        DeviceCreateInfo {
            api_version: Version::V1_0,
            queue_create_infos: Vec::new(),
            enabled_features: EnabledFeatures::default(),
            group_physical_devices: Vec::new(),
            _ne: crate::NonExhaustive(()),
        }
    }
}

/// The layer's mirror of one logical device.
///
/// Everything except the validation cache slot is fixed at device creation.
#[derive(Debug)]
pub struct DeviceRecord {
    physical_device: Handle<PhysicalDeviceRecord>,
    api_version: Version,
    enabled_features: EnabledFeatures,
    /// Cardinality of the device group this device was created over; 1 for
    /// a plain single-device creation.
    physical_device_count: u32,
    /// The queue family indices that appeared in `pQueueCreateInfos`.
    queue_family_index_set: HashSet<u32>,
    queue_create_records: Vec<DeviceQueueCreateRecord>,
    /// One validation cache per device. The extension permits many, but this
    /// layer only ever creates and persists a single one; see DESIGN.md.
    validation_cache: Mutex<Option<ValidationCache>>,
}

impl DeviceRecord {
    pub(crate) fn new(
        physical_device: Handle<PhysicalDeviceRecord>,
        physical_device_record: &PhysicalDeviceRecord,
        create_info: &DeviceCreateInfo,
        validation_cache: Option<ValidationCache>,
    ) -> Self {
        let queue_create_records = create_info
            .queue_create_infos
            .iter()
            .enumerate()
            .map(|(create_info_index, info)| DeviceQueueCreateRecord {
                queue_family_index: info.queue_family_index,
                flags: info.flags,
                queue_count: info.queue_count,
                create_info_index,
            })
            .collect::<Vec<_>>();

        let queue_family_index_set = queue_create_records
            .iter()
            .map(|record| record.queue_family_index)
            .collect();

        let physical_device_count = match create_info.group_physical_devices.len() {
            0 => 1,
            len => len as u32,
        };

        DeviceRecord {
            physical_device,
            api_version: create_info
                .api_version
                .min(physical_device_record.api_version()),
            enabled_features: create_info.enabled_features,
            physical_device_count,
            queue_family_index_set,
            queue_create_records,
            validation_cache: Mutex::new(validation_cache),
        }
    }

    #[inline]
    pub fn physical_device(&self) -> Handle<PhysicalDeviceRecord> {
        self.physical_device
    }

    #[inline]
    pub fn api_version(&self) -> Version {
        self.api_version
    }

    #[inline]
    pub fn enabled_features(&self) -> &EnabledFeatures {
        &self.enabled_features
    }

    #[inline]
    pub fn physical_device_count(&self) -> u32 {
        self.physical_device_count
    }

    #[inline]
    pub fn queue_create_records(&self) -> &[DeviceQueueCreateRecord] {
        &self.queue_create_records
    }

    pub fn created_queue_family(&self, queue_family_index: u32) -> bool {
        self.queue_family_index_set.contains(&queue_family_index)
    }

    /// Runs `f` with the device's validation cache, if one exists.
    pub fn with_validation_cache<R>(&self, f: impl FnOnce(&ValidationCache) -> R) -> Option<R> {
        self.validation_cache.lock().as_ref().map(f)
    }

    pub(crate) fn take_validation_cache(&self) -> Option<ValidationCache> {
        self.validation_cache.lock().take()
    }
}

/// Checks a queue family index against the families the device was actually
/// created with.
///
/// `optional` marks parameters where `VK_QUEUE_FAMILY_IGNORED` is
/// a documented "don't care" value.
pub(crate) fn validate_device_queue_family(
    device: &DeviceRecord,
    queue_family_index: u32,
    context: String,
    vuids: &'static [&'static str],
    optional: bool,
) -> Result<(), Box<ValidationError>> {
    if queue_family_index == vk::QUEUE_FAMILY_IGNORED {
        if optional {
            return Ok(());
        }

        return Err(Box::new(ValidationError {
            context: context.into(),
            problem: "is `VK_QUEUE_FAMILY_IGNORED`, but this parameter must name one of the \
                queue families the device was created with"
                .into(),
            vuids,
            ..Default::default()
        }));
    }

    if !device.created_queue_family(queue_family_index) {
        return Err(Box::new(ValidationError {
            context: context.into(),
            problem: format!(
                "(= {}) is not one of the queue families provided in \
                `pCreateInfo->pQueueCreateInfos` when the device was created",
                queue_family_index,
            )
            .into(),
            vuids,
            ..Default::default()
        }));
    }

    Ok(())
}

struct QueueFamilyUse {
    create_info_index: usize,
    protected: bool,
    global_priority: QueueGlobalPriority,
}

/// Validates the `pQueueCreateInfos` array of a `vkCreateDevice` call.
///
/// `api_version` is the effective version the device would be created with;
/// the uniqueness rule depends on it.
pub(crate) fn validate_device_queue_create_infos(
    physical_device: &PhysicalDeviceRecord,
    api_version: Version,
    queue_create_infos: &[DeviceQueueCreateInfo],
) -> Violations {
    let mut violations = Violations::new();
    let mut family_uses: HashMap<u32, SmallVec<[QueueFamilyUse; 2]>> = HashMap::default();

    for (index, info) in queue_create_infos.iter().enumerate() {
        let entry_context = format!("create_info.queue_create_infos[{}]", index);
        let queue_family_index = info.queue_family_index;

        // An out-of-range family index cannot be used to index the
        // capability arrays, so the remaining checks are skipped for this
        // entry only. Later entries are still processed.
        if let Err(error) = validate_queue_family_index(
            physical_device,
            queue_family_index,
            format!("{}.queue_family_index", entry_context),
            &["VUID-VkDeviceQueueCreateInfo-queueFamilyIndex-00381"],
        ) {
            violations.push(error);
            continue;
        }

        let protected = info.flags.contains(vk::DeviceQueueCreateFlags::PROTECTED);
        let global_priority = info.global_priority.unwrap_or_default();
        let prior_uses = family_uses.entry(queue_family_index).or_default();

        if api_version < Version::V1_1 {
            if let Some(prior) = prior_uses.first() {
                violations.push(Box::new(ValidationError {
                    context: format!("{}.queue_family_index", entry_context).into(),
                    problem: format!(
                        "(= {}) was also used in `create_info.queue_create_infos[{}]`; before \
                        Vulkan 1.1 a queue family may appear in at most one element",
                        queue_family_index, prior.create_info_index,
                    )
                    .into(),
                    vuids: &["VUID-VkDeviceCreateInfo-queueFamilyIndex-00372"],
                    ..Default::default()
                }));
            }
        } else {
            match prior_uses.as_slice() {
                [] => (),
                [prior] if prior.protected != protected => (),
                [prior] => {
                    violations.push(Box::new(ValidationError {
                        context: format!("{}.queue_family_index", entry_context).into(),
                        problem: format!(
                            "(= {}) was also used in `create_info.queue_create_infos[{}]` with \
                            the same protected capability; two elements may share a queue \
                            family only when exactly one of them sets \
                            `VK_DEVICE_QUEUE_CREATE_PROTECTED_BIT`",
                            queue_family_index, prior.create_info_index,
                        )
                        .into(),
                        vuids: &["VUID-VkDeviceCreateInfo-queueFamilyIndex-02802"],
                        ..Default::default()
                    }));
                }
                _ => {
                    violations.push(Box::new(ValidationError {
                        context: format!("{}.queue_family_index", entry_context).into(),
                        problem: format!(
                            "(= {}) appears in more than two elements of \
                            `create_info.queue_create_infos`",
                            queue_family_index,
                        )
                        .into(),
                        vuids: &["VUID-VkDeviceCreateInfo-queueFamilyIndex-02802"],
                        ..Default::default()
                    }));
                }
            }
        }

        if let Some(prior) = prior_uses.first() {
            if prior.global_priority != global_priority {
                violations.push(Box::new(ValidationError {
                    context: format!("{}.global_priority", entry_context).into(),
                    problem: format!(
                        "(= {:?}) does not match the global priority (= {:?}) specified for \
                        queue family {} in `create_info.queue_create_infos[{}]`; all queues \
                        created for one family must share a global priority",
                        global_priority,
                        prior.global_priority,
                        queue_family_index,
                        prior.create_info_index,
                    )
                    .into(),
                    vuids: &["VUID-VkDeviceCreateInfo-pQueueCreateInfos-06654"],
                    ..Default::default()
                }));
            }
        }

        let family_properties = physical_device
            .queue_families()
            .get(queue_family_index as usize);

        if protected {
            if let Some(properties) = family_properties {
                if !properties.queue_flags.contains(vk::QueueFlags::PROTECTED) {
                    violations.push(Box::new(ValidationError {
                        context: format!("{}.flags", entry_context).into(),
                        problem: format!(
                            "contains `VK_DEVICE_QUEUE_CREATE_PROTECTED_BIT`, but queue family \
                            {} does not advertise `VK_QUEUE_PROTECTED_BIT`",
                            queue_family_index,
                        )
                        .into(),
                        vuids: &["VUID-VkDeviceQueueCreateInfo-flags-06449"],
                        ..Default::default()
                    }));
                }
            }
        }

        match family_properties {
            Some(properties) => {
                if info.queue_count > properties.queue_count {
                    violations.push(Box::new(ValidationError {
                        context: format!("{}.queue_count", entry_context).into(),
                        problem: format!(
                            "(= {}) is greater than the number of queues (= {}) advertised for \
                            queue family {}",
                            info.queue_count, properties.queue_count, queue_family_index,
                        )
                        .into(),
                        vuids: &["VUID-VkDeviceQueueCreateInfo-queueCount-00382"],
                        ..Default::default()
                    }));
                }
            }
            None => {
                // The count was discovered but the properties themselves were
                // never fetched. The specification only guarantees one queue
                // per family, so anything above that is the same failure with
                // different wording.
                if info.queue_count > 1 {
                    violations.push(Box::new(ValidationError {
                        context: format!("{}.queue_count", entry_context).into(),
                        problem: format!(
                            "(= {}) is greater than 1, but the properties of queue family {} \
                            were never obtained with \
                            vkGetPhysicalDeviceQueueFamilyProperties, and the specification \
                            only guarantees a single queue per family",
                            info.queue_count, queue_family_index,
                        )
                        .into(),
                        vuids: &["VUID-VkDeviceQueueCreateInfo-queueCount-00382"],
                        ..Default::default()
                    }));
                }
            }
        }

        prior_uses.push(QueueFamilyUse {
            create_info_index: index,
            protected,
            global_priority,
        });
    }

    violations
}

struct FeatureExclusion {
    first: &'static str,
    second: &'static str,
    vuids: &'static [&'static str],
}

fn feature_exclusions(features: &EnabledFeatures) -> impl Iterator<Item = FeatureExclusion> {
    let &EnabledFeatures {
        shading_rate_image,
        pipeline_fragment_shading_rate,
        primitive_fragment_shading_rate,
        attachment_fragment_shading_rate,
        fragment_density_map,
        ..
    } = features;

    // The shading-rate-image, fragment-shading-rate and fragment-density-map
    // extension families overlap in functionality; each pairing is rejected
    // individually so the caller sees every conflicting combination.
    let table = [
        (
            shading_rate_image && pipeline_fragment_shading_rate,
            "shadingRateImage",
            "pipelineFragmentShadingRate",
            &["VUID-VkDeviceCreateInfo-shadingRateImage-04478"] as &'static [&'static str],
        ),
        (
            shading_rate_image && primitive_fragment_shading_rate,
            "shadingRateImage",
            "primitiveFragmentShadingRate",
            &["VUID-VkDeviceCreateInfo-shadingRateImage-04479"],
        ),
        (
            shading_rate_image && attachment_fragment_shading_rate,
            "shadingRateImage",
            "attachmentFragmentShadingRate",
            &["VUID-VkDeviceCreateInfo-shadingRateImage-04480"],
        ),
        (
            fragment_density_map && pipeline_fragment_shading_rate,
            "fragmentDensityMap",
            "pipelineFragmentShadingRate",
            &["VUID-VkDeviceCreateInfo-fragmentDensityMap-04481"],
        ),
        (
            fragment_density_map && primitive_fragment_shading_rate,
            "fragmentDensityMap",
            "primitiveFragmentShadingRate",
            &["VUID-VkDeviceCreateInfo-fragmentDensityMap-04482"],
        ),
        (
            fragment_density_map && attachment_fragment_shading_rate,
            "fragmentDensityMap",
            "attachmentFragmentShadingRate",
            &["VUID-VkDeviceCreateInfo-fragmentDensityMap-04483"],
        ),
    ];

    table
        .into_iter()
        .filter(|&(conflicts, ..)| conflicts)
        .map(|(_, first, second, vuids)| FeatureExclusion {
            first,
            second,
            vuids,
        })
}

struct SparseFeatureDependency {
    sparse: &'static str,
    required: &'static str,
    requires_one_of: RequiresOneOf,
    vuids: &'static [&'static str],
}

fn sparse_feature_dependencies(
    features: &EnabledFeatures,
) -> impl Iterator<Item = SparseFeatureDependency> {
    let &EnabledFeatures {
        shader_image_int64_atomics,
        sparse_image_int64_atomics,
        shader_image_float32_atomics,
        sparse_image_float32_atomics,
        shader_image_float32_atomic_add,
        sparse_image_float32_atomic_add,
        shader_image_float32_atomic_min_max,
        sparse_image_float32_atomic_min_max,
        ..
    } = features;

    let table = [
        (
            sparse_image_int64_atomics && !shader_image_int64_atomics,
            "sparseImageInt64Atomics",
            "shaderImageInt64Atomics",
            RequiresOneOf(&[RequiresAllOf(&[Requires::DeviceFeature(
                "shaderImageInt64Atomics",
            )])]),
            &["VUID-VkDeviceCreateInfo-None-04896"] as &'static [&'static str],
        ),
        (
            sparse_image_float32_atomics && !shader_image_float32_atomics,
            "sparseImageFloat32Atomics",
            "shaderImageFloat32Atomics",
            RequiresOneOf(&[RequiresAllOf(&[Requires::DeviceFeature(
                "shaderImageFloat32Atomics",
            )])]),
            &["VUID-VkDeviceCreateInfo-None-04897"],
        ),
        (
            sparse_image_float32_atomic_add && !shader_image_float32_atomic_add,
            "sparseImageFloat32AtomicAdd",
            "shaderImageFloat32AtomicAdd",
            RequiresOneOf(&[RequiresAllOf(&[Requires::DeviceFeature(
                "shaderImageFloat32AtomicAdd",
            )])]),
            &["VUID-VkDeviceCreateInfo-None-04898"],
        ),
        (
            sparse_image_float32_atomic_min_max && !shader_image_float32_atomic_min_max,
            "sparseImageFloat32AtomicMinMax",
            "shaderImageFloat32AtomicMinMax",
            RequiresOneOf(&[RequiresAllOf(&[Requires::DeviceFeature(
                "shaderImageFloat32AtomicMinMax",
            )])]),
            &["VUID-VkDeviceCreateInfo-sparseImageFloat32AtomicMinMax-04975"],
        ),
    ];

    table
        .into_iter()
        .filter(|&(broken, ..)| broken)
        .map(
            |(_, sparse, required, requires_one_of, vuids)| SparseFeatureDependency {
                sparse,
                required,
                requires_one_of,
                vuids,
            },
        )
}

/// Validates a `vkCreateDevice` call.
///
/// All violations are aggregated; the call itself is never blocked here
/// (whether a violation suppresses forwarding is the dispatch layer's
/// policy).
pub(crate) fn validate_create_device(
    physical_device: &PhysicalDeviceRecord,
    create_info: &DeviceCreateInfo,
) -> Violations {
    let mut violations = Violations::new();
    let api_version = create_info
        .api_version
        .min(physical_device.api_version());

    violations.append(validate_device_queue_create_infos(
        physical_device,
        api_version,
        &create_info.queue_create_infos,
    ));

    for exclusion in feature_exclusions(&create_info.enabled_features) {
        violations.push(Box::new(ValidationError {
            context: "create_info.enabled_features".into(),
            problem: format!(
                "the `{}` and `{}` features are both enabled, but they are mutually exclusive",
                exclusion.first, exclusion.second,
            )
            .into(),
            vuids: exclusion.vuids,
            ..Default::default()
        }));
    }

    for dependency in sparse_feature_dependencies(&create_info.enabled_features) {
        violations.push(Box::new(ValidationError {
            context: "create_info.enabled_features".into(),
            problem: format!(
                "`{}` is enabled, but `{}` is not",
                dependency.sparse, dependency.required,
            )
            .into(),
            requires_one_of: dependency.requires_one_of,
            vuids: dependency.vuids,
            ..Default::default()
        }));
    }

    // Device groups are small (bounded by hardware topology), so the O(n^2)
    // pairwise scan is fine.
    let group = &create_info.group_physical_devices;
    for (second, &handle) in group.iter().enumerate() {
        for (first, &earlier) in group[..second].iter().enumerate() {
            if handle == earlier {
                violations.push(Box::new(ValidationError {
                    context: format!("create_info.group_physical_devices[{}]", second).into(),
                    problem: format!(
                        "is the same physical device as element [{}]; every element of a \
                        device group must be unique",
                        first,
                    )
                    .into(),
                    vuids: &["VUID-VkDeviceGroupDeviceCreateInfo-pPhysicalDevices-00375"],
                    ..Default::default()
                }));
            }
        }
    }

    violations
}
