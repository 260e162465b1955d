// Copyright (c) 2024 the vkcheck developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Image format capability queries.
//!
//! Validators that need image capability data go through one helper instead
//! of choosing between the two native entry points themselves: images with
//! DRM format modifier tiling can only be queried through the extensible
//! `vkGetPhysicalDeviceImageFormatProperties2` chain, everything else uses
//! the legacy entry point. The native query is expected to succeed for any
//! parameters the caller is about to validate; a non-success result is an
//! internal inconsistency, reported with the full parameter set so the
//! offending combination can be reconstructed from the log.

use crate::{UnexpectedVulkanError, ValidationError};
use ash::vk;

/// The tiling of an image, as far as query-path selection is concerned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageTiling {
    Optimal,
    Linear,
    /// Tiling defined by a DRM format modifier; requires the "2" query path.
    DrmFormatModifier,
}

/// The creation parameters identifying one image capability query.
#[derive(Clone, Copy, Debug)]
pub struct ImageFormatInfo {
    pub format: vk::Format,
    pub image_type: vk::ImageType,
    pub tiling: ImageTiling,
    pub usage: vk::ImageUsageFlags,
    pub flags: vk::ImageCreateFlags,
    pub _ne: crate::NonExhaustive,
}

impl Default for ImageFormatInfo {
    #[inline]
    fn default() -> Self {
        ImageFormatInfo {
            format: vk::Format::UNDEFINED,
            image_type: vk::ImageType::TYPE_2D,
            tiling: ImageTiling::Optimal,
            usage: vk::ImageUsageFlags::empty(),
            flags: vk::ImageCreateFlags::empty(),
            _ne: crate::NonExhaustive(()),
        }
    }
}

/// The capability data a format query yields.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImageFormatProperties {
    pub max_extent: [u32; 3],
    pub max_mip_levels: u32,
    pub max_array_layers: u32,
    pub sample_counts: u32,
    pub max_resource_size: u64,
}

/// The seam over the two native image format query entry points.
///
/// Implemented by the dispatch layer over the real driver calls; tests
/// substitute a table-driven fake.
pub trait ImageFormatQuery {
    /// `vkGetPhysicalDeviceImageFormatProperties`.
    fn query_legacy(
        &self,
        image_format_info: &ImageFormatInfo,
    ) -> Result<ImageFormatProperties, vk::Result>;

    /// `vkGetPhysicalDeviceImageFormatProperties2` with the extensible
    /// input/output chain.
    fn query_chained(
        &self,
        image_format_info: &ImageFormatInfo,
    ) -> Result<ImageFormatProperties, vk::Result>;
}

/// Queries the capabilities for an image about to be validated.
///
/// DRM-format-modifier tiling selects the chained path; everything else goes
/// through the legacy entry point.
pub fn query_image_format_properties(
    query: &dyn ImageFormatQuery,
    image_format_info: &ImageFormatInfo,
) -> Result<ImageFormatProperties, Box<ValidationError>> {
    let result = match image_format_info.tiling {
        ImageTiling::DrmFormatModifier => query.query_chained(image_format_info),
        ImageTiling::Optimal | ImageTiling::Linear => query.query_legacy(image_format_info),
    };

    result.map_err(|code| {
        Box::new(ValidationError {
            context: "image_format_info".into(),
            problem: format!(
                "the image format properties query failed ({}) for format \
                {:?}, type {:?}, tiling {:?}, usage {:?}, flags {:?}; validity of the image \
                parameters cannot be confirmed",
                UnexpectedVulkanError(code),
                image_format_info.format,
                image_format_info.image_type,
                image_format_info.tiling,
                image_format_info.usage,
                image_format_info.flags,
            )
            .into(),
            ..Default::default()
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A fake driver answering from a fixed table and recording which path
    /// was taken.
    struct FakeQuery {
        legacy_result: Result<ImageFormatProperties, vk::Result>,
        chained_result: Result<ImageFormatProperties, vk::Result>,
    }

    impl FakeQuery {
        fn succeeding() -> Self {
            FakeQuery {
                legacy_result: Ok(ImageFormatProperties {
                    max_extent: [4096, 4096, 1],
                    max_mip_levels: 13,
                    max_array_layers: 2048,
                    sample_counts: 0b1,
                    max_resource_size: 1 << 31,
                }),
                chained_result: Ok(ImageFormatProperties {
                    max_extent: [2048, 2048, 1],
                    max_mip_levels: 12,
                    max_array_layers: 1,
                    sample_counts: 0b1,
                    max_resource_size: 1 << 30,
                }),
            }
        }
    }

    impl ImageFormatQuery for FakeQuery {
        fn query_legacy(
            &self,
            _: &ImageFormatInfo,
        ) -> Result<ImageFormatProperties, vk::Result> {
            self.legacy_result
        }

        fn query_chained(
            &self,
            _: &ImageFormatInfo,
        ) -> Result<ImageFormatProperties, vk::Result> {
            self.chained_result
        }
    }

    #[test]
    fn legacy_path_for_optimal_and_linear_tiling() {
        let query = FakeQuery::succeeding();

        for tiling in [ImageTiling::Optimal, ImageTiling::Linear] {
            let properties = query_image_format_properties(
                &query,
                &ImageFormatInfo {
                    format: vk::Format::R8G8B8A8_UNORM,
                    tiling,
                    ..Default::default()
                },
            )
            .unwrap();
            assert_eq!(properties.max_extent, [4096, 4096, 1]);
        }
    }

    #[test]
    fn chained_path_for_drm_modifier_tiling() {
        let query = FakeQuery::succeeding();

        let properties = query_image_format_properties(
            &query,
            &ImageFormatInfo {
                format: vk::Format::R8G8B8A8_UNORM,
                tiling: ImageTiling::DrmFormatModifier,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(properties.max_extent, [2048, 2048, 1]);
    }

    #[test]
    fn failed_query_reports_full_parameter_set() {
        let query = FakeQuery {
            legacy_result: Err(vk::Result::ERROR_FORMAT_NOT_SUPPORTED),
            ..FakeQuery::succeeding()
        };

        let error = query_image_format_properties(
            &query,
            &ImageFormatInfo {
                format: vk::Format::D32_SFLOAT,
                image_type: vk::ImageType::TYPE_3D,
                usage: vk::ImageUsageFlags::SAMPLED,
                ..Default::default()
            },
        )
        .unwrap_err();

        let text = error.to_string();
        assert!(text.contains("ERROR_FORMAT_NOT_SUPPORTED"));
        assert!(text.contains("D32_SFLOAT"));
        assert!(text.contains("TYPE_3D"));
    }
}
