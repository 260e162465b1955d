// Copyright (c) 2024 the vkcheck developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Device mask checks for device groups.
//!
//! A device mask selects a subset of the physical devices a logical device
//! was created over. Four laws govern any mask: it stays within the group's
//! cardinality, it is non-zero, it is a subset of the command buffer's
//! initial mask, and inside a render pass it is a subset of the render pass
//! mask as well. The laws are independent; a mask failing several of them
//! produces several violations.

use crate::{command_buffer::CommandBufferRecord, report::Violations, ValidationError};

pub(crate) fn validate_device_mask_range(
    device_mask: u32,
    physical_device_count: u32,
    context: &str,
    vuids: &'static [&'static str],
) -> Result<(), Box<ValidationError>> {
    // u64 arithmetic so a group of 32 devices does not overflow the shift.
    if u64::from(device_mask) >= 1u64 << physical_device_count {
        return Err(Box::new(ValidationError {
            context: context.to_owned().into(),
            problem: format!(
                "(= {:#06x}) has bits set beyond the number of physical devices (= {}) the \
                logical device was created with",
                device_mask, physical_device_count,
            )
            .into(),
            vuids,
            ..Default::default()
        }));
    }

    Ok(())
}

pub(crate) fn validate_device_mask_nonzero(
    device_mask: u32,
    context: &str,
    vuids: &'static [&'static str],
) -> Result<(), Box<ValidationError>> {
    if device_mask == 0 {
        return Err(Box::new(ValidationError {
            context: context.to_owned().into(),
            problem: "is zero, but a device mask must select at least one physical device".into(),
            vuids,
            ..Default::default()
        }));
    }

    Ok(())
}

pub(crate) fn validate_device_mask_command_buffer_subset(
    device_mask: u32,
    initial_device_mask: u32,
    context: &str,
    vuids: &'static [&'static str],
) -> Result<(), Box<ValidationError>> {
    if device_mask & initial_device_mask != device_mask {
        return Err(Box::new(ValidationError {
            context: context.to_owned().into(),
            problem: format!(
                "(= {:#06x}) is not a subset of the device mask (= {:#06x}) the command \
                buffer was begun with",
                device_mask, initial_device_mask,
            )
            .into(),
            vuids,
            ..Default::default()
        }));
    }

    Ok(())
}

pub(crate) fn validate_device_mask_render_pass_subset(
    device_mask: u32,
    render_pass_device_mask: u32,
    context: &str,
    vuids: &'static [&'static str],
) -> Result<(), Box<ValidationError>> {
    if device_mask & render_pass_device_mask != device_mask {
        return Err(Box::new(ValidationError {
            context: context.to_owned().into(),
            problem: format!(
                "(= {:#06x}) is not a subset of the device mask (= {:#06x}) of the active \
                render pass instance",
                device_mask, render_pass_device_mask,
            )
            .into(),
            vuids,
            ..Default::default()
        }));
    }

    Ok(())
}

/// Validates a `vkCmdSetDeviceMask` call.
///
/// Every applicable law is evaluated; none gates another, so one call can
/// surface up to four violations at once.
pub(crate) fn validate_cmd_set_device_mask(
    command_buffer: &CommandBufferRecord,
    device_mask: u32,
    physical_device_count: u32,
) -> Violations {
    let mut violations = Violations::new();

    violations.check(validate_device_mask_range(
        device_mask,
        physical_device_count,
        "device_mask",
        &["VUID-vkCmdSetDeviceMask-deviceMask-00108"],
    ));

    violations.check(validate_device_mask_nonzero(
        device_mask,
        "device_mask",
        &["VUID-vkCmdSetDeviceMask-deviceMask-00109"],
    ));

    violations.check(validate_device_mask_command_buffer_subset(
        device_mask,
        command_buffer.initial_device_mask(),
        "device_mask",
        &["VUID-vkCmdSetDeviceMask-deviceMask-00110"],
    ));

    if let Some(render_pass_device_mask) = command_buffer.render_pass_device_mask() {
        violations.check(validate_device_mask_render_pass_subset(
            device_mask,
            render_pass_device_mask,
            "device_mask",
            &["VUID-vkCmdSetDeviceMask-deviceMask-00111"],
        ));
    }

    violations
}
