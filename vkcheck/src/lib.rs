// Copyright (c) 2024 the vkcheck developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Validation core for a Vulkan interposition layer.
//!
//! This crate implements the device, queue and command-buffer state tracking
//! and precondition checking that sits between an application and a Vulkan
//! implementation. It never modifies a call's parameters and never recovers
//! from invalid usage: every entry point is checked against the documented
//! valid-usage rules, violations are reported through the [`log`] facade with
//! their VUIDs, and the call is forwarded to the driver unless the layer is
//! configured to block on error.
//!
//! The pieces fit together as follows:
//!
//! - [`CoreValidation`](crate::core::CoreValidation) is the surface the
//!   generated dispatch layer talks to. For every intercepted entry point it
//!   exposes a `pre_call_validate_*` function returning the "skip" boolean,
//!   and for state-affecting entry points a `record_*` hook that updates the
//!   mirrored state.
//! - [`store`] holds the mirrored state objects behind stable
//!   generation-checked handles, so resolving a stale handle is a total,
//!   panic-free operation.
//! - The `device`, `command_pool` and `device_group` modules contain the
//!   actual rule sets; each rule is a function returning
//!   `Result<(), Box<ValidationError>>` and independent rules never
//!   short-circuit one another.
//! - [`cache`] implements the persisted validation cache, an opaque blob that
//!   lets repeat runs skip work that was already validated.

pub use crate::version::Version;
use std::{borrow::Cow, error::Error, fmt};

pub mod cache;
pub mod command_buffer;
pub mod command_pool;
pub mod core;
pub mod device;
pub mod device_group;
pub mod image_format;
pub mod report;
pub mod settings;
pub mod store;
mod version;

/// The arguments or other context of a call did not meet the requirements of
/// the Vulkan specification.
///
/// Every check in this crate produces one of these. The `vuids` field ties
/// the failure back to the specification clauses that were violated, and
/// `requires_one_of` carries the version/extension/feature gates for rules
/// that only apply conditionally.
#[derive(Clone, Debug, Default)]
pub struct ValidationError {
    /// The context in which the problem exists, usually a parameter path
    /// such as `create_info.queue_create_infos[2].queue_count`.
    pub context: Cow<'static, str>,

    /// A description of the problem.
    pub problem: Cow<'static, str>,

    /// If applicable, the requirements that the caller failed to meet;
    /// at least one of the listed alternatives must be satisfied.
    pub requires_one_of: RequiresOneOf,

    /// The valid-usage IDs of the Vulkan specification that this failure
    /// corresponds to.
    pub vuids: &'static [&'static str],
}

impl ValidationError {
    /// Prepends an element to `context`.
    pub fn add_context(mut self: Box<Self>, context: impl Into<Cow<'static, str>>) -> Box<Self> {
        let context = context.into();

        self.context = if self.context.is_empty() {
            context
        } else if self.context.starts_with('[') {
            format!("{}{}", context, self.context).into()
        } else {
            format!("{}.{}", context, self.context).into()
        };

        self
    }

    /// Replaces the VUIDs of the error with the given ones.
    pub fn set_vuids(mut self: Box<Self>, vuids: &'static [&'static str]) -> Box<Self> {
        self.vuids = vuids;
        self
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }

        write!(f, "{}", self.problem)?;

        if !self.requires_one_of.0.is_empty() {
            if self.problem.is_empty() {
                write!(f, "{}", self.requires_one_of)?;
            } else {
                write!(f, " -- {}", self.requires_one_of)?;
            }
        }

        if !self.vuids.is_empty() {
            write!(f, " (Vulkan VUIDs: ")?;
            let mut first = true;

            for vuid in self.vuids {
                if first {
                    first = false;
                } else {
                    write!(f, ", ")?;
                }

                write!(f, "{}", vuid)?;
            }

            write!(f, ")")?;
        }

        Ok(())
    }
}

impl Error for ValidationError {}

/// Used in errors to indicate a set of alternatives that needs to be
/// available/enabled to allow a given operation. At least one of the
/// alternatives must be satisfied.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RequiresOneOf(pub &'static [RequiresAllOf]);

impl fmt::Display for RequiresOneOf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "requires one of: ")?;
        let mut first = true;

        for requires_all_of in self.0 {
            if first {
                first = false;
            } else {
                write!(f, " or ")?;
            }

            write!(f, "{}", requires_all_of)?;
        }

        Ok(())
    }
}

/// Used in errors to indicate a set of requirements that all need to be
/// available/enabled to allow a given operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequiresAllOf(pub &'static [Requires]);

impl fmt::Display for RequiresAllOf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;

        for requires in self.0 {
            if first {
                first = false;
            } else {
                write!(f, " + ")?;
            }

            write!(f, "{}", requires)?;
        }

        Ok(())
    }
}

/// Something that needs to be supported or enabled to allow a particular
/// operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Requires {
    APIVersion(Version),
    DeviceFeature(&'static str),
    DeviceExtension(&'static str),
    InstanceExtension(&'static str),
}

impl fmt::Display for Requires {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Requires::APIVersion(Version { major, minor, .. }) => {
                write!(f, "Vulkan API version {}.{}", major, minor)
            }
            Requires::DeviceFeature(device_feature) => {
                write!(f, "device feature `{}`", device_feature)
            }
            Requires::DeviceExtension(device_extension) => {
                write!(f, "device extension `{}`", device_extension)
            }
            Requires::InstanceExtension(instance_extension) => {
                write!(f, "instance extension `{}`", instance_extension)
            }
        }
    }
}

/// A native query that the validation core depends on failed unexpectedly.
///
/// The validators never assume a query can fail for inputs they are about to
/// validate themselves; when one does, the layer degrades to "cannot confirm
/// validity" instead of crashing, and the raw result code is carried here for
/// diagnosability.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnexpectedVulkanError(pub ash::vk::Result);

impl fmt::Display for UnexpectedVulkanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unexpected Vulkan result {:?}", self.0)
    }
}

impl Error for UnexpectedVulkanError {}

/// A helper type for non-exhaustive structs.
///
/// This type cannot be constructed outside this crate. Structures with a
/// field of this type can only be constructed by calling a constructor
/// function or `Default::default()`. The effect is similar to the standard
/// Rust `#[non_exhaustive]` attribute, except that it does not prevent update
/// syntax from being used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NonExhaustive(pub(crate) ());
