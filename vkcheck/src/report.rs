// Copyright (c) 2024 the vkcheck developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Violation collection and reporting.
//!
//! A single intercepted call can break several independent rules, and the
//! caller deserves to hear about all of them at once. Checks therefore never
//! short-circuit each other: each rule is a function returning
//! `Result<(), Box<ValidationError>>`, and a [`Violations`] value folds the
//! results together. The classic layer "skip" boolean is simply
//! `!violations.is_empty()`, filtered through the configured policy.

use crate::{settings::ValidationSettings, ValidationError};
use smallvec::SmallVec;
use std::fmt;

/// The violations found while validating one intercepted call.
#[derive(Default)]
pub struct Violations {
    errors: SmallVec<[Box<ValidationError>; 4]>,
}

impl Violations {
    #[inline]
    pub fn new() -> Self {
        Violations {
            errors: SmallVec::new(),
        }
    }

    /// Records a violation.
    #[inline]
    pub fn push(&mut self, error: Box<ValidationError>) {
        self.errors.push(error);
    }

    /// Folds the outcome of one independent check into the collection.
    #[inline]
    pub fn check(&mut self, result: Result<(), Box<ValidationError>>) {
        if let Err(error) = result {
            self.errors.push(error);
        }
    }

    /// Absorbs all violations from another collection.
    pub fn append(&mut self, mut other: Violations) {
        self.errors.append(&mut other.errors);
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidationError> {
        self.errors.iter().map(|error| error.as_ref())
    }

    /// Returns whether any recorded violation carries the given VUID.
    pub fn contains_vuid(&self, vuid: &str) -> bool {
        self.iter().any(|error| error.vuids.contains(&vuid))
    }

    /// Reports every collected violation through the logging facade.
    ///
    /// `command` is the name of the intercepted entry point, e.g.
    /// `vkCreateDevice`.
    pub fn emit(&self, command: &str) {
        for error in self.iter() {
            log::error!(target: "vkcheck", "{}: {}", command, error);
        }
    }

    /// Whether the dispatch layer should suppress forwarding the call.
    ///
    /// By default the layer is observational: it reports and still forwards.
    /// Only when configured to fail on error does a violation block the call.
    #[inline]
    pub fn should_skip(&self, settings: &ValidationSettings) -> bool {
        settings.fail_on_error && !self.errors.is_empty()
    }
}

impl fmt::Debug for Violations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl FromIterator<Box<ValidationError>> for Violations {
    fn from_iter<I: IntoIterator<Item = Box<ValidationError>>>(iter: I) -> Self {
        Violations {
            errors: iter.into_iter().collect(),
        }
    }
}
