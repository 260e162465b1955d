// Copyright (c) 2024 the vkcheck developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Layer configuration.
//!
//! Settings are fixed once at layer initialization; the validators only read
//! them. The defaults make the layer purely observational: violations are
//! reported and the call is still forwarded to the driver.

use std::{env, path::PathBuf};

/// Configuration for the validation core.
#[derive(Clone, Debug, Default)]
pub struct ValidationSettings {
    /// Whether a detected violation should suppress forwarding the call to
    /// the native implementation. Off by default.
    pub fail_on_error: bool,

    /// Whether the persisted validation cache is disabled. When set, no
    /// cache is created at device creation and nothing is written back at
    /// device destruction.
    pub disable_cache: bool,

    /// Overrides the platform cache directory resolution for the validation
    /// cache file.
    pub cache_dir: Option<PathBuf>,
}

impl ValidationSettings {
    /// Reads settings from the environment.
    ///
    /// Recognized variables: `VKCHECK_FAIL_ON_ERROR`, `VKCHECK_DISABLE_CACHE`
    /// (both truthy on `1`/`true`/`on`), and `VKCHECK_CACHE_DIR`.
    pub fn from_env() -> Self {
        ValidationSettings {
            fail_on_error: env_flag("VKCHECK_FAIL_ON_ERROR"),
            disable_cache: env_flag("VKCHECK_DISABLE_CACHE"),
            cache_dir: env::var_os("VKCHECK_CACHE_DIR")
                .filter(|value| !value.is_empty())
                .map(PathBuf::from),
        }
    }
}

fn env_flag(name: &str) -> bool {
    match env::var(name) {
        Ok(value) => {
            let value = value.trim().to_ascii_lowercase();
            matches!(value.as_str(), "1" | "true" | "on" | "yes")
        }
        Err(_) => false,
    }
}
