// Copyright (c) 2024 the vkcheck developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The persisted validation cache.
//!
//! The cache is an opaque blob of hashed entries, letting repeat runs skip
//! validation work that already passed. It is loaded from a per-user file
//! when a device is created and written back when the device is destroyed.
//! Caching is a performance aid, not a correctness requirement: every I/O or
//! format problem downgrades to an informational report and an empty cache,
//! and never blocks the device lifecycle.
//!
//! On-disk layout, all little-endian: a 24-byte header (header size, format
//! version, build UUID) followed by tightly packed `u64` entry hashes in
//! ascending order. Sorting makes the serialization a pure function of the
//! entry set, so write/read/write round trips are byte-identical. A header
//! from a different build or format version is detected by the UUID/version
//! fields and the initial data is discarded rather than misread.

use crate::{settings::ValidationSettings, ValidationError};
use bytemuck::{Pod, Zeroable};
use parking_lot::RwLock;
use std::{
    collections::BTreeSet,
    env, fs, io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

const CACHE_HEADER_SIZE: u32 = 24;
const CACHE_FORMAT_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
struct CacheHeader {
    header_size: u32,
    version: u32,
    uuid: [u8; 16],
}

/// The UUID identifying this build's cache format. Derived from the crate
/// version, so caches written by other builds are discarded on load.
fn build_uuid() -> [u8; 16] {
    let mut uuid = [0u8; 16];
    let version = env!("CARGO_PKG_VERSION").as_bytes();

    for (slot, &byte) in uuid.iter_mut().zip(version.iter()) {
        *slot = byte;
    }

    uuid
}

static NEXT_CACHE_ID: AtomicU64 = AtomicU64::new(1);

/// Parameters for creating a validation cache.
#[derive(Clone, Debug, Default)]
pub struct ValidationCacheCreateInfo {
    /// Serialized contents of a previously written cache, or empty to start
    /// fresh.
    pub initial_data: Vec<u8>,
}

/// The outcome of serializing a cache into a caller-provided buffer.
///
/// A too-small buffer is a distinct partial-success outcome, not a failure;
/// the two-call sizing idiom relies on the caller being able to retry with a
/// bigger buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheDataStatus {
    /// The full serialization was written; carries the byte count.
    Complete(usize),
    /// The buffer was too small; carries the bytes actually written.
    Incomplete(usize),
}

/// A set of hashed validation results with a stable binary serialization.
#[derive(Debug)]
pub struct ValidationCache {
    /// Process-unique identity, used to detect a cache merged into itself.
    id: u64,
    entries: RwLock<BTreeSet<u64>>,
}

impl ValidationCache {
    /// Creates a cache from the given parameters.
    ///
    /// Initial data with a malformed header is an error; initial data whose
    /// header is well-formed but belongs to another build or format version
    /// is valid input that simply contributes nothing.
    pub fn new(create_info: &ValidationCacheCreateInfo) -> Result<Self, Box<ValidationError>> {
        let entries = if create_info.initial_data.is_empty() {
            BTreeSet::new()
        } else {
            Self::parse_initial_data(&create_info.initial_data)?
        };

        Ok(ValidationCache {
            id: NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed),
            entries: RwLock::new(entries),
        })
    }

    fn parse_initial_data(data: &[u8]) -> Result<BTreeSet<u64>, Box<ValidationError>> {
        let header_len = CACHE_HEADER_SIZE as usize;

        if data.len() < header_len {
            return Err(Box::new(ValidationError {
                context: "create_info.initial_data".into(),
                problem: format!(
                    "is {} bytes long, which is shorter than the {}-byte cache header",
                    data.len(),
                    header_len,
                )
                .into(),
                ..Default::default()
            }));
        }

        let header: CacheHeader = bytemuck::pod_read_unaligned(&data[..header_len]);

        if header.header_size != CACHE_HEADER_SIZE {
            return Err(Box::new(ValidationError {
                context: "create_info.initial_data".into(),
                problem: format!(
                    "declares a header size of {} bytes, expected {}",
                    header.header_size, CACHE_HEADER_SIZE,
                )
                .into(),
                ..Default::default()
            }));
        }

        if header.version != CACHE_FORMAT_VERSION || header.uuid != build_uuid() {
            // A well-formed cache from another build. Not the caller's
            // fault; start empty.
            log::info!(
                target: "vkcheck",
                "validation cache data is from another build, starting with an empty cache",
            );
            return Ok(BTreeSet::new());
        }

        let body = &data[header_len..];

        if body.len() % 8 != 0 {
            return Err(Box::new(ValidationError {
                context: "create_info.initial_data".into(),
                problem: format!(
                    "has a {}-byte entry section, which is not a whole number of 8-byte \
                    entries",
                    body.len(),
                )
                .into(),
                ..Default::default()
            }));
        }

        Ok(body
            .chunks_exact(8)
            .map(|chunk| {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(chunk);
                u64::from_le_bytes(bytes)
            })
            .collect())
    }

    /// Records a validated artifact's hash.
    pub fn insert(&self, hash: u64) {
        self.entries.write().insert(hash);
    }

    /// Whether an artifact's hash was previously validated.
    pub fn contains(&self, hash: u64) -> bool {
        self.entries.read().contains(&hash)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.read().len()
    }

    /// The number of bytes [`write_data`](Self::write_data) needs for the
    /// full serialization.
    pub fn data_size(&self) -> usize {
        CACHE_HEADER_SIZE as usize + self.entries.read().len() * 8
    }

    /// Serializes the cache into `buffer`.
    ///
    /// Writes the header and then whole entries in ascending order until the
    /// buffer runs out. A buffer shorter than [`data_size`](Self::data_size)
    /// yields [`CacheDataStatus::Incomplete`] with the bytes written so far.
    pub fn write_data(&self, buffer: &mut [u8]) -> CacheDataStatus {
        let entries = self.entries.read();
        let header_len = CACHE_HEADER_SIZE as usize;
        let full_size = header_len + entries.len() * 8;

        if buffer.len() < header_len {
            return CacheDataStatus::Incomplete(0);
        }

        let header = CacheHeader {
            header_size: CACHE_HEADER_SIZE,
            version: CACHE_FORMAT_VERSION,
            uuid: build_uuid(),
        };
        buffer[..header_len].copy_from_slice(bytemuck::bytes_of(&header));

        let mut written = header_len;

        for &entry in entries.iter() {
            if buffer.len() - written < 8 {
                return CacheDataStatus::Incomplete(written);
            }

            buffer[written..written + 8].copy_from_slice(&entry.to_le_bytes());
            written += 8;
        }

        debug_assert_eq!(written, full_size);
        CacheDataStatus::Complete(written)
    }

    /// Convenience wrapper producing the full serialization.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buffer = vec![0u8; self.data_size()];

        // The entry set can only have grown between the size query and the
        // fill; retry with the fresh size if it did.
        loop {
            match self.write_data(&mut buffer) {
                CacheDataStatus::Complete(written) => {
                    buffer.truncate(written);
                    return buffer;
                }
                CacheDataStatus::Incomplete(_) => {
                    buffer.resize(self.data_size(), 0);
                }
            }
        }
    }

    /// Unions the entries of `sources` into this cache.
    ///
    /// Merging a cache into itself would mutate the set being iterated, so
    /// identity is checked over the whole batch before any entry moves: if
    /// any source is this cache, nothing at all is merged.
    pub fn merge<'a>(
        &self,
        sources: impl IntoIterator<Item = &'a ValidationCache>,
    ) -> Result<(), Box<ValidationError>> {
        let sources: Vec<&ValidationCache> = sources.into_iter().collect();

        if let Some(position) = sources.iter().position(|source| source.id == self.id) {
            return Err(Box::new(ValidationError {
                context: format!("src_caches[{}]", position).into(),
                problem: "is the destination cache; a cache cannot be merged into itself".into(),
                vuids: &["VUID-vkMergeValidationCachesEXT-dstCache-01536"],
                ..Default::default()
            }));
        }

        // All source locks are released before the destination lock is
        // taken; holding both at once deadlocks against a concurrent merge
        // in the opposite direction.
        let mut incoming = Vec::new();

        for source in sources {
            incoming.extend(source.entries.read().iter().copied());
        }

        self.entries.write().extend(incoming);

        Ok(())
    }

    /// Loads the persisted cache for a new device.
    ///
    /// Always yields a usable cache unless caching is disabled; a missing,
    /// unreadable or incompatible file just means starting empty.
    pub(crate) fn load(settings: &ValidationSettings) -> Option<ValidationCache> {
        if settings.disable_cache {
            return None;
        }

        let path = cache_file_path(settings);
        let initial_data = match fs::read(&path) {
            Ok(data) => data,
            Err(error) => {
                if error.kind() != io::ErrorKind::NotFound {
                    log::info!(
                        target: "vkcheck",
                        "could not read validation cache {}: {}",
                        path.display(),
                        error,
                    );
                }
                Vec::new()
            }
        };

        match ValidationCache::new(&ValidationCacheCreateInfo { initial_data }) {
            Ok(cache) => Some(cache),
            Err(error) => {
                log::info!(
                    target: "vkcheck",
                    "validation cache {} is malformed, starting empty: {}",
                    path.display(),
                    error,
                );
                ValidationCache::new(&ValidationCacheCreateInfo::default()).ok()
            }
        }
    }

    /// Writes the cache back to its file for the next run.
    pub(crate) fn save(&self, settings: &ValidationSettings) {
        let path = cache_file_path(settings);

        if let Err(error) = self.save_to(&path) {
            log::info!(
                target: "vkcheck",
                "could not write validation cache {}: {}",
                path.display(),
                error,
            );
        }
    }

    fn save_to(&self, path: &Path) -> io::Result<()> {
        let data = self.serialize();

        // Write-then-rename, so a crash mid-write never leaves a truncated
        // cache for the next run to trip over.
        let mut temp_path = path.as_os_str().to_owned();
        temp_path.push(".tmp");
        let temp_path = PathBuf::from(temp_path);

        fs::write(&temp_path, data)?;
        fs::rename(&temp_path, path)
    }
}

/// The file the cache is persisted in.
///
/// Shared temp directories are world-writable, so the filename carries a
/// per-user discriminator.
fn cache_file_path(settings: &ValidationSettings) -> PathBuf {
    let directory = settings
        .cache_dir
        .clone()
        .unwrap_or_else(|| resolve_cache_directory(|name| env::var_os(name).map(PathBuf::from)));

    let user = env::var("USER")
        .or_else(|_| env::var("USERNAME"))
        .unwrap_or_else(|_| "default".into());

    directory.join(format!("vkcheck_cache_{}.bin", user))
}

/// Resolves the platform cache directory from the environment.
///
/// `lookup` abstracts `env::var_os` so the priority order is testable without
/// mutating the process environment.
fn resolve_cache_directory(lookup: impl Fn(&str) -> Option<PathBuf>) -> PathBuf {
    let non_empty = |name: &str| lookup(name).filter(|path| !path.as_os_str().is_empty());

    if let Some(path) = non_empty("XDG_CACHE_HOME") {
        return path;
    }

    if let Some(home) = non_empty("HOME") {
        let cache = home.join(".cache");
        if cache.is_dir() {
            return cache;
        }
    }

    for name in ["TMPDIR", "TMP", "TEMP"] {
        if let Some(path) = non_empty(name) {
            return path;
        }
    }

    PathBuf::from("/tmp")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_with_entries(entries: &[u64]) -> ValidationCache {
        let cache = ValidationCache::new(&ValidationCacheCreateInfo::default()).unwrap();
        for &entry in entries {
            cache.insert(entry);
        }
        cache
    }

    #[test]
    fn round_trip_is_byte_identical() {
        // Insertion order must not affect the serialization.
        let cache = cache_with_entries(&[0xdead, 0x1, u64::MAX, 0xbeef_cafe]);
        let first = cache.serialize();

        let reloaded = ValidationCache::new(&ValidationCacheCreateInfo {
            initial_data: first.clone(),
        })
        .unwrap();
        assert_eq!(reloaded.entry_count(), 4);
        assert_eq!(reloaded.serialize(), first);
    }

    #[test]
    fn empty_cache_serializes_to_bare_header() {
        let cache = cache_with_entries(&[]);
        assert_eq!(cache.data_size(), CACHE_HEADER_SIZE as usize);

        let data = cache.serialize();
        assert_eq!(data.len(), CACHE_HEADER_SIZE as usize);
        assert_eq!(&data[..4], &CACHE_HEADER_SIZE.to_le_bytes());
        assert_eq!(&data[4..8], &CACHE_FORMAT_VERSION.to_le_bytes());
    }

    #[test]
    fn short_buffer_reports_incomplete() {
        let cache = cache_with_entries(&[1, 2, 3]);
        let full_size = cache.data_size();

        let mut buffer = vec![0u8; full_size - 8];
        assert_eq!(
            cache.write_data(&mut buffer),
            CacheDataStatus::Incomplete(full_size - 8),
        );

        let mut buffer = vec![0u8; 4];
        assert_eq!(cache.write_data(&mut buffer), CacheDataStatus::Incomplete(0));

        let mut buffer = vec![0u8; full_size];
        assert_eq!(
            cache.write_data(&mut buffer),
            CacheDataStatus::Complete(full_size),
        );
    }

    #[test]
    fn truncated_header_is_rejected() {
        let result = ValidationCache::new(&ValidationCacheCreateInfo {
            initial_data: vec![0u8; 10],
        });
        assert!(result.is_err());
    }

    #[test]
    fn ragged_entry_section_is_rejected() {
        let mut data = cache_with_entries(&[7]).serialize();
        data.pop();

        let result = ValidationCache::new(&ValidationCacheCreateInfo { initial_data: data });
        assert!(result.is_err());
    }

    #[test]
    fn foreign_build_data_is_discarded_not_rejected() {
        let mut data = cache_with_entries(&[1, 2, 3]).serialize();
        // Corrupt the UUID; the header stays well-formed.
        data[8] ^= 0xff;

        let cache = ValidationCache::new(&ValidationCacheCreateInfo { initial_data: data })
            .unwrap();
        assert_eq!(cache.entry_count(), 0);

        let mut data = cache_with_entries(&[1]).serialize();
        data[4..8].copy_from_slice(&99u32.to_le_bytes());

        let cache = ValidationCache::new(&ValidationCacheCreateInfo { initial_data: data })
            .unwrap();
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn merge_unions_entries() {
        let destination = cache_with_entries(&[1, 2]);
        let first = cache_with_entries(&[2, 3]);
        let second = cache_with_entries(&[4]);

        destination.merge([&first, &second]).unwrap();
        assert_eq!(destination.entry_count(), 4);
        for entry in [1, 2, 3, 4] {
            assert!(destination.contains(entry));
        }
    }

    #[test]
    fn concurrent_cross_merge_completes() {
        use std::{sync::Arc, thread};

        let first = Arc::new(cache_with_entries(&[1]));
        let second = Arc::new(cache_with_entries(&[2]));

        // Merging in both directions at once must make progress rather than
        // deadlock on the two entry locks.
        let threads: Vec<_> = [
            (first.clone(), second.clone()),
            (second.clone(), first.clone()),
        ]
        .into_iter()
        .map(|(destination, source)| {
            thread::spawn(move || {
                for _ in 0..1000 {
                    destination.merge([&*source]).unwrap();
                }
            })
        })
        .collect();

        for handle in threads {
            handle.join().unwrap();
        }

        for cache in [&first, &second] {
            assert!(cache.contains(1));
            assert!(cache.contains(2));
        }
    }

    #[test]
    fn self_merge_rejected_without_partial_effect() {
        let destination = cache_with_entries(&[1]);
        let other = cache_with_entries(&[2, 3]);
        let before = destination.serialize();

        // Rejection is all-or-nothing wherever the destination sits in the
        // batch.
        for sources in [
            vec![&destination],
            vec![&destination, &other],
            vec![&other, &destination],
        ] {
            let error = destination.merge(sources).unwrap_err();
            assert!(error
                .vuids
                .contains(&"VUID-vkMergeValidationCachesEXT-dstCache-01536"));
            assert_eq!(destination.serialize(), before);
        }
    }

    #[test]
    fn save_and_load_via_settings() {
        let directory = env::temp_dir().join(format!(
            "vkcheck-test-{}-{}",
            std::process::id(),
            NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed),
        ));
        fs::create_dir_all(&directory).unwrap();

        let settings = ValidationSettings {
            cache_dir: Some(directory.clone()),
            ..Default::default()
        };

        let cache = cache_with_entries(&[10, 20]);
        cache.save(&settings);

        let reloaded = ValidationCache::load(&settings).unwrap();
        assert!(reloaded.contains(10));
        assert!(reloaded.contains(20));
        assert_eq!(reloaded.entry_count(), 2);

        fs::remove_dir_all(&directory).unwrap();
    }

    #[test]
    fn load_with_cache_disabled() {
        let settings = ValidationSettings {
            disable_cache: true,
            ..Default::default()
        };
        assert!(ValidationCache::load(&settings).is_none());
    }

    #[test]
    fn missing_file_loads_empty() {
        let settings = ValidationSettings {
            cache_dir: Some(env::temp_dir().join("vkcheck-does-not-exist")),
            ..Default::default()
        };

        let cache = ValidationCache::load(&settings).unwrap();
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn directory_resolution_priority() {
        let lookup = |vars: &'static [(&'static str, &'static str)]| {
            move |name: &str| {
                vars.iter()
                    .find(|(key, _)| *key == name)
                    .map(|(_, value)| PathBuf::from(value))
            }
        };

        assert_eq!(
            resolve_cache_directory(lookup(&[
                ("XDG_CACHE_HOME", "/xdg"),
                ("TMPDIR", "/tmpdir"),
            ])),
            PathBuf::from("/xdg"),
        );

        // An empty variable is skipped.
        assert_eq!(
            resolve_cache_directory(lookup(&[("XDG_CACHE_HOME", ""), ("TMP", "/tmp-var")])),
            PathBuf::from("/tmp-var"),
        );

        // HOME only wins when $HOME/.cache exists as a directory.
        assert_eq!(
            resolve_cache_directory(lookup(&[
                ("HOME", "/nonexistent-vkcheck-home"),
                ("TEMP", "/temp-var"),
            ])),
            PathBuf::from("/temp-var"),
        );

        assert_eq!(resolve_cache_directory(lookup(&[])), PathBuf::from("/tmp"));
    }

    #[test]
    fn home_cache_directory_used_when_present() {
        let home = env::temp_dir().join(format!("vkcheck-home-{}", std::process::id()));
        let cache_dir = home.join(".cache");
        fs::create_dir_all(&cache_dir).unwrap();

        let home_value = home.clone();
        let resolved = resolve_cache_directory(move |name| {
            (name == "HOME").then(|| home_value.clone())
        });
        assert_eq!(resolved, cache_dir);

        fs::remove_dir_all(&home).unwrap();
    }
}
