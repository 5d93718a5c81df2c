//! Per-run timestamp and path-resolution caches.
//!
//! Both caches are flushed after every successful recipe, because a recipe
//! may create or rewrite files the next decision depends on. The
//! `assume_new`/`assume_old` overrides inject synthetic stamps without
//! touching the filesystem.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::caps::{Capabilities, FileSystem};
use crate::rules::VpathEntry;

/// A missing file's stamp.
pub const MISSING: i64 = 0;
/// The stamp injected for `assume_old` paths: older than anything real.
pub const ANCIENT: i64 = 1;

/// Cached view of file stamps and vpath resolutions for one run.
pub struct StampCache {
    stamps: Mutex<HashMap<String, i64>>,
    resolved: Mutex<HashMap<String, Option<String>>>,
    assume_new: HashSet<String>,
    assume_old: HashSet<String>,
    check_symlink: bool,
}

impl StampCache {
    /// Empty cache with the given override lists.
    #[must_use]
    pub fn new(assume_new: &[String], assume_old: &[String], check_symlink: bool) -> Self {
        Self {
            stamps: Mutex::new(HashMap::new()),
            resolved: Mutex::new(HashMap::new()),
            assume_new: assume_new.iter().cloned().collect(),
            assume_old: assume_old.iter().cloned().collect(),
            check_symlink,
        }
    }

    /// The effective stamp of `path`: override, cache, or filesystem.
    pub fn stamp(&self, fs: &dyn FileSystem, path: &str) -> i64 {
        if self.assume_new.contains(path) {
            return i64::MAX;
        }
        if self.assume_old.contains(path) {
            return ANCIENT;
        }
        let mut stamps = self.stamps.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *stamps.entry(path.to_owned()).or_insert_with(|| {
            if self.check_symlink {
                fs.timestamp_symlink(path)
            } else {
                fs.timestamp(path)
            }
        })
    }

    /// Resolve `name` through the vpath rules, caching the answer. Names
    /// that resolve nowhere come back unchanged.
    pub fn resolve(
        &self,
        caps: &Capabilities,
        vpaths: &[VpathEntry],
        general: &[String],
        name: &str,
    ) -> String {
        let mut resolved = self
            .resolved
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        resolved
            .entry(name.to_owned())
            .or_insert_with(|| caps.paths.resolve(name, vpaths, general, caps.fs.as_ref()))
            .clone()
            .unwrap_or_else(|| name.to_owned())
    }

    /// Drop everything cached; called after each successful recipe.
    pub fn invalidate(&self) {
        self.stamps
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
        self.resolved
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::Capabilities;

    struct CountingFs(std::sync::atomic::AtomicUsize);

    impl FileSystem for CountingFs {
        fn timestamp(&self, _path: &str) -> i64 {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            7
        }
        fn timestamp_symlink(&self, path: &str) -> i64 {
            self.timestamp(path)
        }
        fn read_file(&self, _: &str) -> std::io::Result<String> {
            unimplemented!()
        }
        fn write_file(&self, _: &str, _: &str, _: bool) -> std::io::Result<()> {
            unimplemented!()
        }
        fn unlink(&self, _: &str) -> std::io::Result<()> {
            unimplemented!()
        }
        fn touch(&self, _: &str) -> std::io::Result<()> {
            unimplemented!()
        }
        fn realpath(&self, _: &str) -> Option<String> {
            None
        }
        fn glob(&self, _: &str, _: &camino::Utf8Path) -> Vec<String> {
            Vec::new()
        }
    }

    #[test]
    fn stamps_are_cached_until_invalidated() {
        let fs = CountingFs(std::sync::atomic::AtomicUsize::new(0));
        let cache = StampCache::new(&[], &[], false);
        assert_eq!(cache.stamp(&fs, "x"), 7);
        assert_eq!(cache.stamp(&fs, "x"), 7);
        assert_eq!(fs.0.load(std::sync::atomic::Ordering::SeqCst), 1);
        cache.invalidate();
        cache.stamp(&fs, "x");
        assert_eq!(fs.0.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn assume_overrides_bypass_the_filesystem() {
        let fs = CountingFs(std::sync::atomic::AtomicUsize::new(0));
        let cache = StampCache::new(&["fresh".into()], &["stale".into()], false);
        assert_eq!(cache.stamp(&fs, "fresh"), i64::MAX);
        assert_eq!(cache.stamp(&fs, "stale"), ANCIENT);
        assert_eq!(fs.0.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn unresolvable_names_come_back_unchanged() {
        let cache = StampCache::new(&[], &[], false);
        let caps = Capabilities::host();
        let resolved = cache.resolve(&caps, &[], &[], "no/such/file.c");
        assert_eq!(resolved, "no/such/file.c");
    }
}
