//! Content-addressed artifact cache.

use std::{
    fs,
    path::{Path, PathBuf},
};

use sha2::{Digest, Sha256};

use crate::error::Result;

/// Storage contract for compiled artifacts, keyed by a fingerprint over the
/// source bytes, the compiler flags that affect codegen, and the compiler's
/// own version.
pub trait CacheProvider {
    /// Hex-encoded SHA-256 over `source ∥ 0x00 ∥ flags ∥ 0x00 ∥ compiler_version`.
    fn compute_fingerprint(&self, source: &[u8], flags: Option<&str>, compiler_version: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(source);
        hasher.update([0u8]);
        hasher.update(flags.unwrap_or("").as_bytes());
        hasher.update([0u8]);
        hasher.update(compiler_version.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// The on-disk path an artifact with the given fingerprint would live at.
    fn artifact_path(&self, fingerprint: &str) -> PathBuf;

    /// Whether a cached artifact for `fingerprint` exists and, if
    /// `source_path` is given, is not older than the source file.
    fn is_valid(&self, fingerprint: &str, source_path: Option<&Path>) -> bool;

    /// Remove every cached artifact. Returns the number removed.
    fn purge(&self) -> Result<usize>;
}

/// Filesystem-backed cache: one artifact file per fingerprint under a single
/// directory.
#[derive(Debug, Clone)]
pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    /// Use `dir` as the cache directory, creating it if necessary. Creation
    /// failure is non-fatal: the cache will simply miss on every lookup.
    #[instrument(level = "debug", skip_all)]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        if let Err(err) = fs::create_dir_all(&dir) {
            warn!(?dir, %err, "could not create cache directory, cache will miss every lookup");
        }
        Self { dir }
    }

    /// Use the platform cache directory under a `crispy` subdirectory.
    pub fn platform_default() -> Self {
        let dir = dirs::cache_dir().unwrap_or_else(std::env::temp_dir).join("crispy");
        Self::new(dir)
    }

    /// The directory this cache stores artifacts in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn artifact_suffix() -> &'static str {
    std::env::consts::DLL_SUFFIX
}

impl CacheProvider for FileCache {
    fn artifact_path(&self, fingerprint: &str) -> PathBuf {
        self.dir.join(format!("{fingerprint}{}", artifact_suffix()))
    }

    #[instrument(level = "trace", skip(self))]
    fn is_valid(&self, fingerprint: &str, source_path: Option<&Path>) -> bool {
        let artifact = self.artifact_path(fingerprint);
        let Ok(artifact_meta) = fs::metadata(&artifact) else {
            trace!(?artifact, "cache miss: artifact does not exist");
            return false;
        };
        let Some(source_path) = source_path else {
            trace!(?artifact, "cache hit: no source path to compare against");
            return true;
        };
        let (Ok(artifact_mtime), Ok(source_meta)) =
            (artifact_meta.modified(), fs::metadata(source_path))
        else {
            return false;
        };
        let Ok(source_mtime) = source_meta.modified() else {
            return false;
        };
        let valid = artifact_mtime >= source_mtime;
        trace!(?artifact, valid, "cache freshness check");
        valid
    }

    #[instrument(level = "debug", skip(self))]
    fn purge(&self) -> Result<usize> {
        let mut removed = 0usize;
        for entry in walkdir::WalkDir::new(&self.dir).max_depth(1).into_iter().filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.is_file()
                && path.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.ends_with(artifact_suffix()))
                && fs::remove_file(path).is_ok()
            {
                removed += 1;
            }
        }
        info!(removed, dir = ?self.dir, "purged cache");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic() {
        let cache = FileCache::new(std::env::temp_dir().join("crispy-test-fp"));
        let a = cache.compute_fingerprint(b"int main(){}", Some("-O2"), "gcc 12.2.0");
        let b = cache.compute_fingerprint(b"int main(){}", Some("-O2"), "gcc 12.2.0");
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_is_sensitive_to_each_input() {
        let cache = FileCache::new(std::env::temp_dir().join("crispy-test-fp2"));
        let base = cache.compute_fingerprint(b"int main(){}", Some("-O2"), "gcc 12.2.0");
        let diff_source = cache.compute_fingerprint(b"int main(){return 1;}", Some("-O2"), "gcc 12.2.0");
        let diff_flags = cache.compute_fingerprint(b"int main(){}", Some("-O3"), "gcc 12.2.0");
        let diff_version = cache.compute_fingerprint(b"int main(){}", Some("-O2"), "gcc 13.1.0");
        let diff_no_flags = cache.compute_fingerprint(b"int main(){}", None, "gcc 12.2.0");
        assert_ne!(base, diff_source);
        assert_ne!(base, diff_flags);
        assert_ne!(base, diff_version);
        assert_ne!(base, diff_no_flags);
    }

    #[test]
    fn is_valid_false_when_artifact_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = FileCache::new(tmp.path());
        assert!(!cache.is_valid("deadbeef", None));
    }

    #[test]
    fn is_valid_true_without_source_path_when_artifact_exists() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = FileCache::new(tmp.path());
        let path = cache.artifact_path("deadbeef");
        fs::write(&path, b"").unwrap();
        assert!(cache.is_valid("deadbeef", None));
    }

    #[test]
    fn purge_removes_only_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = FileCache::new(tmp.path());
        fs::write(cache.artifact_path("aaa"), b"").unwrap();
        fs::write(tmp.path().join("notes.txt"), b"").unwrap();
        let removed = cache.purge().unwrap();
        assert_eq!(removed, 1);
        assert!(tmp.path().join("notes.txt").exists());
    }
}
