use crate::catalog::{Catalog, CatalogEntry};
use crate::error::{LlamabarError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Extra free space required beyond the download itself.
const DISK_MARGIN_BYTES: u64 = 100 * 1024 * 1024;

/// Serial for staged temp files. Concurrent transfers of one remote file,
/// as with a projector shared between two builds, each stage to their own
/// path.
static NEXT_STAGE: AtomicU64 = AtomicU64::new(0);

/// Local store of downloaded weight files, keyed by the remote URL's
/// basename. Ids never appear in filenames, so display renames cannot orphan
/// a user's downloads.
#[derive(Debug, Clone)]
pub struct ModelStore {
    dir: PathBuf,
}

impl ModelStore {
    /// Open the store, creating the directory if needed.
    pub fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Final on-disk path for a remote file.
    #[must_use]
    pub fn local_path(&self, url: &str) -> PathBuf {
        self.dir.join(basename(url))
    }

    /// Temp path for one in-flight transfer, committed on completion. Every
    /// call hands out a fresh path; only the task that staged a file may
    /// remove it.
    #[must_use]
    pub fn stage_path(&self, url: &str) -> PathBuf {
        let stage = NEXT_STAGE.fetch_add(1, Ordering::Relaxed);
        self.dir.join(format!("{}.{stage}.partial", basename(url)))
    }

    /// Remote URLs whose local file is missing. Empty means fully
    /// downloaded.
    #[must_use]
    pub fn files_required(&self, entry: &CatalogEntry) -> Vec<String> {
        entry
            .remote_urls()
            .into_iter()
            .filter(|url| !self.local_path(url).exists())
            .map(str::to_string)
            .collect()
    }

    /// Ground truth: every required file present on disk.
    #[must_use]
    pub fn is_downloaded(&self, entry: &CatalogEntry) -> bool {
        entry
            .remote_urls()
            .iter()
            .all(|url| self.local_path(url).exists())
    }

    /// Path the engine loads, the primary weight file.
    #[must_use]
    pub fn weights_path(&self, entry: &CatalogEntry) -> PathBuf {
        self.local_path(&entry.url)
    }

    /// Local multimodal projector path, when the entry has one.
    #[must_use]
    pub fn mmproj_path(&self, entry: &CatalogEntry) -> Option<PathBuf> {
        entry.mmproj_url.as_deref().map(|url| self.local_path(url))
    }

    /// Commit a finished temp file into place and return its size.
    ///
    /// Remove-then-move rather than rename-over: the destination may hold a
    /// stale file from an earlier failed attempt, or a copy a sibling
    /// transfer of the same file committed first. A missing destination is
    /// fine.
    pub fn commit(&self, tmp: &Path, url: &str) -> Result<u64> {
        let dest = self.local_path(url);
        match fs::remove_file(&dest) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::rename(tmp, &dest)?;

        let size = fs::metadata(&dest)?.len();
        debug!("Committed {} ({size} bytes)", dest.display());
        Ok(size)
    }

    /// Paths to remove when deleting `entry`, skipping any file a different
    /// downloaded model still references. Reference counting is by path, not
    /// id: builds of one variant share a projector file.
    #[must_use]
    pub fn deletable_paths(&self, entry: &CatalogEntry, catalog: &Catalog) -> Vec<PathBuf> {
        let still_referenced: Vec<PathBuf> = catalog
            .entries()
            .iter()
            .filter(|other| other.id != entry.id && self.is_downloaded(other))
            .flat_map(|other| other.remote_urls().into_iter().map(|u| self.local_path(u)))
            .collect();

        entry
            .remote_urls()
            .into_iter()
            .map(|url| self.local_path(url))
            .filter(|path| {
                if still_referenced.contains(path) {
                    debug!("Keeping shared file {}", path.display());
                    false
                } else {
                    true
                }
            })
            .collect()
    }

    /// Remove every deletable file for the entry. Errors out on the first
    /// failed removal so callers can re-derive status from what remains.
    pub fn delete(&self, entry: &CatalogEntry, catalog: &Catalog) -> Result<()> {
        let deletable = self.deletable_paths(entry, catalog);
        for url in entry.remote_urls() {
            let path = self.local_path(url);
            if !deletable.contains(&path) {
                continue;
            }
            if path.exists() {
                fs::remove_file(&path)?;
                debug!("Deleted {}", path.display());
            }
            for partial in self.stale_partials(url) {
                let _ = fs::remove_file(&partial);
            }
        }
        Ok(())
    }

    /// Staged temp files for a remote file, left behind by dead transfers.
    fn stale_partials(&self, url: &str) -> Vec<PathBuf> {
        let prefix = format!("{}.", basename(url));
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                name.starts_with(&prefix) && name.ends_with(".partial")
            })
            .map(|entry| entry.path())
            .collect()
    }

    /// Check if enough disk space is available
    pub fn check_disk_space(&self, required_bytes: u64) -> Result<()> {
        let stats = nix::sys::statvfs::statvfs(&self.dir)
            .map_err(|e| LlamabarError::Other(format!("Failed to check disk space: {e}")))?;

        let available_bytes = stats.blocks_available() * stats.block_size();
        let required_with_margin = required_bytes + DISK_MARGIN_BYTES;

        if available_bytes < required_with_margin {
            warn!("Low disk space: {available_bytes} bytes free, {required_with_margin} needed");
            return Err(LlamabarError::Download(format!(
                "Not enough disk space: {} required, {} available",
                super::format_bytes(required_with_margin),
                super::format_bytes(available_bytes)
            )));
        }

        Ok(())
    }
}

/// Basename of a URL, query string stripped.
#[must_use]
pub fn basename(url: &str) -> &str {
    let path = url.split_once('?').map_or(url, |(p, _)| p);
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{flatten, ModelBuild, ModelFamily, ModelVariant, Quant};
    use tempfile::TempDir;

    fn test_catalog() -> Catalog {
        static FAMS: &[ModelFamily] = &[ModelFamily {
            name: "Test",
            series: "test",
            blurb: "",
            args: &[],
            variants: &[ModelVariant {
                label: "4B",
                released: "2025-01-01",
                max_context: 131_072,
                args: &[],
                builds: &[
                    ModelBuild {
                        id: None,
                        quant: Quant::Full,
                        file_size: 300,
                        kv_cache_per_1k: 1,
                        url: "https://example.com/repo/test-4b-bf16.gguf",
                        shard_urls: &["https://example.com/repo/test-4b-bf16-shard2.gguf"],
                        mmproj_url: Some("https://example.com/repo/mmproj-test.gguf"),
                        mmproj_size: 50,
                        extra_args: &[],
                    },
                    ModelBuild {
                        id: None,
                        quant: Quant::Q8,
                        file_size: 100,
                        kv_cache_per_1k: 1,
                        url: "https://example.com/repo/test-4b-q8.gguf",
                        shard_urls: &[],
                        mmproj_url: Some("https://example.com/repo/mmproj-test.gguf"),
                        mmproj_size: 50,
                        extra_args: &[],
                    },
                ],
            }],
        }];
        Catalog::from_entries(flatten(FAMS))
    }

    fn touch(store: &ModelStore, url: &str) {
        fs::write(store.local_path(url), b"x").unwrap();
    }

    #[test]
    fn test_basename() {
        assert_eq!(basename("https://example.com/a/b/model.gguf"), "model.gguf");
        assert_eq!(
            basename("https://example.com/m.gguf?download=true"),
            "m.gguf"
        );
        assert_eq!(basename("model.gguf"), "model.gguf");
    }

    #[test]
    fn test_files_required_tracks_existing() {
        let tmp = TempDir::new().unwrap();
        let store = ModelStore::new(tmp.path().to_path_buf()).unwrap();
        let catalog = test_catalog();
        let full = catalog.find("test-4b").unwrap();

        // Nothing local: all three files needed.
        assert_eq!(store.files_required(full).len(), 3);
        assert!(!store.is_downloaded(full));

        // Primary present: the shard and projector remain.
        touch(&store, &full.url);
        let required = store.files_required(full);
        assert_eq!(required.len(), 2);
        assert!(!required.contains(&full.url));

        touch(&store, &full.shard_urls[0]);
        touch(&store, full.mmproj_url.as_deref().unwrap());
        assert!(store.files_required(full).is_empty());
        assert!(store.is_downloaded(full));
    }

    #[test]
    fn test_commit_replaces_stale_file() {
        let tmp = TempDir::new().unwrap();
        let store = ModelStore::new(tmp.path().to_path_buf()).unwrap();
        let url = "https://example.com/repo/weights.gguf";

        fs::write(store.local_path(url), b"stale").unwrap();

        let staged = store.stage_path(url);
        fs::write(&staged, b"fresh-bytes").unwrap();

        let size = store.commit(&staged, url).unwrap();
        assert_eq!(size, 11);
        assert_eq!(fs::read(store.local_path(url)).unwrap(), b"fresh-bytes");
        assert!(!staged.exists());
    }

    #[test]
    fn test_staged_transfers_of_one_file_stay_separate() {
        let tmp = TempDir::new().unwrap();
        let store = ModelStore::new(tmp.path().to_path_buf()).unwrap();
        let url = "https://example.com/repo/mmproj-test.gguf";

        // Two builds fetching the same projector stage to distinct paths.
        let first = store.stage_path(url);
        let second = store.stage_path(url);
        assert_ne!(first, second);

        fs::write(&first, b"first").unwrap();
        fs::write(&second, b"second").unwrap();

        // Committing one leaves the other staged file untouched, and the
        // later commit replaces the earlier without error.
        store.commit(&first, url).unwrap();
        assert_eq!(fs::read(store.local_path(url)).unwrap(), b"first");
        assert_eq!(fs::read(&second).unwrap(), b"second");

        store.commit(&second, url).unwrap();
        assert_eq!(fs::read(store.local_path(url)).unwrap(), b"second");
        assert!(!first.exists());
        assert!(!second.exists());
    }

    #[test]
    fn test_delete_sweeps_stale_partials() {
        let tmp = TempDir::new().unwrap();
        let store = ModelStore::new(tmp.path().to_path_buf()).unwrap();
        let catalog = test_catalog();
        let q8 = catalog.find("test-4b-q8").unwrap();

        for url in q8.remote_urls() {
            touch(&store, url);
        }
        let staged = store.stage_path(&q8.url);
        fs::write(&staged, b"dead transfer").unwrap();

        store.delete(q8, &catalog).unwrap();
        assert!(!store.is_downloaded(q8));
        assert!(!staged.exists());
    }

    #[test]
    fn test_shared_projector_survives_partial_delete() {
        let tmp = TempDir::new().unwrap();
        let store = ModelStore::new(tmp.path().to_path_buf()).unwrap();
        let catalog = test_catalog();
        let full = catalog.find("test-4b").unwrap();
        let q8 = catalog.find("test-4b-q8").unwrap();

        for url in full.remote_urls() {
            touch(&store, url);
        }
        for url in q8.remote_urls() {
            touch(&store, url);
        }

        // Both builds downloaded: deleting q8 must keep the shared
        // projector.
        store.delete(q8, &catalog).unwrap();
        assert!(!store.is_downloaded(q8));
        assert!(store.is_downloaded(full));
        assert!(store
            .local_path(full.mmproj_url.as_deref().unwrap())
            .exists());

        // q8 gone: deleting full removes the projector too.
        store.delete(full, &catalog).unwrap();
        assert!(!store
            .local_path(full.mmproj_url.as_deref().unwrap())
            .exists());
    }

    #[test]
    fn test_delete_when_sibling_not_downloaded() {
        let tmp = TempDir::new().unwrap();
        let store = ModelStore::new(tmp.path().to_path_buf()).unwrap();
        let catalog = test_catalog();
        let q8 = catalog.find("test-4b-q8").unwrap();

        for url in q8.remote_urls() {
            touch(&store, url);
        }

        // The full build was never downloaded, so it holds no reference.
        store.delete(q8, &catalog).unwrap();
        assert!(!store
            .local_path(q8.mmproj_url.as_deref().unwrap())
            .exists());
    }

    #[test]
    fn test_disk_space_check_passes_for_small_requirement() {
        let tmp = TempDir::new().unwrap();
        let store = ModelStore::new(tmp.path().to_path_buf()).unwrap();
        assert!(store.check_disk_space(1024).is_ok());
    }
}
