//! On-disk document cache addressed by source URL.

use std::fmt::{self, Write as _};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use once_cell::sync::Lazy;
use tempfile::NamedTempFile;
use tracing::{debug, instrument, warn};
use url::Url;
use uuid::Uuid;

/// Prefix shared by every cache key; keeps artifacts apart from staging files.
pub const KEY_PREFIX: &str = "pdf_";
const STAGING_PREFIX: &str = ".download-";
const STAGING_SUFFIX: &str = ".part";
/// Staging files untouched for this long belong to a process that died
/// mid-download.
const STALE_STAGING_AGE: Duration = Duration::from_secs(60 * 60);
const MAX_KEY_LEN: usize = 160;
const TRUNCATED_STEM_LEN: usize = 120;

static CACHE_KEY_NAMESPACE: Lazy<Uuid> =
    Lazy::new(|| Uuid::new_v5(&Uuid::NAMESPACE_URL, b"remotepdf:cache-key"));

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("cache I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to persist cache entry: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// File name under which a URL's artifact is cached.
///
/// The canonical URL string is escaped byte by byte: ASCII alphanumerics,
/// `.` and `-` are kept, `/` becomes `_` and everything else (`_` and `%`
/// included) becomes `%XX`. The mapping is injective, so two URLs only share
/// a key if they are the same URL. Keys that would exceed the length limit
/// keep a readable stem and end with a name-based UUID of the full URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn encode(url: &Url) -> Self {
        let source = url.as_str();
        let mut key = String::with_capacity(KEY_PREFIX.len() + source.len());
        key.push_str(KEY_PREFIX);
        for byte in source.bytes() {
            match byte {
                b'/' => key.push('_'),
                b if b.is_ascii_alphanumeric() || b == b'.' || b == b'-' => key.push(b as char),
                b => {
                    let _ = write!(key, "%{:02X}", b);
                }
            }
        }

        if key.len() > MAX_KEY_LEN {
            // Escaped keys are pure ASCII, any byte offset is a char boundary.
            key.truncate(TRUNCATED_STEM_LEN);
            key.push('-');
            let digest = Uuid::new_v5(&*CACHE_KEY_NAMESPACE, source.as_bytes());
            key.push_str(&digest.simple().to_string());
        }

        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct DocumentCacheStore {
    root: PathBuf,
}

impl DocumentCacheStore {
    /// Creates the root if needed and clears staging files left behind by
    /// interrupted runs.
    pub fn open(root: PathBuf) -> Result<Self, StoreError> {
        fs::create_dir_all(&root)?;
        let store = Self { root };
        match store.sweep_stale_staging(SystemTime::now()) {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "removed stale staging files"),
            Err(err) => warn!(%err, "failed to sweep staging files"),
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.as_str())
    }

    #[instrument(skip_all, fields(key = %key))]
    pub fn lookup(&self, key: &CacheKey) -> Option<PathBuf> {
        let path = self.path_for(key);
        if path.is_file() {
            debug!(path = %path.display(), "cache hit");
            Some(path)
        } else {
            debug!("cache miss");
            None
        }
    }

    /// Temporary file inside the cache root. It is removed when dropped
    /// unless it gets persisted.
    pub fn staging_file(&self) -> Result<NamedTempFile, StoreError> {
        fs::create_dir_all(&self.root)?;
        let file = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .suffix(STAGING_SUFFIX)
            .tempfile_in(&self.root)?;
        Ok(file)
    }

    /// Copies `source` into the store under `key` and returns the final path.
    ///
    /// The copy is written to a staging file first and renamed into place,
    /// so readers never observe a half-written artifact. An existing entry is
    /// replaced. `source` is left untouched.
    #[instrument(skip_all, fields(key = %key))]
    pub fn publish(&self, source: &Path, key: &CacheKey) -> Result<PathBuf, StoreError> {
        let destination = self.path_for(key);
        let mut input = File::open(source)?;
        let mut staged = self.staging_file()?;
        let copied = io::copy(&mut input, staged.as_file_mut())?;
        staged.as_file().sync_all()?;
        staged.persist(&destination)?;
        debug!(bytes = copied, path = %destination.display(), "published cache entry");
        Ok(destination)
    }

    /// Renames a file obtained from [`staging_file`](Self::staging_file)
    /// onto `key` without copying it. An existing entry is replaced.
    #[instrument(skip_all, fields(key = %key))]
    pub fn persist(&self, staged: NamedTempFile, key: &CacheKey) -> Result<PathBuf, StoreError> {
        let destination = self.path_for(key);
        staged.as_file().sync_all()?;
        staged.persist(&destination)?;
        debug!(path = %destination.display(), "persisted cache entry");
        Ok(destination)
    }

    fn sweep_stale_staging(&self, now: SystemTime) -> io::Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with(STAGING_PREFIX) || !name.ends_with(STAGING_SUFFIX) {
                continue;
            }
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let age = now
                .duration_since(metadata.modified()?)
                .unwrap_or(Duration::ZERO);
            if age >= STALE_STAGING_AGE {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    fn url(raw: &str) -> Url {
        Url::parse(raw).unwrap()
    }

    #[test]
    fn encode_is_deterministic() {
        let u = url("https://example.com/doc.pdf");
        assert_eq!(CacheKey::encode(&u), CacheKey::encode(&u));
        assert_eq!(
            CacheKey::encode(&u).as_str(),
            "pdf_https%3A__example.com_doc.pdf"
        );
    }

    #[test]
    fn encode_separates_urls_that_differ_only_in_separators() {
        let slash = CacheKey::encode(&url("https://example.com/a/b.pdf"));
        let underscore = CacheKey::encode(&url("https://example.com/a_b.pdf"));
        let query = CacheKey::encode(&url("https://example.com/a/b.pdf?page=2"));
        assert_ne!(slash, underscore);
        assert_ne!(slash, query);
        assert_ne!(underscore, query);
    }

    #[test]
    fn encode_produces_a_single_safe_path_component() {
        let key = CacheKey::encode(&url(
            "https://user@example.com:8443/dir/file name.pdf?a=1&b=<x>|*#frag\\",
        ));
        assert!(key.as_str().starts_with(KEY_PREFIX));
        for reserved in ['/', '\\', ':', '*', '?', '"', '<', '>', '|', ' '] {
            assert!(
                !key.as_str().contains(reserved),
                "{reserved:?} leaked into {key}"
            );
        }
        assert_eq!(Path::new(key.as_str()).components().count(), 1);
    }

    #[test]
    fn encode_bounds_long_urls_without_collisions() {
        let stem = "https://example.com/".to_string() + &"segment/".repeat(40);
        let first = CacheKey::encode(&url(&(stem.clone() + "one.pdf")));
        let second = CacheKey::encode(&url(&(stem + "two.pdf")));
        assert!(first.as_str().len() <= MAX_KEY_LEN);
        assert!(second.as_str().len() <= MAX_KEY_LEN);
        assert_ne!(first, second);
    }

    #[test]
    fn lookup_misses_until_published() {
        let dir = tempdir().unwrap();
        let store = DocumentCacheStore::open(dir.path().join("cache")).unwrap();
        let key = CacheKey::encode(&url("https://example.com/doc.pdf"));
        assert!(store.lookup(&key).is_none());

        let source = dir.path().join("download.tmp");
        fs::write(&source, b"%PDF-1.7").unwrap();
        let published = store.publish(&source, &key).unwrap();

        assert_eq!(published, store.path_for(&key));
        assert_eq!(store.lookup(&key), Some(published.clone()));
        assert_eq!(fs::read(&published).unwrap(), b"%PDF-1.7");
        assert!(source.exists());
    }

    #[test]
    fn publish_overwrites_existing_entry() {
        let dir = tempdir().unwrap();
        let store = DocumentCacheStore::open(dir.path().join("cache")).unwrap();
        let key = CacheKey::encode(&url("https://example.com/doc.pdf"));

        let source = dir.path().join("download.tmp");
        fs::write(&source, b"first").unwrap();
        store.publish(&source, &key).unwrap();
        fs::write(&source, b"second").unwrap();
        let path = store.publish(&source, &key).unwrap();

        assert_eq!(fs::read(path).unwrap(), b"second");
    }

    #[test]
    fn publish_missing_source_fails_without_leaving_entries() {
        let dir = tempdir().unwrap();
        let store = DocumentCacheStore::open(dir.path().join("cache")).unwrap();
        let key = CacheKey::encode(&url("https://example.com/doc.pdf"));

        let err = store.publish(&dir.path().join("absent"), &key).unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
        assert!(store.lookup(&key).is_none());
        assert_eq!(fs::read_dir(store.root()).unwrap().count(), 0);
    }

    #[test]
    fn persist_moves_the_staged_file_into_place() {
        let dir = tempdir().unwrap();
        let store = DocumentCacheStore::open(dir.path().to_path_buf()).unwrap();
        let key = CacheKey::encode(&url("https://example.com/doc.pdf"));

        let mut staged = store.staging_file().unwrap();
        std::io::Write::write_all(staged.as_file_mut(), b"%PDF-1.7").unwrap();
        let staged_path = staged.path().to_path_buf();
        let path = store.persist(staged, &key).unwrap();

        assert_eq!(store.lookup(&key), Some(path.clone()));
        assert_eq!(fs::read(&path).unwrap(), b"%PDF-1.7");
        assert!(!staged_path.exists());
        assert_eq!(fs::read_dir(store.root()).unwrap().count(), 1);
    }

    #[test]
    fn open_sweeps_abandoned_staging_files_only() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let store = DocumentCacheStore::open(root.clone()).unwrap();
        let key = CacheKey::encode(&url("https://example.com/doc.pdf"));

        let abandoned = root.join(".download-abandoned.part");
        fs::write(&abandoned, b"partial").unwrap();
        File::options()
            .write(true)
            .open(&abandoned)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(2 * 60 * 60))
            .unwrap();
        let in_flight = store.staging_file().unwrap();
        let entry = root.join(key.as_str());
        fs::write(&entry, b"%PDF-1.7").unwrap();

        let reopened = DocumentCacheStore::open(root).unwrap();

        assert!(!abandoned.exists());
        assert!(in_flight.path().exists());
        assert_eq!(reopened.lookup(&key), Some(entry));
    }

    #[test]
    fn staging_files_are_invisible_to_lookup() {
        let dir = tempdir().unwrap();
        let store = DocumentCacheStore::open(dir.path().join("cache")).unwrap();
        let staged = store.staging_file().unwrap();
        let name = staged.path().file_name().unwrap().to_string_lossy();
        assert!(name.starts_with(STAGING_PREFIX));
        assert!(!name.starts_with(KEY_PREFIX));
        drop(staged);
        assert_eq!(fs::read_dir(store.root()).unwrap().count(), 0);
    }
}
