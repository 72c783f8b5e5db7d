use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tempfile::NamedTempFile;

use super::{LoadResult, ResourceKey};

/// The number of times file system operations are retried when the cache directories vanish
/// underneath us.
const MAX_RETRIES: usize = 2;

/// The durable secondary store for raw image bytes.
///
/// Writes happen in two steps: [`write_temp`](Store::write_temp) stages the bytes somewhere
/// readers can not see them, and [`promote`](Store::promote) atomically moves the staged file
/// into place. Readers of a key thus observe either the previous complete entry, or the new
/// complete entry, but never a partially written file.
pub trait Store: Send + Sync + 'static {
    /// A handle to bytes that were written but are not yet visible to readers.
    type Staged: Send + 'static;

    /// Whether a complete entry exists for `key`.
    fn exists(&self, key: &ResourceKey) -> bool;

    /// Reads the complete entry for `key`, or `None` if there is no entry.
    fn read(&self, key: &ResourceKey) -> LoadResult<Option<Bytes>>;

    /// Writes `bytes` to a staging location for `key`.
    fn write_temp(&self, key: &ResourceKey, bytes: &[u8]) -> LoadResult<Self::Staged>;

    /// Atomically makes a staged write the visible entry for `key`.
    fn promote(&self, staged: Self::Staged, key: &ResourceKey) -> LoadResult<()>;
}

/// A [`Store`] on the local file system.
///
/// Entries live in `<root>/images/<cache_path>`, staged writes in `<root>/tmp`. Both are on the
/// same file system, so promoting a staged write is a plain atomic `rename`.
#[derive(Clone)]
pub struct DiskStore {
    images_dir: PathBuf,
    tmp_dir: PathBuf,
}

impl fmt::Debug for DiskStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskStore")
            .field("images_dir", &self.images_dir)
            .field("tmp_dir", &self.tmp_dir)
            .finish()
    }
}

impl DiskStore {
    /// Opens the store rooted at `root`, creating its directories.
    ///
    /// Temporary files left behind by writers that never promoted them are removed.
    pub fn open(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref();
        let store = Self {
            images_dir: root.join("images"),
            tmp_dir: root.join("tmp"),
        };
        fs::create_dir_all(&store.images_dir)?;
        store.clear_tmp()?;
        Ok(store)
    }

    /// Returns the path of the entry for `key`.
    pub fn item_path(&self, key: &ResourceKey) -> PathBuf {
        self.images_dir.join(key.cache_path())
    }

    /// Removes all staged writes and recreates the temporary directory.
    ///
    /// This must only be called while no writes are in flight.
    pub fn clear_tmp(&self) -> io::Result<()> {
        match fs::remove_dir_all(&self.tmp_dir) {
            Ok(()) => tracing::debug!(path = %self.tmp_dir.display(), "Removed stale temp files"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        fs::create_dir_all(&self.tmp_dir)
    }

    /// Removes the entry for `key`, returning whether one existed.
    pub fn remove(&self, key: &ResourceKey) -> io::Result<bool> {
        match fs::remove_file(self.item_path(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Create a new temporary file to stage a write.
    fn tempfile(&self) -> io::Result<NamedTempFile> {
        // Someone could remove the tmp directory while we are running, so be defensive here and
        // retry the fs operations.
        let mut retries = 0;
        loop {
            retries += 1;

            if let Err(e) = fs::create_dir_all(&self.tmp_dir) {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %self.tmp_dir.display(),
                    "Failed to create temp directory",
                );
                if retries > MAX_RETRIES {
                    return Err(e);
                }
                continue;
            }

            match tempfile::Builder::new()
                .prefix("tmp")
                .tempfile_in(&self.tmp_dir)
            {
                Ok(temp_file) => return Ok(temp_file),
                Err(e) => {
                    tracing::error!(
                        error = &e as &dyn std::error::Error,
                        path = %self.tmp_dir.display(),
                        "Failed to create temp file",
                    );
                    if retries > MAX_RETRIES {
                        return Err(e);
                    }
                }
            }
        }
    }
}

impl Store for DiskStore {
    type Staged = NamedTempFile;

    fn exists(&self, key: &ResourceKey) -> bool {
        fs::metadata(self.item_path(key)).is_ok_and(|md| md.is_file() && md.len() > 0)
    }

    fn read(&self, key: &ResourceKey) -> LoadResult<Option<Bytes>> {
        let path = self.item_path(key);
        tracing::trace!("Trying store at path {}", path.display());

        match fs::read(&path) {
            // A zero-byte file is never a valid image.
            Ok(data) if data.is_empty() => Ok(None),
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_temp(&self, key: &ResourceKey, bytes: &[u8]) -> LoadResult<NamedTempFile> {
        let mut temp_file = self.tempfile()?;
        tracing::trace!(%key, path = %temp_file.path().display(), "Staging image");

        temp_file.write_all(bytes)?;
        temp_file.as_file().sync_all()?;
        Ok(temp_file)
    }

    fn promote(&self, staged: NamedTempFile, key: &ResourceKey) -> LoadResult<()> {
        let cache_path = self.item_path(key);
        persist_tempfile(staged, &cache_path)?;
        Ok(())
    }
}

fn persist_tempfile(mut temp_file: NamedTempFile, cache_path: &Path) -> io::Result<fs::File> {
    let parent = cache_path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist item"))?;

    let mut retries = 0;
    let file = loop {
        retries += 1;

        if let Err(e) = fs::create_dir_all(parent) {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                path = %parent.display(),
                "Failed to create store directory",
            );
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(cache_path) {
            Ok(file) => break file,
            Err(e) => {
                temp_file = e.file;
                let err = e.error;
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    path = %cache_path.display(),
                    "Failed to persist store entry",
                );
                if retries > MAX_RETRIES {
                    return Err(err);
                }
            }
        }
    };
    Ok(file)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    fn key(k: &str) -> ResourceKey {
        ResourceKey::new(k).unwrap()
    }

    #[test]
    fn test_dirs_created() {
        let basedir = tempfile::tempdir().unwrap();
        let root = basedir.path().join("store");
        DiskStore::open(&root).unwrap();

        assert!(fs::metadata(root.join("images")).unwrap().is_dir());
        assert!(fs::metadata(root.join("tmp")).unwrap().is_dir());
    }

    #[test]
    fn test_stale_tmp_cleared() {
        let basedir = tempfile::tempdir().unwrap();
        let tmpdir = basedir.path().join("tmp");
        fs::create_dir_all(&tmpdir).unwrap();
        let spam = tmpdir.join("spam");
        fs::write(&spam, b"half an image").unwrap();

        DiskStore::open(basedir.path()).unwrap();
        assert!(fs::metadata(spam).is_err());
    }

    #[test]
    fn test_staged_write_is_invisible_until_promoted() {
        let basedir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(basedir.path()).unwrap();
        let k = key("icon.png");

        assert!(!store.exists(&k));
        let staged = store.write_temp(&k, b"complete").unwrap();
        assert!(!store.exists(&k));
        assert_eq!(store.read(&k), Ok(None));

        store.promote(staged, &k).unwrap();
        assert!(store.exists(&k));
        assert_eq!(store.read(&k), Ok(Some(Bytes::from_static(b"complete"))));
    }

    #[test]
    fn test_promote_replaces_entry() {
        let basedir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(basedir.path()).unwrap();
        let k = key("icon.png");

        let staged = store.write_temp(&k, b"old").unwrap();
        store.promote(staged, &k).unwrap();
        let staged = store.write_temp(&k, b"new").unwrap();
        assert_eq!(store.read(&k), Ok(Some(Bytes::from_static(b"old"))));
        store.promote(staged, &k).unwrap();
        assert_eq!(store.read(&k), Ok(Some(Bytes::from_static(b"new"))));
    }

    #[test]
    fn test_empty_file_is_absent() {
        let basedir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(basedir.path()).unwrap();
        let k = key("empty.png");

        let path = store.item_path(&k);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"").unwrap();

        assert!(!store.exists(&k));
        assert_eq!(store.read(&k), Ok(None));
    }

    #[test]
    fn test_promote_recreates_removed_dirs() {
        let basedir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(basedir.path()).unwrap();
        let k = key("icon.png");

        let staged = store.write_temp(&k, b"data").unwrap();
        fs::remove_dir_all(basedir.path().join("images")).unwrap();
        store.promote(staged, &k).unwrap();
        assert!(store.exists(&k));
    }

    #[test]
    fn test_remove() {
        let basedir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(basedir.path()).unwrap();
        let k = key("icon.png");

        assert!(!store.remove(&k).unwrap());
        let staged = store.write_temp(&k, b"data").unwrap();
        store.promote(staged, &k).unwrap();
        assert!(store.remove(&k).unwrap());
        assert!(!store.exists(&k));
    }

    #[test]
    fn test_concurrent_readers_never_see_partial_writes() {
        let basedir = tempfile::tempdir().unwrap();
        let store = Arc::new(DiskStore::open(basedir.path()).unwrap());
        let k = key("big.png");

        let small = vec![b'a'; 1024];
        let large = vec![b'b'; 512 * 1024];

        let staged = store.write_temp(&k, &small).unwrap();
        store.promote(staged, &k).unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let reader = {
            let store = Arc::clone(&store);
            let done = Arc::clone(&done);
            let k = k.clone();
            let (small, large) = (small.clone(), large.clone());
            std::thread::spawn(move || {
                let mut reads = 0;
                while !done.load(Ordering::Relaxed) || reads == 0 {
                    let data = store.read(&k).unwrap().unwrap();
                    assert!(data[..] == small[..] || data[..] == large[..]);
                    reads += 1;
                }
            })
        };

        for i in 0..20 {
            let data = if i % 2 == 0 { &large } else { &small };
            let staged = store.write_temp(&k, data).unwrap();
            store.promote(staged, &k).unwrap();
        }
        done.store(true, Ordering::Relaxed);
        reader.join().unwrap();
    }
}
