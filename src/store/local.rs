use super::BackingStore;
use crate::error::{JournalError, JournalResult};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

const CONTAINER_PREFIX: &str = "container-";
const TEMP_SUFFIX: &str = ".tmp";

/// Local filesystem backing store: `<root>/container-<id>/<key>`.
/// Objects are written to a temp file, synced, then renamed into place.
#[derive(Debug, Clone)]
pub struct LocalFsBackingStore {
    root: PathBuf,
}

impl LocalFsBackingStore {
    /// Create a store rooted at `root`, creating the directory if needed
    pub fn new(root: PathBuf) -> JournalResult<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(LocalFsBackingStore { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn container_dir(&self, container: u32) -> PathBuf {
        self.root.join(format!("{}{}", CONTAINER_PREFIX, container))
    }

    fn object_path(&self, container: u32, key: &str) -> PathBuf {
        debug_assert!(
            !key.contains('/') && !key.ends_with(TEMP_SUFFIX),
            "Precondition: key is a plain file name"
        );
        self.container_dir(container).join(key)
    }
}

impl BackingStore for LocalFsBackingStore {
    fn create_container(&self, container: u32) -> JournalResult<()> {
        std::fs::create_dir_all(self.container_dir(container))?;
        Ok(())
    }

    fn put(&self, container: u32, key: &str, data: &[u8]) -> JournalResult<()> {
        let dir = self.container_dir(container);
        std::fs::create_dir_all(&dir)?;
        let path = self.object_path(container, key);
        let temp = dir.join(format!("{}{}", key, TEMP_SUFFIX));

        let mut file = std::fs::File::create(&temp)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&temp, &path)?;
        Ok(())
    }

    fn get(&self, container: u32, key: &str) -> JournalResult<Vec<u8>> {
        Ok(std::fs::read(self.object_path(container, key))?)
    }

    fn exists(&self, container: u32, key: &str) -> JournalResult<bool> {
        Ok(self.object_path(container, key).is_file())
    }

    fn delete(&self, container: u32, key: &str) -> JournalResult<()> {
        match std::fs::remove_file(self.object_path(container, key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()), // Already deleted
            Err(e) => Err(JournalError::from(e)),
        }
    }

    fn enumerate(&self, container: u32) -> JournalResult<Vec<(String, Vec<u8>)>> {
        let dir = self.container_dir(container);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut objects = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.ends_with(TEMP_SUFFIX) {
                // Interrupted put; the previous copy (if any) is still in place
                continue;
            }
            let data = std::fs::read(&path)?;
            objects.push((name, data));
        }
        objects.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(objects)
    }

    fn containers(&self) -> JournalResult<Vec<u32>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|n| n.strip_prefix(CONTAINER_PREFIX))
                .and_then(|n| n.parse::<u32>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    fn delete_container(&self, container: u32) -> JournalResult<()> {
        match std::fs::remove_dir_all(self.container_dir(container)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(JournalError::from(e)),
        }
    }
}
