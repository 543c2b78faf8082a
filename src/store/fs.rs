//! Filesystem state store with atomic writes.
//!
//! Keys map directly onto relative paths under the state root, so the
//! on-disk layout is exactly the governed layout (`observations/`,
//! `constraints/<state>/`, dotfiles at the root). Writes go to a `.tmp`
//! sibling first and are renamed into place, so a crash mid-write leaves
//! the previous version intact.

use std::path::{Path, PathBuf};

use crate::error::StoreError;
use crate::store::{StateStore, StoreResult};

/// Filesystem-backed state store rooted at a single directory.
pub struct FsStateStore {
    root: PathBuf,
}

impl FsStateStore {
    /// Open (creating if needed) a state store at the given root.
    pub fn open(root: &Path) -> StoreResult<Self> {
        std::fs::create_dir_all(root).map_err(|e| StoreError::Io {
            key: root.display().to_string(),
            source: e,
        })?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// The state root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> StoreResult<PathBuf> {
        if key.is_empty() || key.split('/').any(|seg| seg == ".." || seg.is_empty()) {
            return Err(StoreError::InvalidKey {
                key: key.to_string(),
            });
        }
        Ok(self.root.join(key))
    }

    fn ensure_parent(&self, path: &Path, key: &str) -> StoreResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io {
                key: key.to_string(),
                source: e,
            })?;
        }
        Ok(())
    }
}

impl StateStore for FsStateStore {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let path = self.resolve(key)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io {
                key: key.to_string(),
                source: e,
            }),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        let path = self.resolve(key)?;
        self.ensure_parent(&path, key)?;

        // Atomic write: temp sibling, then rename over the target.
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, value).map_err(|e| StoreError::Io {
            key: key.to_string(),
            source: e,
        })?;
        std::fs::rename(&tmp, &path).map_err(|e| StoreError::Io {
            key: key.to_string(),
            source: e,
        })
    }

    fn put_if_absent(&self, key: &str, value: &[u8]) -> StoreResult<bool> {
        let path = self.resolve(key)?;
        self.ensure_parent(&path, key)?;

        // create_new is the atomicity here: the kernel rejects the open if
        // the file exists, so concurrent reservations cannot both win.
        let mut file = match std::fs::File::create_new(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => {
                return Err(StoreError::Io {
                    key: key.to_string(),
                    source: e,
                });
            }
        };
        std::io::Write::write_all(&mut file, value).map_err(|e| StoreError::Io {
            key: key.to_string(),
            source: e,
        })?;
        Ok(true)
    }

    fn remove(&self, key: &str) -> StoreResult<bool> {
        let path = self.resolve(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::Io {
                key: key.to_string(),
                source: e,
            }),
        }
    }

    fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut keys = Vec::new();
        collect_keys(&self.root, &self.root, &mut keys)?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    fn move_key(&self, from: &str, to: &str) -> StoreResult<()> {
        let from_path = self.resolve(from)?;
        let to_path = self.resolve(to)?;
        if !from_path.exists() {
            return Err(StoreError::NotFound {
                key: from.to_string(),
            });
        }
        self.ensure_parent(&to_path, to)?;
        std::fs::rename(&from_path, &to_path).map_err(|e| StoreError::Io {
            key: from.to_string(),
            source: e,
        })
    }
}

fn collect_keys(root: &Path, dir: &Path, keys: &mut Vec<String>) -> StoreResult<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(StoreError::Io {
                key: dir.display().to_string(),
                source: e,
            });
        }
    };
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::Io {
            key: dir.display().to_string(),
            source: e,
        })?;
        let path = entry.path();
        if path.is_dir() {
            collect_keys(root, &path, keys)?;
        } else if path.extension().is_none_or(|ext| ext != "tmp") {
            if let Ok(rel) = path.strip_prefix(root) {
                keys.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
    }
    Ok(())
}

impl std::fmt::Debug for FsStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsStateStore")
            .field("root", &self.root)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_remove() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FsStateStore::open(dir.path()).unwrap();

        store.put("observations/x.json", b"{}").unwrap();
        assert_eq!(store.get("observations/x.json").unwrap(), Some(b"{}".to_vec()));
        assert!(store.contains("observations/x.json").unwrap());

        assert!(store.remove("observations/x.json").unwrap());
        assert!(!store.contains("observations/x.json").unwrap());
        assert!(!store.remove("observations/x.json").unwrap());
    }

    #[test]
    fn put_if_absent_writes_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FsStateStore::open(dir.path()).unwrap();

        assert!(store.put_if_absent(".governance.lock", b"first").unwrap());
        assert!(!store.put_if_absent(".governance.lock", b"second").unwrap());
        assert_eq!(store.get(".governance.lock").unwrap(), Some(b"first".to_vec()));

        assert!(store.remove(".governance.lock").unwrap());
        assert!(store.put_if_absent(".governance.lock", b"third").unwrap());
    }

    #[test]
    fn move_between_state_dirs() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FsStateStore::open(dir.path()).unwrap();

        store.put("constraints/draft/cns-x.json", b"{}").unwrap();
        store
            .move_key("constraints/draft/cns-x.json", "constraints/active/cns-x.json")
            .unwrap();

        assert!(!store.contains("constraints/draft/cns-x.json").unwrap());
        assert!(store.contains("constraints/active/cns-x.json").unwrap());
    }

    #[test]
    fn move_missing_key_is_not_found() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FsStateStore::open(dir.path()).unwrap();
        let err = store.move_key("a.json", "b.json").unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn list_filters_by_prefix() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FsStateStore::open(dir.path()).unwrap();

        store.put("constraints/draft/a.json", b"{}").unwrap();
        store.put("constraints/active/b.json", b"{}").unwrap();
        store.put("observations/c.json", b"{}").unwrap();

        let keys = store.list("constraints/").unwrap();
        assert_eq!(
            keys,
            vec![
                "constraints/active/b.json".to_string(),
                "constraints/draft/a.json".to_string(),
            ]
        );
    }

    #[test]
    fn rejects_path_traversal() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FsStateStore::open(dir.path()).unwrap();
        let err = store.get("../escape.json").unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey { .. }));
    }

    #[test]
    fn no_tmp_leftovers_after_put() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FsStateStore::open(dir.path()).unwrap();
        store.put("dashboard.json", b"{}").unwrap();
        let keys = store.list("").unwrap();
        assert_eq!(keys, vec!["dashboard.json".to_string()]);
    }
}
