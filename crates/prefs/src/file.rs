// SPDX-FileCopyrightText: Copyright © 2024-2025 Strata Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::path::{Path, PathBuf};

use fs_err as fs;
use log::{info, warn};

use crate::Error;

/// One regular file per key under a root directory; the key path maps
/// directly to the relative file path. Writes are atomic per key
/// (write-to-temp + rename). A transaction copies the root to a sibling
/// `<root>_tmp`, redirects all access there, and swaps the directories on
/// submit, fsyncing the parent so the rename is durable.
#[derive(Debug)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Open the store, recovering from an interrupted transaction:
    /// a missing root with a surviving `_tmp` means the swap lost its
    /// rename, so the scratch copy is promoted; a surviving `_tmp` next
    /// to the root means the transaction never submitted and is dropped.
    pub fn init(root: PathBuf) -> Result<Self, Error> {
        let storage = Self { root };

        if !storage.root.exists() {
            if storage.temporary_dir().exists() {
                info!("prefs root missing with scratch copy present, promoting interrupted commit");
                storage.swap()?;
            } else {
                fs::create_dir_all(&storage.root)?;
            }
        }

        if storage.temporary_dir().exists() {
            info!("discarding scratch copy of an unsubmitted transaction");
            fs::remove_dir_all(storage.temporary_dir())?;
        }

        prune_empty_dirs(&storage.root)?;

        Ok(storage)
    }

    fn temporary_dir(&self) -> PathBuf {
        let mut os = self.root.clone().into_os_string();
        os.push("_tmp");
        PathBuf::from(os)
    }

    /// All reads and writes land in the scratch copy while one exists
    fn active_root(&self) -> PathBuf {
        let temporary = self.temporary_dir();
        if temporary.exists() {
            temporary
        } else {
            self.root.clone()
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.active_root().join(key)
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, Error> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(value) => Ok(Some(value)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<(), Error> {
        let path = self.path_for(key);

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        write_atomic(&path, value.as_bytes())
    }

    pub fn exists(&self, key: &str) -> Result<bool, Error> {
        Ok(self.path_for(key).exists())
    }

    pub fn delete(&mut self, key: &str) -> Result<(), Error> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    pub fn sub_keys(&self, ns: &str) -> Result<Vec<String>, Error> {
        let root = self.active_root();
        let mut keys = vec![];

        collect_keys(&root, &root, &mut keys)?;
        keys.retain(|key| key.starts_with(ns));
        keys.sort();

        Ok(keys)
    }

    pub fn begin_transaction(&mut self) -> Result<(), Error> {
        let temporary = self.temporary_dir();

        if temporary.exists() {
            fs::remove_dir_all(&temporary)?;
        }

        copy_dir(&self.root, &temporary)?;

        Ok(())
    }

    pub fn cancel_transaction(&mut self) -> Result<(), Error> {
        let temporary = self.temporary_dir();

        if !temporary.exists() {
            return Err(Error::NoTransaction);
        }

        fs::remove_dir_all(temporary)?;

        Ok(())
    }

    pub fn submit_transaction(&mut self) -> Result<(), Error> {
        if !self.temporary_dir().exists() {
            return Err(Error::NoTransaction);
        }

        self.swap()
    }

    /// `rmdir <root>; rename <root>_tmp <root>; fsync(parent)`
    fn swap(&self) -> Result<(), Error> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root)?;
        }

        fs::rename(self.temporary_dir(), &self.root)?;

        if let Some(parent) = self.root.parent() {
            fsync_dir(parent);
        }

        Ok(())
    }
}

/// Per-key atomic write: sibling temp file, then rename over the target
fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), Error> {
    let mut temp = path.as_os_str().to_owned();
    temp.push(".partial");
    let temp = PathBuf::from(temp);

    fs::write(&temp, contents)?;
    fs::rename(&temp, path)?;

    Ok(())
}

fn fsync_dir(path: &Path) {
    let Ok(dir) = std::fs::File::open(path) else {
        warn!("cannot open {path:?} for fsync");
        return;
    };

    if let Err(error) = nix::unistd::fsync(std::os::fd::AsRawFd::as_raw_fd(&dir)) {
        warn!("fsync of {path:?} failed: {error}");
    }
}

fn collect_keys(root: &Path, dir: &Path, keys: &mut Vec<String>) -> Result<(), Error> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();

        if path.is_dir() {
            collect_keys(root, &path, keys)?;
        } else if let Ok(relative) = path.strip_prefix(root) {
            keys.push(relative.to_string_lossy().into_owned());
        }
    }

    Ok(())
}

fn copy_dir(from: &Path, to: &Path) -> Result<(), Error> {
    fs::create_dir_all(to)?;

    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let source = entry.path();
        let target = to.join(entry.file_name());

        if source.is_dir() {
            copy_dir(&source, &target)?;
        } else {
            fs::copy(&source, &target)?;
        }
    }

    Ok(())
}

/// Remove empty sub-directories left behind by deleted keys
fn prune_empty_dirs(dir: &Path) -> Result<(), Error> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();

        if path.is_dir() {
            prune_empty_dirs(&path)?;

            if fs::read_dir(&path)?.next().is_none() {
                let _ = fs::remove_dir(&path);
            }
        }
    }

    Ok(())
}
