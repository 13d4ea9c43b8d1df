// SPDX-FileCopyrightText: Copyright © 2024-2025 Strata Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Durable typed key/value store for engine state.
//!
//! Keys are `/`-separated paths over `[A-Za-z0-9_-]` segments. Values are
//! strings, int64 (decimal text on disk) or booleans (`true`/`false`).
//! Two backends exist: one file per key under a root directory, and an
//! ordered in-memory map for tests. A transaction snapshots the whole
//! store and swaps it back atomically on submit, so a multi-key update
//! either lands entirely or not at all.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

mod file;
mod memory;

pub use self::file::FileStorage;
pub use self::memory::MemoryStorage;

/// Path separator within keys
pub const KEY_SEPARATOR: char = '/';

/// Join namespace segments into a key path
pub fn sub_key<'a>(segments: impl IntoIterator<Item = &'a str>) -> String {
    segments.into_iter().collect::<Vec<_>>().join("/")
}

/// Notified after a key's value changes or the key is removed. Observers
/// are invoked synchronously on the mutating caller's context, over a
/// snapshot of the registered list, so unregistering during notification
/// is safe.
pub trait Observer {
    fn on_pref_set(&self, key: &str);
    fn on_pref_deleted(&self, key: &str);
}

/// Value kind, pinned per key by the first successful set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    String,
    Int64,
    Boolean,
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Kind::String => "string".fmt(f),
            Kind::Int64 => "int64".fmt(f),
            Kind::Boolean => "boolean".fmt(f),
        }
    }
}

enum Storage {
    File(FileStorage),
    Memory(MemoryStorage),
}

impl Storage {
    fn get(&self, key: &str) -> Result<Option<String>, Error> {
        match self {
            Storage::File(storage) => storage.get(key),
            Storage::Memory(storage) => Ok(storage.get(key)),
        }
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), Error> {
        match self {
            Storage::File(storage) => storage.set(key, value),
            Storage::Memory(storage) => {
                storage.set(key, value);
                Ok(())
            }
        }
    }

    fn exists(&self, key: &str) -> Result<bool, Error> {
        match self {
            Storage::File(storage) => storage.exists(key),
            Storage::Memory(storage) => Ok(storage.exists(key)),
        }
    }

    fn delete(&mut self, key: &str) -> Result<(), Error> {
        match self {
            Storage::File(storage) => storage.delete(key),
            Storage::Memory(storage) => {
                storage.delete(key);
                Ok(())
            }
        }
    }

    fn sub_keys(&self, ns: &str) -> Result<Vec<String>, Error> {
        match self {
            Storage::File(storage) => storage.sub_keys(ns),
            Storage::Memory(storage) => Ok(storage.sub_keys(ns)),
        }
    }

    fn begin_transaction(&mut self) -> Result<(), Error> {
        match self {
            Storage::File(storage) => storage.begin_transaction(),
            Storage::Memory(storage) => {
                storage.begin_transaction();
                Ok(())
            }
        }
    }

    fn cancel_transaction(&mut self) -> Result<(), Error> {
        match self {
            Storage::File(storage) => storage.cancel_transaction(),
            Storage::Memory(storage) => {
                storage.cancel_transaction();
                Ok(())
            }
        }
    }

    fn submit_transaction(&mut self) -> Result<(), Error> {
        match self {
            Storage::File(storage) => storage.submit_transaction(),
            Storage::Memory(storage) => {
                storage.submit_transaction();
                Ok(())
            }
        }
    }
}

/// The preference store: typed accessors and observer fan-out above a
/// storage backend
pub struct Prefs {
    storage: Storage,
    kinds: HashMap<String, Kind>,
    observers: HashMap<String, Vec<Arc<dyn Observer>>>,
}

impl Prefs {
    /// Open a file-backed store rooted at `root`, recovering any
    /// interrupted transaction left behind by a previous process
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, Error> {
        Ok(Self {
            storage: Storage::File(FileStorage::init(root.into())?),
            kinds: HashMap::new(),
            observers: HashMap::new(),
        })
    }

    /// An in-memory store, primarily for tests
    pub fn new_memory() -> Self {
        Self {
            storage: Storage::Memory(MemoryStorage::default()),
            kinds: HashMap::new(),
            observers: HashMap::new(),
        }
    }

    pub fn get_string(&self, key: &str) -> Result<Option<String>, Error> {
        validate_key(key)?;
        self.storage.get(key)
    }

    pub fn get_int64(&self, key: &str) -> Result<Option<i64>, Error> {
        let Some(value) = self.get_string(key)? else {
            return Ok(None);
        };

        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(Error::Parse {
                key: key.to_owned(),
                value,
            });
        }

        trimmed
            .parse::<i64>()
            .map(Some)
            .map_err(|_| Error::Parse {
                key: key.to_owned(),
                value,
            })
    }

    pub fn get_boolean(&self, key: &str) -> Result<Option<bool>, Error> {
        let Some(value) = self.get_string(key)? else {
            return Ok(None);
        };

        match value.trim() {
            "true" => Ok(Some(true)),
            "false" => Ok(Some(false)),
            _ => Err(Error::Parse {
                key: key.to_owned(),
                value,
            }),
        }
    }

    pub fn set_string(&mut self, key: &str, value: &str) -> Result<(), Error> {
        self.set_typed(key, value, Kind::String)
    }

    pub fn set_int64(&mut self, key: &str, value: i64) -> Result<(), Error> {
        self.set_typed(key, &value.to_string(), Kind::Int64)
    }

    pub fn set_boolean(&mut self, key: &str, value: bool) -> Result<(), Error> {
        self.set_typed(key, if value { "true" } else { "false" }, Kind::Boolean)
    }

    fn set_typed(&mut self, key: &str, value: &str, kind: Kind) -> Result<(), Error> {
        validate_key(key)?;

        match self.kinds.get(key) {
            Some(pinned) if *pinned != kind => {
                return Err(Error::KindMismatch {
                    key: key.to_owned(),
                    pinned: *pinned,
                    requested: kind,
                })
            }
            Some(_) => {}
            None => {
                self.kinds.insert(key.to_owned(), kind);
            }
        }

        self.storage.set(key, value)?;
        self.notify(key, |observer| observer.on_pref_set(key));

        Ok(())
    }

    pub fn exists(&self, key: &str) -> Result<bool, Error> {
        validate_key(key)?;
        self.storage.exists(key)
    }

    /// Delete `key`. Deleting an absent key succeeds.
    pub fn delete(&mut self, key: &str) -> Result<(), Error> {
        validate_key(key)?;
        self.storage.delete(key)?;
        self.kinds.remove(key);
        self.notify(key, |observer| observer.on_pref_deleted(key));

        Ok(())
    }

    /// Delete `key` and every `<ns>/.../key` under the given namespaces
    pub fn delete_in_namespaces(&mut self, key: &str, namespaces: &[&str]) -> Result<(), Error> {
        self.delete(key)?;

        for ns in namespaces {
            for sub in self.sub_keys(ns)? {
                let leaf = sub.rsplit(KEY_SEPARATOR).next().unwrap_or(&sub);
                if leaf == key {
                    self.delete(&sub)?;
                }
            }
        }

        Ok(())
    }

    /// Every stored key whose path begins with `ns`
    pub fn sub_keys(&self, ns: &str) -> Result<Vec<String>, Error> {
        validate_key(ns)?;
        self.storage.sub_keys(ns)
    }

    pub fn add_observer(&mut self, key: &str, observer: Arc<dyn Observer>) {
        self.observers.entry(key.to_owned()).or_default().push(observer);
    }

    pub fn remove_observer(&mut self, key: &str, observer: &Arc<dyn Observer>) {
        if let Some(observers) = self.observers.get_mut(key) {
            observers.retain(|existing| !Arc::ptr_eq(existing, observer));
        }
    }

    fn notify(&self, key: &str, invoke: impl Fn(&Arc<dyn Observer>)) {
        // Snapshot so observers may unregister from within the callback
        let snapshot = self.observers.get(key).cloned().unwrap_or_default();
        for observer in &snapshot {
            invoke(observer);
        }
    }

    /// Redirect reads and writes to a scratch copy of the store until
    /// [`Self::submit_transaction`] swaps it in whole
    pub fn start_transaction(&mut self) -> Result<(), Error> {
        self.storage.begin_transaction()
    }

    pub fn cancel_transaction(&mut self) -> Result<(), Error> {
        self.storage.cancel_transaction()
    }

    pub fn submit_transaction(&mut self) -> Result<(), Error> {
        self.storage.submit_transaction()
    }
}

fn validate_key(key: &str) -> Result<(), Error> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == KEY_SEPARATOR);

    if valid {
        Ok(())
    } else {
        Err(Error::InvalidKey(key.to_owned()))
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid key {0:?}")]
    InvalidKey(String),
    #[error("key {key:?}: cannot parse {value:?}")]
    Parse { key: String, value: String },
    #[error("key {key:?} holds {pinned}, refusing {requested} write")]
    KindMismatch {
        key: String,
        pinned: Kind,
        requested: Kind,
    },
    #[error("no transaction in progress")]
    NoTransaction,
    #[error("io")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn typed_roundtrip() {
        let mut prefs = Prefs::new_memory();

        prefs.set_string("update-state-payload-hash", "abc").unwrap();
        prefs.set_int64("update-state-next-operation", 42).unwrap();
        prefs.set_boolean("update-completed", true).unwrap();

        assert_eq!(
            prefs.get_string("update-state-payload-hash").unwrap().as_deref(),
            Some("abc")
        );
        assert_eq!(prefs.get_int64("update-state-next-operation").unwrap(), Some(42));
        assert_eq!(prefs.get_boolean("update-completed").unwrap(), Some(true));
        assert_eq!(prefs.get_string("missing").unwrap(), None);
    }

    #[test]
    fn kind_is_pinned() {
        let mut prefs = Prefs::new_memory();
        prefs.set_int64("counter", 1).unwrap();

        assert!(matches!(
            prefs.set_string("counter", "oops"),
            Err(Error::KindMismatch { .. })
        ));
    }

    #[test]
    fn invalid_keys_rejected() {
        let mut prefs = Prefs::new_memory();

        assert!(matches!(prefs.set_string("", "x"), Err(Error::InvalidKey(_))));
        assert!(matches!(
            prefs.set_string("bad key", "x"),
            Err(Error::InvalidKey(_))
        ));
        assert!(matches!(
            prefs.get_string("bad!key"),
            Err(Error::InvalidKey(_))
        ));
    }

    #[test]
    fn delete_in_namespaces() {
        let mut prefs = Prefs::new_memory();
        prefs.set_string("hash", "top").unwrap();
        prefs.set_string("ns1/hash", "one").unwrap();
        prefs.set_string("ns1/other", "keep").unwrap();
        prefs.set_string("ns2/deep/hash", "two").unwrap();

        prefs.delete_in_namespaces("hash", &["ns1", "ns2"]).unwrap();

        assert!(!prefs.exists("hash").unwrap());
        assert!(!prefs.exists("ns1/hash").unwrap());
        assert!(!prefs.exists("ns2/deep/hash").unwrap());
        assert!(prefs.exists("ns1/other").unwrap());
    }

    #[derive(Default)]
    struct Counter {
        sets: AtomicUsize,
        deletes: AtomicUsize,
    }

    impl Observer for Counter {
        fn on_pref_set(&self, _key: &str) {
            self.sets.fetch_add(1, Ordering::SeqCst);
        }

        fn on_pref_deleted(&self, _key: &str) {
            self.deletes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn observers_fire_after_mutation() {
        let mut prefs = Prefs::new_memory();
        let counter = Arc::new(Counter::default());
        prefs.add_observer("watched", counter.clone());

        prefs.set_string("watched", "a").unwrap();
        prefs.set_string("unwatched", "b").unwrap();
        prefs.delete("watched").unwrap();

        assert_eq!(counter.sets.load(Ordering::SeqCst), 1);
        assert_eq!(counter.deletes.load(Ordering::SeqCst), 1);

        let as_dyn: Arc<dyn Observer> = counter.clone();
        prefs.remove_observer("watched", &as_dyn);
        prefs.set_string("watched", "c").unwrap();
        assert_eq!(counter.sets.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn transaction_atomicity_memory() {
        let mut prefs = Prefs::new_memory();
        prefs.set_string("a", "1").unwrap();

        prefs.start_transaction().unwrap();
        prefs.set_string("a", "2").unwrap();
        prefs.set_string("b", "3").unwrap();
        prefs.cancel_transaction().unwrap();

        assert_eq!(prefs.get_string("a").unwrap().as_deref(), Some("1"));
        assert!(!prefs.exists("b").unwrap());

        prefs.start_transaction().unwrap();
        prefs.set_string("a", "2").unwrap();
        prefs.set_string("b", "3").unwrap();
        prefs.submit_transaction().unwrap();

        assert_eq!(prefs.get_string("a").unwrap().as_deref(), Some("2"));
        assert_eq!(prefs.get_string("b").unwrap().as_deref(), Some("3"));
    }

    #[test]
    fn sub_key_joins_segments() {
        assert_eq!(sub_key(["ns", "update", "hash"]), "ns/update/hash");
    }
}
