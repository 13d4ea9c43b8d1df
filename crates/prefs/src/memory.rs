// SPDX-FileCopyrightText: Copyright © 2024-2025 Strata Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::BTreeMap;

/// Ordered in-memory backend. Transactions operate on a scratch copy of
/// the map so a cancel restores the pre-begin content exactly.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: BTreeMap<String, String>,
    transaction: Option<BTreeMap<String, String>>,
}

impl MemoryStorage {
    fn active(&self) -> &BTreeMap<String, String> {
        self.transaction.as_ref().unwrap_or(&self.values)
    }

    fn active_mut(&mut self) -> &mut BTreeMap<String, String> {
        self.transaction.as_mut().unwrap_or(&mut self.values)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.active().get(key).cloned()
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.active_mut().insert(key.to_owned(), value.to_owned());
    }

    pub fn exists(&self, key: &str) -> bool {
        self.active().contains_key(key)
    }

    pub fn delete(&mut self, key: &str) {
        self.active_mut().remove(key);
    }

    /// Keys with `ns` as a path prefix, in order
    pub fn sub_keys(&self, ns: &str) -> Vec<String> {
        self.active()
            .range(ns.to_owned()..)
            .take_while(|(key, _)| key.starts_with(ns))
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn begin_transaction(&mut self) {
        self.transaction = Some(self.values.clone());
    }

    pub fn cancel_transaction(&mut self) {
        self.transaction = None;
    }

    pub fn submit_transaction(&mut self) {
        if let Some(transaction) = self.transaction.take() {
            self.values = transaction;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn prefix_range() {
        let mut storage = MemoryStorage::default();
        storage.set("ns/a", "1");
        storage.set("ns/b/c", "2");
        storage.set("nt/d", "3");

        assert_eq!(storage.sub_keys("ns"), vec!["ns/a", "ns/b/c"]);
        assert_eq!(storage.sub_keys("zz"), Vec::<String>::new());
    }
}
