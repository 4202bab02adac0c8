//! Ordered keyed device collections.
//!
//! A [`Pool`] keeps devices in insertion order and refuses duplicate keys.
//! Order matters: it decides bus address assignment and the order of
//! `-device` arguments on the generated command line.

use crate::error::{Error, Result};
use serde::de::{self, Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};

/// An item that can live in a [`Pool`].
pub trait Keyed {
    /// Device kind used in error messages (`disk`, `cdrom`, ...).
    const KIND: &'static str;

    /// Unique key of this item.
    fn key(&self) -> String;
}

/// Ordered mapping from unique string keys to devices.
#[derive(Debug, Clone, PartialEq)]
pub struct Pool<T> {
    items: Vec<T>,
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T: Keyed> Pool<T> {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterate in order.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    /// Snapshot of the items in order.
    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    /// Position of the item with this key.
    pub fn position(&self, key: &str) -> Option<usize> {
        self.items.iter().position(|item| item.key() == key)
    }

    /// Whether an item with this key exists.
    pub fn contains(&self, key: &str) -> bool {
        self.position(key).is_some()
    }

    /// Look up an item by key.
    pub fn get(&self, key: &str) -> Option<&T> {
        self.position(key).map(|i| &self.items[i])
    }

    /// Look up an item by key for modification.
    ///
    /// Callers must not change the fields the key derives from.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut T> {
        match self.position(key) {
            Some(i) => Some(&mut self.items[i]),
            None => None,
        }
    }

    /// Look up an item by key, failing with a not-connected error.
    pub fn resolve(&self, key: &str) -> Result<&T> {
        self.get(key).ok_or_else(|| Error::not_connected(T::KIND, key))
    }

    /// Look up an item by key for modification, failing with a not-connected error.
    pub fn resolve_mut(&mut self, key: &str) -> Result<&mut T> {
        self.get_mut(key)
            .ok_or_else(|| Error::not_connected(T::KIND, key))
    }

    /// Append an item at the end.
    pub fn append(&mut self, item: T) -> Result<()> {
        let key = item.key();
        if self.contains(&key) {
            return Err(Error::already_connected(T::KIND, key));
        }
        self.items.push(item);
        Ok(())
    }

    /// Insert an item at `position`, shifting later items.
    pub fn insert(&mut self, item: T, position: usize) -> Result<()> {
        let key = item.key();
        if self.contains(&key) {
            return Err(Error::already_connected(T::KIND, key));
        }
        if position > self.items.len() {
            return Err(Error::validation(
                format!("{} '{}'", T::KIND, key),
                format!(
                    "position {} is out of range (pool has {} items)",
                    position,
                    self.items.len()
                ),
            ));
        }
        self.items.insert(position, item);
        Ok(())
    }

    /// Remove the item with this key.
    pub fn remove(&mut self, key: &str) -> Result<T> {
        match self.position(key) {
            Some(i) => Ok(self.items.remove(i)),
            None => Err(Error::not_connected(T::KIND, key)),
        }
    }

    /// Remove the item at `position`.
    pub fn remove_at(&mut self, position: usize) -> Result<T> {
        if position >= self.items.len() {
            return Err(Error::not_connected(T::KIND, format!("#{}", position)));
        }
        Ok(self.items.remove(position))
    }

    /// Keys in order.
    pub fn keys(&self) -> Vec<String> {
        self.items.iter().map(Keyed::key).collect()
    }
}

impl<'a, T> IntoIterator for &'a Pool<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl<T: Serialize> Serialize for Pool<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.items.serialize(serializer)
    }
}

impl<'de, T> Deserialize<'de> for Pool<T>
where
    T: Keyed + Deserialize<'de>,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let items = Vec::<T>::deserialize(deserializer)?;
        let mut pool = Pool::new();
        for item in items {
            pool.append(item).map_err(de::Error::custom)?;
        }
        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Item {
        name: String,
        value: u32,
    }

    impl Keyed for Item {
        const KIND: &'static str = "item";

        fn key(&self) -> String {
            self.name.clone()
        }
    }

    fn item(name: &str, value: u32) -> Item {
        Item {
            name: name.to_string(),
            value,
        }
    }

    #[test]
    fn test_append_preserves_order() {
        let mut pool = Pool::new();
        pool.append(item("b", 1)).unwrap();
        pool.append(item("a", 2)).unwrap();
        pool.append(item("c", 3)).unwrap();
        assert_eq!(pool.keys(), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_duplicate_append_leaves_pool_unchanged() {
        let mut pool = Pool::new();
        pool.append(item("a", 1)).unwrap();
        pool.append(item("b", 2)).unwrap();
        let before = pool.clone();

        let err = pool.append(item("a", 99)).unwrap_err();
        assert!(matches!(err, Error::AlreadyConnected { kind: "item", .. }));
        assert_eq!(pool, before);
    }

    #[test]
    fn test_insert_positions() {
        let mut pool = Pool::new();
        pool.append(item("a", 1)).unwrap();
        pool.append(item("c", 3)).unwrap();
        pool.insert(item("b", 2), 1).unwrap();
        pool.insert(item("z", 0), 0).unwrap();
        pool.insert(item("end", 9), 4).unwrap();
        assert_eq!(pool.keys(), vec!["z", "a", "b", "c", "end"]);

        let err = pool.insert(item("x", 0), 10).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(pool.len(), 5);
    }

    #[test]
    fn test_remove_by_key_and_position() {
        let mut pool = Pool::new();
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            pool.append(item(name, i as u32)).unwrap();
        }

        let removed = pool.remove("b").unwrap();
        assert_eq!(removed.value, 1);
        assert_eq!(pool.keys(), vec!["a", "c"]);

        let removed = pool.remove_at(0).unwrap();
        assert_eq!(removed.name, "a");

        assert!(matches!(
            pool.remove("missing"),
            Err(Error::NotConnected { .. })
        ));
        assert!(pool.remove_at(5).is_err());
    }

    #[test]
    fn test_resolve_mut_updates_in_place() {
        let mut pool = Pool::new();
        pool.append(item("a", 1)).unwrap();
        pool.resolve_mut("a").unwrap().value = 42;
        assert_eq!(pool.get("a").unwrap().value, 42);
        assert!(pool.resolve("b").is_err());
    }

    #[test]
    fn test_serde_keeps_order_and_rejects_duplicates() {
        let mut pool = Pool::new();
        pool.append(item("b", 1)).unwrap();
        pool.append(item("a", 2)).unwrap();

        let json = serde_json::to_string(&pool).unwrap();
        let back: Pool<Item> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pool);

        let dup = r#"[{"name":"a","value":1},{"name":"a","value":2}]"#;
        let err = serde_json::from_str::<Pool<Item>>(dup).unwrap_err();
        assert!(err.to_string().contains("already connected"));
    }
}
