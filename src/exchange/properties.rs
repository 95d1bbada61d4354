use fnv::FnvBuildHasher;
use std::any::Any;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

pub type PropertyValue = Arc<dyn Any + Send + Sync>;

/// Typed property bag attached to an exchange.
///
/// Values live behind `Arc`, so cloning the bag (for example when an exchange is copied
/// for a multicast branch) shares the values instead of duplicating them.
#[derive(Clone, Default)]
pub struct Properties {
    values: HashMap<String, PropertyValue, FnvBuildHasher>,
}

impl Properties {
    pub fn new() -> Self {
        Self {
            values: HashMap::with_hasher(FnvBuildHasher::default()),
        }
    }

    /// Stores a typed value, replacing whatever was stored under the same key.
    ///
    /// # Examples
    /// ```rust
    /// use switchyard::exchange::Properties;
    ///
    /// let mut properties = Properties::new();
    /// properties.insert("retries", 3u32);
    /// assert_eq!(properties.get::<u32>("retries"), Some(&3));
    /// assert_eq!(properties.get::<String>("retries"), None);
    /// ```
    pub fn insert<V>(&mut self, key: impl Into<String>, value: V) -> Option<PropertyValue>
    where
        V: Any + Send + Sync,
    {
        self.values.insert(key.into(), Arc::new(value))
    }

    /// Returns the value stored under `key` if it has type `V`.
    pub fn get<V>(&self, key: &str) -> Option<&V>
    where
        V: Any,
    {
        self.values
            .get(key)
            .and_then(|value| (**value).downcast_ref::<V>())
    }

    pub fn get_shared(&self, key: &str) -> Option<PropertyValue> {
        self.values.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<PropertyValue> {
        self.values.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Debug for Properties {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.values.keys()).finish()
    }
}
