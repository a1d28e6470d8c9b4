use smallvec::SmallVec;

/// Ordered set of `key:value` string pairs with unique keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSet {
    // Sorted by key. SmallVec to avoid allocation for small tag sets (usually < 4).
    tags: SmallVec<[(String, String); 4]>,
}

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut set = Self::default();
        for (k, v) in pairs {
            set.insert(k, v);
        }
        set
    }

    /// Insert a pair, replacing any existing value under the same key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.tags.binary_search_by(|(k, _)| k.as_str().cmp(&key)) {
            Ok(idx) => self.tags[idx].1 = value,
            Err(idx) => self.tags.insert(idx, (key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.tags
            .binary_search_by(|(k, _)| k.as_str().cmp(key))
            .ok()
            .map(|idx| self.tags[idx].1.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tags.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// True when every pair of `other` is present here with the same value.
    ///
    /// This is the submetric predicate: a sample matches a submetric iff the
    /// sample's tags are a superset of the submetric's selector.
    pub fn contains_all(&self, other: &TagSet) -> bool {
        other.iter().all(|(k, v)| self.get(k) == Some(v))
    }

    /// Fill in missing keys from `defaults`. Existing values win, so a
    /// sample's own tags always override run-wide tags on collision.
    pub fn apply_defaults(&mut self, defaults: &TagSet) {
        for (k, v) in defaults.iter() {
            if self.get(k).is_none() {
                self.insert(k, v);
            }
        }
    }
}

impl serde::Serialize for TagSet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;

        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (k, v) in self.iter() {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> serde::Deserialize<'de> for TagSet {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let pairs = std::collections::BTreeMap::<String, String>::deserialize(deserializer)?;
        Ok(TagSet::from_pairs(pairs))
    }
}
