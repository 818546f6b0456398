use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// A named group of configuration fields, e.g. the `news_collection` section.
///
/// Keys are kept sorted so serialization is deterministic. Nested fields are
/// addressed with dotted paths (`credentials.site_pw`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigSection(BTreeMap<String, Value>);

impl ConfigSection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a section from a JSON object. Returns `None` for any other JSON type.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map.into_iter().collect())),
            _ => None,
        }
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0.into_iter().collect())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Look up a dotted path
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let mut current = self.0.get(segments.next()?)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Set a dotted path, creating intermediate objects as needed.
    /// Any non-object value sitting on the path is replaced by an object.
    pub fn set_path(&mut self, path: &str, value: Value) {
        let segments: Vec<&str> = path.split('.').collect();
        let (last, parents) = match segments.split_last() {
            Some(split) => split,
            None => return,
        };

        if parents.is_empty() {
            self.0.insert(last.to_string(), value);
            return;
        }

        let mut current = self
            .0
            .entry(parents[0].to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        for segment in &parents[1..] {
            current = ensure_object(current)
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        ensure_object(current).insert(last.to_string(), value);
    }

    /// Remove a dotted path, returning the old value
    pub fn remove_path(&mut self, path: &str) -> Option<Value> {
        let segments: Vec<&str> = path.split('.').collect();
        let (last, parents) = segments.split_last()?;
        if parents.is_empty() {
            return self.0.remove(*last);
        }

        let mut current = self.0.get_mut(parents[0])?;
        for segment in &parents[1..] {
            current = current.as_object_mut()?.get_mut(*segment)?;
        }
        current.as_object_mut()?.remove(*last)
    }

    /// Overlay `self` on top of `base`: top-level keys present here win.
    pub fn merged_over(&self, base: &ConfigSection) -> ConfigSection {
        let mut merged = base.clone();
        for (key, value) in &self.0 {
            merged.0.insert(key.clone(), value.clone());
        }
        merged
    }

    /// Canonical JSON encoding: object keys sorted at every depth
    pub fn to_canonical_json(&self) -> Vec<u8> {
        let canonical = canonicalize(&Value::Object(
            self.0.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        ));
        // Serializing a Value cannot fail
        serde_json::to_vec(&canonical).unwrap_or_default()
    }

    /// SHA-256 of the canonical JSON encoding, hex encoded
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.to_canonical_json());
        hex::encode(digest)
    }
}

impl FromIterator<(String, Value)> for ConfigSection {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

fn ensure_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced with an object"),
    }
}

/// Rebuild objects with sorted keys so the encoding does not depend on
/// serde_json's map ordering features.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn section(value: Value) -> ConfigSection {
        ConfigSection::from_value(value).unwrap()
    }

    #[test]
    fn test_dotted_paths() {
        let mut s = section(json!({"display_count": 30, "credentials": {"site_id": "kim"}}));

        assert_eq!(s.get_path("credentials.site_id"), Some(&json!("kim")));
        assert_eq!(s.get_path("credentials.site_pw"), None);
        assert_eq!(s.get_path("display_count.nested"), None);

        s.set_path("credentials.site_pw", json!("secret"));
        assert_eq!(s.get_path("credentials.site_pw"), Some(&json!("secret")));

        s.set_path("platforms.golftimes.site_pw", json!("pw"));
        assert_eq!(s.get_path("platforms.golftimes.site_pw"), Some(&json!("pw")));

        assert_eq!(s.remove_path("credentials.site_id"), Some(json!("kim")));
        assert_eq!(s.get_path("credentials.site_id"), None);
    }

    #[test]
    fn test_merged_over_prefers_overlay() {
        let base = section(json!({"display_count": 30, "max_workers": 10}));
        let overlay = section(json!({"display_count": 15}));

        let merged = overlay.merged_over(&base);
        assert_eq!(merged.get("display_count"), Some(&json!(15)));
        assert_eq!(merged.get("max_workers"), Some(&json!(10)));
    }

    #[test]
    fn test_fingerprint_ignores_key_order() {
        let a = section(json!({"b": 1, "a": {"y": 2, "x": [1, 2]}}));
        let mut b = ConfigSection::new();
        b.set_path("a.x", json!([1, 2]));
        b.set_path("a.y", json!(2));
        b.insert("b", json!(1));

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
        assert_eq!(
            String::from_utf8(a.to_canonical_json()).unwrap(),
            r#"{"a":{"x":[1,2],"y":2},"b":1}"#
        );
    }

    #[test]
    fn test_fingerprint_changes_with_values() {
        let a = section(json!({"display_count": 15}));
        let b = section(json!({"display_count": 16}));
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_from_value_rejects_non_objects() {
        assert!(ConfigSection::from_value(json!([1, 2])).is_none());
        assert!(ConfigSection::from_value(json!("x")).is_none());
    }
}
