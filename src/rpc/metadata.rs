use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Key suffix reserved for binary-valued entries.
pub const BINARY_SUFFIX: &str = "-bin";

/// A metadata value, either UTF-8 text or raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum MetadataValue {
    Text(String),
    Binary(Bytes),
}

impl MetadataValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            Self::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(value) => value.as_bytes(),
            Self::Binary(value) => value,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("metadata key must not be empty")]
    EmptyKey,
    #[error("metadata key {0:?} contains characters outside [a-z0-9-_.]")]
    InvalidKey(String),
    #[error("binary metadata value requires a key ending in -bin, got {0:?}")]
    BinaryWithoutSuffix(String),
    #[error("text metadata value must not use a -bin key, got {0:?}")]
    TextWithBinarySuffix(String),
}

/// Ordered sequence of key/value pairs. Keys may repeat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata {
    entries: Vec<(String, MetadataValue)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a text entry.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.entries
            .push((key.into(), MetadataValue::Text(value.into())));
        self
    }

    /// Appends a binary entry. The key should end in `-bin`.
    pub fn insert_bin(&mut self, key: impl Into<String>, value: impl Into<Bytes>) -> &mut Self {
        self.entries
            .push((key.into(), MetadataValue::Binary(value.into())));
        self
    }

    /// First value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.entries
            .iter()
            .find(|(entry_key, _)| entry_key == key)
            .map(|(_, value)| value)
    }

    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a MetadataValue> + 'a {
        self.entries
            .iter()
            .filter(move |(entry_key, _)| entry_key == key)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetadataValue)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Checks every key against the character set and the `-bin` convention.
    pub fn validate(&self) -> Result<(), MetadataError> {
        for (key, value) in &self.entries {
            validate_key(key)?;
            let binary_key = key.ends_with(BINARY_SUFFIX);
            match value {
                MetadataValue::Binary(_) if !binary_key => {
                    return Err(MetadataError::BinaryWithoutSuffix(key.clone()))
                }
                MetadataValue::Text(_) if binary_key => {
                    return Err(MetadataError::TextWithBinarySuffix(key.clone()))
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl<K, V> FromIterator<(K, V)> for Metadata
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut metadata = Self::new();
        for (key, value) in iter {
            metadata.insert(key, value);
        }
        metadata
    }
}

fn validate_key(key: &str) -> Result<(), MetadataError> {
    if key.is_empty() {
        return Err(MetadataError::EmptyKey);
    }

    let valid = key
        .bytes()
        .all(|byte| matches!(byte, b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.'));
    if valid {
        Ok(())
    } else {
        Err(MetadataError::InvalidKey(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_order_and_duplicate_keys() {
        let mut metadata = Metadata::new();
        metadata.insert("x-tag", "one").insert("x-other", "mid").insert("x-tag", "two");

        let tags: Vec<_> = metadata
            .get_all("x-tag")
            .filter_map(MetadataValue::as_text)
            .collect();
        assert_eq!(tags, vec!["one", "two"]);
        assert_eq!(metadata.get("x-tag").and_then(MetadataValue::as_text), Some("one"));
        assert_eq!(metadata.len(), 3);
    }

    #[test]
    fn binary_values_require_bin_suffix() {
        let mut metadata = Metadata::new();
        metadata.insert_bin("trace", vec![1u8, 2, 3]);

        assert_eq!(
            metadata.validate(),
            Err(MetadataError::BinaryWithoutSuffix("trace".to_string()))
        );

        let mut metadata = Metadata::new();
        metadata.insert_bin("trace-bin", vec![1u8, 2, 3]);
        assert!(metadata.validate().is_ok());
    }

    #[test]
    fn text_values_reject_bin_suffix() {
        let metadata: Metadata = [("trace-bin", "oops")].into_iter().collect();

        assert_eq!(
            metadata.validate(),
            Err(MetadataError::TextWithBinarySuffix("trace-bin".to_string()))
        );
    }

    #[test]
    fn uppercase_and_empty_keys_are_rejected() {
        let metadata: Metadata = [("X-Upper", "v")].into_iter().collect();
        assert!(matches!(metadata.validate(), Err(MetadataError::InvalidKey(_))));

        let metadata: Metadata = [("", "v")].into_iter().collect();
        assert_eq!(metadata.validate(), Err(MetadataError::EmptyKey));
    }

    #[test]
    fn serializes_as_tagged_entries() {
        let mut metadata = Metadata::new();
        metadata.insert("user", "alice").insert_bin("blob-bin", vec![7u8]);

        let value = serde_json::to_value(&metadata).expect("metadata serialization");
        assert_eq!(value[0][0], "user");
        assert_eq!(value[0][1]["kind"], "text");
        assert_eq!(value[1][1]["kind"], "binary");

        let decoded: Metadata = serde_json::from_value(value).expect("metadata deserialization");
        assert_eq!(decoded, metadata);
    }
}
