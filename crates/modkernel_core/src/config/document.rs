//! In-memory configuration document and its TOML file form.
//!
//! # Responsibility
//! - Hold one mod's categorized entries plus its schema version.
//! - Convert between the typed document and the raw TOML table on disk.
//!
//! # Invariants
//! - All four value kinds round-trip losslessly through the TOML form.
//! - A missing `schema_version` field reads as version 0.

use super::value::{ConfigKey, ConfigValue};
use crate::error::{KernelError, KernelResult};
use log::debug;
use std::collections::BTreeMap;
use std::path::Path;

pub(crate) const SCHEMA_VERSION_FIELD: &str = "schema_version";
pub(crate) const CATEGORIES_FIELD: &str = "categories";

/// Entries of one category, sorted by key.
pub type Category = BTreeMap<String, ConfigValue>;

/// One mod's configuration document.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConfigDocument {
    pub schema_version: u32,
    pub categories: BTreeMap<String, Category>,
}

impl ConfigDocument {
    pub fn new(schema_version: u32) -> Self {
        Self {
            schema_version,
            categories: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: &ConfigKey) -> Option<&ConfigValue> {
        self.categories.get(&key.category)?.get(&key.key)
    }

    /// Stores a value and returns the previous one.
    pub fn set(&mut self, key: &ConfigKey, value: ConfigValue) -> Option<ConfigValue> {
        self.categories
            .entry(key.category.clone())
            .or_default()
            .insert(key.key.clone(), value)
    }

    /// Removes a value; drops the category when it becomes empty.
    pub fn remove(&mut self, key: &ConfigKey) -> Option<ConfigValue> {
        let category = self.categories.get_mut(&key.category)?;
        let removed = category.remove(&key.key);
        if category.is_empty() {
            self.categories.remove(&key.category);
        }
        removed
    }

    /// Moves a value to a new key, keeping it if the target already exists.
    pub fn rename(&mut self, from: &ConfigKey, to: &ConfigKey) -> bool {
        let Some(value) = self.remove(from) else {
            return false;
        };
        if self.get(to).is_none() {
            self.set(to, value);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.categories.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    /// Flattened `(key, value)` snapshot, optionally limited to one category.
    pub fn entries(&self, category: Option<&str>) -> Vec<(ConfigKey, ConfigValue)> {
        self.categories
            .iter()
            .filter(|(name, _)| category.map_or(true, |wanted| wanted == name.as_str()))
            .flat_map(|(name, entries)| {
                entries
                    .iter()
                    .map(move |(key, value)| (ConfigKey::new(name.clone(), key.clone()), value.clone()))
            })
            .collect()
    }

    /// Builds a typed document from a raw TOML table.
    pub fn from_raw(path: &Path, raw: &toml::Table) -> KernelResult<Self> {
        let schema_version = match raw.get(SCHEMA_VERSION_FIELD) {
            None => 0,
            Some(toml::Value::Integer(value)) => u32::try_from(*value).map_err(|_| KernelError::Parse {
                path: path.to_path_buf(),
                message: format!("{SCHEMA_VERSION_FIELD} out of range: {value}"),
            })?,
            Some(other) => {
                return Err(KernelError::Parse {
                    path: path.to_path_buf(),
                    message: format!(
                        "{SCHEMA_VERSION_FIELD} must be an integer, found {}",
                        other.type_str()
                    ),
                })
            }
        };

        let mut document = Self::new(schema_version);
        let Some(categories) = raw.get(CATEGORIES_FIELD) else {
            return Ok(document);
        };
        let toml::Value::Table(categories) = categories else {
            return Err(KernelError::Parse {
                path: path.to_path_buf(),
                message: format!("`{CATEGORIES_FIELD}` must be a table"),
            });
        };

        for (category, entries) in categories {
            let toml::Value::Table(entries) = entries else {
                return Err(KernelError::Parse {
                    path: path.to_path_buf(),
                    message: format!("category `{category}` must be a table"),
                });
            };
            for (key, value) in entries {
                let config_key = ConfigKey::new(category.as_str(), key.as_str());
                let Some(value) = ConfigValue::from_toml(value) else {
                    return Err(KernelError::Parse {
                        path: path.to_path_buf(),
                        message: format!(
                            "entry `{config_key}` has unsupported kind {}",
                            value.type_str()
                        ),
                    });
                };
                document.set(&config_key, value);
            }
        }

        for field in raw.keys() {
            if field != SCHEMA_VERSION_FIELD && field != CATEGORIES_FIELD {
                debug!(
                    "event=config_parse module=config status=ok ignored_field={}",
                    field
                );
            }
        }
        Ok(document)
    }

    /// Converts the document to its raw TOML table form.
    pub fn to_raw(&self) -> toml::Table {
        let mut categories = toml::Table::new();
        for (name, entries) in &self.categories {
            let table: toml::Table = entries
                .iter()
                .map(|(key, value)| (key.clone(), value.to_toml()))
                .collect();
            categories.insert(name.clone(), toml::Value::Table(table));
        }

        let mut raw = toml::Table::new();
        raw.insert(
            SCHEMA_VERSION_FIELD.to_string(),
            toml::Value::Integer(i64::from(self.schema_version)),
        );
        raw.insert(CATEGORIES_FIELD.to_string(), toml::Value::Table(categories));
        raw
    }

    /// Renders the document as human-editable TOML text.
    pub fn to_toml_string(&self) -> KernelResult<String> {
        toml::to_string_pretty(&self.to_raw())
            .map_err(|err| KernelError::Internal(format!("config serialization failed: {err}")))
    }
}

/// Parses document text into a raw TOML table.
pub(crate) fn parse_raw(path: &Path, text: &str) -> KernelResult<toml::Table> {
    text.parse::<toml::Table>().map_err(|err| KernelError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::{parse_raw, ConfigDocument};
    use crate::config::{ConfigKey, ConfigValue};
    use crate::error::KernelError;
    use std::path::Path;

    fn sample() -> ConfigDocument {
        let mut doc = ConfigDocument::new(3);
        doc.set(&ConfigKey::new("audio", "enabled"), ConfigValue::Bool(true));
        doc.set(&ConfigKey::new("audio", "volume"), ConfigValue::Float(0.75));
        doc.set(&ConfigKey::new("audio", "channels"), ConfigValue::Integer(2));
        doc.set(
            &ConfigKey::new("video", "renderer"),
            ConfigValue::String("vk \"fast\"".to_string()),
        );
        doc.set(&ConfigKey::new("video", "gamma"), ConfigValue::Float(2.0));
        doc
    }

    #[test]
    fn text_round_trip_is_lossless() {
        let doc = sample();
        let text = doc.to_toml_string().expect("serialize");
        let path = Path::new("mem.toml");
        let raw = parse_raw(path, &text).expect("parse");
        let back = ConfigDocument::from_raw(path, &raw).expect("typed");
        assert_eq!(back, doc);
        assert_eq!(
            back.get(&ConfigKey::new("video", "gamma")),
            Some(&ConfigValue::Float(2.0))
        );
    }

    #[test]
    fn missing_version_reads_as_zero() {
        let path = Path::new("legacy.toml");
        let raw = parse_raw(path, "[categories.general]\nname = \"x\"\n").expect("parse");
        let doc = ConfigDocument::from_raw(path, &raw).expect("typed");
        assert_eq!(doc.schema_version, 0);
        assert_eq!(doc.len(), 1);
    }

    #[test]
    fn rejects_unsupported_entry_kind() {
        let path = Path::new("bad.toml");
        let raw = parse_raw(path, "[categories.general]\nlist = [1, 2]\n").expect("parse");
        let err = ConfigDocument::from_raw(path, &raw).expect_err("array must fail");
        assert!(matches!(err, KernelError::Parse { .. }));
        assert!(err.to_string().contains("general.list"));
    }

    #[test]
    fn remove_drops_empty_category_and_rename_keeps_existing_target() {
        let mut doc = sample();
        doc.remove(&ConfigKey::new("video", "renderer"));
        doc.remove(&ConfigKey::new("video", "gamma"));
        assert!(!doc.categories.contains_key("video"));

        doc.set(&ConfigKey::new("audio", "level"), ConfigValue::Float(0.1));
        assert!(doc.rename(&ConfigKey::new("audio", "volume"), &ConfigKey::new("audio", "level")));
        assert_eq!(
            doc.get(&ConfigKey::new("audio", "level")),
            Some(&ConfigValue::Float(0.1))
        );
        assert!(doc.get(&ConfigKey::new("audio", "volume")).is_none());
    }

    #[test]
    fn entries_filters_by_category() {
        let doc = sample();
        let audio = doc.entries(Some("audio"));
        assert_eq!(audio.len(), 3);
        assert!(audio.iter().all(|(key, _)| key.category == "audio"));
        assert_eq!(doc.entries(None).len(), 5);
    }
}
