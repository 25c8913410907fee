//! Typed configuration values and keys.

use crate::error::{KernelError, KernelResult};
use std::fmt::{Display, Formatter};

/// Category used when a key is addressed without one.
pub const DEFAULT_CATEGORY: &str = "general";

/// Discriminant of a [`ConfigValue`], fixed at 32 bits for C callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ValueKind {
    Bool = 0,
    Integer = 1,
    Float = 2,
    String = 3,
}

impl ValueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::String => "string",
        }
    }

    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Bool),
            1 => Some(Self::Integer),
            2 => Some(Self::Float),
            3 => Some(Self::String),
            _ => None,
        }
    }
}

/// One configuration entry value.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl ConfigValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Bool(_) => ValueKind::Bool,
            Self::Integer(_) => ValueKind::Integer,
            Self::Float(_) => ValueKind::Float,
            Self::String(_) => ValueKind::String,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value.as_str()),
            _ => None,
        }
    }

    pub(crate) fn from_toml(value: &toml::Value) -> Option<Self> {
        match value {
            toml::Value::Boolean(value) => Some(Self::Bool(*value)),
            toml::Value::Integer(value) => Some(Self::Integer(*value)),
            toml::Value::Float(value) => Some(Self::Float(*value)),
            toml::Value::String(value) => Some(Self::String(value.clone())),
            _ => None,
        }
    }

    pub(crate) fn to_toml(&self) -> toml::Value {
        match self {
            Self::Bool(value) => toml::Value::Boolean(*value),
            Self::Integer(value) => toml::Value::Integer(*value),
            Self::Float(value) => toml::Value::Float(*value),
            Self::String(value) => toml::Value::String(value.clone()),
        }
    }
}

impl Display for ConfigValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(value) => write!(f, "{value}"),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value:?}"),
            Self::String(value) => write!(f, "{value:?}"),
        }
    }
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ConfigValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for ConfigValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

/// `(category, key)` address of one entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConfigKey {
    pub category: String,
    pub key: String,
}

impl ConfigKey {
    pub fn new(category: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            key: key.into(),
        }
    }

    /// Parses `category.key`; a bare `key` lands in [`DEFAULT_CATEGORY`].
    pub fn parse(path: &str) -> KernelResult<Self> {
        let key = match path.split_once('.') {
            Some((category, key)) => Self::new(category, key),
            None => Self::new(DEFAULT_CATEGORY, path),
        };
        key.validate()?;
        Ok(key)
    }

    pub fn validate(&self) -> KernelResult<()> {
        validate_segment("category", &self.category)?;
        validate_segment("key", &self.key)
    }
}

impl Display for ConfigKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.category, self.key)
    }
}

fn validate_segment(what: &str, value: &str) -> KernelResult<()> {
    if value.is_empty() {
        return Err(KernelError::InvalidArgument(format!(
            "config {what} must not be empty"
        )));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(KernelError::InvalidArgument(format!(
            "config {what} may only contain ascii letters, digits, `_` and `-`: {value:?}"
        )));
    }
    Ok(())
}
