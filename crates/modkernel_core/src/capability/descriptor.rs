//! Capability row declaration and validation.

use crate::error::{KernelError, KernelResult};

/// Integer id of a capability row. `0` is reserved as invalid.
pub type ApiId = u32;

/// Declarative capability row.
///
/// Names are dotted lowercase identifiers such as `modkernel.imc.v1`; the
/// version is the revision of the record the row points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityDescriptor {
    pub name: String,
    pub id: ApiId,
    pub version: u32,
}

impl CapabilityDescriptor {
    pub fn new(name: impl Into<String>, id: ApiId, version: u32) -> Self {
        Self {
            name: name.into(),
            id,
            version,
        }
    }

    /// Validates declaration-level row invariants.
    pub fn validate(&self) -> KernelResult<()> {
        if self.name.trim().is_empty() {
            return Err(KernelError::InvalidArgument(
                "capability name must not be empty".to_string(),
            ));
        }
        if !is_valid_dotted_name(self.name.as_str()) {
            return Err(KernelError::InvalidArgument(format!(
                "capability name is invalid: {}",
                self.name
            )));
        }
        if self.id == 0 {
            return Err(KernelError::InvalidArgument(format!(
                "capability `{}` uses reserved id 0",
                self.name
            )));
        }
        if self.version == 0 {
            return Err(KernelError::InvalidArgument(format!(
                "capability `{}` must declare version >= 1",
                self.name
            )));
        }
        Ok(())
    }
}

/// Returns whether `value` is a lowercase dotted identifier.
///
/// Accepts ascii lowercase letters and digits separated by single `.`, `_`
/// or `-`; rejects leading, trailing and doubled separators. Mod names use
/// the same rule.
pub fn is_valid_dotted_name(value: &str) -> bool {
    let mut chars = value.chars();
    let first = match chars.next() {
        Some(c) => c,
        None => return false,
    };
    if !first.is_ascii_lowercase() && !first.is_ascii_digit() {
        return false;
    }

    let mut prev_separator = false;
    for c in chars {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            prev_separator = false;
            continue;
        }
        if c == '.' || c == '_' || c == '-' {
            if prev_separator {
                return false;
            }
            prev_separator = true;
            continue;
        }
        return false;
    }
    !prev_separator
}
