use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Names one logical channel, independent of direction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(
    /// Opaque endpoint identifier string.
    pub String,
);

impl EndpointId {
    /// Returns a fresh random endpoint id.
    pub fn generate() -> Self {
        Self(new_uuid())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EndpointId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifies a value pinned in a remote handle registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandleId(
    /// Opaque handle identifier string.
    pub String,
);

impl HandleId {
    /// Returns a fresh random handle id.
    pub fn generate() -> Self {
        Self(new_uuid())
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Correlates a response to a call made by one remote window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(
    /// Monotonic numeric call identifier.
    pub u64,
);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Random version 4 UUID: 122 random bits in hyphenated form.
fn new_uuid() -> String {
    Uuid::new_v4().hyphenated().to_string()
}
