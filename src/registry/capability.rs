//! Capability Descriptors
//!
//! Workers advertise capabilities either as a plain name or as a typed
//! record whose `type` field holds the name, possibly wrapped as an
//! enum-like `{ "value": ... }`. Every form is normalized through
//! [`normalize`] to one canonical key.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Canonical capability key: trimmed, ASCII-lowercase.
pub fn normalize(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

/// The `type` field of a typed capability.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum CapabilityType {
    Name(String),
    /// Enum-like member exposing its name under `value`.
    Member { value: String },
}

impl CapabilityType {
    pub fn name(&self) -> &str {
        match self {
            Self::Name(name) => name,
            Self::Member { value } => value,
        }
    }
}

/// A structured capability descriptor.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypedCapability {
    #[serde(rename = "type")]
    pub kind: CapabilityType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TypedCapability {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: CapabilityType::Name(kind.into()),
            description: None,
        }
    }

    pub fn member(value: impl Into<String>) -> Self {
        Self {
            kind: CapabilityType::Member {
                value: value.into(),
            },
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A capability as advertised by a worker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum Capability {
    Raw(String),
    Typed(TypedCapability),
}

impl Capability {
    /// Canonical routing key for this descriptor.
    pub fn key(&self) -> String {
        match self {
            Self::Raw(name) => normalize(name),
            Self::Typed(typed) => normalize(typed.kind.name()),
        }
    }
}

impl From<&str> for Capability {
    fn from(name: &str) -> Self {
        Self::Raw(name.to_string())
    }
}

impl From<String> for Capability {
    fn from(name: String) -> Self {
        Self::Raw(name)
    }
}

impl From<TypedCapability> for Capability {
    fn from(typed: TypedCapability) -> Self {
        Self::Typed(typed)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  Web_Search "), "web_search");
        assert_eq!(normalize("search"), "search");
    }

    #[test]
    fn test_all_forms_share_a_key() {
        let raw = Capability::from("Search");
        let typed = Capability::from(TypedCapability::new("search ").with_description("web"));
        let member = Capability::from(TypedCapability::member("SEARCH"));

        assert_eq!(raw.key(), "search");
        assert_eq!(typed.key(), "search");
        assert_eq!(member.key(), "search");
    }

    #[test]
    fn test_deserialize_descriptor_shapes() {
        let parsed: Vec<Capability> = serde_json::from_value(json!([
            "summarize",
            {"type": "translate", "description": "any language"},
            {"type": {"value": "Code"}}
        ]))
        .unwrap();

        let keys: Vec<String> = parsed.iter().map(Capability::key).collect();
        assert_eq!(keys, vec!["summarize", "translate", "code"]);
    }

    #[test]
    fn test_display_uses_key() {
        assert_eq!(Capability::from(" Plan ").to_string(), "plan");
    }
}
