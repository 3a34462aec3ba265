//! Core record type definitions.
//!
//! Defines [`RecordType`] (the tagged record discriminator), [`Record`] (a
//! persisted memory row), [`Entity`] (a caller-tagged span attached to a
//! record), and the entity payload shape accepted on the write path.

use serde::{Deserialize, Serialize};

/// The user scope applied when a request carries none.
pub const DEFAULT_USER_ID: &str = "default_user";

/// Maximum accepted `source_text` length after trimming.
pub const MAX_TEXT_LEN: usize = 10_000;

/// Maximum number of entities accepted per record.
pub const MAX_ENTITIES: usize = 100;

/// Discriminator for persisted records. Records differ only by this tag;
/// callers may supply their own type strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordType {
    /// A memory stored explicitly by the user or an agent on their behalf.
    UserMemory,
    /// A record produced by the screen observer.
    ScreenCapture,
    /// Any other caller-defined type tag.
    Other(String),
}

impl RecordType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::UserMemory => "user_memory",
            Self::ScreenCapture => "screen_capture",
            Self::Other(s) => s.as_str(),
        }
    }
}

impl From<&str> for RecordType {
    fn from(s: &str) -> Self {
        match s {
            "user_memory" => Self::UserMemory,
            "screen_capture" => Self::ScreenCapture,
            other => Self::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for RecordType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RecordType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(RecordType::from(s.as_str()))
    }
}

/// A persisted memory record, matching the `memory` table schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    /// Opaque id, shape `mem_<ms-epoch>_<8-hex>`.
    pub id: String,
    /// Owner scope; every read filters on it.
    #[serde(rename = "userId")]
    pub user_id: String,
    /// Record discriminator.
    #[serde(rename = "type")]
    pub record_type: RecordType,
    /// Canonical textual content (≤ 10 000 chars after trim).
    #[serde(rename = "text")]
    pub source_text: String,
    /// Opaque caller metadata. Stored string-serialized, exposed as JSON.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// Optional screenshot path or identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    /// Optional secondary text (OCR output and the like).
    #[serde(rename = "extractedText", skip_serializing_if = "Option::is_none")]
    pub extracted_text: Option<String>,
    /// 384-dim L2-normalized embedding. Absent only on legacy rows.
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    /// ISO 8601 creation timestamp.
    #[serde(rename = "createdAt")]
    pub created_at: String,
    /// ISO 8601 last-modification timestamp.
    #[serde(rename = "updatedAt")]
    pub updated_at: String,
}

/// A caller-tagged entity attached to a record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    #[serde(rename = "memoryId")]
    pub memory_id: String,
    /// Display value, e.g. `"Dr. Smith"`.
    #[serde(rename = "value")]
    pub entity: String,
    /// Caller tag, e.g. `"person"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Normalized tag; defaults to the caller tag.
    #[serde(rename = "entityType")]
    pub entity_type: String,
    /// Lower-cased canonical form of the value.
    #[serde(rename = "normalizedValue")]
    pub normalized_value: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
}

impl Entity {
    /// Build an entity row for a record, normalizing per the storage contract.
    pub fn new(memory_id: &str, kind: &str, value: &str) -> Self {
        Self {
            id: super::mint_row_id(),
            memory_id: memory_id.to_string(),
            entity: value.to_string(),
            kind: kind.to_string(),
            entity_type: kind.to_string(),
            normalized_value: value.trim().to_lowercase(),
            created_at: super::now_rfc3339(),
        }
    }
}

/// Entity shape accepted on the write path.
#[derive(Debug, Clone, Deserialize)]
pub struct EntityInput {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub value: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_type_round_trips() {
        assert_eq!(RecordType::from("user_memory"), RecordType::UserMemory);
        assert_eq!(RecordType::from("screen_capture"), RecordType::ScreenCapture);
        assert_eq!(
            RecordType::from("bookmark"),
            RecordType::Other("bookmark".into())
        );
        assert_eq!(RecordType::ScreenCapture.as_str(), "screen_capture");
    }

    #[test]
    fn record_type_serde_is_plain_string() {
        let json = serde_json::to_string(&RecordType::UserMemory).unwrap();
        assert_eq!(json, "\"user_memory\"");
        let back: RecordType = serde_json::from_str("\"bookmark\"").unwrap();
        assert_eq!(back, RecordType::Other("bookmark".into()));
    }

    #[test]
    fn entity_normalizes_value() {
        let e = Entity::new("mem_1_abc", "person", "  Dr. Smith ");
        assert_eq!(e.normalized_value, "dr. smith");
        assert_eq!(e.entity, "  Dr. Smith ");
        assert_eq!(e.entity_type, "person");
        assert!(!e.id.is_empty());
    }
}
