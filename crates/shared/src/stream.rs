//! Canonical, adapter-normalized operations and the payloads they carry.
//!
//! Everything downstream of the protocol adapter (store backends, sessions,
//! model providers) speaks only these types.

use serde::{Deserialize, Serialize};

/// Operation kind shared by data operations and session journal entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    UpdateOrAppend,
    Remove,
    ClearAll,
}

/// One structural entry in a session journal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StreamStructure {
    ClearAll,
    UpdateOrAppend {
        content_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<String>,
    },
    Remove {
        content_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<String>,
    },
}

impl StreamStructure {
    pub fn update_or_append(content_id: impl Into<String>, parent_id: Option<String>) -> Self {
        StreamStructure::UpdateOrAppend {
            content_id: content_id.into(),
            parent_id,
        }
    }

    pub fn remove(content_id: impl Into<String>, parent_id: Option<String>) -> Self {
        StreamStructure::Remove {
            content_id: content_id.into(),
            parent_id,
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            StreamStructure::ClearAll => OperationKind::ClearAll,
            StreamStructure::UpdateOrAppend { .. } => OperationKind::UpdateOrAppend,
            StreamStructure::Remove { .. } => OperationKind::Remove,
        }
    }

    pub fn content_id(&self) -> Option<&str> {
        match self {
            StreamStructure::ClearAll => None,
            StreamStructure::UpdateOrAppend { content_id, .. }
            | StreamStructure::Remove { content_id, .. } => Some(content_id),
        }
    }

    pub fn parent_id(&self) -> Option<&str> {
        match self {
            StreamStructure::ClearAll => None,
            StreamStructure::UpdateOrAppend { parent_id, .. }
            | StreamStructure::Remove { parent_id, .. } => parent_id.as_deref(),
        }
    }
}

/// Renderable tree node content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFeature {
    #[serde(with = "bytes_b64")]
    pub content: Vec<u8>,
    /// Response creation time attached by the metadata transformer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_created_ms: Option<i64>,
}

/// A pagination continuation bound to a parent node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamToken {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(with = "bytes_b64")]
    pub next_page_token: Vec<u8>,
}

/// Cross-node shared styling/resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSharedState {
    pub content_id: String,
    #[serde(with = "bytes_b64")]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StreamPayload {
    Feature(StreamFeature),
    Token(StreamToken),
    SharedState(StreamSharedState),
    SemanticData(#[serde(with = "bytes_b64")] Vec<u8>),
}

/// A canonical data operation: a structural change plus at most one payload.
///
/// `ClearAll` and `Remove` carry no payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDataOperation {
    pub structure: StreamStructure,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<StreamPayload>,
}

impl StreamDataOperation {
    pub fn clear_all() -> Self {
        Self {
            structure: StreamStructure::ClearAll,
            payload: None,
        }
    }

    pub fn remove(content_id: impl Into<String>, parent_id: Option<String>) -> Self {
        Self {
            structure: StreamStructure::remove(content_id, parent_id),
            payload: None,
        }
    }

    pub fn update_or_append(
        content_id: impl Into<String>,
        parent_id: Option<String>,
        payload: StreamPayload,
    ) -> Self {
        Self {
            structure: StreamStructure::update_or_append(content_id, parent_id),
            payload: Some(payload),
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.structure.kind()
    }

    pub fn content_id(&self) -> Option<&str> {
        self.structure.content_id()
    }

    /// True when the payload is a tree node (feature or token) rather than
    /// side data that never enters a session journal.
    pub fn is_structural(&self) -> bool {
        match &self.payload {
            None => true,
            Some(StreamPayload::Feature(_)) | Some(StreamPayload::Token(_)) => true,
            Some(StreamPayload::SharedState(_)) | Some(StreamPayload::SemanticData(_)) => false,
        }
    }
}

/// A stored payload keyed by its content id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadWithId {
    pub content_id: String,
    pub payload: StreamPayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemanticPropertiesWithId {
    pub content_id: String,
    pub semantic_data: Vec<u8>,
}

mod bytes_b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        STANDARD.decode(raw).map_err(serde::de::Error::custom)
    }
}
