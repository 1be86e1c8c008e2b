use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ContentIdError;

/// Separator between the three segments of a canonical content identifier.
pub const CONTENT_ID_DELIMITER: &str = "::";

/// Canonical identifier of one node of content: `table::domain::id`.
///
/// `table` and `content_domain` may be empty; `id` is always a decimal integer.
/// Neither text segment may contain the delimiter or start or end with `:`,
/// so every formatted id parses back to itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentId {
    pub table: String,
    pub content_domain: String,
    pub id: i64,
}

impl ContentId {
    pub fn new(
        table: impl Into<String>,
        content_domain: impl Into<String>,
        id: i64,
    ) -> Result<Self, ContentIdError> {
        let table = table.into();
        let content_domain = content_domain.into();
        for segment in [&table, &content_domain] {
            check_segment(segment)?;
        }
        Ok(Self {
            table,
            content_domain,
            id,
        })
    }
}

fn check_segment(segment: &str) -> Result<(), ContentIdError> {
    let edge_colon = segment.starts_with(':') || segment.ends_with(':');
    if edge_colon || segment.contains(CONTENT_ID_DELIMITER) {
        return Err(ContentIdError::DelimiterInSegment {
            segment: segment.to_string(),
        });
    }
    Ok(())
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{CONTENT_ID_DELIMITER}{}{CONTENT_ID_DELIMITER}{}",
            self.table, self.content_domain, self.id
        )
    }
}

impl FromStr for ContentId {
    type Err = ContentIdError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let segments: Vec<&str> = raw.split(CONTENT_ID_DELIMITER).collect();
        let [table, content_domain, id] = segments.as_slice() else {
            return Err(ContentIdError::WrongSegmentCount {
                raw: raw.to_string(),
                found: segments.len(),
            });
        };
        let id = id
            .parse::<i64>()
            .map_err(|_| ContentIdError::InvalidNumericId {
                raw: raw.to_string(),
                segment: id.to_string(),
            })?;
        Self::new(*table, *content_domain, id)
    }
}

/// Kind of a locally recorded action against a piece of content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Dismiss,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::Dismiss => "dismiss",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "dismiss" => Some(ActionType::Dismiss),
            _ => None,
        }
    }
}

/// A durable record suppressing re-display of dismissed content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DismissAction {
    pub content_id: String,
    pub action_type: ActionType,
    pub recorded_at: DateTime<Utc>,
}

impl DismissAction {
    pub fn dismiss(content_id: impl Into<String>) -> Self {
        Self {
            content_id: content_id.into(),
            action_type: ActionType::Dismiss,
            recorded_at: Utc::now(),
        }
    }
}

/// A pending action paired with the semantic properties stored for its content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionWithSemantics {
    pub action: DismissAction,
    pub semantic_properties: Option<Vec<u8>>,
}

/// Information about the host application sent with every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub locale: String,
    pub platform: String,
    pub app_version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            locale: "en-US".into(),
            platform: std::env::consts::OS.into(),
            app_version: env!("CARGO_PKG_VERSION").into(),
        }
    }
}
