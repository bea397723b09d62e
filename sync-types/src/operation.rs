//! Operation log records.
//!
//! An [`Operation`] is one atomic mutation a device wants every other
//! device in its group to apply. The statement and its arguments are
//! opaque here; only the type and the related entities matter, and only
//! for conflict detection.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::SyncError;

/// Kind of mutation an operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    /// Entity creation.
    Create,
    /// Entity modification.
    Update,
    /// Entity removal. Supersedes anything recorded before it on the
    /// same entity.
    Delete,
}

impl OperationType {
    /// Stable textual form, as stored in the log.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE" => Ok(Self::Create),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            other => Err(SyncError::InvalidData(format!(
                "unknown operation type: {other}"
            ))),
        }
    }
}

/// An entity touched by an operation, identified by `(id, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelatedEntity {
    /// Entity identifier.
    pub id: String,
    /// Entity kind (e.g. table name).
    pub name: String,
}

impl RelatedEntity {
    /// Create a new entity reference.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// One atomic logged mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Mutation kind.
    pub kind: OperationType,
    /// Serialized command (e.g. a SQL statement).
    pub statement: String,
    /// Serialized parameters for `statement`, if any.
    pub arguments: Option<String>,
    /// Entities this operation touches.
    pub related_entities: Vec<RelatedEntity>,
}

impl Operation {
    /// Create an operation without arguments or entities.
    pub fn new(kind: OperationType, statement: impl Into<String>) -> Self {
        Self {
            kind,
            statement: statement.into(),
            arguments: None,
            related_entities: Vec::new(),
        }
    }

    /// Attach an argument payload.
    pub fn with_arguments(mut self, arguments: impl Into<String>) -> Self {
        self.arguments = Some(arguments.into());
        self
    }

    /// Attach a related entity.
    pub fn with_entity(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.related_entities.push(RelatedEntity::new(id, name));
        self
    }

    /// Whether this is a DELETE with no argument payload.
    ///
    /// Such deletes are considered already reconciled: they still take
    /// part in conflict compaction but are never delivered to devices.
    pub fn is_tombstone(&self) -> bool {
        self.kind == OperationType::Delete
            && self
                .arguments
                .as_deref()
                .map(|args| {
                    let args = args.trim();
                    args.is_empty() || args == "[]"
                })
                .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_type_text_form() {
        for kind in [
            OperationType::Create,
            OperationType::Update,
            OperationType::Delete,
        ] {
            assert_eq!(kind.as_str().parse::<OperationType>().unwrap(), kind);
        }
        assert!("UPSERT".parse::<OperationType>().is_err());
    }

    #[test]
    fn operation_type_serializes_uppercase() {
        let json = serde_json::to_string(&OperationType::Delete).unwrap();
        assert_eq!(json, "\"DELETE\"");
    }

    #[test]
    fn tombstone_requires_delete_without_payload() {
        let delete = Operation::new(OperationType::Delete, "DELETE FROM notes WHERE id = ?");
        assert!(delete.is_tombstone());
        assert!(delete.clone().with_arguments("[]").is_tombstone());
        assert!(delete.clone().with_arguments("  ").is_tombstone());
        assert!(!delete.with_arguments("[\"note-1\"]").is_tombstone());

        let update = Operation::new(OperationType::Update, "UPDATE notes SET x = 1");
        assert!(!update.is_tombstone());
    }

    #[test]
    fn builder_collects_entities() {
        let op = Operation::new(OperationType::Create, "INSERT")
            .with_entity("1", "notes")
            .with_entity("2", "tags");
        assert_eq!(op.related_entities.len(), 2);
        assert_eq!(op.related_entities[1], RelatedEntity::new("2", "tags"));
    }
}
