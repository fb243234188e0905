//! Change feed messages delivered by remote subscriptions

use crate::remote::Document;
use serde::{Deserialize, Serialize};

/// What happened to a document in a watched collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One change notification from a subscribed collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    /// Document key within the collection
    pub doc_id: String,
    /// Full document for added/modified, last known state for removed
    pub document: Option<Document>,
}

impl ChangeEvent {
    pub fn added(doc_id: impl Into<String>, document: Document) -> Self {
        Self {
            kind: ChangeKind::Added,
            doc_id: doc_id.into(),
            document: Some(document),
        }
    }

    pub fn modified(doc_id: impl Into<String>, document: Document) -> Self {
        Self {
            kind: ChangeKind::Modified,
            doc_id: doc_id.into(),
            document: Some(document),
        }
    }

    pub fn removed(doc_id: impl Into<String>, last_known: Option<Document>) -> Self {
        Self {
            kind: ChangeKind::Removed,
            doc_id: doc_id.into(),
            document: last_known,
        }
    }
}
