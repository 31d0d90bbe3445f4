//! Core domain types for the vellum collaboration client.
//!
//! Holds the document snapshot model and the seams to the two external
//! collaborators: the auth layer (bearer credentials) and the document
//! store (snapshot loading). The realtime transport lives in
//! `vellum-collab` and depends on this crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Snapshot of a collaborative document as served by the document store.
///
/// Timestamps are opaque server-produced strings; nothing in the client
/// parses them.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_username: Option<String>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

impl Document {
    /// Creates an empty document with a fresh id. Mostly useful for tests
    /// and in-memory stores.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            content: String::new(),
            owner_username: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }
}

/// Errors surfaced by a [`DocumentSource`].
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentError {
    /// No document exists under the requested id.
    NotFound(Uuid),
    /// The backing store could not be reached or answered abnormally.
    Unavailable(String),
}

impl std::fmt::Display for DocumentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocumentError::NotFound(id) => write!(f, "document {id} not found"),
            DocumentError::Unavailable(msg) => write!(f, "document store unavailable: {msg}"),
        }
    }
}

impl std::error::Error for DocumentError {}

/// Where bearer credentials for the collaboration endpoint come from.
///
/// Token issuance and user management live outside this workspace; the
/// transport only attaches what this source hands it. Either field may be
/// absent for anonymous sessions.
pub trait CredentialSource: Send + Sync {
    /// Bearer token attached as the `Authorization` connect header.
    fn token(&self) -> Option<String>;

    /// Username attached as a connect header and used to filter the local
    /// user's own presence frames out of the remote set.
    fn username(&self) -> Option<String>;
}

/// Fixed credentials, the common case for native clients and tests.
#[derive(Clone, Debug, Default)]
pub struct StaticCredentials {
    token: Option<String>,
    username: Option<String>,
}

impl StaticCredentials {
    pub fn new(username: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            username: Some(username.into()),
        }
    }

    /// Credentials carrying neither a token nor a username.
    pub fn anonymous() -> Self {
        Self::default()
    }
}

impl CredentialSource for StaticCredentials {
    fn token(&self) -> Option<String> {
        self.token.clone()
    }

    fn username(&self) -> Option<String> {
        self.username.clone()
    }
}

/// Read side of the external document store.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Fetch the current snapshot of a document.
    async fn fetch(&self, id: Uuid) -> Result<Document, DocumentError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_json_shape_is_camel_case() {
        let mut doc = Document::new("Design notes");
        doc.content = "hello".into();
        doc.owner_username = Some("ada".into());
        doc.created_at = "2025-11-02T10:00:00Z".into();

        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["name"], "Design notes");
        assert_eq!(json["ownerUsername"], "ada");
        assert_eq!(json["createdAt"], "2025-11-02T10:00:00Z");
        assert!(json.get("owner_username").is_none());
    }

    #[test]
    fn test_document_decodes_with_missing_optionals() {
        let raw = r#"{"id":"6cbe44b6-7af4-4c41-9003-5ce30a83b568","name":"Spec"}"#;
        let doc: Document = serde_json::from_str(raw).unwrap();
        assert_eq!(doc.name, "Spec");
        assert_eq!(doc.content, "");
        assert!(doc.owner_username.is_none());
    }

    #[test]
    fn test_static_credentials() {
        let creds = StaticCredentials::new("ada", "tok-123");
        assert_eq!(creds.username().as_deref(), Some("ada"));
        assert_eq!(creds.token().as_deref(), Some("tok-123"));

        let anon = StaticCredentials::anonymous();
        assert!(anon.token().is_none());
        assert!(anon.username().is_none());
    }

    #[test]
    fn test_document_error_display() {
        let id = Uuid::nil();
        let err = DocumentError::NotFound(id);
        assert!(err.to_string().contains("not found"));

        let err = DocumentError::Unavailable("connection refused".into());
        assert!(err.to_string().contains("connection refused"));
    }
}
