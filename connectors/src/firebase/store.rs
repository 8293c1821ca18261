//! Collaborator seams of the Firebase driver: a document store and a
//! principal (user account) directory.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// A document field value.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Timestamp(DateTime<Utc>),
    String(String),
    /// Base64-encoded bytes.
    Bytes(String),
    /// Path of the referenced document.
    Reference(String),
    GeoPoint { latitude: f64, longitude: f64 },
    Array(Vec<FieldValue>),
    Map(BTreeMap<String, FieldValue>),
}

/// Reference to a collection: a root collection, or a named sub-collection
/// under a document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectionRef {
    /// Path of the owning document (`users/abc`), `None` for root collections.
    pub parent: Option<String>,
    pub id: String,
}

impl CollectionRef {
    pub fn root(id: impl Into<String>) -> Self {
        Self {
            parent: None,
            id: id.into(),
        }
    }

    pub fn under(document_path: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            parent: Some(document_path.into()),
            id: id.into(),
        }
    }

    /// Slash-separated path relative to the database root.
    pub fn path(&self) -> String {
        match &self.parent {
            Some(parent) => format!("{}/{}", parent, self.id),
            None => self.id.clone(),
        }
    }
}

/// A fetched document.
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    pub id: String,
    /// Slash-separated path relative to the database root.
    pub path: String,
    /// `None` for documents that exist only as parents of sub-collections.
    pub fields: Option<BTreeMap<String, FieldValue>>,
}

/// Paginated access to a hierarchical document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Up to `limit` documents of `collection`, ordered by id, skipping `offset`.
    async fn list_documents(
        &self,
        collection: &CollectionRef,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Document>>;

    /// The sub-collection `name` under `document`, or `None` if it doesn't exist.
    async fn sub_collection(&self, document: &Document, name: &str) -> Result<Option<CollectionRef>>;
}

/// One user account.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Principal {
    pub uid: String,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub disabled: bool,
    /// Linked sign-in providers (`password`, `google.com`, ...).
    pub provider_ids: Vec<String>,
    /// Epoch milliseconds; 0 when unknown.
    pub created_at_ms: i64,
    pub last_login_ms: i64,
    pub last_refresh_ms: i64,
}

/// One page of principals plus the token of the next page.
#[derive(Clone, Debug, Default)]
pub struct PrincipalPage {
    pub principals: Vec<Principal>,
    pub next_page_token: Option<String>,
}

/// Paginated iterator over all user accounts.
#[async_trait]
pub trait PrincipalDirectory: Send + Sync {
    async fn list_principals(&self, page_token: Option<&str>) -> Result<PrincipalPage>;
}
