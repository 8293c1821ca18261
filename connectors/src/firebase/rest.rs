//! REST clients for Firestore and the Identity Toolkit account directory.

use super::config::FirebaseConfig;
use super::store::{
    CollectionRef, Document, DocumentStore, FieldValue, Principal, PrincipalDirectory,
    PrincipalPage,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use intake::SyncError;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;

const USERS_PAGE_SIZE: usize = 1000;
const COLLECTION_IDS_PAGE_SIZE: usize = 100;

fn http_client() -> Result<Client> {
    Client::builder()
        .user_agent("intake-connector/1.0")
        .build()
        .context("Failed to build HTTP client")
}

async fn check_response_status(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = format!("{} failed with status {}: {}", what, status, body);
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(SyncError::Configuration(message).into());
    }
    Err(SyncError::Connection(message).into())
}

// ---------------------------------------------------------------------------
// Firestore
// ---------------------------------------------------------------------------

/// Firestore REST client (`runQuery` with offset/limit for paging).
pub struct FirestoreRestClient {
    http_client: Client,
    access_token: String,
    /// `<base>/v1/projects/<id>/databases/(default)/documents`
    documents_url: String,
    /// `projects/<id>/databases/(default)/documents`
    documents_name: String,
}

impl FirestoreRestClient {
    pub fn new(config: &FirebaseConfig) -> Result<Self> {
        let documents_name = format!(
            "projects/{}/databases/(default)/documents",
            config.project_id
        );
        Ok(Self {
            http_client: http_client()?,
            access_token: config.access_token.clone(),
            documents_url: format!("{}/v1/{}", config.base_url.trim_end_matches('/'), documents_name),
            documents_name,
        })
    }

    fn parent_url(&self, parent: Option<&str>) -> String {
        match parent {
            Some(path) => format!("{}/{}", self.documents_url, path),
            None => self.documents_url.clone(),
        }
    }

    fn relative_path<'a>(&self, name: &'a str) -> &'a str {
        name.strip_prefix(&self.documents_name)
            .map(|p| p.trim_start_matches('/'))
            .unwrap_or(name)
    }
}

#[derive(Deserialize)]
struct RunQueryResponseItem {
    document: Option<WireDocument>,
}

#[derive(Deserialize)]
struct WireDocument {
    name: String,
    #[serde(default)]
    fields: Option<BTreeMap<String, WireValue>>,
}

/// Firestore wire encoding: `{"stringValue": "x"}`, `{"mapValue": {"fields": {...}}}`, ...
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
enum WireValue {
    NullValue(()),
    BooleanValue(bool),
    IntegerValue(String),
    DoubleValue(f64),
    TimestampValue(DateTime<Utc>),
    StringValue(String),
    BytesValue(String),
    ReferenceValue(String),
    GeoPointValue(WireLatLng),
    ArrayValue(WireArray),
    MapValue(WireMap),
}

#[derive(Deserialize)]
struct WireLatLng {
    #[serde(default)]
    latitude: f64,
    #[serde(default)]
    longitude: f64,
}

#[derive(Deserialize)]
struct WireArray {
    #[serde(default)]
    values: Vec<WireValue>,
}

#[derive(Deserialize)]
struct WireMap {
    #[serde(default)]
    fields: BTreeMap<String, WireValue>,
}

impl TryFrom<WireValue> for FieldValue {
    type Error = anyhow::Error;

    fn try_from(value: WireValue) -> Result<Self> {
        Ok(match value {
            WireValue::NullValue(_) => FieldValue::Null,
            WireValue::BooleanValue(b) => FieldValue::Boolean(b),
            WireValue::IntegerValue(s) => FieldValue::Integer(
                s.parse()
                    .map_err(|e| anyhow!("invalid integerValue {}: {}", s, e))?,
            ),
            WireValue::DoubleValue(d) => FieldValue::Double(d),
            WireValue::TimestampValue(t) => FieldValue::Timestamp(t),
            WireValue::StringValue(s) => FieldValue::String(s),
            WireValue::BytesValue(s) => FieldValue::Bytes(s),
            WireValue::ReferenceValue(s) => FieldValue::Reference(s),
            WireValue::GeoPointValue(p) => FieldValue::GeoPoint {
                latitude: p.latitude,
                longitude: p.longitude,
            },
            WireValue::ArrayValue(a) => FieldValue::Array(
                a.values
                    .into_iter()
                    .map(FieldValue::try_from)
                    .collect::<Result<_>>()?,
            ),
            WireValue::MapValue(m) => FieldValue::Map(decode_fields(m.fields)?),
        })
    }
}

fn decode_fields(fields: BTreeMap<String, WireValue>) -> Result<BTreeMap<String, FieldValue>> {
    fields
        .into_iter()
        .map(|(name, value)| Ok((name, FieldValue::try_from(value)?)))
        .collect()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListCollectionIdsResponse {
    #[serde(default)]
    collection_ids: Vec<String>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[async_trait]
impl DocumentStore for FirestoreRestClient {
    async fn list_documents(
        &self,
        collection: &CollectionRef,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Document>> {
        let url = format!("{}:runQuery", self.parent_url(collection.parent.as_deref()));
        let body = json!({
            "structuredQuery": {
                "from": [{"collectionId": collection.id}],
                "orderBy": [{"field": {"fieldPath": "__name__"}, "direction": "ASCENDING"}],
                "offset": offset,
                "limit": limit,
            }
        });

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| SyncError::Connection(format!("Firestore runQuery request failed: {}", e)))?;
        let response = check_response_status(response, "Firestore runQuery").await?;
        let items: Vec<RunQueryResponseItem> = response
            .json()
            .await
            .context("Failed to parse Firestore runQuery response")?;

        items
            .into_iter()
            .filter_map(|item| item.document)
            .map(|doc| {
                let path = self.relative_path(&doc.name).to_string();
                let id = path.rsplit('/').next().unwrap_or_default().to_string();
                let fields = decode_fields(doc.fields.unwrap_or_default())?;
                Ok(Document {
                    id,
                    path,
                    fields: Some(fields),
                })
            })
            .collect()
    }

    async fn sub_collection(&self, document: &Document, name: &str) -> Result<Option<CollectionRef>> {
        let url = format!("{}:listCollectionIds", self.parent_url(Some(&document.path)));
        let mut page_token: Option<String> = None;
        loop {
            let mut body = json!({"pageSize": COLLECTION_IDS_PAGE_SIZE});
            if let Some(token) = &page_token {
                body["pageToken"] = json!(token);
            }
            let response = self
                .http_client
                .post(&url)
                .bearer_auth(&self.access_token)
                .json(&body)
                .send()
                .await
                .map_err(|e| {
                    SyncError::Connection(format!("Firestore listCollectionIds request failed: {}", e))
                })?;
            let response = check_response_status(response, "Firestore listCollectionIds").await?;
            let page: ListCollectionIdsResponse = response
                .json()
                .await
                .context("Failed to parse Firestore listCollectionIds response")?;

            if page.collection_ids.iter().any(|id| id == name) {
                return Ok(Some(CollectionRef::under(document.path.clone(), name)));
            }
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => return Ok(None),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Identity Toolkit
// ---------------------------------------------------------------------------

/// Lists project accounts via `accounts:batchGet`.
pub struct IdentityToolkitClient {
    http_client: Client,
    access_token: String,
    batch_get_url: String,
}

impl IdentityToolkitClient {
    pub fn new(config: &FirebaseConfig) -> Result<Self> {
        Ok(Self {
            http_client: http_client()?,
            access_token: config.access_token.clone(),
            batch_get_url: format!(
                "{}/v1/projects/{}/accounts:batchGet",
                config.auth_base_url.trim_end_matches('/'),
                config.project_id
            ),
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchGetResponse {
    #[serde(default)]
    users: Vec<UserInfo>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserInfo {
    local_id: String,
    email: Option<String>,
    phone_number: Option<String>,
    #[serde(default)]
    disabled: bool,
    #[serde(default)]
    provider_user_info: Vec<ProviderUserInfo>,
    created_at: Option<String>,
    last_login_at: Option<String>,
    last_refresh_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProviderUserInfo {
    provider_id: String,
}

fn parse_millis(raw: Option<&str>) -> i64 {
    raw.and_then(|s| s.parse().ok()).unwrap_or(0)
}

impl From<UserInfo> for Principal {
    fn from(user: UserInfo) -> Self {
        Principal {
            created_at_ms: parse_millis(user.created_at.as_deref()),
            last_login_ms: parse_millis(user.last_login_at.as_deref()),
            last_refresh_ms: user.last_refresh_at.map(|t| t.timestamp_millis()).unwrap_or(0),
            uid: user.local_id,
            email: user.email,
            phone_number: user.phone_number,
            disabled: user.disabled,
            provider_ids: user
                .provider_user_info
                .into_iter()
                .map(|p| p.provider_id)
                .collect(),
        }
    }
}

#[async_trait]
impl PrincipalDirectory for IdentityToolkitClient {
    async fn list_principals(&self, page_token: Option<&str>) -> Result<PrincipalPage> {
        let mut request = self
            .http_client
            .get(&self.batch_get_url)
            .bearer_auth(&self.access_token)
            .query(&[("maxResults", USERS_PAGE_SIZE.to_string())]);
        if let Some(token) = page_token {
            request = request.query(&[("nextPageToken", token)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SyncError::Connection(format!("accounts:batchGet request failed: {}", e)))?;
        let response = check_response_status(response, "accounts:batchGet").await?;
        let page: BatchGetResponse = response
            .json()
            .await
            .context("Failed to parse accounts:batchGet response")?;

        Ok(PrincipalPage {
            principals: page.users.into_iter().map(Principal::from).collect(),
            next_page_token: page.next_page_token.filter(|t| !t.is_empty()),
        })
    }
}
