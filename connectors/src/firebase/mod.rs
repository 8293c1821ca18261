//! Firebase source: Firestore collections (optionally nested through
//! wildcard paths) and the project's user accounts.

pub mod config;
pub mod convert;
pub mod rest;
pub mod store;

pub use config::{FirebaseConfig, FirestoreParameters};
pub use rest::{FirestoreRestClient, IdentityToolkitClient};
pub use store::{CollectionRef, Document, DocumentStore, FieldValue, Principal, PrincipalDirectory};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use intake::config::FirebaseSettings;
use intake::driver::collection_meta_key;
use intake::{Collection, Driver, ObjectsLoader, Record, SourceConfig, SyncError, TimeInterval};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};

pub const FIREBASE_TYPE: &str = "firebase";
pub const FIRESTORE_COLLECTION: &str = "firestore";
pub const USERS_COLLECTION: &str = "users";
pub const DOCUMENT_ID_FIELD: &str = "_firestore_document_id";

const PATH_WILDCARD: &str = "/*/";

enum CollectionKind {
    /// Path expression like `users/*/orders`.
    Firestore(String),
    Users,
}

pub struct FirebaseDriver {
    documents: Arc<dyn DocumentStore>,
    principals: Arc<dyn PrincipalDirectory>,
    collection: Collection,
    kind: CollectionKind,
    settings: FirebaseSettings,
}

impl FirebaseDriver {
    /// Builds a driver backed by the Firestore and Identity Toolkit REST APIs.
    pub fn new(
        source_config: &SourceConfig,
        collection: Collection,
        settings: FirebaseSettings,
    ) -> Result<Self> {
        let config: FirebaseConfig = source_config.parse()?;
        config.validate()?;
        let documents = Arc::new(FirestoreRestClient::new(&config)?);
        let principals = Arc::new(IdentityToolkitClient::new(&config)?);
        Self::with_clients(collection, settings, documents, principals)
    }

    pub fn with_clients(
        collection: Collection,
        settings: FirebaseSettings,
        documents: Arc<dyn DocumentStore>,
        principals: Arc<dyn PrincipalDirectory>,
    ) -> Result<Self> {
        let kind = match collection.kind.as_str() {
            FIRESTORE_COLLECTION => {
                let params: FirestoreParameters = collection.parse_parameters()?;
                params.validate()?;
                CollectionKind::Firestore(params.collection)
            }
            USERS_COLLECTION => CollectionKind::Users,
            other => {
                return Err(SyncError::Configuration(format!(
                    "unsupported collection type {}: only [{}] and [{}] collections are allowed",
                    other, USERS_COLLECTION, FIRESTORE_COLLECTION
                ))
                .into())
            }
        };

        Ok(Self {
            documents,
            principals,
            collection,
            kind,
            settings,
        })
    }

    /// All documents matched by `expression`, ancestor ids merged in.
    async fn load_collection(&self, expression: &str) -> Result<Vec<Record>> {
        let mut segments = expression.split(PATH_WILDCARD).map(str::to_string);
        let root = segments.next().unwrap_or_default();
        let rest: Vec<String> = segments.collect();

        let mut result = Vec::new();
        self.dive_and_fetch(
            CollectionRef::root(root),
            Record::new(),
            DOCUMENT_ID_FIELD.to_string(),
            &rest,
            &mut result,
        )
        .await
        .with_context(|| format!("Failed to load firestore collection (expression={})", expression))?;
        Ok(result)
    }

    /// Pages through `collection`. With `paths` left, descends into the next
    /// sub-collection of every document; otherwise collects the documents.
    fn dive_and_fetch<'a>(
        &'a self,
        collection: CollectionRef,
        parent_ids: Record,
        id_field: String,
        paths: &'a [String],
        result: &'a mut Vec<Record>,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let page_size = self.settings.page_size.max(1);
            let deadline = Instant::now() + Duration::from_secs(self.settings.page_timeout_secs);
            let mut offset = 0;

            loop {
                let page = timeout_at(
                    deadline,
                    self.documents.list_documents(&collection, offset, page_size),
                )
                .await
                .map_err(|_| SyncError::Timeout {
                    operation: format!("listing collection [{}]", collection.path()),
                    timeout: Duration::from_secs(self.settings.page_timeout_secs),
                })??;
                let fetched = page.len();
                debug!(collection = %collection.path(), offset, fetched, "Fetched page");

                for doc in page {
                    if let Some((sub_name, remaining)) = paths.split_first() {
                        let lookup = timeout_at(deadline, self.documents.sub_collection(&doc, sub_name))
                            .await
                            .map_err(|_| SyncError::Timeout {
                                operation: format!("looking up [{}] under [{}]", sub_name, doc.path),
                                timeout: Duration::from_secs(self.settings.page_timeout_secs),
                            })??;
                        let sub = match lookup {
                            Some(sub) => sub,
                            None => continue,
                        };

                        let mut ids = parent_ids.clone();
                        ids.insert(id_field.clone(), Value::String(doc.id.clone()));
                        let sub_id_field = format!("{}_{}", id_field, sub_name);
                        self.dive_and_fetch(sub, ids, sub_id_field, remaining, result)
                            .await?;
                    } else {
                        let fields = match doc.fields {
                            Some(fields) => fields,
                            None => continue,
                        };
                        let mut record = convert::document_to_record(fields);
                        record.insert(id_field.clone(), Value::String(doc.id));
                        for (key, value) in &parent_ids {
                            record.insert(key.clone(), value.clone());
                        }
                        result.push(record);
                    }
                }

                if fetched < page_size {
                    return Ok(());
                }
                offset += page_size;
            }
        }
        .boxed()
    }

    async fn load_users(&self) -> Result<Vec<Record>> {
        let users_timeout = Duration::from_secs(self.settings.users_timeout_secs);
        let deadline = Instant::now() + users_timeout;
        let mut users = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let page = timeout_at(deadline, self.principals.list_principals(page_token.as_deref()))
                .await
                .map_err(|_| SyncError::Timeout {
                    operation: "listing firebase users".to_string(),
                    timeout: users_timeout,
                })?
                .context("Failed to list firebase users")?;
            users.extend(page.principals.into_iter().map(convert::principal_to_record));
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => return Ok(users),
            }
        }
    }
}

#[async_trait]
impl Driver for FirebaseDriver {
    fn source_type(&self) -> &str {
        FIREBASE_TYPE
    }

    fn collection_table(&self) -> String {
        self.collection.table_name()
    }

    fn collection_meta_key(&self) -> String {
        collection_meta_key(&self.collection)
    }

    fn refresh_window(&self) -> Result<Duration> {
        Ok(Duration::from_secs(24 * 60 * 60))
    }

    async fn all_available_intervals(&self) -> Result<Vec<TimeInterval>> {
        Ok(vec![TimeInterval::all()])
    }

    async fn get_objects_for(
        &self,
        _interval: &TimeInterval,
        loader: &mut ObjectsLoader<'_>,
    ) -> Result<()> {
        let objects = match &self.kind {
            CollectionKind::Firestore(expression) => self.load_collection(expression).await?,
            CollectionKind::Users => self.load_users().await?,
        };
        let total = objects.len();
        info!(collection = %self.collection.name, objects = total, "Firebase collection loaded");
        loader(objects, 0, total, 100)
    }
}

/// Checks credentials and reachability by reading the first page of users.
pub async fn test_connection(source_config: &SourceConfig) -> Result<()> {
    let config: FirebaseConfig = source_config.parse()?;
    config.validate()?;
    let directory = IdentityToolkitClient::new(&config)?;
    directory
        .list_principals(None)
        .await
        .with_context(|| format!("Firebase project [{}] is not reachable", config.project_id))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::store::PrincipalPage;
    use super::*;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryStore {
        /// collection path → documents in id order
        collections: HashMap<String, Vec<Document>>,
        calls: Mutex<Vec<(String, usize, usize)>>,
    }

    impl MemoryStore {
        fn add(&mut self, collection: &str, id: &str, fields: BTreeMap<String, FieldValue>) {
            self.collections
                .entry(collection.to_string())
                .or_default()
                .push(Document {
                    id: id.to_string(),
                    path: format!("{}/{}", collection, id),
                    fields: Some(fields),
                });
        }
    }

    #[async_trait]
    impl DocumentStore for MemoryStore {
        async fn list_documents(
            &self,
            collection: &CollectionRef,
            offset: usize,
            limit: usize,
        ) -> Result<Vec<Document>> {
            let path = collection.path();
            self.calls.lock().unwrap().push((path.clone(), offset, limit));
            Ok(self
                .collections
                .get(&path)
                .map(|docs| docs.iter().skip(offset).take(limit).cloned().collect())
                .unwrap_or_default())
        }

        async fn sub_collection(&self, document: &Document, name: &str) -> Result<Option<CollectionRef>> {
            let sub = CollectionRef::under(document.path.clone(), name);
            Ok(self.collections.contains_key(&sub.path()).then_some(sub))
        }
    }

    struct NoPrincipals;

    #[async_trait]
    impl PrincipalDirectory for NoPrincipals {
        async fn list_principals(&self, _page_token: Option<&str>) -> Result<PrincipalPage> {
            Ok(PrincipalPage::default())
        }
    }

    fn firestore_collection(expression: &str) -> Collection {
        Collection {
            name: "items".to_string(),
            kind: FIRESTORE_COLLECTION.to_string(),
            table_name: None,
            parameters: serde_json::json!({ "collection": expression }),
        }
    }

    fn driver(store: MemoryStore, expression: &str) -> (FirebaseDriver, Arc<MemoryStore>) {
        let store = Arc::new(store);
        let driver = FirebaseDriver::with_clients(
            firestore_collection(expression),
            FirebaseSettings::default(),
            store.clone(),
            Arc::new(NoPrincipals),
        )
        .unwrap();
        (driver, store)
    }

    fn text(s: &str) -> FieldValue {
        FieldValue::String(s.to_string())
    }

    #[tokio::test]
    async fn test_nested_traversal_merges_ancestor_ids() {
        let mut store = MemoryStore::default();
        store.add("users", "u1", BTreeMap::new());
        store.add("users", "u2", BTreeMap::new());
        store.add("users/u1/orders", "o1", BTreeMap::from([("sku".to_string(), text("a"))]));
        store.add("users/u1/orders", "o2", BTreeMap::from([("sku".to_string(), text("b"))]));
        store.add("users/u2/orders", "o3", BTreeMap::from([("sku".to_string(), text("c"))]));

        let (driver, _) = driver(store, "users/*/orders");
        let records = driver.load_collection("users/*/orders").await.unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(records[0]["sku"], "a");
        assert_eq!(records[0]["_firestore_document_id"], "u1");
        assert_eq!(records[0]["_firestore_document_id_orders"], "o1");
        assert_eq!(records[2]["_firestore_document_id"], "u2");
        assert_eq!(records[2]["_firestore_document_id_orders"], "o3");
        assert!(!records[0].contains_key("_firestore_document_id_orders_orders"));
    }

    #[tokio::test]
    async fn test_missing_sub_collection_yields_nothing() {
        let mut store = MemoryStore::default();
        store.add("users", "u1", BTreeMap::new());
        store.add("users", "u2", BTreeMap::new());
        store.add("users/u2/orders", "o1", BTreeMap::new());

        let (driver, _) = driver(store, "users/*/orders");
        let records = driver.load_collection("users/*/orders").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["_firestore_document_id"], "u2");
    }

    #[tokio::test]
    async fn test_full_page_fetches_next_page() {
        let mut store = MemoryStore::default();
        for i in 0..100 {
            store.add("logs", &format!("{:03}", i), BTreeMap::new());
        }

        let (driver, store) = driver(store, "logs");
        let records = driver.load_collection("logs").await.unwrap();
        assert_eq!(records.len(), 100);
        // an exactly full page needs one more (empty) page to end the level
        assert_eq!(
            *store.calls.lock().unwrap(),
            vec![("logs".to_string(), 0, 100), ("logs".to_string(), 100, 100)]
        );
    }

    #[tokio::test]
    async fn test_users_collection_requires_no_parameters() {
        let collection = Collection {
            name: "accounts".to_string(),
            kind: USERS_COLLECTION.to_string(),
            table_name: Some("firebase_users".to_string()),
            parameters: Value::Null,
        };
        let driver = FirebaseDriver::with_clients(
            collection,
            FirebaseSettings::default(),
            Arc::new(MemoryStore::default()),
            Arc::new(NoPrincipals),
        )
        .unwrap();

        assert_eq!(driver.collection_table(), "firebase_users");
        assert_eq!(driver.collection_meta_key(), "accounts_firebase_users");
        assert_eq!(driver.all_available_intervals().await.unwrap(), vec![TimeInterval::all()]);
        assert_eq!(driver.refresh_window().unwrap(), Duration::from_secs(86400));
    }

    #[test]
    fn test_unknown_collection_kind_rejected() {
        let mut collection = firestore_collection("x");
        collection.kind = "realtime".to_string();
        let err = FirebaseDriver::with_clients(
            collection,
            FirebaseSettings::default(),
            Arc::new(MemoryStore::default()),
            Arc::new(NoPrincipals),
        )
        .err()
        .unwrap();
        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::Configuration(_))
        ));
    }

    #[test]
    fn test_firestore_collection_requires_path() {
        let mut collection = firestore_collection("x");
        collection.parameters = serde_json::json!({});
        assert!(FirebaseDriver::with_clients(
            collection,
            FirebaseSettings::default(),
            Arc::new(MemoryStore::default()),
            Arc::new(NoPrincipals),
        )
        .is_err());
    }

    /// Directory serving principals in fixed pages, recording requested tokens.
    struct PagedPrincipals {
        pages: Vec<PrincipalPage>,
        requests: Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl PrincipalDirectory for PagedPrincipals {
        async fn list_principals(&self, page_token: Option<&str>) -> Result<PrincipalPage> {
            let mut requests = self.requests.lock().unwrap();
            requests.push(page_token.map(str::to_string));
            Ok(self.pages[requests.len() - 1].clone())
        }
    }

    fn principal(uid: &str, providers: &[&str]) -> Principal {
        Principal {
            uid: uid.to_string(),
            provider_ids: providers.iter().map(|p| p.to_string()).collect(),
            created_at_ms: 1_600_000_000_500,
            ..Principal::default()
        }
    }

    #[tokio::test]
    async fn test_users_collection_pages_through_directory() {
        let directory = Arc::new(PagedPrincipals {
            pages: vec![
                PrincipalPage {
                    principals: vec![principal("u1", &["password"]), principal("u2", &[])],
                    next_page_token: Some("p2".to_string()),
                },
                PrincipalPage {
                    principals: vec![principal("u3", &["google.com", "password"])],
                    next_page_token: None,
                },
            ],
            requests: Mutex::new(Vec::new()),
        });
        let collection = Collection {
            name: "accounts".to_string(),
            kind: USERS_COLLECTION.to_string(),
            table_name: None,
            parameters: Value::Null,
        };
        let driver = FirebaseDriver::with_clients(
            collection,
            FirebaseSettings::default(),
            Arc::new(MemoryStore::default()),
            directory.clone(),
        )
        .unwrap();

        let mut calls = Vec::new();
        let mut loader = |objects: Vec<Record>, pos: usize, total: usize, _percent: usize| -> Result<()> {
            calls.push((objects, pos, total));
            Ok(())
        };
        driver
            .get_objects_for(&TimeInterval::all(), &mut loader)
            .await
            .unwrap();

        assert_eq!(
            *directory.requests.lock().unwrap(),
            vec![None, Some("p2".to_string())]
        );
        assert_eq!(calls.len(), 1);
        let (users, pos, total) = &calls[0];
        assert_eq!((*pos, *total), (0, 3));
        let uids: Vec<&Value> = users.iter().map(|u| &u["uid"]).collect();
        assert_eq!(uids, vec!["u1", "u2", "u3"]);
        assert_eq!(users[0]["sign_in_methods"], serde_json::json!(["password"]));
        assert_eq!(users[1]["sign_in_methods"], serde_json::json!([]));
        assert_eq!(users[2]["created_at"], "2020-09-13T12:26:40.000000Z");
    }

    #[tokio::test]
    async fn test_loader_error_is_returned_unchanged() {
        let mut store = MemoryStore::default();
        store.add("logs", "l1", BTreeMap::new());
        let (driver, _) = driver(store, "logs");

        let mut loader = |_: Vec<Record>, _: usize, _: usize, _: usize| -> Result<()> {
            Err(anyhow::anyhow!("sink down"))
        };
        let err = driver
            .get_objects_for(&TimeInterval::all(), &mut loader)
            .await
            .unwrap_err();
        assert_eq!(format!("{:#}", err), "sink down");
    }

    /// Store whose sub-collection lookups never answer.
    struct HangingLookups(MemoryStore);

    #[async_trait]
    impl DocumentStore for HangingLookups {
        async fn list_documents(
            &self,
            collection: &CollectionRef,
            offset: usize,
            limit: usize,
        ) -> Result<Vec<Document>> {
            self.0.list_documents(collection, offset, limit).await
        }

        async fn sub_collection(&self, _document: &Document, _name: &str) -> Result<Option<CollectionRef>> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sub_collection_lookup_times_out() {
        let mut store = MemoryStore::default();
        store.add("users", "u1", BTreeMap::new());
        let settings = FirebaseSettings {
            page_timeout_secs: 5,
            ..FirebaseSettings::default()
        };
        let driver = FirebaseDriver::with_clients(
            firestore_collection("users/*/orders"),
            settings,
            Arc::new(HangingLookups(store)),
            Arc::new(NoPrincipals),
        )
        .unwrap();

        let err = driver.load_collection("users/*/orders").await.unwrap_err();
        match intake::error::classify(&err) {
            Some(SyncError::Timeout { operation, .. }) => assert!(operation.contains("orders")),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
