use anyhow::Result;
use intake::SyncError;
use serde::Deserialize;

pub const FIRESTORE_BASE_URL: &str = "https://firestore.googleapis.com";
pub const AUTH_BASE_URL: &str = "https://identitytoolkit.googleapis.com";

/// Source blob of a Firebase project.
#[derive(Clone, Debug, Deserialize)]
pub struct FirebaseConfig {
    pub project_id: String,
    /// OAuth2 bearer token with Datastore and Identity Toolkit scopes.
    pub access_token: String,
    /// Firestore REST endpoint (override for the emulator or tests).
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Identity Toolkit REST endpoint.
    #[serde(default = "default_auth_base_url")]
    pub auth_base_url: String,
}

fn default_base_url() -> String {
    FIRESTORE_BASE_URL.to_string()
}

fn default_auth_base_url() -> String {
    AUTH_BASE_URL.to_string()
}

impl FirebaseConfig {
    pub fn validate(&self) -> Result<()> {
        if self.project_id.trim().is_empty() {
            return Err(SyncError::Configuration("firebase 'project_id' is required".to_string()).into());
        }
        if self.access_token.trim().is_empty() {
            return Err(
                SyncError::Configuration("firebase 'access_token' is required".to_string()).into(),
            );
        }
        Ok(())
    }
}

/// Parameters of a `firestore` collection.
#[derive(Clone, Debug, Deserialize)]
pub struct FirestoreParameters {
    /// Collection path, optionally with wildcards: `users/*/orders/*/items`.
    pub collection: String,
}

impl FirestoreParameters {
    pub fn validate(&self) -> Result<()> {
        if self.collection.trim().is_empty() {
            return Err(SyncError::Configuration(
                "firestore 'collection' parameter is required".to_string(),
            )
            .into());
        }
        Ok(())
    }
}
