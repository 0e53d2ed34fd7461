use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::RefCell;
use std::rc::Rc;

use crate::db::{Database, REMOTE_CONFIG_KEY};
use crate::errors::{RemoteError, TrackerError, TrackerResult};

/// Server-side cap on documents returned by a single `find`.
pub const FIND_LIMIT: u32 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfig {
    pub api_url: String,
    pub api_key: String,
    pub cluster: String,
    pub database: String,
}

impl RemoteConfig {
    pub const DEFAULT_CLUSTER: &'static str = "Cluster0";
    pub const DEFAULT_DATABASE: &'static str = "jobtrack";

    /// Validates the fields and trims one trailing `/` from the endpoint.
    pub fn normalized(mut self) -> TrackerResult<Self> {
        if !(self.api_url.starts_with("http://") || self.api_url.starts_with("https://")) {
            return Err(TrackerError::Validation(
                "API URL must start with http:// or https://".to_string(),
            ));
        }
        for (field, value) in [
            ("API key", &self.api_key),
            ("Cluster", &self.cluster),
            ("Database", &self.database),
        ] {
            if value.trim().is_empty() {
                return Err(TrackerError::Validation(format!("{} is required.", field)));
            }
        }
        if self.api_url.ends_with('/') {
            self.api_url.pop();
        }
        Ok(self)
    }
}

/// The persisted remote configuration. Present or absent, nothing else.
pub struct RemoteSettings {
    db: Rc<Database>,
    config: RefCell<Option<RemoteConfig>>,
}

impl RemoteSettings {
    pub fn load(db: Rc<Database>) -> TrackerResult<Self> {
        let config = match db.get(REMOTE_CONFIG_KEY)? {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(config) => Some(config),
                Err(e) => {
                    tracing::warn!(error = %e, "remote config is unreadable, treating as not configured");
                    None
                }
            },
            None => None,
        };
        Ok(Self {
            db,
            config: RefCell::new(config),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.config.borrow().is_some()
    }

    pub fn config(&self) -> Option<RemoteConfig> {
        self.config.borrow().clone()
    }

    pub fn save(&self, config: RemoteConfig) -> TrackerResult<RemoteConfig> {
        let config = config.normalized()?;
        self.db.set(REMOTE_CONFIG_KEY, &serde_json::to_string(&config)?)?;
        tracing::info!(api_url = %config.api_url, cluster = %config.cluster, "remote configured");
        *self.config.borrow_mut() = Some(config.clone());
        Ok(config)
    }

    pub fn reset(&self) -> TrackerResult<()> {
        self.db.remove(REMOTE_CONFIG_KEY)?;
        *self.config.borrow_mut() = None;
        tracing::info!("remote config cleared");
        Ok(())
    }
}

// --- Data API wire types ---

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ActionRequest<'a> {
    data_source: &'a str,
    database: &'a str,
    collection: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sort: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    document: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    update: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    upsert: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct FindOneResponse {
    #[serde(default)]
    document: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct FindResponse {
    #[serde(default)]
    documents: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsertOneResponse {
    inserted_id: Value,
}

/// Stateless adapter over the document store's HTTP data API. Every call
/// fails with `NotConfigured` before touching the network when no config
/// is present. Failures are passed through as-is; retrying is up to the
/// caller.
#[derive(Debug, Clone)]
pub struct RemoteGateway {
    client: reqwest::Client,
    config: Option<RemoteConfig>,
}

impl RemoteGateway {
    pub fn new(client: reqwest::Client, config: Option<RemoteConfig>) -> Self {
        Self { client, config }
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_some()
    }

    pub async fn find_one(&self, collection: &str, filter: &Value) -> Result<Option<Value>, RemoteError> {
        let config = self.config()?;
        let body = ActionRequest {
            filter: Some(filter),
            ..Self::base(config, collection)
        };
        let res: FindOneResponse = self.post(config, "findOne", &body).await?;
        Ok(res.document.filter(|d| !d.is_null()))
    }

    /// Returns at most `FIND_LIMIT` documents; there is no paging.
    pub async fn find(&self, collection: &str, filter: &Value, sort: &Value) -> Result<Vec<Value>, RemoteError> {
        let config = self.config()?;
        let body = ActionRequest {
            filter: Some(filter),
            sort: Some(sort),
            limit: Some(FIND_LIMIT),
            ..Self::base(config, collection)
        };
        let res: FindResponse = self.post(config, "find", &body).await?;
        Ok(res.documents)
    }

    pub async fn insert_one(&self, collection: &str, document: &Value) -> Result<String, RemoteError> {
        let config = self.config()?;
        let body = ActionRequest {
            document: Some(document),
            ..Self::base(config, collection)
        };
        let res: InsertOneResponse = self.post(config, "insertOne", &body).await?;
        Ok(match res.inserted_id {
            Value::String(id) => id,
            other => other.to_string(),
        })
    }

    pub async fn update_one(
        &self,
        collection: &str,
        filter: &Value,
        update: &Value,
        upsert: bool,
    ) -> Result<Value, RemoteError> {
        let config = self.config()?;
        let body = ActionRequest {
            filter: Some(filter),
            update: Some(update),
            upsert: upsert.then_some(true),
            ..Self::base(config, collection)
        };
        self.post(config, "updateOne", &body).await
    }

    pub async fn delete_one(&self, collection: &str, filter: &Value) -> Result<Value, RemoteError> {
        let config = self.config()?;
        let body = ActionRequest {
            filter: Some(filter),
            ..Self::base(config, collection)
        };
        self.post(config, "deleteOne", &body).await
    }

    fn config(&self) -> Result<&RemoteConfig, RemoteError> {
        self.config.as_ref().ok_or(RemoteError::NotConfigured)
    }

    fn base<'a>(config: &'a RemoteConfig, collection: &'a str) -> ActionRequest<'a> {
        ActionRequest {
            data_source: &config.cluster,
            database: &config.database,
            collection,
            filter: None,
            sort: None,
            limit: None,
            document: None,
            update: None,
            upsert: None,
        }
    }

    async fn post<R: DeserializeOwned>(
        &self,
        config: &RemoteConfig,
        action: &str,
        body: &ActionRequest<'_>,
    ) -> Result<R, RemoteError> {
        let url = format!("{}/action/{}", config.api_url, action);
        tracing::debug!(%url, collection = body.collection, "remote request");

        let response = self
            .client
            .post(&url)
            .header("api-key", &config.api_key)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            tracing::debug!(%status, action, "remote request rejected");
            return Err(RemoteError::Http { status, body: text });
        }

        // Some actions answer with an empty body
        let text = if text.trim().is_empty() { "null" } else { text.as_str() };
        serde_json::from_str(text).map_err(|e| RemoteError::Decode(format!("{}: {}", action, e)))
    }
}
