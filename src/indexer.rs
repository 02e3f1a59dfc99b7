use crate::config::env_string;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_INDEX: &str = "image_metadata";

#[derive(Debug, Clone)]
pub struct MetadataStoreConfig {
    pub base_url: String,
    pub index: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl MetadataStoreConfig {
    /// `None` unless `METADATA_STORE_URL` is set; indexing is then skipped entirely.
    pub fn from_env() -> Option<Self> {
        let base_url = env_string("METADATA_STORE_URL")?;
        Some(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            index: env_string("METADATA_STORE_INDEX").unwrap_or_else(|| DEFAULT_INDEX.to_string()),
            username: env_string("METADATA_STORE_USER"),
            password: env_string("METADATA_STORE_PASSWORD"),
        })
    }
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexDocument {
    pub image_url: String,
    pub manufacturer: String,
    pub part_number: Option<String>,
    pub description: Option<String>,
    pub timestamp: String,
}

impl IndexDocument {
    pub fn new(
        image_url: &str,
        manufacturer: &str,
        part_number: Option<&str>,
        description: Option<&str>,
    ) -> Self {
        Self {
            image_url: image_url.to_string(),
            manufacturer: manufacturer.to_string(),
            part_number: part_number.map(str::to_string),
            description: description.map(str::to_string),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct IndexResponse {
    #[serde(rename = "_id")]
    id: Option<String>,
}

/// Write-only client for the searchable metadata store.
#[derive(Debug, Clone)]
pub struct MetadataIndexer {
    config: MetadataStoreConfig,
    http: Client,
}

impl MetadataIndexer {
    pub fn new(http: Client, config: MetadataStoreConfig) -> Self {
        Self { config, http }
    }

    pub async fn index(&self, document: &IndexDocument) -> Result<Option<String>, IndexError> {
        let url = format!(
            "{}/{}/_doc",
            self.config.base_url,
            urlencoding::encode(&self.config.index)
        );
        let mut request = self.http.post(url).json(document);
        if let Some(username) = &self.config.username {
            request = request.basic_auth(username, self.config.password.as_deref());
        }
        let response = request
            .send()
            .await
            .map_err(|err| IndexError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(IndexError::Request(format!("HTTP {}", response.status())));
        }

        let payload: IndexResponse = response
            .json()
            .await
            .map_err(|err| IndexError::Deserialize(err.to_string()))?;
        Ok(payload.id)
    }

    /// Indexes one document per URL. Failures are logged and never propagate; returns
    /// the number of documents the store accepted.
    pub async fn index_all(
        &self,
        image_urls: &[String],
        manufacturer: &str,
        part_number: Option<&str>,
        description: Option<&str>,
    ) -> usize {
        let mut indexed = 0;
        for image_url in image_urls {
            let document = IndexDocument::new(image_url, manufacturer, part_number, description);
            match self.index(&document).await {
                Ok(id) => {
                    indexed += 1;
                    debug!(target = "imagery.indexer", image_url = %image_url, id = ?id, "document_indexed");
                }
                Err(err) => {
                    warn!(target = "imagery.indexer", image_url = %image_url, error = %err, "index_failed");
                }
            }
        }
        indexed
    }
}
