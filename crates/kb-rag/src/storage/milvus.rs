//! Milvus v2 REST adapter

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;

use super::{KnowledgeBase, KnowledgeBaseFactory, KnowledgeBaseKey};
use crate::config::VectorStoreConfig;
use crate::embeddings::EmbeddingModel;
use crate::types::PassageHit;

pub struct MilvusCollection {
    client: Client,
    base_url: String,
    token: String,
    database: String,
    collection: String,
    fields: VectorStoreConfig,
    embeddings: Arc<dyn EmbeddingModel>,
}

impl MilvusCollection {
    fn output_fields(&self) -> Vec<&str> {
        vec![
            self.fields.id_field.as_str(),
            self.fields.text_field.as_str(),
            self.fields.document_id_field.as_str(),
            self.fields.chunk_index_field.as_str(),
            self.fields.file_name_field.as_str(),
        ]
    }

    async fn post(&self, path: &str, body: JsonValue) -> Result<JsonValue> {
        post_json(&self.client, &self.base_url, &self.token, path, &body).await
    }

    fn rows_to_hits(&self, data: &JsonValue) -> Vec<PassageHit> {
        data.as_array()
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| hit_from_row(row, &self.fields))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl KnowledgeBase for MilvusCollection {
    async fn vector_search(&self, query: &str, k: usize) -> Result<Vec<PassageHit>> {
        let vector = self
            .embeddings
            .embed_query(query)
            .await
            .context("Failed to embed query")?;

        let response = self
            .post(
                "/v2/vectordb/entities/search",
                json!({
                    "dbName": self.database,
                    "collectionName": self.collection,
                    "data": [vector],
                    "annsField": self.fields.vector_field,
                    "limit": k,
                    "outputFields": self.output_fields(),
                }),
            )
            .await?;
        Ok(self.rows_to_hits(&response["data"]))
    }

    async fn lexical_search(
        &self,
        expression: &str,
        limit: usize,
        _fields: &[String],
    ) -> Result<Vec<PassageHit>> {
        // The expression already names its fields; Milvus needs no separate list.
        let response = self
            .post(
                "/v2/vectordb/entities/query",
                json!({
                    "dbName": self.database,
                    "collectionName": self.collection,
                    "filter": expression,
                    "limit": limit,
                    "outputFields": self.output_fields(),
                }),
            )
            .await?;
        Ok(self.rows_to_hits(&response["data"]))
    }
}

async fn post_json(
    client: &Client,
    base_url: &str,
    token: &str,
    path: &str,
    body: &JsonValue,
) -> Result<JsonValue> {
    let url = format!("{}{}", base_url, path);
    let mut request = client.post(&url).json(body);
    if !token.is_empty() {
        request = request.bearer_auth(token);
    }
    let response = request
        .send()
        .await
        .with_context(|| format!("Milvus request to {} failed", url))?;

    let status = response.status();
    let parsed: JsonValue = response
        .json()
        .await
        .with_context(|| format!("Failed to parse Milvus response from {} (HTTP {})", url, status))?;

    // Milvus reports most failures as HTTP 200 with a non-zero code.
    let code = parsed["code"].as_i64().unwrap_or(0);
    if !status.is_success() || code != 0 {
        let message = parsed["message"].as_str().unwrap_or("unknown error");
        return Err(anyhow!("Milvus error at {} (code {}): {}", path, code, message));
    }
    Ok(parsed)
}

fn scalar_to_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn hit_from_row(row: &JsonValue, fields: &VectorStoreConfig) -> Option<PassageHit> {
    let id = scalar_to_string(&row[fields.id_field.as_str()])?;
    let text = row[fields.text_field.as_str()].as_str()?.to_string();
    let chunk_index = match &row[fields.chunk_index_field.as_str()] {
        JsonValue::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        JsonValue::String(s) => s.parse().ok(),
        _ => None,
    };
    // A hit without a document id cannot be grouped; give it its own.
    let document_id =
        scalar_to_string(&row[fields.document_id_field.as_str()]).unwrap_or_else(|| id.clone());
    let file_name = row[fields.file_name_field.as_str()]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());

    Some(PassageHit {
        id,
        document_id,
        chunk_index,
        text,
        file_name,
    })
}

/// Opens [`MilvusCollection`] handles for the registry.
pub struct MilvusFactory {
    config: VectorStoreConfig,
    embeddings: Arc<dyn EmbeddingModel>,
    client: Client,
}

impl MilvusFactory {
    pub fn new(
        config: VectorStoreConfig,
        embeddings: Arc<dyn EmbeddingModel>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(request_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;
        Ok(Self {
            config,
            embeddings,
            client,
        })
    }
}

#[async_trait]
impl KnowledgeBaseFactory for MilvusFactory {
    async fn open(&self, key: &KnowledgeBaseKey) -> Result<Arc<dyn KnowledgeBase>> {
        let base_url = self.config.uri.trim_end_matches('/').to_string();
        let database = key.database();
        let collection = key.collection();

        let response = post_json(
            &self.client,
            &base_url,
            &self.config.token,
            "/v2/vectordb/collections/has",
            &json!({ "dbName": database, "collectionName": collection }),
        )
        .await?;
        if !response["data"]["has"].as_bool().unwrap_or(false) {
            return Err(anyhow!("collection {}.{} does not exist", database, collection));
        }

        tracing::info!(
            database = %database,
            collection = %collection,
            dimension = ?self.embeddings.dimension(),
            "Opened Milvus collection"
        );
        Ok(Arc::new(MilvusCollection {
            client: self.client.clone(),
            base_url,
            token: self.config.token.clone(),
            database,
            collection,
            fields: self.config.clone(),
            embeddings: Arc::clone(&self.embeddings),
        }))
    }
}
