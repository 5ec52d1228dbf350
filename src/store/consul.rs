//! Consul-backed shared store, catalog and event sink over the HTTP API.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;

use crate::catalog::{Catalog, CatalogNode, NodeFilter, ServiceMap};
use crate::config::StoreConfig;
use crate::dispatch::EventSink;
use crate::error::{ConvoyError, Result};
use crate::store::{KvLock, KvPair, KvStore};

const SESSION_TTL: &str = "30s";
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ConsulKv {
    key: String,
    value: Option<String>,
    modify_index: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ConsulNode {
    node: String,
    address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ConsulNodeServices {
    #[serde(default)]
    services: Option<HashMap<String, ConsulService>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ConsulService {
    service: String,
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Debug, Clone)]
pub struct ConsulStore {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl ConsulStore {
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(config.insecure_skip_verify)
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url(),
            token: config.token.clone(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}/v1/{}", self.base_url, path));
        match &self.token {
            Some(token) => builder.header("X-Consul-Token", token),
            None => builder,
        }
    }

    fn decode(kv: ConsulKv) -> Result<KvPair> {
        let value = match kv.value {
            Some(encoded) => base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| ConvoyError::Store(format!("invalid value for {}: {e}", kv.key)))?,
            None => Vec::new(),
        };
        Ok(KvPair {
            key: kv.key,
            value,
            version: kv.modify_index,
        })
    }

    async fn put_returning_bool(&self, request: RequestBuilder) -> Result<bool> {
        let response = request.send().await?.error_for_status()?;
        let body = response.text().await?;
        Ok(body.trim() == "true")
    }

    async fn create_session(&self) -> Result<String> {
        let response = self
            .request(reqwest::Method::PUT, "session/create")
            .json(&serde_json::json!({
                "Name": "convoy-lock",
                "TTL": SESSION_TTL,
                "LockDelay": "0s",
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<IdResponse>().await?.id)
    }

    async fn destroy_session(&self, session: &str) -> Result<()> {
        self.request(reqwest::Method::PUT, &format!("session/destroy/{session}"))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Destroy a session on an error path, keeping the original error.
    async fn abandon_session(&self, session: &str) {
        if let Err(e) = self.destroy_session(session).await {
            tracing::warn!(session, error = %e, "Failed to destroy lock session");
        }
    }
}

#[async_trait]
impl KvStore for ConsulStore {
    async fn get(&self, key: &str) -> Result<Option<KvPair>> {
        let response = self
            .request(reqwest::Method::GET, &format!("kv/{key}"))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let entries: Vec<ConsulKv> = response.error_for_status()?.json().await?;
        entries.into_iter().next().map(Self::decode).transpose()
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let request = self
            .request(reqwest::Method::PUT, &format!("kv/{key}"))
            .body(value);
        if self.put_returning_bool(request).await? {
            Ok(())
        } else {
            Err(ConvoyError::Store(format!("put on {key} was rejected")))
        }
    }

    async fn cas(&self, key: &str, value: Vec<u8>, version: u64) -> Result<bool> {
        let request = self
            .request(reqwest::Method::PUT, &format!("kv/{key}"))
            .query(&[("cas", version)])
            .body(value);
        self.put_returning_bool(request).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.request(reqwest::Method::DELETE, &format!("kv/{key}"))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn delete_tree(&self, prefix: &str) -> Result<()> {
        self.request(reqwest::Method::DELETE, &format!("kv/{prefix}"))
            .query(&[("recurse", "true")])
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>> {
        let response = self
            .request(reqwest::Method::GET, &format!("kv/{prefix}"))
            .query(&[("recurse", "true")])
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let entries: Vec<ConsulKv> = response.error_for_status()?.json().await?;
        let mut pairs = entries
            .into_iter()
            .map(Self::decode)
            .collect::<Result<Vec<_>>>()?;
        pairs.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(pairs)
    }

    async fn lock(&self, key: &str) -> Result<Box<dyn KvLock>> {
        let session = self.create_session().await?;
        loop {
            let request = self
                .request(reqwest::Method::PUT, &format!("kv/{key}"))
                .query(&[("acquire", session.as_str())]);
            let acquired = match self.put_returning_bool(request).await {
                Ok(acquired) => acquired,
                Err(e) => {
                    self.abandon_session(&session).await;
                    return Err(e);
                }
            };
            if acquired {
                tracing::trace!(key, session = %session, "Lock acquired");
                return Ok(Box::new(ConsulLock {
                    store: self.clone(),
                    key: key.to_string(),
                    session,
                }));
            }
            tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
        }
    }
}

struct ConsulLock {
    store: ConsulStore,
    key: String,
    session: String,
}

#[async_trait]
impl KvLock for ConsulLock {
    async fn unlock(self: Box<Self>) -> Result<()> {
        let request = self
            .store
            .request(reqwest::Method::PUT, &format!("kv/{}", self.key))
            .query(&[("release", self.session.as_str())]);
        let released = match self.store.put_returning_bool(request).await {
            Ok(released) => released,
            Err(e) => {
                self.store.abandon_session(&self.session).await;
                return Err(e);
            }
        };
        self.store.destroy_session(&self.session).await?;
        if !released {
            tracing::warn!(key = %self.key, "Lock was no longer held at release");
        }
        Ok(())
    }
}

#[async_trait]
impl Catalog for ConsulStore {
    async fn nodes(&self) -> Result<Vec<CatalogNode>> {
        let nodes: Vec<ConsulNode> = self
            .request(reqwest::Method::GET, "catalog/nodes")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(nodes
            .into_iter()
            .map(|n| CatalogNode {
                name: n.node,
                address: n.address,
            })
            .collect())
    }

    async fn services(&self, node: &str) -> Result<Option<ServiceMap>> {
        let detail: Option<ConsulNodeServices> = self
            .request(reqwest::Method::GET, &format!("catalog/node/{node}"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(detail.map(|d| {
            d.services
                .unwrap_or_default()
                .into_values()
                .map(|s| (s.service, s.tags.unwrap_or_default()))
                .collect()
        }))
    }
}

#[async_trait]
impl EventSink for ConsulStore {
    async fn fire(&self, name: &str, filter: &NodeFilter, payload: Option<&str>) -> Result<String> {
        let mut query = Vec::new();
        if !filter.service.is_empty() {
            query.push(("service", filter.service.as_str()));
        }
        if !filter.tag.is_empty() {
            query.push(("tag", filter.tag.as_str()));
        }
        let response = self
            .request(reqwest::Method::PUT, &format!("event/fire/{name}"))
            .query(&query)
            .body(payload.unwrap_or_default().to_string())
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<IdResponse>().await?.id)
    }
}
