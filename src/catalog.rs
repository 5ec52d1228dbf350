//! Cluster membership lookup.
//!
//! The catalog answers two questions: which nodes exist, and which services
//! (with which tags) each node advertises. Node filters on task instances are
//! evaluated against it.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ConvoyError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogNode {
    pub name: String,
    pub address: String,
}

/// Service name to advertised tags.
pub type ServiceMap = HashMap<String, Vec<String>>;

/// (service, tag) pair selecting the nodes that take part in a task instance.
///
/// An empty service matches every node; an empty tag matches every node
/// that advertises the service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFilter {
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub tag: String,
}

impl NodeFilter {
    pub fn new(service: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            tag: tag.into(),
        }
    }

    pub fn any() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.service.is_empty()
    }

    pub fn matches(&self, services: &ServiceMap) -> bool {
        if self.service.is_empty() {
            return true;
        }
        match services.get(&self.service) {
            None => false,
            Some(_) if self.tag.is_empty() => true,
            Some(tags) => tags.iter().any(|t| t == &self.tag),
        }
    }
}

impl std::fmt::Display for NodeFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.service.is_empty(), self.tag.is_empty()) {
            (true, _) => write!(f, "*"),
            (false, true) => write!(f, "{}", self.service),
            (false, false) => write!(f, "{}:{}", self.service, self.tag),
        }
    }
}

#[async_trait]
pub trait Catalog: Send + Sync + 'static {
    async fn nodes(&self) -> Result<Vec<CatalogNode>>;

    /// Services advertised by `node`, or `None` if the node is unknown.
    async fn services(&self, node: &str) -> Result<Option<ServiceMap>>;

    /// Whether `node` is registered and satisfies `filter`.
    async fn has_record(&self, node: &str, filter: &NodeFilter) -> Result<bool> {
        Ok(self
            .services(node)
            .await?
            .is_some_and(|services| filter.matches(&services)))
    }

    /// Names of every registered node satisfying `filter`.
    async fn matching_nodes(&self, filter: &NodeFilter) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for node in self.nodes().await? {
            if self.has_record(&node.name, filter).await? {
                names.push(node.name);
            }
        }
        Ok(names)
    }

    async fn address_of(&self, node: &str) -> Result<Option<String>> {
        Ok(self
            .nodes()
            .await?
            .into_iter()
            .find(|n| n.name == node)
            .map(|n| n.address))
    }
}

/// Catalog held in memory, mutable at runtime so tests can add and remove
/// nodes while the cluster is running.
#[derive(Debug, Default)]
pub struct StaticCatalog {
    nodes: RwLock<BTreeMap<String, (String, ServiceMap)>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, name: &str, address: &str) {
        if let Ok(mut nodes) = self.nodes.write() {
            nodes
                .entry(name.to_string())
                .or_insert_with(|| (address.to_string(), ServiceMap::new()));
        }
    }

    pub fn add_service(&self, node: &str, service: &str, tags: &[&str]) {
        if let Ok(mut nodes) = self.nodes.write() {
            let entry = nodes
                .entry(node.to_string())
                .or_insert_with(|| (String::new(), ServiceMap::new()));
            entry.1.insert(
                service.to_string(),
                tags.iter().map(|t| t.to_string()).collect(),
            );
        }
    }

    pub fn remove_node(&self, name: &str) {
        if let Ok(mut nodes) = self.nodes.write() {
            nodes.remove(name);
        }
    }

    fn poisoned() -> ConvoyError {
        ConvoyError::Store("catalog lock poisoned".into())
    }
}

#[async_trait]
impl Catalog for StaticCatalog {
    async fn nodes(&self) -> Result<Vec<CatalogNode>> {
        let nodes = self.nodes.read().map_err(|_| Self::poisoned())?;
        Ok(nodes
            .iter()
            .map(|(name, (address, _))| CatalogNode {
                name: name.clone(),
                address: address.clone(),
            })
            .collect())
    }

    async fn services(&self, node: &str) -> Result<Option<ServiceMap>> {
        let nodes = self.nodes.read().map_err(|_| Self::poisoned())?;
        Ok(nodes.get(node).map(|(_, services)| services.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn services(entries: &[(&str, &[&str])]) -> ServiceMap {
        entries
            .iter()
            .map(|(s, tags)| (s.to_string(), tags.iter().map(|t| t.to_string()).collect()))
            .collect()
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(NodeFilter::any().matches(&ServiceMap::new()));
    }

    #[test]
    fn service_filter_requires_service() {
        let filter = NodeFilter::new("app", "");
        assert!(filter.matches(&services(&[("app", &[])])));
        assert!(!filter.matches(&services(&[("db", &[])])));
    }

    #[test]
    fn tag_filter_requires_tag() {
        let filter = NodeFilter::new("app", "primary");
        assert!(filter.matches(&services(&[("app", &["primary", "v2"])])));
        assert!(!filter.matches(&services(&[("app", &["replica"])])));
    }

    #[test]
    fn filter_display() {
        assert_eq!(NodeFilter::any().to_string(), "*");
        assert_eq!(NodeFilter::new("app", "").to_string(), "app");
        assert_eq!(NodeFilter::new("app", "v2").to_string(), "app:v2");
    }

    #[tokio::test]
    async fn static_catalog_matching_nodes() {
        let catalog = StaticCatalog::new();
        catalog.add_node("web-1", "10.0.0.1");
        catalog.add_node("web-2", "10.0.0.2");
        catalog.add_node("db-1", "10.0.0.3");
        catalog.add_service("web-1", "app", &["primary"]);
        catalog.add_service("web-2", "app", &[]);
        catalog.add_service("db-1", "postgres", &[]);

        let all = catalog.matching_nodes(&NodeFilter::any()).await.unwrap();
        assert_eq!(all.len(), 3);

        let app = catalog.matching_nodes(&NodeFilter::new("app", "")).await.unwrap();
        assert_eq!(app, vec!["web-1", "web-2"]);

        let primary = catalog
            .matching_nodes(&NodeFilter::new("app", "primary"))
            .await
            .unwrap();
        assert_eq!(primary, vec!["web-1"]);

        assert!(!catalog.has_record("ghost", &NodeFilter::any()).await.unwrap());
        assert_eq!(
            catalog.address_of("db-1").await.unwrap().as_deref(),
            Some("10.0.0.3")
        );
    }

    #[tokio::test]
    async fn removed_node_no_longer_matches() {
        let catalog = StaticCatalog::new();
        catalog.add_node("web-1", "10.0.0.1");
        catalog.remove_node("web-1");
        assert!(catalog.nodes().await.unwrap().is_empty());
    }
}
