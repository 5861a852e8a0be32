//! In-memory definition store.
//!
//! Enforces the same write invariants as the Postgres store. Used by
//! tests and by local development without a database; the read counter
//! lets tests assert how many authoritative loads the cache performed.

use super::{validate_endpoint_set, FanoutStore, FanoutUpdate, Result, StoreError, MAX_ENDPOINTS};
use crate::model::{validate_name, Endpoint};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-local fanout store
#[derive(Default)]
pub struct MemoryStore {
    fanouts: RwLock<HashMap<String, Vec<Endpoint>>>,
    reads: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `get_fanout` calls served so far.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FanoutStore for MemoryStore {
    async fn get_fanout(&self, name: &str) -> Result<Vec<Endpoint>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .fanouts
            .read()
            .get(name)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_fanout(&self, name: &str, endpoints: &[Endpoint]) -> Result<()> {
        validate_name(name)?;
        if endpoints.len() > MAX_ENDPOINTS {
            return Err(StoreError::TooManyEndpoints(endpoints.len()));
        }
        for endpoint in endpoints {
            validate_name(&endpoint.name)?;
        }

        let mut fanouts = self.fanouts.write();
        let mut merged = fanouts.get(name).cloned().unwrap_or_default();
        for endpoint in endpoints {
            if merged.iter().any(|e| e.name == endpoint.name) {
                return Err(StoreError::DuplicateEndpoint(endpoint.name.clone()));
            }
            merged.push(endpoint.clone());
        }
        validate_endpoint_set(&merged)?;
        sort_primary_first(&mut merged);
        fanouts.insert(name.to_string(), merged);
        Ok(())
    }

    async fn update_fanout(&self, name: &str, update: FanoutUpdate) -> Result<()> {
        validate_name(name)?;

        let mut fanouts = self.fanouts.write();
        let mut merged = fanouts.get(name).cloned().unwrap_or_default();

        merged.retain(|e| !update.delete.contains(&e.name));
        for endpoint in &update.insert {
            validate_name(&endpoint.name)?;
            if merged.iter().any(|e| e.name == endpoint.name) {
                return Err(StoreError::DuplicateEndpoint(endpoint.name.clone()));
            }
            merged.push(endpoint.clone());
        }
        for endpoint in &update.update {
            if let Some(existing) = merged.iter_mut().find(|e| e.name == endpoint.name) {
                *existing = endpoint.clone();
            }
        }

        validate_endpoint_set(&merged)?;
        sort_primary_first(&mut merged);
        fanouts.insert(name.to_string(), merged);
        Ok(())
    }

    async fn delete_fanout(&self, name: &str) -> Result<()> {
        self.fanouts.write().remove(name);
        Ok(())
    }
}

fn sort_primary_first(endpoints: &mut [Endpoint]) {
    endpoints.sort_by_key(|e| !e.primary);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Destination, HttpEndpoint};

    fn endpoint(name: &str, primary: bool) -> Endpoint {
        Endpoint {
            name: name.to_string(),
            primary,
            destination: Destination::Http(HttpEndpoint {
                url: format!("http://upstream/{}", name),
                method: "GET".to_string(),
                headers: Vec::new(),
                timeout_ms: 0,
                tls: None,
            }),
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = MemoryStore::new();
        store
            .create_fanout("read_likes", &[endpoint("v2", false), endpoint("legacy", true)])
            .await
            .unwrap();

        let endpoints = store.get_fanout("read_likes").await.unwrap();
        assert_eq!(endpoints.len(), 2);
        // Ordered primary-first, matching the authoritative read.
        assert_eq!(endpoints[0].name, "legacy");
        assert_eq!(store.reads(), 1);
    }

    #[tokio::test]
    async fn test_create_rejects_primary_violations() {
        let store = MemoryStore::new();

        let none = store.create_fanout("f", &[endpoint("a", false)]).await;
        assert!(matches!(none, Err(StoreError::PrimaryCount(0))));

        let two = store
            .create_fanout("f", &[endpoint("a", true), endpoint("b", true)])
            .await;
        assert!(matches!(two, Err(StoreError::PrimaryCount(2))));
    }

    #[tokio::test]
    async fn test_endpoint_cap() {
        let store = MemoryStore::new();

        let ten: Vec<Endpoint> = (0..10).map(|i| endpoint(&format!("e{}", i), i == 0)).collect();
        assert!(store.create_fanout("ten", &ten).await.is_ok());

        let eleven: Vec<Endpoint> =
            (0..11).map(|i| endpoint(&format!("e{}", i), i == 0)).collect();
        assert!(matches!(
            store.create_fanout("eleven", &eleven).await,
            Err(StoreError::TooManyEndpoints(11))
        ));
    }

    #[tokio::test]
    async fn test_update_moves_primary() {
        let store = MemoryStore::new();
        store
            .create_fanout("f", &[endpoint("a", true), endpoint("b", false)])
            .await
            .unwrap();

        store
            .update_fanout(
                "f",
                FanoutUpdate {
                    update: vec![endpoint("a", false), endpoint("b", true)],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let endpoints = store.get_fanout("f").await.unwrap();
        assert_eq!(endpoints[0].name, "b");
        assert!(endpoints[0].primary);
    }

    #[tokio::test]
    async fn test_update_rejects_losing_primary() {
        let store = MemoryStore::new();
        store
            .create_fanout("f", &[endpoint("a", true), endpoint("b", false)])
            .await
            .unwrap();

        let result = store
            .update_fanout(
                "f",
                FanoutUpdate {
                    delete: vec!["a".to_string()],
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(StoreError::PrimaryCount(0))));

        // The failed update must not be visible.
        let endpoints = store.get_fanout("f").await.unwrap();
        assert_eq!(endpoints.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_fanout_reads_empty() {
        let store = MemoryStore::new();
        assert!(store.get_fanout("absent").await.unwrap().is_empty());
    }
}
