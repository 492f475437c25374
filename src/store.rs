use crate::http::build_client;
use crate::models::{CanonicalListing, InsertedListing, Owner, RecordId};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, RequestBuilder, Response};
use serde_json::json;
use thiserror::Error;

const OWNERS_TABLE: &str = "owners";
const LISTINGS_TABLE: &str = "objects";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
}

/// Persistence used by the reconciliation pipeline.
#[async_trait]
pub trait ListingStore: Send + Sync {
    /// Owners whose `parsed` flag reads false, in store order.
    async fn pending_owners(&self, limit: usize) -> Result<Vec<Owner>, StoreError>;

    async fn insert_listing(&self, listing: &CanonicalListing)
    -> Result<InsertedListing, StoreError>;

    async fn mark_owner_parsed(&self, owner_id: &RecordId) -> Result<(), StoreError>;

    async fn delete_listing_by_source(&self, source_url: &str) -> Result<(), StoreError>;

    async fn delete_owner(&self, owner_id: &RecordId) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct SupabaseConfig {
    pub url: String,
    pub service_key: String,
}

/// PostgREST client for a Supabase project.
#[derive(Debug, Clone)]
pub struct SupabaseClient {
    base_url: String,
    service_key: String,
    http: Client,
}

impl SupabaseClient {
    pub fn new(config: SupabaseConfig) -> Self {
        Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            service_key: config.service_key,
            http: build_client(),
        }
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, StoreError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(StoreError::Request(if detail.is_empty() {
                format!("HTTP {status}")
            } else {
                format!("HTTP {status}: {detail}")
            }));
        }
        Ok(response)
    }
}

#[async_trait]
impl ListingStore for SupabaseClient {
    async fn pending_owners(&self, limit: usize) -> Result<Vec<Owner>, StoreError> {
        let request = self.http.get(self.table_url(OWNERS_TABLE)).query(&[
            ("select", "*".to_string()),
            ("parsed", "ilike.false".to_string()),
            ("limit", limit.to_string()),
        ]);
        self.send(request)
            .await?
            .json()
            .await
            .map_err(|err| StoreError::Deserialize(err.to_string()))
    }

    async fn insert_listing(
        &self,
        listing: &CanonicalListing,
    ) -> Result<InsertedListing, StoreError> {
        let request = self
            .http
            .post(self.table_url(LISTINGS_TABLE))
            .query(&[("select", "id,external_id")])
            .header("Prefer", "return=representation")
            .header("Accept", "application/vnd.pgrst.object+json")
            .json(listing);
        self.send(request)
            .await?
            .json()
            .await
            .map_err(|err| StoreError::Deserialize(err.to_string()))
    }

    async fn mark_owner_parsed(&self, owner_id: &RecordId) -> Result<(), StoreError> {
        let request = self
            .http
            .patch(self.table_url(OWNERS_TABLE))
            .query(&[("id", format!("eq.{owner_id}"))])
            .json(&json!({
                "parsed": "true",
                "status": true,
                "updated_at": Utc::now().to_rfc3339(),
            }));
        self.send(request).await.map(|_| ())
    }

    async fn delete_listing_by_source(&self, source_url: &str) -> Result<(), StoreError> {
        let request = self
            .http
            .delete(self.table_url(LISTINGS_TABLE))
            .query(&[("cian_url", format!("eq.{source_url}"))]);
        self.send(request).await.map(|_| ())
    }

    async fn delete_owner(&self, owner_id: &RecordId) -> Result<(), StoreError> {
        let request = self
            .http
            .delete(self.table_url(OWNERS_TABLE))
            .query(&[("id", format!("eq.{owner_id}"))]);
        self.send(request).await.map(|_| ())
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Tables {
        owners: Vec<Owner>,
        listings: Vec<CanonicalListing>,
        insert_attempts: Vec<CanonicalListing>,
        deleted_sources: Vec<String>,
        fail_inserts: bool,
        fail_reads: bool,
    }

    /// Store double backed by vectors.
    #[derive(Default)]
    pub struct InMemoryStore {
        tables: Mutex<Tables>,
    }

    impl InMemoryStore {
        pub fn with_owners(owners: Vec<Owner>) -> Self {
            let store = Self::default();
            store.tables.lock().unwrap().owners = owners;
            store
        }

        pub fn fail_inserts(&self, fail: bool) {
            self.tables.lock().unwrap().fail_inserts = fail;
        }

        pub fn fail_reads(&self, fail: bool) {
            self.tables.lock().unwrap().fail_reads = fail;
        }

        pub fn seed_listing(&self, listing: CanonicalListing) {
            self.tables.lock().unwrap().listings.push(listing);
        }

        pub fn owner(&self, id: &RecordId) -> Option<Owner> {
            let tables = self.tables.lock().unwrap();
            tables.owners.iter().find(|o| &o.id == id).cloned()
        }

        pub fn listings(&self) -> Vec<CanonicalListing> {
            self.tables.lock().unwrap().listings.clone()
        }

        pub fn insert_attempts(&self) -> Vec<CanonicalListing> {
            self.tables.lock().unwrap().insert_attempts.clone()
        }

        pub fn deleted_sources(&self) -> Vec<String> {
            self.tables.lock().unwrap().deleted_sources.clone()
        }
    }

    #[async_trait]
    impl ListingStore for InMemoryStore {
        async fn pending_owners(&self, limit: usize) -> Result<Vec<Owner>, StoreError> {
            let tables = self.tables.lock().unwrap();
            if tables.fail_reads {
                return Err(StoreError::Request("HTTP 503 Service Unavailable".into()));
            }
            Ok(tables
                .owners
                .iter()
                .filter(|owner| owner.parsed == Some(false))
                .take(limit)
                .cloned()
                .collect())
        }

        async fn insert_listing(
            &self,
            listing: &CanonicalListing,
        ) -> Result<InsertedListing, StoreError> {
            let mut tables = self.tables.lock().unwrap();
            tables.insert_attempts.push(listing.clone());
            if tables.fail_inserts {
                return Err(StoreError::Request("HTTP 500 Internal Server Error".into()));
            }
            tables.listings.push(listing.clone());
            let id = tables.listings.len() as i64;
            Ok(InsertedListing {
                id: Some(RecordId::Int(id)),
                external_id: Some(RecordId::Text(format!("EXT-{id}"))),
            })
        }

        async fn mark_owner_parsed(&self, owner_id: &RecordId) -> Result<(), StoreError> {
            let mut tables = self.tables.lock().unwrap();
            if let Some(owner) = tables.owners.iter_mut().find(|o| &o.id == owner_id) {
                owner.parsed = Some(true);
                owner.status = Some(true);
            }
            Ok(())
        }

        async fn delete_listing_by_source(&self, source_url: &str) -> Result<(), StoreError> {
            let mut tables = self.tables.lock().unwrap();
            tables.listings.retain(|listing| listing.cian_url != source_url);
            tables.deleted_sources.push(source_url.to_string());
            Ok(())
        }

        async fn delete_owner(&self, owner_id: &RecordId) -> Result<(), StoreError> {
            let mut tables = self.tables.lock().unwrap();
            tables.owners.retain(|owner| &owner.id != owner_id);
            Ok(())
        }
    }
}
