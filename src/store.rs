//! Uploaded G-code storage.
//!
//! Files are kept as a blob plus a record referencing it. The broker only
//! needs the store to turn a file id into a download URL for `LOAD`; the
//! upload, list and download endpoints use the rest.

use std::collections::HashMap;

use async_trait::async_trait;
use axum::body::Bytes;
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;

/// Metadata for one uploaded file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRecord {
    pub id: String,
    pub name: String,
    pub size: u64,
    #[serde(skip)]
    pub blob_id: String,
}

/// Blob/record store.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Store raw bytes, returning the new blob id.
    async fn insert_blob(&self, data: Bytes) -> String;

    /// Store a record pointing at an existing blob.
    async fn insert_record(&self, name: &str, blob_id: &str, size: u64) -> FileRecord;

    async fn find_record(&self, id: &str) -> Result<FileRecord, StoreError>;

    async fn find_blob(&self, id: &str) -> Result<Bytes, StoreError>;

    /// All records, oldest first.
    async fn list(&self) -> Vec<FileRecord>;
}

/// Process-local store. Contents are lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    blobs: RwLock<HashMap<String, Bytes>>,
    records: RwLock<Vec<FileRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FileStore for MemoryStore {
    async fn insert_blob(&self, data: Bytes) -> String {
        let id = Uuid::new_v4().to_string();
        self.blobs.write().await.insert(id.clone(), data);
        id
    }

    async fn insert_record(&self, name: &str, blob_id: &str, size: u64) -> FileRecord {
        let record = FileRecord {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            size,
            blob_id: blob_id.to_string(),
        };
        self.records.write().await.push(record.clone());
        record
    }

    async fn find_record(&self, id: &str) -> Result<FileRecord, StoreError> {
        self.records
            .read()
            .await
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn find_blob(&self, id: &str) -> Result<Bytes, StoreError> {
        self.blobs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn list(&self) -> Vec<FileRecord> {
        self.records.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_points_at_blob() {
        let store = MemoryStore::new();
        let blob_id = store.insert_blob(Bytes::from_static(b"G28\n")).await;
        let record = store.insert_record("home.gcode", &blob_id, 4).await;

        let found = store.find_record(&record.id).await.unwrap();
        assert_eq!(found, record);
        assert_eq!(
            store.find_blob(&found.blob_id).await.unwrap(),
            Bytes::from_static(b"G28\n")
        );
    }

    #[tokio::test]
    async fn list_keeps_insertion_order() {
        let store = MemoryStore::new();
        for name in ["a", "b", "c"] {
            let blob = store.insert_blob(Bytes::new()).await;
            store.insert_record(name, &blob, 0).await;
        }
        let names: Vec<_> = store.list().await.into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn missing_ids_are_not_found() {
        let store = MemoryStore::new();
        assert_eq!(
            store.find_record("x").await,
            Err(StoreError::NotFound("x".to_string()))
        );
        assert!(store.find_blob("x").await.is_err());
    }

    #[test]
    fn record_json_hides_blob_id() {
        let record = FileRecord {
            id: "1".into(),
            name: "cube.gcode".into(),
            size: 10,
            blob_id: "b".into(),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, r#"{"id":"1","name":"cube.gcode","size":10}"#);
    }
}
