//! MongoDB client and collection wrapper for the entity store
//!
//! Indexes are applied once per collection at start-up through
//! [`MongoClient::ensure_indexes`]; handing out a collection afterwards is
//! free of I/O.

use bson::{doc, oid::ObjectId, DateTime, Document};
use futures::StreamExt;
use mongodb::{
    options::{IndexOptions, UpdateModifications},
    results::UpdateResult,
    Client, Collection, IndexModel,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{error, info};

use crate::db::schemas::Metadata;
use crate::types::FleetError;

/// Trait for schemas that provide index definitions
pub trait IntoIndexes {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)>;
}

/// Trait for schemas with mutable metadata
pub trait MutMetadata {
    fn mut_metadata(&mut self) -> &mut Metadata;
    fn metadata(&self) -> &Metadata;
}

/// Filter fragment hiding soft-deleted documents
pub fn not_deleted(mut filter: Document) -> Document {
    filter.insert("metadata.is_deleted", doc! { "$ne": true });
    filter
}

/// MongoDB client wrapper for the control plane's own database
#[derive(Clone)]
pub struct MongoClient {
    client: Client,
    db_name: String,
}

impl MongoClient {
    /// Connect and verify the entity-store database is reachable
    pub async fn new(uri: &str, db_name: &str) -> Result<Self, FleetError> {
        info!("Connecting to entity store at {}", redact(uri));

        // Fail fast on an unreachable store instead of the driver default of 30s
        let timeout_uri = if uri.contains('?') {
            format!("{}&serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        } else {
            format!("{}?serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        };

        let client = Client::with_uri_str(&timeout_uri)
            .await
            .map_err(|e| FleetError::Database(format!("Failed to connect to MongoDB: {}", e)))?;

        client
            .database(db_name)
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| FleetError::Database(format!("MongoDB ping failed: {}", e)))?;

        info!("Connected to entity store database '{}'", db_name);

        Ok(Self {
            client,
            db_name: db_name.to_string(),
        })
    }

    /// Get a typed collection
    pub fn collection<T>(&self, name: &str) -> MongoCollection<T>
    where
        T: Serialize + DeserializeOwned + Unpin + Send + Sync,
    {
        MongoCollection {
            inner: self.client.database(&self.db_name).collection::<T>(name),
        }
    }

    /// Apply the schema-defined indexes of `T` to its collection
    pub async fn ensure_indexes<T>(&self, name: &str) -> Result<(), FleetError>
    where
        T: Serialize + DeserializeOwned + Unpin + Send + Sync + IntoIndexes,
    {
        let schema_indices = T::into_indices();

        if schema_indices.is_empty() {
            return Ok(());
        }

        let indices: Vec<IndexModel> = schema_indices
            .into_iter()
            .map(|(keys, opts)| IndexModel::builder().keys(keys).options(opts).build())
            .collect();

        self.collection::<T>(name)
            .inner
            .create_indexes(indices)
            .await
            .map_err(|e| {
                FleetError::Database(format!("Failed to create indexes on {}: {}", name, e))
            })?;

        Ok(())
    }

    /// Get the database name
    pub fn db_name(&self) -> &str {
        &self.db_name
    }
}

/// Typed MongoDB collection
#[derive(Debug, Clone)]
pub struct MongoCollection<T>
where
    T: Serialize + DeserializeOwned + Unpin + Send + Sync,
{
    inner: Collection<T>,
}

impl<T> MongoCollection<T>
where
    T: Serialize + DeserializeOwned + Unpin + Send + Sync + MutMetadata,
{
    /// Insert a document, setting metadata timestamps
    pub async fn insert_one(&self, mut item: T) -> Result<ObjectId, FleetError> {
        let metadata = item.mut_metadata();
        metadata.is_deleted = false;
        metadata.deleted_at = None;
        metadata.created_at = Some(DateTime::now());
        metadata.updated_at = Some(DateTime::now());

        let result = self
            .inner
            .insert_one(item)
            .await
            .map_err(|e| FleetError::Database(format!("Insert failed: {}", e)))?;

        result
            .inserted_id
            .as_object_id()
            .ok_or_else(|| FleetError::Database("Failed to get inserted ID".into()))
    }

    /// Find one live document by filter
    pub async fn find_one(&self, filter: Document) -> Result<Option<T>, FleetError> {
        self.inner
            .find_one(not_deleted(filter))
            .await
            .map_err(|e| FleetError::Database(format!("Find failed: {}", e)))
    }

    /// Find many live documents by filter
    pub async fn find_many(&self, filter: Document) -> Result<Vec<T>, FleetError> {
        let cursor = self
            .inner
            .find(not_deleted(filter))
            .await
            .map_err(|e| FleetError::Database(format!("Find failed: {}", e)))?;

        let results: Vec<T> = cursor
            .filter_map(|doc| async {
                match doc {
                    Ok(d) => Some(d),
                    Err(e) => {
                        error!("Error reading document: {}", e);
                        None
                    }
                }
            })
            .collect()
            .await;

        Ok(results)
    }

    /// Update one live document
    pub async fn update_one(
        &self,
        filter: Document,
        update: impl Into<UpdateModifications>,
    ) -> Result<UpdateResult, FleetError> {
        self.inner
            .update_one(not_deleted(filter), update.into())
            .await
            .map_err(|e| FleetError::Database(format!("Update failed: {}", e)))
    }

    /// Soft delete a document
    pub async fn soft_delete(&self, filter: Document) -> Result<UpdateResult, FleetError> {
        let update = doc! {
            "$set": {
                "metadata.is_deleted": true,
                "metadata.deleted_at": DateTime::now(),
                "metadata.updated_at": DateTime::now(),
            }
        };

        self.update_one(filter, update).await
    }
}

/// Hide the password of a `user:pass@` connection string for logging
pub fn redact(uri: &str) -> String {
    let Some(scheme_end) = uri.find("://") else {
        return uri.to_string();
    };
    let rest = &uri[scheme_end + 3..];
    let Some(at) = rest.find('@') else {
        return uri.to_string();
    };
    let credentials = &rest[..at];
    match credentials.find(':') {
        Some(colon) => format!(
            "{}{}:****{}",
            &uri[..scheme_end + 3],
            &credentials[..colon],
            &rest[at..]
        ),
        None => uri.to_string(),
    }
}
