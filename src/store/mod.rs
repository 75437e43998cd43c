//! Entity store
//!
//! The durable side of the control plane. Records are resolved, created,
//! patched, soft-deleted and queried through [`EntityStore`]; the pool,
//! orchestrator and allocator never hold durable state themselves.
//!
//! Patches are MongoDB update documents (`$set`, `$unset`, `$addToSet`,
//! `$pull`) so the same patch works against [`MongoStore`] and
//! [`MemoryStore`].

mod memory;
mod mongo;

pub use memory::{apply_update, matches_filter, MemoryStore};
pub use mongo::MongoStore;

use async_trait::async_trait;
use bson::{doc, oid::ObjectId, DateTime, Document};
use serde::{de::DeserializeOwned, Serialize};
use tracing::warn;

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::{DatabaseDoc, ReplicaSetDoc, ServerDoc, UserDoc};
use crate::types::{FleetError, Result};

/// A record type persisted in the entity store
pub trait Entity:
    Serialize + DeserializeOwned + Unpin + Send + Sync + Clone + MutMetadata + IntoIndexes + 'static
{
    /// Collection the records live in
    const COLLECTION: &'static str;
    /// Human-readable kind used in not-found errors
    const KIND: &'static str;

    fn id(&self) -> Option<ObjectId>;
    fn set_id(&mut self, id: ObjectId);
}

/// Collaborator contract for durable fleet records
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Fetch a live record by id, or `NotFound`
    async fn resolve<T: Entity>(&self, id: &ObjectId) -> Result<T>;

    /// Insert a record and return it with its new id
    async fn create<T: Entity>(&self, item: T) -> Result<T>;

    /// Apply an update document to a live record and return the result
    async fn update<T: Entity>(&self, id: &ObjectId, patch: Document) -> Result<T>;

    /// Soft-delete a live record
    async fn remove<T: Entity>(&self, id: &ObjectId) -> Result<ObjectId>;

    /// All live records matching an equality filter
    async fn find<T: Entity>(&self, filter: Document) -> Result<Vec<T>>;

    async fn find_one<T: Entity>(&self, filter: Document) -> Result<Option<T>> {
        Ok(self.find::<T>(filter).await?.into_iter().next())
    }
}

/// Parse a hex record id, rejecting malformed input before any I/O
pub fn parse_id(kind: &str, id: &str) -> Result<ObjectId> {
    ObjectId::parse_str(id.trim())
        .map_err(|_| FleetError::Validation(format!("invalid {} id '{}'", kind, id)))
}

/// Add `metadata.updated_at` to the `$set` stage of a patch
pub fn with_updated_at(mut patch: Document) -> Document {
    let now = DateTime::now();
    match patch.get_document_mut("$set") {
        Ok(set) => {
            set.insert("metadata.updated_at", now);
        }
        Err(_) => {
            patch.insert("$set", doc! { "metadata.updated_at": now });
        }
    }
    patch
}

/// Populate a server's root credential
pub async fn server_root<S>(store: &S, server: &ServerDoc) -> Result<Option<UserDoc>>
where
    S: EntityStore + ?Sized,
{
    match server.root {
        Some(id) => match store.resolve::<UserDoc>(&id).await {
            Ok(user) => Ok(Some(user)),
            Err(e) if e.is_not_found() => {
                warn!(server = %server.name, root = %id, "Root credential missing, connecting without auth");
                Ok(None)
            }
            Err(e) => Err(e),
        },
        None => Ok(None),
    }
}

/// Populate a replica set's member servers, keeping member order.
/// Dangling references are skipped.
pub async fn replica_set_members<S>(store: &S, replica_set: &ReplicaSetDoc) -> Result<Vec<ServerDoc>>
where
    S: EntityStore + ?Sized,
{
    let mut members = Vec::with_capacity(replica_set.servers.len());
    for id in &replica_set.servers {
        match store.resolve::<ServerDoc>(id).await {
            Ok(server) => members.push(server),
            Err(e) if e.is_not_found() => {
                warn!(replica_set = %replica_set.name, server = %id, "Skipping missing member");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(members)
}

/// Populate the server a database record lives on
pub async fn database_server<S>(store: &S, database: &DatabaseDoc) -> Result<ServerDoc>
where
    S: EntityStore + ?Sized,
{
    let id = database
        .server
        .ok_or_else(|| FleetError::not_found("server for database", &database.name))?;
    store.resolve::<ServerDoc>(&id).await
}
