//! Per-database maintenance commands
//!
//! Stats read from the recorded server. Anything that changes a collection
//! goes to the current primary of the database's replica set.

use bson::{doc, oid::ObjectId, Bson, Document};
use std::sync::Arc;
use tracing::info;

use crate::db::schemas::DatabaseDoc;
use crate::pool::ClientHandle;
use crate::store::{database_server, EntityStore};
use crate::topology::TopologyOrchestrator;
use crate::types::{FleetError, Result};

/// Collection names must be non-empty and free of `$` and NUL
pub fn validate_collection(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('$') || name.contains('\0') {
        return Err(FleetError::Validation(format!("invalid collection name '{}'", name)));
    }
    Ok(())
}

/// Default index name the way mongod derives one: `field_1_other_-1`
pub fn index_name(keys: &Document) -> String {
    keys.iter()
        .map(|(field, direction)| {
            let direction = match direction {
                Bson::Int32(v) => v.to_string(),
                Bson::Int64(v) => v.to_string(),
                Bson::Double(v) => v.to_string(),
                Bson::String(s) => s.clone(),
                other => other.to_string(),
            };
            format!("{}_{}", field, direction)
        })
        .collect::<Vec<_>>()
        .join("_")
}

pub struct DatabaseAdmin<S> {
    store: Arc<S>,
    topology: Arc<TopologyOrchestrator<S>>,
}

impl<S: EntityStore> DatabaseAdmin<S> {
    pub fn new(store: Arc<S>, topology: Arc<TopologyOrchestrator<S>>) -> Self {
        Self { store, topology }
    }

    async fn reader(&self, database_id: &ObjectId) -> Result<(DatabaseDoc, Arc<ClientHandle>)> {
        let database = self.store.resolve::<DatabaseDoc>(database_id).await?;
        let server = database_server(self.store.as_ref(), &database).await?;
        let client = self.topology.pool().client_for(self.store.as_ref(), &server).await?;
        Ok((database, client))
    }

    async fn writer(&self, database_id: &ObjectId) -> Result<(DatabaseDoc, Arc<ClientHandle>)> {
        let database = self.store.resolve::<DatabaseDoc>(database_id).await?;
        let primary = self.topology.database_primary(&database).await?;
        Ok((database, primary.client))
    }

    pub async fn db_stats(&self, database_id: &ObjectId) -> Result<Document> {
        let (database, client) = self.reader(database_id).await?;
        client.run_command(&database.name, doc! { "dbStats": 1 }).await
    }

    pub async fn coll_stats(&self, database_id: &ObjectId, collection: &str) -> Result<Document> {
        validate_collection(collection)?;
        let (database, client) = self.reader(database_id).await?;
        client
            .run_command(&database.name, doc! { "collStats": collection })
            .await
    }

    pub async fn convert_to_capped(&self, database_id: &ObjectId, collection: &str, size: i64) -> Result<Document> {
        validate_collection(collection)?;
        if size <= 0 {
            return Err(FleetError::Validation("capped size must be positive".into()));
        }

        let (database, client) = self.writer(database_id).await?;
        let reply = client
            .run_command(
                &database.name,
                doc! { "convertToCapped": collection, "size": size },
            )
            .await?;

        info!(database = %database.name, collection = %collection, size, "Collection capped");
        Ok(reply)
    }

    pub async fn create_index(
        &self,
        database_id: &ObjectId,
        collection: &str,
        keys: Document,
        name: Option<&str>,
        unique: bool,
    ) -> Result<Document> {
        validate_collection(collection)?;
        if keys.is_empty() {
            return Err(FleetError::Validation("index keys are required".into()));
        }

        let name = name.map(str::to_string).unwrap_or_else(|| index_name(&keys));
        let (database, client) = self.writer(database_id).await?;
        let reply = client
            .run_command(
                &database.name,
                doc! {
                    "createIndexes": collection,
                    "indexes": [{ "key": keys, "name": &name, "unique": unique }],
                },
            )
            .await?;

        info!(database = %database.name, collection = %collection, index = %name, "Index created");
        Ok(reply)
    }

    pub async fn drop_index(&self, database_id: &ObjectId, collection: &str, name: &str) -> Result<Document> {
        validate_collection(collection)?;
        let (database, client) = self.writer(database_id).await?;
        let reply = client
            .run_command(
                &database.name,
                doc! { "dropIndexes": collection, "index": name },
            )
            .await?;

        info!(database = %database.name, collection = %collection, index = %name, "Index dropped");
        Ok(reply)
    }
}
