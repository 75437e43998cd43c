//! MongoDB-backed entity store

use async_trait::async_trait;
use bson::{doc, oid::ObjectId, Document};
use tracing::info;

use super::{with_updated_at, Entity, EntityStore};
use crate::db::schemas::{DatabaseDoc, ProvisionDoc, ReplicaSetDoc, ServerDoc, UserDoc};
use crate::db::{MongoClient, MongoCollection};
use crate::types::{FleetError, Result};

/// Entity store persisted in the control plane's own MongoDB database
#[derive(Clone)]
pub struct MongoStore {
    mongo: MongoClient,
}

impl MongoStore {
    /// Wrap a connected client and apply every schema's indexes
    pub async fn new(mongo: MongoClient) -> Result<Self> {
        mongo.ensure_indexes::<ServerDoc>(ServerDoc::COLLECTION).await?;
        mongo.ensure_indexes::<ReplicaSetDoc>(ReplicaSetDoc::COLLECTION).await?;
        mongo.ensure_indexes::<DatabaseDoc>(DatabaseDoc::COLLECTION).await?;
        mongo.ensure_indexes::<UserDoc>(UserDoc::COLLECTION).await?;
        mongo.ensure_indexes::<ProvisionDoc>(ProvisionDoc::COLLECTION).await?;

        info!("Entity store ready on database '{}'", mongo.db_name());
        Ok(Self { mongo })
    }

    fn collection<T: Entity>(&self) -> MongoCollection<T> {
        self.mongo.collection::<T>(T::COLLECTION)
    }
}

#[async_trait]
impl EntityStore for MongoStore {
    async fn resolve<T: Entity>(&self, id: &ObjectId) -> Result<T> {
        self.collection::<T>()
            .find_one(doc! { "_id": id })
            .await?
            .ok_or_else(|| FleetError::not_found(T::KIND, id))
    }

    async fn create<T: Entity>(&self, mut item: T) -> Result<T> {
        let id = self.collection::<T>().insert_one(item.clone()).await?;
        item.set_id(id);
        Ok(item)
    }

    async fn update<T: Entity>(&self, id: &ObjectId, patch: Document) -> Result<T> {
        let result = self
            .collection::<T>()
            .update_one(doc! { "_id": id }, with_updated_at(patch))
            .await?;

        if result.matched_count == 0 {
            return Err(FleetError::not_found(T::KIND, id));
        }

        self.resolve::<T>(id).await
    }

    async fn remove<T: Entity>(&self, id: &ObjectId) -> Result<ObjectId> {
        let result = self.collection::<T>().soft_delete(doc! { "_id": id }).await?;

        if result.matched_count == 0 {
            return Err(FleetError::not_found(T::KIND, id));
        }

        Ok(*id)
    }

    async fn find<T: Entity>(&self, filter: Document) -> Result<Vec<T>> {
        self.collection::<T>().find_many(filter).await
    }
}
