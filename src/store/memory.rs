//! In-process entity store
//!
//! Keeps records as BSON documents per collection and interprets the same
//! update operators and equality filters the MongoDB store receives. Used by
//! dev mode and the test suites.

use async_trait::async_trait;
use bson::{oid::ObjectId, Bson, DateTime, Document};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{with_updated_at, Entity, EntityStore};
use crate::types::{FleetError, Result};

type Collection = BTreeMap<ObjectId, Document>;

/// Entity store held entirely in memory
#[derive(Clone, Default)]
pub struct MemoryStore {
    collections: Arc<RwLock<HashMap<&'static str, Collection>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live records in a collection
    pub async fn count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map(|c| c.values().filter(|d| is_live(d)).count())
            .unwrap_or(0)
    }
}

fn is_live(doc: &Document) -> bool {
    !matches!(
        doc.get_document("metadata").and_then(|m| m.get_bool("is_deleted")),
        Ok(true)
    )
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn resolve<T: Entity>(&self, id: &ObjectId) -> Result<T> {
        let collections = self.collections.read().await;
        let doc = collections
            .get(T::COLLECTION)
            .and_then(|c| c.get(id))
            .filter(|d| is_live(d))
            .ok_or_else(|| FleetError::not_found(T::KIND, id))?;
        Ok(bson::from_document(doc.clone())?)
    }

    async fn create<T: Entity>(&self, mut item: T) -> Result<T> {
        let id = ObjectId::new();
        item.set_id(id);
        let metadata = item.mut_metadata();
        let now = DateTime::now();
        metadata.is_deleted = false;
        metadata.deleted_at = None;
        metadata.created_at = Some(now);
        metadata.updated_at = Some(now);

        let doc = bson::to_document(&item)?;
        self.collections
            .write()
            .await
            .entry(T::COLLECTION)
            .or_default()
            .insert(id, doc);
        Ok(item)
    }

    async fn update<T: Entity>(&self, id: &ObjectId, patch: Document) -> Result<T> {
        let mut collections = self.collections.write().await;
        let stored = collections
            .get_mut(T::COLLECTION)
            .and_then(|c| c.get_mut(id))
            .filter(|d| is_live(d))
            .ok_or_else(|| FleetError::not_found(T::KIND, id))?;

        let mut patched = stored.clone();
        apply_update(&mut patched, &with_updated_at(patch))?;
        // Reject patches that no longer fit the schema before committing them
        let item: T = bson::from_document(patched.clone())?;
        *stored = patched;
        Ok(item)
    }

    async fn remove<T: Entity>(&self, id: &ObjectId) -> Result<ObjectId> {
        let mut collections = self.collections.write().await;
        let stored = collections
            .get_mut(T::COLLECTION)
            .and_then(|c| c.get_mut(id))
            .filter(|d| is_live(d))
            .ok_or_else(|| FleetError::not_found(T::KIND, id))?;

        let now = DateTime::now();
        let mut metadata = stored
            .get_document("metadata")
            .cloned()
            .unwrap_or_default();
        metadata.insert("is_deleted", true);
        metadata.insert("deleted_at", now);
        metadata.insert("updated_at", now);
        stored.insert("metadata", metadata);
        Ok(*id)
    }

    async fn find<T: Entity>(&self, filter: Document) -> Result<Vec<T>> {
        let collections = self.collections.read().await;
        let Some(collection) = collections.get(T::COLLECTION) else {
            return Ok(Vec::new());
        };

        collection
            .values()
            .filter(|d| is_live(d) && matches_filter(d, &filter))
            .map(|d| bson::from_document(d.clone()).map_err(FleetError::from))
            .collect()
    }
}

/// Apply a MongoDB-style update document in place
pub fn apply_update(doc: &mut Document, update: &Document) -> Result<()> {
    for (op, fields) in update {
        let fields = fields
            .as_document()
            .ok_or_else(|| FleetError::Validation(format!("{} expects a document", op)))?;

        match op.as_str() {
            "$set" => {
                for (path, value) in fields {
                    set_path(doc, path, value.clone());
                }
            }
            "$unset" => {
                for path in fields.keys() {
                    unset_path(doc, path);
                }
            }
            "$addToSet" => {
                for (key, value) in fields {
                    let values = match value {
                        Bson::Document(d) if d.contains_key("$each") => d
                            .get_array("$each")
                            .map_err(|_| FleetError::Validation("$each expects an array".into()))?
                            .clone(),
                        other => vec![other.clone()],
                    };
                    let array = array_field(doc, key)?;
                    for value in values {
                        if !array.contains(&value) {
                            array.push(value);
                        }
                    }
                }
            }
            "$pull" => {
                for (key, value) in fields {
                    let values = match value {
                        Bson::Document(d) if d.contains_key("$in") => d
                            .get_array("$in")
                            .map_err(|_| FleetError::Validation("$in expects an array".into()))?
                            .clone(),
                        other => vec![other.clone()],
                    };
                    let array = array_field(doc, key)?;
                    array.retain(|v| !values.contains(v));
                }
            }
            other => {
                return Err(FleetError::Validation(format!(
                    "unsupported update operator {}",
                    other
                )))
            }
        }
    }
    Ok(())
}

fn set_path(doc: &mut Document, path: &str, value: Bson) {
    match path.split_once('.') {
        Some((head, rest)) => {
            if !matches!(doc.get(head), Some(Bson::Document(_))) {
                doc.insert(head, Document::new());
            }
            if let Ok(child) = doc.get_document_mut(head) {
                set_path(child, rest, value);
            }
        }
        None => {
            doc.insert(path, value);
        }
    }
}

fn unset_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        Some((head, rest)) => {
            if let Ok(child) = doc.get_document_mut(head) {
                unset_path(child, rest);
            }
        }
        None => {
            doc.remove(path);
        }
    }
}

fn array_field<'a>(doc: &'a mut Document, key: &str) -> Result<&'a mut Vec<Bson>> {
    if key.contains('.') {
        return Err(FleetError::Validation(format!(
            "array operators on nested field {} are not supported",
            key
        )));
    }
    if !doc.contains_key(key) || matches!(doc.get(key), Some(Bson::Null)) {
        doc.insert(key, Bson::Array(Vec::new()));
    }
    doc.get_array_mut(key)
        .map_err(|_| FleetError::Validation(format!("field {} is not an array", key)))
}

fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    match path.split_once('.') {
        Some((head, rest)) => match doc.get(head) {
            Some(Bson::Document(child)) => get_path(child, rest),
            _ => None,
        },
        None => doc.get(path),
    }
}

/// Equality filter with `$ne`, `$in` and `$exists`; arrays match any element
pub fn matches_filter(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(path, expected)| {
        let actual = get_path(doc, path);
        match expected {
            Bson::Document(ops) if ops.keys().all(|k| k.starts_with('$')) && !ops.is_empty() => {
                ops.iter().all(|(op, operand)| match op.as_str() {
                    "$ne" => !value_matches(actual, operand),
                    "$in" => operand
                        .as_array()
                        .map(|candidates| candidates.iter().any(|c| value_matches(actual, c)))
                        .unwrap_or(false),
                    "$exists" => {
                        let present = !matches!(actual, None | Some(Bson::Null));
                        operand.as_bool().unwrap_or(true) == present
                    }
                    _ => false,
                })
            }
            _ => value_matches(actual, expected),
        }
    })
}

fn value_matches(actual: Option<&Bson>, expected: &Bson) -> bool {
    match (actual, expected) {
        (None, Bson::Null) | (Some(Bson::Null), Bson::Null) => true,
        (Some(Bson::Array(items)), e) if !matches!(e, Bson::Array(_)) => items.contains(e),
        (Some(a), e) => numeric_eq(a, e).unwrap_or(a == e),
        (None, _) => false,
    }
}

// BSON keeps i32 and i64 apart; equality filters should not
fn numeric_eq(a: &Bson, b: &Bson) -> Option<bool> {
    let as_i64 = |v: &Bson| match v {
        Bson::Int32(n) => Some(*n as i64),
        Bson::Int64(n) => Some(*n),
        _ => None,
    };
    Some(as_i64(a)? == as_i64(b)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schemas::{ReplicaSetDoc, ServerDoc};
    use bson::doc;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_set_and_unset_paths() {
        let mut doc = doc! { "name": "a", "metadata": { "is_deleted": false } };
        apply_update(
            &mut doc,
            &doc! {
                "$set": { "enabled": true, "metadata.updated_at": 5 },
                "$unset": { "name": "" },
            },
        )
        .unwrap();

        assert!(doc.get_bool("enabled").unwrap());
        assert_eq!(doc.get_document("metadata").unwrap().get_i32("updated_at").unwrap(), 5);
        assert!(!doc.contains_key("name"));
    }

    #[test]
    fn test_add_to_set_and_pull() {
        let a = ObjectId::new();
        let b = ObjectId::new();
        let mut doc = doc! { "servers": [a] };

        apply_update(&mut doc, &doc! { "$addToSet": { "servers": a } }).unwrap();
        assert_eq!(doc.get_array("servers").unwrap().len(), 1);

        apply_update(&mut doc, &doc! { "$addToSet": { "servers": { "$each": [a, b] } } }).unwrap();
        assert_eq!(doc.get_array("servers").unwrap().len(), 2);

        apply_update(&mut doc, &doc! { "$pull": { "servers": a } }).unwrap();
        assert_eq!(doc.get_array("servers").unwrap(), &vec![Bson::ObjectId(b)]);

        apply_update(&mut doc, &doc! { "$addToSet": { "users": a } }).unwrap();
        assert_eq!(doc.get_array("users").unwrap().len(), 1);

        let mut roles = doc! { "roles": ["read", "readWrite", "dbAdmin"] };
        apply_update(&mut roles, &doc! { "$pull": { "roles": { "$in": ["read", "dbAdmin"] } } }).unwrap();
        assert_eq!(roles.get_array("roles").unwrap(), &vec![Bson::String("readWrite".into())]);
    }

    #[test]
    fn test_unsupported_operator() {
        let mut doc = doc! {};
        let err = apply_update(&mut doc, &doc! { "$inc": { "n": 1 } }).unwrap_err();
        assert!(matches!(err, FleetError::Validation(_)));
    }

    #[test]
    fn test_filter_semantics() {
        let id = ObjectId::new();
        let doc = doc! {
            "zone": "us-east-1",
            "port": 27017_i64,
            "servers": [id],
            "metadata": { "is_deleted": false },
        };

        assert!(matches_filter(&doc, &doc! {}));
        assert!(matches_filter(&doc, &doc! { "zone": "us-east-1" }));
        assert!(!matches_filter(&doc, &doc! { "zone": "eu-west-1" }));
        assert!(matches_filter(&doc, &doc! { "port": 27017 }));
        assert!(matches_filter(&doc, &doc! { "servers": id }));
        assert!(matches_filter(&doc, &doc! { "metadata.is_deleted": false }));
        assert!(matches_filter(&doc, &doc! { "replica_set": Bson::Null }));
        assert!(matches_filter(&doc, &doc! { "zone": { "$ne": "eu-west-1" } }));
        assert!(matches_filter(&doc, &doc! { "zone": { "$in": ["eu", "us-east-1"] } }));
        assert!(matches_filter(&doc, &doc! { "replica_set": { "$exists": false } }));
    }

    #[tokio::test]
    async fn test_crud_with_soft_delete() {
        let store = MemoryStore::new();
        let server = assert_ok!(store.create(ServerDoc::new("a", "h", 27017, "z")).await);
        let id = server._id.unwrap();

        let found: ServerDoc = assert_ok!(store.resolve(&id).await);
        assert_eq!(found.name, "a");

        let updated: ServerDoc =
            assert_ok!(store.update(&id, doc! { "$set": { "enabled": false } }).await);
        assert!(!updated.enabled);

        assert_eq!(assert_ok!(store.remove::<ServerDoc>(&id).await), id);
        let err = assert_err!(store.resolve::<ServerDoc>(&id).await);
        assert!(err.is_not_found());
        assert!(store.find::<ServerDoc>(doc! {}).await.unwrap().is_empty());
        assert_eq!(store.count(ServerDoc::COLLECTION).await, 0);

        // Removing twice is a not-found, not a silent success
        assert!(store.remove::<ServerDoc>(&id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_update_rejects_schema_breaking_patch() {
        let store = MemoryStore::new();
        let rs = store.create(ReplicaSetDoc::new("rs1")).await.unwrap();
        let id = rs._id.unwrap();

        let result = store
            .update::<ReplicaSetDoc>(&id, doc! { "$set": { "servers": "not-a-list" } })
            .await;
        assert!(result.is_err());

        let unchanged: ReplicaSetDoc = store.resolve(&id).await.unwrap();
        assert!(unchanged.servers.is_empty());
    }

    #[tokio::test]
    async fn test_find_by_zone() {
        let store = MemoryStore::new();
        store.create(ReplicaSetDoc::new("rs1").with_zone("us-east-1")).await.unwrap();
        store.create(ReplicaSetDoc::new("rs2").with_zone("eu-west-1")).await.unwrap();

        let found: Vec<ReplicaSetDoc> = store.find(doc! { "zone": "eu-west-1" }).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "rs2");
    }
}
