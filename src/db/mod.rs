//! Entity-store persistence layer
//!
//! MongoDB wrapper plus the document schemas for fleet records.

pub mod mongo;
pub mod schemas;

pub use mongo::{redact, IntoIndexes, MongoClient, MongoCollection, MutMetadata};
