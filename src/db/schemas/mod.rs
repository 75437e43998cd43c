//! Document schemas for the fleet
//!
//! Servers, replica sets, databases, users and provisions. References between
//! records are stored as ObjectIds, never embedded.

mod database;
mod metadata;
mod provision;
mod replica_set;
mod server;
mod user;

pub use database::{DatabaseDoc, DATABASE_COLLECTION};
pub use metadata::Metadata;
pub use provision::{ProvisionDoc, PROVISION_COLLECTION};
pub use replica_set::{ReplicaSetDoc, REPLICA_SET_COLLECTION};
pub use server::{ServerDoc, SERVER_COLLECTION};
pub use user::{is_builtin_role, UserDoc, BUILTIN_ROLES, USER_COLLECTION};
