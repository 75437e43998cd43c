//! mongo-fleet - control plane for a multi-tenant MongoDB fleet
//!
//! Three coordinators sit over an entity store and a pool of live
//! connections:
//!
//! - [`pool::ClientPool`]: one client per fleet server, single-flight
//!   connects, idle eviction by a cancellable reaper
//! - [`topology::TopologyOrchestrator`]: primary discovery and versioned
//!   replica-set reconfiguration
//! - [`provision::ProvisioningAllocator`]: tenant database/user allocation
//!   with compensating rollback
//!
//! Durable records go through [`store::EntityStore`], backed by MongoDB in
//! production and by [`store::MemoryStore`] in dev mode and tests.

pub mod admin;
pub mod config;
pub mod db;
pub mod pool;
pub mod provision;
pub mod seed;
pub mod store;
pub mod topology;
pub mod types;

pub use config::Args;
pub use pool::{ClientHandle, ClientPool, CommandRunner, Connector, MongoConnector, PoolConfig};
pub use provision::{ConnectionPack, ProvisioningAllocator};
pub use store::{EntityStore, MemoryStore, MongoStore};
pub use topology::{MemberOptions, ProbeConfig, ReplicaSetState, TopologyOrchestrator};
pub use types::{FleetError, Result};
