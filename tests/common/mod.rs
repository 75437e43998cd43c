//! Scripted in-memory fleet for integration tests
//!
//! `FakeFleet` implements the pool's `Connector` seam and answers the admin
//! commands the coordinators issue, keeping one replica-set config, a
//! primary, and the remote users in shared state.

#![allow(dead_code)]

use async_trait::async_trait;
use bson::{doc, oid::ObjectId, Bson, Document};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use mongo_fleet::db::schemas::{ReplicaSetDoc, ServerDoc, UserDoc};
use mongo_fleet::pool::{command_name, CommandRunner, Connector, PoolConfig};
use mongo_fleet::store::{EntityStore, MemoryStore};
use mongo_fleet::{ClientPool, FleetError, ProvisioningAllocator, Result, TopologyOrchestrator};

#[derive(Default)]
struct FleetState {
    config: Option<Document>,
    primary: Option<String>,
    /// (authdb, name) -> roles
    users: BTreeMap<(String, String), Vec<Bson>>,
    dropped_databases: Vec<String>,
    unreachable: HashSet<String>,
    failing: HashSet<String>,
    log: Vec<(String, String, Document)>,
}

/// Commands a secondary refuses
const WRITE_COMMANDS: &[&str] = &[
    "createUser",
    "updateUser",
    "dropUser",
    "grantRolesToUser",
    "revokeRolesFromUser",
    "dropAllUsersFromDatabase",
    "dropDatabase",
    "convertToCapped",
    "createIndexes",
    "dropIndexes",
];

#[derive(Default)]
pub struct FakeFleet {
    state: Mutex<FleetState>,
    connects: AtomicUsize,
}

impl FakeFleet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start as an initiated replica set with `hosts[primary]` as primary
    pub fn bootstrap(&self, name: &str, hosts: &[String], primary: usize) {
        let members: Vec<Bson> = hosts
            .iter()
            .enumerate()
            .map(|(i, host)| Bson::Document(doc! { "_id": i as i32, "host": host }))
            .collect();
        let mut state = self.state.lock().unwrap();
        state.config = Some(doc! { "_id": name, "version": 1, "members": members });
        state.primary = hosts.get(primary).cloned();
    }

    pub fn set_unreachable(&self, address: &str) {
        self.state.lock().unwrap().unreachable.insert(address.to_string());
    }

    pub fn set_primary(&self, address: Option<&str>) {
        self.state.lock().unwrap().primary = address.map(str::to_string);
    }

    /// Make every future `name` command fail
    pub fn fail_command(&self, name: &str) {
        self.state.lock().unwrap().failing.insert(name.to_string());
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn config_version(&self) -> Option<i64> {
        let state = self.state.lock().unwrap();
        let config = state.config.as_ref()?;
        match config.get("version")? {
            Bson::Int32(v) => Some(i64::from(*v)),
            Bson::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn member_hosts(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let Some(config) = state.config.as_ref() else {
            return Vec::new();
        };
        config
            .get_array("members")
            .map(|members| {
                members
                    .iter()
                    .filter_map(Bson::as_document)
                    .filter_map(|m| m.get_str("host").ok().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn member(&self, host: &str) -> Option<Document> {
        let state = self.state.lock().unwrap();
        state
            .config
            .as_ref()?
            .get_array("members")
            .ok()?
            .iter()
            .filter_map(Bson::as_document)
            .find(|m| m.get_str("host").ok() == Some(host))
            .cloned()
    }

    pub fn has_user(&self, authdb: &str, name: &str) -> bool {
        let state = self.state.lock().unwrap();
        state.users.contains_key(&(authdb.to_string(), name.to_string()))
    }

    pub fn user_count(&self) -> usize {
        self.state.lock().unwrap().users.len()
    }

    pub fn user_roles(&self, authdb: &str, name: &str) -> Vec<Bson> {
        let state = self.state.lock().unwrap();
        state
            .users
            .get(&(authdb.to_string(), name.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn dropped_databases(&self) -> Vec<String> {
        self.state.lock().unwrap().dropped_databases.clone()
    }

    /// How many times a command ran (failed attempts included)
    pub fn command_count(&self, name: &str) -> usize {
        let state = self.state.lock().unwrap();
        state
            .log
            .iter()
            .filter(|(_, _, cmd)| command_name(cmd) == name)
            .count()
    }

    /// Addresses a command was sent to, in order
    pub fn command_targets(&self, name: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .log
            .iter()
            .filter(|(_, _, cmd)| command_name(cmd) == name)
            .map(|(address, _, _)| address.clone())
            .collect()
    }

    fn execute(&self, address: &str, db: &str, command: Document) -> Result<Document> {
        let mut state = self.state.lock().unwrap();
        state.log.push((address.to_string(), db.to_string(), command.clone()));

        let name = command_name(&command).to_string();
        if state.unreachable.contains(address) {
            return Err(FleetError::remote(&name, "connection reset"));
        }
        if state.failing.contains(&name) {
            return Err(FleetError::remote(&name, "injected failure"));
        }
        if WRITE_COMMANDS.contains(&name.as_str()) && state.primary.as_deref() != Some(address) {
            return Err(FleetError::remote(&name, "NotWritablePrimary"));
        }

        match name.as_str() {
            "ping" => Ok(doc! { "ok": 1 }),
            "hello" => {
                let mut reply = doc! {
                    "me": address,
                    "isWritablePrimary": state.primary.as_deref() == Some(address),
                    "ok": 1,
                };
                if let Some(primary) = &state.primary {
                    reply.insert("primary", primary.clone());
                }
                Ok(reply)
            }
            "replSetGetConfig" => match &state.config {
                Some(config) => Ok(doc! { "config": config.clone(), "ok": 1 }),
                None => Err(not_initialized(&name)),
            },
            "replSetGetStatus" => {
                let Some(config) = &state.config else {
                    return Err(not_initialized(&name));
                };
                let members: Vec<Bson> = config
                    .get_array("members")
                    .map(|members| members.iter().filter_map(Bson::as_document).cloned().collect())
                    .unwrap_or_else(|_| Vec::<Document>::new())
                    .into_iter()
                    .map(|m| {
                        let host = m.get_str("host").unwrap_or_default().to_string();
                        let state_str = if state.primary.as_deref() == Some(host.as_str()) {
                            "PRIMARY"
                        } else {
                            "SECONDARY"
                        };
                        Bson::Document(doc! { "name": host, "stateStr": state_str })
                    })
                    .collect();
                Ok(doc! { "set": config.get_str("_id").unwrap_or_default(), "members": members, "ok": 1 })
            }
            "replSetInitiate" => {
                if state.config.is_some() {
                    return Err(FleetError::remote(&name, "already initialized"));
                }
                let config = command
                    .get_document("replSetInitiate")
                    .map_err(|_| FleetError::remote(&name, "missing config"))?
                    .clone();
                state.config = Some(config);
                state.primary = Some(address.to_string());
                Ok(doc! { "ok": 1 })
            }
            "replSetReconfig" => {
                if state.primary.as_deref() != Some(address) {
                    return Err(FleetError::remote(&name, "NotWritablePrimary"));
                }
                let config = command
                    .get_document("replSetReconfig")
                    .map_err(|_| FleetError::remote(&name, "missing config"))?
                    .clone();
                let current = state
                    .config
                    .as_ref()
                    .and_then(|c| c.get_i32("version").ok())
                    .unwrap_or(0);
                let next = config.get_i32("version").unwrap_or(0);
                if next <= current {
                    return Err(FleetError::remote(&name, "version must increase"));
                }
                state.config = Some(config);
                Ok(doc! { "ok": 1 })
            }
            "replSetStepDown" => {
                if state.primary.as_deref() != Some(address) {
                    return Err(FleetError::remote(&name, "NotWritablePrimary"));
                }
                state.primary = None;
                Ok(doc! { "ok": 1 })
            }
            "createUser" => {
                let user = command.get_str("createUser").unwrap_or_default().to_string();
                let key = (db.to_string(), user);
                if state.users.contains_key(&key) {
                    return Err(FleetError::remote(&name, "user already exists"));
                }
                let roles = command.get_array("roles").cloned().unwrap_or_default();
                state.users.insert(key, roles);
                Ok(doc! { "ok": 1 })
            }
            "updateUser" => {
                let user = command.get_str("updateUser").unwrap_or_default().to_string();
                let key = (db.to_string(), user);
                if !state.users.contains_key(&key) {
                    return Err(FleetError::remote(&name, "UserNotFound"));
                }
                let roles = command.get_array("roles").cloned().unwrap_or_default();
                state.users.insert(key, roles);
                Ok(doc! { "ok": 1 })
            }
            "dropUser" => {
                let user = command.get_str("dropUser").unwrap_or_default().to_string();
                match state.users.remove(&(db.to_string(), user)) {
                    Some(_) => Ok(doc! { "ok": 1 }),
                    None => Err(FleetError::remote(&name, "UserNotFound")),
                }
            }
            "usersInfo" => {
                let (user, authdb) = match command.get("usersInfo") {
                    Some(Bson::Document(d)) => (
                        d.get_str("user").unwrap_or_default().to_string(),
                        d.get_str("db").unwrap_or(db).to_string(),
                    ),
                    Some(Bson::String(user)) => (user.clone(), db.to_string()),
                    _ => (String::new(), db.to_string()),
                };
                let users: Vec<Bson> = state
                    .users
                    .get(&(authdb.clone(), user.clone()))
                    .map(|roles| vec![Bson::Document(doc! { "user": user, "db": authdb, "roles": roles.clone() })])
                    .unwrap_or_default();
                Ok(doc! { "users": users, "ok": 1 })
            }
            "grantRolesToUser" | "revokeRolesFromUser" => {
                let user = command.get_str(&name).unwrap_or_default().to_string();
                let key = (db.to_string(), user);
                let changes = command.get_array("roles").cloned().unwrap_or_default();
                let Some(roles) = state.users.get_mut(&key) else {
                    return Err(FleetError::remote(&name, "UserNotFound"));
                };
                if name == "grantRolesToUser" {
                    for role in changes {
                        if !roles.contains(&role) {
                            roles.push(role);
                        }
                    }
                } else {
                    roles.retain(|r| !changes.contains(r));
                }
                Ok(doc! { "ok": 1 })
            }
            "dropAllUsersFromDatabase" => {
                let before = state.users.len();
                state.users.retain(|(authdb, _), _| authdb != db);
                Ok(doc! { "n": (before - state.users.len()) as i32, "ok": 1 })
            }
            "dropDatabase" => {
                state.dropped_databases.push(db.to_string());
                Ok(doc! { "ok": 1 })
            }
            _ => Ok(doc! { "ok": 1 }),
        }
    }
}

fn not_initialized(command: &str) -> FleetError {
    FleetError::remote(
        command,
        "Command failed with error 94 (NotYetInitialized): 'no replset config has been received'",
    )
}

struct FakeMember {
    fleet: Arc<FakeFleet>,
    address: String,
}

#[async_trait]
impl CommandRunner for FakeMember {
    async fn run_command(&self, db: &str, command: Document) -> Result<Document> {
        tokio::task::yield_now().await;
        self.fleet.execute(&self.address, db, command)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Connector handing out members of a shared `FakeFleet`
pub struct FakeConnector(pub Arc<FakeFleet>);

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, server: &ServerDoc, _uri: &str) -> Result<Arc<dyn CommandRunner>> {
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let address = server.address();
        if self.0.state.lock().unwrap().unreachable.contains(&address) {
            return Err(FleetError::remote("connect", "connection refused"));
        }
        Ok(Arc::new(FakeMember {
            fleet: self.0.clone(),
            address,
        }))
    }
}

/// A store, a fake fleet, and the coordinators wired over them
pub struct Fixture<S: EntityStore> {
    pub store: Arc<S>,
    pub fleet: Arc<FakeFleet>,
    pub pool: Arc<ClientPool>,
    pub topology: Arc<TopologyOrchestrator<S>>,
    pub allocator: ProvisioningAllocator<S>,
    pub root: ObjectId,
    pub servers: Vec<ServerDoc>,
    pub replica_set: ReplicaSetDoc,
}

impl<S: EntityStore> Fixture<S> {
    pub fn replica_set_id(&self) -> ObjectId {
        self.replica_set._id.unwrap()
    }

    pub fn server_id(&self, index: usize) -> ObjectId {
        self.servers[index]._id.unwrap()
    }

    pub fn address(&self, index: usize) -> String {
        self.servers[index].address()
    }

    /// Record a server that is not yet a member of anything
    pub async fn spare_server(&self, name: &str) -> ServerDoc {
        self.store
            .create(
                ServerDoc::new(name, format!("{}.internal", name), 27017, "us-east-1")
                    .with_root(self.root),
            )
            .await
            .unwrap()
    }
}

pub fn address_of(index: usize) -> String {
    format!("db-{}.internal:27017", index)
}

/// `members` servers in one replica set tagged `zone`, initiated on the
/// fake fleet with member `primary` as primary
pub async fn fixture_with<S: EntityStore>(store: S, zone: &str, members: usize, primary: usize) -> Fixture<S> {
    let store = Arc::new(store);
    let fleet = FakeFleet::new();

    let root = store
        .create(UserDoc::new("admin", "password", vec!["root".into()]))
        .await
        .unwrap();
    let root_id = root._id.unwrap();

    let mut servers = Vec::new();
    for i in 0..members {
        let server = store
            .create(ServerDoc::new(format!("db-{}", i), format!("db-{}.internal", i), 27017, zone).with_root(root_id))
            .await
            .unwrap();
        servers.push(server);
    }

    let replica_set = store
        .create(
            ReplicaSetDoc::new("rs1")
                .with_zone(zone)
                .with_servers(servers.iter().map(|s| s._id.unwrap()).collect()),
        )
        .await
        .unwrap();
    let replica_set_id = replica_set._id.unwrap();

    for server in &mut servers {
        *server = store
            .update::<ServerDoc>(&server._id.unwrap(), doc! { "$set": { "replica_set": replica_set_id } })
            .await
            .unwrap();
    }

    let hosts: Vec<String> = (0..members).map(address_of).collect();
    fleet.bootstrap("rs1", &hosts, primary);

    let pool = Arc::new(ClientPool::new(
        Arc::new(FakeConnector(fleet.clone())),
        PoolConfig::default(),
    ));
    let topology = Arc::new(TopologyOrchestrator::new(store.clone(), pool.clone()));
    let allocator = ProvisioningAllocator::new(store.clone(), topology.clone());

    Fixture {
        store,
        fleet,
        pool,
        topology,
        allocator,
        root: root_id,
        servers,
        replica_set,
    }
}

/// Three-member `rs1` in `us-east-1` with member 1 as primary
pub async fn fixture() -> Fixture<MemoryStore> {
    fixture_with(MemoryStore::new(), "us-east-1", 3, 1).await
}
